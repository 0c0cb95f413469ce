//! Owning registry of discovered headsets.
//!
//! Discovery reports devices appearing and disappearing; the registry creates
//! one [`ProtocolClient`] per device id and disconnects it explicitly when
//! the device goes away or the application shuts down.

use crate::domain::models::{DeviceIdentity, LinkStatus};
use crate::infrastructure::bluetooth::client::{ClientConfig, ProtocolClient};
use crate::infrastructure::bluetooth::connection::RfcommConnector;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

/// Builds the connector used to reach a particular device
pub type ConnectorFactory = Arc<dyn Fn(&DeviceIdentity) -> Arc<dyn RfcommConnector> + Send + Sync>;

pub struct DeviceRegistry {
    connector_factory: ConnectorFactory,
    config: ClientConfig,
    clients: Mutex<HashMap<String, ProtocolClient>>,
}

impl DeviceRegistry {
    pub fn new(connector_factory: ConnectorFactory, config: ClientConfig) -> Self {
        Self {
            connector_factory,
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn lock_clients(&self) -> MutexGuard<'_, HashMap<String, ProtocolClient>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a discovered device. A device that is already known keeps
    /// its existing client. When the radio link is already up, a connection
    /// attempt starts in the background.
    pub fn on_device_added(&self, identity: DeviceIdentity, link: LinkStatus) -> ProtocolClient {
        let client = {
            let mut clients = self.lock_clients();
            if let Some(existing) = clients.get(&identity.id) {
                return existing.clone();
            }

            info!("Device added: {} ({})", identity.name, identity.id);
            let connector = (self.connector_factory)(&identity);
            let client = ProtocolClient::new(identity.clone(), connector, self.config.clone());
            clients.insert(identity.id, client.clone());
            client
        };

        if link == LinkStatus::Connected {
            client.handle_link_status(LinkStatus::Connected);
        }
        client
    }

    /// Forget a device and close its connection
    pub fn on_device_removed(&self, id: &str) -> bool {
        let removed = self.lock_clients().remove(id);
        match removed {
            Some(client) => {
                info!("Device removed: {}", id);
                client.disconnect();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<ProtocolClient> {
        self.lock_clients().get(id).cloned()
    }

    pub fn clients(&self) -> Vec<ProtocolClient> {
        self.lock_clients().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock_clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disconnect and drop every client
    pub fn shutdown(&self) {
        let clients: Vec<ProtocolClient> = self.lock_clients().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.disconnect();
        }
        info!("Device registry shut down");
    }
}

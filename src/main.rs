use anyhow::Context;
use clap::Parser;
use headset_control::domain::models::{format_address, parse_address, MessageSeverity};
use headset_control::domain::settings::{KnownDevice, SettingsService};
use headset_control::infrastructure::bluetooth::connection::{
    RfcommConnector, TcpBridgeConnector, TtyConnector,
};
use headset_control::infrastructure::bluetooth::registry::ConnectorFactory;
use headset_control::infrastructure::logging::init_logger;
use headset_control::{
    AncLevel, ClientConfig, DeviceIdentity, DeviceRegistry, DeviceSnapshot, LinkStatus, Message,
    ProtocolClient,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "headset-control", version, about = "Control a noise-cancelling headset over RFCOMM")]
struct Args {
    /// Bluetooth address of the headset (AA:BB:CC:DD:EE:FF)
    #[arg(long)]
    address: String,

    /// Display name used in logs and output
    #[arg(long, default_value = "Headphones")]
    name: String,

    /// RFCOMM TTY bound to the headset (e.g. /dev/rfcomm0)
    #[arg(long, conflicts_with = "bridge")]
    tty: Option<PathBuf>,

    /// TCP bridge forwarding the headset's serial channel (host:port)
    #[arg(long)]
    bridge: Option<String>,

    /// Noise cancellation level to apply: off, low, high (or 0, 1, 2)
    #[arg(long)]
    anc: Option<AncLevel>,

    /// Keep running and print device events until Ctrl-C
    #[arg(long)]
    watch: bool,

    /// Save this device and its TTY to the settings file
    #[arg(long)]
    remember: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn print_snapshot(snapshot: &DeviceSnapshot) {
    let anc = snapshot
        .anc_level
        .map(|level| level.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let battery = snapshot
        .battery_level
        .map(|level| format!("{}%", level))
        .unwrap_or_else(|| "unknown".to_string());

    println!(
        "{} [{}] status={:?} ack={} anc={} battery={}",
        snapshot.name,
        format_address(snapshot.address),
        snapshot.status,
        snapshot.soft_connected,
        anc,
        battery
    );
}

fn select_connector(
    args: &Args,
    settings: &SettingsService,
    address: u64,
) -> anyhow::Result<Arc<dyn RfcommConnector>> {
    if let Some(bridge) = &args.bridge {
        return Ok(Arc::new(TcpBridgeConnector::new(bridge.clone())));
    }

    let tty = args
        .tty
        .clone()
        .or_else(|| {
            settings
                .find_known_device(address)
                .and_then(|device| device.tty_path.clone())
                .map(PathBuf::from)
        })
        .context("No transport: pass --tty or --bridge, or remember a device with --tty")?;

    Ok(Arc::new(TtyConnector::new(tty)))
}

async fn wait_for_initial_status(
    client: &ProtocolClient,
    events: &mut tokio::sync::mpsc::UnboundedReceiver<Message>,
    limit: Duration,
) {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let snapshot = client.snapshot();
        if snapshot.soft_connected && snapshot.battery_level.is_some() && snapshot.anc_level.is_some() {
            return;
        }

        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(Message::Disconnect)) | Ok(None) | Err(_) => return,
            Ok(Some(_)) => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = SettingsService::new()?;
    let _logging_guard = init_logger(&settings.get().log_settings, args.verbose)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting headset control");

    let address = parse_address(&args.address)?;
    let identity = DeviceIdentity::new(format_address(address), args.name.clone(), address);

    if args.remember {
        settings.add_known_device(KnownDevice {
            id: identity.id.clone(),
            name: identity.name.clone(),
            address,
            tty_path: args.tty.as_ref().map(|p| p.display().to_string()),
        })?;
        info!("Saved device to {}", settings.path().display());
    }

    let connector = select_connector(&args, &settings, address)?;
    let factory: ConnectorFactory = Arc::new(move |_identity: &DeviceIdentity| connector.clone());
    let config = ClientConfig::from(&settings.get().protocol);
    let status_wait = config.poll_interval * 3 + config.debounce;
    let registry = DeviceRegistry::new(factory, config);

    let client = registry.on_device_added(identity, LinkStatus::Disconnected);
    let (_events_subscription, mut events) = client.subscribe_channel();

    let policy = settings.get().battery.policy();
    let alert_client = client.clone();
    let _battery_subscription = client.on_battery_update(move |update| {
        let Some(alert) = policy.evaluate(update.percentage, alert_client.low_battery_notified()) else {
            return;
        };
        match alert.severity {
            MessageSeverity::Error => error!(
                "{} has under {}% battery remaining",
                alert_client.identity().name,
                alert.threshold
            ),
            MessageSeverity::Warning => warn!(
                "{} has under {}% battery remaining",
                alert_client.identity().name,
                alert.threshold
            ),
        }
        alert_client.set_low_battery_notified(alert.threshold);
    });

    if let Err(e) = client.connect().await {
        registry.shutdown();
        return Err(e).context("Could not connect to the headset");
    }

    wait_for_initial_status(&client, &mut events, status_wait).await;

    if let Some(level) = args.anc {
        client.set_anc(level)?;
        info!("Requested ANC {}", level);
        // Give a deferred send time to leave and the headset time to answer
        tokio::time::sleep(status_wait).await;
    }

    print_snapshot(&client.snapshot());

    if args.watch {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
                message = events.recv() => match message {
                    Some(Message::Disconnect) | None => {
                        print_snapshot(&client.snapshot());
                        break;
                    }
                    Some(_) => print_snapshot(&client.snapshot()),
                },
            }
        }
    }

    registry.shutdown();
    Ok(())
}

pub mod battery;
pub mod device_state;
pub mod models;
pub mod settings;

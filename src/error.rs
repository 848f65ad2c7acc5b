use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the transports and transfer sessions
#[derive(Error, Debug)]
pub enum Error {
    #[error("device `{0}` not found")]
    DeviceNotFound(String),

    #[error("no Bluetooth adapter found")]
    NoAdapter,

    #[error("service {0} unavailable on device")]
    ServiceUnavailable(&'static str),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(uuid::Uuid),

    #[error("{0} is not supported over this transport")]
    Unsupported(&'static str),

    #[error("BLE event loop is not running")]
    LoopStopped,

    #[error("device disconnected")]
    Disconnected,

    #[error("BLE stack error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
}

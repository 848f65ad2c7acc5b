//! Client configuration.
//!
//! All fields have defaults matching the Leo firmware, so an empty TOML file
//! (or no file at all) yields a working setup.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Serial line speed
    pub baud_rate: u32,
    /// Seconds to wait for a matching command reply
    pub command_timeout: f64,
    /// Seconds spent scanning for wireless devices
    pub scan_timeout: f64,
    /// Advertised name prefix of the product family
    pub name_filter: String,
    /// Prefix the device prepends to its serial number when advertising
    pub usb_prefix: String,
    /// USB bridge chip named in the serial port description
    pub serial_description: String,
    /// Maximum transmission unit assumed for firmware packets
    pub mtu: usize,
    /// Per-packet ATT header overhead
    pub att_header: usize,
    /// Seconds to wait for a firmware ACK/NAK
    pub firmware_ack_timeout: f64,
    /// Inactivity and total bound of a streaming session, in seconds
    pub stream_timeout: f64,
    /// Seconds to let the device switch into block-receive mode
    pub block_settle: f64,
    /// Seconds to wait for each block transfer reply byte
    pub block_timeout: f64,
    /// Block transfer retries before giving up
    pub block_retries: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            baud_rate: 115_200,
            command_timeout: 2.0,
            scan_timeout: 3.0,
            name_filter: "Leo".into(),
            usb_prefix: "Leo USB ".into(),
            serial_description: "CP2103".into(),
            mtu: 256,
            att_header: 3,
            firmware_ack_timeout: 30.0,
            stream_timeout: 30.0,
            block_settle: 1.0,
            block_timeout: 1.0,
            block_retries: 16,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.command_timeout)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.scan_timeout)
    }

    pub fn firmware_ack_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.firmware_ack_timeout)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stream_timeout)
    }

    pub fn block_settle(&self) -> Duration {
        Duration::from_secs_f64(self.block_settle)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.block_timeout)
    }

    /// Firmware packet size: MTU minus the ATT header
    pub fn packet_size(&self) -> usize {
        self.mtu.saturating_sub(self.att_header).max(1)
    }
}

//! Host-side client for the Leo charge controller.
//!
//! [`device::Device`] offers the command set over any [`transport::Transport`]:
//! Bluetooth LE ([`transport_btleplug`]) or the USB serial bridge
//! ([`transport_serial`]).

pub mod bridge;
pub mod channel;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod firmware;
pub mod models;
pub mod resolver;
pub mod services;
pub mod streaming;
pub mod transport;
pub mod transport_btleplug;
pub mod transport_serial;
pub mod xmodem;

#[cfg(test)]
mod transport_mock;

pub use config::ClientConfig;
pub use device::Device;
pub use dispatch::Reply;
pub use error::{Error, Result};

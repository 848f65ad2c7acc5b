use std::path::Path;

use tracing::{info, warn};
use uuid::Uuid;

use crate::channel::ResponseChannel;
use crate::error::{Error, Result};

/// A device seen during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub address: String,
}

/// Addressable sub-channel of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// A GATT characteristic
    Characteristic(Uuid),
    /// The single implicit channel of a serial line
    SerialLine,
}

/// Leo transport interface
pub trait Transport: Send + Sync {
    /// Write `bytes` to `endpoint`, waiting for the link-level confirmation if `confirm` is set
    fn send(&self, endpoint: Endpoint, bytes: &[u8], confirm: bool) -> Result<()>;

    /// Endpoint the UART-like command channel writes to
    fn command_endpoint(&self) -> Endpoint;

    /// Queue the background reader fills with response lines
    fn responses(&self) -> &ResponseChannel;

    fn is_connected(&self) -> bool;

    /// Tear the connection down and join its background worker
    fn disconnect(&mut self);

    /// Send one command line terminated by CR LF
    fn send_command(&self, command: &str) -> Result<()> {
        let line = format!("{}\r\n", command.trim());
        self.send(self.command_endpoint(), line.as_bytes(), true)
    }

    /// Upload a file with the block transfer protocol
    fn upload(&self, _path: &Path) -> Result<bool> {
        Err(Error::Unsupported("block transfer"))
    }

    /// Retrieve a device file through the streaming service
    fn stream_to_file(&self, _path: &Path, _reference: u32) -> Result<bool> {
        Err(Error::Unsupported("file streaming"))
    }

    /// Run a firmware update with the given image
    fn firmware_update(&self, _image: &Path) -> Result<bool> {
        Err(Error::Unsupported("firmware update"))
    }
}

/// Discovers and connects Leo transports
pub trait TransportManager {
    type Transport: Transport;

    /// List the devices currently visible
    fn discover(&mut self) -> Result<Vec<Candidate>>;

    /// Connect to the device with the given identifier
    fn connect(&mut self, identifier: &str) -> Result<Self::Transport>;
}

/// Resolve a user supplied identifier against discovered candidates.
///
/// Tried in order: exact name, case-insensitive name, case-insensitive name
/// with `prefix` prepended, case-insensitive substring. First match wins.
pub fn resolve_candidate<'a>(candidates: &'a [Candidate], identifier: &str, prefix: &str) -> Option<&'a Candidate> {
    let identifier = identifier.trim();
    let lower = identifier.to_lowercase();
    let prefixed = format!("{}{}", prefix, identifier).to_lowercase();

    candidates
        .iter()
        .find(|c| c.name == identifier)
        .or_else(|| candidates.iter().find(|c| c.name.to_lowercase() == lower))
        .or_else(|| candidates.iter().find(|c| c.name.to_lowercase() == prefixed))
        .or_else(|| candidates.iter().find(|c| c.name.to_lowercase().contains(&lower)))
}

/// Resolve or report the miss together with what is visible
pub fn resolve_or_report<'a>(candidates: &'a [Candidate], identifier: &str, prefix: &str) -> Result<&'a Candidate> {
    match resolve_candidate(candidates, identifier, prefix) {
        Some(candidate) => Ok(candidate),
        None => {
            warn!("❌ {} not found", identifier);
            if candidates.is_empty() {
                info!("No devices visible, is the device powered and in range?");
            } else {
                let names: Vec<&str> = candidates.iter().map(|c| c.name.as_str()).collect();
                info!("Visible devices: {}", names.join(", "));
            }
            Err(Error::DeviceNotFound(identifier.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(names: &[&str]) -> Vec<Candidate> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| Candidate {
                name: name.to_string(),
                address: format!("00:00:00:00:00:{:02X}", i),
            })
            .collect()
    }

    #[test]
    fn test_exact_match_wins() {
        let list = candidates(&["Leo USB abc", "Leo USB ABC"]);
        let found = resolve_candidate(&list, "Leo USB ABC", "Leo USB ").unwrap();
        assert_eq!(found.name, "Leo USB ABC");
    }

    #[test]
    fn test_case_insensitive_match() {
        let list = candidates(&["Leo USB ABC123"]);
        let found = resolve_candidate(&list, "leo usb abc123", "Leo USB ").unwrap();
        assert_eq!(found.name, "Leo USB ABC123");
    }

    #[test]
    fn test_prefixed_match() {
        let list = candidates(&["Leo USB ABC123"]);
        let found = resolve_candidate(&list, "abc123", "Leo USB ").unwrap();
        assert_eq!(found.address, "00:00:00:00:00:00");
    }

    #[test]
    fn test_prefixed_beats_substring() {
        let list = candidates(&["Leo USB XABC1", "Leo USB ABC1"]);
        let found = resolve_candidate(&list, "abc1", "Leo USB ").unwrap();
        assert_eq!(found.name, "Leo USB ABC1");
    }

    #[test]
    fn test_substring_match() {
        let list = candidates(&["Leo USB O3HBOR0BO"]);
        let found = resolve_candidate(&list, "hbor", "Leo USB ").unwrap();
        assert_eq!(found.name, "Leo USB O3HBOR0BO");
    }

    #[test]
    fn test_not_found() {
        let list = candidates(&["Leo USB ABC123"]);
        assert!(resolve_candidate(&list, "XYZ", "Leo USB ").is_none());
        assert!(matches!(
            resolve_or_report(&list, "XYZ", "Leo USB "),
            Err(Error::DeviceNotFound(id)) if id == "XYZ"
        ));
    }
}

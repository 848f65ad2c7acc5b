//! XMODEM sender used for block transfers to the device.
//!
//! The algorithm only touches the link through [`BlockIo`], so the same
//! sender runs over the BLE UART (bytes queued by the notification handler)
//! and over the raw serial line.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Start of Header - 128 byte block
const SOH: u8 = 0x01;
/// End of Transmission
const EOT: u8 = 0x04;
/// Acknowledge
const ACK: u8 = 0x06;
/// Negative Acknowledge, also requests checksum mode
const NAK: u8 = 0x15;
/// Cancel
const CAN: u8 = 0x18;
/// Requests CRC16 mode
const CRC: u8 = 0x43;
/// End of File padding character
const PAD: u8 = 0x1A;

pub const BLOCK_SIZE: usize = 128;

/// The two primitives a transport provides for block transfers
pub trait BlockIo {
    /// Read exactly `size` bytes, `None` on timeout
    fn read_block(&mut self, size: usize, timeout: Duration) -> Option<Vec<u8>>;
    fn write_block(&mut self, data: &[u8]) -> Result<()>;
}

/// What the receiver answered to the last write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReply {
    Ack,
    Nak,
    Crc,
    Cancel,
    Timeout,
    Other(u8),
}

impl From<Option<u8>> for BlockReply {
    fn from(byte: Option<u8>) -> Self {
        match byte {
            Some(ACK) => BlockReply::Ack,
            Some(NAK) => BlockReply::Nak,
            Some(CRC) => BlockReply::Crc,
            Some(CAN) => BlockReply::Cancel,
            Some(other) => BlockReply::Other(other),
            None => BlockReply::Timeout,
        }
    }
}

/// CRC16 as used by XMODEM (poly 0x1021, init 0)
pub fn crc16_xmodem(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &b in bytes {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

pub struct Xmodem {
    /// Errors tolerated per phase before giving up
    retries: usize,
    timeout: Duration,
    crc_mode: bool,
}

impl Xmodem {
    pub fn new(retries: usize, timeout: Duration) -> Self {
        Xmodem {
            retries,
            timeout,
            crc_mode: true,
        }
    }

    fn reply<I: BlockIo>(&self, io: &mut I) -> BlockReply {
        let byte = io.read_block(1, self.timeout).and_then(|b| b.first().copied());
        BlockReply::from(byte)
    }

    /// Send everything `source` yields. `Ok(false)` when the receiver gave up
    /// or the retries ran out.
    pub fn send<I: BlockIo, R: Read>(&mut self, io: &mut I, source: &mut R) -> Result<bool> {
        if !self.wait_for_start(io) {
            return Ok(false);
        }
        debug!(crc = self.crc_mode, "receiver ready");

        let mut sequence: u8 = 1;
        let mut sent = 0usize;
        loop {
            let mut block = [PAD; BLOCK_SIZE];
            let n = read_full(source, &mut block)?;
            if n == 0 {
                break;
            }
            if !self.send_block(io, sequence, &block)? {
                self.abort(io);
                return Ok(false);
            }
            sent += n;
            debug!(sequence, sent, "block acknowledged");
            sequence = sequence.wrapping_add(1);
        }

        for _ in 0..=self.retries {
            io.write_block(&[EOT])?;
            match self.reply(io) {
                BlockReply::Ack => {
                    info!(bytes = sent, "transfer acknowledged");
                    return Ok(true);
                }
                other => warn!("expected ACK to EOT, got {:?}", other),
            }
        }
        error!("EOT was never acknowledged");
        self.abort(io);
        Ok(false)
    }

    fn wait_for_start<I: BlockIo>(&mut self, io: &mut I) -> bool {
        let mut errors = 0;
        let mut cancelled = false;
        loop {
            match self.reply(io) {
                BlockReply::Nak => {
                    self.crc_mode = false;
                    return true;
                }
                BlockReply::Crc => {
                    self.crc_mode = true;
                    return true;
                }
                BlockReply::Cancel if cancelled => {
                    info!("transfer cancelled by receiver");
                    return false;
                }
                BlockReply::Cancel => cancelled = true,
                other => {
                    debug!("waiting for receiver, got {:?}", other);
                    errors += 1;
                    if errors > self.retries {
                        error!("receiver never asked for data");
                        return false;
                    }
                }
            }
        }
    }

    fn send_block<I: BlockIo>(&self, io: &mut I, sequence: u8, data: &[u8; BLOCK_SIZE]) -> Result<bool> {
        let mut packet = Vec::with_capacity(BLOCK_SIZE + 5);
        packet.extend_from_slice(&[SOH, sequence, 0xFF - sequence]);
        packet.extend_from_slice(data);
        if self.crc_mode {
            packet.extend_from_slice(&crc16_xmodem(data).to_be_bytes());
        } else {
            packet.push(checksum(data));
        }

        for _ in 0..=self.retries {
            io.write_block(&packet)?;
            match self.reply(io) {
                BlockReply::Ack => return Ok(true),
                other => warn!("send error: expected ACK, got {:?} for block {}", other, sequence),
            }
        }
        error!("block {} failed after {} retries", sequence, self.retries);
        Ok(false)
    }

    fn abort<I: BlockIo>(&self, io: &mut I) {
        if let Err(e) = io.write_block(&[CAN, CAN]) {
            debug!("failed to send cancel: {}", e);
        }
    }
}

/// Fill `buf` as far as `source` allows, returning the byte count
fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Send the file at `path` through `io`, logging the outcome
pub fn upload_file<I: BlockIo>(io: &mut I, path: &Path, mut xmodem: Xmodem) -> bool {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) => {
            error!("❌ Update failed. Unable to open {}: {}", path.display(), e);
            return false;
        }
    };
    info!("📂 Sending file: {} via XMODEM...", path.display());
    match xmodem.send(io, &mut file) {
        Ok(true) => {
            info!("✅ File transfer complete!");
            true
        }
        Ok(false) => {
            error!("❌ File transfer failed!");
            false
        }
        Err(e) => {
            error!("❌ Error during file transfer: {}", e);
            false
        }
    }
}

//! Firmware update over the OTA service.
//!
//! Handshake: announce the packet size, REQUEST and wait for ACK/NAK, stream
//! the image in packet sized chunks, DONE and wait for ACK/NAK. There is no
//! per-chunk acknowledgement and no resumption, a failed session starts over.

use std::fmt;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{error, info, warn};

use crate::error::Result;

/// OTA control opcodes
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OpCode {
    Nop = 0x00,
    Request = 0x01,
    RequestAck = 0x02,
    RequestNak = 0x03,
    Done = 0x04,
    DoneAck = 0x05,
    DoneNak = 0x06,
}

impl OpCode {
    /// Decode a control notification, which carries exactly one opcode byte
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        match payload {
            [byte] => OpCode::try_from(*byte).ok(),
            _ => None,
        }
    }
}

/// The link a firmware session drives
pub trait FirmwareLink {
    /// Tell the device how large each data packet will be
    fn send_packet_size(&self, size: u16) -> Result<()>;
    /// Write one opcode to the control endpoint
    fn send_control(&self, opcode: OpCode) -> Result<()>;
    /// Write one chunk of the image to the data endpoint
    fn send_chunk(&self, chunk: &[u8]) -> Result<()>;
    /// Next control notification, `None` once `timeout` passes
    fn recv(&self, timeout: Duration) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Requested,
    Transferring,
    DonePending,
    Complete,
    Failed,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateState::Idle => write!(f, "IDLE"),
            UpdateState::Requested => write!(f, "REQUESTED"),
            UpdateState::Transferring => write!(f, "TRANSFERRING"),
            UpdateState::DonePending => write!(f, "DONE_PENDING"),
            UpdateState::Complete => write!(f, "COMPLETE"),
            UpdateState::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Ack,
    Nak,
    Timeout,
}

#[derive(Debug)]
pub struct FirmwareSession {
    state: UpdateState,
    packet_size: usize,
    total_size: usize,
    chunk_count: usize,
    chunk_index: usize,
    ack_timeout: Duration,
}

impl FirmwareSession {
    /// `packet_size` is the negotiated MTU minus the ATT header
    pub fn new(packet_size: usize, ack_timeout: Duration) -> Self {
        FirmwareSession {
            state: UpdateState::Idle,
            packet_size: packet_size.clamp(1, u16::MAX as usize),
            total_size: 0,
            chunk_count: 0,
            chunk_index: 0,
            ack_timeout,
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Chunks written so far
    pub fn chunk_index(&self) -> usize {
        self.chunk_index
    }

    /// Run the whole handshake, returning the final state
    pub fn run<L: FirmwareLink>(&mut self, link: &L, image: &[u8]) -> UpdateState {
        if self.state != UpdateState::Idle {
            warn!("Firmware session already ran ({}), restart from IDLE", self.state);
            return self.state;
        }
        let final_state = match self.try_run(link, image) {
            Ok(state) => state,
            Err(e) => {
                error!("❌ Unexpected exception during OTA update: {}", e);
                UpdateState::Failed
            }
        };
        self.transition(final_state);
        match final_state {
            UpdateState::Complete => info!("✅ OTA Update Complete"),
            _ => error!("❌ OTA Update Failed"),
        }
        final_state
    }

    fn try_run<L: FirmwareLink>(&mut self, link: &L, image: &[u8]) -> Result<UpdateState> {
        info!("📨 Write packet size ({} bytes)", self.packet_size);
        link.send_packet_size(self.packet_size as u16)?;

        info!("📨 Sending OTA request");
        link.send_control(OpCode::Request)?;
        self.transition(UpdateState::Requested);
        match self.await_verdict(link, OpCode::RequestAck, OpCode::RequestNak) {
            Verdict::Ack => info!("📩 OTA request acknowledged."),
            Verdict::Nak => {
                error!("❌ Failed to start OTA, request NOT acknowledged");
                return Ok(UpdateState::Failed);
            }
            Verdict::Timeout => {
                error!("❌ Failed to start OTA, no reply to request");
                return Ok(UpdateState::Failed);
            }
        }

        self.transition(UpdateState::Transferring);
        self.total_size = image.len();
        self.chunk_count = self.total_size.div_ceil(self.packet_size);
        self.chunk_index = 0;

        let pb = ProgressBar::new(self.total_size as u64);
        if let Ok(style) =
            ProgressStyle::with_template("📦 [{elapsed}] [{wide_bar:.blue/white}] {bytes}/{total_bytes} ({bytes_per_sec})")
        {
            pb.set_style(style.progress_chars("#> "));
        }
        for chunk in image.chunks(self.packet_size) {
            if let Err(e) = link.send_chunk(chunk) {
                pb.abandon();
                return Err(e);
            }
            self.chunk_index += 1;
            pb.inc(chunk.len() as u64);
        }
        pb.finish();

        info!("📨 Sending OTA done");
        link.send_control(OpCode::Done)?;
        self.transition(UpdateState::DonePending);
        match self.await_verdict(link, OpCode::DoneAck, OpCode::DoneNak) {
            Verdict::Ack => {
                info!("📩 OTA done acknowledged.");
                Ok(UpdateState::Complete)
            }
            Verdict::Nak => {
                error!("📩 OTA done NOT acknowledged.");
                Ok(UpdateState::Failed)
            }
            Verdict::Timeout => {
                error!("No reply to OTA done within {:?}", self.ack_timeout);
                Ok(UpdateState::Failed)
            }
        }
    }

    /// Wait for `ack` or `nak`, anything else is logged and skipped
    fn await_verdict<L: FirmwareLink>(&self, link: &L, ack: OpCode, nak: OpCode) -> Verdict {
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(payload) = link.recv(remaining) else {
                return Verdict::Timeout;
            };
            match OpCode::from_payload(&payload) {
                Some(op) if op == ack => return Verdict::Ack,
                Some(op) if op == nak => return Verdict::Nak,
                _ => warn!("⚠️ Unexpected OTA reply in {}: {:x?}", self.state, payload),
            }
        }
    }

    fn transition(&mut self, to: UpdateState) {
        if self.state != to {
            info!("OTA {} -> {}", self.state, to);
            self.state = to;
        }
    }
}

//! Queues shared between a transport's background reader and caller threads.
//!
//! The reader side only appends, the caller side only consumes. Both ends are
//! cheap to clone so every producer holds its own handle.

use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info};

/// Ordered queue of decoded response lines for one connection
#[derive(Debug, Clone)]
pub struct ResponseChannel {
    tx: Sender<String>,
    rx: Receiver<String>,
}

impl Default for ResponseChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseChannel {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        ResponseChannel { tx, rx }
    }

    /// Enqueue one response line as delivered by the device
    pub fn consume(&self, line: &str) {
        info!("{}", line);
        // Both ends live in `self`, the channel cannot be disconnected here.
        let _ = self.tx.send(line.to_string());
    }

    /// Discard everything queued so far, returning how many lines were dropped
    pub fn drain(&self) -> usize {
        let stale = self.rx.try_iter().count();
        if stale > 0 {
            debug!(stale, "dropped stale response lines");
        }
        stale
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<String> {
        match self.rx.recv_timeout(timeout) {
            Ok(line) => Some(line),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

/// Raw byte queue used while a block transfer owns the link
#[derive(Debug, Clone)]
pub struct ByteChannel {
    tx: Sender<u8>,
    rx: Receiver<u8>,
}

impl Default for ByteChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteChannel {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        ByteChannel { tx, rx }
    }

    pub fn extend(&self, data: &[u8]) {
        for &byte in data {
            let _ = self.tx.send(byte);
        }
    }

    /// Read exactly `size` bytes, or `None` when the deadline passes first
    pub fn read_exact(&self, size: usize, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buffer = Vec::with_capacity(size);
        while buffer.len() < size {
            match self.rx.recv_deadline(deadline) {
                Ok(byte) => buffer.push(byte),
                Err(_) => {
                    debug!(wanted = size, got = buffer.len(), "byte read timed out");
                    return None;
                }
            }
        }
        Some(buffer)
    }

    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }
}

/// Splits decoded text into CR LF terminated lines.
///
/// A trailing partial line is kept until the terminator arrives in a later
/// chunk. Lines are stripped of the shell prompt (`#`) and whitespace, and
/// empty lines are dropped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: String,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.push_str(&String::from_utf8_lossy(chunk));
        let mut lines: Vec<&str> = self.partial.split("\r\n").collect();
        // `split` always yields at least one item, the last being whatever
        // follows the final terminator.
        let rest = lines.pop().unwrap_or_default().to_string();
        let complete = lines
            .into_iter()
            .map(|line| line.trim_matches('#').trim())
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        self.partial = rest;
        complete
    }

    pub fn pending(&self) -> &str {
        &self.partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_fifo() {
        let channel = ResponseChannel::new();
        channel.consume("first");
        channel.consume("second");
        assert_eq!(channel.len(), 2);
        assert_eq!(channel.recv_timeout(Duration::ZERO).as_deref(), Some("first"));
        assert_eq!(channel.recv_timeout(Duration::ZERO).as_deref(), Some("second"));
        assert!(channel.is_empty());
    }

    #[test]
    fn test_drain_discards_stale_lines() {
        let channel = ResponseChannel::new();
        channel.consume("stale 1");
        channel.consume("stale 2");
        assert_eq!(channel.drain(), 2);
        assert!(channel.recv_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_producer_clone_feeds_consumer() {
        let channel = ResponseChannel::new();
        let producer = channel.clone();
        std::thread::spawn(move || producer.consume("OK version 2.3"))
            .join()
            .unwrap();
        assert_eq!(
            channel.recv_timeout(Duration::from_secs(1)).as_deref(),
            Some("OK version 2.3")
        );
    }

    #[test]
    fn test_splitter_keeps_partial_line() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"hwversion\r\nOK hw").len() == 1);
        assert_eq!(splitter.pending(), "OK hw");
        let lines = splitter.push(b"version 1.5\r\n\r\n#");
        assert_eq!(lines, vec!["OK hwversion 1.5".to_string()]);
        assert_eq!(splitter.pending(), "#");
    }

    #[test]
    fn test_splitter_strips_prompt() {
        let mut splitter = LineSplitter::new();
        splitter.push(b"#");
        let lines = splitter.push(b" OK mwh 1200\r\n");
        assert_eq!(lines, vec!["OK mwh 1200".to_string()]);
        assert_eq!(splitter.pending(), "");
    }

    #[test]
    fn test_splitter_handles_terminator_across_chunks() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"OK status idle\r").is_empty());
        assert_eq!(splitter.push(b"\n"), vec!["OK status idle".to_string()]);
    }

    #[test]
    fn test_read_exact_waits_for_all_bytes() {
        let bytes = ByteChannel::new();
        bytes.extend(&[0x15, 0x06]);
        assert_eq!(bytes.read_exact(1, Duration::ZERO), Some(vec![0x15]));
        assert_eq!(bytes.read_exact(2, Duration::from_millis(20)), None);
        assert_eq!(bytes.drain(), 0);
    }
}

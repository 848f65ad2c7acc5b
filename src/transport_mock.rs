//! In-memory transport for unit tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::channel::ResponseChannel;
use crate::error::{Error, Result};
use crate::transport::{Endpoint, Transport};

/// Records every write and answers scripted commands on the Response Channel
pub struct MockTransport {
    responses: ResponseChannel,
    replies: Mutex<HashMap<String, Vec<String>>>,
    writes: Mutex<Vec<(Endpoint, Vec<u8>)>>,
    uploads: Mutex<Vec<PathBuf>>,
    streams: Mutex<Vec<(PathBuf, u32)>>,
    failing_streams: Mutex<HashSet<u32>>,
    connected: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            responses: ResponseChannel::new(),
            replies: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
            failing_streams: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Lines the "device" prints after receiving `command`
    pub fn reply_to(&self, command: &str, lines: &[&str]) {
        let lines = lines.iter().map(|l| l.to_string()).collect();
        self.replies.lock().insert(command.to_string(), lines);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make the stream with this reference number fail
    pub fn fail_stream(&self, reference: u32) {
        self.failing_streams.lock().insert(reference);
    }

    pub fn uploads(&self) -> Vec<PathBuf> {
        self.uploads.lock().clone()
    }

    pub fn streams(&self) -> Vec<(PathBuf, u32)> {
        self.streams.lock().clone()
    }

    /// Command lines sent so far, without their terminator
    pub fn commands(&self) -> Vec<String> {
        self.writes
            .lock()
            .iter()
            .filter(|(endpoint, _)| *endpoint == Endpoint::SerialLine)
            .map(|(_, bytes)| String::from_utf8_lossy(bytes).trim_end().to_string())
            .collect()
    }
}

impl Transport for MockTransport {
    fn send(&self, endpoint: Endpoint, bytes: &[u8], _confirm: bool) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }
        self.writes.lock().push((endpoint, bytes.to_vec()));
        let command = String::from_utf8_lossy(bytes).trim().to_string();
        if let Some(lines) = self.replies.lock().get(&command) {
            for line in lines {
                self.responses.consume(line);
            }
        }
        Ok(())
    }

    fn command_endpoint(&self) -> Endpoint {
        Endpoint::SerialLine
    }

    fn responses(&self) -> &ResponseChannel {
        &self.responses
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn disconnect(&mut self) {
        self.set_connected(false);
    }

    fn upload(&self, path: &Path) -> Result<bool> {
        self.uploads.lock().push(path.to_path_buf());
        Ok(true)
    }

    fn stream_to_file(&self, path: &Path, reference: u32) -> Result<bool> {
        self.streams.lock().push((path.to_path_buf(), reference));
        Ok(!self.failing_streams.lock().contains(&reference))
    }
}

//! Framed file retrieval over the streaming service.
//!
//! The device answers `stream <file> <ref>` with binary notifications. A
//! payload holding [`START_MARKER`] opens the frame and restarts the file, a
//! payload holding [`END_MARKER`] closes it. Fragment bytes are written
//! verbatim to a sibling temporary file which only replaces the destination
//! once the frame closed.

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::error::Result;

pub const START_MARKER: u8 = 0x02;
pub const END_MARKER: u8 = 0x03;

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// End marker seen, destination written
    Complete,
    /// No payload within the timeout
    Idle,
    /// Payloads kept coming but the session outlived the timeout
    Overrun,
    /// The payload queue was closed by a disconnect
    Closed,
}

pub struct StreamSession {
    payloads: Receiver<Vec<u8>>,
    timeout: Duration,
    frame_open: bool,
    last_activity: Instant,
}

impl StreamSession {
    pub fn new(payloads: Receiver<Vec<u8>>, timeout: Duration) -> Self {
        StreamSession {
            payloads,
            timeout,
            frame_open: false,
            last_activity: Instant::now(),
        }
    }

    /// Receive one frame into `destination`, true on success
    pub fn receive(&mut self, destination: &Path) -> bool {
        match self.try_receive(destination) {
            Ok(StreamEnd::Complete) => {
                info!("✅ File retrieved and saved as: {}", destination.display());
                true
            }
            Ok(StreamEnd::Idle) => {
                warn!(
                    "❌ Failed to retrieve file {}: nothing received for {:.1} seconds",
                    destination.display(),
                    self.timeout.as_secs_f64()
                );
                false
            }
            Ok(StreamEnd::Overrun) => {
                error!("❌ Failed to get end of stream for {}", destination.display());
                false
            }
            Ok(StreamEnd::Closed) => {
                error!("❌ Stream for {} interrupted by disconnect", destination.display());
                false
            }
            Err(e) => {
                error!("❌ Failed to write {}: {}", destination.display(), e);
                false
            }
        }
    }

    pub fn try_receive(&mut self, destination: &Path) -> Result<StreamEnd> {
        let dir = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;

        let started = Instant::now();
        self.frame_open = false;

        loop {
            let payload = match self.payloads.recv_timeout(self.timeout) {
                Ok(payload) => payload,
                Err(RecvTimeoutError::Timeout) => return Ok(StreamEnd::Idle),
                Err(RecvTimeoutError::Disconnected) => return Ok(StreamEnd::Closed),
            };
            self.last_activity = Instant::now();

            let mut fragment = payload.as_slice();
            if let Some(pos) = fragment.iter().position(|&b| b == START_MARKER) {
                info!("▶️ Stream Start");
                self.frame_open = true;
                fragment = &fragment[pos + 1..];
                let file = tmp.as_file_mut();
                file.set_len(0)?;
                file.seek(SeekFrom::Start(0))?;
            }

            let closing = fragment.contains(&END_MARKER);
            // Written as received, a character may straddle two notifications
            let text: Vec<u8> = fragment.iter().copied().filter(|&b| b != END_MARKER).collect();
            debug!("'{}'", String::from_utf8_lossy(&text));
            tmp.write_all(&text)?;
            tmp.flush()?;

            if closing {
                info!("⏹️ Stream End");
                self.frame_open = false;
                tmp.persist(destination).map_err(|e| e.error)?;
                return Ok(StreamEnd::Complete);
            }

            if started.elapsed() > self.timeout {
                return Ok(StreamEnd::Overrun);
            }
        }
    }

    pub fn frame_open(&self) -> bool {
        self.frame_open
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    const SHORT: Duration = Duration::from_millis(100);

    fn payload(marker: Option<u8>, text: &str) -> Vec<u8> {
        let mut bytes: Vec<u8> = marker.into_iter().collect();
        bytes.extend_from_slice(text.as_bytes());
        bytes
    }

    #[test]
    fn test_frame_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("725.CSV");
        let (tx, rx) = unbounded();
        tx.send(payload(Some(START_MARKER), "A")).unwrap();
        tx.send(payload(None, "B")).unwrap();
        tx.send(payload(Some(END_MARKER), "C")).unwrap();

        let mut session = StreamSession::new(rx, SHORT);
        assert!(session.receive(&dest));
        assert!(!session.frame_open());
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "ABC");
    }

    #[test]
    fn test_start_marker_restarts_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.csv");
        let (tx, rx) = unbounded();
        tx.send(b"stale".to_vec()).unwrap();
        tx.send(b"junk\x02time,v\n".to_vec()).unwrap();
        tx.send(b"1,4.1\n\x03".to_vec()).unwrap();

        let mut session = StreamSession::new(rx, SHORT);
        assert_eq!(session.try_receive(&dest).unwrap(), StreamEnd::Complete);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "time,v\n1,4.1\n");
    }

    #[test]
    fn test_split_character_survives() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("temp.csv");
        let (tx, rx) = unbounded();
        tx.send(b"\x02temp,\xC2".to_vec()).unwrap();
        tx.send(b"\xB0C\n\x03".to_vec()).unwrap();

        let mut session = StreamSession::new(rx, SHORT);
        assert!(session.receive(&dest));
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "temp,°C\n");
    }

    #[test]
    fn test_silence_fails_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("silent.csv");
        let (_tx, rx) = unbounded::<Vec<u8>>();

        let mut session = StreamSession::new(rx, SHORT);
        assert!(!session.receive(&dest));
        assert!(!dest.exists());
    }

    #[test]
    fn test_failure_keeps_previous_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("kept.csv");
        std::fs::write(&dest, "old").unwrap();
        let (tx, rx) = unbounded();
        tx.send(payload(Some(START_MARKER), "partial")).unwrap();

        let mut session = StreamSession::new(rx, SHORT);
        assert_eq!(session.try_receive(&dest).unwrap(), StreamEnd::Idle);
        assert!(session.frame_open());
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "old");
    }

    #[test]
    fn test_endless_stream_overruns() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("endless.csv");
        let (tx, rx) = unbounded();
        tx.send(payload(Some(START_MARKER), "x")).unwrap();
        let feeder = std::thread::spawn(move || {
            for _ in 0..100 {
                if tx.send(b"y".to_vec()).is_err() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        });

        let mut session = StreamSession::new(rx, SHORT);
        assert_eq!(session.try_receive(&dest).unwrap(), StreamEnd::Overrun);
        assert!(!dest.exists());
        drop(session);
        feeder.join().unwrap();
    }

    #[test]
    fn test_disconnect_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = unbounded::<Vec<u8>>();
        drop(tx);
        let mut session = StreamSession::new(rx, SHORT);
        assert_eq!(session.try_receive(&dir.path().join("x")).unwrap(), StreamEnd::Closed);
    }
}

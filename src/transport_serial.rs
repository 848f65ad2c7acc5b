//! Leo over its USB serial bridge.
//!
//! A reader thread polls the port and feeds complete lines to the Response
//! Channel. Block transfers take the pause gate, which stops the reader from
//! touching the port until the transfer gives the gate back.

use std::io::{self, ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use tracing::{debug, error, info};

use crate::channel::{LineSplitter, ResponseChannel};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::transport::{Candidate, Endpoint, Transport, TransportManager};
use crate::xmodem::{self, BlockIo, Xmodem};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const PORT_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether a port sits behind the configured USB bridge chip
fn is_bridge(info: &SerialPortInfo, description: &str) -> bool {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => [usb.product.as_deref(), usb.manufacturer.as_deref()]
            .into_iter()
            .flatten()
            .any(|field| field.contains(description)),
        _ => false,
    }
}

fn candidate(info: &SerialPortInfo) -> Candidate {
    let name = match &info.port_type {
        SerialPortType::UsbPort(usb) => usb.product.clone().unwrap_or_else(|| info.port_name.clone()),
        _ => info.port_name.clone(),
    };
    Candidate {
        name,
        address: info.port_name.clone(),
    }
}

pub struct SerialManager {
    config: ClientConfig,
}

impl SerialManager {
    pub fn new(config: ClientConfig) -> Self {
        SerialManager { config }
    }
}

impl TransportManager for SerialManager {
    type Transport = SerialConnection;

    fn discover(&mut self) -> Result<Vec<Candidate>> {
        let ports = serialport::available_ports()?;
        let found: Vec<Candidate> = ports
            .iter()
            .filter(|info| is_bridge(info, &self.config.serial_description))
            .map(candidate)
            .collect();
        for c in &found {
            info!("🔍 Found {} on {}", c.name, c.address);
        }
        Ok(found)
    }

    /// `identifier` is the port name, e.g. `/dev/ttyUSB0` or `COM3`
    fn connect(&mut self, identifier: &str) -> Result<SerialConnection> {
        SerialConnection::open(identifier, &self.config)
    }
}

pub struct SerialConnection {
    port_name: String,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
    responses: ResponseChannel,
    running: Arc<AtomicBool>,
    pause: Arc<Mutex<()>>,
    reader: Option<JoinHandle<()>>,
    config: ClientConfig,
}

impl SerialConnection {
    pub fn open(port_name: &str, config: &ClientConfig) -> Result<Self> {
        let port = serialport::new(port_name, config.baud_rate)
            .timeout(PORT_TIMEOUT)
            .open()?;
        let reader_port = port.try_clone()?;
        info!("🔗 Connected to {} at {} baud", port_name, config.baud_rate);

        let responses = ResponseChannel::new();
        let running = Arc::new(AtomicBool::new(true));
        let pause = Arc::new(Mutex::new(()));

        let reader = {
            let responses = responses.clone();
            let running = Arc::clone(&running);
            let pause = Arc::clone(&pause);
            thread::Builder::new()
                .name("leo-serial-reader".into())
                .spawn(move || read_loop(reader_port, running, pause, responses))?
        };

        Ok(SerialConnection {
            port_name: port_name.to_string(),
            port: Arc::new(Mutex::new(port)),
            responses,
            running,
            pause,
            reader: Some(reader),
            config: config.clone(),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

/// What the reader thread needs from a port
trait PortReader: Read {
    fn waiting(&self) -> io::Result<usize>;
}

impl PortReader for Box<dyn SerialPort> {
    fn waiting(&self) -> io::Result<usize> {
        Ok(self.bytes_to_read()? as usize)
    }
}

fn read_loop<P: PortReader>(mut port: P, running: Arc<AtomicBool>, pause: Arc<Mutex<()>>, responses: ResponseChannel) {
    let mut splitter = LineSplitter::new();
    let mut buf = [0u8; 1024];

    while running.load(Ordering::SeqCst) {
        // A block transfer owns the port while it holds the gate
        let Some(_gate) = pause.try_lock() else {
            thread::sleep(POLL_INTERVAL);
            continue;
        };

        let waiting = match port.waiting() {
            Ok(n) => n,
            Err(e) => {
                error!("❌ Serial error: {}", e);
                break;
            }
        };
        if waiting > 0 {
            let len = waiting.min(buf.len());
            match port.read(&mut buf[..len]) {
                Ok(n) => {
                    debug!("Raw: {:?}", String::from_utf8_lossy(&buf[..n]));
                    for line in splitter.push(&buf[..n]) {
                        responses.consume(&line);
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) => {
                    error!("❌ Serial error: {}", e);
                    break;
                }
            }
        }

        drop(_gate);
        thread::sleep(POLL_INTERVAL);
    }

    running.store(false, Ordering::SeqCst);
    debug!("serial reader stopped");
}

/// Raw port access for block transfers
struct SerialBlockIo<'a> {
    port: &'a mut dyn SerialPort,
}

impl BlockIo for SerialBlockIo<'_> {
    fn read_block(&mut self, size: usize, timeout: Duration) -> Option<Vec<u8>> {
        if let Err(e) = self.port.set_timeout(timeout) {
            debug!("failed to set port timeout: {}", e);
        }
        let mut data = vec![0u8; size];
        match self.port.read_exact(&mut data) {
            Ok(()) => Some(data),
            Err(e) => {
                debug!("block read: {}", e);
                None
            }
        }
    }

    fn write_block(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }
}

impl Transport for SerialConnection {
    fn send(&self, endpoint: Endpoint, bytes: &[u8], _confirm: bool) -> Result<()> {
        if endpoint != Endpoint::SerialLine {
            return Err(Error::Unsupported("characteristic endpoints"));
        }
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }
        debug!("📨 Serial -> {:?}", String::from_utf8_lossy(bytes));
        let mut port = self.port.lock();
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn command_endpoint(&self) -> Endpoint {
        Endpoint::SerialLine
    }

    fn responses(&self) -> &ResponseChannel {
        &self.responses
    }

    fn is_connected(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn disconnect(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                error!("serial reader panicked");
            }
            info!("🔌 Serial Disconnected.");
        }
    }

    fn upload(&self, path: &Path) -> Result<bool> {
        if !path.is_file() {
            error!("❌ Update failed. Unable to find {}", path.display());
            return Ok(false);
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.send_command(&format!("py_ldx {}", name))?;
        thread::sleep(self.config.block_settle());

        let _gate = self.pause.lock();
        let mut port = self.port.lock();
        let xmodem = Xmodem::new(self.config.block_retries, self.config.block_timeout());
        let ok = xmodem::upload_file(&mut SerialBlockIo { port: &mut **port }, path, xmodem);
        port.set_timeout(PORT_TIMEOUT)?;
        Ok(ok)
    }
}

impl Drop for SerialConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory port fed by the test
    #[derive(Clone, Default)]
    struct FakePort {
        incoming: Arc<Mutex<VecDeque<u8>>>,
    }

    impl FakePort {
        fn feed(&self, bytes: &[u8]) {
            self.incoming.lock().extend(bytes);
        }
    }

    impl Read for FakePort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut incoming = self.incoming.lock();
            let n = buf.len().min(incoming.len());
            for (slot, byte) in buf.iter_mut().zip(incoming.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl PortReader for FakePort {
        fn waiting(&self) -> io::Result<usize> {
            Ok(self.incoming.lock().len())
        }
    }

    fn spawn_reader(port: FakePort) -> (Arc<AtomicBool>, Arc<Mutex<()>>, ResponseChannel, JoinHandle<()>) {
        let running = Arc::new(AtomicBool::new(true));
        let pause = Arc::new(Mutex::new(()));
        let responses = ResponseChannel::new();
        let reader = {
            let running = Arc::clone(&running);
            let pause = Arc::clone(&pause);
            let responses = responses.clone();
            thread::spawn(move || read_loop(port, running, pause, responses))
        };
        (running, pause, responses, reader)
    }

    #[test]
    fn test_reader_splits_lines_across_reads() {
        let port = FakePort::default();
        let (running, _pause, responses, reader) = spawn_reader(port.clone());
        port.feed(b"OK ver");
        thread::sleep(Duration::from_millis(150));
        port.feed(b"sion 2.3\r\n");
        assert_eq!(
            responses.recv_timeout(Duration::from_secs(1)).as_deref(),
            Some("OK version 2.3")
        );
        running.store(false, Ordering::SeqCst);
        reader.join().unwrap();
    }

    #[test]
    fn test_reader_leaves_port_alone_while_paused() {
        let port = FakePort::default();
        let (running, pause, responses, reader) = spawn_reader(port.clone());

        let gate = pause.lock();
        port.feed(b"OK\r\n");
        thread::sleep(Duration::from_millis(200));
        assert!(responses.is_empty());
        assert_eq!(port.incoming.lock().len(), 4);
        drop(gate);

        assert_eq!(responses.recv_timeout(Duration::from_secs(1)).as_deref(), Some("OK"));
        running.store(false, Ordering::SeqCst);
        reader.join().unwrap();
    }
}

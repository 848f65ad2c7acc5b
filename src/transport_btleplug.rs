//! Leo over Bluetooth LE.
//!
//! btleplug is async, the rest of the client is not: every BLE call is
//! submitted to the [`EventLoop`] worker and waited on. Notifications are
//! pumped by a task on that worker into the per-service queues.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use indicatif::ProgressBar;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::EventLoop;
use crate::channel::ResponseChannel;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::firmware::{FirmwareLink, FirmwareSession, OpCode, UpdateState};
use crate::services::{NotificationRouter, ServiceKind, ServiceQueues, uuids};
use crate::streaming::StreamSession;
use crate::transport::{Candidate, Endpoint, Transport, TransportManager, resolve_or_report};
use crate::xmodem::{self, BlockIo, Xmodem};

fn format_peripheral_properties(properties: &PeripheralProperties) -> String {
    let name = properties.local_name.as_deref().unwrap_or("None");
    let addr = properties.address;
    let rssi = properties.rssi.unwrap_or(-99);
    format!("rssi: {}, address: {}, name: {}", rssi, addr, name)
}

fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(Error::CharacteristicNotFound(uuid))
}

pub struct BleManager {
    event_loop: Arc<EventLoop>,
    adapter: Adapter,
    config: ClientConfig,
    found: Vec<(Candidate, Peripheral)>,
}

impl BleManager {
    /// Start the BLE worker and grab the first adapter
    pub fn new(config: ClientConfig) -> Result<Self> {
        let event_loop = Arc::new(EventLoop::start("leo-ble")?);
        let adapter = event_loop.run(async {
            let manager = Manager::new().await?;
            let adapters = manager.adapters().await?;
            adapters.into_iter().next().ok_or(Error::NoAdapter)
        })?;
        Ok(BleManager {
            event_loop,
            adapter,
            config,
            found: Vec::new(),
        })
    }
}

impl TransportManager for BleManager {
    type Transport = BleConnection;

    fn discover(&mut self) -> Result<Vec<Candidate>> {
        info!("🔍 Scanning for Bluetooth devices...");
        let pb = ProgressBar::new_spinner();
        pb.enable_steady_tick(Duration::from_millis(64));

        let adapter = self.adapter.clone();
        let scan_time = self.config.scan_timeout();
        let filter = self.config.name_filter.clone();
        let spinner = pb.clone();
        let result = self.event_loop.run(async move {
            let mut events = adapter.events().await?;
            adapter.start_scan(ScanFilter::default()).await?;
            let deadline = tokio::time::Instant::now() + scan_time;
            while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.next()).await {
                if let CentralEvent::DeviceDiscovered(id) = event {
                    let peripheral = adapter.peripheral(&id).await?;
                    if let Some(properties) = peripheral.properties().await? {
                        spinner.set_message(format_peripheral_properties(&properties));
                    }
                }
            }
            adapter.stop_scan().await?;

            let mut found = Vec::new();
            for peripheral in adapter.peripherals().await? {
                let Some(properties) = peripheral.properties().await? else {
                    continue;
                };
                let Some(name) = properties.local_name else {
                    continue;
                };
                if name.contains(&filter) {
                    let candidate = Candidate {
                        name,
                        address: properties.address.to_string(),
                    };
                    found.push((candidate, peripheral));
                }
            }
            Ok::<_, Error>(found)
        });
        pb.finish_and_clear();

        self.found = result?;
        for (candidate, _) in &self.found {
            info!("🔍 Found {} ({})", candidate.name, candidate.address);
        }
        Ok(self.found.iter().map(|(c, _)| c.clone()).collect())
    }

    fn connect(&mut self, identifier: &str) -> Result<BleConnection> {
        if self.found.is_empty() {
            self.discover()?;
        }
        let candidates: Vec<Candidate> = self.found.iter().map(|(c, _)| c.clone()).collect();
        let candidate = resolve_or_report(&candidates, identifier, &self.config.usb_prefix)?.clone();
        let peripheral = self
            .found
            .iter()
            .find(|(c, _)| *c == candidate)
            .map(|(_, p)| p.clone())
            .ok_or_else(|| Error::DeviceNotFound(identifier.to_string()))?;

        info!("🔌 Connecting to {}", identifier);
        let connection = BleConnection::establish(Arc::clone(&self.event_loop), peripheral, candidate, &self.config)?;
        info!("🔌 Connected to {}", identifier);
        Ok(connection)
    }
}

/// What a successful service setup leaves behind
struct Link {
    connected: Arc<AtomicBool>,
    services: Vec<ServiceKind>,
    subscriptions: Vec<Characteristic>,
    queues: ServiceQueues,
}

pub struct BleConnection {
    event_loop: Arc<EventLoop>,
    peripheral: Peripheral,
    candidate: Candidate,
    config: ClientConfig,
    connected: Arc<AtomicBool>,
    services: Vec<ServiceKind>,
    subscriptions: Vec<Characteristic>,
    queues: ServiceQueues,
}

impl BleConnection {
    fn establish(
        event_loop: Arc<EventLoop>,
        peripheral: Peripheral,
        candidate: Candidate,
        config: &ClientConfig,
    ) -> Result<Self> {
        let link = Self::setup(&event_loop, peripheral.clone())?;
        Ok(BleConnection {
            event_loop,
            peripheral,
            candidate,
            config: config.clone(),
            connected: link.connected,
            services: link.services,
            subscriptions: link.subscriptions,
            queues: link.queues,
        })
    }

    /// Connect, subscribe every known service present and start the notification pump
    fn setup(event_loop: &EventLoop, peripheral: Peripheral) -> Result<Link> {
        event_loop.run(async move {
            peripheral.connect().await?;
            peripheral.discover_services().await?;

            let mut notifications = peripheral.notifications().await?;
            let (mut router, queues) = NotificationRouter::new();
            let mut services = Vec::new();
            let mut subscriptions = Vec::new();
            let available = peripheral.services();

            for service in &available {
                if ServiceKind::from_uuid(service.uuid).is_none() {
                    debug!("Ignoring unknown service: {}", service.uuid);
                }
            }

            for kind in ServiceKind::ALL {
                let Some(service) = available.iter().find(|s| s.uuid == kind.uuid()) else {
                    warn!("Service unavailable on device: {} ({})", kind.name(), kind.uuid());
                    continue;
                };
                for ch in &service.characteristics {
                    let notifiable = ch.properties.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE);
                    if kind.subscribes(ch.uuid, notifiable) {
                        peripheral.subscribe(ch).await?;
                        router.add_route(ch.uuid, kind);
                        subscriptions.push(ch.clone());
                    }
                }
                debug!("{} service ready", kind.name());
                services.push(kind);
            }

            // Cleared by release() or when the stream ends, stops this pump
            let connected = Arc::new(AtomicBool::new(true));
            let alive = Arc::clone(&connected);
            tokio::spawn(async move {
                while let Some(notification) = notifications.next().await {
                    if !alive.load(Ordering::SeqCst) {
                        break;
                    }
                    router.route(notification.uuid, &notification.value);
                }
                alive.store(false, Ordering::SeqCst);
                debug!("Notification stream ended");
            });

            Ok::<_, Error>(Link {
                connected,
                services,
                subscriptions,
                queues,
            })
        })
    }

    pub fn candidate(&self) -> &Candidate {
        &self.candidate
    }

    pub fn services(&self) -> &[ServiceKind] {
        &self.services
    }

    fn require(&self, kind: ServiceKind) -> Result<()> {
        if self.services.contains(&kind) {
            Ok(())
        } else {
            Err(Error::ServiceUnavailable(kind.name()))
        }
    }

    /// Drop the link to the device and connect again to the same address
    pub fn reconnect(&mut self) -> Result<()> {
        info!("🔌 Reconnecting to {}", self.candidate.address);
        self.release();
        let link = Self::setup(&self.event_loop, self.peripheral.clone())?;
        self.connected = link.connected;
        self.services = link.services;
        self.subscriptions = link.subscriptions;
        self.queues = link.queues;
        info!("🔌 Connected to {}", self.candidate.address);
        Ok(())
    }

    /// Stop notifications and disconnect, keeping the worker alive
    fn release(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        let peripheral = self.peripheral.clone();
        let subscriptions = std::mem::take(&mut self.subscriptions);
        let address = self.candidate.address.clone();
        let result = self.event_loop.run(async move {
            for ch in &subscriptions {
                debug!("Stop notify for {}", ch.uuid);
                if let Err(e) = peripheral.unsubscribe(ch).await {
                    debug!("unsubscribe {}: {}", ch.uuid, e);
                }
            }
            info!("Disconnecting from {}", address);
            peripheral.disconnect().await?;
            Ok::<_, Error>(())
        });
        if let Err(e) = result {
            warn!("Disconnect from {} was not clean: {}", self.candidate.address, e);
        }
    }
}

/// UART write plus the byte queue filled while binary mode is on
struct BleBlockIo<'a> {
    connection: &'a BleConnection,
}

impl BlockIo for BleBlockIo<'_> {
    fn read_block(&mut self, size: usize, timeout: Duration) -> Option<Vec<u8>> {
        let data = self.connection.queues.uart.bytes.read_exact(size, timeout);
        if data.is_none() {
            debug!("getc: None");
        }
        data
    }

    fn write_block(&mut self, data: &[u8]) -> Result<()> {
        self.connection
            .send(Endpoint::Characteristic(uuids::UART_WRITE), data, true)
    }
}

/// OTA control and data characteristics
struct BleFirmwareLink<'a> {
    connection: &'a BleConnection,
}

impl FirmwareLink for BleFirmwareLink<'_> {
    /// The firmware takes the packet size on the data characteristic, not on
    /// control, before any REQUEST.
    fn send_packet_size(&self, size: u16) -> Result<()> {
        self.connection
            .send(Endpoint::Characteristic(uuids::OTA_DATA), &size.to_le_bytes(), true)
    }

    fn send_control(&self, opcode: OpCode) -> Result<()> {
        self.connection
            .send(Endpoint::Characteristic(uuids::OTA_CONTROL), &[u8::from(opcode)], true)
    }

    fn send_chunk(&self, chunk: &[u8]) -> Result<()> {
        self.connection
            .send(Endpoint::Characteristic(uuids::OTA_DATA), chunk, true)
    }

    fn recv(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.connection.queues.ota.recv_timeout(timeout).ok()
    }
}

impl Transport for BleConnection {
    fn send(&self, endpoint: Endpoint, bytes: &[u8], confirm: bool) -> Result<()> {
        let Endpoint::Characteristic(uuid) = endpoint else {
            return Err(Error::Unsupported("serial line endpoint"));
        };
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }
        debug!("Sending data to {}: {:?}", uuid, bytes);
        let peripheral = self.peripheral.clone();
        let bytes = bytes.to_vec();
        let write_type = if confirm {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.event_loop.run(async move {
            let ch = characteristic(&peripheral, uuid)?;
            peripheral.write(&ch, &bytes, write_type).await?;
            Ok::<_, Error>(())
        })
    }

    fn command_endpoint(&self) -> Endpoint {
        Endpoint::Characteristic(uuids::UART_WRITE)
    }

    fn responses(&self) -> &ResponseChannel {
        &self.queues.uart.responses
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.event_loop.is_running()
    }

    fn disconnect(&mut self) {
        if !self.event_loop.is_running() {
            return;
        }
        self.release();
        self.event_loop.stop();
        info!("🔌 Bluetooth Disconnected.");
    }

    fn send_command(&self, command: &str) -> Result<()> {
        self.require(ServiceKind::Uart)?;
        info!("📨 BLE [UART] -> Sending command: '{}'", command.trim());
        let line = format!("{}\r\n", command.trim());
        self.send(self.command_endpoint(), line.as_bytes(), true)
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

        let uart = &self.queues.uart;
        uart.set_binary_mode(true);
        let xmodem = Xmodem::new(self.config.block_retries, self.config.block_timeout());
        let ok = xmodem::upload_file(&mut BleBlockIo { connection: self }, path, xmodem);
        uart.set_binary_mode(false);
        Ok(ok)
    }

    fn stream_to_file(&self, path: &Path, reference: u32) -> Result<bool> {
        self.require(ServiceKind::Streaming)?;
        let stale = self.queues.streaming.try_iter().count();
        if stale > 0 {
            debug!(stale, "dropped stale stream payloads");
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let command = format!("stream {} {}", name, reference);
        info!("📨 BLE [Streaming] -> Sending command: '{}'", command);
        let line = format!("{}\r\n", command);
        self.send(Endpoint::Characteristic(uuids::STREAMING_WRITE), line.as_bytes(), true)?;

        let mut session = StreamSession::new(self.queues.streaming.clone(), self.config.stream_timeout());
        Ok(session.receive(path))
    }

    fn firmware_update(&self, image: &Path) -> Result<bool> {
        self.require(ServiceKind::Ota)?;
        if !self.is_connected() {
            warn!("❌ No Bluetooth connection.");
            return Err(Error::Disconnected);
        }
        info!("📦 Starting OTA update with {}...", image.display());
        let firmware = std::fs::read(image)?;
        let stale = self.queues.ota.try_iter().count();
        if stale > 0 {
            debug!(stale, "dropped stale OTA replies");
        }

        let mut session = FirmwareSession::new(self.config.packet_size(), self.config.firmware_ack_timeout());
        let state = session.run(&BleFirmwareLink { connection: self }, &firmware);
        Ok(state == UpdateState::Complete)
    }
}

impl Drop for BleConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

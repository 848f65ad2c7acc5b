//! Leo GATT services and the routing of their notifications.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ByteChannel, ResponseChannel};

/// Leo service & characteristic UUIDs
pub mod uuids {
    use uuid::Uuid;

    /// Nordic UART Service
    pub const UART_SERVICE: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);
    /// UART RX, client writes commands here
    pub const UART_WRITE: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);
    /// UART TX, device notifies replies here
    pub const UART_NOTIFY: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

    /// Firmware update (OTA) service
    pub const OTA_SERVICE: Uuid = Uuid::from_u128(0xD6F1D96D_594C_4C53_B1C6_144A1DFDE6D8);
    /// OTA control point (read, write, notify)
    pub const OTA_CONTROL: Uuid = Uuid::from_u128(0x7AD671AA_21C0_46A4_B722_270E3AE3D830);
    /// OTA data
    pub const OTA_DATA: Uuid = Uuid::from_u128(0x23408888_1F40_4CD8_9B89_CA8D45F8A5B0);

    /// File streaming service
    pub const STREAMING_SERVICE: Uuid = Uuid::from_u128(0x41E2B910_D0E0_4880_8988_5D4A761B9DC7);
    pub const STREAMING_NOTIFY: Uuid = Uuid::from_u128(0x94D2C6E0_89B3_4133_92A5_15CCED3EE729);
    /// Stream requests go through the UART write characteristic id
    pub const STREAMING_WRITE: Uuid = UART_WRITE;

    /// Generic Attribute service (16 bit UUID 0x1801)
    pub const GENERIC_ATTRIBUTE_SERVICE: Uuid = Uuid::from_u128(0x00001801_0000_1000_8000_00805F9B34FB);
    /// Alert Notification service (16 bit UUID 0x1811)
    pub const ALERT_NOTIFICATION_SERVICE: Uuid = Uuid::from_u128(0x00001811_0000_1000_8000_00805F9B34FB);
    /// Device Information service (16 bit UUID 0x180A)
    pub const DEVICE_INFORMATION_SERVICE: Uuid = Uuid::from_u128(0x0000180A_0000_1000_8000_00805F9B34FB);
    pub const MODEL_NUMBER: Uuid = Uuid::from_u128(0x00002A24_0000_1000_8000_00805F9B34FB);
    pub const MANUFACTURER: Uuid = Uuid::from_u128(0x00002A29_0000_1000_8000_00805F9B34FB);
}

/// Closed set of services a Leo may expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Uart,
    Ota,
    Streaming,
    GenericAttribute,
    AlertNotification,
    DeviceInformation,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 6] = [
        ServiceKind::Uart,
        ServiceKind::Ota,
        ServiceKind::Streaming,
        ServiceKind::GenericAttribute,
        ServiceKind::AlertNotification,
        ServiceKind::DeviceInformation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ServiceKind::Uart => "UART",
            ServiceKind::Ota => "OTA",
            ServiceKind::Streaming => "Streaming",
            ServiceKind::GenericAttribute => "BLE",
            ServiceKind::AlertNotification => "Alert Notification",
            ServiceKind::DeviceInformation => "Device Information",
        }
    }

    pub fn uuid(self) -> Uuid {
        match self {
            ServiceKind::Uart => uuids::UART_SERVICE,
            ServiceKind::Ota => uuids::OTA_SERVICE,
            ServiceKind::Streaming => uuids::STREAMING_SERVICE,
            ServiceKind::GenericAttribute => uuids::GENERIC_ATTRIBUTE_SERVICE,
            ServiceKind::AlertNotification => uuids::ALERT_NOTIFICATION_SERVICE,
            ServiceKind::DeviceInformation => uuids::DEVICE_INFORMATION_SERVICE,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.uuid() == uuid)
    }

    /// Whether notifications from `characteristic` should be subscribed to
    pub fn subscribes(self, characteristic: Uuid, notifiable: bool) -> bool {
        match self {
            ServiceKind::Uart => characteristic == uuids::UART_NOTIFY,
            ServiceKind::Ota | ServiceKind::Streaming => notifiable,
            _ => false,
        }
    }
}

/// State of the UART service shared with its notification handler
#[derive(Debug, Default)]
pub struct UartState {
    /// Set while a block transfer owns the UART, bytes then bypass line parsing
    pub binary_mode: AtomicBool,
    pub responses: ResponseChannel,
    pub bytes: ByteChannel,
}

impl UartState {
    pub fn set_binary_mode(&self, enabled: bool) {
        self.binary_mode.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.bytes.drain();
        }
    }

    fn on_notification(&self, data: &[u8]) {
        if self.binary_mode.load(Ordering::SeqCst) {
            self.bytes.extend(data);
            return;
        }
        // Each notification carries whole lines, the last one may lack CR LF
        let text = String::from_utf8_lossy(data);
        for line in text.split(['\r', '\n']).filter(|l| !l.is_empty()) {
            self.responses.consume(line);
        }
    }
}

/// Receiving ends of the per-service queues, held by the connection
#[derive(Debug)]
pub struct ServiceQueues {
    pub uart: Arc<UartState>,
    pub ota: Receiver<Vec<u8>>,
    pub streaming: Receiver<Vec<u8>>,
}

/// Dispatches notifications to the service that subscribed the characteristic.
///
/// Runs on the BLE worker, so routing only decodes and enqueues.
#[derive(Debug)]
pub struct NotificationRouter {
    routes: HashMap<Uuid, ServiceKind>,
    uart: Arc<UartState>,
    ota: Sender<Vec<u8>>,
    streaming: Sender<Vec<u8>>,
}

impl NotificationRouter {
    pub fn new() -> (Self, ServiceQueues) {
        let uart = Arc::new(UartState::default());
        let (ota_tx, ota_rx) = channel::unbounded();
        let (stream_tx, stream_rx) = channel::unbounded();
        let router = NotificationRouter {
            routes: HashMap::new(),
            uart: Arc::clone(&uart),
            ota: ota_tx,
            streaming: stream_tx,
        };
        let queues = ServiceQueues {
            uart,
            ota: ota_rx,
            streaming: stream_rx,
        };
        (router, queues)
    }

    pub fn add_route(&mut self, characteristic: Uuid, kind: ServiceKind) {
        debug!("Routing notifications of {} to {}", characteristic, kind.name());
        self.routes.insert(characteristic, kind);
    }

    pub fn route(&self, characteristic: Uuid, data: &[u8]) {
        match self.routes.get(&characteristic) {
            Some(ServiceKind::Uart) => self.uart.on_notification(data),
            Some(ServiceKind::Ota) => {
                let _ = self.ota.send(data.to_vec());
            }
            Some(ServiceKind::Streaming) => {
                let _ = self.streaming.send(data.to_vec());
            }
            Some(kind) => info!("[{}] {}", kind.name(), String::from_utf8_lossy(data)),
            None => warn!("Notification from unrouted characteristic {}: {:x?}", characteristic, data),
        }
    }
}

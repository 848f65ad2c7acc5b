//! Leo command set.
//!
//! Every command the firmware understands is one row of [`OPERATIONS`]: its
//! name, how many arguments it takes and what to do with them. Typed helpers
//! on [`Device`] are thin wrappers that run a row and convert its reply.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::dispatch::{Dispatcher, Reply, Shape, Value, format_command};
use crate::error::Result;
use crate::models::{ButtonData, ChargingMode, DeviceInfo, MeasurementData, PsuSw};
use crate::transport::Transport;

/// Default file range of `stream_range`, first inclusive, last exclusive
pub const STREAM_RANGE_DEFAULT: (u32, u32) = (2892, 3166);

/// What running an operation does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Send `wire` plus the arguments and wait for a line containing `expect`
    Query {
        wire: &'static str,
        expect: &'static str,
        shape: Shape,
    },
    /// Send `wire` plus the arguments, no reply expected
    Send { wire: &'static str },
    /// Block transfer of a local file
    Upload,
    /// Streaming retrieval of one file
    Stream,
    /// Streaming retrieval of numbered files
    StreamRange,
    /// Firmware update session
    Firmware,
    /// Re-enter the resolver with the arguments
    AppMsg,
    /// Gather a [`DeviceInfo`] snapshot
    Info,
}

/// One row of the command table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    pub action: Action,
}

impl Operation {
    pub fn accepts(&self, count: usize) -> bool {
        (self.min_args..=self.max_args).contains(&count)
    }
}

const fn query(name: &'static str, min_args: usize, max_args: usize, expect: &'static str, shape: Shape) -> Operation {
    Operation {
        name,
        min_args,
        max_args,
        action: Action::Query { wire: name, expect, shape },
    }
}

const fn app_query(name: &'static str, wire: &'static str, expect: &'static str, shape: Shape) -> Operation {
    Operation {
        name,
        min_args: 0,
        max_args: 1,
        action: Action::Query { wire, expect, shape },
    }
}

const fn send(name: &'static str, wire: &'static str, min_args: usize, max_args: usize) -> Operation {
    Operation {
        name,
        min_args,
        max_args,
        action: Action::Send { wire },
    }
}

const fn transfer(name: &'static str, min_args: usize, max_args: usize, action: Action) -> Operation {
    Operation {
        name,
        min_args,
        max_args,
        action,
    }
}

pub static OPERATIONS: &[Operation] = &[
    query("help", 0, 0, "Commands 1", Shape::Str),
    query("py_msg", 0, 0, "OK py_msg", Shape::Auto),
    query("version", 0, 0, "OK version", Shape::Str),
    query("swversion", 0, 0, "OK swversion", Shape::Str),
    query("status", 0, 0, "OK status", Shape::Str),
    query("serial", 0, 0, "OK serial", Shape::Str),
    query("mac", 0, 0, "OK mac", Shape::Str),
    query("button", 0, 0, "OK button", Shape::Button),
    query("hwversion", 0, 0, "OK hwversion", Shape::Float),
    transfer("py_ldx", 1, 1, Action::Upload),
    query("py_kill", 0, 0, "OK py_kill", Shape::Auto),
    query("py_update", 0, 0, "OK py_update", Shape::Auto),
    query("measure", 0, 0, "OK measure", Shape::Measurement),
    query("mwh", 0, 0, "OK mwh", Shape::Int),
    send("ls", "ls", 0, 1),
    send("rm", "rm", 1, 1),
    send("cat", "cat", 1, 1),
    query("chmode", 0, 1, "OK chmode", Shape::ChargingMode),
    query("script_stat", 0, 0, "OK script_stat", Shape::Auto),
    query("rgb", 4, 5, "OK rgb", Shape::Auto),
    query("eeval", 2, 3, "OK eeval", Shape::Auto),
    query("vbus", 1, 1, "OK vbus", Shape::Auto),
    query("cc5k", 1, 1, "OK cc5k", Shape::Auto),
    query("cc", 1, 1, "OK cc", Shape::Auto),
    query("cc_con", 0, 0, "OK cc_con", Shape::Auto),
    query("umux", 1, 1, "OK umux", Shape::Auto),
    query("resistor_36k", 1, 1, "OK resistor_36k", Shape::Auto),
    query("psu_sw", 1, 1, "OK psu_sw", Shape::PsuSw),
    query("sm", 1, 1, "OK sm", Shape::Auto),
    query("rf_off", 0, 0, "OK rf_off", Shape::Auto),
    query("ps", 0, 0, "OK ps", Shape::Str),
    query("reboot", 0, 0, "OK reboot", Shape::Auto),
    transfer("app_msg", 1, usize::MAX, Action::AppMsg),
    Operation {
        name: "soc",
        min_args: 1,
        max_args: 1,
        action: Action::Query {
            wire: "app_msg soc",
            expect: "OK app_msg soc",
            shape: Shape::Auto,
        },
    },
    send("limit", "app_msg limit", 4, 4),
    app_query(
        "led_time_before_dim",
        "app_msg led_time_before_dim",
        "OK app_msg led_time_before_dim",
        Shape::Int,
    ),
    send("script_ver", "app_msg script_ver", 0, 0),
    Operation {
        name: "get_files",
        min_args: 0,
        max_args: 0,
        action: Action::Query {
            wire: "app_msg get_files",
            expect: "OK app_msg get_files",
            shape: Shape::Auto,
        },
    },
    app_query("ghost_mode", "app_msg ghost_mode", "OK app_msg ghost_mode", Shape::Int),
    app_query("quiet_mode", "app_msg quiet_mode", "OK app_msg quiet_mode", Shape::Int),
    app_query("charge_limit", "app_msg charge_limit", "OK app_msg charge_limit", Shape::Int),
    transfer("stream", 2, 2, Action::Stream),
    transfer("stream_file", 2, 2, Action::Stream),
    transfer("stream_range", 0, 2, Action::StreamRange),
    transfer("ota", 1, 1, Action::Firmware),
    transfer("info", 0, 0, Action::Info),
];

/// Find an operation by name
pub fn lookup(name: &str) -> Option<&'static Operation> {
    OPERATIONS.iter().find(|op| op.name == name)
}

fn parse_arg<T: FromStr>(op: &Operation, arg: &str) -> Option<T> {
    match arg.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("⚠️ Invalid argument '{}' for '{}'", arg, op.name);
            None
        }
    }
}

/// A connected Leo
pub struct Device<T: Transport> {
    transport: T,
    dispatcher: Dispatcher,
}

impl<T: Transport> Device<T> {
    pub fn new(transport: T, command_timeout: Duration) -> Self {
        Device {
            transport,
            dispatcher: Dispatcher::new(command_timeout),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn disconnect(&mut self) {
        self.transport.disconnect();
    }

    /// Run an operation with already split arguments.
    ///
    /// `None` is the failure sentinel: bad arguments, no reply in time, or a
    /// failed transfer.
    pub fn execute<S: AsRef<str>>(&self, op: &Operation, args: &[S]) -> Option<Reply> {
        if !op.accepts(args.len()) {
            let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
            warn!("⚠️ Unknown parameters {:?} for '{}'", args, op.name);
            return None;
        }

        match op.action {
            Action::Query { wire, expect, shape } => {
                self.dispatcher
                    .query(&self.transport, &format_command(wire, args), expect, shape)
            }
            Action::Send { wire } => self
                .dispatcher
                .send(&self.transport, &format_command(wire, args))
                .then_some(Reply::Done),
            Action::Upload => {
                let path = Path::new(args[0].as_ref());
                self.transfer(op.name, || self.transport.upload(path))
            }
            Action::Stream => {
                let reference = parse_arg::<u32>(op, args[1].as_ref())?;
                self.stream(args[0].as_ref(), reference).then_some(Reply::Done)
            }
            Action::StreamRange => {
                let (mut first, mut last) = STREAM_RANGE_DEFAULT;
                if let Some(arg) = args.first() {
                    first = parse_arg(op, arg.as_ref())?;
                }
                if let Some(arg) = args.get(1) {
                    last = parse_arg(op, arg.as_ref())?;
                }
                let (ok, failed) = self.stream_range(first, last);
                Some(Reply::List(vec![Value::Int(ok as i64), Value::Int(failed as i64)]))
            }
            Action::Firmware => {
                let image = Path::new(args[0].as_ref());
                self.transfer(op.name, || self.transport.firmware_update(image))
            }
            Action::AppMsg => self.invoke(args[0].as_ref(), &args[1..]),
            Action::Info => Some(Reply::Text(self.device_info().to_string())),
        }
    }

    /// Run the operation `name` from the table
    pub fn call(&self, name: &str, args: &[&str]) -> Option<Reply> {
        match lookup(name) {
            Some(op) => self.execute(op, args),
            None => {
                warn!("⚠️ Unknown command '{}'", name);
                None
            }
        }
    }

    /// Send a line the table does not know, without waiting for a reply
    pub fn raw(&self, line: &str) -> bool {
        self.dispatcher.send(&self.transport, line)
    }

    fn transfer(&self, name: &str, f: impl FnOnce() -> Result<bool>) -> Option<Reply> {
        match self.dispatcher.exclusive(f) {
            Ok(true) => Some(Reply::Done),
            Ok(false) => None,
            Err(e) => {
                error!("❌ {} failed: {}", name, e);
                None
            }
        }
    }

    pub fn version(&self) -> Option<String> {
        self.call("version", &[])?.into_text()
    }

    pub fn swversion(&self) -> Option<String> {
        self.call("swversion", &[])?.into_text()
    }

    pub fn status(&self) -> Option<String> {
        self.call("status", &[])?.into_text()
    }

    pub fn serial(&self) -> Option<String> {
        self.call("serial", &[])?.into_text()
    }

    pub fn mac(&self) -> Option<String> {
        self.call("mac", &[])?.into_text()
    }

    pub fn hwversion(&self) -> Option<f64> {
        self.call("hwversion", &[])?.into_f64()
    }

    pub fn mwh(&self) -> Option<i64> {
        self.call("mwh", &[])?.into_i64()
    }

    pub fn measure(&self) -> Option<MeasurementData> {
        match self.call("measure", &[])? {
            Reply::Measurement(m) => Some(m),
            _ => None,
        }
    }

    pub fn button(&self) -> Option<ButtonData> {
        match self.call("button", &[])? {
            Reply::Button(b) => Some(b),
            _ => None,
        }
    }

    /// Read the charging mode, or set it when `mode` is given
    pub fn chmode(&self, mode: Option<ChargingMode>) -> Option<ChargingMode> {
        let arg = mode.map(|m| u8::from(m).to_string());
        match self.call("chmode", &arg.as_deref().into_iter().collect::<Vec<_>>())? {
            Reply::ChargingMode(mode) => Some(mode),
            _ => None,
        }
    }

    pub fn psu_sw(&self, state: PsuSw) -> bool {
        self.call("psu_sw", &[u8::from(state).to_string().as_str()]).is_some()
    }

    pub fn rgb(&self, led: u8, r: u8, g: u8, b: u8, fade_time_s: Option<u32>) -> bool {
        let fade = fade_time_s.map(|s| s.to_string()).unwrap_or_default();
        let args = [led.to_string(), r.to_string(), g.to_string(), b.to_string(), fade];
        let args: Vec<&str> = args.iter().map(String::as_str).filter(|a| !a.is_empty()).collect();
        self.call("rgb", &args).is_some()
    }

    pub fn reboot(&self) -> bool {
        self.call("reboot", &[]).is_some()
    }

    /// Read the ghost mode setting, or set it when `mode` is given
    pub fn ghost_mode(&self, mode: Option<i64>) -> Option<i64> {
        self.app_setting("ghost_mode", mode)
    }

    pub fn quiet_mode(&self, mode: Option<i64>) -> Option<i64> {
        self.app_setting("quiet_mode", mode)
    }

    pub fn charge_limit(&self, limit: Option<i64>) -> Option<i64> {
        self.app_setting("charge_limit", limit)
    }

    pub fn led_time_before_dim(&self, time_s: Option<i64>) -> Option<i64> {
        self.app_setting("led_time_before_dim", time_s)
    }

    fn app_setting(&self, name: &str, value: Option<i64>) -> Option<i64> {
        let arg = value.map(|v| v.to_string());
        self.call(name, &arg.as_deref().into_iter().collect::<Vec<_>>())?
            .into_i64()
    }

    /// First and last file number stored on the device
    pub fn get_files(&self) -> Option<(i64, i64)> {
        match self.call("get_files", &[])?.into_values().as_slice() {
            [first, last] => Some((first.as_i64()?, last.as_i64()?)),
            _ => None,
        }
    }

    /// Upload a script with the block transfer protocol
    pub fn py_ldx(&self, path: &Path) -> bool {
        self.transfer("py_ldx", || self.transport.upload(path)).is_some()
    }

    /// Retrieve `filename` from the device into a local file of the same name
    pub fn stream(&self, filename: &str, reference: u32) -> bool {
        self.transfer("stream", || self.transport.stream_to_file(Path::new(filename), reference))
            .is_some()
    }

    /// Retrieve `<n>.CSV` for every n in `first..last`, returning the
    /// success and failure counts
    pub fn stream_range(&self, first: u32, last: u32) -> (usize, usize) {
        let mut ok = 0;
        let mut failed = 0;
        for number in first..last {
            if self.stream(&format!("{}.CSV", number), number) {
                ok += 1;
            } else {
                failed += 1;
            }
        }
        info!("✅ Downloaded: {}", ok);
        info!("❌ Failed: {}", failed);
        (ok, failed)
    }

    /// Flash a firmware image over the air
    pub fn ota(&self, image: &Path) -> bool {
        self.transfer("ota", || self.transport.firmware_update(image)).is_some()
    }

    /// Query every informational command, leaving out what did not answer
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            serial: self.serial(),
            mac: self.mac(),
            version: self.version(),
            sw_version: self.swversion(),
            hw_version: self.hwversion(),
            status: self.status(),
        }
    }
}

//! Command/response correlation.
//!
//! The device answers a command with one or more lines on the shared
//! Response Channel, the interesting one starting with a known prefix such as
//! `OK version`. The dispatcher drains stale lines, sends the command, waits
//! for that prefix and types whatever follows it.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::models::{ButtonData, ChargingMode, MeasurementData, PsuSw};
use crate::transport::Transport;

/// One whitespace separated token of a reply
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Opportunistic cast: float if it has a dot, else integer, else text
    pub fn cast(token: &str) -> Value {
        let parsed = if token.contains('.') {
            token.parse().map(Value::Float).ok()
        } else {
            token.parse().map(Value::Int).ok()
        };
        parsed.unwrap_or_else(|| Value::Text(token.trim().to_string()))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
        }
    }
}

/// Requested type of a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// A single value, or a list when several tokens came back
    Auto,
    Int,
    Float,
    Str,
    Measurement,
    Button,
    ChargingMode,
    PsuSw,
}

/// Typed reply of a command
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The matching line carried nothing after its prefix
    Done,
    Value(Value),
    List(Vec<Value>),
    /// Unparsed remainder, for scalar shapes that got several tokens
    Text(String),
    Measurement(MeasurementData),
    Button(ButtonData),
    ChargingMode(ChargingMode),
    PsuSw(PsuSw),
}

impl Reply {
    pub fn into_text(self) -> Option<String> {
        match self {
            Reply::Text(text) => Some(text),
            Reply::Value(value) => Some(value.to_string()),
            Reply::List(values) => Some(values.iter().map(Value::to_string).collect::<Vec<_>>().join(" ")),
            _ => None,
        }
    }

    pub fn into_i64(self) -> Option<i64> {
        match self {
            Reply::Value(value) => value.as_i64(),
            _ => None,
        }
    }

    pub fn into_f64(self) -> Option<f64> {
        match self {
            Reply::Value(value) => value.as_f64(),
            _ => None,
        }
    }

    pub fn into_values(self) -> Vec<Value> {
        match self {
            Reply::Value(value) => vec![value],
            Reply::List(values) => values,
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Done => write!(f, "ok"),
            Reply::Value(v) => write!(f, "{}", v),
            Reply::List(values) => {
                let parts: Vec<String> = values.iter().map(Value::to_string).collect();
                write!(f, "{}", parts.join(" "))
            }
            Reply::Text(text) => write!(f, "{}", text),
            Reply::Measurement(m) => write!(f, "{:?}", m),
            Reply::Button(b) => write!(f, "{:?}", b),
            Reply::ChargingMode(mode) => write!(f, "{:?}", mode),
            Reply::PsuSw(state) => write!(f, "{:?}", state),
        }
    }
}

/// Type the text that followed a reply prefix.
///
/// Returns `None` when the tokens do not fit the requested shape.
pub fn parse_reply(reply: &str, shape: Shape) -> Option<Reply> {
    let reply = reply.trim();
    if reply.is_empty() {
        return Some(Reply::Done);
    }
    let mut values: Vec<Value> = reply.split_whitespace().map(Value::cast).collect();
    debug!(?values, "parsed reply");

    match shape {
        Shape::Auto if values.len() == 1 => values.pop().map(Reply::Value),
        Shape::Auto => Some(Reply::List(values)),
        Shape::Int | Shape::Float | Shape::Str if values.len() != 1 => Some(Reply::Text(reply.to_string())),
        Shape::Int => reply.parse().ok().map(|v| Reply::Value(Value::Int(v))),
        Shape::Float => reply.parse().ok().map(|v| Reply::Value(Value::Float(v))),
        Shape::Str => Some(Reply::Text(reply.to_string())),
        Shape::Measurement => MeasurementData::from_values(&values).map(Reply::Measurement),
        Shape::Button => ButtonData::from_values(&values).map(Reply::Button),
        Shape::ChargingMode => {
            let first = values.first()?;
            let mode = match first.as_i64() {
                Some(n) => u8::try_from(n).ok().and_then(|n| ChargingMode::try_from(n).ok()),
                None => first.to_string().parse::<ChargingMode>().ok(),
            };
            mode.map(Reply::ChargingMode)
        }
        Shape::PsuSw => {
            let first = values.first()?;
            let state = match first.as_i64() {
                Some(n) => u8::try_from(n).ok().and_then(|n| PsuSw::try_from(n).ok()),
                None => first.to_string().parse::<PsuSw>().ok(),
            };
            state.map(Reply::PsuSw)
        }
    }
}

/// Find `expect` in `line` and return what follows it.
///
/// The match must not run on into a longer name: `OK cc` accepts `OK cc 1`
/// and `Commands 1:` but not `OK cc_con 1`.
pub fn match_reply<'a>(line: &'a str, expect: &str) -> Option<&'a str> {
    if expect.is_empty() {
        return Some(line);
    }
    let mut search = 0;
    while let Some(pos) = line[search..].find(expect) {
        let end = search + pos + expect.len();
        let rest = &line[end..];
        if !rest.starts_with(|c: char| c.is_alphanumeric() || c == '_') {
            return Some(rest);
        }
        search = end;
    }
    None
}

/// Join a verb and its present arguments into a wire command
pub fn format_command<S: AsRef<str>>(verb: &str, args: &[S]) -> String {
    std::iter::once(verb)
        .chain(args.iter().map(|arg| arg.as_ref()))
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Sends commands and correlates their replies.
///
/// Only one command may await a reply per connection: the gate is held from
/// draining stale lines until the reply is matched or the wait times out, so
/// concurrent callers queue up instead of stealing each other's replies.
#[derive(Debug)]
pub struct Dispatcher {
    gate: Mutex<()>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(timeout: Duration) -> Self {
        Dispatcher {
            gate: Mutex::new(()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `command` and wait for a line containing `expect`.
    ///
    /// `None` on timeout, on a reply that does not fit `shape`, or when the
    /// command could not be written.
    pub fn query<T: Transport + ?Sized>(&self, transport: &T, command: &str, expect: &str, shape: Shape) -> Option<Reply> {
        self.query_with_timeout(transport, command, expect, shape, self.timeout)
    }

    pub fn query_with_timeout<T: Transport + ?Sized>(
        &self,
        transport: &T,
        command: &str,
        expect: &str,
        shape: Shape,
        timeout: Duration,
    ) -> Option<Reply> {
        let verb = command.split_whitespace().next().unwrap_or(command);
        let _gate = self.gate.lock();

        let responses = transport.responses();
        responses.drain();

        if let Err(e) = transport.send_command(command) {
            warn!("Failed to send '{}': {}", command, e);
            return None;
        }

        let deadline = Instant::now() + timeout;
        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(line) = responses.recv_timeout(remaining) else {
                warn!("No response matching '{}' to {} within {:.1} seconds.", expect, verb, timeout.as_secs_f64());
                break None;
            };
            let Some(rest) = match_reply(&line, expect) else {
                continue;
            };
            let parsed = parse_reply(rest, shape);
            if parsed.is_none() {
                warn!("⚠️ Reply '{}' to {} does not fit {:?}", line, verb, shape);
            }
            break parsed;
        };

        match &result {
            Some(reply) => info!("{} -> '{}'", verb, reply),
            None => info!("{} -> no result", verb),
        }
        result
    }

    /// Run `f` with the gate held, for transfers that own the link for a while
    pub fn exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        let _gate = self.gate.lock();
        f()
    }

    /// Send a command that expects no reply
    pub fn send<T: Transport + ?Sized>(&self, transport: &T, command: &str) -> bool {
        let _gate = self.gate.lock();
        match transport.send_command(command) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send '{}': {}", command, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport_mock::MockTransport;

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn test_cast() {
        assert_eq!(Value::cast("25"), Value::Int(25));
        assert_eq!(Value::cast("-1"), Value::Int(-1));
        assert_eq!(Value::cast("4.1"), Value::Float(4.1));
        assert_eq!(Value::cast("v1.5.22"), Value::Text("v1.5.22".into()));
    }

    #[test]
    fn test_parse_empty_is_done() {
        assert_eq!(parse_reply("  ", Shape::Int), Some(Reply::Done));
    }

    #[test]
    fn test_parse_scalars() {
        assert_eq!(parse_reply("2.3", Shape::Str), Some(Reply::Text("2.3".into())));
        assert_eq!(parse_reply("1.5", Shape::Float), Some(Reply::Value(Value::Float(1.5))));
        assert_eq!(parse_reply("1200", Shape::Int), Some(Reply::Value(Value::Int(1200))));
        assert_eq!(parse_reply("abc", Shape::Int), None);
        assert_eq!(parse_reply("charging idle", Shape::Str), Some(Reply::Text("charging idle".into())));
    }

    #[test]
    fn test_parse_auto() {
        assert_eq!(parse_reply("7", Shape::Auto), Some(Reply::Value(Value::Int(7))));
        assert_eq!(
            parse_reply("2892 3166", Shape::Auto),
            Some(Reply::List(vec![Value::Int(2892), Value::Int(3166)]))
        );
    }

    #[test]
    fn test_parse_measurement() {
        let reply = parse_reply("4.1 4.0 1.2 3.3 3.2 3.1 3.0 25 1 0", Shape::Measurement).unwrap();
        let Reply::Measurement(m) = reply else {
            panic!("expected a measurement");
        };
        assert_eq!(m.vbus_a, 4.1);
        assert_eq!(m.vbus_b, 4.0);
        assert_eq!(m.current, 1.2);
        assert_eq!(m.vcc1_a, 3.3);
        assert_eq!(m.vcc2_a, 3.2);
        assert_eq!(m.vcc1_b, 3.1);
        assert_eq!(m.vcc2_b, 3.0);
        assert_eq!(m.temperature, 25.0);
        assert_eq!(m.charge_mode, 1);
        assert_eq!(m.py_msg, 0);
    }

    #[test]
    fn test_parse_measurement_wrong_arity() {
        assert_eq!(parse_reply("4.1 4.0 1.2", Shape::Measurement), None);
    }

    #[test]
    fn test_parse_enumerations() {
        assert_eq!(parse_reply("2", Shape::ChargingMode), Some(Reply::ChargingMode(ChargingMode::Safe)));
        assert_eq!(parse_reply("ghost", Shape::ChargingMode), Some(Reply::ChargingMode(ChargingMode::Ghost)));
        assert_eq!(parse_reply("9", Shape::ChargingMode), None);
        assert_eq!(parse_reply("1", Shape::PsuSw), Some(Reply::PsuSw(PsuSw::AOn)));
    }

    #[test]
    fn test_match_reply_word_boundary() {
        assert_eq!(match_reply("OK cc 1", "OK cc"), Some(" 1"));
        assert_eq!(match_reply("OK cc_con 1", "OK cc"), None);
        assert_eq!(match_reply("#OK version 2.3", "OK version"), Some(" 2.3"));
        assert_eq!(match_reply("OK reboot", "OK reboot"), Some(""));
        assert_eq!(match_reply("anything", ""), Some("anything"));
        assert_eq!(match_reply("Commands 1: help version", "Commands 1"), Some(": help version"));
        assert_eq!(match_reply("Commands 1/3", "Commands 1"), Some("/3"));
        assert_eq!(match_reply("Commands 12", "Commands 1"), None);
    }

    #[test]
    fn test_format_command_skips_missing_args() {
        assert_eq!(format_command("chmode", &[] as &[&str]), "chmode");
        assert_eq!(format_command("rgb", &["1", "255", "0", "0", ""]), "rgb 1 255 0 0");
        assert_eq!(format_command("app_msg ghost_mode", &["1"]), "app_msg ghost_mode 1");
    }

    #[test]
    fn test_query_round_trip() {
        let transport = MockTransport::new();
        transport.reply_to("version", &["version", "OK version 2.3"]);
        let dispatcher = Dispatcher::new(SHORT);
        let reply = dispatcher.query(&transport, "version", "OK version", Shape::Str);
        assert_eq!(reply.and_then(Reply::into_text).as_deref(), Some("2.3"));
        assert_eq!(transport.commands(), vec!["version".to_string()]);
    }

    #[test]
    fn test_query_timeout_leaves_channel_empty() {
        let transport = MockTransport::new();
        transport.reply_to("mwh", &["unrelated", "OK mac 00:11"]);
        let dispatcher = Dispatcher::new(SHORT);
        assert_eq!(dispatcher.query(&transport, "mwh", "OK mwh", Shape::Int), None);
        assert!(transport.responses().is_empty());
    }

    #[test]
    fn test_query_drains_stale_lines() {
        let transport = MockTransport::new();
        transport.responses().consume("OK version 0.1");
        transport.reply_to("version", &["OK version 2.3"]);
        let dispatcher = Dispatcher::new(SHORT);
        let reply = dispatcher.query(&transport, "version", "OK version", Shape::Str);
        assert_eq!(reply, Some(Reply::Text("2.3".into())));
    }

    #[test]
    fn test_query_empty_remainder_is_success() {
        let transport = MockTransport::new();
        transport.reply_to("reboot", &["OK reboot"]);
        let dispatcher = Dispatcher::new(SHORT);
        assert_eq!(dispatcher.query(&transport, "reboot", "OK reboot", Shape::Auto), Some(Reply::Done));
    }

    #[test]
    fn test_query_send_failure_is_sentinel() {
        let transport = MockTransport::new();
        transport.set_connected(false);
        let dispatcher = Dispatcher::new(SHORT);
        assert_eq!(dispatcher.query(&transport, "status", "OK status", Shape::Str), None);
    }

    #[test]
    fn test_concurrent_queries_do_not_cross_talk() {
        let transport = std::sync::Arc::new(MockTransport::new());
        transport.reply_to("serial", &["OK serial O3HBOR0BO"]);
        transport.reply_to("mac", &["OK mac 00:11:22:33:44:55"]);
        let dispatcher = std::sync::Arc::new(Dispatcher::new(Duration::from_secs(1)));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let transport = std::sync::Arc::clone(&transport);
                let dispatcher = std::sync::Arc::clone(&dispatcher);
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        let reply = dispatcher.query(&*transport, "serial", "OK serial", Shape::Str);
                        assert_eq!(reply, Some(Reply::Text("O3HBOR0BO".into())));
                    } else {
                        let reply = dispatcher.query(&*transport, "mac", "OK mac", Shape::Str);
                        assert_eq!(reply, Some(Reply::Text("00:11:22:33:44:55".into())));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}

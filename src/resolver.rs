//! Maps loosely typed command phrases onto the operation table.
//!
//! `get all files` and `get files` both end up at `get_files`, `app_msg
//! ghost_mode 1` at `ghost_mode 1`. Anything that still does not resolve is
//! sent to the device as typed.

use tracing::{debug, warn};

use crate::device::{Device, Operation, lookup};
use crate::dispatch::{Reply, format_command};
use crate::transport::Transport;

/// Outcome of resolving a phrase
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Run this operation with these arguments
    Operation(&'static Operation, Vec<String>),
    /// Nothing matched, send the line verbatim
    Raw(String),
}

fn accepting(name: &str, args: &[&str]) -> Option<Resolution> {
    let op = lookup(name)?;
    if !op.accepts(args.len()) {
        debug!("'{}' does not take {} arguments", name, args.len());
        return None;
    }
    let args = args.iter().map(|a| a.to_string()).collect();
    Some(Resolution::Operation(op, args))
}

/// Resolve `verb` and `args`, trying in order:
///
/// 1. `verb` itself with all arguments
/// 2. `verb_arg1_arg2...` with no arguments
/// 3. `verb_arg` when there is exactly one argument
/// 4. `verb_last` when the first of several arguments is `all`
/// 5. `verb_first` with the remaining arguments
pub fn resolve<S: AsRef<str>>(verb: &str, args: &[S]) -> Resolution {
    let verb = verb.trim();
    let args: Vec<&str> = args.iter().map(|a| a.as_ref().trim()).filter(|a| !a.is_empty()).collect();

    if let Some(op) = lookup(verb) {
        if op.accepts(args.len()) {
            return Resolution::Operation(op, args.iter().map(|a| a.to_string()).collect());
        }
        warn!("⚠️ Unknown parameters {:?} for '{}'", args, verb);
    }

    if let [first, rest @ ..] = args.as_slice() {
        let joined = format!("{}_{}", verb, args.join("_"));
        if let Some(found) = accepting(&joined, &[]) {
            return found;
        }

        if rest.is_empty() {
            if let Some(found) = accepting(&format!("{}_{}", verb, first), &[]) {
                return found;
            }
        }

        if let Some(last) = rest.last() {
            if first.eq_ignore_ascii_case("all") {
                if let Some(found) = accepting(&format!("{}_{}", verb, last), &[]) {
                    return found;
                }
            }
            if let Some(found) = accepting(&format!("{}_{}", verb, first), rest) {
                return found;
            }
        }
    }

    Resolution::Raw(format_command(verb, &args))
}

impl<T: Transport> Device<T> {
    /// Run a loosely typed command phrase.
    ///
    /// Unresolved phrases are sent verbatim and yield `None`.
    pub fn invoke<S: AsRef<str>>(&self, verb: &str, args: &[S]) -> Option<Reply> {
        match resolve(verb, args) {
            Resolution::Operation(op, args) => self.execute(op, &args),
            Resolution::Raw(line) => {
                warn!("⚠️ Unknown command '{}'", verb);
                self.raw(&line);
                None
            }
        }
    }

    /// Split a typed line and [`invoke`](Self::invoke) it
    pub fn invoke_line(&self, line: &str) -> Option<Reply> {
        let mut tokens = line.split_whitespace();
        let verb = tokens.next()?;
        let args: Vec<&str> = tokens.collect();
        self.invoke(verb, &args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport_mock::MockTransport;
    use std::time::Duration;

    fn name_of(resolution: &Resolution) -> Option<(&'static str, Vec<String>)> {
        match resolution {
            Resolution::Operation(op, args) => Some((op.name, args.clone())),
            Resolution::Raw(_) => None,
        }
    }

    #[test]
    fn test_exact_verb() {
        assert_eq!(name_of(&resolve("chmode", &["1"])), Some(("chmode", vec!["1".to_string()])));
        assert_eq!(name_of(&resolve("version", &[] as &[&str])), Some(("version", vec![])));
    }

    #[test]
    fn test_get_all_files_matches_get_files() {
        assert_eq!(name_of(&resolve("get", &["all", "files"])), Some(("get_files", vec![])));
        assert_eq!(name_of(&resolve("get", &["files"])), Some(("get_files", vec![])));
    }

    #[test]
    fn test_joined_words() {
        assert_eq!(name_of(&resolve("script", &["ver"])), Some(("script_ver", vec![])));
        assert_eq!(
            name_of(&resolve("led", &["time", "before", "dim"])),
            Some(("led_time_before_dim", vec![]))
        );
    }

    #[test]
    fn test_verb_and_first_word_keep_rest() {
        assert_eq!(
            name_of(&resolve("ghost", &["mode", "1"])),
            Some(("ghost_mode", vec!["1".to_string()]))
        );
        assert_eq!(
            name_of(&resolve("stream", &["file", "725.CSV", "725"])),
            Some(("stream_file", vec!["725.CSV".to_string(), "725".to_string()]))
        );
    }

    #[test]
    fn test_arity_mismatch_falls_through() {
        // `stream` takes two arguments, `stream_range` takes these
        assert_eq!(
            name_of(&resolve("stream", &["range", "1", "5"])),
            Some(("stream_range", vec!["1".to_string(), "5".to_string()]))
        );
    }

    #[test]
    fn test_unknown_is_raw() {
        assert_eq!(resolve("frobnicate", &["a", "b"]), Resolution::Raw("frobnicate a b".into()));
        assert_eq!(resolve("vbus", &[] as &[&str]), Resolution::Raw("vbus".into()));
    }

    #[test]
    fn test_invoke_resolves_like_direct_call() {
        let device = Device::new(MockTransport::new(), Duration::from_millis(50));
        device
            .transport()
            .reply_to("app_msg get_files", &["OK app_msg get_files 2892 3166"]);
        let direct = device.call("get_files", &[]);
        let invoked = device.invoke("get", &["all", "files"]);
        assert_eq!(direct, invoked);
        assert!(invoked.is_some());
        assert_eq!(
            device.transport().commands(),
            vec!["app_msg get_files", "app_msg get_files"]
        );
    }

    #[test]
    fn test_app_msg_reenters_resolver() {
        let device = Device::new(MockTransport::new(), Duration::from_millis(50));
        device
            .transport()
            .reply_to("app_msg quiet_mode 0", &["OK app_msg quiet_mode 0"]);
        let reply = device.invoke_line("app_msg quiet_mode 0");
        assert_eq!(reply.and_then(Reply::into_i64), Some(0));
    }

    #[test]
    fn test_raw_passthrough_is_sent() {
        let device = Device::new(MockTransport::new(), Duration::from_millis(50));
        assert_eq!(device.invoke_line("selftest now"), None);
        assert_eq!(device.transport().commands(), vec!["selftest now"]);
    }
}

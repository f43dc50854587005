//! Monitor commands tunnelled through `qRcmd`.

use std::fmt;
use std::time::Duration;

use tracing::debug;

use super::ProbeSession;
use crate::error::SessionError;
use crate::events::{ProbeEvent, ProbeObserver};
use crate::protocol::Reply;
use crate::protocol::constants::{
    BANNER_BLACK_MAGIC, BANNER_WIRELESS, MON_HELP, MON_PART_ID, MON_VERSION, MONITOR_PREFIX,
    PART_ID_MARKER,
};
use crate::state::SessionState;

/// Separator between a command and its description in `help` output.
const HELP_SEPARATOR: &str = " -- ";

/// Probe family identified by its version banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    BlackMagic,
    WirelessDebug,
    Unknown,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::BlackMagic => write!(f, "{}", BANNER_BLACK_MAGIC),
            ProbeKind::WirelessDebug => write!(f, "{}", BANNER_WIRELESS),
            ProbeKind::Unknown => write!(f, "Unknown probe"),
        }
    }
}

/// Console output of one monitor command.
pub(super) struct MonitorOutput {
    /// The command ended with `OK`.
    pub ok: bool,
    /// Newline-terminated lines, without the terminator.
    pub lines: Vec<String>,
    /// Text after the last newline.
    pub tail: Option<String>,
}

/// Joins console fragments into lines.
#[derive(Debug, Default)]
pub(super) struct ConsoleLines {
    partial: String,
}

impl ConsoleLines {
    /// Add a fragment; returns the lines it completed.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.partial.push_str(text);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    /// Whatever is left without a newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        (!rest.trim().is_empty()).then_some(rest)
    }
}

impl<O: ProbeObserver + 'static> ProbeSession<O> {
    /// Send `qRcmd,<command>` and collect console output up to the final
    /// reply. Does not check the session state.
    pub(super) fn monitor_exchange(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<MonitorOutput, SessionError> {
        let mut payload = MONITOR_PREFIX.as_bytes().to_vec();
        payload.extend_from_slice(command.as_bytes());
        self.send_command(&payload)?;

        let mut console = ConsoleLines::default();
        let mut lines = Vec::new();
        let ok = loop {
            match self.next_reply(timeout)? {
                Some(Reply::Console(text)) => {
                    for line in console.push(&text) {
                        if !line.trim().is_empty() {
                            self.emit(ProbeEvent::Console { text: line.clone() });
                        }
                        lines.push(line);
                    }
                }
                Some(Reply::Ok) => break true,
                Some(other) => {
                    debug!(command, reply = ?other, "Monitor command refused");
                    break false;
                }
                None => {
                    debug!(command, "Monitor command timed out");
                    break false;
                }
            }
        };

        let tail = console.finish();
        if let Some(text) = &tail {
            self.emit(ProbeEvent::Console { text: text.clone() });
        }
        Ok(MonitorOutput { ok, lines, tail })
    }

    /// Run a monitor command; succeeds only on a final `OK`.
    pub fn monitor(&mut self, command: &str) -> Result<(), SessionError> {
        self.monitor_output(command).map(|_| ())
    }

    /// Run a monitor command and return its console lines.
    pub fn monitor_output(&mut self, command: &str) -> Result<Vec<String>, SessionError> {
        self.reported(|s| {
            s.state.require(SessionState::Connected, "monitor")?;
            let timeout = s.config.reply_timeout();
            let output = s.monitor_exchange(command, timeout)?;
            if !output.ok {
                return Err(SessionError::MonitorFailed {
                    command: command.to_string(),
                });
            }
            let mut lines = output.lines;
            lines.extend(output.tail);
            Ok(lines)
        })
    }

    /// Identify the probe from its version banner.
    pub fn check_version_string(&mut self) -> ProbeKind {
        let first_line = self.first_console_line(MON_VERSION);
        let kind = first_line
            .as_deref()
            .map(probe_kind)
            .unwrap_or(ProbeKind::Unknown);
        debug!(kind = %kind, "Probe identified");
        kind
    }

    /// Target part id reported by `monitor partid`.
    pub fn part_id(&mut self) -> Option<u32> {
        if !self.state.is_connected() {
            return None;
        }
        let timeout = self.config.reply_timeout();
        let output = self.monitor_exchange(MON_PART_ID, timeout).ok()?;
        output
            .lines
            .iter()
            .chain(output.tail.iter())
            .find_map(|line| parse_part_id(line))
    }

    /// Sorted, space-separated list of the probe's monitor commands.
    pub fn list_monitor_commands(&mut self) -> Result<String, SessionError> {
        if let Some(list) = &self.monitor_commands {
            return Ok(list.clone());
        }
        let list = self.reported(|s| {
            s.state.require(SessionState::Connected, "list_monitor_commands")?;
            let timeout = s.config.reply_timeout();
            let output = s.monitor_exchange(MON_HELP, timeout)?;
            if !output.ok {
                return Err(SessionError::MonitorFailed {
                    command: MON_HELP.to_string(),
                });
            }
            Ok(help_commands(&output.lines))
        })?;
        self.monitor_commands = Some(list.clone());
        Ok(list)
    }

    /// True if `name` is one of the probe's monitor commands.
    pub fn has_command(&mut self, name: &str) -> Result<bool, SessionError> {
        let list = self.list_monitor_commands()?;
        Ok(list.split_whitespace().any(|token| token == name))
    }

    /// Resolve an abbreviated monitor command.
    pub fn expand_command(&mut self, prefix: &str) -> Result<Option<String>, SessionError> {
        let list = self.list_monitor_commands()?;
        Ok(expand_in(&list, prefix))
    }

    fn first_console_line(&mut self, command: &str) -> Option<String> {
        if !self.state.is_connected() {
            return None;
        }
        let timeout = self.config.reply_timeout();
        let output = self.monitor_exchange(command, timeout).ok()?;
        output
            .lines
            .into_iter()
            .chain(output.tail)
            .find(|line| !line.trim().is_empty())
    }
}

fn probe_kind(banner: &str) -> ProbeKind {
    let banner = banner.trim_start();
    if banner.starts_with(BANNER_BLACK_MAGIC) {
        ProbeKind::BlackMagic
    } else if banner.starts_with(BANNER_WIRELESS) {
        ProbeKind::WirelessDebug
    } else {
        ProbeKind::Unknown
    }
}

fn parse_part_id(line: &str) -> Option<u32> {
    let pos = line.find(PART_ID_MARKER)?;
    let value = line[pos + PART_ID_MARKER.len()..].trim_start();
    let value = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let digits: String = value.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
    u32::from_str_radix(&digits, 16).ok()
}

/// Command names from `help` output: the first token of each line that has
/// a description, de-duplicated and sorted.
fn help_commands(lines: &[String]) -> String {
    let mut commands: Vec<&str> = lines
        .iter()
        .filter_map(|line| line.split_once(HELP_SEPARATOR))
        .filter_map(|(head, _)| head.split_whitespace().next())
        .collect();
    commands.sort();
    commands.dedup();
    commands.join(" ")
}

/// An exact token wins; otherwise the only token starting with `prefix`.
fn expand_in(list: &str, prefix: &str) -> Option<String> {
    if prefix.is_empty() {
        return None;
    }
    if list.split_whitespace().any(|token| token == prefix) {
        return Some(prefix.to_string());
    }
    let mut matches = list
        .split_whitespace()
        .filter(|token| token.starts_with(prefix));
    match (matches.next(), matches.next()) {
        (Some(only), None) => Some(only.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_console_lines_reassemble_fragments() {
        let mut console = ConsoleLines::default();
        assert!(console.push("Black Magic ").is_empty());
        assert_eq!(console.push("Probe v2.0\r\nCopy"), vec!["Black Magic Probe v2.0"]);
        assert_eq!(console.push("right\n"), vec!["Copyright"]);
        assert_eq!(console.finish(), None);
        console.push("dangling");
        assert_eq!(console.finish(), Some("dangling".to_string()));
    }

    #[test]
    fn test_probe_kind() {
        assert_eq!(probe_kind("Black Magic Probe v1.10.0"), ProbeKind::BlackMagic);
        assert_eq!(probe_kind("Wireless Debug Probe 0.3"), ProbeKind::WirelessDebug);
        assert_eq!(probe_kind("J-Link"), ProbeKind::Unknown);
    }

    #[test]
    fn test_parse_part_id() {
        assert_eq!(parse_part_id("Part ID: 0x00000413"), Some(0x413));
        assert_eq!(parse_part_id("Part ID:1B"), Some(0x1b));
        assert_eq!(parse_part_id("no id here"), None);
    }

    #[test]
    fn test_help_commands_sorted() {
        let lines = [
            "General commands:".to_string(),
            "\treset -- reset target".to_string(),
            "\tversion -- show version".to_string(),
            "\tjtag_scan -- scan".to_string(),
            "\treset -- duplicate".to_string(),
        ];
        assert_eq!(help_commands(&lines), "jtag_scan reset version");
    }

    #[test]
    fn test_expand_in() {
        let list = "erase_mass jtag_scan reset rst swdp_scan";
        assert_eq!(expand_in(list, "jtag"), Some("jtag_scan".to_string()));
        assert_eq!(expand_in(list, "reset"), Some("reset".to_string()));
        // "r" matches both reset and rst
        assert_eq!(expand_in(list, "r"), None);
        // never a substring match
        assert_eq!(expand_in(list, "scan"), None);
        assert_eq!(expand_in(list, ""), None);
    }
}

//! Probe session - connection lifecycle and target discovery.
//!
//! A [`ProbeSession`] owns the one active link to a probe and walks the
//! `Disconnected -> Connected -> Attached` state machine. Monitor commands,
//! the flash pipeline and raw memory access live in the submodules and
//! extend the same type.

mod config;
mod flash;
mod memory;
mod monitor;

pub use config::SessionConfig;
pub use flash::{chunk_limit, write_chunk_len};
pub use monitor::ProbeKind;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::error::SessionError;
use crate::events::{ProbeEvent, ProbeObserver, TracingObserver};
use crate::link::{LinkError, RspLink};
use crate::protocol::Reply;
use crate::protocol::constants::{
    ATTACH, CACHE_MARGIN, CONTINUE, DEFAULT_GDB_PORT, DEFAULT_PACKET_SIZE, DETACH, EXTENDED_MODE,
    INTERRUPT, MEMORY_MAP_READ, MON_POWER_OFF, MON_POWER_ON, MON_SCAN, MON_VERSION,
    POWER_THRESHOLD, QUERY_SUPPORTED, RUN,
};
use crate::protocol::memory_map::parse_memory_map;
use crate::script::{self, ScriptSource};
use crate::state::{FlashMap, SessionState};
use crate::transport::{
    ByteTransport, ObservableTransport, SerialTransport, TcpTransport, TransportKind,
};

/// DTR low time when kicking a silent serial probe.
const DTR_PULSE: Duration = Duration::from_millis(200);
/// Settle time after enabling target power.
const POWER_SETTLE: Duration = Duration::from_millis(100);
const EXTENDED_MODE_ATTEMPTS: u32 = 3;
const EXTENDED_MODE_RETRY: Duration = Duration::from_millis(200);

/// Where the probe is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// Local probe on a serial port.
    Serial(String),
    /// Networked probe's GDB server.
    Network(SocketAddr),
}

impl ProbeTarget {
    /// Parse an address. An IP address (with or without port) selects the
    /// network; anything else is taken as a serial port name.
    pub fn parse(text: &str, default_port: u16) -> Result<Self, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::PortAccess {
                target: String::new(),
                message: "empty probe address".to_string(),
            });
        }
        if let Ok(addr) = text.parse::<SocketAddr>() {
            return Ok(ProbeTarget::Network(addr));
        }
        if let Ok(ip) = text.parse::<IpAddr>() {
            return Ok(ProbeTarget::Network(SocketAddr::new(ip, default_port)));
        }
        Ok(ProbeTarget::Serial(text.to_string()))
    }
}

impl FromStr for ProbeTarget {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, DEFAULT_GDB_PORT)
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeTarget::Serial(port) => write!(f, "{}", port),
            ProbeTarget::Network(addr) => write!(f, "{}", addr),
        }
    }
}

/// What the last scan found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetInfo {
    pub family: Option<String>,
    pub architecture: Option<String>,
    /// Target voltage reported by the scan.
    pub voltage: Option<f32>,
}

/// Probe session - owns the link and all per-probe state.
pub struct ProbeSession<O: ProbeObserver> {
    config: SessionConfig,
    observer: Arc<O>,
    link: Option<RspLink>,
    target: Option<ProbeTarget>,
    state: SessionState,
    packet_size: usize,
    monitor_commands: Option<String>,
    flash: FlashMap,
    target_info: TargetInfo,
}

impl ProbeSession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: ProbeObserver + 'static> ProbeSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            config,
            observer,
            link: None,
            target: None,
            state: SessionState::Disconnected,
            packet_size: DEFAULT_PACKET_SIZE,
            monitor_commands: None,
            flash: FlashMap::new(),
            target_info: TargetInfo::default(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Target of the current connection; `None` for a caller-supplied
    /// transport.
    pub fn target(&self) -> Option<&ProbeTarget> {
        self.target.as_ref()
    }

    /// Negotiated maximum packet size.
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn flash_map(&self) -> &FlashMap {
        &self.flash
    }

    pub fn target_info(&self) -> &TargetInfo {
        &self.target_info
    }

    /// Receive cache capacity of the active link.
    pub fn cache_capacity(&self) -> Option<usize> {
        self.link.as_ref().map(RspLink::capacity)
    }

    /// `(lowest address, highest end address)` over all flash regions.
    pub fn flash_total(&self) -> Option<(u32, u32)> {
        self.flash.total()
    }

    /// Open the probe at `target` and negotiate the link.
    #[instrument(skip(self, target), fields(probe = %target))]
    pub fn connect(&mut self, target: &ProbeTarget) -> Result<(), SessionError> {
        if self.state.is_connected() && self.target.as_ref() == Some(target) {
            debug!("Already connected");
            return Ok(());
        }
        self.reported(|s| s.connect_inner(target))
    }

    /// Run the connect sequence over an already open transport.
    pub fn connect_transport<T: ByteTransport + 'static>(
        &mut self,
        transport: T,
    ) -> Result<(), SessionError> {
        self.reported(|s| {
            s.drop_link();
            s.establish(Box::new(transport), None)
        })
    }

    fn connect_inner(&mut self, target: &ProbeTarget) -> Result<(), SessionError> {
        self.drop_link();

        let transport: Box<dyn ByteTransport> = match target {
            ProbeTarget::Serial(port) => Box::new(
                SerialTransport::open(port, self.config.baud_rate).map_err(|e| {
                    SessionError::PortAccess {
                        target: port.clone(),
                        message: e.to_string(),
                    }
                })?,
            ),
            ProbeTarget::Network(addr) => Box::new(
                TcpTransport::open(&addr.to_string(), self.config.connect_timeout()).map_err(
                    |e| SessionError::PortAccess {
                        target: addr.to_string(),
                        message: e.to_string(),
                    },
                )?,
            ),
        };
        info!(probe = %target, "Opened probe port");
        self.establish(transport, Some(target.clone()))
    }

    fn establish(
        &mut self,
        transport: Box<dyn ByteTransport>,
        target: Option<ProbeTarget>,
    ) -> Result<(), SessionError> {
        let kind = transport.kind();
        let name = target
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| kind.to_string());
        let observable = ObservableTransport::new(transport, Arc::clone(&self.observer));
        self.link = Some(RspLink::new(Box::new(observable), self.config.link_timings()));
        self.target = target;

        let result = if kind == TransportKind::Serial {
            self.probe_serial(&name).and_then(|_| self.negotiate())
        } else {
            self.negotiate()
        };
        if let Err(err) = result {
            self.drop_link();
            return Err(err);
        }

        self.set_state(SessionState::Connected);
        self.emit(ProbeEvent::Connected {
            kind,
            packet_size: self.packet_size,
        });
        Ok(())
    }

    /// Prove something is listening on a freshly opened serial port.
    fn probe_serial(&mut self, name: &str) -> Result<(), SessionError> {
        let timeout = self.config.handshake_timeout();
        if self.handshake(timeout)? {
            return Ok(());
        }

        debug!("No handshake reply, toggling DTR");
        {
            let transport = self.link_mut()?.transport_mut();
            transport.set_dtr(false)?;
            thread::sleep(DTR_PULSE);
            transport.set_dtr(true)?;
        }
        if self.handshake(timeout)? {
            return Ok(());
        }

        debug!("Still silent, trying the version command");
        let reply_timeout = self.config.reply_timeout();
        match self.monitor_exchange(MON_VERSION, reply_timeout) {
            Ok(output) if output.ok => Ok(()),
            _ => Err(SessionError::ProbeNotDetected(name.to_string())),
        }
    }

    fn handshake(&mut self, timeout: Duration) -> Result<bool, SessionError> {
        let link = self.link_mut()?;
        match link.send(QUERY_SUPPORTED.as_bytes()) {
            Ok(()) => {}
            Err(LinkError::NoAck { .. }) => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        let limit = link.capacity();
        Ok(link.receive(limit, Some(timeout))?.is_some())
    }

    /// Size the link from `qSupported` and switch to extended mode.
    fn negotiate(&mut self) -> Result<(), SessionError> {
        let quiet = self.config.poll_interval();
        self.link_mut()?.drain(quiet)?;

        let reply_timeout = self.config.reply_timeout();
        let features = self
            .exchange(QUERY_SUPPORTED.as_bytes(), reply_timeout)
            .map_err(|e| SessionError::ConnectFailed(format!("qSupported: {}", e)))?;
        self.packet_size = features
            .data()
            .and_then(parse_packet_size)
            .unwrap_or(DEFAULT_PACKET_SIZE);
        let capacity = self.packet_size + CACHE_MARGIN;
        self.link_mut()?.set_packet_capacity(capacity);
        debug!(packet_size = self.packet_size, "Negotiated packet size");

        for attempt in 1..=EXTENDED_MODE_ATTEMPTS {
            match self.exchange(EXTENDED_MODE.as_bytes(), reply_timeout) {
                Ok(Reply::Ok) => return Ok(()),
                Ok(other) => warn!(attempt, reply = ?other, "Extended mode refused"),
                Err(err) => warn!(attempt, error = %err, "Extended mode request failed"),
            }
            if attempt < EXTENDED_MODE_ATTEMPTS {
                thread::sleep(EXTENDED_MODE_RETRY);
            }
        }
        Err(SessionError::ConnectFailed(
            "probe did not enter extended mode".to_string(),
        ))
    }

    /// Scan for a target, attach to it and load its flash map.
    #[instrument(skip(self))]
    pub fn attach(&mut self, auto_power: bool) -> Result<(), SessionError> {
        self.reported(|s| {
            let result = s.attach_inner(auto_power);
            // The old map is gone, so a failed re-attach is no longer attached.
            if result.is_err() && s.state == SessionState::Attached {
                s.set_state(SessionState::Connected);
            }
            result
        })
    }

    fn attach_inner(&mut self, mut auto_power: bool) -> Result<(), SessionError> {
        self.state.require(SessionState::Connected, "attach")?;
        self.flash.clear();
        self.monitor_commands = None;
        self.target_info = TargetInfo::default();

        let scan_timeout = self.config.flash_timeout();
        let reply_timeout = self.config.reply_timeout();
        let info = loop {
            let scan = self.monitor_exchange(MON_SCAN, scan_timeout)?;
            let mut info = TargetInfo::default();
            for line in &scan.lines {
                if let Some(voltage) = parse_voltage(line) {
                    info.voltage = Some(voltage);
                }
                if info.family.is_none() {
                    if let Some((family, architecture)) = parse_target_line(line) {
                        info.family = Some(family);
                        info.architecture = architecture;
                    }
                }
            }

            if auto_power && info.voltage.is_some_and(|v| v < POWER_THRESHOLD) {
                auto_power = false;
                info!("Target unpowered, enabling probe power");
                if !self.monitor_exchange(MON_POWER_ON, reply_timeout)?.ok {
                    return Err(SessionError::MonitorFailed {
                        command: MON_POWER_ON.to_string(),
                    });
                }
                thread::sleep(POWER_SETTLE);
                continue;
            }
            if !scan.ok {
                return Err(SessionError::AttachFailed("target scan failed".to_string()));
            }
            break info;
        };

        match self.exchange(ATTACH.as_bytes(), reply_timeout)? {
            Reply::Ok | Reply::Stop(_) => {}
            other => return Err(SessionError::AttachFailed(format!("{:?}", other))),
        }

        let xml = self.read_memory_map()?;
        self.flash = FlashMap::from_memory_map(&parse_memory_map(&xml));
        self.target_info = info;
        self.set_state(SessionState::Attached);

        if let Some(family) = &self.target_info.family {
            self.emit(ProbeEvent::TargetDetected {
                family: family.clone(),
                architecture: self.target_info.architecture.clone(),
            });
        }
        info!(regions = self.flash.len(), "Attached to target");
        if self.flash.is_empty() {
            self.emit_error(&SessionError::NoFlash);
        }
        Ok(())
    }

    /// Fetch the memory-map document, following `m` continuations.
    fn read_memory_map(&mut self) -> Result<String, SessionError> {
        let chunk = self.packet_size.saturating_sub(CACHE_MARGIN).max(CACHE_MARGIN);
        let reply_timeout = self.config.reply_timeout();
        let mut xml = Vec::new();
        loop {
            let command = format!("{}{:x},{:x}", MEMORY_MAP_READ, xml.len(), chunk);
            match self.exchange(command.as_bytes(), reply_timeout)? {
                Reply::Data(data) => match data.split_first() {
                    Some((&b'm', rest)) if !rest.is_empty() => xml.extend_from_slice(rest),
                    Some((&(b'm' | b'l'), rest)) => {
                        xml.extend_from_slice(rest);
                        break;
                    }
                    _ => {
                        warn!("Malformed memory map reply");
                        break;
                    }
                },
                other => {
                    warn!(reply = ?other, "Memory map not available");
                    break;
                }
            }
        }
        Ok(String::from_utf8_lossy(&xml).into_owned())
    }

    /// Detach from the target. The flash map is dropped even when the probe
    /// refuses.
    #[instrument(skip(self))]
    pub fn detach(&mut self, power_down: bool) -> Result<(), SessionError> {
        self.reported(|s| s.detach_inner(power_down))
    }

    fn detach_inner(&mut self, power_down: bool) -> Result<(), SessionError> {
        self.state.require(SessionState::Connected, "detach")?;
        let reply_timeout = self.config.reply_timeout();

        let mut result = match self.exchange(DETACH.as_bytes(), reply_timeout) {
            Ok(Reply::Ok) => Ok(()),
            Ok(other) => Err(SessionError::UnexpectedReply {
                command: DETACH.to_string(),
                reply: format!("{:?}", other),
            }),
            Err(err) => Err(err),
        };
        if power_down {
            let powered_off = self
                .monitor_exchange(MON_POWER_OFF, reply_timeout)
                .map(|out| out.ok);
            if result.is_ok() && !matches!(powered_off, Ok(true)) {
                result = Err(SessionError::MonitorFailed {
                    command: MON_POWER_OFF.to_string(),
                });
            }
        }

        self.flash.clear();
        self.target_info = TargetInfo::default();
        self.set_state(SessionState::Connected);
        result
    }

    /// Close the link and forget everything learned from the probe.
    pub fn disconnect(&mut self) {
        let was_open = self.link.is_some();
        self.drop_link();
        if was_open {
            info!("Disconnected from probe");
            self.emit(ProbeEvent::Disconnected);
        }
    }

    /// Start the target program and let it run.
    pub fn run_target(&mut self) -> Result<(), SessionError> {
        self.reported(|s| {
            s.state.require(SessionState::Attached, "run")?;
            let reply_timeout = s.config.reply_timeout();
            match s.exchange(RUN.as_bytes(), reply_timeout)? {
                Reply::Ok | Reply::Stop(_) => {}
                other => {
                    return Err(SessionError::UnexpectedReply {
                        command: RUN.to_string(),
                        reply: format!("{:?}", other),
                    });
                }
            }
            // The stop reply to `c` only comes when the target halts.
            s.link_mut()?.send(CONTINUE.as_bytes())?;
            Ok(())
        })
    }

    /// Break into a running target.
    pub fn interrupt(&mut self) -> Result<(), SessionError> {
        self.reported(|s| {
            s.state.require(SessionState::Connected, "interrupt")?;
            let settle = s.config.poll_interval();
            let link = s.link_mut()?;
            link.send_raw(&[INTERRUPT])?;
            thread::sleep(settle);
            link.reset_cache();
            Ok(())
        })
    }

    /// Run the init script `name` for the attached target.
    ///
    /// Returns the script's `$` result, or `None` when the source has no
    /// such script.
    pub fn run_script<S: ScriptSource + ?Sized>(
        &mut self,
        source: &S,
        name: &str,
        params: &[u32],
    ) -> Result<Option<u32>, SessionError> {
        self.reported(|s| {
            s.state.require(SessionState::Attached, "run_script")?;
            let family = s.target_info.family.clone().unwrap_or_default();
            let ops = match source.script(&family, s.target_info.architecture.as_deref(), name) {
                Some(ops) => ops,
                None => {
                    info!(script = name, family = %family, "No init script for target");
                    return Ok(None);
                }
            };
            debug!(script = name, rows = ops.len(), "Running init script");
            script::run_script(s, &ops, params)
        })
    }

    // ---- plumbing shared by the submodules ----

    fn link_mut(&mut self) -> Result<&mut RspLink, SessionError> {
        self.link
            .as_mut()
            .ok_or_else(|| SessionError::Link(LinkError::NotConnected))
    }

    fn send_command(&mut self, command: &[u8]) -> Result<(), SessionError> {
        self.link_mut()?.send(command)?;
        Ok(())
    }

    /// Next reply frame, or `None` on timeout.
    fn next_reply(&mut self, timeout: Duration) -> Result<Option<Reply>, SessionError> {
        let link = self.link_mut()?;
        let limit = link.capacity();
        Ok(link
            .receive(limit, Some(timeout))?
            .map(|payload| Reply::from_payload(&payload)))
    }

    /// Send `command` and wait for its reply. Console output in between is
    /// forwarded to the observer.
    fn exchange(&mut self, command: &[u8], timeout: Duration) -> Result<Reply, SessionError> {
        self.send_command(command)?;
        loop {
            match self.next_reply(timeout)? {
                Some(Reply::Console(text)) => self.emit(ProbeEvent::Console {
                    text: text.trim_end().to_string(),
                }),
                Some(reply) => return Ok(reply),
                None => {
                    return Err(SessionError::NoResponse {
                        command: String::from_utf8_lossy(command).into_owned(),
                    });
                }
            }
        }
    }

    fn set_state(&mut self, to: SessionState) {
        if self.state != to {
            let from = self.state;
            self.state = to;
            self.emit(ProbeEvent::StateChanged { from, to });
        }
    }

    fn drop_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.target = None;
        self.packet_size = DEFAULT_PACKET_SIZE;
        self.monitor_commands = None;
        self.flash.clear();
        self.target_info = TargetInfo::default();
        self.set_state(SessionState::Disconnected);
    }

    fn emit(&self, event: ProbeEvent) {
        self.observer.on_event(&event);
    }

    fn emit_error(&self, err: &SessionError) {
        self.emit(ProbeEvent::Error {
            code: err.code(),
            message: err.to_string(),
        });
    }

    /// Run `op` and deliver its error, if any, to the observer.
    fn reported<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let result = op(self);
        if let Err(err) = &result {
            self.emit_error(err);
        }
        result
    }
}

/// `PacketSize=<hex>` from a `qSupported` reply.
fn parse_packet_size(features: &[u8]) -> Option<usize> {
    String::from_utf8_lossy(features)
        .split(';')
        .find_map(|feature| feature.strip_prefix("PacketSize="))
        .and_then(|size| usize::from_str_radix(size.trim(), 16).ok())
        .filter(|&size| size > 0)
}

/// Voltage from a scan line such as `Target voltage: 3.3V`. A reading that
/// does not parse counts as 0 V.
fn parse_voltage(line: &str) -> Option<f32> {
    let pos = line.to_ascii_lowercase().find("voltage:")?;
    let reading: String = line[pos + "voltage:".len()..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    Some(reading.parse().unwrap_or(0.0))
}

/// Family and architecture from the scan's `1 <name>` line.
fn parse_target_line(line: &str) -> Option<(String, Option<String>)> {
    let rest = line.trim().strip_prefix('1')?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let name = rest.trim();
    if name.is_empty() {
        return None;
    }

    if let Some((family, last)) = name.rsplit_once(char::is_whitespace) {
        let mut chars = last.chars();
        if chars.next() == Some('M') && chars.next().is_some_and(|c| c.is_ascii_digit()) {
            return Some((family.trim_end().to_string(), Some(last.to_string())));
        }
    }
    Some((name.to_string(), None))
}

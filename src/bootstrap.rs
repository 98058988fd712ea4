// This module contains the handshake that precedes every transfer.
//
// A Bootstrap owns a transfer from the moment it is created until it ends. It negotiates options
// (RFC 2347) and hands control to a ReadSession or WriteSession once both sides agree on how the
// transfer will go. There are four kinds of bootstrap, depending on which side asked for the
// transfer (the origin) and which direction the data flows (the session):
//
// - Remote origin, write: a peer sent us a WRQ. Answer with OACK or ACK(0) and wait for DATA(1).
// - Remote origin, read: a peer sent us an RRQ. Answer with OACK and wait for ACK(0), or start
//   sending DATA right away if there is nothing to negotiate.
// - Local origin, write: we sent an RRQ. Wait for OACK (answered with ACK(0)) or DATA(1).
// - Local origin, read: we sent a WRQ. Wait for OACK or ACK(0), then start sending DATA.
//
// Until the session takes over, the bootstrap keeps its last datagram under a watchdog and gives
// up on the peer once the retry schedule is exhausted.

use crate::backend::{Reader, Writer};
use crate::clock::ClockRef;
use crate::config::TransferConfig;
use crate::datagram::{Datagram, ErrorCode, FileMode, Options, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::scheduler::{Watchdog, WatchdogEvent};
use crate::session::{
    ReadSession, TransferError, TransferOutcome, TransferSettings, WriteSession,
};
use crate::transport::Transport;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// We sent the request.
    Local,

    /// The peer sent the request.
    Remote,
}

/// The state machine that takes over after the handshake.
pub enum Session {
    /// We send the data.
    Read(ReadSession),

    /// We receive the data.
    Write(WriteSession),
}

impl Session {
    pub fn started(&self) -> bool {
        match self {
            Session::Read(s) => s.started(),
            Session::Write(s) => s.started(),
        }
    }

    pub fn is_finished(&self) -> bool {
        match self {
            Session::Read(s) => s.is_finished(),
            Session::Write(s) => s.is_finished(),
        }
    }

    pub fn settings(&self) -> &TransferSettings {
        match self {
            Session::Read(s) => &s.settings,
            Session::Write(s) => &s.settings,
        }
    }

    pub fn settings_mut(&mut self) -> &mut TransferSettings {
        match self {
            Session::Read(s) => &mut s.settings,
            Session::Write(s) => &mut s.settings,
        }
    }

    fn start_protocol(&mut self) {
        match self {
            Session::Read(s) => s.start_protocol(),
            Session::Write(s) => s.start_protocol(),
        }
    }

    fn datagram_received(&mut self, datagram: &Datagram, transport: &mut dyn Transport) {
        match self {
            Session::Read(s) => s.datagram_received(datagram, transport),
            Session::Write(s) => s.datagram_received(datagram, transport),
        }
    }

    fn on_timer(&mut self, transport: &mut dyn Transport) {
        match self {
            Session::Read(s) => s.on_timer(transport),
            Session::Write(s) => s.on_timer(transport),
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self {
            Session::Read(s) => s.deadline(),
            Session::Write(s) => s.deadline(),
        }
    }

    fn abort(&mut self, transport: &mut dyn Transport, error: TransferError) {
        match self {
            Session::Read(s) => s.abort(transport, error),
            Session::Write(s) => s.abort(transport, error),
        }
    }

    pub fn outcome(&self) -> Option<&TransferOutcome> {
        match self {
            Session::Read(s) => s.outcome(),
            Session::Write(s) => s.outcome(),
        }
    }

    fn take_outcome(&mut self) -> Option<TransferOutcome> {
        match self {
            Session::Read(s) => s.take_outcome(),
            Session::Write(s) => s.take_outcome(),
        }
    }
}

/// An object responsible for a single transfer, from the first datagram to the last.
pub struct Bootstrap<T: Transport> {
    origin: Origin,

    /// The peer's transfer identifier (address and port).
    remote: SocketAddr,

    /// Whether `remote` is final. A server answers a request from a fresh port, so a bootstrap
    /// that sent the request learns the peer's port from the first reply.
    tid_locked: bool,

    /// Options this bootstrap was created with: the peer's request, or our own.
    options: Options,

    /// The RRQ or WRQ a local-origin bootstrap sends on start.
    request: Option<Datagram>,

    /// The options that survived the last round of negotiation.
    resultant_options: Options,

    max_block_size: u16,

    /// Retry schedule for the handshake datagram.
    timeout: Vec<Duration>,

    watchdog: Option<Watchdog>,
    session: Session,
    transport: T,
    clock: ClockRef,
}

impl<T: Transport> Bootstrap<T> {
    fn new(
        origin: Origin,
        remote: SocketAddr,
        options: Options,
        session: Session,
        transport: T,
        clock: ClockRef,
        config: &TransferConfig,
    ) -> Bootstrap<T> {
        Bootstrap {
            origin,
            remote,
            tid_locked: origin == Origin::Remote,
            options,
            request: None,
            resultant_options: Options::new(),
            max_block_size: config.max_block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE),
            timeout: config.timeout.clone(),
            watchdog: None,
            session,
            transport,
            clock,
        }
    }

    /// A peer asked to read from us.
    pub fn remote_origin_read(
        remote: SocketAddr,
        reader: Box<dyn Reader>,
        options: Options,
        transport: T,
        clock: ClockRef,
        config: &TransferConfig,
    ) -> Bootstrap<T> {
        let session = ReadSession::new(reader, clock.clone(), TransferSettings::new(config.timeout.clone()));
        Bootstrap::new(Origin::Remote, remote, options, Session::Read(session), transport, clock, config)
    }

    /// A peer asked to write to us.
    pub fn remote_origin_write(
        remote: SocketAddr,
        writer: Box<dyn Writer>,
        options: Options,
        transport: T,
        clock: ClockRef,
        config: &TransferConfig,
    ) -> Bootstrap<T> {
        let session = WriteSession::new(writer, clock.clone(), TransferSettings::new(config.timeout.clone()));
        Bootstrap::new(Origin::Remote, remote, options, Session::Write(session), transport, clock, config)
    }

    /// We ask `remote` to accept `filename` from us.
    pub fn local_origin_read(
        remote: SocketAddr,
        filename: &str,
        options: Options,
        reader: Box<dyn Reader>,
        transport: T,
        clock: ClockRef,
        config: &TransferConfig,
    ) -> Bootstrap<T> {
        let session = ReadSession::new(reader, clock.clone(), TransferSettings::new(config.timeout.clone()));
        let request = Datagram::WriteReq {
            filename: filename.to_string(),
            mode: FileMode::Octet,
            options: options.clone(),
        };
        let mut bootstrap =
            Bootstrap::new(Origin::Local, remote, options, Session::Read(session), transport, clock, config);
        bootstrap.request = Some(request);
        bootstrap
    }

    /// We ask `remote` to send us `filename`.
    pub fn local_origin_write(
        remote: SocketAddr,
        filename: &str,
        options: Options,
        writer: Box<dyn Writer>,
        transport: T,
        clock: ClockRef,
        config: &TransferConfig,
    ) -> Bootstrap<T> {
        let session = WriteSession::new(writer, clock.clone(), TransferSettings::new(config.timeout.clone()));
        let request = Datagram::ReadReq {
            filename: filename.to_string(),
            mode: FileMode::Octet,
            options: options.clone(),
        };
        let mut bootstrap =
            Bootstrap::new(Origin::Local, remote, options, Session::Write(session), transport, clock, config);
        bootstrap.request = Some(request);
        bootstrap
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn resultant_options(&self) -> &Options {
        &self.resultant_options
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_finished(&self) -> bool {
        self.session.is_finished()
    }

    /// True if we are the side sending the data.
    pub fn is_read(&self) -> bool {
        matches!(self.session, Session::Read(_))
    }

    pub fn outcome(&self) -> Option<&TransferOutcome> {
        self.session.outcome()
    }

    pub fn take_outcome(&mut self) -> Option<TransferOutcome> {
        self.session.take_outcome()
    }

    /// Connects the transport and sends the first datagram of the handshake.
    pub fn start_protocol(&mut self) {
        self.transport.connect(self.remote);
        match (self.origin, self.is_read()) {
            (Origin::Local, _) => {
                let Some(request) = self.request.take() else {
                    return;
                };
                log::info!("Sending {request} to {}", self.remote);
                self.watchdog = Some(Watchdog::start(&*self.clock, &self.timeout, request.to_wire()));
            }
            (Origin::Remote, false) => {
                self.resultant_options = self.process_options(&self.options);
                let reply = if self.resultant_options.is_empty() {
                    Datagram::Ack { block: 0 }
                } else {
                    Datagram::OAck { options: self.resultant_options.clone() }
                };
                self.watchdog = Some(Watchdog::start(&*self.clock, &self.timeout, reply.to_wire()));
            }
            (Origin::Remote, true) => {
                self.resultant_options = self.process_options(&self.options);
                if self.resultant_options.is_empty() {
                    self.start_session();
                    return;
                }
                let reply = Datagram::OAck { options: self.resultant_options.clone() };
                self.watchdog = Some(Watchdog::start(&*self.clock, &self.timeout, reply.to_wire()));
            }
        }
        self.on_timer();
    }

    /// Filters a set of requested options down to the ones we accept, with accepted values.
    ///
    /// Unknown options and options with invalid values are dropped. Accepted names are
    /// lowercased; order is preserved. For a bootstrap that sent the request, `requested` is the
    /// server's OACK, and only options we asked for in the first place are accepted.
    pub fn process_options(&self, requested: &Options) -> Options {
        let mut accepted = Options::new();
        for (name, value) in requested.iter() {
            let name = name.to_ascii_lowercase();
            if self.origin == Origin::Local && self.options.get(&name).is_none() {
                log::debug!("Server acknowledged option {name} we never asked for, ignoring it");
                continue;
            }
            let value = match name.as_str() {
                "blksize" => self.option_blksize(value),
                "timeout" => self.option_timeout(value),
                "tsize" => self.option_tsize(value),
                _ => None,
            };
            if let Some(value) = value {
                accepted.insert(name, value);
            }
        }
        accepted
    }

    /// Block size must be in [8, 65464] (RFC 2348). A requested size is capped to our own
    /// maximum; a size the server acknowledged is taken as is, unless it is larger than the one
    /// we asked for.
    pub fn option_blksize(&self, value: &str) -> Option<String> {
        let blksize: u16 = value.trim().parse().ok()?;
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&blksize) {
            return None;
        }
        match self.origin {
            Origin::Remote => Some(blksize.min(self.max_block_size).to_string()),
            Origin::Local => {
                let asked: u16 = self.options.get("blksize")?.trim().parse().ok()?;
                (blksize <= asked).then(|| blksize.to_string())
            }
        }
    }

    /// Timeout must be in [1, 255] seconds (RFC 2349).
    pub fn option_timeout(&self, value: &str) -> Option<String> {
        let timeout: u8 = value.trim().parse().ok()?;
        if timeout < 1 {
            return None;
        }
        Some(timeout.to_string())
    }

    /// Transfer size must not be negative. A peer reading from us may send 0 to ask for the size,
    /// which is answered if the reader knows it.
    pub fn option_tsize(&self, value: &str) -> Option<String> {
        let tsize: u64 = value.trim().parse().ok()?;
        match (&self.origin, &self.session) {
            (Origin::Remote, Session::Read(session)) if tsize == 0 => {
                session.reader_size().map(|size| size.to_string())
            }
            _ => Some(tsize.to_string()),
        }
    }

    /// Applies accepted options to session settings.
    pub fn apply_options(settings: &mut TransferSettings, options: &Options) {
        for (name, value) in options.iter() {
            match name {
                "blksize" => {
                    if let Ok(block_size) = value.parse() {
                        settings.block_size = block_size;
                    }
                }
                "timeout" => {
                    if let Ok(timeout) = value.parse() {
                        settings.timeout = vec![Duration::from_secs(timeout); 3];
                    }
                }
                "tsize" => {
                    if let Ok(tsize) = value.parse() {
                        settings.tsize = Some(tsize);
                    }
                }
                _ => (),
            }
        }
    }

    /// Entry point for every datagram arriving on the transfer's socket.
    pub fn datagram_received(&mut self, bytes: &[u8], addr: SocketAddr) {
        if self.is_finished() {
            log::debug!("Transfer with {} is over, ignoring datagram from {addr}", self.remote);
            return;
        }
        if !self.accept_tid(addr) {
            log::warn!("Datagram from {addr} does not belong to the transfer with {}", self.remote);
            self.transport
                .write_to(Datagram::error_from_code(ErrorCode::UnknownTid).to_wire(), addr);
            return;
        }

        let datagram = match Datagram::from_wire(bytes) {
            Ok(datagram) => datagram,
            Err(e) => {
                log::warn!("Unable to parse datagram from {addr}: {e}");
                let error = Datagram::Error {
                    code: e.error_code(),
                    message: format!("Error parsing incoming packet: {e}"),
                };
                self.transport.write(error.to_wire());
                self.cancel_with(TransferError::Malformed(e));
                return;
            }
        };
        log::debug!("Datagram received from {addr}: {datagram}");

        if let Datagram::Error { code, message } = datagram {
            log::info!("Got error from {addr}: {code:?} '{message}'");
            self.cancel_with(TransferError::Peer { code, message });
            return;
        }

        match (self.origin, self.is_read()) {
            (Origin::Remote, false) => self.remote_origin_write_datagram(datagram),
            (Origin::Remote, true) => self.remote_origin_read_datagram(datagram),
            (Origin::Local, false) => self.local_origin_write_datagram(datagram),
            (Origin::Local, true) => self.local_origin_read_datagram(datagram),
        }
    }

    fn accept_tid(&mut self, addr: SocketAddr) -> bool {
        if self.tid_locked {
            // The whole address, not just the port: a transfer belongs to one host.
            return addr == self.remote;
        }
        // Only the host we sent the request to may pick the transfer's port.
        if addr.ip() != self.remote.ip() {
            return false;
        }
        if addr != self.remote {
            log::debug!("Peer {} continues the transfer from {addr}", self.remote);
            self.remote = addr;
            self.transport.connect(addr);
        }
        self.tid_locked = true;
        true
    }

    fn remote_origin_write_datagram(&mut self, datagram: Datagram) {
        match datagram {
            Datagram::Data { block: 1, .. } if !self.session.started() => {
                self.cancel_watchdog();
                self.start_session();
                self.session.datagram_received(&datagram, &mut self.transport);
            }
            _ => self.delegate(datagram),
        }
    }

    fn remote_origin_read_datagram(&mut self, datagram: Datagram) {
        match datagram {
            Datagram::Ack { block: 0 } if !self.session.started() => {
                self.cancel_watchdog();
                self.start_session();
            }
            _ => self.delegate(datagram),
        }
    }

    fn local_origin_write_datagram(&mut self, datagram: Datagram) {
        match datagram {
            Datagram::OAck { options } => {
                let ack = Datagram::Ack { block: 0 }.to_wire();
                if self.session.started() {
                    log::debug!("Duplicate OACK received, send back ACK and ignore");
                    self.transport.write(ack);
                    return;
                }
                self.resultant_options = self.process_options(&options);
                // The ACK(0) now guards the handshake in place of the request.
                self.watchdog = Some(Watchdog::start(&*self.clock, &self.timeout, ack));
                self.on_timer();
            }
            Datagram::Data { block: 1, .. } if !self.session.started() => {
                self.cancel_watchdog();
                self.start_session();
                self.session.datagram_received(&datagram, &mut self.transport);
            }
            _ => self.delegate(datagram),
        }
    }

    fn local_origin_read_datagram(&mut self, datagram: Datagram) {
        match datagram {
            Datagram::OAck { options } => {
                if self.session.started() {
                    log::debug!("Duplicate OACK received, ignored");
                    return;
                }
                self.resultant_options = self.process_options(&options);
                self.cancel_watchdog();
                self.start_session();
            }
            Datagram::Ack { block: 0 } if !self.session.started() => {
                self.cancel_watchdog();
                self.start_session();
            }
            _ => self.delegate(datagram),
        }
    }

    /// Passes a datagram to the session once it has taken over; before that it is ignored.
    fn delegate(&mut self, datagram: Datagram) {
        if self.session.started() {
            self.session.datagram_received(&datagram, &mut self.transport);
        } else {
            log::debug!("Ignoring {datagram} received during the handshake");
        }
    }

    /// Applies the negotiated options and hands the transfer to the session. A read session
    /// sends its first block straight away.
    fn start_session(&mut self) {
        Self::apply_options(self.session.settings_mut(), &self.resultant_options);
        self.session.start_protocol();
        log::info!(
            "Starting transfer with {} using options {}",
            self.remote,
            self.resultant_options
        );
        if let Session::Read(session) = &mut self.session {
            session.next_block(&mut self.transport);
        }
    }

    fn cancel_watchdog(&mut self) {
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.cancel();
        }
    }

    /// Sends or resends whatever is due and gives up on a silent peer.
    pub fn on_timer(&mut self) {
        let events = match self.watchdog.as_mut() {
            Some(watchdog) => watchdog.poll(self.clock.now()),
            None => Vec::new(),
        };
        for event in events {
            match event {
                WatchdogEvent::Resend(datagram) => self.transport.write(datagram),
                WatchdogEvent::GiveUp => self.timed_out(),
            }
        }
        self.session.on_timer(&mut self.transport);
    }

    /// When `on_timer` next needs to run.
    pub fn next_deadline(&self) -> Option<Instant> {
        let handshake = self.watchdog.as_ref().and_then(|w| w.deadline());
        match (handshake, self.session.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// The peer never completed the handshake.
    pub fn timed_out(&mut self) {
        log::info!("Timed out during option negotiation with {}", self.remote);
        self.cancel_with(TransferError::TimedOut);
    }

    pub fn cancel(&mut self) {
        self.cancel_with(TransferError::Cancelled);
    }

    /// Ends the transfer, releasing the backend and the transport. Does nothing if the transfer
    /// has already ended.
    pub fn cancel_with(&mut self, error: TransferError) {
        self.cancel_watchdog();
        self.session.abort(&mut self.transport, error);
    }
}

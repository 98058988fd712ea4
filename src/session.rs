// This module contains the block transfer state machines.
//
// Once option negotiation is over, a transfer is driven by one of two sessions. A ReadSession
// reads blocks from a Reader and sends them as DATA, waiting for an ACK of each before moving on.
// A WriteSession receives DATA, writes it to a Writer and answers each block with an ACK. Either
// side keeps the last datagram it sent under a watchdog so it can be retransmitted if the peer
// goes quiet, and gives the transfer up once the retry schedule is exhausted.
//
// A transfer ends in exactly one way: completion, a timeout, an ERROR from the peer, a local
// failure (protocol violation, backend I/O) or an explicit cancel. Every one of those goes through
// `finish_with`, which releases the backend and stops the transport exactly once and records the
// outcome.
//
// The receiving side cannot know whether its final ACK arrived. After committing the file it
// dallies for one timeout interval, answering a retransmitted last block with the same ACK, before
// it stops listening.

use crate::backend::{Reader, Writer};
use crate::clock::ClockRef;
use crate::datagram::{Datagram, DatagramError, ErrorCode, DEFAULT_BLOCK_SIZE};
use crate::scheduler::{Watchdog, WatchdogEvent};
use crate::transport::Transport;
use std::error;
use std::fmt;
use std::io;
use std::time::{Duration, Instant};

/// Retry schedule used when none has been negotiated, in seconds.
pub const DEFAULT_TIMEOUT: [u64; 3] = [1, 3, 7];

pub fn default_timeout() -> Vec<Duration> {
    DEFAULT_TIMEOUT.iter().map(|s| Duration::from_secs(*s)).collect()
}

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Why a transfer did not complete.
#[derive(Debug)]
pub enum TransferError {
    /// The peer stopped answering and the retry schedule ran out.
    TimedOut,

    /// The peer sent an ERROR datagram.
    Peer { code: ErrorCode, message: String },

    /// The peer sent something the protocol does not allow at this point.
    ProtocolViolation(String),

    /// The peer sent something that could not be parsed.
    Malformed(DatagramError),

    /// The local reader or writer failed.
    Backend(io::Error),

    /// The socket failed.
    Network(io::Error),

    /// The transfer was cancelled locally.
    Cancelled,
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransferError::TimedOut => write!(f, "Transfer timed out"),
            TransferError::Peer { code, message } => {
                write!(f, "Peer sent error: code: {:#?}, message: '{}'", code, message)
            }
            TransferError::ProtocolViolation(msg) => write!(f, "Protocol violation: {msg}"),
            TransferError::Malformed(e) => write!(f, "{e}"),
            TransferError::Backend(e) => write!(f, "Backend IO error: {e}"),
            TransferError::Network(e) => write!(f, "Socket IO error: {e}"),
            TransferError::Cancelled => write!(f, "Transfer cancelled"),
        }
    }
}

impl From<DatagramError> for TransferError {
    fn from(e: DatagramError) -> Self {
        TransferError::Malformed(e)
    }
}

/// What a completed transfer moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// DATA blocks transferred, including a trailing empty one.
    pub blocks: u64,
    pub bytes: u64,
}

pub type TransferOutcome = Result<TransferSummary, TransferError>;

/// The negotiable parameters of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSettings {
    pub block_size: u16,

    /// Retransmission delays; the last entry is how long to wait before giving up.
    pub timeout: Vec<Duration>,

    /// Transfer size declared by the peer, if any.
    pub tsize: Option<u64>,
}

impl TransferSettings {
    pub fn new(timeout: Vec<Duration>) -> TransferSettings {
        TransferSettings { block_size: DEFAULT_BLOCK_SIZE, timeout, tsize: None }
    }
}

impl Default for TransferSettings {
    fn default() -> TransferSettings {
        TransferSettings::new(default_timeout())
    }
}

/// True if `block` comes before `current`, allowing for the block number wrapping around.
fn is_behind(block: u16, current: u16) -> bool {
    let distance = current.wrapping_sub(block);
    distance != 0 && distance < 0x8000
}

/// Sends DATA blocks read from a local backend and waits for each to be acknowledged.
pub struct ReadSession {
    reader: Box<dyn Reader>,
    clock: ClockRef,
    pub settings: TransferSettings,
    blocknum: u16,
    started: bool,
    final_block: bool,
    watchdog: Option<Watchdog>,
    summary: TransferSummary,
    outcome: Option<TransferOutcome>,
}

impl ReadSession {
    pub fn new(reader: Box<dyn Reader>, clock: ClockRef, settings: TransferSettings) -> ReadSession {
        ReadSession {
            reader,
            clock,
            settings,
            blocknum: 0,
            started: false,
            final_block: false,
            watchdog: None,
            summary: TransferSummary::default(),
            outcome: None,
        }
    }

    pub fn start_protocol(&mut self) {
        self.started = true;
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// The block most recently sent.
    pub fn blocknum(&self) -> u16 {
        self.blocknum
    }

    pub fn completed(&self) -> bool {
        matches!(self.outcome, Some(Ok(_)))
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<&TransferOutcome> {
        self.outcome.as_ref()
    }

    pub fn take_outcome(&mut self) -> Option<TransferOutcome> {
        self.outcome.take()
    }

    /// The reader's size, for answering a tsize query.
    pub fn reader_size(&self) -> Option<u64> {
        self.reader.size()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.watchdog.as_ref().and_then(|w| w.deadline())
    }

    /// Reads the next block from the backend, sends it and waits for its ACK.
    pub fn next_block(&mut self, transport: &mut dyn Transport) {
        if self.is_finished() {
            return;
        }
        let block_size = usize::from(self.settings.block_size);
        let data = match self.reader.read(block_size) {
            Ok(data) => data,
            Err(e) => {
                let error = Datagram::Error {
                    code: e.kind().into(),
                    message: format!("Failed to read from file: {e}"),
                };
                self.abort_with(transport, error, TransferError::Backend(e));
                return;
            }
        };

        self.blocknum = self.blocknum.wrapping_add(1);
        self.final_block = data.len() < block_size;
        self.summary.blocks += 1;
        self.summary.bytes += data.len() as u64;

        let datagram = Datagram::Data { block: self.blocknum, data }.to_wire();
        self.watchdog = Some(Watchdog::start(&*self.clock, &self.settings.timeout, datagram));
        self.on_timer(transport);
    }

    pub fn datagram_received(&mut self, datagram: &Datagram, transport: &mut dyn Transport) {
        if self.is_finished() {
            log::debug!("Transfer is over, ignoring {datagram}");
            return;
        }
        match datagram {
            Datagram::Ack { block } => self.tftp_ack(*block, transport),
            Datagram::Error { code, message } => self.finish_with(
                transport,
                Err(TransferError::Peer { code: *code, message: message.clone() }),
            ),
            _ => self.violation(
                transport,
                format!("Expected to receive an Ack packet, but got {datagram} instead"),
            ),
        }
    }

    fn tftp_ack(&mut self, block: u16, transport: &mut dyn Transport) {
        if block == self.blocknum {
            if let Some(mut watchdog) = self.watchdog.take() {
                watchdog.cancel();
            }
            if self.final_block {
                let summary = self.summary;
                self.finish_with(transport, Ok(summary));
            } else {
                self.next_block(transport);
            }
        } else if is_behind(block, self.blocknum) {
            // Acks for blocks we know have already been acknowledged.
            log::debug!("Ignoring stale ACK for block {block}");
        } else {
            self.violation(
                transport,
                format!(
                    "Cannot acknowledge a block which was not yet sent. Current block is {cb}, but received an ack for {block}",
                    cb = self.blocknum
                ),
            );
        }
    }

    /// Retransmits or gives up, depending on how long the peer has been silent.
    pub fn on_timer(&mut self, transport: &mut dyn Transport) {
        let events = match self.watchdog.as_mut() {
            Some(watchdog) => watchdog.poll(self.clock.now()),
            None => return,
        };
        for event in events {
            match event {
                WatchdogEvent::Resend(datagram) => transport.write(datagram),
                WatchdogEvent::GiveUp => {
                    log::info!("Timed out waiting for ACK of block {}", self.blocknum);
                    self.finish_with(transport, Err(TransferError::TimedOut));
                }
            }
        }
    }

    pub fn cancel(&mut self, transport: &mut dyn Transport) {
        self.abort(transport, TransferError::Cancelled);
    }

    pub fn abort(&mut self, transport: &mut dyn Transport, error: TransferError) {
        self.finish_with(transport, Err(error));
    }

    fn violation(&mut self, transport: &mut dyn Transport, message: String) {
        let error = Datagram::Error { code: ErrorCode::IllegalOp, message: message.clone() };
        self.abort_with(transport, error, TransferError::ProtocolViolation(message));
    }

    fn abort_with(&mut self, transport: &mut dyn Transport, datagram: Datagram, error: TransferError) {
        if self.is_finished() {
            return;
        }
        // Error datagrams are a courtesy and are never retransmitted.
        transport.write(datagram.to_wire());
        self.finish_with(transport, Err(error));
    }

    fn finish_with(&mut self, transport: &mut dyn Transport, outcome: TransferOutcome) {
        if self.is_finished() {
            return;
        }
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.cancel();
        }
        self.reader.finish();
        transport.stop_listening();
        match &outcome {
            Ok(summary) => log::info!("Sent {} bytes in {} blocks", summary.bytes, summary.blocks),
            Err(e) => log::warn!("Read transfer failed: {e}"),
        }
        self.outcome = Some(outcome);
    }
}

/// Receives DATA blocks, writes them to a local backend and acknowledges them.
pub struct WriteSession {
    writer: Box<dyn Writer>,
    clock: ClockRef,
    pub settings: TransferSettings,
    blocknum: u16,
    started: bool,
    watchdog: Option<Watchdog>,

    /// Set after the final ACK went out: listen for a retransmitted last block until then.
    dally_until: Option<Instant>,
    summary: TransferSummary,
    outcome: Option<TransferOutcome>,
}

impl WriteSession {
    pub fn new(writer: Box<dyn Writer>, clock: ClockRef, settings: TransferSettings) -> WriteSession {
        WriteSession {
            writer,
            clock,
            settings,
            blocknum: 0,
            started: false,
            watchdog: None,
            dally_until: None,
            summary: TransferSummary::default(),
            outcome: None,
        }
    }

    pub fn start_protocol(&mut self) {
        self.started = true;
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// The block most recently acknowledged.
    pub fn blocknum(&self) -> u16 {
        self.blocknum
    }

    /// True once the last block is written, even while still dallying.
    pub fn completed(&self) -> bool {
        matches!(self.outcome, Some(Ok(_)))
    }

    pub fn is_dallying(&self) -> bool {
        self.dally_until.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some() && !self.is_dallying()
    }

    pub fn outcome(&self) -> Option<&TransferOutcome> {
        self.outcome.as_ref()
    }

    pub fn take_outcome(&mut self) -> Option<TransferOutcome> {
        self.outcome.take()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.dally_until.or_else(|| self.watchdog.as_ref().and_then(|w| w.deadline()))
    }

    pub fn datagram_received(&mut self, datagram: &Datagram, transport: &mut dyn Transport) {
        if self.is_dallying() {
            self.dallying_datagram(datagram, transport);
            return;
        }
        if self.is_finished() {
            log::debug!("Transfer is over, ignoring {datagram}");
            return;
        }
        match datagram {
            Datagram::Data { block, data } => self.tftp_data(*block, data, transport),
            Datagram::Error { code, message } => self.finish_with(
                transport,
                Err(TransferError::Peer { code: *code, message: message.clone() }),
            ),
            _ => self.violation(
                transport,
                format!("Expected to receive a Data packet, but got {datagram} instead"),
            ),
        }
    }

    fn tftp_data(&mut self, block: u16, data: &[u8], transport: &mut dyn Transport) {
        let block_size = usize::from(self.settings.block_size);
        if block == self.blocknum.wrapping_add(1) {
            if data.len() > block_size {
                self.violation(
                    transport,
                    format!(
                        "Data block {block} carries {} bytes, more than the block size of {block_size}",
                        data.len()
                    ),
                );
                return;
            }
            if let Some(mut watchdog) = self.watchdog.take() {
                watchdog.cancel();
            }
            if let Err(e) = self.writer.write(data) {
                let error = Datagram::Error {
                    code: e.kind().into(),
                    message: format!("Error writing to file: {e}"),
                };
                self.abort_with(transport, error, TransferError::Backend(e));
                return;
            }

            self.blocknum = block;
            self.summary.blocks += 1;
            self.summary.bytes += data.len() as u64;
            let ack = Datagram::Ack { block }.to_wire();

            if data.len() < block_size {
                transport.write(ack);
                self.complete(transport);
            } else {
                self.watchdog = Some(Watchdog::start(&*self.clock, &self.settings.timeout, ack));
                self.on_timer(transport);
            }
        } else if block == self.blocknum {
            // The peer retransmitted because our ACK got lost.
            log::debug!("Duplicate DATA block {block}, acknowledging again");
            transport.write(Datagram::Ack { block }.to_wire());
        } else {
            self.violation(
                transport,
                format!(
                    "Data blocks must be received in sequence. Received data for block {block}, \
                    but have only received up to block {cb}.",
                    cb = self.blocknum
                ),
            );
        }
    }

    /// Commits the written data and starts dallying.
    fn complete(&mut self, transport: &mut dyn Transport) {
        let summary = self.summary;
        self.release(Ok(summary));
        match self.settings.timeout.first() {
            Some(interval) if !interval.is_zero() => {
                self.dally_until = Some(self.clock.now() + *interval);
            }
            _ => transport.stop_listening(),
        }
    }

    /// Handles whatever the peer sends after the final ACK.
    fn dallying_datagram(&mut self, datagram: &Datagram, transport: &mut dyn Transport) {
        match datagram {
            Datagram::Data { block, .. } if *block == self.blocknum => {
                log::debug!("Final DATA block {block} repeated, acknowledging again");
                transport.write(Datagram::Ack { block: *block }.to_wire());
            }
            Datagram::Data { block, .. } => {
                let error = Datagram::Error {
                    code: ErrorCode::IllegalOp,
                    message: format!("Transfer is complete, block {block} was not expected"),
                };
                transport.write(error.to_wire());
            }
            Datagram::Error { code, message } => {
                log::debug!("Got error {code:?} '{message}' after the transfer completed");
                self.end_dally(transport);
            }
            _ => log::debug!("Transfer is over, ignoring {datagram}"),
        }
    }

    fn end_dally(&mut self, transport: &mut dyn Transport) {
        self.dally_until = None;
        transport.stop_listening();
    }

    /// Re-acknowledges the last block or gives up, depending on how long the peer has been silent.
    pub fn on_timer(&mut self, transport: &mut dyn Transport) {
        if let Some(until) = self.dally_until {
            if self.clock.now() >= until {
                self.end_dally(transport);
            }
            return;
        }
        let events = match self.watchdog.as_mut() {
            Some(watchdog) => watchdog.poll(self.clock.now()),
            None => return,
        };
        for event in events {
            match event {
                WatchdogEvent::Resend(datagram) => transport.write(datagram),
                WatchdogEvent::GiveUp => {
                    log::info!("Timed out waiting for DATA block {}", self.blocknum.wrapping_add(1));
                    self.finish_with(transport, Err(TransferError::TimedOut));
                }
            }
        }
    }

    pub fn cancel(&mut self, transport: &mut dyn Transport) {
        self.abort(transport, TransferError::Cancelled);
    }

    pub fn abort(&mut self, transport: &mut dyn Transport, error: TransferError) {
        self.finish_with(transport, Err(error));
    }

    fn violation(&mut self, transport: &mut dyn Transport, message: String) {
        let error = Datagram::Error { code: ErrorCode::IllegalOp, message: message.clone() };
        self.abort_with(transport, error, TransferError::ProtocolViolation(message));
    }

    fn abort_with(&mut self, transport: &mut dyn Transport, datagram: Datagram, error: TransferError) {
        if self.is_finished() {
            return;
        }
        transport.write(datagram.to_wire());
        self.finish_with(transport, Err(error));
    }

    fn finish_with(&mut self, transport: &mut dyn Transport, outcome: TransferOutcome) {
        if self.is_finished() {
            return;
        }
        // A completed transfer keeps its outcome; this only cuts the dally short.
        self.release(outcome);
        self.end_dally(transport);
    }

    /// Releases the writer and records the outcome, once.
    fn release(&mut self, outcome: TransferOutcome) {
        if self.outcome.is_some() {
            return;
        }
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.cancel();
        }
        if outcome.is_err() {
            self.writer.cancel();
        }
        self.writer.finish();
        match &outcome {
            Ok(summary) => log::info!("Received {} bytes in {} blocks", summary.bytes, summary.blocks),
            Err(e) => log::warn!("Write transfer failed: {e}"),
        }
        self.outcome = Some(outcome);
    }
}

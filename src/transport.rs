// The network side of a transfer.
//
// Bootstraps and sessions are plain state machines: they never touch a socket, they queue
// datagrams on a Transport. At runtime that Transport is an Outbox, and `drive` is the loop that
// owns the actual tokio socket for one transfer. It waits for either a datagram or the next timer
// deadline, hands whichever came first to the bootstrap, and flushes whatever the bootstrap
// queued in response. One transfer, one task, no locks.

use crate::bootstrap::Bootstrap;
use crate::datagram::MAX_DATAGRAM_SIZE;
use crate::session::{TransferError, TransferOutcome};
use std::collections::VecDeque;
use std::future;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::time;

pub trait Transport {
    /// Points the transport at the transfer's peer.
    fn connect(&mut self, peer: SocketAddr);

    /// Sends a datagram to the connected peer.
    fn write(&mut self, datagram: Vec<u8>);

    /// Sends a datagram to someone other than the peer, e.g. to turn away a stray sender.
    fn write_to(&mut self, datagram: Vec<u8>, addr: SocketAddr);

    /// No more datagrams will be accepted for this transfer.
    fn stop_listening(&mut self);
}

/// A transport that queues datagrams until the driver gets around to sending them.
#[derive(Debug)]
pub struct Outbox {
    peer: Option<SocketAddr>,
    queued: VecDeque<(Vec<u8>, SocketAddr)>,
    listening: bool,
}

impl Outbox {
    pub fn new() -> Outbox {
        Outbox { peer: None, queued: VecDeque::new(), listening: true }
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (Vec<u8>, SocketAddr)> + '_ {
        self.queued.drain(..)
    }
}

impl Default for Outbox {
    fn default() -> Outbox {
        Outbox::new()
    }
}

impl Transport for Outbox {
    fn connect(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }

    fn write(&mut self, datagram: Vec<u8>) {
        match self.peer {
            Some(peer) => self.queued.push_back((datagram, peer)),
            None => log::warn!("Dropping outgoing datagram, transport is not connected"),
        }
    }

    fn write_to(&mut self, datagram: Vec<u8>, addr: SocketAddr) {
        self.queued.push_back((datagram, addr));
    }

    fn stop_listening(&mut self) {
        self.listening = false;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(time::Instant::from_std(at)).await,
        None => future::pending().await,
    }
}

async fn flush(bootstrap: &mut Bootstrap<Outbox>, socket: &UdpSocket) {
    let queued: Vec<_> = bootstrap.transport_mut().drain().collect();
    for (datagram, addr) in queued {
        // Retransmission covers datagrams that never made it out.
        if let Err(e) = socket.send_to(&datagram, addr).await {
            log::warn!("Unable to send datagram to {addr}: {e}");
        }
    }
}

/// Runs one transfer to completion over `socket` and reports how it ended.
pub async fn drive(mut bootstrap: Bootstrap<Outbox>, socket: UdpSocket) -> TransferOutcome {
    let mut buf = vec![0_u8; MAX_DATAGRAM_SIZE];
    bootstrap.start_protocol();

    loop {
        flush(&mut bootstrap, &socket).await;
        if !bootstrap.transport().is_listening() {
            break;
        }

        let deadline = bootstrap.next_deadline();
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, src)) => bootstrap.datagram_received(&buf[..len], src),
                Err(e) => {
                    log::warn!("Socket error talking to {}: {e}", bootstrap.remote());
                    bootstrap.cancel_with(TransferError::Network(e));
                }
            },
            _ = sleep_until(deadline) => bootstrap.on_timer(),
        }
    }

    bootstrap.take_outcome().unwrap_or(Err(TransferError::Cancelled))
}

// A TFTP transfer engine (RFC 1350) with option negotiation (RFC 2347, 2348, 2349), as used for
// network booting.
//
// Protocol notes
//
// A transfer starts with a read request (RRQ) or write request (WRQ) sent to port 69. The side
// answering picks a port of its own for the rest of the transfer; each side's port is its transfer
// identifier (TID), and a datagram arriving from the wrong TID is answered with an ERROR and
// otherwise ignored. That is the one error that does not end a transfer.
//
// Data moves in numbered blocks of `blksize` bytes (512 unless negotiated), each acknowledged
// before the next is sent. A block shorter than `blksize`, possibly empty, ends the transfer.
// Block numbers are 16 bits and wrap around on large files.
//
// A request carrying options is answered with an OACK listing the options the server accepted.
// The client acknowledges an OACK with ACK(0) when reading; when writing, the OACK takes the place
// of the ACK(0) a plain WRQ gets.
//
// The sender of a datagram that expects an answer keeps it for retransmission and gives up when
// the peer stays quiet for long enough. ERROR datagrams end a transfer; they are never
// acknowledged or retransmitted.
//
// Layout
//
// - datagram: the wire format.
// - scheduler: retry and timeout bookkeeping, driven by an injected clock.
// - session: the block-by-block transfer once negotiation is over.
// - bootstrap: the handshake and option negotiation in front of a session.
// - transport: the tokio loop driving one transfer over a UDP socket.
// - server, client: the two ends that start transfers.

pub mod backend;
pub mod bootstrap;
pub mod client;
pub mod clock;
pub mod config;
pub mod datagram;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use bootstrap::Bootstrap;
pub use client::Client;
pub use config::{ServerConfig, TransferConfig};
pub use server::Server;
pub use session::{TransferError, TransferOutcome, TransferSummary};

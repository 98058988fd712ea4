// The client side: ask a server for a file, or offer it one.

use crate::backend::{Reader, Writer};
use crate::bootstrap::Bootstrap;
use crate::clock::{ClockRef, SystemClock};
use crate::config::TransferConfig;
use crate::datagram::Options;
use crate::session::{TransferError, TransferOutcome};
use crate::transport::{drive, Outbox};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;

pub struct Client {
    /// The server's well-known address. The transfer itself continues on whatever port the
    /// server answers from.
    server: SocketAddr,
    config: TransferConfig,
    clock: ClockRef,
}

impl Client {
    pub fn new(server: SocketAddr, config: TransferConfig) -> Client {
        Client { server, config, clock: Arc::new(SystemClock) }
    }

    async fn bind(&self) -> io::Result<UdpSocket> {
        let local: SocketAddr = if self.server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        UdpSocket::bind(local).await
    }

    /// Downloads `filename` into `writer` (RRQ).
    pub async fn get(&self, filename: &str, mut writer: Box<dyn Writer>, options: Options) -> TransferOutcome {
        let socket = match self.bind().await {
            Ok(socket) => socket,
            Err(e) => {
                writer.cancel();
                writer.finish();
                return Err(TransferError::Network(e));
            }
        };
        log::info!("Fetching {filename:?} from {}", self.server);
        let bootstrap = Bootstrap::local_origin_write(
            self.server,
            filename,
            options,
            writer,
            Outbox::new(),
            self.clock.clone(),
            &self.config,
        );
        drive(bootstrap, socket).await
    }

    /// Uploads the contents of `reader` as `filename` (WRQ).
    pub async fn put(&self, filename: &str, mut reader: Box<dyn Reader>, options: Options) -> TransferOutcome {
        let socket = match self.bind().await {
            Ok(socket) => socket,
            Err(e) => {
                reader.finish();
                return Err(TransferError::Network(e));
            }
        };
        log::info!("Sending {filename:?} to {}", self.server);
        let bootstrap = Bootstrap::local_origin_read(
            self.server,
            filename,
            options,
            reader,
            Outbox::new(),
            self.clock.clone(),
            &self.config,
        );
        drive(bootstrap, socket).await
    }
}

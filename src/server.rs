// This module contains the server side of the protocol.
//
// The server listens on the well-known port for read and write requests. Every request it accepts
// becomes a transfer of its own:
//
// 1. Bind a fresh socket on a random port. The port is the server's transfer identifier for the
//    rest of the transfer, so the well-known port stays free for new requests.
// 2. Check whether the request can be serviced: mode, write permission, path, and whether the
//    file can be opened or created.
// 3. Hand the socket and the backend to a remote-origin bootstrap and drive it in a task of its
//    own until the transfer ends.
//
// Requests that cannot be serviced are answered with an ERROR from the fresh socket. The server
// keeps track of running transfers by peer address so a client retransmitting its request while
// the transfer is already under way does not start a second one.

use crate::backend::{FilesystemReader, FilesystemWriter, Reader, Writer};
use crate::bootstrap::Bootstrap;
use crate::clock::{ClockRef, SystemClock};
use crate::config::{PortRange, ServerConfig};
use crate::datagram::{Datagram, ErrorCode, FileMode, Options, MAX_DATAGRAM_SIZE};
use crate::transport::{drive, Outbox};
use rand::Rng;
use std::collections::HashMap;
use std::error;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// How many random ports to try before giving up on binding a transfer socket.
const BIND_ATTEMPTS: usize = 64;

#[derive(Debug)]
pub enum ServerError {
    /// The request does not make sense.
    BadRequest(String),

    /// The request is valid, but asks for something this server does not do.
    Unsupported(String),

    /// The request is refused.
    AccessViolation(String),

    /// The requested file could not be opened or created.
    File(io::Error),

    /// A socket could not be bound or used.
    Network(io::Error),
}

impl ServerError {
    /// The code sent to a peer whose request failed this way.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::BadRequest(_) => ErrorCode::IllegalOp,
            ServerError::Unsupported(_) => ErrorCode::NotDefined,
            ServerError::AccessViolation(_) => ErrorCode::AccessViolation,
            ServerError::File(e) => e.kind().into(),
            ServerError::Network(_) => ErrorCode::NotDefined,
        }
    }
}

impl error::Error for ServerError {}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Invalid request: {msg}"),
            Self::Unsupported(msg) => write!(f, "Unsupported request: {msg}"),
            Self::AccessViolation(msg) => write!(f, "Access violation: {msg}"),
            Self::File(e) => write!(f, "File IO error: {e}"),
            Self::Network(e) => write!(f, "Socket IO error: {e}"),
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> ServerError {
        ServerError::File(e)
    }
}

/// Attempts to bind a UDP socket on a random port in `ports` until one succeeds.
pub async fn bind_random_socket(ip: IpAddr, ports: PortRange) -> io::Result<UdpSocket> {
    let mut last_error = None;
    for _ in 0..BIND_ATTEMPTS.min(ports.len()) {
        let port = rand::thread_rng().gen_range(ports.ports());
        match UdpSocket::bind(SocketAddr::new(ip, port)).await {
            Ok(sock) => return Ok(sock),
            Err(e) => {
                log::warn!("Couldn't bind socket on port {port}: {e}");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "No free port in range")))
}

async fn send_error_packet(sock: &UdpSocket, dst: SocketAddr, code: ErrorCode, message: String) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send_to(&Datagram::Error { code, message }.to_wire(), dst).await;
}

/// Maps a requested filename onto a path below `root`.
///
/// Backslashes count as separators and leading slashes are ignored, so `/boot\pxelinux.0` and
/// `boot/pxelinux.0` are the same file. Paths that would climb out of `root` are refused.
pub fn resolve_path(root: &Path, filename: &str) -> Result<PathBuf, ServerError> {
    let normalized = filename.replace('\\', "/");
    let relative = Path::new(normalized.trim_start_matches('/'));
    let mut path = root.to_path_buf();
    let mut depth = 0;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                path.push(part);
                depth += 1;
            }
            Component::CurDir => (),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ServerError::AccessViolation(format!(
                    "Path {filename:?} leaves the server root"
                )));
            }
        }
    }
    if depth == 0 {
        return Err(ServerError::BadRequest("Empty filename".to_string()));
    }
    Ok(path)
}

/// Accepts requests on the well-known port and starts a transfer for each.
pub struct Server {
    socket: UdpSocket,
    config: ServerConfig,
    clock: ClockRef,

    /// Running transfers, by peer transfer identifier.
    transfers: HashMap<SocketAddr, JoinHandle<()>>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Server, ServerError> {
        let socket = UdpSocket::bind(config.bind).await.map_err(ServerError::Network)?;
        log::info!("Serving {} on {}", config.root.display(), socket.local_addr().map_err(ServerError::Network)?);
        Ok(Server { socket, config, clock: Arc::new(SystemClock), transfers: HashMap::new() })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serves requests until the listening socket fails.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        let mut buf = vec![0_u8; MAX_DATAGRAM_SIZE];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => self.handle_request(&buf[..len], src).await,
                // A peer that went away can make the next receive fail on some platforms.
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    log::debug!("Ignoring socket error: {e}");
                }
                Err(e) => return Err(ServerError::Network(e)),
            }
        }
    }

    /// Number of transfers that have not finished yet.
    pub fn active_transfers(&mut self) -> usize {
        self.transfers.retain(|_, handle| !handle.is_finished());
        self.transfers.len()
    }

    async fn handle_request(&mut self, bytes: &[u8], src: SocketAddr) {
        self.active_transfers();
        if self.transfers.contains_key(&src) {
            log::debug!("Transfer with {src} is already running, ignoring request");
            return;
        }

        let request = match Datagram::from_wire(bytes) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("Unable to parse request from {src}: {e}");
                send_error_packet(&self.socket, src, e.error_code(), format!("Error parsing request: {e}")).await;
                return;
            }
        };
        log::info!("Got request from {src}: {request}");

        let (filename, mode, options, is_read) = match request {
            Datagram::ReadReq { filename, mode, options } => (filename, mode, options, true),
            Datagram::WriteReq { filename, mode, options } => (filename, mode, options, false),
            _ => {
                send_error_packet(
                    &self.socket,
                    src,
                    ErrorCode::IllegalOp,
                    "Only read and write requests are valid initial requests.".to_string(),
                )
                .await;
                return;
            }
        };

        let sock = match bind_random_socket(self.config.bind.ip(), self.config.port_range).await {
            Ok(sock) => sock,
            Err(e) => {
                log::error!("Unable to bind a socket for the transfer with {src}: {e}");
                send_error_packet(&self.socket, src, ErrorCode::NotDefined, "Server busy, please retry".to_string())
                    .await;
                return;
            }
        };

        let bootstrap = match self.prepare(src, &filename, mode, options, is_read) {
            Ok(bootstrap) => bootstrap,
            Err(e) => {
                log::warn!("Refusing request from {src}: {e}");
                send_error_packet(&sock, src, e.error_code(), e.to_string()).await;
                return;
            }
        };

        let handle = tokio::spawn(async move {
            match drive(bootstrap, sock).await {
                Ok(summary) => log::info!("Transfer of {filename:?} with {src} done: {summary:?}"),
                Err(e) => log::warn!("Transfer of {filename:?} with {src} failed: {e}"),
            }
        });
        self.transfers.insert(src, handle);
    }

    /// Checks a request and opens the backend it needs.
    fn prepare(
        &self,
        src: SocketAddr,
        filename: &str,
        mode: FileMode,
        options: Options,
        is_read: bool,
    ) -> Result<Bootstrap<Outbox>, ServerError> {
        match mode {
            FileMode::Mail => {
                return Err(ServerError::Unsupported("Support for mail mode is unimplemented".to_string()))
            }
            FileMode::NetAscii => log::debug!("Serving netascii request from {src} as octet"),
            FileMode::Octet => (),
        }

        let path = resolve_path(&self.config.root, filename)?;
        let transfer = &self.config.transfer;
        if is_read {
            let reader: Box<dyn Reader> = Box::new(FilesystemReader::open(&path)?);
            Ok(Bootstrap::remote_origin_read(src, reader, options, Outbox::new(), self.clock.clone(), transfer))
        } else {
            if !self.config.allow_writes {
                return Err(ServerError::AccessViolation("Writes are disabled".to_string()));
            }
            let writer: Box<dyn Writer> = Box::new(FilesystemWriter::create(&path)?);
            Ok(Bootstrap::remote_origin_write(src, writer, options, Outbox::new(), self.clock.clone(), transfer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::session::TransferError;
    use std::fs;
    use std::time::Duration;
    use tempdir::TempDir;
    use tokio::time;
    use tokio_test::{assert_err, assert_ok};

    async fn start_server(root: &Path, allow_writes: bool) -> SocketAddr {
        let mut config = ServerConfig::new(root.to_path_buf());
        config.bind = "127.0.0.1:0".parse().unwrap();
        config.allow_writes = allow_writes;
        let mut server = Server::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move { server.run().await });
        addr
    }

    fn test_file(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_resolve_path() {
        let root = Path::new("/srv/tftp");
        assert_eq!(resolve_path(root, "/boot/pxelinux.0").unwrap(), root.join("boot/pxelinux.0"));
        assert_eq!(resolve_path(root, "boot/./grub.cfg").unwrap(), root.join("boot/grub.cfg"));
        assert_eq!(resolve_path(root, "//x").unwrap(), root.join("x"));
        assert_eq!(resolve_path(root, "\\boot\\bootx64.efi").unwrap(), root.join("boot/bootx64.efi"));
        assert!(matches!(resolve_path(root, "..\\secret"), Err(ServerError::AccessViolation(_))));
        assert!(matches!(resolve_path(root, "../etc/passwd"), Err(ServerError::AccessViolation(_))));
        assert!(matches!(resolve_path(root, "boot/../../etc"), Err(ServerError::AccessViolation(_))));
        assert!(matches!(resolve_path(root, "/"), Err(ServerError::BadRequest(_))));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ServerError::Unsupported(String::new()).error_code(), ErrorCode::NotDefined);
        assert_eq!(
            ServerError::File(io::Error::from(io::ErrorKind::NotFound)).error_code(),
            ErrorCode::FileNotFound
        );
        assert_eq!(
            ServerError::File(io::Error::from(io::ErrorKind::AlreadyExists)).error_code(),
            ErrorCode::FileExists
        );
    }

    #[tokio::test]
    async fn test_get_and_put() {
        let root = TempDir::new("scratch").unwrap();
        let local = TempDir::new("scratch").unwrap();
        let contents = test_file(1300);
        fs::write(root.path().join("boot.bin"), &contents).unwrap();
        let addr = start_server(root.path(), true).await;
        let client = Client::new(addr, Default::default());

        let downloaded = local.path().join("boot.bin");
        let writer = Box::new(FilesystemWriter::create(&downloaded).unwrap());
        let options: Options = [("blksize", "1024"), ("tsize", "0")].into_iter().collect();
        let outcome = time::timeout(Duration::from_secs(10), client.get("/boot.bin", writer, options))
            .await
            .unwrap();
        let summary = assert_ok!(outcome);
        assert_eq!(summary.blocks, 2);
        assert_eq!(summary.bytes, 1300);
        assert_eq!(fs::read(&downloaded).unwrap(), contents);

        let reader = Box::new(FilesystemReader::open(&downloaded).unwrap());
        let outcome = time::timeout(Duration::from_secs(10), client.put("upload.bin", reader, Options::new()))
            .await
            .unwrap();
        let summary = assert_ok!(outcome);
        assert_eq!(summary.blocks, 3);
        assert_eq!(fs::read(root.path().join("upload.bin")).unwrap(), contents);
    }

    #[tokio::test]
    async fn test_get_exact_multiple_of_block_size() {
        let root = TempDir::new("scratch").unwrap();
        let local = TempDir::new("scratch").unwrap();
        let contents = test_file(1024);
        fs::write(root.path().join("even.bin"), &contents).unwrap();
        let addr = start_server(root.path(), false).await;
        let client = Client::new(addr, Default::default());

        let downloaded = local.path().join("even.bin");
        let writer = Box::new(FilesystemWriter::create(&downloaded).unwrap());
        let outcome = time::timeout(Duration::from_secs(10), client.get("even.bin", writer, Options::new()))
            .await
            .unwrap();
        let summary = assert_ok!(outcome);
        assert_eq!(summary.blocks, 3);
        assert_eq!(fs::read(&downloaded).unwrap(), contents);
    }

    #[tokio::test]
    async fn test_get_missing_file() {
        let root = TempDir::new("scratch").unwrap();
        let local = TempDir::new("scratch").unwrap();
        let addr = start_server(root.path(), false).await;
        let client = Client::new(addr, Default::default());

        let target = local.path().join("nope");
        let writer = Box::new(FilesystemWriter::create(&target).unwrap());
        let outcome = time::timeout(Duration::from_secs(10), client.get("nope", writer, Options::new()))
            .await
            .unwrap();
        match assert_err!(outcome) {
            TransferError::Peer { code, .. } => assert_eq!(code, ErrorCode::FileNotFound),
            other => panic!("Expected an error from the server, got {other:?}"),
        }
        assert!(!target.exists());
        assert_eq!(fs::read_dir(local.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_put_with_writes_disabled() {
        let root = TempDir::new("scratch").unwrap();
        let local = TempDir::new("scratch").unwrap();
        let source = local.path().join("upload.bin");
        fs::write(&source, b"nope").unwrap();
        let addr = start_server(root.path(), false).await;
        let client = Client::new(addr, Default::default());

        let reader = Box::new(FilesystemReader::open(&source).unwrap());
        let outcome = time::timeout(Duration::from_secs(10), client.put("upload.bin", reader, Options::new()))
            .await
            .unwrap();
        match assert_err!(outcome) {
            TransferError::Peer { code, .. } => assert_eq!(code, ErrorCode::AccessViolation),
            other => panic!("Expected an error from the server, got {other:?}"),
        }
        assert!(!root.path().join("upload.bin").exists());
    }

    #[tokio::test]
    async fn test_non_request_on_well_known_port() {
        let root = TempDir::new("scratch").unwrap();
        let addr = start_server(root.path(), false).await;
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sock.send_to(&Datagram::Ack { block: 1 }.to_wire(), addr).await.unwrap();

        let mut buf = [0_u8; 512];
        let (len, src) = time::timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(src, addr);
        match Datagram::from_wire(&buf[..len]).unwrap() {
            Datagram::Error { code, .. } => assert_eq!(code, ErrorCode::IllegalOp),
            other => panic!("Expected an error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_mail_mode_is_refused() {
        let root = TempDir::new("scratch").unwrap();
        let addr = start_server(root.path(), false).await;
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = Datagram::ReadReq {
            filename: "root".to_string(),
            mode: FileMode::Mail,
            options: Options::new(),
        };
        sock.send_to(&request.to_wire(), addr).await.unwrap();

        let mut buf = [0_u8; 512];
        let (len, src) = time::timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(src, addr, "Refusals come from the transfer socket");
        assert_eq!(
            Datagram::from_wire(&buf[..len]).unwrap(),
            Datagram::Error {
                code: ErrorCode::NotDefined,
                message: "Unsupported request: Support for mail mode is unimplemented".to_string(),
            }
        );
    }
}

// Doubles shared by the session and bootstrap tests.

use crate::backend::{Reader, Writer};
use crate::datagram::Datagram;
use crate::transport::Transport;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

/// Records everything a state machine asks the network to do.
#[derive(Debug, Default)]
pub struct FakeTransport {
    pub peer: Option<SocketAddr>,
    pub sent: Vec<Vec<u8>>,
    pub stray: Vec<(Vec<u8>, SocketAddr)>,
    pub disconnecting: bool,
}

impl FakeTransport {
    pub fn new() -> FakeTransport {
        FakeTransport::default()
    }

    /// Every byte written to the peer, concatenated.
    pub fn value(&self) -> Vec<u8> {
        self.sent.concat()
    }

    pub fn datagrams(&self) -> Vec<Datagram> {
        self.sent.iter().map(|d| Datagram::from_wire(d).unwrap()).collect()
    }

    pub fn clear(&mut self) {
        self.sent.clear();
        self.stray.clear();
    }
}

impl Transport for FakeTransport {
    fn connect(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }

    fn write(&mut self, datagram: Vec<u8>) {
        self.sent.push(datagram);
    }

    fn write_to(&mut self, datagram: Vec<u8>, addr: SocketAddr) {
        self.stray.push((datagram, addr));
    }

    fn stop_listening(&mut self) {
        self.disconnecting = true;
    }
}

/// What a backend double saw, kept outside the backend so tests can look after handing it over.
#[derive(Debug, Default)]
pub struct BackendLog {
    pub written: Vec<u8>,
    pub writes: usize,
    pub reads: usize,
    pub cancelled: bool,
    pub finished: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SharedLog(Arc<Mutex<BackendLog>>);

impl SharedLog {
    pub fn get(&self) -> MutexGuard<'_, BackendLog> {
        self.0.lock().unwrap()
    }
}

pub struct MemoryReader {
    data: Vec<u8>,
    pos: usize,
    size_known: bool,
    log: SharedLog,
}

impl MemoryReader {
    pub fn new(data: &[u8]) -> (MemoryReader, SharedLog) {
        let log = SharedLog::default();
        let reader = MemoryReader { data: data.to_vec(), pos: 0, size_known: true, log: log.clone() };
        (reader, log)
    }

    pub fn without_size(data: &[u8]) -> (MemoryReader, SharedLog) {
        let (mut reader, log) = MemoryReader::new(data);
        reader.size_known = false;
        (reader, log)
    }
}

impl Reader for MemoryReader {
    fn read(&mut self, size: usize) -> io::Result<Vec<u8>> {
        self.log.get().reads += 1;
        let end = usize::min(self.pos + size, self.data.len());
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(chunk)
    }

    fn size(&self) -> Option<u64> {
        self.size_known.then_some(self.data.len() as u64)
    }

    fn finish(&mut self) {
        self.log.get().finished += 1;
    }
}

pub struct MemoryWriter {
    log: SharedLog,
}

impl MemoryWriter {
    pub fn new() -> (MemoryWriter, SharedLog) {
        let log = SharedLog::default();
        (MemoryWriter { log: log.clone() }, log)
    }
}

impl Writer for MemoryWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut log = self.log.get();
        log.written.extend_from_slice(data);
        log.writes += 1;
        Ok(())
    }

    fn cancel(&mut self) {
        self.log.get().cancelled = true;
    }

    fn finish(&mut self) {
        self.log.get().finished += 1;
    }
}

pub struct FailingReader {
    pub log: SharedLog,
}

impl Reader for FailingReader {
    fn read(&mut self, _size: usize) -> io::Result<Vec<u8>> {
        Err(io::Error::new(io::ErrorKind::Other, "A failure"))
    }

    fn finish(&mut self) {
        self.log.get().finished += 1;
    }
}

pub struct FailingWriter {
    pub log: SharedLog,
}

impl Writer for FailingWriter {
    fn write(&mut self, _data: &[u8]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "I fail"))
    }

    fn cancel(&mut self) {
        self.log.get().cancelled = true;
    }

    fn finish(&mut self) {
        self.log.get().finished += 1;
    }
}

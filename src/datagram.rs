// Wire format of the six TFTP datagrams (RFC 1350, option extension from RFC 2347).
//
// Every datagram starts with a 2-byte big-endian opcode:
//
// opcode   operation
// 1        Read req (RRQ)
// 2        Write req (WRQ)
// 3        Data (DATA)
// 4        ACK
// 5        ERROR
// 6        Option ack (OACK)
//
// RRQ/WRQ: opcode | filename | 0x00 | mode | 0x00 | [optname | 0x00 | optvalue | 0x00]*
// DATA:    opcode | block # (2 bytes) | payload (0..blksize bytes)
// ACK:     opcode | block # (2 bytes)
// ERROR:   opcode | error code (2 bytes) | message | 0x00
// OACK:    opcode | [optname | 0x00 | optvalue | 0x00]*

use std::error;
use std::fmt;
use std::io;

/// Block size used when no `blksize` option has been negotiated.
pub const DEFAULT_BLOCK_SIZE: u16 = 512;

/// Smallest block size a peer may ask for (RFC 2348).
pub const MIN_BLOCK_SIZE: u16 = 8;

/// Largest block size a peer may ask for (RFC 2348).
pub const MAX_BLOCK_SIZE: u16 = 65464;

/// Enough room for the largest DATA datagram the protocol allows.
pub const MAX_DATAGRAM_SIZE: usize = 4 + MAX_BLOCK_SIZE as usize;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents a failure to parse a datagram off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatagramError {
    /// Fewer bytes than the datagram's fixed header needs.
    TooShort(usize),
    UnknownOpcode(u16),
    Malformed(String),
}

impl DatagramError {
    /// Every parse failure is answered with an "illegal TFTP operation" error.
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::IllegalOp
    }
}

impl error::Error for DatagramError {}

impl fmt::Display for DatagramError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DatagramError::TooShort(len) => write!(f, "Datagram too short: {len} bytes"),
            DatagramError::UnknownOpcode(op) => write!(f, "Unknown opcode: {op}"),
            DatagramError::Malformed(e) => write!(f, "Malformed datagram: {e}"),
        }
    }
}

pub type DatagramResult<T> = Result<T, DatagramError>;

/// The opcode carried in the first two bytes of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    OAck = 6,
}

impl TryFrom<u16> for OpCode {
    type Error = DatagramError;

    fn try_from(raw: u16) -> DatagramResult<OpCode> {
        match raw {
            1 => Ok(OpCode::Rrq),
            2 => Ok(OpCode::Wrq),
            3 => Ok(OpCode::Data),
            4 => Ok(OpCode::Ack),
            5 => Ok(OpCode::Error),
            6 => Ok(OpCode::OAck),
            _ => Err(DatagramError::UnknownOpcode(raw)),
        }
    }
}

/// Represents the transfer mode requested by a RRQ or WRQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    NetAscii,
    Octet,
    Mail,
}

impl FileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }

    fn parse(raw: &str) -> DatagramResult<FileMode> {
        match raw.to_lowercase().as_str() {
            "netascii" => Ok(FileMode::NetAscii),
            "octet" => Ok(FileMode::Octet),
            "mail" => Ok(FileMode::Mail),
            _ => Err(DatagramError::Malformed(format!("Unknown file mode: '{raw}'"))),
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOp = 4,
    UnknownTid = 5,
    FileExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOp,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::NotDefined,
        }
    }

    /// The human-readable text sent along with this code when there is
    /// nothing more specific to say.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOp => "Illegal TFTP operation",
            ErrorCode::UnknownTid => "Unknown transfer ID",
            ErrorCode::FileExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileExists,
            _ => ErrorCode::NotDefined,
        }
    }
}

/// An ordered option mapping, as carried by RRQ, WRQ and OACK datagrams.
///
/// RFC 2347 does not care about the order of options, but keeping the order
/// they arrived in makes every response reproducible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(Vec<(String, String)>);

impl Options {
    pub fn new() -> Options {
        Options(Vec::new())
    }

    /// Sets `name` to `value`. An existing entry with the same name (ignoring
    /// case) keeps its position and has its value replaced.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    /// Looks an option up by name, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Options {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Options {
        let mut options = Options::new();
        for (name, value) in iter {
            options.insert(name, value);
        }
        options
    }
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let pairs: Vec<String> = self.iter().map(|(n, v)| format!("{n}={v}")).collect();
        write!(f, "{{{}}}", pairs.join(", "))
    }
}

/// An enum representing a TFTP datagram and its associated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    /// A read request
    ReadReq {
        /// The file the peer wants to read.
        filename: String,

        /// The transfer mode.
        mode: FileMode,

        /// Requested options, in the order they were sent.
        options: Options,
    },

    /// A write request
    WriteReq {
        filename: String,
        mode: FileMode,
        options: Options,
    },

    /// A data block
    Data {
        /// The block number, wrapping modulo 65536.
        block: u16,

        /// The payload. Shorter than the block size on the last block.
        data: Vec<u8>,
    },

    /// An acknowledgment
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error
    Error {
        code: ErrorCode,
        message: String,
    },

    /// An option acknowledgment
    OAck {
        /// The options the responder accepted.
        options: Options,
    },
}

/// Splits the opcode off the front of a raw datagram.
pub fn split_opcode(buf: &[u8]) -> DatagramResult<(u16, &[u8])> {
    if buf.len() < 2 {
        return Err(DatagramError::TooShort(buf.len()));
    }
    Ok((u16_from_buffer(buf), &buf[2..]))
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and runs until the
/// first 0 byte.
///
/// Returns the string as well as the position of the 0 byte (or the size of the buffer, if there
/// was none).
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let end = buf.iter().position(|b| *b == 0x00).unwrap_or(buf.len());
    (String::from_utf8_lossy(&buf[..end]).into_owned(), end)
}

/// Splits a run of NUL-terminated strings. The run itself must end with a NUL byte.
fn nul_terminated_fields(buf: &[u8]) -> DatagramResult<Vec<String>> {
    match buf.split_last() {
        Some((0x00, fields)) => Ok(fields
            .split(|b| *b == 0x00)
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect()),
        _ => Err(DatagramError::Malformed(
            "Strings must be terminated with a null byte!".to_string(),
        )),
    }
}

/// Pairs up option names and values. A name without a value is dropped.
fn collect_options(mut fields: impl Iterator<Item = String>) -> Options {
    let mut options = Options::new();
    while let (Some(name), Some(value)) = (fields.next(), fields.next()) {
        options.insert(name, value);
    }
    options
}

fn parse_request(buf: &[u8]) -> DatagramResult<(String, FileMode, Options)> {
    let mut fields = nul_terminated_fields(buf)?.into_iter();
    let filename = fields.next().unwrap_or_default();
    let raw_mode = fields.next().ok_or_else(|| {
        DatagramError::Malformed("Request does not contain a mode, but it needs to!".to_string())
    })?;
    let mode = FileMode::parse(&raw_mode)?;
    Ok((filename, mode, collect_options(fields)))
}

fn parse_block(buf: &[u8]) -> DatagramResult<u16> {
    if buf.len() < 2 {
        return Err(DatagramError::TooShort(buf.len() + 2));
    }
    Ok(u16_from_buffer(buf))
}

fn parse_error(buf: &[u8]) -> DatagramResult<Datagram> {
    let code = ErrorCode::from_u16(parse_block(buf)?);
    let (message, _) = string_from_buffer(&buf[2..]);
    Ok(Datagram::Error { code, message })
}

fn parse_oack(buf: &[u8]) -> DatagramResult<Datagram> {
    if buf.is_empty() {
        return Ok(Datagram::OAck { options: Options::new() });
    }
    let fields = nul_terminated_fields(buf)?;
    Ok(Datagram::OAck { options: collect_options(fields.into_iter()) })
}

fn push_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0x00);
}

fn push_options(buf: &mut Vec<u8>, options: &Options) {
    for (name, value) in options.iter() {
        push_string(buf, name);
        push_string(buf, value);
    }
}

impl Datagram {
    /// Builds the datagram for an already-split opcode and body.
    pub fn from_parts(opcode: u16, rest: &[u8]) -> DatagramResult<Datagram> {
        match OpCode::try_from(opcode)? {
            OpCode::Rrq => {
                let (filename, mode, options) = parse_request(rest)?;
                Ok(Datagram::ReadReq { filename, mode, options })
            }
            OpCode::Wrq => {
                let (filename, mode, options) = parse_request(rest)?;
                Ok(Datagram::WriteReq { filename, mode, options })
            }
            OpCode::Data => {
                let block = parse_block(rest)?;
                Ok(Datagram::Data { block, data: rest[2..].to_vec() })
            }
            OpCode::Ack => Ok(Datagram::Ack { block: parse_block(rest)? }),
            OpCode::Error => parse_error(rest),
            OpCode::OAck => parse_oack(rest),
        }
    }

    pub fn from_wire(buf: &[u8]) -> DatagramResult<Datagram> {
        let (opcode, rest) = split_opcode(buf)?;
        Datagram::from_parts(opcode, rest)
    }

    /// An ERROR datagram carrying the stock message for `code`.
    pub fn error_from_code(code: ErrorCode) -> Datagram {
        Datagram::Error { code, message: code.default_message().to_string() }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Datagram::ReadReq { .. } => OpCode::Rrq,
            Datagram::WriteReq { .. } => OpCode::Wrq,
            Datagram::Data { .. } => OpCode::Data,
            Datagram::Ack { .. } => OpCode::Ack,
            Datagram::Error { .. } => OpCode::Error,
            Datagram::OAck { .. } => OpCode::OAck,
        }
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&(self.opcode() as u16).to_be_bytes());
        match self {
            Datagram::ReadReq { filename, mode, options }
            | Datagram::WriteReq { filename, mode, options } => {
                push_string(&mut buf, filename);
                push_string(&mut buf, mode.as_str());
                push_options(&mut buf, options);
            }
            Datagram::Data { block, data } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Datagram::Ack { block } => buf.extend_from_slice(&block.to_be_bytes()),
            Datagram::Error { code, message } => {
                buf.extend_from_slice(&(*code as u16).to_be_bytes());
                push_string(&mut buf, message);
            }
            Datagram::OAck { options } => push_options(&mut buf, options),
        }
        buf
    }
}

impl fmt::Display for Datagram {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Datagram::ReadReq { filename, mode, options } => {
                write!(f, "RRQ '{filename}' ({}) {options}", mode.as_str())
            }
            Datagram::WriteReq { filename, mode, options } => {
                write!(f, "WRQ '{filename}' ({}) {options}", mode.as_str())
            }
            Datagram::Data { block, data } => write!(f, "DATA block {block} ({} bytes)", data.len()),
            Datagram::Ack { block } => write!(f, "ACK block {block}"),
            Datagram::Error { code, message } => write!(f, "ERROR {code:?}: '{message}'"),
            Datagram::OAck { options } => write!(f, "OACK {options}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_read_req() {
        let buf = vec![
            // opcode
            0x00, 0x01,
            // path: /path/to/data.txt with terminating nullchar
            0x2F, 0x70, 0x61, 0x74, 0x68, 0x2F, 0x74, 0x6F, 0x2F, 0x64, 0x61, 0x74, 0x61, 0x2E, 0x74, 0x78, 0x74, 0x00,
            // mode: mail
            0x6D, 0x61, 0x69, 0x6C, 0x00];

        let packet = Datagram::from_wire(&buf);
        assert!(packet.is_ok());
        assert_eq!(
            packet.unwrap(),
            Datagram::ReadReq {
                filename: "/path/to/data.txt".to_string(),
                mode: FileMode::Mail,
                options: Options::new(),
            }
        );
    }

    #[test]
    fn test_packet_write_req_with_options() {
        let buf = b"\x00\x02pxelinux.0\x00OCTET\x00blksize\x001024\x00tsize\x000\x00".to_vec();

        let packet = Datagram::from_wire(&buf).unwrap();
        let options: Options = [("blksize", "1024"), ("tsize", "0")].into_iter().collect();
        assert_eq!(
            packet,
            Datagram::WriteReq {
                filename: "pxelinux.0".to_string(),
                mode: FileMode::Octet,
                options,
            }
        );
    }

    #[test]
    fn test_request_drops_unpaired_option() {
        let buf = b"\x00\x01file\x00octet\x00timeout\x005\x00blksize\x00".to_vec();
        match Datagram::from_wire(&buf).unwrap() {
            Datagram::ReadReq { options, .. } => {
                assert_eq!(options.len(), 1);
                assert_eq!(options.get("TIMEOUT"), Some("5"));
            }
            other => panic!("Expected a read request, got {other:?}"),
        }
    }

    #[test]
    fn test_packet_parses_data() {
        let buf = vec![
            // opcode
            0x00, 0x03,
            // block number
            0x12, 0x34,
            // data
            0xDE, 0xAD, 0xBE, 0xEF];

        let packet = Datagram::from_wire(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Datagram::Data { block: 0x1234, data: vec![0xDE, 0xAD, 0xBE, 0xEF] });
    }

    #[test]
    fn test_packet_parses_empty_data() {
        let packet = Datagram::from_wire(&[0x00, 0x03, 0x00, 0x07]).unwrap();
        assert_eq!(packet, Datagram::Data { block: 7, data: vec![] });
    }

    #[test]
    fn test_packet_parses_ack() {
        let buf = vec![0x00, 0x04, 0x10, 0x2f];
        let packet = Datagram::from_wire(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Datagram::Ack { block: 0x102f });
    }

    #[test]
    fn test_packet_parses_error() {
        let buf = vec![
            // opcode
            0x00, 0x05,
            // Error code
            0x00, 0x04,
            // Error message: Illegal!
            0x49, 0x6C, 0x6C, 0x65, 0x67, 0x61, 0x6C, 0x21, 0x00];

        let packet = Datagram::from_wire(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Datagram::Error { code: ErrorCode::IllegalOp, message: "Illegal!".to_string() });
    }

    #[test]
    fn test_packet_parses_oack() {
        let buf = b"\x00\x06blksize\x001428\x00tsize\x0045\x00".to_vec();
        let packet = Datagram::from_wire(&buf).unwrap();
        let options: Options = [("blksize", "1428"), ("tsize", "45")].into_iter().collect();
        assert_eq!(packet, Datagram::OAck { options });
    }

    #[test]
    fn test_packet_parse_failures() {
        // Too short for an opcode
        assert_eq!(Datagram::from_wire(&[0x10]), Err(DatagramError::TooShort(1)));
        // Invalid opcodes
        assert_eq!(Datagram::from_wire(&[0x10, 0x00]), Err(DatagramError::UnknownOpcode(0x1000)));
        assert_eq!(Datagram::from_wire(&[0x00, 0x09]), Err(DatagramError::UnknownOpcode(9)));
        // Invalid read path
        assert!(Datagram::from_wire(&[0x00, 0x01, 0x68, 0x69]).is_err());
        // Missing mode string
        assert!(Datagram::from_wire(&[0x00, 0x01, 0x68, 0x69, 0x00]).is_err());
        // Invalid mode string
        assert!(Datagram::from_wire(&[0x00, 0x01, 0x68, 0x69, 0x00, 0x62, 0x61, 0x64, 0x00]).is_err());
        // Block number cut short
        assert!(Datagram::from_wire(&[0x00, 0x04, 0x01]).is_err());
        // Unterminated OACK
        assert!(Datagram::from_wire(b"\x00\x06blksize\x00512").is_err());
    }

    #[test]
    fn test_parse_errors_map_to_illegal_op() {
        let err = Datagram::from_wire(&[0x00, 0x09]).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::IllegalOp);
    }

    #[test]
    fn test_split_opcode() {
        let (opcode, rest) = split_opcode(&[0x00, 0x04, 0x00, 0x01]).unwrap();
        assert_eq!(opcode, 4);
        assert_eq!(rest, &[0x00, 0x01]);
        assert!(split_opcode(&[0x00]).is_err());
    }

    #[test]
    fn test_datagrams_survive_the_wire() {
        let mut options = Options::new();
        options.insert("tsize", "0");
        options.insert("blksize", "1468");
        options.insert("timeout", "3");

        let datagrams = vec![
            Datagram::ReadReq { filename: "grubx64.efi".to_string(), mode: FileMode::Octet, options: options.clone() },
            Datagram::WriteReq { filename: "upload".to_string(), mode: FileMode::NetAscii, options: Options::new() },
            Datagram::Data { block: 65535, data: vec![0xAB; 512] },
            Datagram::Ack { block: 0 },
            Datagram::error_from_code(ErrorCode::DiskFull),
            Datagram::OAck { options },
        ];

        for datagram in datagrams {
            let wire = datagram.to_wire();
            let (opcode, rest) = split_opcode(&wire).unwrap();
            assert_eq!(opcode, datagram.opcode() as u16);
            assert_eq!(Datagram::from_parts(opcode, rest).unwrap(), datagram);
        }
    }

    #[test]
    fn test_oack_preserves_option_order() {
        let options: Options = [("tsize", "10"), ("blksize", "9")].into_iter().collect();
        let wire = Datagram::OAck { options }.to_wire();
        assert_eq!(wire, b"\x00\x06tsize\x0010\x00blksize\x009\x00".to_vec());
    }

    #[test]
    fn test_error_from_code() {
        assert_eq!(
            Datagram::error_from_code(ErrorCode::UnknownTid).to_wire(),
            b"\x00\x05\x00\x05Unknown transfer ID\x00".to_vec()
        );
        assert_eq!(
            Datagram::error_from_code(ErrorCode::NotDefined),
            Datagram::Error { code: ErrorCode::NotDefined, message: String::new() }
        );
    }

    #[test]
    fn test_options_replace_in_place() {
        let mut options = Options::new();
        options.insert("blksize", "512");
        options.insert("tsize", "0");
        options.insert("BLKSIZE", "1024");
        assert_eq!(options.iter().collect::<Vec<_>>(), vec![("blksize", "1024"), ("tsize", "0")]);
    }

    #[test]
    fn test_io_error_kinds_map_to_codes() {
        assert_eq!(ErrorCode::from(io::ErrorKind::NotFound), ErrorCode::FileNotFound);
        assert_eq!(ErrorCode::from(io::ErrorKind::PermissionDenied), ErrorCode::AccessViolation);
        assert_eq!(ErrorCode::from(io::ErrorKind::AlreadyExists), ErrorCode::FileExists);
        assert_eq!(ErrorCode::from(io::ErrorKind::Interrupted), ErrorCode::NotDefined);
    }
}

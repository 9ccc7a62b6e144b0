use async_io::Async;
use std::collections::BTreeMap;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Default payload size per data block (RFC 1350).
pub const DEF_BLOCK_SIZE: u16 = 512;
/// Smallest negotiable block size (RFC 2348).
pub const MIN_BLOCK_SIZE: u16 = 8;
/// Largest negotiable block size (RFC 2348).
pub const MAX_BLOCK_SIZE: u16 = 65464;
/// Default window size: one block per acknowledgment (RFC 7440).
pub const DEF_WINDOW_SIZE: u16 = 1;

/// Largest datagram we ever need to receive: opcode + block number + the
/// largest negotiable payload.
pub const MAX_PACKET_SIZE: usize = 4 + MAX_BLOCK_SIZE as usize;

pub const BLKSIZE_OPT: &str = "blksize";
pub const WINDOWSIZE_OPT: &str = "windowsize";

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP socket handler.
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "socket IO error: {e}"),
            SocketError::PacketParse(e) => write!(f, "packet parsing error: {e}"),
            SocketError::Timeout(e) => write!(f, "socket IO timeout: {e}"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

type TftpResult<T> = Result<T, SocketError>;

/// Represents the mode for a file the client wishes to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    NetAscii,
    Octet,
    Mail,
}

impl FileMode {
    fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }
}

/// Represents a TFTP error code surfaced by a TFTP Error packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
    /// Option negotiation was refused (RFC 2347).
    OptionsRefused,
}

impl ErrorCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::OptionsRefused => 8,
        }
    }

    fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::OptionsRefused,
            _ => ErrorCode::Undefined,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            io::ErrorKind::StorageFull => ErrorCode::DiskFull,
            _ => ErrorCode::Undefined,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ErrorCode::Undefined => "not defined",
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::AccessViolation => "access violation",
            ErrorCode::DiskFull => "disk full or allocation exceeded",
            ErrorCode::Illegal => "illegal TFTP operation",
            ErrorCode::UnknownTid => "unknown transfer ID",
            ErrorCode::FileAlreadyExists => "file already exists",
            ErrorCode::NoSuchUser => "no such user",
            ErrorCode::OptionsRefused => "option negotiation failed",
        };
        write!(f, "{msg}")
    }
}

/// The option list carried by request and Oack packets. A BTreeMap keeps the
/// encoded order deterministic.
pub type Options = BTreeMap<String, String>;

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, PartialEq)]
pub enum Packet {
    /// A read request packet.
    Rrq {
        /// The file path the client wants to read.
        filename: String,

        /// The file mode.
        mode: FileMode,

        /// Requested transfer options (name -> value string pairs).
        options: Options,
    },

    /// A write request packet.
    Wrq {
        filename: String,
        mode: FileMode,
        options: Options,
    },

    /// A data packet.
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet.
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: String },

    /// An option acknowledgment packet (RFC 2347).
    Oack { options: Options },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Extracts a NUL-terminated string starting at the beginning of the buffer.
/// Returns the string and the index one past its terminator.
fn string_from_buffer(buf: &[u8]) -> TftpResult<(String, usize)> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| SocketError::PacketParse("string field lacks a terminator".to_string()))?;
    let s = std::str::from_utf8(&buf[..end])
        .map_err(|_| SocketError::PacketParse("string field is not valid UTF-8".to_string()))?;
    Ok((s.to_string(), end + 1))
}

/// Parses the option list that trails a request or Oack packet: a sequence of
/// NUL-terminated (name, value) pairs. A dangling name without a value is a
/// parse error; unknown names are kept as-is for the negotiator to judge.
fn options_from_buffer(mut buf: &[u8]) -> TftpResult<Options> {
    let mut options = Options::new();
    while !buf.is_empty() {
        let (name, consumed) = string_from_buffer(buf)?;
        buf = &buf[consumed..];
        if buf.is_empty() {
            return Err(SocketError::PacketParse(format!(
                "option '{name}' has no value"
            )));
        }
        let (value, consumed) = string_from_buffer(buf)?;
        buf = &buf[consumed..];
        options.insert(name, value);
    }
    Ok(options)
}

fn parse_request(buf: &[u8]) -> TftpResult<(String, FileMode, Options)> {
    let (filename, consumed) = string_from_buffer(buf)?;
    let buf = &buf[consumed..];
    let (raw_mode, consumed) = string_from_buffer(buf)?;

    let mode = match raw_mode.to_lowercase().as_str() {
        "netascii" => FileMode::NetAscii,
        "octet" => FileMode::Octet,
        "mail" => FileMode::Mail,
        _ => {
            return Err(SocketError::PacketParse(format!(
                "unknown file mode: '{raw_mode}'"
            )))
        }
    };

    let options = options_from_buffer(&buf[consumed..])?;
    Ok((filename, mode, options))
}

impl Packet {
    pub fn parse(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 2 {
            return Err(SocketError::PacketParse(
                "packet too short for an opcode".to_string(),
            ));
        }

        match u16_from_buffer(buf) {
            1 => {
                let (filename, mode, options) = parse_request(&buf[2..])?;
                Ok(Packet::Rrq {
                    filename,
                    mode,
                    options,
                })
            }
            2 => {
                let (filename, mode, options) = parse_request(&buf[2..])?;
                Ok(Packet::Wrq {
                    filename,
                    mode,
                    options,
                })
            }
            3 => {
                if buf.len() < 4 {
                    return Err(SocketError::PacketParse(
                        "data packet lacks a block number".to_string(),
                    ));
                }
                Ok(Packet::Data {
                    block: u16_from_buffer(&buf[2..4]),
                    data: buf[4..].to_vec(),
                })
            }
            4 => {
                if buf.len() < 4 {
                    return Err(SocketError::PacketParse(
                        "ack packet lacks a block number".to_string(),
                    ));
                }
                Ok(Packet::Ack {
                    block: u16_from_buffer(&buf[2..4]),
                })
            }
            5 => {
                if buf.len() < 5 {
                    return Err(SocketError::PacketParse(
                        "error packet lacks a code or message".to_string(),
                    ));
                }
                let code = ErrorCode::from_u16(u16_from_buffer(&buf[2..4]));
                let (message, _) = string_from_buffer(&buf[4..])?;
                Ok(Packet::Error { code, message })
            }
            6 => Ok(Packet::Oack {
                options: options_from_buffer(&buf[2..])?,
            }),
            opcode => Err(SocketError::PacketParse(format!(
                "unknown opcode: {opcode}"
            ))),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Packet::Rrq {
                filename,
                mode,
                options,
            }
            | Packet::Wrq {
                filename,
                mode,
                options,
            } => {
                let opcode: u16 = if matches!(self, Packet::Rrq { .. }) { 1 } else { 2 };
                buf.extend_from_slice(&opcode.to_be_bytes());
                push_str(&mut buf, filename);
                push_str(&mut buf, mode.as_str());
                push_options(&mut buf, options);
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&3u16.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                buf.extend_from_slice(&4u16.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                buf.extend_from_slice(&5u16.to_be_bytes());
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                push_str(&mut buf, message);
            }
            Packet::Oack { options } => {
                buf.extend_from_slice(&6u16.to_be_bytes());
                push_options(&mut buf, options);
            }
        }
        buf
    }
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn push_options(buf: &mut Vec<u8>, options: &Options) {
    for (name, value) in options {
        push_str(buf, name);
        push_str(buf, value);
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(&packet.to_bytes(), dst).await?;
        Ok(())
    }

    /// Waits for the next datagram with no deadline. Parse failures surface
    /// as errors so the caller can decide whether they are fatal.
    pub async fn recv(&self) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, src) = self.sock.recv_from(&mut buf).await?;
        let packet = Packet::parse(&buf[..len])?;
        Ok((packet, src))
    }

    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;
        let packet = Packet::parse(&buf[..len])?;
        Ok((packet, src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_read_req() {
        let buf = vec![
            // opcode
            0x00, 0x01, // filename: "data.txt"
            0x64, 0x61, 0x74, 0x61, 0x2E, 0x74, 0x78, 0x74, 0x00, // mode: "octet"
            0x6F, 0x63, 0x74, 0x65, 0x74, 0x00,
        ];

        assert_eq!(
            Packet::parse(&buf).unwrap(),
            Packet::Rrq {
                filename: "data.txt".to_string(),
                mode: FileMode::Octet,
                options: Options::new(),
            }
        );
    }

    #[test]
    fn test_parse_write_req_with_options() {
        let mut buf = vec![0x00, 0x02];
        buf.extend_from_slice(b"f\0OCTET\0blksize\02048\0windowsize\08\0");

        let mut options = Options::new();
        options.insert("blksize".to_string(), "2048".to_string());
        options.insert("windowsize".to_string(), "8".to_string());

        // Mode is matched case-insensitively.
        assert_eq!(
            Packet::parse(&buf).unwrap(),
            Packet::Wrq {
                filename: "f".to_string(),
                mode: FileMode::Octet,
                options,
            }
        );
    }

    #[test]
    fn test_parse_data() {
        let buf = vec![0x00, 0x03, 0x12, 0x34, 0xDE, 0xAD, 0xBE, 0xEF];
        assert_eq!(
            Packet::parse(&buf).unwrap(),
            Packet::Data {
                block: 0x1234,
                data: vec![0xDE, 0xAD, 0xBE, 0xEF],
            }
        );
    }

    #[test]
    fn test_parse_ack() {
        let buf = vec![0x00, 0x04, 0x10, 0x2F];
        assert_eq!(Packet::parse(&buf).unwrap(), Packet::Ack { block: 0x102F });
    }

    #[test]
    fn test_parse_error() {
        let buf = vec![0x00, 0x05, 0x00, 0x04, 0x6E, 0x6F, 0x70, 0x65, 0x00];
        assert_eq!(
            Packet::parse(&buf).unwrap(),
            Packet::Error {
                code: ErrorCode::Illegal,
                message: "nope".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_oack() {
        let buf = b"\x00\x06blksize\01024\0".to_vec();
        let mut options = Options::new();
        options.insert("blksize".to_string(), "1024".to_string());
        assert_eq!(Packet::parse(&buf).unwrap(), Packet::Oack { options });

        // An Oack with no options at all is still well-formed.
        assert_eq!(
            Packet::parse(&[0x00, 0x06]).unwrap(),
            Packet::Oack {
                options: Options::new()
            }
        );
    }

    #[test]
    fn test_parse_failures() {
        // Truncated opcodes and unknown opcodes.
        assert!(Packet::parse(&[]).is_err());
        assert!(Packet::parse(&[0x10]).is_err());
        assert!(Packet::parse(&[0x00, 0x09]).is_err());
        // Filename without a terminator.
        assert!(Packet::parse(&[0x00, 0x01, 0x68, 0x69]).is_err());
        // Missing mode string.
        assert!(Packet::parse(&[0x00, 0x01, 0x68, 0x69, 0x00]).is_err());
        // Unknown mode string.
        assert!(Packet::parse(b"\x00\x01hi\0bad\0").is_err());
        // Option name with no value.
        assert!(Packet::parse(b"\x00\x01hi\0octet\0blksize\0").is_err());
        // Truncated data/ack/error packets.
        assert!(Packet::parse(&[0x00, 0x03, 0x01]).is_err());
        assert!(Packet::parse(&[0x00, 0x04, 0x01]).is_err());
        assert!(Packet::parse(&[0x00, 0x05, 0x00, 0x01]).is_err());
    }

    #[test]
    fn test_roundtrip_request_encoding() {
        let mut options = Options::new();
        options.insert("blksize".to_string(), "1024".to_string());
        let packet = Packet::Rrq {
            filename: "boot/kernel".to_string(),
            mode: FileMode::Octet,
            options,
        };

        let bytes = packet.to_bytes();
        assert_eq!(bytes, b"\x00\x01boot/kernel\0octet\0blksize\01024\0");
        assert_eq!(Packet::parse(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_encode_error() {
        let packet = Packet::Error {
            code: ErrorCode::UnknownTid,
            message: "unknown transfer ID".to_string(),
        };
        assert_eq!(packet.to_bytes(), b"\x00\x05\x00\x05unknown transfer ID\0");
    }

    #[test]
    fn test_encode_data_and_ack() {
        let data = Packet::Data {
            block: 0x0102,
            data: vec![0xAA, 0xBB],
        };
        assert_eq!(data.to_bytes(), vec![0x00, 0x03, 0x01, 0x02, 0xAA, 0xBB]);

        let ack = Packet::Ack { block: 7 };
        assert_eq!(ack.to_bytes(), vec![0x00, 0x04, 0x00, 0x07]);
    }
}

//! TFTP message framing (RFC 1350, RFC 2347).
//!
//! Every message starts with a big-endian 16-bit opcode followed by
//! opcode-specific fields:
//!
//! ```text
//! RRQ    | 01 | filename | 0 | mode | 0 | optname | 0 | optval | 0 | ...
//! DATA   | 03 | block (2) | payload (0..segsize)
//! ACK    | 04 | block (2)
//! ERROR  | 05 | code (2) | message | 0
//! OACK   | 06 | optname | 0 | optval | 0 | ...
//! ```
//!
//! Encoding and decoding are pure; no I/O happens here.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TftpError};

/// Opcode + block number.
pub const DATA_HEADER_LEN: usize = 4;
/// OACK carries only the opcode before its option pairs.
pub const OACK_HEADER_LEN: usize = 2;
/// Opcode + error code.
pub const ERROR_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Rrq = 1,   // Read request (RFC 1350)
    Wrq = 2,   // Write request (RFC 1350)
    Data = 3,  // Data packet (RFC 1350)
    Ack = 4,   // Acknowledgment (RFC 1350)
    Error = 5, // Error packet (RFC 1350)
    Oack = 6,  // Option acknowledgment (RFC 2347)
}

impl TryFrom<u16> for Opcode {
    type Error = TftpError;

    fn try_from(value: u16) -> std::result::Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            _ => Err(TftpError::UnknownOpcode(value)),
        }
    }
}

// RFC 1350 - TFTP Error Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,        // Not defined, see error message
    FileNotFound = 1,      // File not found
    AccessViolation = 2,   // Access violation
    DiskFull = 3,          // Disk full or allocation exceeded
    IllegalOperation = 4,  // Illegal TFTP operation
    UnknownTid = 5,        // Unknown transfer ID
    FileExists = 6,        // File already exists
    NoSuchUser = 7,        // No such user
    OptionNegotiation = 8, // RFC 2347 - Option negotiation failure
}

impl From<u16> for ErrorCode {
    /// Codes outside the RFC range collapse to `NotDefined`.
    fn from(value: u16) -> Self {
        match value {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::OptionNegotiation,
            _ => ErrorCode::NotDefined,
        }
    }
}

/// One `name\0value\0` pair from an RRQ or OACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpOption {
    pub name: String,
    pub value: String,
}

impl TftpOption {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReadRequest {
        filename: String,
        mode: String,
        options: Vec<TftpOption>,
    },
    Data {
        block: u16,
        payload: Bytes,
    },
    Ack {
        block: u16,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    OptionAck {
        options: Vec<TftpOption>,
    },
}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::ReadRequest { .. } => Opcode::Rrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::OptionAck { .. } => Opcode::Oack,
        }
    }

    /// Number of bytes `encode_into` will write.
    pub fn encoded_len(&self) -> usize {
        let options_len = |options: &[TftpOption]| -> usize {
            options
                .iter()
                .map(|o| o.name.len() + o.value.len() + 2)
                .sum()
        };

        match self {
            Packet::ReadRequest {
                filename,
                mode,
                options,
            } => 2 + filename.len() + 1 + mode.len() + 1 + options_len(options),
            Packet::Data { payload, .. } => DATA_HEADER_LEN + payload.len(),
            Packet::Ack { .. } => 4,
            Packet::Error { message, .. } => ERROR_HEADER_LEN + message.len() + 1,
            Packet::OptionAck { options } => OACK_HEADER_LEN + options_len(options),
        }
    }

    /// Write the wire form into `out`, refusing to exceed `limit` bytes.
    pub fn encode_into<B: BufMut>(&self, out: &mut B, limit: usize) -> Result<usize> {
        let needed = self.encoded_len();
        if needed > limit || needed > out.remaining_mut() {
            return Err(TftpError::BufferOverflow { needed, limit });
        }

        out.put_u16(self.opcode() as u16);
        match self {
            Packet::ReadRequest {
                filename,
                mode,
                options,
            } => {
                put_string(out, filename);
                put_string(out, mode);
                put_options(out, options);
            }
            Packet::Data { block, payload } => {
                out.put_u16(*block);
                out.put_slice(payload);
            }
            Packet::Ack { block } => out.put_u16(*block),
            Packet::Error { code, message } => {
                out.put_u16(*code as u16);
                put_string(out, message);
            }
            Packet::OptionAck { options } => put_options(out, options),
        }

        Ok(needed)
    }

    /// Encode into a freshly allocated buffer.
    pub fn encode(&self) -> Result<BytesMut> {
        let len = self.encoded_len();
        let mut out = BytesMut::with_capacity(len);
        self.encode_into(&mut out, len)?;
        Ok(out)
    }

    /// Decode one datagram. Never reads past `datagram.len()`.
    pub fn decode(datagram: &[u8]) -> Result<Packet> {
        let mut bytes = datagram;

        if bytes.remaining() < 2 {
            return Err(TftpError::MalformedPacket("Packet too small".to_string()));
        }

        let raw = bytes.get_u16();
        match Opcode::try_from(raw)? {
            Opcode::Rrq => {
                let filename = parse_string(&mut bytes)?;
                let mode = parse_string(&mut bytes)?;
                let options = parse_options(&mut bytes);
                Ok(Packet::ReadRequest {
                    filename,
                    mode,
                    options,
                })
            }
            Opcode::Wrq => Err(TftpError::UnsupportedOpcode(raw)),
            Opcode::Data => {
                let block = get_block(&mut bytes)?;
                Ok(Packet::Data {
                    block,
                    payload: Bytes::copy_from_slice(bytes),
                })
            }
            Opcode::Ack => Ok(Packet::Ack {
                block: get_block(&mut bytes)?,
            }),
            Opcode::Error => {
                let code = get_block(&mut bytes)?;
                // Some clients omit the terminator on the message
                let message = parse_string(&mut bytes).unwrap_or_else(|_| {
                    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                    String::from_utf8_lossy(&bytes[..end]).into_owned()
                });
                Ok(Packet::Error {
                    code: ErrorCode::from(code),
                    message,
                })
            }
            Opcode::Oack => Ok(Packet::OptionAck {
                options: parse_options(&mut bytes),
            }),
        }
    }
}

fn get_block(bytes: &mut &[u8]) -> Result<u16> {
    if bytes.remaining() < 2 {
        return Err(TftpError::MalformedPacket(
            "Missing 16-bit field".to_string(),
        ));
    }
    Ok(bytes.get_u16())
}

fn put_string<B: BufMut>(out: &mut B, s: &str) {
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

fn put_options<B: BufMut>(out: &mut B, options: &[TftpOption]) {
    for option in options {
        put_string(out, &option.name);
        put_string(out, &option.value);
    }
}

/// Parse a null-terminated string and advance past its terminator.
fn parse_string(bytes: &mut &[u8]) -> Result<String> {
    let null_pos = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TftpError::MalformedPacket("No null terminator found".to_string()))?;

    let string_bytes = &bytes[..null_pos];
    let parsed = String::from_utf8(string_bytes.to_vec())
        .map_err(|e| TftpError::MalformedPacket(format!("Invalid UTF-8: {}", e)))?;
    bytes.advance(null_pos + 1);
    Ok(parsed)
}

/// Option pairs are parsed leniently: a truncated or garbled tail ends
/// the list instead of failing the whole request (RFC 2347).
fn parse_options(bytes: &mut &[u8]) -> Vec<TftpOption> {
    let mut options = Vec::new();

    while bytes.remaining() > 0 {
        let Ok(name) = parse_string(bytes) else {
            break;
        };
        let Ok(value) = parse_string(bytes) else {
            break;
        };
        options.push(TftpOption { name, value });
    }

    options
}

//! RFC 2347 option negotiation for read requests.
//!
//! Only `blksize` (RFC 2348) changes how the transfer runs; `tsize`
//! (RFC 2349) is echoed back with the file size. Everything else is ignored,
//! as RFC 2347 asks of servers that do not support an option.

use tracing::debug;

use crate::buffer::WorkBuffer;
use crate::error::Result;
use crate::packet::{Packet, TftpOption};
use crate::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

const BLKSIZE: &str = "blksize";
const TSIZE: &str = "tsize";

/// Bitmask of options the server agreed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptedOptions(u8);

impl AcceptedOptions {
    pub const BLKSIZE: u8 = 1 << 0;
    pub const TSIZE: u8 = 1 << 1;

    pub fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub fn contains(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Apply the options of one read request to the session buffer.
///
/// A `blksize` below `MIN_BLOCK_SIZE` is ignored rather than refused, and
/// one above `MAX_BLOCK_SIZE` is lowered to it. The buffer is resized before
/// anything is read into it; allocation failure is returned to the caller.
pub fn negotiate(options: &[TftpOption], buffer: &mut WorkBuffer) -> Result<AcceptedOptions> {
    let mut accepted = AcceptedOptions::default();

    for option in options {
        match option.name.to_ascii_lowercase().as_str() {
            BLKSIZE => {
                let Ok(requested) = option.value.trim().parse::<usize>() else {
                    debug!("Ignoring non-numeric blksize {:?}", option.value);
                    continue;
                };

                if requested < MIN_BLOCK_SIZE {
                    debug!(
                        "Ignoring blksize {} below minimum {}",
                        requested, MIN_BLOCK_SIZE
                    );
                    continue;
                }

                let size = requested.min(MAX_BLOCK_SIZE);
                buffer.resize(size)?;
                accepted.set(AcceptedOptions::BLKSIZE);
            }
            TSIZE => {
                // RFC 2349: for RRQ the client sends 0 and the server
                // answers with the real size
                if option.value == "0" {
                    accepted.set(AcceptedOptions::TSIZE);
                }
            }
            _ => {
                debug!("Ignoring unknown option: {}", option.name);
            }
        }
    }

    Ok(accepted)
}

/// Build the OACK for `accepted`, or `None` when nothing was accepted.
pub fn acknowledgement(
    accepted: AcceptedOptions,
    segment_size: usize,
    file_size: u64,
) -> Option<Packet> {
    if accepted.is_empty() {
        return None;
    }

    let mut options = Vec::new();
    if accepted.contains(AcceptedOptions::BLKSIZE) {
        options.push(TftpOption::new(BLKSIZE, segment_size.to_string()));
    }
    if accepted.contains(AcceptedOptions::TSIZE) {
        options.push(TftpOption::new(TSIZE, file_size.to_string()));
    }

    Some(Packet::OptionAck { options })
}

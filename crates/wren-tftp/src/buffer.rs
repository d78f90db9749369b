//! Per-session working buffer.
//!
//! One allocation is reused for every datagram a session receives and sends.
//! It is sized for `DATA_HEADER_LEN + segment size` and only reallocated when
//! option negotiation asks for a segment size larger than what is already
//! reserved. Control messages (ERROR, OACK) may use the whole reservation,
//! which never drops below the default-sized packet.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::DEFAULT_BLOCK_SIZE;
use crate::error::{Result, TftpError};
use crate::packet::{DATA_HEADER_LEN, Opcode, Packet};

#[derive(Debug)]
pub struct WorkBuffer {
    data: Vec<u8>,
    segment_size: usize,
    reserved: usize,
}

impl WorkBuffer {
    pub fn new(segment_size: usize) -> Result<Self> {
        let mut buffer = Self {
            data: Vec::new(),
            segment_size: 0,
            reserved: 0,
        };
        buffer.resize(segment_size)?;
        Ok(buffer)
    }

    /// Switch to a new segment size, growing the allocation if needed.
    ///
    /// On allocation failure the previous segment size stays in effect.
    pub fn resize(&mut self, segment_size: usize) -> Result<()> {
        let needed = DATA_HEADER_LEN + segment_size.max(DEFAULT_BLOCK_SIZE);

        if needed > self.data.capacity() {
            self.data.clear();
            self.data
                .try_reserve_exact(needed)
                .map_err(|_| TftpError::OutOfMemory(needed))?;
        }

        self.reserved = self.reserved.max(needed);
        self.segment_size = segment_size;
        Ok(())
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Largest message this buffer may hold.
    pub fn capacity(&self) -> usize {
        self.reserved
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Zero the buffer and expose all of it for an incoming datagram.
    pub fn recv_slot(&mut self) -> &mut [u8] {
        self.data.clear();
        self.data.resize(self.reserved, 0);
        &mut self.data[..]
    }

    /// The first `len` bytes of the last received datagram.
    pub fn received(&self, len: usize) -> &[u8] {
        &self.data[..len.min(self.data.len())]
    }

    /// Encode a control message, replacing whatever the buffer held.
    pub fn encode(&mut self, packet: &Packet) -> Result<usize> {
        self.data.clear();
        packet.encode_into(&mut self.data, self.reserved)
    }

    /// Build a DATA message in place, reading up to one segment from
    /// `reader`. Returns the payload length; a value below the segment size
    /// means the reader hit end-of-file.
    pub async fn fill_data<R>(&mut self, block: u16, reader: &mut R) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let limit = DATA_HEADER_LEN + self.segment_size;
        debug_assert!(limit <= self.reserved);

        self.data.clear();
        self.data.extend_from_slice(&(Opcode::Data as u16).to_be_bytes());
        self.data.extend_from_slice(&block.to_be_bytes());
        self.data.resize(limit, 0);

        let mut filled = 0;
        while filled < self.segment_size {
            let start = DATA_HEADER_LEN + filled;
            let n = reader.read(&mut self.data[start..limit]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        self.data.truncate(DATA_HEADER_LEN + filled);
        Ok(filled)
    }
}

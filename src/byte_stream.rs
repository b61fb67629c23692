//! Bidirectional scalar/array/string (de)serialisation, transparent to
//! whatever byte source or sink backs it (plain file, piped child process,
//! chunked ZSTD container). All integers are little-endian on the wire
//! (spec §6); the stream carries the three items of context the record
//! codec needs: `vlen`, the "events packed into 32 bits" flag, and the PC
//! tracker the materialiser advances (§4.6).

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, StfError};

/// Tracks `pc`/`next_pc` across an instruction stream (§4.6).
#[derive(Debug, Clone, Copy, Default)]
pub struct PcTracker {
    pc: u64,
    next_pc: u64,
    pending_target: Option<u64>,
    force_pc_offset: u64,
}

impl PcTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configured offset a `ForcePC` record applies to its
    /// address (§4.6).
    pub fn set_force_pc_offset(&mut self, offset: u64) {
        self.force_pc_offset = offset;
    }

    /// Sets the initial PC (from a `ForcePC` header record).
    pub fn force(&mut self, addr: u64) {
        self.next_pc = addr + self.force_pc_offset;
        self.pending_target = None;
    }

    /// Records a latched branch target from an `InstPCTarget`/`EventPCTarget`.
    pub fn set_target(&mut self, target: u64) {
        self.pending_target = Some(target);
    }

    /// Advances the tracker at an opcode (marker) record and returns the PC
    /// of the instruction that just closed.
    pub fn advance(&mut self, opcode_size: u64) -> u64 {
        let pc = self.next_pc;
        self.pc = pc;
        self.next_pc = match self.pending_target.take() {
            Some(target) => target,
            None => self.next_pc + opcode_size,
        };
        pc
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }
}

/// Context threaded through every record's pack/unpack call.
#[derive(Debug, Clone, Default)]
pub struct StreamContext {
    /// Vector register length in bits. Must be set before any vector
    /// operand is packed/unpacked (§3, InstReg).
    pub vlen: Option<u32>,
    /// Whether `Event` records use the legacy 64-bit-packed encoding
    /// (`STF_CONTAIN_EVENT64`, see SPEC_FULL.md Open Questions).
    pub events_packed_32: bool,
    pub pc_tracker: PcTracker,
}

impl StreamContext {
    pub fn vlen_words(&self) -> Result<usize> {
        let vlen = self.vlen.ok_or(StfError::VLenNotSet)?;
        Ok(if vlen < 64 { 1 } else { (vlen as usize) / 64 })
    }
}

pub struct ReadStream<R> {
    inner: R,
    pub ctx: StreamContext,
}

impl<R: Read> ReadStream<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            ctx: StreamContext::default(),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn io_result<T>(r: io::Result<T>) -> Result<T> {
        r.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                StfError::Eof
            } else {
                StfError::Io(e)
            }
        })
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Self::io_result(self.inner.read_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Self::io_result(self.inner.read_u16::<LittleEndian>())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Self::io_result(self.inner.read_u32::<LittleEndian>())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Self::io_result(self.inner.read_u64::<LittleEndian>())
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        Self::io_result(self.inner.read_exact(buf))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads a length-prefixed (`u8` count) byte container.
    pub fn read_u8_len_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u8()? as usize;
        self.read_bytes(len)
    }

    /// Reads a length-prefixed UTF-8 string (`u32` length).
    pub fn read_string_u32(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|e| StfError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    /// Reads a length-prefixed (`u16` length) UTF-8 string (`TraceInfo.comment`).
    pub fn read_string_u16(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|e| StfError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    /// Reads a sequence of u64 vector-register words, sized by `vlen`.
    pub fn read_vector_data(&mut self) -> Result<Vec<u64>> {
        let words = self.ctx.vlen_words()?;
        let mut data = Vec::with_capacity(words);
        for _ in 0..words {
            data.push(self.read_u64()?);
        }
        Ok(data)
    }
}

pub struct WriteStream<W> {
    inner: W,
    pub ctx: StreamContext,
    bytes_written: u64,
}

impl<W: Write> WriteStream<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            ctx: StreamContext::default(),
            bytes_written: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.inner.write_u8(v)?;
        self.bytes_written += 1;
        Ok(())
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.inner.write_u16::<LittleEndian>(v)?;
        self.bytes_written += 2;
        Ok(())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.inner.write_u32::<LittleEndian>(v)?;
        self.bytes_written += 4;
        Ok(())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.inner.write_u64::<LittleEndian>(v)?;
        self.bytes_written += 8;
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    pub fn write_u8_len_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_u8(bytes.len() as u8)?;
        self.write_bytes(bytes)
    }

    pub fn write_string_u32(&mut self, s: &str) -> Result<()> {
        self.write_u32(s.len() as u32)?;
        self.write_bytes(s.as_bytes())
    }

    pub fn write_string_u16(&mut self, s: &str) -> Result<()> {
        self.write_u16(s.len() as u16)?;
        self.write_bytes(s.as_bytes())
    }

    pub fn write_vector_data(&mut self, data: &[u64]) -> Result<()> {
        let words = self.ctx.vlen_words()?;
        for i in 0..words {
            self.write_u64(data.get(i).copied().unwrap_or(0))?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

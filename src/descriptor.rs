//! The closed set of record kinds and their wire encoding.
//!
//! The discriminant of [`Descriptor`] *is* the encoded descriptor byte
//! written to the file; its numeric ordering is the wire contract that
//! [`crate::writer`] enforces for records inside an instruction group.
//! Records below [`Descriptor::ProcessIdExt`] only ever occur in the
//! trace header; [`Descriptor::Comment`] is the one descriptor legal in
//! both phases.

use crate::error::StfError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Descriptor {
    Identifier = 1,
    Version = 2,
    Comment = 3,
    Isa = 4,
    InstIem = 5,
    IsaExtended = 6,
    ForcePc = 7,
    TraceInfo = 8,
    TraceInfoFeature = 9,
    ProcessIdExt = 10,
    VLenConfig = 11,
    EndOfHeader = 12,
    InstReg = 13,
    InstMemAccess = 14,
    InstMemContent = 15,
    BusMasterAccess = 16,
    BusMasterContent = 17,
    Event = 18,
    EventPcTarget = 19,
    PageTableWalk = 20,
    InstPcTarget = 21,
    MicroOp = 22,
    ReadyReg = 23,
    InstOpcode16 = 24,
    InstOpcode32 = 25,
}

impl Descriptor {
    pub const MIN_BODY: Descriptor = Descriptor::ProcessIdExt;

    pub fn from_u8(byte: u8) -> Result<Self, StfError> {
        use Descriptor::*;
        Ok(match byte {
            1 => Identifier,
            2 => Version,
            3 => Comment,
            4 => Isa,
            5 => InstIem,
            6 => IsaExtended,
            7 => ForcePc,
            8 => TraceInfo,
            9 => TraceInfoFeature,
            10 => ProcessIdExt,
            11 => VLenConfig,
            12 => EndOfHeader,
            13 => InstReg,
            14 => InstMemAccess,
            15 => InstMemContent,
            16 => BusMasterAccess,
            17 => BusMasterContent,
            18 => Event,
            19 => EventPcTarget,
            20 => PageTableWalk,
            21 => InstPcTarget,
            22 => MicroOp,
            23 => ReadyReg,
            24 => InstOpcode16,
            25 => InstOpcode32,
            other => return Err(StfError::InvalidDescriptor(other)),
        })
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// A marker record is either opcode variant; it closes an instruction
    /// group and increments the marker counter used by the chunked
    /// compressor and the seek index.
    #[inline]
    pub fn is_marker(self) -> bool {
        matches!(self, Descriptor::InstOpcode16 | Descriptor::InstOpcode32)
    }

    #[inline]
    pub fn is_header_record(self) -> bool {
        (self as u8) <= Descriptor::EndOfHeader as u8
    }
}

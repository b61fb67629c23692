//! The closed set of record variants (§3), each packed/unpacked through a
//! [`ReadStream`]/[`WriteStream`]. Factory dispatch (§4.3) is a plain
//! array indexed by the encoded descriptor byte rather than virtual
//! dispatch, per SPEC_FULL.md's "Closed polymorphic record set" note.

use std::fmt;

use crate::byte_stream::{ReadStream, WriteStream};
use crate::descriptor::Descriptor;
use crate::enums::{
    BusMaster, BusMemAccessKind, EventType, Generator, Isa, InstIem, MemAccessKind, OperandKind,
    RegisterClass, TraceFeatures,
};
use crate::error::{Result, StfError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterData {
    Scalar(u64),
    Vector(Vec<u64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterOperand {
    pub num: u16,
    pub kind: OperandKind,
    pub class: RegisterClass,
    pub data: RegisterData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccess {
    pub address: u64,
    pub size: u16,
    pub attributes: u16,
    pub kind: MemAccessKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusMasterAccess {
    pub address: u64,
    pub size: u16,
    pub attributes: u16,
    pub kind: BusMemAccessKind,
    pub master: BusMaster,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: EventType,
    pub data: Vec<u64>,
    /// Set once an `EventPCTarget` record attaches to this event (§4.6).
    pub pc_target: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIdExt {
    pub tgid: u32,
    pub tid: u32,
    pub asid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTableWalk {
    pub va: u64,
    pub first_access_index: u64,
    pub page_size: u32,
    pub ptes: Vec<(u64, u64)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceInfo {
    pub generator: Generator,
    pub major: u8,
    pub minor: u8,
    pub minor_minor: u8,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsaExtended {
    pub isa: Isa,
    pub iem: InstIem,
    pub extension: String,
}

/// The closed, versioned record set (§3).
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Identifier,
    Version { major: u32, minor: u32 },
    Comment(String),
    Isa(Isa),
    InstIem(InstIem),
    IsaExtended(IsaExtended),
    ForcePc(u64),
    TraceInfo(TraceInfo),
    TraceInfoFeature(TraceFeatures),
    ProcessIdExt(ProcessIdExt),
    VLenConfig(u32),
    EndOfHeader,
    InstReg(RegisterOperand),
    InstMemAccess(MemAccess),
    InstMemContent(u64),
    BusMasterAccess(BusMasterAccess),
    BusMasterContent(u64),
    Event(Event),
    EventPcTarget(u64),
    PageTableWalk(PageTableWalk),
    InstPcTarget(u64),
    MicroOp(u64),
    ReadyReg(u16),
    InstOpcode16(u16),
    InstOpcode32(u32),
}

impl Record {
    pub fn descriptor(&self) -> Descriptor {
        use Record::*;
        match self {
            Identifier => Descriptor::Identifier,
            Version { .. } => Descriptor::Version,
            Comment(_) => Descriptor::Comment,
            Isa(_) => Descriptor::Isa,
            InstIem(_) => Descriptor::InstIem,
            IsaExtended(_) => Descriptor::IsaExtended,
            ForcePc(_) => Descriptor::ForcePc,
            TraceInfo(_) => Descriptor::TraceInfo,
            TraceInfoFeature(_) => Descriptor::TraceInfoFeature,
            ProcessIdExt(_) => Descriptor::ProcessIdExt,
            VLenConfig(_) => Descriptor::VLenConfig,
            EndOfHeader => Descriptor::EndOfHeader,
            Record::InstReg(_) => Descriptor::InstReg,
            InstMemAccess(_) => Descriptor::InstMemAccess,
            InstMemContent(_) => Descriptor::InstMemContent,
            BusMasterAccess(_) => Descriptor::BusMasterAccess,
            BusMasterContent(_) => Descriptor::BusMasterContent,
            Record::Event(_) => Descriptor::Event,
            EventPcTarget(_) => Descriptor::EventPcTarget,
            Record::PageTableWalk(_) => Descriptor::PageTableWalk,
            InstPcTarget(_) => Descriptor::InstPcTarget,
            MicroOp(_) => Descriptor::MicroOp,
            ReadyReg(_) => Descriptor::ReadyReg,
            InstOpcode16(_) => Descriptor::InstOpcode16,
            InstOpcode32(_) => Descriptor::InstOpcode32,
        }
    }

    pub fn pack<W: std::io::Write>(&self, w: &mut WriteStream<W>) -> Result<()> {
        use Record::*;
        match self {
            Identifier => w.write_bytes(b"STF"),
            Version { major, minor } => {
                w.write_u32(*major)?;
                w.write_u32(*minor)
            }
            Comment(text) => w.write_string_u32(text),
            Isa(isa) => w.write_u16(isa.to_wire()),
            InstIem(iem) => w.write_u16(iem.to_wire()),
            IsaExtended(rec) => {
                w.write_u16(rec.isa.to_wire())?;
                w.write_u16(rec.iem.to_wire())?;
                w.write_string_u16(&rec.extension)
            }
            ForcePc(addr) => w.write_u64(*addr),
            TraceInfo(info) => {
                w.write_u8(info.generator.to_wire())?;
                w.write_u8(info.major)?;
                w.write_u8(info.minor)?;
                w.write_u8(info.minor_minor)?;
                w.write_string_u16(&info.comment)
            }
            TraceInfoFeature(features) => w.write_u64(features.bits()),
            ProcessIdExt(p) => {
                w.write_u32(p.tgid)?;
                w.write_u32(p.tid)?;
                w.write_u32(p.asid)
            }
            VLenConfig(vlen) => w.write_u32(*vlen),
            EndOfHeader => Ok(()),
            Record::InstReg(op) => {
                w.write_u16(op.num)?;
                let metadata = (op.kind.to_nibble() << 4) | op.class.to_nibble();
                w.write_u8(metadata)?;
                match &op.data {
                    RegisterData::Scalar(v) => w.write_u64(*v),
                    RegisterData::Vector(words) => w.write_vector_data(words),
                }
            }
            InstMemAccess(acc) => {
                w.write_u64(acc.address)?;
                w.write_u16(acc.size)?;
                w.write_u16(acc.attributes)?;
                w.write_u8(acc.kind.to_wire())
            }
            InstMemContent(data) => w.write_u64(*data),
            BusMasterAccess(acc) => {
                w.write_u64(acc.address)?;
                w.write_u16(acc.size)?;
                w.write_u16(acc.attributes)?;
                w.write_u8(acc.kind.to_wire())?;
                w.write_u8(acc.master.to_wire())
            }
            BusMasterContent(data) => w.write_u64(*data),
            Record::Event(ev) => {
                w.write_u32(ev.event_type.0)?;
                w.write_u8(ev.data.len() as u8)?;
                for word in &ev.data {
                    w.write_u64(*word)?;
                }
                Ok(())
            }
            EventPcTarget(addr) => w.write_u64(*addr),
            Record::PageTableWalk(walk) => {
                w.write_u64(walk.va)?;
                w.write_u64(walk.first_access_index)?;
                w.write_u32(walk.page_size)?;
                w.write_u8(walk.ptes.len() as u8)?;
                for (pa, pte) in &walk.ptes {
                    w.write_u64(*pa)?;
                    w.write_u64(*pte)?;
                }
                Ok(())
            }
            InstPcTarget(addr) => w.write_u64(*addr),
            MicroOp(data) => w.write_u64(*data),
            ReadyReg(num) => w.write_u16(*num),
            InstOpcode16(op) => w.write_u16(*op),
            InstOpcode32(op) => w.write_u32(*op),
        }
    }

    pub fn format(&self, f: &mut dyn fmt::Write) -> fmt::Result {
        write!(f, "{:<18}", format!("{:?}", self.descriptor()))?;
        match self {
            Record::ForcePc(a) | Record::InstPcTarget(a) | Record::EventPcTarget(a) => {
                write!(f, "0x{:016x}", a)
            }
            Record::InstOpcode16(op) => write!(f, "0x{:04x}", op),
            Record::InstOpcode32(op) => write!(f, "0x{:08x}", op),
            Record::InstReg(op) => write!(
                f,
                "{:?} {:?} r{} {:?}",
                op.kind, op.class, op.num, op.data
            ),
            Record::InstMemAccess(a) => write!(
                f,
                "{:?} 0x{:016x} size={}",
                a.kind, a.address, a.size
            ),
            Record::InstMemContent(d) | Record::BusMasterContent(d) => write!(f, "0x{:016x}", d),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Writes the descriptor byte followed by the record's body. The inverse
/// of [`unpack_full`]; every record on the wire is preceded by this byte
/// (§4.3), so callers outside this module should use these two functions
/// rather than [`Record::pack`]/[`unpack`] directly.
pub fn pack_full<W: std::io::Write>(record: &Record, w: &mut WriteStream<W>) -> Result<()> {
    w.write_u8(record.descriptor().as_u8())?;
    record.pack(w)
}

/// Reads a descriptor byte and the record body that follows it.
pub fn unpack_full<R: std::io::Read>(r: &mut ReadStream<R>) -> Result<Record> {
    let byte = r.read_u8()?;
    let descriptor = Descriptor::from_u8(byte)?;
    unpack(descriptor, r)
}

/// Factory dispatch: constructs the record for `descriptor` by reading its
/// body from `r`. Equivalent to the C++ library's registration table of
/// constructor callbacks, realised here as a plain match rather than an
/// array of function pointers, since a closed Rust enum gives us
/// exhaustiveness checking for free.
pub fn unpack<R: std::io::Read>(
    descriptor: Descriptor,
    r: &mut ReadStream<R>,
) -> Result<Record> {
    use Descriptor as D;
    Ok(match descriptor {
        D::Identifier => {
            let mut buf = [0u8; 3];
            r.read_exact(&mut buf)?;
            if &buf != b"STF" {
                return Err(StfError::NotAnStfFile);
            }
            Record::Identifier
        }
        D::Version => Record::Version {
            major: r.read_u32()?,
            minor: r.read_u32()?,
        },
        D::Comment => Record::Comment(r.read_string_u32()?),
        D::Isa => Record::Isa(Isa::from_wire(r.read_u16()?)?),
        D::InstIem => Record::InstIem(InstIem::from_wire(r.read_u16()?)?),
        D::IsaExtended => Record::IsaExtended(IsaExtended {
            isa: Isa::from_wire(r.read_u16()?)?,
            iem: InstIem::from_wire(r.read_u16()?)?,
            extension: r.read_string_u16()?,
        }),
        D::ForcePc => Record::ForcePc(r.read_u64()?),
        D::TraceInfo => Record::TraceInfo(TraceInfo {
            generator: Generator::from_wire(r.read_u8()?)?,
            major: r.read_u8()?,
            minor: r.read_u8()?,
            minor_minor: r.read_u8()?,
            comment: r.read_string_u16()?,
        }),
        D::TraceInfoFeature => {
            Record::TraceInfoFeature(TraceFeatures::from_bits_retain(r.read_u64()?))
        }
        D::ProcessIdExt => Record::ProcessIdExt(ProcessIdExt {
            tgid: r.read_u32()?,
            tid: r.read_u32()?,
            asid: r.read_u32()?,
        }),
        D::VLenConfig => {
            let vlen = r.read_u32()?;
            r.ctx.vlen = Some(vlen);
            Record::VLenConfig(vlen)
        }
        D::EndOfHeader => Record::EndOfHeader,
        D::InstReg => {
            let num = r.read_u16()?;
            let metadata = r.read_u8()?;
            let kind = OperandKind::from_nibble(metadata >> 4)?;
            let class = RegisterClass::from_nibble(metadata & 0x0F)?;
            let data = if class.is_vector() {
                RegisterData::Vector(r.read_vector_data()?)
            } else {
                RegisterData::Scalar(r.read_u64()?)
            };
            Record::InstReg(RegisterOperand {
                num,
                kind,
                class,
                data,
            })
        }
        D::InstMemAccess => Record::InstMemAccess(MemAccess {
            address: r.read_u64()?,
            size: r.read_u16()?,
            attributes: r.read_u16()?,
            kind: MemAccessKind::from_wire(r.read_u8()?)?,
        }),
        D::InstMemContent => Record::InstMemContent(r.read_u64()?),
        D::BusMasterAccess => Record::BusMasterAccess(BusMasterAccess {
            address: r.read_u64()?,
            size: r.read_u16()?,
            attributes: r.read_u16()?,
            kind: BusMemAccessKind::from_wire(r.read_u8()?)?,
            master: BusMaster::from_wire(r.read_u8()?)?,
        }),
        D::BusMasterContent => Record::BusMasterContent(r.read_u64()?),
        D::Event => {
            let event_type = EventType(r.read_u32()?);
            let count = r.read_u8()? as usize;
            let mut data = Vec::with_capacity(count);
            for _ in 0..count {
                data.push(r.read_u64()?);
            }
            Record::Event(Event {
                event_type,
                data,
                pc_target: None,
            })
        }
        D::EventPcTarget => Record::EventPcTarget(r.read_u64()?),
        D::PageTableWalk => {
            let va = r.read_u64()?;
            let first_access_index = r.read_u64()?;
            let page_size = r.read_u32()?;
            let count = r.read_u8()? as usize;
            let mut ptes = Vec::with_capacity(count);
            for _ in 0..count {
                let pa = r.read_u64()?;
                let pte = r.read_u64()?;
                ptes.push((pa, pte));
            }
            Record::PageTableWalk(PageTableWalk {
                va,
                first_access_index,
                page_size,
                ptes,
            })
        }
        D::InstPcTarget => Record::InstPcTarget(r.read_u64()?),
        D::MicroOp => Record::MicroOp(r.read_u64()?),
        D::ReadyReg => Record::ReadyReg(r.read_u16()?),
        D::InstOpcode16 => Record::InstOpcode16(r.read_u16()?),
        D::InstOpcode32 => Record::InstOpcode32(r.read_u32()?),
    })
}

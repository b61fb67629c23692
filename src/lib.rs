//! Reader and writer for the Simple Trace Format (STF): a binary,
//! self-describing, optionally chunk-compressed trace of RISC-V program
//! execution.

mod byte_stream;
mod chunked;
mod config;
mod descriptor;
mod enums;
mod error;
mod format;
mod header;
mod index;
mod materialiser;
mod piped;
mod pool;
mod record;
mod register;
mod stream;
mod writer;

pub use byte_stream::{PcTracker, ReadStream, StreamContext, WriteStream};
pub use chunked::{
    ChunkIndexEntry, ChunkReadAhead, ChunkedFileWriter, ChunkedReader, ChunkedWriter,
    DEFAULT_CHUNK_SIZE,
};
pub use config::{
    set_show_physical_address, show_physical_address, MaterialiserConfig, StfConfig,
};
pub use descriptor::Descriptor;
pub use enums::{
    BusMaster, BusMemAccessKind, EventType, ExecutionMode, Generator, InstIem, Isa,
    MemAccessKind, OperandKind, RegisterClass, TraceFeatures,
};
pub use error::{Result, StfError};
pub use format::{format_instruction, format_vector_words};
pub use header::{read_header, HeaderInfo, HeaderWriter, CURRENT_MAJOR, CURRENT_MINOR};
pub use index::{Indexer, DEFAULT_GRANULE};
pub use materialiser::{
    BufferedWindow, Instruction, Materialiser, Opcode, PageTableWalkStream, NOP_OPCODE,
};
pub use piped::{PipedReader, PipedWriter};
pub use record::{
    self as records, BusMasterAccess, Event, IsaExtended, MemAccess, PageTableWalk, ProcessIdExt,
    Record, RegisterData, RegisterOperand, TraceInfo,
};
pub use register::RegisterBank;
pub use stream::{
    classify, derive_pte_sibling, open_pte_sibling, open_pte_sibling_stream, open_read,
    open_write, single_threaded_from_env, InputStream, OpenGuard, OutputStream, Transport,
};
pub use writer::Writer;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{Generator, Isa, TraceFeatures};
    use crate::record::TraceInfo;

    /// A trace with one instruction, written through [`Writer`] and read
    /// back through [`Materialiser`], exercises the whole pipeline this
    /// crate's modules are wired together to support.
    #[test]
    fn write_then_materialise_round_trip() {
        let mut w = Writer::new(Vec::new());
        w.header_mut()
            .set_isa(Isa::RiscV)
            .set_iem(InstIem::Rv64)
            .set_force_pc(0x8000_0000)
            .add_trace_info(TraceInfo {
                generator: Generator::Qemu,
                major: 1,
                minor: 0,
                minor_minor: 0,
                comment: "round trip".into(),
            })
            .set_features(TraceFeatures::RV64);
        w.finalize_header().unwrap();

        w.write_record(&Record::InstReg(RegisterOperand {
            num: 5,
            kind: OperandKind::Dest,
            class: RegisterClass::Integer,
            data: RegisterData::Scalar(42),
        }))
        .unwrap();
        w.write_record(&Record::InstOpcode32(0x0000_1337)).unwrap();
        let bytes = w.into_inner();

        let mut r = ReadStream::new(&bytes[..]);
        let header = read_header(&mut r).unwrap();
        assert_eq!(header.isa, Isa::RiscV);

        let mut m = Materialiser::new(r, header.iem, MaterialiserConfig::default());
        let inst = m.next_instruction().unwrap().unwrap();
        assert_eq!(inst.pc, 0x8000_0000);
        assert_eq!(inst.opcode, Opcode::Op32(0x0000_1337));
        assert_eq!(inst.dest_operands[0].num, 5);

        assert!(m.next_instruction().unwrap().is_none());
    }
}

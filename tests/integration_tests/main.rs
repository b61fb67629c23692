//! Larger-scale integration tests covering the pipeline end to end:
//! chunked containers spanning several chunks, the materialiser's
//! user-mode filter over a mixed kernel/user trace, and proptest-driven
//! writer-ordering permutations.

use proptest::prelude::*;

use stf_trace::records::{RegisterData, RegisterOperand, Record};
use stf_trace::{
    ChunkedFileWriter, ChunkedReader, Event, EventType, ExecutionMode, Generator, InstIem, Isa,
    Materialiser, MaterialiserConfig, OperandKind, Opcode, ReadStream, RegisterClass, TraceFeatures,
    Writer,
};
use stf_trace::records::TraceInfo;

fn basic_header(w: &mut Writer<Vec<u8>>) {
    w.header_mut()
        .set_isa(Isa::RiscV)
        .set_iem(InstIem::Rv64)
        .set_force_pc(0x8000_0000)
        .add_trace_info(TraceInfo {
            generator: Generator::Qemu,
            major: 1,
            minor: 0,
            minor_minor: 0,
            comment: "integration".into(),
        })
        .set_features(TraceFeatures::RV64);
    w.finalize_header().unwrap();
}

#[test]
fn chunked_container_spans_several_chunks() {
    let named = tempfile::Builder::new().suffix(".zstf").tempfile().unwrap();
    let path = named.path().to_path_buf();

    let marker_records_per_chunk = 4;
    let mut expected = Vec::new();
    {
        let mut fw = ChunkedFileWriter::create(&path, marker_records_per_chunk).unwrap();
        for i in 0..37u64 {
            let bytes = format!("record-{i}").into_bytes();
            expected.push(bytes.clone());
            fw.writer_mut().append(&bytes);
            fw.writer_mut().notify_marker(0x1000 + i * 4).unwrap();
        }
        fw.close().unwrap();
    }

    let file = std::fs::File::open(&path).unwrap();
    let mut reader = ChunkedReader::open(file, false).unwrap();
    // 37 markers at 4 per chunk is 9 full chunks plus one partial trailing chunk.
    assert_eq!(reader.chunk_count(), 10);

    let mut recovered = Vec::new();
    for idx in 0..reader.chunk_count() {
        recovered.extend_from_slice(&reader.read_chunk(idx).unwrap());
    }
    assert_eq!(recovered, expected.concat());
}

fn reg(num: u16, kind: OperandKind, value: u64) -> Record {
    Record::InstReg(RegisterOperand {
        num,
        kind,
        class: RegisterClass::Integer,
        data: RegisterData::Scalar(value),
    })
}

fn mode_change_event(to_user: bool) -> Record {
    Record::Event(Event {
        event_type: EventType::new(0, false, true),
        data: vec![if to_user {
            ExecutionMode::User.to_wire()
        } else {
            ExecutionMode::Supervisor.to_wire()
        }],
        pc_target: None,
    })
}

/// Writes a trace that starts in user mode, switches to supervisor mode,
/// runs a few instructions, then switches back, and checks that
/// `user_mode_only` skips exactly the supervisor-mode instructions —
/// with skipping starting on the instruction *after* a switch away from
/// user mode, but lifting immediately on a switch back (spec.md:146).
#[test]
fn materialiser_user_mode_filter_over_mixed_trace() {
    let mut w = Writer::new(Vec::new());
    basic_header(&mut w);

    // The mode-change-away event rides on the same instruction as its
    // register write, per the wire order (InstReg before Event). Skipping
    // starts with the *next* instruction, so this one is not skipped.
    w.write_record(&reg(9, OperandKind::Dest, 0)).unwrap();
    w.write_record(&mode_change_event(false)).unwrap();
    w.write_record(&Record::InstOpcode32(0x13)).unwrap();
    // Two fully supervisor-mode instructions, both skipped.
    for i in 0..2u16 {
        w.write_record(&reg(i + 1, OperandKind::Dest, 0)).unwrap();
        w.write_record(&Record::InstOpcode32(0x13)).unwrap();
    }
    // A switch to user mode disables skipping immediately, so this
    // instruction (carrying the event) is not skipped either.
    w.write_record(&reg(10, OperandKind::Dest, 0)).unwrap();
    w.write_record(&mode_change_event(true)).unwrap();
    w.write_record(&Record::InstOpcode32(0x13)).unwrap();
    for i in 11..13u16 {
        w.write_record(&reg(i, OperandKind::Dest, 0)).unwrap();
        w.write_record(&Record::InstOpcode32(0x13)).unwrap();
    }
    // Switch away from user mode again, as the trace's last instruction:
    // there is no following instruction to propagate the skip to, so it
    // is not skipped either.
    w.write_record(&reg(20, OperandKind::Dest, 0)).unwrap();
    w.write_record(&mode_change_event(false)).unwrap();
    w.write_record(&Record::InstOpcode32(0x13)).unwrap();

    let bytes = w.into_inner();
    let mut r = ReadStream::new(&bytes[..]);
    let header = stf_trace::read_header(&mut r).unwrap();

    let config = MaterialiserConfig {
        user_mode_only: true,
        ..Default::default()
    };
    let mut m = Materialiser::new(r, header.iem, config);

    let mut user_mode_insts = Vec::new();
    while let Some(inst) = m.next_instruction().unwrap() {
        if !inst.is_skipped {
            user_mode_insts.push(inst);
        }
    }

    // The two fully supervisor-mode instructions are skipped; every
    // mode-change-carrying instruction and every user-mode instruction
    // is not.
    assert_eq!(user_mode_insts.len(), 5);
    assert!(user_mode_insts[0].mode_change_from_user);
    assert_eq!(user_mode_insts[0].dest_operands[0].num, 9);
    assert!(user_mode_insts[1].mode_change_to_user);
    assert_eq!(user_mode_insts[1].dest_operands[0].num, 10);
    assert_eq!(user_mode_insts[2].dest_operands[0].num, 11);
    assert_eq!(user_mode_insts[3].dest_operands[0].num, 12);
    assert!(user_mode_insts[4].mode_change_from_user);
    assert_eq!(user_mode_insts[4].dest_operands[0].num, 20);
}

fn source_dest_sequence_strategy() -> impl Strategy<Value = Vec<(OperandKind, u16)>> {
    prop::collection::vec(
        (prop_oneof![Just(OperandKind::Source), Just(OperandKind::Dest)], 0u16..32),
        0..8,
    )
}

proptest! {
    /// Any interleaving of `InstReg` source/dest records (all sharing one
    /// descriptor, so every permutation is writer-legal) round-trips
    /// through the writer and materialiser with operand order preserved
    /// within each kind.
    #[test]
    fn inst_reg_interleavings_round_trip(ops in source_dest_sequence_strategy()) {
        let mut w = Writer::new(Vec::new());
        basic_header(&mut w);
        for (kind, num) in &ops {
            w.write_record(&reg(*num, *kind, 0)).unwrap();
        }
        w.write_record(&Record::InstOpcode32(0x13)).unwrap();
        let bytes = w.into_inner();

        let mut r = ReadStream::new(&bytes[..]);
        let header = stf_trace::read_header(&mut r).unwrap();
        let mut m = Materialiser::new(r, header.iem, MaterialiserConfig::default());
        let inst = m.next_instruction().unwrap().unwrap();

        let expected_sources: Vec<u16> = ops.iter().filter(|(k, _)| *k == OperandKind::Source).map(|(_, n)| *n).collect();
        let expected_dests: Vec<u16> = ops.iter().filter(|(k, _)| *k == OperandKind::Dest).map(|(_, n)| *n).collect();
        let actual_sources: Vec<u16> = inst.source_operands.iter().map(|op| op.num).collect();
        let actual_dests: Vec<u16> = inst.dest_operands.iter().map(|op| op.num).collect();

        prop_assert_eq!(actual_sources, expected_sources);
        prop_assert_eq!(actual_dests, expected_dests);
        prop_assert_eq!(inst.opcode, Opcode::Op32(0x13));
    }
}

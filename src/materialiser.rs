//! Instruction reassembly (§4.6), grounded on `stf_inst_reader.hpp`/
//! `stf_inst.hpp` (`original_source/`) for the state machine and
//! `stf_pc_tracker.cpp` for the `pc`/`next_pc` pair (realised as
//! [`crate::byte_stream::PcTracker`]).

use std::collections::VecDeque;
use std::io::Read;

use crate::byte_stream::ReadStream;
use crate::config::MaterialiserConfig;
use crate::enums::{ExecutionMode, InstIem, OperandKind, RegisterClass};
use crate::error::{Result, StfError};
use crate::record::{
    self, Event, MemAccess, ProcessIdExt, Record, RegisterData, RegisterOperand,
};

/// An instruction's opcode, closed-form per §3 (either an `InstOpcode16`
/// or `InstOpcode32` marker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Op16(u16),
    Op32(u32),
}

impl Opcode {
    pub fn size_bytes(self) -> u64 {
        match self {
            Opcode::Op16(_) => 2,
            Opcode::Op32(_) => 4,
        }
    }
}

/// The architectural nop the materialiser rewrites pending-user-syscall
/// instructions to (§4.6): `addi x0, x0, 0`.
pub const NOP_OPCODE: u32 = 0x0000_0013;

/// A fully reassembled instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub opcode: Opcode,
    pub pc: u64,
    pub iem: InstIem,
    pub process_id: ProcessIdExt,
    pub marker_index: u64,

    pub source_operands: Vec<RegisterOperand>,
    pub dest_operands: Vec<RegisterOperand>,
    pub state_operands: Vec<RegisterOperand>,

    pub mem_reads: Vec<(MemAccess, u64)>,
    pub mem_writes: Vec<(MemAccess, u64)>,

    pub events: Vec<Event>,

    /// Records that pass through unchanged and do not affect any other
    /// reassembled field: comments, micro-ops, ready-regs, page-table
    /// walks, bus-master access/content pairs.
    pub passthrough: Vec<Record>,

    pub is_fp: bool,
    pub is_load: bool,
    pub is_store: bool,
    pub is_taken_branch: bool,
    pub branch_target: Option<u64>,
    pub is_change_of_flow: bool,
    pub is_syscall: bool,
    pub is_fault: bool,
    pub is_interrupt: bool,
    pub mode_change_to_user: bool,
    pub mode_change_from_user: bool,

    pub is_skipped: bool,
    pub is_valid: bool,
}

#[derive(Debug, Default)]
struct InProgress {
    source_operands: Vec<RegisterOperand>,
    dest_operands: Vec<RegisterOperand>,
    state_operands: Vec<RegisterOperand>,
    mem_reads: Vec<(MemAccess, u64)>,
    mem_writes: Vec<(MemAccess, u64)>,
    events: Vec<Event>,
    passthrough: Vec<Record>,
    is_fp: bool,
    is_load: bool,
    is_store: bool,
    is_taken_branch: bool,
    branch_target: Option<u64>,
    is_change_of_flow: bool,
    is_syscall: bool,
    is_fault: bool,
    is_interrupt: bool,
    mode_change_to_user: bool,
    mode_change_from_user: bool,
    pending_user_syscall: bool,
}

impl InProgress {
    fn into_instruction(
        self,
        opcode: Opcode,
        pc: u64,
        iem: InstIem,
        process_id: ProcessIdExt,
        marker_index: u64,
    ) -> Instruction {
        Instruction {
            opcode,
            pc,
            iem,
            process_id,
            marker_index,
            source_operands: self.source_operands,
            dest_operands: self.dest_operands,
            state_operands: self.state_operands,
            mem_reads: self.mem_reads,
            mem_writes: self.mem_writes,
            events: self.events,
            passthrough: self.passthrough,
            is_fp: self.is_fp,
            is_load: self.is_load,
            is_store: self.is_store,
            is_taken_branch: self.is_taken_branch,
            branch_target: self.branch_target,
            is_change_of_flow: self.is_change_of_flow,
            is_syscall: self.is_syscall,
            is_fault: self.is_fault,
            is_interrupt: self.is_interrupt,
            mode_change_to_user: self.mode_change_to_user,
            mode_change_from_user: self.mode_change_from_user,
            is_skipped: false,
            is_valid: false,
        }
    }
}

/// Consumes a post-header record stream and reassembles instructions,
/// per §4.6's state machine.
pub struct Materialiser<R> {
    stream: ReadStream<R>,
    config: MaterialiserConfig,
    running_iem: InstIem,
    running_pid: ProcessIdExt,
    skipping: bool,
    /// A mode-change event latches the next `skipping` value here; it
    /// takes effect starting with the *next* instruction (§4.6), not the
    /// one carrying the event itself.
    pending_skip: Option<bool>,
    marker_index: u64,
    in_progress: InProgress,
}

impl<R: Read> Materialiser<R> {
    pub fn new(stream: ReadStream<R>, initial_iem: InstIem, config: MaterialiserConfig) -> Self {
        let mut stream = stream;
        stream.ctx.pc_tracker.set_force_pc_offset(config.force_pc_offset);
        Self {
            stream,
            config,
            running_iem: initial_iem,
            running_pid: ProcessIdExt {
                tgid: 0,
                tid: 0,
                asid: 0,
            },
            skipping: false,
            pending_skip: None,
            marker_index: 0,
            in_progress: InProgress::default(),
        }
    }

    pub fn into_inner(self) -> ReadStream<R> {
        self.stream
    }

    /// Reassembles and returns the next instruction, or `None` at a
    /// clean end of stream (EOF exactly at an instruction boundary).
    pub fn next_instruction(&mut self) -> Result<Option<Instruction>> {
        if let Some(skip) = self.pending_skip.take() {
            self.skipping = skip;
        }
        self.in_progress = InProgress::default();
        let mut first = true;
        loop {
            let rec = match record::unpack_full(&mut self.stream) {
                Ok(rec) => rec,
                Err(StfError::Eof) if first => return Ok(None),
                Err(e) => return Err(e),
            };
            first = false;

            match rec {
                Record::InstReg(op) => {
                    if op.class == RegisterClass::Float {
                        self.in_progress.is_fp = true;
                    }
                    match op.kind {
                        OperandKind::Source => self.in_progress.source_operands.push(op),
                        OperandKind::Dest => self.in_progress.dest_operands.push(op),
                        OperandKind::State | OperandKind::Reserved => {
                            self.in_progress.state_operands.push(op)
                        }
                    }
                }
                Record::InstOpcode16(op) => return Ok(Some(self.finalize(Opcode::Op16(op)))),
                Record::InstOpcode32(op) => return Ok(Some(self.finalize(Opcode::Op32(op)))),
                Record::InstMemAccess(access) => {
                    let content = match record::unpack_full(&mut self.stream)? {
                        Record::InstMemContent(v) => v,
                        _ => return Err(StfError::MissingMemContent),
                    };
                    use crate::enums::MemAccessKind as K;
                    match access.kind {
                        K::Read => {
                            self.in_progress.is_load = true;
                            self.in_progress.mem_reads.push((access, content));
                        }
                        K::Write | K::Invalid => {
                            self.in_progress.is_store = true;
                            self.in_progress.mem_writes.push((access, content));
                        }
                    }
                }
                Record::BusMasterAccess(access) => {
                    let content = match record::unpack_full(&mut self.stream)? {
                        Record::BusMasterContent(v) => v,
                        _ => return Err(StfError::MissingMemContent),
                    };
                    self.in_progress.passthrough.push(Record::BusMasterAccess(access));
                    self.in_progress.passthrough.push(Record::BusMasterContent(content));
                }
                Record::InstPcTarget(target) => {
                    self.stream.ctx.pc_tracker.set_target(target);
                    self.in_progress.is_taken_branch = true;
                    self.in_progress.branch_target = Some(target);
                }
                Record::ForcePc(addr) => {
                    self.stream.ctx.pc_tracker.force(addr);
                    self.in_progress.is_change_of_flow = true;
                }
                Record::Event(ev) => self.handle_event(ev),
                Record::EventPcTarget(target) => {
                    if let Some(last) = self.in_progress.events.last_mut() {
                        last.pc_target = Some(target);
                    }
                }
                Record::ProcessIdExt(p) => self.running_pid = p,
                Record::InstIem(new_iem) => {
                    if new_iem != self.running_iem {
                        if self.config.track_iem_changes {
                            self.running_iem = new_iem;
                        } else {
                            return Err(StfError::IemChangeNotAllowed(self.running_iem, new_iem));
                        }
                    }
                }
                other => self.in_progress.passthrough.push(other),
            }
        }
    }

    fn handle_event(&mut self, ev: Event) {
        if ev.event_type.is_mode_change() {
            let to_user = ev
                .data
                .first()
                .copied()
                .unwrap_or(u64::MAX)
                == ExecutionMode::User.to_wire();
            if self.config.user_mode_only {
                // A switch to user mode disables skipping immediately; a
                // switch away enables it starting with the next
                // instruction, per §4.6.
                if to_user {
                    self.skipping = false;
                    self.pending_skip = None;
                } else {
                    self.pending_skip = Some(true);
                }
            }
            self.in_progress.mode_change_to_user = to_user;
            self.in_progress.mode_change_from_user = !to_user;
        }
        if ev.event_type.is_syscall() {
            self.in_progress.is_syscall = true;
            if self.config.user_mode_only && !self.skipping {
                self.in_progress.pending_user_syscall = true;
            }
        }
        if ev.event_type.is_fault() {
            self.in_progress.is_fault = true;
        }
        if ev.event_type.is_interrupt() {
            self.in_progress.is_interrupt = true;
        }

        let drop = ev.event_type.is_mode_change() && self.config.filter_mode_change_events;
        if !drop {
            self.in_progress.events.push(ev);
        }
    }

    fn finalize(&mut self, opcode: Opcode) -> Instruction {
        let pc = self.stream.ctx.pc_tracker.advance(opcode.size_bytes());
        let marker_index = self.marker_index;
        self.marker_index += 1;

        let pending_user_syscall = self.in_progress.pending_user_syscall;
        let in_progress = std::mem::take(&mut self.in_progress);
        let mut inst =
            in_progress.into_instruction(opcode, pc, self.running_iem, self.running_pid, marker_index);

        if pending_user_syscall {
            inst.opcode = Opcode::Op32(NOP_OPCODE);
            inst.source_operands.clear();
            inst.dest_operands.clear();
            inst.state_operands.clear();
            inst.source_operands.push(RegisterOperand {
                num: 0,
                kind: OperandKind::Source,
                class: RegisterClass::Integer,
                data: RegisterData::Scalar(0),
            });
            inst.events.clear();
            inst.is_load = false;
            inst.is_store = false;
            inst.is_taken_branch = false;
            inst.is_syscall = false;
            inst.is_fault = false;
            inst.is_interrupt = false;
            inst.is_skipped = false;
        } else if self.skipping {
            inst.is_skipped = true;
        }
        inst.is_valid = true;
        inst
    }
}

/// Iterates the `PageTableWalk` records of a page-table sibling stream
/// (§4.6 "Separate page-table file"). The sibling is its own complete STF
/// stream, but unlike the primary trace it carries no instruction
/// boundaries to reassemble around, so this is a flat record iterator
/// rather than a `Materialiser`.
pub struct PageTableWalkStream<R> {
    stream: ReadStream<R>,
}

impl<R: Read> PageTableWalkStream<R> {
    pub fn new(stream: ReadStream<R>) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> ReadStream<R> {
        self.stream
    }

    /// Returns the next page-table-walk record, or `None` at a clean
    /// end of stream.
    pub fn next_walk(&mut self) -> Result<Option<crate::record::PageTableWalk>> {
        match record::unpack_full(&mut self.stream) {
            Ok(Record::PageTableWalk(walk)) => Ok(Some(walk)),
            Ok(_) => Err(StfError::InvalidDescriptor(crate::descriptor::Descriptor::PageTableWalk as u8)),
            Err(StfError::Eof) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

const DEFAULT_WINDOW_CAPACITY: usize = 4096;

/// A forward-only sliding window of recently materialised instructions
/// (§4.6 "Buffered window"), supporting inexpensive look-behind without
/// re-reading the stream.
pub struct BufferedWindow<R> {
    materialiser: Materialiser<R>,
    window: VecDeque<Instruction>,
    capacity: usize,
}

impl<R: Read> BufferedWindow<R> {
    pub fn new(materialiser: Materialiser<R>) -> Self {
        Self::with_capacity(materialiser, DEFAULT_WINDOW_CAPACITY)
    }

    pub fn with_capacity(materialiser: Materialiser<R>, capacity: usize) -> Self {
        Self {
            materialiser,
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Advances the underlying materialiser by one instruction, pushing
    /// it into the window (evicting the oldest entry if full), and
    /// returns a reference to it.
    pub fn advance(&mut self) -> Result<Option<&Instruction>> {
        match self.materialiser.next_instruction()? {
            Some(inst) => {
                if self.window.len() == self.capacity {
                    self.window.pop_front();
                }
                self.window.push_back(inst);
                Ok(self.window.back())
            }
            None => Ok(None),
        }
    }

    /// Looks up a previously materialised instruction by marker index,
    /// if it is still within the buffered window.
    pub fn get(&self, marker_index: u64) -> Option<&Instruction> {
        let front = self.window.front()?;
        let back = self.window.back()?;
        if marker_index < front.marker_index || marker_index > back.marker_index {
            return None;
        }
        self.window
            .get((marker_index - front.marker_index) as usize)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_stream::WriteStream;
    use crate::enums::{EventType, MemAccessKind};
    use crate::record::RegisterData;

    fn encode(records: &[Record]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut w = WriteStream::new(&mut buf);
        for r in records {
            record::pack_full(r, &mut w).unwrap();
        }
        buf
    }

    fn reg(num: u16, kind: OperandKind, value: u64) -> Record {
        Record::InstReg(RegisterOperand {
            num,
            kind,
            class: RegisterClass::Integer,
            data: RegisterData::Scalar(value),
        })
    }

    #[test]
    fn simple_instruction_materialises_with_operands_and_pc() {
        let bytes = encode(&[
            reg(1, OperandKind::Source, 10),
            reg(2, OperandKind::Dest, 20),
            Record::InstOpcode32(0x0000_1337),
        ]);
        let mut stream = ReadStream::new(&bytes[..]);
        stream.ctx.pc_tracker.force(0x8000_0000);
        let mut m = Materialiser::new(stream, InstIem::Rv64, MaterialiserConfig::default());

        let inst = m.next_instruction().unwrap().unwrap();
        assert_eq!(inst.pc, 0x8000_0000);
        assert_eq!(inst.opcode, Opcode::Op32(0x0000_1337));
        assert_eq!(inst.source_operands.len(), 1);
        assert_eq!(inst.dest_operands.len(), 1);
        assert!(inst.is_valid);
        assert!(!inst.is_skipped);

        assert!(m.next_instruction().unwrap().is_none());
    }

    #[test]
    fn mem_access_without_content_errors() {
        let mut buf = Vec::new();
        {
            let mut w = WriteStream::new(&mut buf);
            record::pack_full(
                &Record::InstMemAccess(MemAccess {
                    address: 0x1000,
                    size: 8,
                    attributes: 0,
                    kind: MemAccessKind::Read,
                }),
                &mut w,
            )
            .unwrap();
            record::pack_full(&Record::InstOpcode16(1), &mut w).unwrap();
        }
        let stream = ReadStream::new(&buf[..]);
        let mut m = Materialiser::new(stream, InstIem::Rv64, MaterialiserConfig::default());
        let err = m.next_instruction().unwrap_err();
        assert!(matches!(err, StfError::MissingMemContent));
    }

    #[test]
    fn user_mode_filter_skips_supervisor_window_and_keeps_ecall_nop() {
        let mode_change = |to_user: bool| {
            Record::Event(Event {
                event_type: EventType::new(0, false, true),
                data: vec![if to_user {
                    ExecutionMode::User.to_wire()
                } else {
                    ExecutionMode::Supervisor.to_wire()
                }],
                pc_target: None,
            })
        };
        let ecall = Record::Event(Event {
            event_type: EventType::new(EventType::SYSCALL_CODE, false, false),
            data: vec![],
            pc_target: None,
        });

        let bytes = encode(&[
            Record::InstOpcode16(1), // user instruction 0
            ecall.clone(),
            Record::InstOpcode16(2), // ecall boundary instruction (rewritten to nop)
            mode_change(false),
            Record::InstOpcode16(3), // carries the switch-away event, not yet skipped
            Record::InstOpcode16(4), // first fully-supervisor instruction, skipped
            mode_change(true),
            Record::InstOpcode16(5), // carries the switch-to-user event, unskipped immediately
        ]);

        let mut stream = ReadStream::new(&bytes[..]);
        stream.ctx.pc_tracker.force(0);
        let config = MaterialiserConfig {
            user_mode_only: true,
            ..Default::default()
        };
        let mut m = Materialiser::new(stream, InstIem::Rv64, config);

        let mut instructions = Vec::new();
        while let Some(inst) = m.next_instruction().unwrap() {
            instructions.push(inst);
        }

        assert_eq!(instructions.len(), 5);
        assert!(!instructions[0].is_skipped);
        assert_eq!(instructions[1].opcode, Opcode::Op32(NOP_OPCODE));
        assert!(!instructions[1].is_skipped);
        // Skipping starts with the *next* instruction after a switch away
        // from user mode, so the instruction carrying the event itself
        // is not skipped.
        assert!(!instructions[2].is_skipped);
        assert!(instructions[3].is_skipped);
        // A switch back to user mode disables skipping immediately, so
        // the instruction carrying that event is not skipped either.
        assert!(!instructions[4].is_skipped);
    }

    #[test]
    fn iem_change_without_tracking_is_rejected() {
        let bytes = encode(&[Record::InstIem(InstIem::Rv32), Record::InstOpcode16(1)]);
        let stream = ReadStream::new(&bytes[..]);
        let mut m = Materialiser::new(stream, InstIem::Rv64, MaterialiserConfig::default());
        let err = m.next_instruction().unwrap_err();
        assert!(matches!(err, StfError::IemChangeNotAllowed(_, _)));
    }

    #[test]
    fn iem_change_with_tracking_is_applied() {
        let bytes = encode(&[Record::InstIem(InstIem::Rv32), Record::InstOpcode16(1)]);
        let stream = ReadStream::new(&bytes[..]);
        let config = MaterialiserConfig {
            track_iem_changes: true,
            ..Default::default()
        };
        let mut m = Materialiser::new(stream, InstIem::Rv64, config);
        let inst = m.next_instruction().unwrap().unwrap();
        assert_eq!(inst.iem, InstIem::Rv32);
    }

    #[test]
    fn buffered_window_supports_look_behind() {
        let bytes = encode(&[
            Record::InstOpcode16(1),
            Record::InstOpcode16(2),
            Record::InstOpcode16(3),
        ]);
        let stream = ReadStream::new(&bytes[..]);
        let m = Materialiser::new(stream, InstIem::Rv64, MaterialiserConfig::default());
        let mut window = BufferedWindow::with_capacity(m, 2);
        window.advance().unwrap();
        window.advance().unwrap();
        window.advance().unwrap();
        assert_eq!(window.len(), 2);
        assert!(window.get(0).is_none());
        assert_eq!(window.get(1).unwrap().marker_index, 1);
        assert_eq!(window.get(2).unwrap().marker_index, 2);
    }
}

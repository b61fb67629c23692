//! Human-readable trace dump (§6), grounded on `perf_file.rs`'s
//! struct-field `Debug`/display conventions for fixed-width diagnostic
//! dumps, generalised here to STF's documented column layout.

use std::fmt::{self, Write as _};

use crate::config::show_physical_address;
use crate::enums::RegisterClass;
use crate::materialiser::{Instruction, Opcode};
use crate::register::RegisterBank;

/// Writes one fixed-column ASCII line per instruction: PC, opcode (hex),
/// operands (register name, hex value), memory accesses (hex address +
/// kind), and event names. Physical-address columns are included iff
/// [`show_physical_address`] is set. Vector register data is written
/// `vlen`-word-at-a-time by the caller via [`format_register_value`].
pub fn format_instruction(out: &mut impl fmt::Write, inst: &Instruction, regs: &RegisterBank) -> fmt::Result {
    match inst.opcode {
        Opcode::Op16(op) => write!(out, "{:016x} {:04x}     ", inst.pc, op)?,
        Opcode::Op32(op) => write!(out, "{:016x} {:08x} ", inst.pc, op)?,
    }

    if inst.is_skipped {
        write!(out, "[skipped] ")?;
    }

    for op in &inst.source_operands {
        write!(out, "ir ")?;
        format_operand(out, op, regs)?;
        write!(out, " ")?;
    }
    for op in &inst.dest_operands {
        write!(out, "or ")?;
        format_operand(out, op, regs)?;
        write!(out, " ")?;
    }

    for (access, content) in &inst.mem_reads {
        write!(out, "R 0x{:016x} ", access.address)?;
        if show_physical_address() {
            write!(out, "(pa 0x{:016x}) ", access.address)?;
        }
        write!(out, "0x{:016x} ", content)?;
    }
    for (access, content) in &inst.mem_writes {
        write!(out, "W 0x{:016x} ", access.address)?;
        if show_physical_address() {
            write!(out, "(pa 0x{:016x}) ", access.address)?;
        }
        write!(out, "0x{:016x} ", content)?;
    }

    for ev in &inst.events {
        write!(out, "EVENT {} ", event_name(ev))?;
        if let Some(target) = ev.pc_target {
            write!(out, "-> 0x{target:016x} ")?;
        }
    }

    if let Some(target) = inst.branch_target {
        write!(out, "PC_TARGET 0x{target:016x} ")?;
    }

    writeln!(out)
}

fn format_operand(out: &mut impl fmt::Write, op: &crate::record::RegisterOperand, regs: &RegisterBank) -> fmt::Result {
    let name = regs.name(op.num).map(str::to_string).unwrap_or_else(|| format!("r{}", op.num));
    match &op.data {
        crate::record::RegisterData::Scalar(v) => write!(out, "{name}:0x{v:016x}"),
        crate::record::RegisterData::Vector(words) => {
            write!(out, "{name}:[")?;
            for (i, w) in words.iter().enumerate() {
                if i > 0 {
                    write!(out, ",")?;
                }
                write!(out, "0x{w:016x}")?;
            }
            write!(out, "]")
        }
    }
}

fn event_name(ev: &crate::record::Event) -> &'static str {
    if ev.event_type.is_mode_change() {
        "MODE_CHANGE"
    } else if ev.event_type.is_syscall() {
        "SYSCALL"
    } else if ev.event_type.is_fault() {
        "FAULT"
    } else if ev.event_type.is_interrupt() {
        "INTERRUPT"
    } else {
        "EVENT"
    }
}

/// Splits or joins a vector register's raw words to `vlen`-sized words
/// for display, per §6's vector-formatting rule.
pub fn format_vector_words(words: &[u64], vlen_bits: u32) -> String {
    let mut out = String::new();
    if vlen_bits <= 64 {
        for (i, w) in words.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "0x{w:016x}");
        }
        return out;
    }
    let words_per_element = (vlen_bits / 64) as usize;
    for (i, chunk) in words.chunks(words_per_element.max(1)).enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str("0x");
        for w in chunk.iter().rev() {
            let _ = write!(out, "{w:016x}");
        }
    }
    out
}

pub fn is_float_operand(op: &crate::record::RegisterOperand) -> bool {
    op.class == RegisterClass::Float
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::InstIem;
    use crate::materialiser::{Materialiser, Opcode as Op};
    use crate::record;
    use crate::record::{Record, RegisterData, RegisterOperand};
    use crate::config::MaterialiserConfig;
    use crate::byte_stream::{ReadStream, WriteStream};
    use crate::enums::OperandKind;

    #[test]
    fn formats_a_simple_instruction() {
        let mut buf = Vec::new();
        {
            let mut w = WriteStream::new(&mut buf);
            record::pack_full(
                &Record::InstReg(RegisterOperand {
                    num: 1,
                    kind: OperandKind::Source,
                    class: RegisterClass::Integer,
                    data: RegisterData::Scalar(5),
                }),
                &mut w,
            )
            .unwrap();
            record::pack_full(&Record::InstOpcode32(0x1337), &mut w).unwrap();
        }
        let mut stream = ReadStream::new(&buf[..]);
        stream.ctx.pc_tracker.force(0x1000);
        let mut m = Materialiser::new(stream, InstIem::Rv64, MaterialiserConfig::default());
        let inst = m.next_instruction().unwrap().unwrap();
        assert_eq!(inst.opcode, Op::Op32(0x1337));

        let regs = RegisterBank::new_riscv(InstIem::Rv64);
        let mut out = String::new();
        format_instruction(&mut out, &inst, &regs).unwrap();
        assert!(out.contains("0000000000001000"));
        assert!(out.contains("00001337"));
        assert!(out.contains("x1:0x0000000000000005"));
    }

    #[test]
    fn vector_words_split_for_small_vlen() {
        let words = vec![0x1u64, 0x2, 0x3, 0x4];
        assert_eq!(format_vector_words(&words, 64), "0x0000000000000001,0x0000000000000002,0x0000000000000003,0x0000000000000004");
    }

    #[test]
    fn vector_words_join_for_large_vlen() {
        let words = vec![0x1u64, 0x2];
        let joined = format_vector_words(&words, 128);
        assert_eq!(joined, "0x00000000000000020000000000000001");
    }
}

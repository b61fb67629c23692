//! RISC-V register bank (§4.7), grounded on
//! `stf_reg_def.hpp`/`stf_reg_state.hpp` (`original_source/`) for the
//! exact mapped-register widths and shifts.

use std::collections::HashMap;

use crate::enums::InstIem;
use crate::error::{Result, StfError};

/// How a register's value is stored and interpreted.
#[derive(Debug, Clone, Copy)]
enum Mapping {
    /// Owns its own scalar storage.
    Simple,
    /// A named sub-field inside `parent`: `(parent, mask, shift)`.
    Mapped {
        parent: u16,
        mask: u64,
        shift: u32,
    },
}

struct RegisterDef {
    name: String,
    mapping: Mapping,
}

/// A sparse register number → current-value map with simple and mapped
/// (field-in-parent) registers, per §4.7.
pub struct RegisterBank {
    defs: HashMap<u16, RegisterDef>,
    values: HashMap<u16, u64>,
}

/// Well-known CSR numbers this bank gives mapped sub-fields to.
mod csr {
    pub const FFLAGS: u16 = 0x001;
    pub const FRM: u16 = 0x002;
    pub const FCSR: u16 = 0x003;
    pub const CYCLE: u16 = 0xc00;
    pub const TIME: u16 = 0xc01;
    pub const INSTRET: u16 = 0xc02;
    pub const CYCLEH: u16 = 0xc80;
    pub const TIMEH: u16 = 0xc81;
    pub const INSTRETH: u16 = 0xc82;
    pub const MCYCLE: u16 = 0xb00;
    pub const MINSTRET: u16 = 0xb02;
    pub const MCYCLEH: u16 = 0xb80;
    pub const MINSTRETH: u16 = 0xb82;
}

impl RegisterBank {
    /// Populates x0–x31, f0–f31, the standard CSR set, PMP config/address
    /// CSRs, and the counter registers, with RV32 high halves mapped in
    /// only when `iem == InstIem::Rv32` (§4.7).
    pub fn new_riscv(iem: InstIem) -> Self {
        let mut bank = Self {
            defs: HashMap::new(),
            values: HashMap::new(),
        };

        for i in 0..32u16 {
            bank.add_simple(i, format!("x{i}"));
            bank.add_simple(0x1000 + i, format!("f{i}"));
        }

        bank.add_simple(csr::FCSR, "fcsr".into());
        bank.add_mapped(csr::FFLAGS, "fflags".into(), csr::FCSR, mask(5), 0);
        bank.add_mapped(csr::FRM, "frm".into(), csr::FCSR, mask(3), 5);

        for &(num, name) in PMP_CONFIG_CSRS {
            bank.add_simple(num, name.into());
        }
        for &(num, name) in PMP_ADDR_CSRS {
            bank.add_simple(num, name.into());
        }

        bank.add_simple(csr::CYCLE, "cycle".into());
        bank.add_simple(csr::TIME, "time".into());
        bank.add_simple(csr::INSTRET, "instret".into());
        bank.add_simple(csr::MCYCLE, "mcycle".into());
        bank.add_simple(csr::MINSTRET, "minstret".into());

        if iem == InstIem::Rv32 {
            for &(hi, name, parent) in &[
                (csr::CYCLEH, "cycleh", csr::CYCLE),
                (csr::TIMEH, "timeh", csr::TIME),
                (csr::INSTRETH, "instreth", csr::INSTRET),
                (csr::MCYCLEH, "mcycleh", csr::MCYCLE),
                (csr::MINSTRETH, "minstreth", csr::MINSTRET),
            ] {
                bank.add_mapped(hi, name.into(), parent, mask(32), 32);
            }
        }

        bank
    }

    fn add_simple(&mut self, num: u16, name: String) {
        self.defs.insert(num, RegisterDef { name, mapping: Mapping::Simple });
        self.values.insert(num, 0);
    }

    fn add_mapped(&mut self, num: u16, name: String, parent: u16, mask: u64, shift: u32) {
        self.defs.insert(
            num,
            RegisterDef {
                name,
                mapping: Mapping::Mapped { parent, mask, shift },
            },
        );
    }

    /// Registers an unknown-but-legal CSR number with a generated name,
    /// so it can be read back and appears in human-readable output as
    /// `REG_CSR_UNK_<hex>` (§4.7).
    pub fn register_unknown_csr(&mut self, num: u16) {
        self.defs.entry(num).or_insert_with(|| RegisterDef {
            name: format!("REG_CSR_UNK_{num:x}"),
            mapping: Mapping::Simple,
        });
        self.values.entry(num).or_insert(0);
    }

    pub fn name(&self, num: u16) -> Option<&str> {
        self.defs.get(&num).map(|d| d.name.as_str())
    }

    /// Reads a register's current value. A mapped register composes its
    /// value from its parent's stored word; an unregistered register is
    /// a hard error.
    pub fn read(&self, num: u16) -> Result<u64> {
        let def = self.defs.get(&num).ok_or(StfError::RegNotFound(num))?;
        match def.mapping {
            Mapping::Simple => Ok(*self.values.get(&num).unwrap_or(&0)),
            Mapping::Mapped { parent, mask, shift } => {
                let parent_value = *self.values.get(&parent).unwrap_or(&0);
                Ok((parent_value >> shift) & mask)
            }
        }
    }

    /// Updates a register's value. A mapped register updates both its
    /// own stored field and the parent's composite word:
    /// `parent := (parent & !(mask << shift)) | ((value & mask) << shift)`.
    /// Updating an unregistered, non-CSR register is silently ignored and
    /// returns `false` (§4.7); CSR numbers are auto-registered as unknown
    /// before the update, so this path is only reachable for GPR/FPR
    /// indices outside the populated range.
    pub fn update(&mut self, num: u16, value: u64) -> bool {
        if !self.defs.contains_key(&num) {
            return false;
        }
        match self.defs[&num].mapping {
            Mapping::Simple => {
                self.values.insert(num, value);
            }
            Mapping::Mapped { parent, mask, shift } => {
                self.values.insert(num, value & mask);
                let parent_value = *self.values.get(&parent).unwrap_or(&0);
                let updated = (parent_value & !(mask << shift)) | ((value & mask) << shift);
                self.values.insert(parent, updated);
            }
        }
        true
    }
}

fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

const PMP_CONFIG_CSRS: &[(u16, &str)] = &[
    (0x3a0, "pmpcfg0"),
    (0x3a1, "pmpcfg1"),
    (0x3a2, "pmpcfg2"),
    (0x3a3, "pmpcfg3"),
];

const PMP_ADDR_CSRS: &[(u16, &str)] = &[
    (0x3b0, "pmpaddr0"),
    (0x3b1, "pmpaddr1"),
    (0x3b2, "pmpaddr2"),
    (0x3b3, "pmpaddr3"),
    (0x3b4, "pmpaddr4"),
    (0x3b5, "pmpaddr5"),
    (0x3b6, "pmpaddr6"),
    (0x3b7, "pmpaddr7"),
    (0x3b8, "pmpaddr8"),
    (0x3b9, "pmpaddr9"),
    (0x3ba, "pmpaddr10"),
    (0x3bb, "pmpaddr11"),
    (0x3bc, "pmpaddr12"),
    (0x3bd, "pmpaddr13"),
    (0x3be, "pmpaddr14"),
    (0x3bf, "pmpaddr15"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fflags_and_frm_compose_into_fcsr() {
        let mut bank = RegisterBank::new_riscv(InstIem::Rv64);
        assert!(bank.update(csr::FFLAGS, 0b10101));
        assert!(bank.update(csr::FRM, 0b110));
        let fcsr = bank.read(csr::FCSR).unwrap();
        assert_eq!(fcsr & 0x1f, 0b10101);
        assert_eq!((fcsr >> 5) & 0x7, 0b110);
    }

    #[test]
    fn updating_fcsr_is_visible_through_frm() {
        let mut bank = RegisterBank::new_riscv(InstIem::Rv64);
        assert!(bank.update(csr::FCSR, 0b110_10101));
        assert_eq!(bank.read(csr::FRM).unwrap(), 0b110);
        assert_eq!(bank.read(csr::FFLAGS).unwrap(), 0b10101);
    }

    #[test]
    fn rv32_high_halves_are_mapped_only_for_rv32() {
        let rv64 = RegisterBank::new_riscv(InstIem::Rv64);
        assert!(matches!(rv64.read(csr::CYCLEH), Err(StfError::RegNotFound(_))));

        let mut rv32 = RegisterBank::new_riscv(InstIem::Rv32);
        assert!(rv32.update(csr::CYCLE, 0xFFFF_FFFF));
        assert!(rv32.update(csr::CYCLEH, 0x1));
        assert_eq!(rv32.read(csr::CYCLE).unwrap(), 0xFFFF_FFFF);
        assert_eq!(rv32.read(csr::CYCLEH).unwrap(), 0x1);
    }

    #[test]
    fn unregistered_read_errors_update_is_ignored() {
        let mut bank = RegisterBank::new_riscv(InstIem::Rv64);
        assert!(matches!(bank.read(0xffff), Err(StfError::RegNotFound(0xffff))));
        assert!(!bank.update(0xffff, 1));
    }

    #[test]
    fn unknown_csr_gets_generated_name() {
        let mut bank = RegisterBank::new_riscv(InstIem::Rv64);
        bank.register_unknown_csr(0x7c0);
        assert_eq!(bank.name(0x7c0), Some("REG_CSR_UNK_7c0"));
        assert!(bank.update(0x7c0, 42));
        assert_eq!(bank.read(0x7c0).unwrap(), 42);
    }

    #[test]
    fn gpr_and_fpr_round_trip() {
        let mut bank = RegisterBank::new_riscv(InstIem::Rv64);
        assert!(bank.update(5, 0xdead_beef));
        assert_eq!(bank.read(5).unwrap(), 0xdead_beef);
        assert_eq!(bank.name(5), Some("x5"));
        assert_eq!(bank.name(0x1000 + 5), Some("f5"));
    }
}

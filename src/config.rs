//! Reader/writer/materialiser configuration (**[AMBIENT]**, SPEC_FULL.md
//! §4): a plain struct threaded through constructors rather than a
//! global, except for the one flag the human-readable formatter's output
//! contract documents as process-wide (§6).

use std::sync::atomic::{AtomicBool, Ordering};

/// Controls the [`crate::materialiser::Materialiser`]'s instruction
/// reassembly behaviour.
#[derive(Debug, Clone, Copy)]
pub struct MaterialiserConfig {
    /// When set, non-user-mode instructions are skipped (§4.6).
    pub user_mode_only: bool,
    /// When set, mode-change events are dropped rather than appended to
    /// the instruction's pass-through record map (§4.6).
    pub filter_mode_change_events: bool,
    /// Resolution of the IEM-change-tracking Open Question
    /// (SPEC_FULL.md §9): when set, an `InstIEM` record updates the
    /// running IEM even on ISAs where the library otherwise asserts no
    /// change is legal, instead of treating a changed value as an error.
    pub track_iem_changes: bool,
    /// Resolution of the page-cross-tracking Open Question: when set,
    /// the materialiser records whether an instruction's PC crosses a
    /// page boundary relative to the previous instruction.
    pub track_page_cross: bool,
    /// Page size in bytes used by `track_page_cross`.
    pub page_size: u64,
    /// Offset a `ForcePC` record's address is adjusted by before becoming
    /// `next_pc` (§4.6's PC tracker).
    pub force_pc_offset: u64,
}

impl Default for MaterialiserConfig {
    fn default() -> Self {
        Self {
            user_mode_only: false,
            filter_mode_change_events: false,
            track_iem_changes: false,
            track_page_cross: false,
            page_size: 4096,
            force_pc_offset: 0,
        }
    }
}

/// Reader/writer-level configuration: how to open a trace (§6).
#[derive(Debug, Clone, Copy, Default)]
pub struct StfConfig {
    pub materialiser: MaterialiserConfig,
    /// Open the `-pte` sibling file alongside the primary trace if
    /// present; see §4.6 "Separate page-table file".
    pub open_pte_sibling: bool,
    /// If `open_pte_sibling` is set and the sibling is missing, treat
    /// that as an error instead of silently proceeding without it.
    pub require_pte_sibling: bool,
}

static SHOW_PHYSICAL_ADDRESS: AtomicBool = AtomicBool::new(false);

/// Whether the human-readable formatter includes physical-address
/// columns (§6). Process-wide by design: it is part of the documented
/// output contract of `demos/stf_dump`, not per-reader state.
pub fn show_physical_address() -> bool {
    SHOW_PHYSICAL_ADDRESS.load(Ordering::Relaxed)
}

pub fn set_show_physical_address(show: bool) {
    SHOW_PHYSICAL_ADDRESS.store(show, Ordering::Relaxed);
}

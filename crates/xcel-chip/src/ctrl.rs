//! ap_ctrl_hs control register (`CTRL`, offset 0x00).
//!
//! Every HLS kernel synthesized with `#pragma HLS interface s_axilite port=return`
//! exposes the same block-level handshake at the base of its control window:
//!
//! ```text
//! bit  name         access  meaning
//! ───  ───────────  ──────  ─────────────────────────────────────────────
//!  0   AP_START     R/W     host asserts to launch; self-clears once taken
//!  1   AP_DONE      R/COR   set when the kernel finishes; cleared on read
//!  2   AP_IDLE      R       kernel is not processing
//!  3   AP_READY     R       kernel can accept new inputs
//!  7   AUTO_RESTART R/W     relaunch on completion (never used here)
//! ```
//!
//! The functions below are pure. They are not checked against the synthesized
//! hardware: a design built with a different block protocol silently breaks them.

/// Launch request.
pub const AP_START: u32 = 1 << 0;
/// Completion flag (clear-on-read).
pub const AP_DONE: u32 = 1 << 1;
/// Kernel idle.
pub const AP_IDLE: u32 = 1 << 2;
/// Kernel ready for new inputs.
pub const AP_READY: u32 = 1 << 3;
/// Continuous relaunch.
pub const AUTO_RESTART: u32 = 1 << 7;

/// Bits the host may write. Everything else in `CTRL` is status.
pub const HOST_WRITABLE: u32 = AP_START | AUTO_RESTART;

/// Control word that launches the kernel. Every other bit is left at 0.
#[must_use]
pub const fn start_bit() -> u32 {
    AP_START
}

/// Control word written on reset.
#[must_use]
pub const fn reset_word() -> u32 {
    0
}

/// `true` when `AP_START` is still pending.
#[must_use]
pub const fn is_started(word: u32) -> bool {
    word & AP_START != 0
}

/// `true` when the kernel has signalled completion.
#[must_use]
pub const fn is_done(word: u32) -> bool {
    word & AP_DONE != 0
}

/// `true` when the kernel is idle.
#[must_use]
pub const fn is_idle(word: u32) -> bool {
    word & AP_IDLE != 0
}

/// `true` when the kernel can accept new inputs.
#[must_use]
pub const fn is_ready(word: u32) -> bool {
    word & AP_READY != 0
}

/// Human-readable rendering for tracing, e.g. `0x6 [DONE|IDLE]`.
#[must_use]
pub fn describe(word: u32) -> String {
    let names: Vec<&str> = [
        (AP_START, "START"),
        (AP_DONE, "DONE"),
        (AP_IDLE, "IDLE"),
        (AP_READY, "READY"),
        (AUTO_RESTART, "AUTO_RESTART"),
    ]
    .iter()
    .filter(|(bit, _)| word & bit != 0)
    .map(|&(_, name)| name)
    .collect();
    format!("{word:#x} [{}]", names.join("|"))
}

//! Interrupt handler flags

use bitflags::bitflags;

bitflags! {
    /// Per-handler dispatch policy. The flags of all handlers on a line
    /// are OR-ed together for the line-wide policies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IrqFlags: u8 {
        /// Call this handler even after an earlier one acknowledged the IRQ
        const ALWAYS_CALL = 1 << 0;
        /// Chain to the previous vector even if the IRQ was acknowledged
        const ALWAYS_CHAIN = 1 << 1;
        /// Do not send End-Of-Interrupt before calling handlers
        const NO_AUTO_EOI = 1 << 2;
        /// Mask this line on the PIC while handlers run
        const NO_REENTRY = 1 << 3;
        /// Keep interrupts disabled while handlers run
        const NO_REENTRY_AT_ALL = 1 << 4;
    }
}

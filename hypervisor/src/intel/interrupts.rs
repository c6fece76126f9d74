//! The 16 level-triggered virtual interrupt lines.
//!
//! Line levels are updated under their own lock so a controller thread can
//! raise a line while another thread sits in a long run call. Pending bits are
//! atomic: the line path sets them, the run loop clears them at injection.

use {
    core::sync::atomic::{AtomicU16, Ordering},
    spin::Mutex,
};

pub const IRQ_LINES: u32 = 16;

/// The PIT is wired to line 0.
pub const TIMER_IRQ: u32 = 0;

#[derive(Debug, Default)]
pub struct InterruptLines {
    pending: AtomicU16,
    levels: Mutex<u16>,
}

impl InterruptLines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the new level of `irq`. A 0 -> 1 transition marks the line
    /// pending; lines outside the 16 modeled ones are ignored.
    pub fn set_level(&self, irq: u32, level: u32) {
        if irq >= IRQ_LINES {
            log::debug!("Ignoring level {} for unmodeled IRQ {}", level, irq);
            return;
        }

        let bit = 1u16 << irq;
        let mut levels = self.levels.lock();
        if level != 0 && *levels & bit == 0 {
            self.pending.fetch_or(bit, Ordering::AcqRel);
            log::trace!("IRQ {} raised", irq);
        }

        if level != 0 {
            *levels |= bit;
        } else {
            *levels &= !bit;
        }
    }

    /// Marks the timer line (IRQ 0) pending without touching its level, so the
    /// guest timer advances in lockstep with host timer interrupts.
    pub fn arm_timer_tick(&self) {
        self.pending.fetch_or(1 << TIMER_IRQ, Ordering::AcqRel);
    }

    pub fn pending(&self) -> u16 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn has_pending(&self) -> bool {
        self.pending() != 0
    }

    /// Clears and returns the lowest-numbered pending line.
    pub fn take_lowest(&self) -> Option<u8> {
        let previous = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                (pending != 0).then(|| pending & (pending - 1))
            })
            .ok()?;

        Some(previous.trailing_zeros() as u8)
    }

    /// Marks a taken line pending again after its injection did not happen.
    pub fn rearm(&self, irq: u8) {
        if u32::from(irq) < IRQ_LINES {
            self.pending.fetch_or(1 << irq, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rising_edge_arms_line_once() {
        let lines = InterruptLines::new();

        lines.set_level(4, 1);
        assert_eq!(lines.pending(), 1 << 4);

        // 1 -> 1 is not an edge.
        assert_eq!(lines.take_lowest(), Some(4));
        lines.set_level(4, 1);
        assert_eq!(lines.pending(), 0);
    }

    #[test]
    fn test_pending_survives_falling_level_until_delivery() {
        let lines = InterruptLines::new();

        lines.set_level(1, 1);
        lines.set_level(1, 0);
        assert!(lines.has_pending());

        assert_eq!(lines.take_lowest(), Some(1));
        assert!(!lines.has_pending());

        lines.set_level(1, 1);
        assert_eq!(lines.pending(), 1 << 1);
    }

    #[test]
    fn test_lowest_line_is_taken_first() {
        let lines = InterruptLines::new();
        lines.set_level(8, 1);
        lines.set_level(0, 1);
        lines.set_level(3, 1);

        assert_eq!(lines.take_lowest(), Some(0));
        assert_eq!(lines.take_lowest(), Some(3));
        assert_eq!(lines.take_lowest(), Some(8));
        assert_eq!(lines.take_lowest(), None);
    }

    #[test]
    fn test_timer_tick_does_not_change_level() {
        let lines = InterruptLines::new();
        lines.arm_timer_tick();
        assert_eq!(lines.take_lowest(), Some(0));

        // Level is still low, so a raise is a rising edge.
        lines.set_level(0, 1);
        assert_eq!(lines.pending(), 1);
    }

    #[test]
    fn test_rearmed_line_is_taken_again() {
        let lines = InterruptLines::new();
        lines.set_level(6, 1);
        lines.set_level(2, 1);

        assert_eq!(lines.take_lowest(), Some(2));
        lines.rearm(2);
        assert_eq!(lines.pending(), (1 << 2) | (1 << 6));
        assert_eq!(lines.take_lowest(), Some(2));

        lines.rearm(16);
        assert_eq!(lines.pending(), 1 << 6);
    }

    #[test]
    fn test_out_of_range_lines_are_ignored() {
        let lines = InterruptLines::new();
        lines.set_level(16, 1);
        lines.set_level(31, 1);

        assert_eq!(lines.pending(), 0);
    }
}

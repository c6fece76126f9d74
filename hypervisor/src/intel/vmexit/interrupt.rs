//! External interrupts that arrived while the guest was running.

use {
    crate::{
        hal::Hal,
        intel::vmexit::{ExitContext, ExitType},
        kvm::KvmExitReason,
    },
    bit_field::BitField,
};

/// Handles an external-interrupt exit.
///
/// The interrupt itself is taken by the host once interrupts are re-enabled
/// after the exit. An exit without vector information is treated as a host
/// timer tick and advances the guest timer line. A signal pending for the
/// controller stops the loop so the controller can handle it.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.9.2 Information for VM Exits Due to Vectored Events
pub fn handle_external_interrupt<H: Hal>(exit: &mut ExitContext<'_, '_, H>) -> ExitType {
    let vector_valid = exit.info.interruption_info.get_bit(31);
    if !vector_valid {
        exit.lines.arm_timer_tick();
    }

    if exit.vmcs.hal().signal_pending() {
        log::debug!("Signal pending, returning to the controller");
        exit.mailbox.set_exit_reason(KvmExitReason::Intr);
        return ExitType::Stop;
    }

    ExitType::Continue
}

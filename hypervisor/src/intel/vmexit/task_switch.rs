use {
    crate::{
        hal::Hal,
        intel::vmexit::{ExitContext, ExitType},
    },
    bit_field::BitField,
};

/// Task switches are logged and otherwise ignored.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-2. Exit Qualification for Task Switches
pub fn handle_task_switch<H: Hal>(exit: &mut ExitContext<'_, '_, H>) -> ExitType {
    let qualification = exit.info.qualification;
    log::warn!(
        "Task switch to selector {:#x} (source {}) ignored",
        qualification.get_bits(0..16),
        qualification.get_bits(30..32)
    );

    ExitType::Continue
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::{vmerror::ExitReason, vmexit::harness::*},
    };

    #[test]
    fn test_task_switch_continues_in_place() {
        let mut harness = Harness::new();
        harness.vcpu.registers.rip = 0x40;

        assert_eq!(harness.dispatch(exit(ExitReason::TASK_SWITCH, 0x28, 2)), Ok(ExitType::Continue));
        assert_eq!(harness.vcpu.registers.rip, 0x40);
    }
}

use {
    crate::{
        hal::Hal,
        intel::vmexit::{ExitContext, ExitType},
    },
    bit_field::BitField,
};

/// Debug registers are not emulated; the access is skipped.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-4. Exit Qualification for MOV DR
pub fn handle_dr_access<H: Hal>(exit: &mut ExitContext<'_, '_, H>) -> ExitType {
    let qualification = exit.info.qualification;
    log::trace!(
        "MOV {} DR{} skipped",
        if qualification.get_bit(4) { "from" } else { "to" },
        qualification.get_bits(0..3)
    );

    exit.advance_guest_rip();
    ExitType::Continue
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::{vmerror::ExitReason, vmexit::harness::*},
    };

    #[test]
    fn test_dr_access_is_skipped() {
        let mut harness = Harness::new();
        harness.vcpu.registers.rax = 0x77;

        assert_eq!(harness.dispatch(exit(ExitReason::MOV_DR, 7, 3)), Ok(ExitType::Continue));
        assert_eq!(harness.vcpu.registers.rip, 3);
        assert_eq!(harness.vcpu.registers.rax, 0x77);
    }
}

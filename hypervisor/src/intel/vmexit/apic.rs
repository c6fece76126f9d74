use {
    crate::{
        hal::Hal,
        intel::vmexit::{ExitContext, ExitType},
    },
    bit_field::BitField,
};

/// Logs a guest access to the APIC-access page and skips it.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-6. Exit Qualification for APIC-Access VM Exits
pub fn handle_apic_access<H: Hal>(exit: &mut ExitContext<'_, '_, H>) -> ExitType {
    let qualification = exit.info.qualification;
    log::info!(
        "APIC access: offset {:#x}, type {}, rip {:#x}",
        qualification.get_bits(0..12),
        qualification.get_bits(12..16),
        exit.vcpu.registers.rip
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
    fn test_apic_access_is_skipped() {
        let mut harness = Harness::new();

        // Linear write to the EOI register.
        assert_eq!(harness.dispatch(exit(ExitReason::APIC_ACCESS, (1 << 12) | 0xB0, 6)), Ok(ExitType::Continue));
        assert_eq!(harness.vcpu.registers.rip, 6);
    }
}

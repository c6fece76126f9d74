//! Handles the `CPUID` instruction: controller overrides first, native
//! execution otherwise, with the extended-state features hidden from the guest.

use {
    crate::{
        hal::{CpuidResult, Hal},
        intel::vmexit::{ExitContext, ExitType},
    },
    bitfield::BitMut,
};

/// Leaf 1 returns the feature flags.
const FEATURE_INFORMATION: u32 = 0x1;

/// Feature bits of CPUID.01H the guest is not allowed to see. The guest has no
/// extended-state support, so SSE and XSAVE stay hidden.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum HiddenEcxFeature {
    Sse3 = 0,
    Ssse3 = 9,
    Sse41 = 19,
    Sse42 = 20,
    Xsave = 26,
    Osxsave = 27,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum HiddenEdxFeature {
    Sse = 25,
    Sse2 = 26,
}

/// Clears the features of leaf 1 the guest cannot use.
pub fn mask_features(result: &mut CpuidResult) {
    for feature in [HiddenEcxFeature::Sse3, HiddenEcxFeature::Ssse3, HiddenEcxFeature::Sse41, HiddenEcxFeature::Sse42, HiddenEcxFeature::Xsave, HiddenEcxFeature::Osxsave] {
        result.ecx.set_bit(feature as usize, false);
    }
    for feature in [HiddenEdxFeature::Sse, HiddenEdxFeature::Sse2] {
        result.edx.set_bit(feature as usize, false);
    }
}

/// Handles the `CPUID` VM-exit.
///
/// The (function, index) pair in EAX/ECX is looked up in the controller's
/// table; without an exact match CPUID is executed on the host. The result is
/// written to EAX, EBX, ECX and EDX.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual, Table C-1. Basic Exit Reasons 10.
pub fn handle_cpuid<H: Hal>(exit: &mut ExitContext<'_, '_, H>) -> ExitType {
    let function = exit.vcpu.registers.rax as u32;
    let index = exit.vcpu.registers.rcx as u32;

    let mut result = match exit.vcpu.cpuid_override(function, index) {
        Some(entry) => CpuidResult { eax: entry.eax, ebx: entry.ebx, ecx: entry.ecx, edx: entry.edx },
        None => exit.vmcs.hal().cpuid(function, index),
    };

    if function == FEATURE_INFORMATION {
        mask_features(&mut result);
    }

    log::trace!("CPUID {:#x}/{:#x} -> {:x?}", function, index, result);

    let registers = &mut exit.vcpu.registers;
    registers.rax = result.eax as u64;
    registers.rbx = result.ebx as u64;
    registers.rcx = result.ecx as u64;
    registers.rdx = result.edx as u64;

    exit.advance_guest_rip();
    ExitType::Continue
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            intel::{vmerror::ExitReason, vmexit::harness::*},
            kvm::KvmCpuidEntry2,
        },
    };

    const SSE_EDX: u64 = 1 << 25 | 1 << 26;
    const HIDDEN_ECX: u64 = 1 << 0 | 1 << 9 | 1 << 19 | 1 << 20 | 1 << 26 | 1 << 27;

    fn entry(function: u32, index: u32, value: u32) -> KvmCpuidEntry2 {
        KvmCpuidEntry2 { function, index, eax: value, ebx: value + 1, ecx: value + 2, edx: value + 3, ..Default::default() }
    }

    #[test]
    fn test_override_takes_precedence() {
        let mut harness = Harness::new();
        harness.vcpu.cpuid.push(entry(0x4000_0000, 0, 0x100));
        harness.vcpu.registers.rax = 0x4000_0000;
        harness.vcpu.registers.rcx = 0;

        assert_eq!(harness.dispatch(exit(ExitReason::CPUID, 0, 2)), Ok(ExitType::Continue));

        let registers = harness.vcpu.registers;
        assert_eq!((registers.rax, registers.rbx, registers.rcx, registers.rdx), (0x100, 0x101, 0x102, 0x103));
        assert_eq!(registers.rip, 2);
        assert!(harness.hal.cpuid_calls().is_empty());
    }

    #[test]
    fn test_index_must_match_exactly() {
        let mut harness = Harness::new();
        harness.vcpu.cpuid.push(entry(4, 0, 0x100));
        harness.vcpu.registers.rax = 4;
        harness.vcpu.registers.rcx = 1;

        harness.dispatch(exit(ExitReason::CPUID, 0, 2)).unwrap();

        // The mock echoes the leaf and sub-leaf from native execution.
        assert_eq!(harness.hal.cpuid_calls(), [(4, 1)]);
        assert_eq!((harness.vcpu.registers.rax, harness.vcpu.registers.rbx), (4, 1));
    }

    #[test]
    fn test_leaf_one_is_masked_natively_and_from_overrides() {
        let mut harness = Harness::new();
        harness.vcpu.registers.rax = 1;
        harness.dispatch(exit(ExitReason::CPUID, 0, 2)).unwrap();

        assert_eq!(harness.vcpu.registers.rdx & SSE_EDX, 0);
        assert_eq!(harness.vcpu.registers.rcx & HIDDEN_ECX, 0);
        assert_eq!(harness.vcpu.registers.rcx, u32::MAX as u64 & !HIDDEN_ECX);

        harness.vcpu.cpuid.push(KvmCpuidEntry2 { function: 1, ecx: u32::MAX, edx: u32::MAX, ..Default::default() });
        harness.vcpu.registers.rax = 1;
        harness.vcpu.registers.rcx = 0;
        harness.dispatch(exit(ExitReason::CPUID, 0, 2)).unwrap();

        assert_eq!(harness.vcpu.registers.rdx, u32::MAX as u64 & !SSE_EDX);
        assert_eq!(harness.vcpu.registers.rcx & HIDDEN_ECX, 0);
    }
}

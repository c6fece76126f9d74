//! RDMSR and WRMSR against the controller's MSR table.
//!
//! Indices present in the table read and write the stored value. Anything else
//! reads the host MSR and drops writes, so the guest can never change host
//! state through an MSR. Host reads are limited to the two index ranges the
//! processor defines; other indices read as zero.

use {
    crate::{
        hal::Hal,
        intel::vmexit::{ExitContext, ExitType},
    },
};

/// Enum representing the type of MSR access.
pub enum MsrAccessType {
    Read,
    Write,
}

/// Whether `msr_id` falls in the low (0..=0x1FFF) or high
/// (0xC000_0000..=0xC000_1FFF) MSR range, the only ones the processor
/// defines MSRs in.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6.9 MSR-Bitmap Address
fn in_host_msr_range(msr_id: u32) -> bool {
    matches!(msr_id, 0..=0x1FFF | 0xC000_0000..=0xC000_1FFF)
}

/// Handles MSR access based on the provided access type.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: RDMSR—Read From Model Specific Register or WRMSR—Write to Model Specific Register
/// and Table C-1. Basic Exit Reasons 31 and 32.
pub fn handle_msr_access<H: Hal>(exit: &mut ExitContext<'_, '_, H>, access_type: MsrAccessType) -> ExitType {
    const MSR_MASK_LOW: u64 = u32::MAX as u64;

    let msr_id = exit.vcpu.registers.rcx as u32;

    match access_type {
        MsrAccessType::Read => {
            let msr_value = match exit.vcpu.msr_override(msr_id) {
                Some(value) => value,
                // Native RDMSR with a guest-chosen index. An index inside the
                // ranges that the processor does not implement still #GPs on the host.
                None if in_host_msr_range(msr_id) => exit.vmcs.hal().rdmsr(msr_id),
                None => {
                    log::debug!("RDMSR {:#x} is outside the MSR ranges, reading 0", msr_id);
                    0
                }
            };
            log::debug!("RDMSR {:#x} -> {:#x}", msr_id, msr_value);

            exit.vcpu.registers.rdx = msr_value >> 32;
            exit.vcpu.registers.rax = msr_value & MSR_MASK_LOW;
        }
        MsrAccessType::Write => {
            let registers = &exit.vcpu.registers;
            let msr_value = (registers.rdx << 32) | (registers.rax & MSR_MASK_LOW);

            if exit.vcpu.write_msr_override(msr_id, msr_value) {
                log::debug!("WRMSR {:#x} <- {:#x}", msr_id, msr_value);
            } else {
                log::debug!("WRMSR {:#x} <- {:#x} ignored", msr_id, msr_value);
            }
        }
    }

    exit.advance_guest_rip();
    ExitType::Continue
}

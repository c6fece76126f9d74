//! Control-register accesses.
//!
//! CR3 loads and stores go through a software shadow. CR0 writes are watched
//! for the paging bit: turning paging on withdraws unrestricted-guest mode and
//! turning it off restores it. Other control registers are not modeled.

use {
    crate::{
        hal::Hal,
        intel::vmexit::{ExitContext, ExitType},
    },
    bit_field::BitField,
    x86::vmx::vmcs::guest,
};

/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-3. Exit Qualification for Control-Register Accesses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrAccessType {
    MovToCr,
    MovFromCr,
    Clts,
    Lmsw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrQualification {
    pub cr: u8,
    pub access: CrAccessType,
    /// General purpose register operand, in exit-qualification encoding.
    pub register: u8,
}

impl CrQualification {
    pub fn decode(qualification: u64) -> Self {
        let access = match qualification.get_bits(4..6) {
            0 => CrAccessType::MovToCr,
            1 => CrAccessType::MovFromCr,
            2 => CrAccessType::Clts,
            _ => CrAccessType::Lmsw,
        };

        Self { cr: qualification.get_bits(0..4) as u8, access, register: qualification.get_bits(8..12) as u8 }
    }
}

/// CR0.PG
const CR0_PAGING: u64 = 1 << 31;

pub fn handle_cr_access<H: Hal>(exit: &mut ExitContext<'_, '_, H>) -> ExitType {
    let access = CrQualification::decode(exit.info.qualification);

    match (access.cr, access.access) {
        (3, CrAccessType::MovToCr) => {
            let cr3 = exit.vcpu.registers.by_index(access.register);
            exit.vcpu.cr3_shadow = cr3;

            match exit.ept.translate(cr3) {
                Some(host_pa) => log::debug!("Guest CR3 {:#x} -> {:#x}", cr3, host_pa),
                None => log::debug!("Guest CR3 {:#x} is not backed", cr3),
            }

            exit.vmcs.write(guest::CR3, cr3);
        }
        (3, CrAccessType::MovFromCr) => {
            exit.vcpu.registers.set_by_index(access.register, exit.vcpu.cr3_shadow);
        }
        (0, CrAccessType::MovToCr) => {
            let cr0 = exit.vcpu.registers.by_index(access.register);
            exit.vmcs.write(guest::CR0, cr0);

            let paging = cr0 & CR0_PAGING != 0;
            if paging != exit.vcpu.paging {
                log::info!("Guest paging {}", if paging { "enabled" } else { "disabled" });
            }
            exit.vcpu.paging = paging;
            exit.vmcs.set_guest_paging(paging);
        }
        _ => log::warn!("Unmodeled access to CR{}: {:?}", access.cr, access.access),
    }

    exit.advance_guest_rip();
    ExitType::Continue
}

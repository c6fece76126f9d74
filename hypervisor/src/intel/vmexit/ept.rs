use {
    crate::{
        hal::Hal,
        intel::vmexit::{ExitContext, ExitType},
    },
    bit_field::BitField,
    core::fmt,
};

/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-7. Exit Qualification for EPT Violations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EptViolationQualification {
    pub data_read: bool,
    pub data_write: bool,
    pub instruction_fetch: bool,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

impl EptViolationQualification {
    pub fn from_exit_qualification(qualification: u64) -> Self {
        Self {
            data_read: qualification.get_bit(0),
            data_write: qualification.get_bit(1),
            instruction_fetch: qualification.get_bit(2),
            readable: qualification.get_bit(3),
            writable: qualification.get_bit(4),
            executable: qualification.get_bit(5),
        }
    }
}

impl fmt::Display for EptViolationQualification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let access = match (self.data_read, self.data_write, self.instruction_fetch) {
            (_, true, _) => "write",
            (_, _, true) => "fetch",
            _ => "read",
        };
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(f, "{} of {}{}{} page", access, flag(self.readable, 'r'), flag(self.writable, 'w'), flag(self.executable, 'x'))
    }
}

/// Handle VM exits for EPT violations.
///
/// Nothing is resolved here: the fault is logged and the guest is moved past
/// the faulting instruction. Guest memory must be installed up front with
/// `KVM_SET_USER_MEMORY_REGION`.
///
/// Reference: 29.3.3.2 EPT Violations
pub fn handle_ept_violation<H: Hal>(exit: &mut ExitContext<'_, '_, H>) -> ExitType {
    let qualification = EptViolationQualification::from_exit_qualification(exit.info.qualification);
    log::warn!(
        "EPT violation at guest physical {:#x}: {} (rip {:#x})",
        exit.info.guest_physical,
        qualification,
        exit.vcpu.registers.rip
    );

    exit.advance_guest_rip();
    ExitType::Continue
}

//! VM-exit reasons the dispatcher knows about and the VM-instruction errors
//! worth naming in diagnostics.

/// Basic exit reasons, classified for dispatch.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table C-1. Basic Exit Reasons
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExitReason {
    ExternalInterrupt,
    InterruptWindow,
    TaskSwitch,
    Cpuid,
    ControlRegisterAccess,
    MovDr,
    IoInstruction,
    Rdmsr,
    Wrmsr,
    ApicAccess,
    EptViolation,
    PreemptionTimer,
    /// No handler is registered for this basic exit reason.
    Unhandled(u16),
}

impl ExitReason {
    pub const EXTERNAL_INTERRUPT: u16 = 1;
    pub const INTERRUPT_WINDOW: u16 = 7;
    pub const TASK_SWITCH: u16 = 9;
    pub const CPUID: u16 = 10;
    pub const CONTROL_REGISTER_ACCESS: u16 = 28;
    pub const MOV_DR: u16 = 29;
    pub const IO_INSTRUCTION: u16 = 30;
    pub const RDMSR: u16 = 31;
    pub const WRMSR: u16 = 32;
    pub const APIC_ACCESS: u16 = 44;
    pub const EPT_VIOLATION: u16 = 48;
    pub const PREEMPTION_TIMER: u16 = 52;

    /// Bit 31 of the exit-reason field: the exit was a failed VM-entry.
    pub const ENTRY_FAILURE: u32 = 1 << 31;

    /// Classifies the raw exit-reason field by its basic exit reason (bits 15:0).
    pub fn from_u32(value: u32) -> Self {
        match (value & 0xFFFF) as u16 {
            Self::EXTERNAL_INTERRUPT => Self::ExternalInterrupt,
            Self::INTERRUPT_WINDOW => Self::InterruptWindow,
            Self::TASK_SWITCH => Self::TaskSwitch,
            Self::CPUID => Self::Cpuid,
            Self::CONTROL_REGISTER_ACCESS => Self::ControlRegisterAccess,
            Self::MOV_DR => Self::MovDr,
            Self::IO_INSTRUCTION => Self::IoInstruction,
            Self::RDMSR => Self::Rdmsr,
            Self::WRMSR => Self::Wrmsr,
            Self::APIC_ACCESS => Self::ApicAccess,
            Self::EPT_VIOLATION => Self::EptViolation,
            Self::PREEMPTION_TIMER => Self::PreemptionTimer,
            other => Self::Unhandled(other),
        }
    }

    /// Exits that are part of normal operation and not worth logging.
    pub fn is_routine(&self) -> bool {
        matches!(
            self,
            Self::ExternalInterrupt | Self::InterruptWindow | Self::PreemptionTimer | Self::IoInstruction | Self::EptViolation
        )
    }
}

impl core::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let description = match self {
            Self::ExternalInterrupt => "External interrupt",
            Self::InterruptWindow => "Interrupt window",
            Self::TaskSwitch => "Task switch",
            Self::Cpuid => "CPUID",
            Self::ControlRegisterAccess => "Control-register access",
            Self::MovDr => "MOV DR",
            Self::IoInstruction => "I/O instruction",
            Self::Rdmsr => "RDMSR",
            Self::Wrmsr => "WRMSR",
            Self::ApicAccess => "APIC access",
            Self::EptViolation => "EPT violation",
            Self::PreemptionTimer => "VMX-preemption timer expired",
            Self::Unhandled(reason) => return write!(f, "Unhandled exit reason {}", reason),
        };
        write!(f, "{}", description)
    }
}

/// VM-instruction error numbers that a failed VM-entry can leave behind.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 31-1. VM-Instruction Error Numbers
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmInstructionError {
    VmlaunchNonClearVmcs = 4,
    VmresumeNonLaunchedVmcs = 5,
    VmEntryInvalidControlFields = 7,
    VmEntryInvalidHostState = 8,
    VmptrldInvalidAddress = 9,
    VmptrldIncorrectVmcsRevision = 11,
    VmreadVmwriteUnsupportedVmcsComponent = 12,
    VmwriteReadonlyVmcsComponent = 13,
    VmEntryEventsBlockedByMovSs = 26,
}

impl VmInstructionError {
    pub fn from_u32(value: u32) -> Option<Self> {
        use VmInstructionError::*;
        match value {
            4 => Some(VmlaunchNonClearVmcs),
            5 => Some(VmresumeNonLaunchedVmcs),
            7 => Some(VmEntryInvalidControlFields),
            8 => Some(VmEntryInvalidHostState),
            9 => Some(VmptrldInvalidAddress),
            11 => Some(VmptrldIncorrectVmcsRevision),
            12 => Some(VmreadVmwriteUnsupportedVmcsComponent),
            13 => Some(VmwriteReadonlyVmcsComponent),
            26 => Some(VmEntryEventsBlockedByMovSs),
            _ => None,
        }
    }
}

impl core::fmt::Display for VmInstructionError {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        use VmInstructionError::*;
        let description = match *self {
            VmlaunchNonClearVmcs => "VMLAUNCH with non-clear VMCS",
            VmresumeNonLaunchedVmcs => "VMRESUME with non-launched VMCS",
            VmEntryInvalidControlFields => "VM entry with invalid control field(s)",
            VmEntryInvalidHostState => "VM entry with invalid host-state field(s)",
            VmptrldInvalidAddress => "VMPTRLD with invalid physical address",
            VmptrldIncorrectVmcsRevision => "VMPTRLD with incorrect VMCS revision identifier",
            VmreadVmwriteUnsupportedVmcsComponent => "VMREAD/VMWRITE from/to unsupported VMCS component",
            VmwriteReadonlyVmcsComponent => "VMWRITE to read-only VMCS component",
            VmEntryEventsBlockedByMovSs => "VM entry with events blocked by MOV SS",
        };
        write!(f, "{}: {}", *self as u32, description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_reason_ignores_upper_bits() {
        assert_eq!(ExitReason::from_u32(0x8000_0000 | 30), ExitReason::IoInstruction);
        assert_eq!(ExitReason::from_u32(10), ExitReason::Cpuid);
    }

    #[test]
    fn test_unknown_reasons_are_unhandled() {
        assert_eq!(ExitReason::from_u32(12), ExitReason::Unhandled(12));
        assert_eq!(ExitReason::from_u32(0xFFFF), ExitReason::Unhandled(0xFFFF));
    }
}

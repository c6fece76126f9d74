//! Module for handling VMX control adjustments.
//! Adjusts requested execution, exit and entry control words against the
//! processor's capabilities.

use {crate::hal::VmxHardware, x86::msr};

/// Enumerates the types of VMX control fields.
#[derive(Debug, Clone, Copy)]
pub enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

/// Adjusts the VMX controls based on the requested value and capabilities.
///
/// Bits the processor requires are forced on (allowed-0 settings) and bits it
/// cannot set are dropped (allowed-1 settings). When IA32_VMX_BASIC[55] is
/// set the TRUE capability MSRs are used, which permits clearing default-1
/// controls such as CR3-load exiting.
pub fn adjust_vmx_controls<H: VmxHardware + ?Sized>(hal: &H, control: VmxControl, requested_value: u32) -> u64 {
    const IA32_VMX_BASIC_VMX_CONTROLS_FLAG: u64 = 1 << 55;

    let vmx_basic = hal.rdmsr(msr::IA32_VMX_BASIC);
    let true_cap_msr_supported = (vmx_basic & IA32_VMX_BASIC_VMX_CONTROLS_FLAG) != 0;

    let cap_msr = match (control, true_cap_msr_supported) {
        (VmxControl::PinBased, true) => msr::IA32_VMX_TRUE_PINBASED_CTLS,
        (VmxControl::PinBased, false) => msr::IA32_VMX_PINBASED_CTLS,
        (VmxControl::ProcessorBased, true) => msr::IA32_VMX_TRUE_PROCBASED_CTLS,
        (VmxControl::ProcessorBased, false) => msr::IA32_VMX_PROCBASED_CTLS,
        (VmxControl::VmExit, true) => msr::IA32_VMX_TRUE_EXIT_CTLS,
        (VmxControl::VmExit, false) => msr::IA32_VMX_EXIT_CTLS,
        (VmxControl::VmEntry, true) => msr::IA32_VMX_TRUE_ENTRY_CTLS,
        (VmxControl::VmEntry, false) => msr::IA32_VMX_ENTRY_CTLS,
        // There is no TRUE MSR for IA32_VMX_PROCBASED_CTLS2.
        (VmxControl::ProcessorBased2, _) => msr::IA32_VMX_PROCBASED_CTLS2,
    };

    let capabilities = hal.rdmsr(cap_msr);
    let allowed0 = capabilities as u32;
    let allowed1 = (capabilities >> 32) as u32;
    let mut effective_value = requested_value;
    effective_value |= allowed0;
    effective_value &= allowed1;
    u64::from(effective_value)
}

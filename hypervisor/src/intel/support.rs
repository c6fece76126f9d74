//! Native VMX instruction wrappers and the [`VmxHardware`] implementation for
//! the processor the engine is running on.

use {
    crate::{
        error::HypervisorError,
        hal::{CpuidResult, HostState, VmxHardware},
        intel::{
            registers::GuestRegisters,
            segmentation::SegmentDescriptor,
            vmlaunch::{kvmx_vmexit_trampoline, kvmx_vmx_transition},
        },
        utils::instructions::{rdmsr, HostRegisters},
    },
    x86::{cpuid::cpuid, msr, segmentation, task},
};

/// Clear VMCS.
pub fn vmclear(vmcs_region: u64) -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmclear(vmcs_region) }.map_err(|_| HypervisorError::VmClearFailed)
}

/// Load current VMCS pointer.
pub fn vmptrld(vmcs_region: u64) -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmptrld(vmcs_region) }.map_err(|_| HypervisorError::VmPtrLoadFailed)
}

/// Read a specified field from a VMCS.
pub fn vmread(field: u32) -> u64 {
    unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or_else(|_| {
        log::error!("VMREAD failed for field {:#x}", field);
        0
    })
}

/// Write to a specified field in a VMCS.
pub fn vmwrite<T: Into<u64>>(field: u32, val: T) {
    let value: u64 = val.into();
    if unsafe { x86::bits64::vmx::vmwrite(field, value) }.is_err() {
        log::error!("VMWRITE failed for field {:#x} value {:#x}", field, value);
    }
}

/// Host segment selectors must have RPL and TI cleared.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.2.3 Checks on Host Segment and Descriptor-Table Registers
const SELECTOR_MASK: u16 = 0xF8;

/// The processor this code is running on, in VMX root operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeVmx;

impl VmxHardware for NativeVmx {
    fn vmclear(&self, region: u64) -> Result<(), HypervisorError> {
        vmclear(region)
    }

    fn vmptrld(&self, region: u64) -> Result<(), HypervisorError> {
        vmptrld(region)
    }

    fn vmread(&self, field: u32) -> u64 {
        vmread(field)
    }

    fn vmwrite(&self, field: u32, value: u64) {
        vmwrite(field, value)
    }

    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuidResult {
        let result = cpuid!(leaf, sub_leaf);
        CpuidResult { eax: result.eax, ebx: result.ebx, ecx: result.ecx, edx: result.edx }
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        rdmsr(msr)
    }

    fn disable_interrupts(&self) {
        unsafe { x86::irq::disable() };
    }

    fn enable_interrupts(&self) {
        unsafe { x86::irq::enable() };
    }

    fn host_state(&self) -> HostState {
        let registers = HostRegisters::capture();
        let tr = unsafe { task::tr() };

        HostState {
            cr0: registers.cr0,
            cr3: registers.cr3,
            cr4: registers.cr4,
            cs: segmentation::cs().bits() & SELECTOR_MASK,
            ss: segmentation::ss().bits() & SELECTOR_MASK,
            ds: segmentation::ds().bits() & SELECTOR_MASK,
            es: segmentation::es().bits() & SELECTOR_MASK,
            fs: segmentation::fs().bits() & SELECTOR_MASK,
            gs: segmentation::gs().bits() & SELECTOR_MASK,
            tr: tr.bits() & SELECTOR_MASK,
            fs_base: rdmsr(msr::IA32_FS_BASE),
            gs_base: rdmsr(msr::IA32_GS_BASE),
            tr_base: SegmentDescriptor::from_selector(tr, &registers.gdtr).base_address,
            gdtr_base: registers.gdtr.base as u64,
            idtr_base: registers.idtr.base as u64,
            sysenter_cs: rdmsr(msr::IA32_SYSENTER_CS),
            sysenter_esp: rdmsr(msr::IA32_SYSENTER_ESP),
            sysenter_eip: rdmsr(msr::IA32_SYSENTER_EIP),
        }
    }

    fn exit_trampoline(&self) -> u64 {
        kvmx_vmexit_trampoline as usize as u64
    }

    unsafe fn enter_guest(&self, registers: &mut GuestRegisters) -> bool {
        kvmx_vmx_transition(registers) != 0
    }
}

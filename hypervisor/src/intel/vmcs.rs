//! The VMCS of a virtual CPU and its load/clear discipline.
//!
//! Fields may only be accessed while the VMCS is current on the executing
//! processor. [`ControlBlock::load`] takes the per-VMCS lock, pins the thread
//! to its processor and executes VMPTRLD; dropping the returned
//! [`LoadedVmcs`] executes VMCLEAR, unpins and unlocks. Every field access and
//! every guest entry happens inside such a bracket, and because each bracket
//! ends with VMCLEAR the launch state is always "clear" on entry.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.11 USING VMCLEAR, VMPTRLD, VMREAD, AND VMWRITE

use {
    crate::{
        error::HypervisorError,
        hal::Hal,
        intel::controls::{adjust_vmx_controls, VmxControl},
        utils::{alloc::HostPages, processor::ProcessorPin},
    },
    alloc::sync::Arc,
    core::fmt,
    spin::{Mutex, MutexGuard},
    x86::{
        msr,
        vmx::vmcs::{
            control::{self, EntryControls, ExitControls, PinbasedControls, PrimaryControls, SecondaryControls},
            guest, host, ro,
        },
    },
};

/// CR0.PG, owned by the host so that guest paging transitions exit.
pub const CR0_PG: u64 = 1 << 31;

/// CR0.NE, required set in VMX operation.
pub const CR0_NE: u64 = 1 << 5;

/// CR4.VMXE, owned by the host so the guest cannot clear it.
pub const CR4_VMXE: u64 = 1 << 13;

/// Guest activity state "active".
const ACTIVITY_STATE_ACTIVE: u64 = 0;

/// Physical addresses the VMCS points at, fixed for the life of the VM.
#[derive(Debug, Clone, Copy)]
pub struct VmcsLayout {
    pub eptp: u64,
    pub virtual_apic: u64,
    pub apic_access: u64,
}

/// Represents the VMCS region in memory.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.2 FORMAT OF THE VMCS REGION
pub struct ControlBlock<H: Hal> {
    hal: Arc<H>,
    region: HostPages<H>,
    lock: Mutex<()>,
}

impl<H: Hal> ControlBlock<H> {
    /// Allocates the region, stamps the revision identifier and clears it.
    pub fn create(hal: &Arc<H>) -> Result<Self, HypervisorError> {
        let mut region = HostPages::allocate(hal, 1)?;

        let revision_id = Self::revision_id(hal.as_ref());
        region.as_mut_slice()[..4].copy_from_slice(&revision_id.to_le_bytes());
        hal.vmclear(region.phys())?;

        log::debug!("VMCS at {:#x} (revision {:#x})", region.phys(), revision_id);

        Ok(Self { hal: Arc::clone(hal), region, lock: Mutex::new(()) })
    }

    /// Retrieves the VMCS revision ID.
    pub fn revision_id(hal: &H) -> u32 {
        (hal.rdmsr(msr::IA32_VMX_BASIC) as u32) & 0x7FFF_FFFF
    }

    pub fn region_physical(&self) -> u64 {
        self.region.phys()
    }

    /// Makes the VMCS current on this processor for the lifetime of the guard.
    pub fn load(&self) -> Result<LoadedVmcs<'_, H>, HypervisorError> {
        let lock = self.lock.lock();
        let pin = ProcessorPin::current(self.hal.as_ref());
        self.hal.vmptrld(self.region.phys())?;

        Ok(LoadedVmcs { hal: self.hal.as_ref(), region: self.region.phys(), pin, _lock: lock })
    }
}

/// A VMCS that is current on the pinned processor.
pub struct LoadedVmcs<'a, H: Hal> {
    hal: &'a H,
    region: u64,
    pin: ProcessorPin<'a, H>,
    _lock: MutexGuard<'a, ()>,
}

impl<'a, H: Hal> LoadedVmcs<'a, H> {
    pub fn hal(&self) -> &'a H {
        self.hal
    }

    pub fn processor(&self) -> usize {
        self.pin.processor()
    }

    pub fn read(&self, field: u32) -> u64 {
        self.hal.vmread(field)
    }

    pub fn write(&self, field: u32, value: u64) {
        self.hal.vmwrite(field, value)
    }

    /// Sets or clears `bits` in a control field.
    fn update_bits(&self, field: u32, bits: u32, set: bool) {
        let value = self.read(field);
        let value = if set { value | bits as u64 } else { value & !(bits as u64) };
        self.write(field, value);
    }

    /// Writes every field that stays fixed for the life of the virtual CPU.
    pub fn initialize(&self, layout: &VmcsLayout) {
        self.setup_vmcs_control_fields(layout);
        self.setup_guest_fields();
        log::debug!("VMCS initialized, EPTP {:#x}", layout.eptp);
    }

    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6 VM-EXECUTION CONTROL FIELDS
    #[rustfmt::skip]
    fn setup_vmcs_control_fields(&self, layout: &VmcsLayout) {
        let hal = self.hal;

        let pin = PinbasedControls::NMI_EXITING | PinbasedControls::EXTERNAL_INTERRUPT_EXITING;
        let primary = PrimaryControls::USE_TPR_SHADOW
            | PrimaryControls::SECONDARY_CONTROLS
            | PrimaryControls::UNCOND_IO_EXITING
            | PrimaryControls::MOV_DR_EXITING;
        let secondary = SecondaryControls::UNRESTRICTED_GUEST
            | SecondaryControls::ENABLE_EPT
            | SecondaryControls::VIRTUALIZE_APIC;

        self.write(control::PINBASED_EXEC_CONTROLS, adjust_vmx_controls(hal, VmxControl::PinBased, pin.bits()));
        self.write(control::PRIMARY_PROCBASED_EXEC_CONTROLS, adjust_vmx_controls(hal, VmxControl::ProcessorBased, primary.bits()));
        self.write(control::SECONDARY_PROCBASED_EXEC_CONTROLS, adjust_vmx_controls(hal, VmxControl::ProcessorBased2, secondary.bits()));
        self.write(control::VMEXIT_CONTROLS, adjust_vmx_controls(hal, VmxControl::VmExit, ExitControls::HOST_ADDRESS_SPACE_SIZE.bits()));
        self.write(control::VMENTRY_CONTROLS, adjust_vmx_controls(hal, VmxControl::VmEntry, EntryControls::empty().bits()));

        self.write(control::EXCEPTION_BITMAP, 0);
        self.write(control::PAGE_FAULT_ERR_CODE_MASK, 0);
        self.write(control::PAGE_FAULT_ERR_CODE_MATCH, 0);
        self.write(control::EPTP_FULL, layout.eptp);
        self.write(control::VIRT_APIC_ADDR_FULL, layout.virtual_apic);
        self.write(control::APIC_ACCESS_ADDR_FULL, layout.apic_access);
        self.write(control::TPR_THRESHOLD, 0);

        self.write(control::CR3_TARGET_COUNT, 0);
        for target in [control::CR3_TARGET_VALUE0, control::CR3_TARGET_VALUE1, control::CR3_TARGET_VALUE2, control::CR3_TARGET_VALUE3] {
            self.write(target, 0);
        }

        self.write(control::VMEXIT_MSR_STORE_COUNT, 0);
        self.write(control::VMEXIT_MSR_LOAD_COUNT, 0);
        self.write(control::VMENTRY_MSR_LOAD_COUNT, 0);
        self.write(control::VMEXIT_MSR_STORE_ADDR_FULL, u64::MAX);
        self.write(control::VMEXIT_MSR_LOAD_ADDR_FULL, u64::MAX);
        self.write(control::VMENTRY_MSR_LOAD_ADDR_FULL, u64::MAX);

        self.write(control::VMENTRY_INTERRUPTION_INFO_FIELD, 0);
        self.write(control::VMENTRY_EXCEPTION_ERR_CODE, 0);
        self.write(control::VMENTRY_INSTRUCTION_LEN, 0);

        // Paging starts off and the guest runs unrestricted.
        self.write(control::CR0_GUEST_HOST_MASK, CR0_PG);
        self.write(control::CR0_READ_SHADOW, 0);
        self.write(control::CR4_GUEST_HOST_MASK, CR4_VMXE);
        self.write(control::CR4_READ_SHADOW, 0);
    }

    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.4.2 Guest Non-Register State
    fn setup_guest_fields(&self) {
        self.write(guest::LINK_PTR_FULL, u64::MAX);
        self.write(guest::IA32_DEBUGCTL_FULL, 0);
        self.write(guest::PENDING_DBG_EXCEPTIONS, 0);
        self.write(guest::INTERRUPTIBILITY_STATE, 0);
        self.write(guest::ACTIVITY_STATE, ACTIVITY_STATE_ACTIVE);
        self.write(guest::VMX_PREEMPTION_TIMER_VALUE, 0);

        self.write(guest::IA32_SYSENTER_CS, self.hal.rdmsr(msr::IA32_SYSENTER_CS));
        self.write(guest::IA32_SYSENTER_ESP, self.hal.rdmsr(msr::IA32_SYSENTER_ESP));
        self.write(guest::IA32_SYSENTER_EIP, self.hal.rdmsr(msr::IA32_SYSENTER_EIP));
    }

    /// Captures the current thread's host context into the host-state area.
    /// HOST_RSP is written by the transition itself.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.5 Host-State Area
    #[rustfmt::skip]
    pub fn refresh_host_state(&self) {
        let state = self.hal.host_state();

        self.write(host::CR0, state.cr0);
        self.write(host::CR3, state.cr3);
        self.write(host::CR4, state.cr4);

        self.write(host::ES_SELECTOR, state.es as u64);
        self.write(host::CS_SELECTOR, state.cs as u64);
        self.write(host::SS_SELECTOR, state.ss as u64);
        self.write(host::DS_SELECTOR, state.ds as u64);
        self.write(host::FS_SELECTOR, state.fs as u64);
        self.write(host::GS_SELECTOR, state.gs as u64);
        self.write(host::TR_SELECTOR, state.tr as u64);

        self.write(host::FS_BASE, state.fs_base);
        self.write(host::GS_BASE, state.gs_base);
        self.write(host::TR_BASE, state.tr_base);
        self.write(host::GDTR_BASE, state.gdtr_base);
        self.write(host::IDTR_BASE, state.idtr_base);

        self.write(host::IA32_SYSENTER_CS, state.sysenter_cs);
        self.write(host::IA32_SYSENTER_ESP, state.sysenter_esp);
        self.write(host::IA32_SYSENTER_EIP, state.sysenter_eip);

        self.write(host::RIP, self.hal.exit_trampoline());
    }

    /// Switches between unrestricted (no guest paging) and paged operation.
    /// The CR0 read shadow reports PG to match.
    pub fn set_guest_paging(&self, enabled: bool) {
        self.update_bits(control::SECONDARY_PROCBASED_EXEC_CONTROLS, SecondaryControls::UNRESTRICTED_GUEST.bits(), !enabled);
        self.write(control::CR0_READ_SHADOW, if enabled { CR0_PG } else { 0 });
    }

    /// Requests an exit as soon as the guest can take an external interrupt.
    pub fn set_interrupt_window_exiting(&self, enabled: bool) {
        self.update_bits(
            control::PRIMARY_PROCBASED_EXEC_CONTROLS,
            PrimaryControls::INTERRUPT_WINDOW_EXITING.bits(),
            enabled,
        );
    }
}

impl<H: Hal> Drop for LoadedVmcs<'_, H> {
    fn drop(&mut self) {
        if let Err(error) = self.hal.vmclear(self.region) {
            log::error!("VMCLEAR of {:#x} failed: {}", self.region, error);
        }
    }
}

/// Debug implementation to dump the VMCS fields.
impl<H: Hal> fmt::Debug for LoadedVmcs<'_, H> {
    #[rustfmt::skip]
    fn fmt(&self, format: &mut fmt::Formatter<'_>) -> fmt::Result {
        format.debug_struct("Vmcs")
            .field("Region: ", &self.region)
            .field("Processor: ", &self.processor())
            .field("Guest CR0: ", &self.read(guest::CR0))
            .field("Guest CR3: ", &self.read(guest::CR3))
            .field("Guest CR4: ", &self.read(guest::CR4))
            .field("Guest RSP: ", &self.read(guest::RSP))
            .field("Guest RIP: ", &self.read(guest::RIP))
            .field("Guest RFLAGS: ", &self.read(guest::RFLAGS))
            .field("Guest CS Selector: ", &self.read(guest::CS_SELECTOR))
            .field("Guest CS Access Rights: ", &self.read(guest::CS_ACCESS_RIGHTS))
            .field("Guest EFER: ", &self.read(guest::IA32_EFER_FULL))
            .field("Pin-based Controls: ", &self.read(control::PINBASED_EXEC_CONTROLS))
            .field("Primary Controls: ", &self.read(control::PRIMARY_PROCBASED_EXEC_CONTROLS))
            .field("Secondary Controls: ", &self.read(control::SECONDARY_PROCBASED_EXEC_CONTROLS))
            .field("Entry Controls: ", &self.read(control::VMENTRY_CONTROLS))
            .field("Exit Controls: ", &self.read(control::VMEXIT_CONTROLS))
            .field("Exit Reason: ", &self.read(ro::EXIT_REASON))
            .field("VM Instruction Error: ", &self.read(ro::VM_INSTRUCTION_ERROR))
            .finish_non_exhaustive()
    }
}

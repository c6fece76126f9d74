//! An in-memory [`Hal`](crate::hal::Hal) for tests.
//!
//! VMCS fields live in a map per region and every access asserts the
//! load/clear discipline: a field may only be touched while its region is
//! current, a region may only be made current by a pinned thread, and the
//! guest may only be entered with host interrupts disabled. Guest execution
//! is replaced by a queue of scripted exits.

use {
    crate::{
        error::HypervisorError,
        hal::{CpuidResult, HostServices, HostState, PageFrame, VmxHardware, PAGE_SIZE},
        intel::registers::GuestRegisters,
    },
    alloc::{
        collections::{BTreeMap, BTreeSet, VecDeque},
        vec::Vec,
    },
    core::{alloc::Layout, ptr::NonNull},
    spin::Mutex,
    x86::{
        msr,
        vmx::vmcs::{control, guest, ro},
    },
};

/// Physical addresses handed out for pinned client memory are offset by this.
pub const USER_PHYSICAL_OFFSET: u64 = 0x10_0000_0000;

/// Physical address the mock reports for a pinned client page.
pub const fn user_physical(host_addr: u64) -> u64 {
    (host_addr & !(PAGE_SIZE as u64 - 1)) + USER_PHYSICAL_OFFSET
}

pub const MOCK_VMCS_REVISION: u64 = 0x12;
pub const MOCK_EXIT_TRAMPOLINE: u64 = 0xFFFF_8000_0BAD_0000;

/// One scripted VM-exit.
#[derive(Debug, Clone, Default)]
pub struct MockExit {
    pub reason: u32,
    pub qualification: u64,
    pub instruction_len: u64,
    pub guest_physical: u64,
    pub interruption_info: u64,
    pub instruction_error: u32,
    pub entry_failed: bool,
    /// Applied to the guest registers as if the guest had executed code.
    pub registers: Option<fn(&mut GuestRegisters)>,
}

impl MockExit {
    pub fn new(reason: u32) -> Self {
        Self { reason, ..Default::default() }
    }

    pub fn qualification(mut self, qualification: u64) -> Self {
        self.qualification = qualification;
        self
    }

    pub fn instruction_len(mut self, len: u64) -> Self {
        self.instruction_len = len;
        self
    }

    pub fn guest_physical(mut self, address: u64) -> Self {
        self.guest_physical = address;
        self
    }

    pub fn interruption_info(mut self, info: u64) -> Self {
        self.interruption_info = info;
        self
    }

    pub fn instruction_error(mut self, error: u32) -> Self {
        self.instruction_error = error;
        self
    }

    pub fn entry_failed(mut self) -> Self {
        self.entry_failed = true;
        self
    }

    pub fn registers(mut self, edit: fn(&mut GuestRegisters)) -> Self {
        self.registers = Some(edit);
        self
    }
}

/// What the mock saw at one guest entry.
#[derive(Debug, Clone, Copy)]
pub struct EntryRecord {
    pub registers: GuestRegisters,
    pub interruption_info: u64,
    pub primary_controls: u64,
    pub guest_rip: u64,
    pub host_rip: u64,
}

#[derive(Default)]
struct MockState {
    regions: BTreeMap<u64, BTreeMap<u32, u64>>,
    current: Option<u64>,
    last_region: Option<u64>,
    loads: usize,
    clears: usize,
    exits: VecDeque<MockExit>,
    repeat: Option<MockExit>,
    entries: Vec<EntryRecord>,
    interrupts_disabled: bool,
    pages: BTreeMap<usize, Layout>,
    allocations: usize,
    frees: usize,
    fail_allocations: bool,
    unbacked: BTreeSet<u64>,
    pin_failure: bool,
    signal_pending: bool,
    mapped: BTreeMap<u64, u64>,
    next_mapping: u64,
    pinned: Option<usize>,
    processor: usize,
    cpuid: BTreeMap<(u32, u32), CpuidResult>,
    cpuid_calls: Vec<(u32, u32)>,
    msrs: BTreeMap<u32, u64>,
}

pub struct MockHal {
    state: Mutex<MockState>,
}

impl Default for MockHal {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHal {
    pub fn new() -> Self {
        let mut msrs = BTreeMap::new();
        // Revision id plus the TRUE capability MSR flag.
        msrs.insert(msr::IA32_VMX_BASIC, MOCK_VMCS_REVISION | (1 << 55));
        for capability in [
            msr::IA32_VMX_TRUE_PINBASED_CTLS,
            msr::IA32_VMX_TRUE_PROCBASED_CTLS,
            msr::IA32_VMX_PROCBASED_CTLS2,
            msr::IA32_VMX_TRUE_EXIT_CTLS,
            msr::IA32_VMX_TRUE_ENTRY_CTLS,
        ] {
            msrs.insert(capability, 0xFFFF_FFFF_0000_0000);
        }
        msrs.insert(msr::IA32_SYSENTER_CS, 0x10);
        msrs.insert(msr::IA32_SYSENTER_ESP, 0xFFFF_8000_0000_1000);
        msrs.insert(msr::IA32_SYSENTER_EIP, 0xFFFF_8000_0000_2000);

        Self {
            state: Mutex::new(MockState {
                msrs,
                next_mapping: 0x7F00_0000_0000,
                ..Default::default()
            }),
        }
    }

    pub fn push_exit(&self, exit: MockExit) {
        self.state.lock().exits.push_back(exit);
    }

    /// Exit used once the scripted queue is empty.
    pub fn repeat_exit(&self, exit: MockExit) {
        self.state.lock().repeat = Some(exit);
    }

    pub fn entries(&self) -> Vec<EntryRecord> {
        self.state.lock().entries.clone()
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Reads a field of the most recently loaded VMCS without loading it.
    pub fn field(&self, field: u32) -> u64 {
        let state = self.state.lock();
        state
            .last_region
            .and_then(|region| state.regions.get(&region))
            .and_then(|fields| fields.get(&field).copied())
            .unwrap_or(0)
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().current.is_some()
    }

    pub fn loads(&self) -> usize {
        self.state.lock().loads
    }

    pub fn clears(&self) -> usize {
        self.state.lock().clears
    }

    pub fn allocations(&self) -> usize {
        self.state.lock().allocations
    }

    pub fn frees(&self) -> usize {
        self.state.lock().frees
    }

    pub fn outstanding_pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.state.lock().fail_allocations = fail;
    }

    /// Makes the page containing `host_addr` unresolvable when pinned.
    pub fn unback_page(&self, host_addr: u64) {
        self.state.lock().unbacked.insert(host_addr & !(PAGE_SIZE as u64 - 1));
    }

    pub fn fail_pinning(&self, fail: bool) {
        self.state.lock().pin_failure = fail;
    }

    pub fn set_signal_pending(&self, pending: bool) {
        self.state.lock().signal_pending = pending;
    }

    pub fn mapped_count(&self) -> usize {
        self.state.lock().mapped.len()
    }

    pub fn is_pinned(&self) -> bool {
        self.state.lock().pinned.is_some()
    }

    pub fn interrupts_disabled(&self) -> bool {
        self.state.lock().interrupts_disabled
    }

    /// Moves the calling "thread" to another processor.
    pub fn migrate_to(&self, processor: usize) {
        self.state.lock().processor = processor;
    }

    pub fn set_cpuid(&self, leaf: u32, sub_leaf: u32, result: CpuidResult) {
        self.state.lock().cpuid.insert((leaf, sub_leaf), result);
    }

    pub fn cpuid_calls(&self) -> Vec<(u32, u32)> {
        self.state.lock().cpuid_calls.clone()
    }

    pub fn set_msr(&self, msr: u32, value: u64) {
        self.state.lock().msrs.insert(msr, value);
    }
}

impl VmxHardware for MockHal {
    fn vmclear(&self, region: u64) -> Result<(), HypervisorError> {
        let mut state = self.state.lock();
        if region == 0 || region & (PAGE_SIZE as u64 - 1) != 0 {
            return Err(HypervisorError::VmClearFailed);
        }
        if state.current == Some(region) {
            state.current = None;
        }
        state.regions.entry(region).or_default();
        state.clears += 1;
        Ok(())
    }

    fn vmptrld(&self, region: u64) -> Result<(), HypervisorError> {
        let mut state = self.state.lock();
        assert!(state.pinned.is_some(), "VMPTRLD from an unpinned thread");
        if !state.regions.contains_key(&region) {
            return Err(HypervisorError::VmPtrLoadFailed);
        }
        state.current = Some(region);
        state.last_region = Some(region);
        state.loads += 1;
        Ok(())
    }

    fn vmread(&self, field: u32) -> u64 {
        let state = self.state.lock();
        let region = state.current.expect("VMREAD without a current VMCS");
        state.regions[&region].get(&field).copied().unwrap_or(0)
    }

    fn vmwrite(&self, field: u32, value: u64) {
        let mut state = self.state.lock();
        let region = state.current.expect("VMWRITE without a current VMCS");
        if let Some(fields) = state.regions.get_mut(&region) {
            fields.insert(field, value);
        }
    }

    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuidResult {
        let mut state = self.state.lock();
        state.cpuid_calls.push((leaf, sub_leaf));
        state.cpuid.get(&(leaf, sub_leaf)).copied().unwrap_or(CpuidResult {
            eax: leaf,
            ebx: sub_leaf,
            ecx: u32::MAX,
            edx: u32::MAX,
        })
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        self.state.lock().msrs.get(&msr).copied().unwrap_or(0)
    }

    fn disable_interrupts(&self) {
        self.state.lock().interrupts_disabled = true;
    }

    fn enable_interrupts(&self) {
        self.state.lock().interrupts_disabled = false;
    }

    fn host_state(&self) -> HostState {
        HostState {
            cr0: 0x8005_0033,
            cr3: 0x1AB000,
            cr4: 0x2606E0,
            cs: 0x10,
            ss: 0x18,
            ds: 0x2B & 0xF8,
            es: 0x2B & 0xF8,
            fs: 0x53 & 0xF8,
            gs: 0x2B & 0xF8,
            tr: 0x40,
            fs_base: 0x7FF0_0000,
            gs_base: 0xFFFF_8000_0010_0000,
            tr_base: 0xFFFF_8000_0020_0000,
            gdtr_base: 0xFFFF_8000_0030_0000,
            idtr_base: 0xFFFF_8000_0040_0000,
            sysenter_cs: 0x10,
            sysenter_esp: 0xFFFF_8000_0000_1000,
            sysenter_eip: 0xFFFF_8000_0000_2000,
        }
    }

    fn exit_trampoline(&self) -> u64 {
        MOCK_EXIT_TRAMPOLINE
    }

    unsafe fn enter_guest(&self, registers: &mut GuestRegisters) -> bool {
        let mut state = self.state.lock();
        let region = state.current.expect("guest entered without a current VMCS");
        assert!(state.interrupts_disabled, "guest entered with host interrupts enabled");
        assert!(state.pinned.is_some(), "guest entered from an unpinned thread");

        let exit = match state.exits.pop_front() {
            Some(exit) => exit,
            None => state.repeat.clone().expect("no scripted VM-exit left"),
        };

        let fields = state.regions.entry(region).or_default();
        let field = |fields: &BTreeMap<u32, u64>, encoding: u32| fields.get(&encoding).copied().unwrap_or(0);
        let record = EntryRecord {
            registers: *registers,
            interruption_info: field(fields, control::VMENTRY_INTERRUPTION_INFO_FIELD),
            primary_controls: field(fields, control::PRIMARY_PROCBASED_EXEC_CONTROLS),
            guest_rip: field(fields, guest::RIP),
            host_rip: field(fields, x86::vmx::vmcs::host::RIP),
        };

        // VM-exits clear the valid bit of the entry interruption information.
        let info = record.interruption_info & !(1 << 31);
        fields.insert(control::VMENTRY_INTERRUPTION_INFO_FIELD, info);
        fields.insert(ro::EXIT_REASON, exit.reason as u64);
        fields.insert(ro::EXIT_QUALIFICATION, exit.qualification);
        fields.insert(ro::VMEXIT_INSTRUCTION_LEN, exit.instruction_len);
        fields.insert(ro::GUEST_PHYSICAL_ADDR_FULL, exit.guest_physical);
        fields.insert(ro::VMEXIT_INTERRUPTION_INFO, exit.interruption_info);
        fields.insert(ro::VM_INSTRUCTION_ERROR, exit.instruction_error as u64);
        state.entries.push(record);

        if let Some(edit) = exit.registers {
            edit(registers);
        }

        exit.entry_failed
    }
}

impl HostServices for MockHal {
    fn allocate_pages(&self, count: usize) -> Option<PageFrame> {
        let mut state = self.state.lock();
        if state.fail_allocations || count == 0 {
            return None;
        }

        let layout = Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).ok()?;
        let virt = NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) })?;
        state.pages.insert(virt.as_ptr() as usize, layout);
        state.allocations += 1;

        // Identity "physical" addresses keep the mock simple.
        Some(unsafe { PageFrame::new(virt, virt.as_ptr() as u64, count) })
    }

    fn free_pages(&self, frame: PageFrame) {
        let mut state = self.state.lock();
        let address = frame.virt().as_ptr() as usize;
        let layout = state.pages.remove(&address).expect("freeing a page the mock never allocated");
        state.frees += 1;
        unsafe { alloc::alloc::dealloc(frame.virt().as_ptr(), layout) };
    }

    fn pin_user_memory(&self, host_addr: u64, size: u64) -> Option<Vec<Option<u64>>> {
        let state = self.state.lock();
        if state.pin_failure {
            return None;
        }

        let pages = size.div_ceil(PAGE_SIZE as u64);
        Some(
            (0..pages)
                .map(|page| host_addr + page * PAGE_SIZE as u64)
                .map(|va| (!state.unbacked.contains(&(va & !(PAGE_SIZE as u64 - 1)))).then(|| user_physical(va)))
                .collect(),
        )
    }

    fn signal_pending(&self) -> bool {
        self.state.lock().signal_pending
    }

    fn map_to_client(&self, frame: &PageFrame) -> Option<u64> {
        let mut state = self.state.lock();
        let address = state.next_mapping;
        state.next_mapping += 0x10_0000;
        state.mapped.insert(address, frame.phys());
        Some(address)
    }

    fn unmap_from_client(&self, address: u64, frame: &PageFrame) {
        let mut state = self.state.lock();
        let phys = state.mapped.remove(&address).expect("unmapping an address that was never mapped");
        assert_eq!(phys, frame.phys());
    }

    fn pin_processor(&self) -> usize {
        let mut state = self.state.lock();
        assert!(state.pinned.is_none(), "processor pin taken twice");
        state.pinned = Some(state.processor);
        state.processor
    }

    fn unpin_processor(&self, processor: usize) {
        let mut state = self.state.lock();
        assert_eq!(state.pinned, Some(processor));
        state.pinned = None;
    }

    fn current_processor(&self) -> usize {
        self.state.lock().processor
    }
}

//! One virtual machine with its single virtual CPU, and the run loop that
//! drives it.

use {
    crate::{
        config::VmConfig,
        error::HypervisorError,
        hal::{Hal, PAGE_SIZE},
        intel::{
            ept::{access::EptFlags, NestedPageTable, GUEST_PHYSICAL_LIMIT},
            events::EventInjection,
            interrupts::InterruptLines,
            segmentation::{GuestSegmentFields, SegmentAccessRights},
            vcpu::{VCpu, IRQCHIPS},
            vmcs::{ControlBlock, LoadedVmcs, VmcsLayout, CR0_NE, CR0_PG, CR4_VMXE},
            vmerror::{ExitReason, VmInstructionError},
            vmexit::{handle_vmexit, ExitContext, ExitInfo, ExitType},
        },
        kvm::{
            KvmCpuidEntry2, KvmDtable, KvmExitReason, KvmIrqchip, KvmMsrEntry, KvmPitState, KvmRegs, KvmSegment,
            KvmSregs, KvmUserspaceMemoryRegion,
        },
        mailbox::Mailbox,
    },
    alloc::{sync::Arc, vec::Vec},
    x86::vmx::vmcs::{control, guest, ro},
};

pub struct Vm<H: Hal> {
    hal: Arc<H>,
    config: VmConfig,
    vcpu: VCpu<H>,
    control: ControlBlock<H>,
    ept: NestedPageTable<H>,
    mailbox: Mailbox<H>,
    lines: Arc<InterruptLines>,
    regions: Vec<KvmUserspaceMemoryRegion>,
}

impl<H: Hal> Vm<H> {
    /// Allocates the virtual CPU, its VMCS and an empty nested page table,
    /// maps the APIC-access page and writes the fixed VMCS fields.
    pub fn create(hal: &Arc<H>, config: VmConfig, lines: Arc<InterruptLines>) -> Result<Self, HypervisorError> {
        let vcpu = VCpu::new(hal)?;
        let mut ept = NestedPageTable::new(hal)?;
        let mailbox = Mailbox::new(hal)?;
        let control = ControlBlock::create(hal)?;

        ept.map(config.apic_access_gpa, vcpu.apic_access_physical(), EptFlags::guest_ram())?;

        let layout = VmcsLayout {
            eptp: ept.eptp(),
            virtual_apic: vcpu.virtual_apic_physical(),
            apic_access: vcpu.apic_access_physical(),
        };
        control.load()?.initialize(&layout);

        log::info!("VM created, EPT root {:#x}", ept.root_physical());

        Ok(Self { hal: Arc::clone(hal), config, vcpu, control, ept, mailbox, lines, regions: Vec::new() })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn lines(&self) -> &Arc<InterruptLines> {
        &self.lines
    }

    pub fn vcpu(&self) -> &VCpu<H> {
        &self.vcpu
    }

    pub fn ept(&self) -> &NestedPageTable<H> {
        &self.ept
    }

    pub fn mailbox(&self) -> &Mailbox<H> {
        &self.mailbox
    }

    pub fn mailbox_mut(&mut self) -> &mut Mailbox<H> {
        &mut self.mailbox
    }

    pub fn map_mailbox(&mut self) -> Result<u64, HypervisorError> {
        self.mailbox.map(self.hal.as_ref())
    }

    pub fn regions(&self) -> &[KvmUserspaceMemoryRegion] {
        &self.regions
    }

    /// Runs the guest until an exit needs the controller, an error occurs or
    /// the iteration bound is hit.
    ///
    /// A value the controller left for a pending IN is loaded into RAX first.
    /// Interrupts are injected only right after an interrupt-window exit, on
    /// the lowest pending line.
    pub fn run(&mut self) -> Result<KvmExitReason, HypervisorError> {
        self.vcpu.complete_pending_io(self.mailbox.data());
        self.mailbox.set_exit_reason(KvmExitReason::Unknown);

        let mut last_exit_reason = 0;
        for _ in 0..self.config.max_run_iterations {
            let window_open = ExitReason::from_u32(last_exit_reason) == ExitReason::InterruptWindow;

            let (exit_type, reason) = self.enter(window_open)?;
            last_exit_reason = reason;

            if exit_type == ExitType::Stop {
                return Ok(KvmExitReason::from_u32(self.mailbox.exit_reason()));
            }
        }

        log::warn!(
            "Run loop gave up after {} entries, last exit reason {:#x}",
            self.config.max_run_iterations,
            last_exit_reason
        );
        self.mailbox.set_unknown_exit(last_exit_reason);

        Err(HypervisorError::Timeout { last_exit_reason })
    }

    /// One guest entry and the handling of the exit that ends it. Returns the
    /// handler's verdict and the raw exit reason.
    ///
    /// With `window_open` the lowest pending line is injected. The line is
    /// taken only once the VMCS is current and goes back to pending if the
    /// entry fails.
    fn enter(&mut self, window_open: bool) -> Result<(ExitType, u32), HypervisorError> {
        let Self { hal, config, vcpu, control, ept, mailbox, lines, .. } = self;

        let vmcs = control.load()?;
        vmcs.refresh_host_state();

        let injected = if window_open { lines.take_lowest() } else { None };
        if let Some(irq) = injected {
            let vector = config.vector(irq, vcpu.paging);
            log::trace!("Injecting IRQ {} as vector {:#x}", irq, vector);
            vmcs.write(control::VMENTRY_INTERRUPTION_INFO_FIELD, EventInjection::external_interrupt(vector).bits() as u64);
        }
        vmcs.set_interrupt_window_exiting(lines.has_pending());

        vmcs.write(guest::RIP, vcpu.registers.rip);
        vmcs.write(guest::RSP, vcpu.registers.rsp);
        vmcs.write(guest::RFLAGS, vcpu.registers.rflags);

        hal.disable_interrupts();
        let entry_failed = unsafe { hal.enter_guest(&mut vcpu.registers) };

        vcpu.registers.rip = vmcs.read(guest::RIP);
        vcpu.registers.rsp = vmcs.read(guest::RSP);
        vcpu.registers.rflags = vmcs.read(guest::RFLAGS);

        let info = ExitInfo::read(&vmcs);
        let outcome = if entry_failed || info.reason & ExitReason::ENTRY_FAILURE != 0 {
            if let Some(irq) = injected {
                vmcs.write(control::VMENTRY_INTERRUPTION_INFO_FIELD, 0);
                lines.rearm(irq);
            }
            Err(Self::entry_failure(&vmcs, mailbox, entry_failed, info.reason))
        } else {
            let mut exit = ExitContext { vcpu, vmcs: &vmcs, ept, mailbox, lines: lines.as_ref(), info };
            let result = handle_vmexit(&mut exit);

            match vmcs.read(ro::VM_INSTRUCTION_ERROR) as u32 {
                0 => result.map(|exit_type| (exit_type, info.reason)),
                error => {
                    log::error!("VM instruction error {} after exit {:#x}", error, info.reason);
                    exit.mailbox.set_unknown_exit(info.reason);
                    Err(HypervisorError::HardwareInstructionError(error))
                }
            }
        };

        // Host interrupts are taken once the VMCS is released.
        drop(vmcs);
        hal.enable_interrupts();

        outcome
    }

    fn entry_failure(vmcs: &LoadedVmcs<'_, H>, mailbox: &mut Mailbox<H>, instruction_failed: bool, reason: u32) -> HypervisorError {
        let reason = if instruction_failed {
            let error = vmcs.read(ro::VM_INSTRUCTION_ERROR) as u32;
            match VmInstructionError::from_u32(error) {
                Some(error) => log::error!("VMLAUNCH failed: {}", error),
                None => log::error!("VMLAUNCH failed: instruction error {}", error),
            }
            error
        } else {
            log::error!("VM-entry failed on guest state, exit reason {:#x}", reason);
            reason
        };

        log::error!("{:#x?}", vmcs);
        mailbox.set_fail_entry(reason, vmcs.processor());

        HypervisorError::HardwareEntryFailure(reason)
    }

    pub fn get_regs(&self) -> KvmRegs {
        self.vcpu.regs()
    }

    pub fn set_regs(&mut self, regs: &KvmRegs) {
        log::debug!("Setting guest rip {:#x}", regs.rip);
        self.vcpu.set_regs(regs);
    }

    pub fn get_sregs(&self) -> Result<KvmSregs, HypervisorError> {
        let vmcs = self.control.load()?;

        let segment = |fields: GuestSegmentFields| {
            let mut segment = KvmSegment {
                base: vmcs.read(fields.base),
                limit: vmcs.read(fields.limit) as u32,
                selector: vmcs.read(fields.selector) as u16,
                ..Default::default()
            };
            SegmentAccessRights::from_bits_truncate(vmcs.read(fields.access_rights) as u32).apply_to(&mut segment);
            segment
        };

        Ok(KvmSregs {
            cs: segment(GuestSegmentFields::CS),
            ds: segment(GuestSegmentFields::DS),
            es: segment(GuestSegmentFields::ES),
            fs: segment(GuestSegmentFields::FS),
            gs: segment(GuestSegmentFields::GS),
            ss: segment(GuestSegmentFields::SS),
            tr: segment(GuestSegmentFields::TR),
            ldt: segment(GuestSegmentFields::LDTR),
            gdt: KvmDtable { base: vmcs.read(guest::GDTR_BASE), limit: vmcs.read(guest::GDTR_LIMIT) as u16, ..Default::default() },
            idt: KvmDtable { base: vmcs.read(guest::IDTR_BASE), limit: vmcs.read(guest::IDTR_LIMIT) as u16, ..Default::default() },
            cr0: vmcs.read(guest::CR0),
            cr2: self.vcpu.registers.cr2,
            cr3: vmcs.read(guest::CR3),
            cr4: vmcs.read(guest::CR4),
            efer: vmcs.read(guest::IA32_EFER_FULL),
            ..Default::default()
        })
    }

    pub fn set_sregs(&mut self, sregs: &KvmSregs) -> Result<(), HypervisorError> {
        let vmcs = self.control.load()?;

        vmcs.write(guest::CR0, sregs.cr0 | CR0_NE);
        vmcs.write(guest::CR3, sregs.cr3);
        vmcs.write(guest::CR4, sregs.cr4 | CR4_VMXE);
        self.vcpu.registers.cr2 = sregs.cr2;

        let paging = sregs.cr0 & CR0_PG != 0;
        vmcs.set_guest_paging(paging);
        self.vcpu.paging = paging;

        for (segment, fields) in [
            (&sregs.cs, GuestSegmentFields::CS),
            (&sregs.ss, GuestSegmentFields::SS),
            (&sregs.ds, GuestSegmentFields::DS),
            (&sregs.es, GuestSegmentFields::ES),
            (&sregs.fs, GuestSegmentFields::FS),
            (&sregs.gs, GuestSegmentFields::GS),
            (&sregs.tr, GuestSegmentFields::TR),
            (&sregs.ldt, GuestSegmentFields::LDTR),
        ] {
            vmcs.write(fields.selector, segment.selector as u64);
            vmcs.write(fields.base, segment.base);
            vmcs.write(fields.limit, segment.limit as u64);
            vmcs.write(fields.access_rights, SegmentAccessRights::from_kvm(segment).bits() as u64);
        }

        vmcs.write(guest::IDTR_LIMIT, sregs.idt.limit as u64);
        vmcs.write(guest::IDTR_BASE, sregs.idt.base);
        vmcs.write(guest::GDTR_LIMIT, sregs.gdt.limit as u64);
        vmcs.write(guest::GDTR_BASE, sregs.gdt.base);

        vmcs.write(guest::IA32_EFER_FULL, sregs.efer);

        log::debug!("Guest APIC base {:#x}", sregs.apic_base);

        Ok(())
    }

    /// Pins the client range and maps it page by page. A page that cannot be
    /// resolved fails the call; pages mapped before it stay mapped.
    pub fn set_user_memory_region(&mut self, region: &KvmUserspaceMemoryRegion) -> Result<(), HypervisorError> {
        log::info!(
            "Memory slot {}: guest {:#x} <- host {:#x}, {:#x} bytes",
            region.slot,
            region.guest_phys_addr,
            region.userspace_addr,
            region.memory_size
        );

        let end = region.guest_phys_addr.checked_add(region.memory_size);
        if !matches!(end, Some(end) if end <= GUEST_PHYSICAL_LIMIT) {
            log::error!("Memory slot {} ends past the guest physical address space", region.slot);
            return Err(HypervisorError::InvalidArgument);
        }

        let pages = self.hal.pin_user_memory(region.userspace_addr, region.memory_size).ok_or_else(|| {
            log::error!("Failed to pin {:#x} bytes at {:#x}", region.memory_size, region.userspace_addr);
            HypervisorError::InvalidArgument
        })?;

        for (page, host_pa) in pages.into_iter().enumerate() {
            let guest_pa = region.guest_phys_addr + (page * PAGE_SIZE) as u64;
            let Some(host_pa) = host_pa else {
                log::error!("Host page {:#x} has no physical backing", region.userspace_addr + (page * PAGE_SIZE) as u64);
                return Err(HypervisorError::InvalidArgument);
            };

            self.ept.map(guest_pa, host_pa, EptFlags::guest_ram())?;
        }

        self.regions.push(*region);
        Ok(())
    }

    pub fn set_cpuid(&mut self, entries: Vec<KvmCpuidEntry2>) {
        for entry in &entries {
            log::trace!("CPUID override {:#x}/{:#x}: edx {:#x} ecx {:#x}", entry.function, entry.index, entry.edx, entry.ecx);
        }
        log::debug!("Installed {} CPUID overrides", entries.len());
        self.vcpu.cpuid = entries;
    }

    pub fn set_msrs(&mut self, entries: Vec<KvmMsrEntry>) {
        log::debug!("Installed {} MSR overrides", entries.len());
        self.vcpu.msrs = entries;
    }

    fn irqchip_slot(chip_id: u32) -> Result<usize, HypervisorError> {
        let slot = chip_id as usize;
        if slot >= IRQCHIPS {
            log::warn!("Unmodeled irqchip {}", chip_id);
            return Err(HypervisorError::InvalidArgument);
        }
        Ok(slot)
    }

    /// Fills `chip` with the cached state of the chip named by `chip.chip_id`.
    pub fn get_irqchip(&self, chip: &mut KvmIrqchip) -> Result<(), HypervisorError> {
        *chip = self.vcpu.irqchips[Self::irqchip_slot(chip.chip_id)?];
        Ok(())
    }

    pub fn set_irqchip(&mut self, chip: &KvmIrqchip) -> Result<(), HypervisorError> {
        let slot = Self::irqchip_slot(chip.chip_id)?;
        let pic = chip.pic();
        log::debug!("PIC {}: irq base {:#x}, imr {:#x}, irr {:#x}, isr {:#x}", chip.chip_id, pic.irq_base, pic.imr, pic.irr, pic.isr);

        self.vcpu.irqchips[slot] = *chip;
        Ok(())
    }

    pub fn get_pit(&self) -> KvmPitState {
        self.vcpu.pit
    }

    pub fn set_pit(&mut self, pit: &KvmPitState) {
        for (index, channel) in pit.channels.iter().enumerate() {
            log::debug!(
                "PIT {}: count {} mode {} rw_mode {} gate {} status {:#x} bcd {}",
                index,
                channel.count,
                channel.mode,
                channel.rw_mode,
                channel.gate,
                channel.status,
                channel.bcd
            );
        }
        self.vcpu.pit = *pit;
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::mock::{user_physical, MockExit, MockHal, MOCK_EXIT_TRAMPOLINE},
        x86::vmx::vmcs::control::PrimaryControls,
    };

    fn vm() -> (Arc<MockHal>, Vm<MockHal>) {
        let hal = Arc::new(MockHal::new());
        let vm = Vm::create(&hal, VmConfig::default(), Arc::new(InterruptLines::new())).unwrap();
        (hal, vm)
    }

    fn io_exit(port: u64, input: bool) -> MockExit {
        MockExit::new(ExitReason::IO_INSTRUCTION as u32)
            .qualification((port << 16) | ((input as u64) << 3) | 3)
            .instruction_len(1)
    }

    #[test]
    fn test_create_maps_apic_page_and_programs_eptp() {
        let (hal, vm) = vm();

        assert_eq!(vm.ept().translate(0xFEE0_0000), Some(vm.vcpu().apic_access_physical()));
        assert_eq!(hal.field(control::EPTP_FULL), vm.ept().eptp());
        assert!(!hal.is_loaded());
        assert!(!hal.is_pinned());
    }

    #[test]
    fn test_entry_uses_vcpu_rip_and_trampoline() {
        let (hal, mut vm) = vm();
        vm.set_regs(&KvmRegs { rip: 0x7C00, rflags: 0x2, ..Default::default() });
        hal.push_exit(io_exit(0x80, false));

        assert_eq!(vm.run(), Ok(KvmExitReason::Io));

        let entry = hal.entries()[0];
        assert_eq!(entry.guest_rip, 0x7C00);
        assert_eq!(entry.host_rip, MOCK_EXIT_TRAMPOLINE);
        assert_eq!(vm.get_regs().rip, 0x7C01);
        assert!(!hal.interrupts_disabled());
        assert!(!hal.is_loaded());
    }

    #[test]
    fn test_timeout_after_exactly_max_iterations() {
        let (hal, mut vm) = vm();
        hal.repeat_exit(MockExit::new(ExitReason::CPUID as u32).instruction_len(2));

        let result = vm.run();

        assert_eq!(result, Err(HypervisorError::Timeout { last_exit_reason: ExitReason::CPUID as u32 }));
        assert_eq!(hal.entry_count(), 1000);
        assert_eq!(vm.mailbox().exit_reason(), KvmExitReason::Unknown as u32);
        assert_eq!(vm.mailbox().hardware_exit_reason(), ExitReason::CPUID as u64);
        assert!(!hal.interrupts_disabled());
    }

    #[test]
    fn test_out_then_in_completion() {
        let (hal, mut vm) = vm();
        vm.set_regs(&KvmRegs { rax: 0x1122_3344, ..Default::default() });

        hal.push_exit(io_exit(0x3F8, false));
        assert_eq!(vm.run(), Ok(KvmExitReason::Io));
        assert_eq!(&vm.mailbox().data()[..4], &[0x44, 0x33, 0x22, 0x11]);

        hal.push_exit(io_exit(0x3F8, true));
        assert_eq!(vm.run(), Ok(KvmExitReason::Io));
        vm.mailbox_mut().data_mut()[..4].copy_from_slice(&0xAABB_CCDDu32.to_le_bytes());

        hal.push_exit(io_exit(0x3F8, false));
        assert_eq!(vm.run(), Ok(KvmExitReason::Io));
        assert_eq!(hal.entries()[2].registers.rax, 0xAABB_CCDD);
    }

    #[test]
    fn test_interrupt_waits_for_window_then_injects() {
        let (hal, mut vm) = vm();
        vm.lines().set_level(0, 1);

        hal.push_exit(MockExit::new(ExitReason::INTERRUPT_WINDOW as u32));
        hal.push_exit(io_exit(0x20, false));
        assert_eq!(vm.run(), Ok(KvmExitReason::Io));

        let entries = hal.entries();
        let window = PrimaryControls::INTERRUPT_WINDOW_EXITING.bits() as u64;
        assert_eq!(entries[0].interruption_info & (1 << 31), 0);
        assert_ne!(entries[0].primary_controls & window, 0);
        assert_eq!(entries[1].interruption_info, (1 << 31) | 0x08);
        assert_eq!(entries[1].primary_controls & window, 0);
        assert!(!vm.lines().has_pending());
    }

    #[test]
    fn test_paged_guest_uses_protected_mode_vectors() {
        let (hal, mut vm) = vm();
        vm.set_sregs(&KvmSregs { cr0: 0x8000_0011, ..Default::default() }).unwrap();
        vm.lines().set_level(3, 1);

        hal.push_exit(MockExit::new(ExitReason::INTERRUPT_WINDOW as u32));
        hal.push_exit(io_exit(0x20, false));
        vm.run().unwrap();

        assert_eq!(hal.entries()[1].interruption_info, (1 << 31) | 0x33);
    }

    #[test]
    fn test_injection_only_follows_a_window_exit() {
        let (hal, mut vm) = vm();
        vm.lines().set_level(1, 1);

        hal.push_exit(MockExit::new(ExitReason::CPUID as u32).instruction_len(2));
        hal.push_exit(io_exit(0x20, false));
        vm.run().unwrap();

        assert!(hal.entries().iter().all(|entry| entry.interruption_info == 0));
        assert!(vm.lines().has_pending());
    }

    #[test]
    fn test_failed_entry_keeps_the_injected_line_pending() {
        let (hal, mut vm) = vm();
        vm.lines().set_level(5, 1);

        hal.push_exit(MockExit::new(ExitReason::INTERRUPT_WINDOW as u32));
        hal.push_exit(MockExit::new(0).entry_failed().instruction_error(7));
        assert_eq!(vm.run(), Err(HypervisorError::HardwareEntryFailure(7)));

        assert_eq!(hal.entries()[1].interruption_info, (1 << 31) | 0x0D);
        assert_eq!(vm.lines().pending(), 1 << 5);
        assert_eq!(hal.field(control::VMENTRY_INTERRUPTION_INFO_FIELD), 0);

        hal.push_exit(MockExit::new(ExitReason::INTERRUPT_WINDOW as u32));
        hal.push_exit(io_exit(0x20, false));
        assert_eq!(vm.run(), Ok(KvmExitReason::Io));

        assert_eq!(hal.entries()[3].interruption_info, (1 << 31) | 0x0D);
        assert!(!vm.lines().has_pending());
    }

    #[test]
    fn test_signal_stops_with_intr() {
        let (hal, mut vm) = vm();
        hal.set_signal_pending(true);
        hal.push_exit(MockExit::new(ExitReason::EXTERNAL_INTERRUPT as u32));

        assert_eq!(vm.run(), Ok(KvmExitReason::Intr));
        assert_eq!(hal.entry_count(), 1);
    }

    #[test]
    fn test_launch_failure_reports_instruction_error() {
        let (hal, mut vm) = vm();
        hal.push_exit(MockExit::new(0).entry_failed().instruction_error(7));

        assert_eq!(vm.run(), Err(HypervisorError::HardwareEntryFailure(7)));
        assert_eq!(vm.mailbox().exit_reason(), KvmExitReason::FailEntry as u32);
        assert!(!hal.interrupts_disabled());
        assert!(!hal.is_loaded());
    }

    #[test]
    fn test_invalid_guest_state_is_an_entry_failure() {
        let (hal, mut vm) = vm();
        let reason = ExitReason::ENTRY_FAILURE | 33;
        hal.push_exit(MockExit::new(reason));

        assert_eq!(vm.run(), Err(HypervisorError::HardwareEntryFailure(reason)));
        assert_eq!(vm.mailbox().exit_reason(), KvmExitReason::FailEntry as u32);
    }

    #[test]
    fn test_instruction_error_ends_the_loop() {
        let (hal, mut vm) = vm();
        hal.push_exit(MockExit::new(ExitReason::CPUID as u32).instruction_len(2).instruction_error(5));

        assert_eq!(vm.run(), Err(HypervisorError::HardwareInstructionError(5)));
        assert_eq!(hal.entry_count(), 1);
    }

    #[test]
    fn test_vm_survives_unhandled_exit() {
        let (hal, mut vm) = vm();
        hal.push_exit(MockExit::new(12));
        assert_eq!(vm.run(), Err(HypervisorError::UnhandledExit(12)));

        hal.push_exit(io_exit(0x80, false));
        assert_eq!(vm.run(), Ok(KvmExitReason::Io));
    }

    #[test]
    fn test_guest_register_edits_survive_the_exit() {
        let (hal, mut vm) = vm();
        hal.push_exit(io_exit(0x80, false).registers(|registers| registers.rbx = 0xB0B));

        vm.run().unwrap();

        assert_eq!(vm.get_regs().rbx, 0xB0B);
    }

    #[test]
    fn test_memory_region_maps_each_pinned_page() {
        let (_hal, mut vm) = vm();
        let host = 0x7000_1000_0000;
        let region = KvmUserspaceMemoryRegion { slot: 0, flags: 0, guest_phys_addr: 0x10_0000, memory_size: 2 * PAGE_SIZE as u64, userspace_addr: host };

        vm.set_user_memory_region(&region).unwrap();

        assert_eq!(vm.ept().translate(0x10_0000), Some(user_physical(host)));
        assert_eq!(vm.ept().translate(0x10_1000), Some(user_physical(host + PAGE_SIZE as u64)));
        assert_eq!(vm.ept().translate(0x10_2000), None);
        assert_eq!(vm.regions(), &[region]);
    }

    #[test]
    fn test_unbacked_page_fails_without_rollback() {
        let (hal, mut vm) = vm();
        let host = 0x7000_2000_0000;
        hal.unback_page(host + PAGE_SIZE as u64);
        let region = KvmUserspaceMemoryRegion { slot: 1, flags: 0, guest_phys_addr: 0, memory_size: 3 * PAGE_SIZE as u64, userspace_addr: host };

        assert_eq!(vm.set_user_memory_region(&region), Err(HypervisorError::InvalidArgument));
        assert_eq!(vm.ept().translate(0), Some(user_physical(host)));
        assert_eq!(vm.ept().translate(0x1000), None);
        assert!(vm.regions().is_empty());

        hal.fail_pinning(true);
        assert_eq!(vm.set_user_memory_region(&region), Err(HypervisorError::InvalidArgument));
    }

    #[test]
    fn test_region_past_the_address_space_is_rejected() {
        let (_hal, mut vm) = vm();
        let nodes = vm.ept().node_count();
        let region = |guest_phys_addr, memory_size| KvmUserspaceMemoryRegion { slot: 2, flags: 0, guest_phys_addr, memory_size, userspace_addr: 0x7000_3000_0000 };

        assert_eq!(vm.set_user_memory_region(&region(u64::MAX - 0xFFF, 2 * PAGE_SIZE as u64)), Err(HypervisorError::InvalidArgument));
        assert_eq!(vm.set_user_memory_region(&region(GUEST_PHYSICAL_LIMIT - 0x1000, 2 * PAGE_SIZE as u64)), Err(HypervisorError::InvalidArgument));
        assert_eq!(vm.ept().translate(0), None);
        assert_eq!(vm.ept().node_count(), nodes);
        assert!(vm.regions().is_empty());

        vm.set_user_memory_region(&region(GUEST_PHYSICAL_LIMIT - 0x1000, PAGE_SIZE as u64)).unwrap();
        assert_eq!(vm.ept().translate(GUEST_PHYSICAL_LIMIT - 0x1000), Some(user_physical(0x7000_3000_0000)));
    }

    #[test]
    fn test_sregs_round_trip_forces_vmx_bits() {
        let (_hal, mut vm) = vm();
        let code = KvmSegment { base: 0, limit: 0xFFFF_FFFF, selector: 0x8, type_: 0xB, present: 1, s: 1, l: 1, g: 1, ..Default::default() };
        let data = KvmSegment { base: 0, limit: 0xFFFF_FFFF, selector: 0x10, type_: 0x3, present: 1, s: 1, db: 1, g: 1, ..Default::default() };
        let unusable = KvmSegment { unusable: 1, ..Default::default() };
        let sregs = KvmSregs {
            cs: code,
            ds: data,
            es: data,
            fs: data,
            gs: data,
            ss: data,
            tr: KvmSegment { base: 0x1000, limit: 0x67, selector: 0x18, type_: 0xB, present: 1, ..Default::default() },
            ldt: unusable,
            gdt: KvmDtable { base: 0x500, limit: 0x27, ..Default::default() },
            idt: KvmDtable { base: 0x600, limit: 0xFFF, ..Default::default() },
            cr0: 0x8000_0011,
            cr2: 0xDEAD,
            cr3: 0x9000,
            cr4: 0x20,
            efer: 0x500,
            apic_base: 0xFEE0_0900,
            ..Default::default()
        };

        vm.set_sregs(&sregs).unwrap();
        let read = vm.get_sregs().unwrap();

        assert_eq!(read.cs, code);
        assert_eq!(read.ss, data);
        assert_eq!(read.tr, sregs.tr);
        assert_eq!(read.ldt.unusable, 1);
        assert_eq!(read.gdt, sregs.gdt);
        assert_eq!(read.idt, sregs.idt);
        assert_eq!(read.cr0, 0x8000_0011 | CR0_NE);
        assert_eq!(read.cr2, 0xDEAD);
        assert_eq!(read.cr3, 0x9000);
        assert_eq!(read.cr4, 0x20 | CR4_VMXE);
        assert_eq!(read.efer, 0x500);
        assert!(vm.vcpu().paging);
    }

    #[test]
    fn test_irqchip_and_pit_are_cached() {
        let (_hal, mut vm) = vm();
        let mut chip = KvmIrqchip { chip_id: 1, ..Default::default() };
        chip.chip[5] = 0x70;
        vm.set_irqchip(&chip).unwrap();

        let mut read = KvmIrqchip { chip_id: 1, ..Default::default() };
        vm.get_irqchip(&mut read).unwrap();
        assert_eq!(read.pic().irq_base, 0x70);

        let mut master = KvmIrqchip::default();
        vm.get_irqchip(&mut master).unwrap();
        assert_eq!(master.pic().irq_base, 0);

        assert_eq!(vm.set_irqchip(&KvmIrqchip { chip_id: 2, ..Default::default() }), Err(HypervisorError::InvalidArgument));

        let mut pit = KvmPitState::default();
        pit.channels[0].count = 0x1234;
        vm.set_pit(&pit);
        assert_eq!(vm.get_pit(), pit);
    }

    #[test]
    fn test_drop_releases_everything() {
        let (hal, mut vm) = vm();
        vm.map_mailbox().unwrap();
        vm.set_user_memory_region(&KvmUserspaceMemoryRegion { memory_size: 0x4000, userspace_addr: 0x7000_0000_0000, ..Default::default() })
            .unwrap();

        drop(vm);

        assert_eq!(hal.outstanding_pages(), 0);
        assert_eq!(hal.mapped_count(), 0);
    }
}

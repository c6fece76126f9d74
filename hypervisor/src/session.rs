//! The per-client command surface.
//!
//! Every command but `KVM_IRQ_LINE` serializes on the session's VM lock. Line
//! assertion only touches the shared [`InterruptLines`], so a controller can
//! raise an interrupt while another thread sits in `KVM_RUN`.

use {
    crate::{
        config::VmConfig,
        error::HypervisorError,
        hal::{Hal, PAGE_SIZE},
        intel::{interrupts::InterruptLines, vm::Vm},
        kvm::*,
        mailbox::Mailbox,
    },
    alloc::{sync::Arc, vec::Vec},
    core::mem::size_of,
    spin::Mutex,
};

/// Leaves reported by `KVM_GET_SUPPORTED_CPUID`, as (function, index).
pub const SUPPORTED_CPUID: [(u32, u32); 15] = [
    (0x4000_0000, 0),
    (0x4000_0001, 0),
    (0, 0),
    (1, 0),
    (2, 0),
    (3, 0),
    (4, 0),
    (4, 1),
    (4, 2),
    (4, 3),
    (0x8000_0000, 0),
    (0x8000_0001, 0),
    (0x8000_0002, 0),
    (0x8000_0003, 0),
    (0x8000_0004, 0),
];

/// MSRs reported by `KVM_GET_MSR_INDEX_LIST`.
pub const EMULATED_MSRS: [u32; 5] = [
    x86::msr::IA32_TSC_ADJUST,
    x86::msr::IA32_TSC_DEADLINE,
    x86::msr::IA32_MISC_ENABLE,
    x86::msr::IA32_MCG_STATUS,
    x86::msr::IA32_MCG_CTL,
];

pub struct Session<H: Hal> {
    hal: Arc<H>,
    config: VmConfig,
    vm: Mutex<Option<Vm<H>>>,
    lines: Arc<InterruptLines>,
}

impl<H: Hal> Session<H> {
    pub fn new(hal: &Arc<H>, config: VmConfig) -> Self {
        Self { hal: Arc::clone(hal), config, vm: Mutex::new(None), lines: Arc::new(InterruptLines::new()) }
    }

    /// Runs `f` on the session's VM under the VM lock.
    pub fn with_vm<T>(&self, f: impl FnOnce(&mut Vm<H>) -> Result<T, HypervisorError>) -> Result<T, HypervisorError> {
        let mut vm = self.vm.lock();
        let vm = vm.as_mut().ok_or(HypervisorError::VmNotCreated)?;
        f(vm)
    }

    pub fn api_version(&self) -> u32 {
        KVM_API_VERSION
    }

    pub fn create_vm(&self) -> Result<(), HypervisorError> {
        let mut vm = self.vm.lock();
        if vm.is_some() {
            log::warn!("Session already owns a VM");
            return Err(HypervisorError::VmAlreadyCreated);
        }

        *vm = Some(Vm::create(&self.hal, self.config, Arc::clone(&self.lines))?);
        Ok(())
    }

    /// The VM has exactly one virtual CPU, created with it.
    pub fn create_vcpu(&self) -> Result<(), HypervisorError> {
        self.with_vm(|_| Ok(()))
    }

    pub fn vcpu_mmap_size(&self) -> usize {
        Mailbox::<H>::size()
    }

    pub fn mmap_vcpu(&self) -> Result<u64, HypervisorError> {
        self.with_vm(|vm| vm.map_mailbox())
    }

    pub fn check_extension(&self, capability: u32) -> bool {
        match KvmCap::from_u32(capability) {
            Some(cap) => {
                log::trace!("Capability {:?} supported", cap);
                true
            }
            None => {
                log::trace!("Capability {} not supported", capability);
                false
            }
        }
    }

    /// Native values of the supported leaves. `capacity` is the number of
    /// entries the caller has room for.
    pub fn supported_cpuid(&self, capacity: u32) -> Result<Vec<KvmCpuidEntry2>, HypervisorError> {
        if (capacity as usize) < SUPPORTED_CPUID.len() {
            return Err(HypervisorError::TooSmall);
        }

        Ok(SUPPORTED_CPUID
            .iter()
            .map(|&(function, index)| {
                let result = self.hal.cpuid(function, index);
                KvmCpuidEntry2 {
                    function,
                    index,
                    eax: result.eax,
                    ebx: result.ebx,
                    ecx: result.ecx,
                    edx: result.edx,
                    ..Default::default()
                }
            })
            .collect())
    }

    pub fn msr_index_list(&self, capacity: u32) -> Result<&'static [u32], HypervisorError> {
        if (capacity as usize) < EMULATED_MSRS.len() {
            return Err(HypervisorError::TooSmall);
        }
        Ok(&EMULATED_MSRS)
    }

    pub fn set_user_memory_region(&self, region: &KvmUserspaceMemoryRegion) -> Result<(), HypervisorError> {
        self.with_vm(|vm| vm.set_user_memory_region(region))
    }

    pub fn set_tss_addr(&self, address: u64) -> Result<(), HypervisorError> {
        self.with_vm(|_| {
            log::info!("TSS address {:#x}", address);
            Ok(())
        })
    }

    pub fn set_identity_map_addr(&self, address: u64) -> Result<(), HypervisorError> {
        self.with_vm(|_| {
            log::info!("Identity map address {:#x}", address);
            Ok(())
        })
    }

    pub fn create_irqchip(&self) -> Result<(), HypervisorError> {
        self.with_vm(|_| Ok(()))
    }

    pub fn create_pit(&self) -> Result<(), HypervisorError> {
        self.with_vm(|_| Ok(()))
    }

    pub fn get_irqchip(&self, chip: &mut KvmIrqchip) -> Result<(), HypervisorError> {
        self.with_vm(|vm| vm.get_irqchip(chip))
    }

    pub fn set_irqchip(&self, chip: &KvmIrqchip) -> Result<(), HypervisorError> {
        self.with_vm(|vm| vm.set_irqchip(chip))
    }

    pub fn get_pit(&self) -> Result<KvmPitState, HypervisorError> {
        self.with_vm(|vm| Ok(vm.get_pit()))
    }

    pub fn set_pit(&self, pit: &KvmPitState) -> Result<(), HypervisorError> {
        self.with_vm(|vm| {
            vm.set_pit(pit);
            Ok(())
        })
    }

    /// Never takes the VM lock.
    pub fn irq_line(&self, level: &KvmIrqLevel) {
        self.lines.set_level(level.irq, level.level);
    }

    pub fn get_regs(&self) -> Result<KvmRegs, HypervisorError> {
        self.with_vm(|vm| Ok(vm.get_regs()))
    }

    pub fn set_regs(&self, regs: &KvmRegs) -> Result<(), HypervisorError> {
        self.with_vm(|vm| {
            vm.set_regs(regs);
            Ok(())
        })
    }

    pub fn get_sregs(&self) -> Result<KvmSregs, HypervisorError> {
        self.with_vm(|vm| vm.get_sregs())
    }

    pub fn set_sregs(&self, sregs: &KvmSregs) -> Result<(), HypervisorError> {
        self.with_vm(|vm| vm.set_sregs(sregs))
    }

    pub fn set_msrs(&self, entries: Vec<KvmMsrEntry>) -> Result<(), HypervisorError> {
        self.with_vm(|vm| {
            vm.set_msrs(entries);
            Ok(())
        })
    }

    pub fn set_cpuid2(&self, entries: Vec<KvmCpuidEntry2>) -> Result<(), HypervisorError> {
        self.with_vm(|vm| {
            vm.set_cpuid(entries);
            Ok(())
        })
    }

    pub fn run(&self) -> Result<KvmExitReason, HypervisorError> {
        self.with_vm(|vm| vm.run())
    }

    /// Executes one raw command. Returns the command's non-negative result.
    ///
    /// # Safety
    ///
    /// `arg` must be valid for reads and writes of the structure the command
    /// takes, including any trailing entry array the header announces.
    pub unsafe fn ioctl(&self, command: u32, arg: *mut u8) -> Result<u64, HypervisorError> {
        if arg.is_null() || (arg as usize) < PAGE_SIZE {
            log::warn!("Command {:#x} with bad argument pointer {:p}", command, arg);
            return Err(HypervisorError::InvalidArgument);
        }

        match command {
            KVM_GET_API_VERSION => Ok(self.api_version() as u64),
            KVM_CREATE_VM => self.create_vm().map(|_| 0),
            KVM_GET_VCPU_MMAP_SIZE => Ok(self.vcpu_mmap_size() as u64),
            KVM_CHECK_EXTENSION => Ok(self.check_extension(read::<u32>(arg)) as u64),
            KVM_GET_SUPPORTED_CPUID => {
                let mut header = read::<KvmCpuid2>(arg);
                let entries = self.supported_cpuid(header.nent)?;
                write_entries(arg, size_of::<KvmCpuid2>(), &entries);
                header.nent = entries.len() as u32;
                write(arg, header);
                Ok(0)
            }
            KVM_GET_MSR_INDEX_LIST => {
                let mut header = read::<KvmMsrList>(arg);
                let indices = self.msr_index_list(header.nmsrs)?;
                write_entries(arg, size_of::<KvmMsrList>(), indices);
                header.nmsrs = indices.len() as u32;
                write(arg, header);
                Ok(0)
            }
            KVM_CREATE_VCPU => self.create_vcpu().map(|_| 0),
            KVM_MMAP_VCPU => {
                let address = self.mmap_vcpu()?;
                write(arg, address);
                Ok(0)
            }
            KVM_SET_USER_MEMORY_REGION => self.set_user_memory_region(&read(arg)).map(|_| 0),
            KVM_SET_TSS_ADDR => self.set_tss_addr(read(arg)).map(|_| 0),
            KVM_SET_IDENTITY_MAP_ADDR => self.set_identity_map_addr(read(arg)).map(|_| 0),
            KVM_CREATE_IRQCHIP => self.create_irqchip().map(|_| 0),
            KVM_GET_IRQCHIP => {
                let mut chip = read::<KvmIrqchip>(arg);
                self.get_irqchip(&mut chip)?;
                write(arg, chip);
                Ok(0)
            }
            KVM_SET_IRQCHIP => self.set_irqchip(&read(arg)).map(|_| 0),
            KVM_IRQ_LINE => {
                self.irq_line(&read(arg));
                Ok(0)
            }
            KVM_CREATE_PIT => self.create_pit().map(|_| 0),
            KVM_GET_PIT => {
                write(arg, self.get_pit()?);
                Ok(0)
            }
            KVM_SET_PIT => self.set_pit(&read(arg)).map(|_| 0),
            KVM_GET_FPU | KVM_SET_FPU | KVM_SET_SIGNAL_MASK => self.with_vm(|_| Ok(0)),
            KVM_GET_REGS => {
                write(arg, self.get_regs()?);
                Ok(0)
            }
            KVM_SET_REGS => self.set_regs(&read(arg)).map(|_| 0),
            KVM_GET_SREGS => {
                write(arg, self.get_sregs()?);
                Ok(0)
            }
            KVM_SET_SREGS => self.set_sregs(&read(arg)).map(|_| 0),
            KVM_SET_MSRS => {
                let header = read::<KvmMsrs>(arg);
                self.set_msrs(read_entries(arg, size_of::<KvmMsrs>(), header.nmsrs as usize)).map(|_| 0)
            }
            KVM_SET_CPUID2 => {
                let header = read::<KvmCpuid2>(arg);
                self.set_cpuid2(read_entries(arg, size_of::<KvmCpuid2>(), header.nent as usize)).map(|_| 0)
            }
            KVM_RUN => self.run().map(|_| 0),
            _ => {
                log::warn!("Unsupported command {:#x} (arg {:p})", command, arg);
                Err(HypervisorError::Unsupported)
            }
        }
    }
}

unsafe fn read<T: Copy>(arg: *const u8) -> T {
    (arg as *const T).read_unaligned()
}

unsafe fn write<T: Copy>(arg: *mut u8, value: T) {
    (arg as *mut T).write_unaligned(value)
}

/// Reads the entry array that follows a `header`-byte header.
unsafe fn read_entries<T: Copy>(arg: *const u8, header: usize, count: usize) -> Vec<T> {
    let first = arg.add(header) as *const T;
    (0..count).map(|index| first.add(index).read_unaligned()).collect()
}

unsafe fn write_entries<T: Copy>(arg: *mut u8, header: usize, entries: &[T]) {
    let first = arg.add(header) as *mut T;
    for (index, entry) in entries.iter().enumerate() {
        first.add(index).write_unaligned(*entry);
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            hal::CpuidResult,
            intel::vmerror::ExitReason,
            mock::{MockExit, MockHal},
        },
    };

    fn session() -> (Arc<MockHal>, Session<MockHal>) {
        let hal = Arc::new(MockHal::new());
        let session = Session::new(&hal, VmConfig::default());
        (hal, session)
    }

    fn ptr<T>(value: &mut T) -> *mut u8 {
        value as *mut T as *mut u8
    }

    #[repr(C)]
    struct CpuidBuffer<const N: usize> {
        header: KvmCpuid2,
        entries: [KvmCpuidEntry2; N],
    }

    #[repr(C)]
    struct MsrBuffer<const N: usize> {
        header: KvmMsrs,
        entries: [KvmMsrEntry; N],
    }

    #[test]
    fn test_bad_pointers_are_rejected_before_dispatch() {
        let (_hal, session) = session();

        unsafe {
            assert_eq!(session.ioctl(KVM_GET_API_VERSION, core::ptr::null_mut()), Err(HypervisorError::InvalidArgument));
            assert_eq!(session.ioctl(KVM_CREATE_VM, 0x14 as *mut u8), Err(HypervisorError::InvalidArgument));
        }
        assert!(session.vm.lock().is_none());
    }

    #[test]
    fn test_system_commands() {
        let (_hal, session) = session();
        let mut scratch = 0u64;

        unsafe {
            assert_eq!(session.ioctl(KVM_GET_API_VERSION, ptr(&mut scratch)), Ok(12));
            assert_eq!(session.ioctl(KVM_GET_VCPU_MMAP_SIZE, ptr(&mut scratch)), Ok(2 * PAGE_SIZE as u64));
            assert_eq!(session.ioctl(0xAE_FF, ptr(&mut scratch)), Err(HypervisorError::Unsupported));

            let mut capability = KvmCap::UserMemory as u32;
            assert_eq!(session.ioctl(KVM_CHECK_EXTENSION, ptr(&mut capability)), Ok(1));
            let mut capability = 5u32;
            assert_eq!(session.ioctl(KVM_CHECK_EXTENSION, ptr(&mut capability)), Ok(0));
        }
    }

    #[test]
    fn test_vm_commands_need_a_vm() {
        let (_hal, session) = session();
        let mut regs = KvmRegs::default();

        unsafe {
            assert_eq!(session.ioctl(KVM_GET_REGS, ptr(&mut regs)), Err(HypervisorError::VmNotCreated));
            assert_eq!(session.ioctl(KVM_RUN, ptr(&mut regs)), Err(HypervisorError::VmNotCreated));
            assert_eq!(session.ioctl(KVM_CREATE_VM, ptr(&mut regs)), Ok(0));
            assert_eq!(session.ioctl(KVM_CREATE_VM, ptr(&mut regs)), Err(HypervisorError::VmAlreadyCreated));
            assert_eq!(session.ioctl(KVM_CREATE_VCPU, ptr(&mut regs)), Ok(0));
        }
    }

    #[test]
    fn test_supported_cpuid_checks_capacity() {
        let (hal, session) = session();
        hal.set_cpuid(0x4000_0000, 0, CpuidResult { eax: 0x4000_0001, ebx: 0x4B4D_564B, ecx: 0x564B_4D56, edx: 0x4D });

        let mut small = CpuidBuffer::<4> { header: KvmCpuid2 { nent: 4, padding: 0 }, entries: Default::default() };
        assert_eq!(unsafe { session.ioctl(KVM_GET_SUPPORTED_CPUID, ptr(&mut small)) }, Err(HypervisorError::TooSmall));

        let mut buffer = CpuidBuffer::<20> { header: KvmCpuid2 { nent: 20, padding: 0 }, entries: [KvmCpuidEntry2::default(); 20] };
        assert_eq!(unsafe { session.ioctl(KVM_GET_SUPPORTED_CPUID, ptr(&mut buffer)) }, Ok(0));

        assert_eq!(buffer.header.nent, 15);
        assert_eq!(buffer.entries[0].ebx, 0x4B4D_564B);
        assert_eq!((buffer.entries[9].function, buffer.entries[9].index), (4, 3));
        assert_eq!(buffer.entries[14].function, 0x8000_0004);
        assert_eq!(buffer.entries[15], KvmCpuidEntry2::default());
    }

    #[test]
    fn test_msr_index_list() {
        let (_hal, session) = session();

        #[repr(C)]
        struct List {
            header: KvmMsrList,
            indices: [u32; 8],
        }

        let mut small = List { header: KvmMsrList { nmsrs: 2 }, indices: [0; 8] };
        assert_eq!(unsafe { session.ioctl(KVM_GET_MSR_INDEX_LIST, ptr(&mut small)) }, Err(HypervisorError::TooSmall));

        let mut list = List { header: KvmMsrList { nmsrs: 8 }, indices: [0; 8] };
        assert_eq!(unsafe { session.ioctl(KVM_GET_MSR_INDEX_LIST, ptr(&mut list)) }, Ok(0));
        assert_eq!(list.header.nmsrs, 5);
        assert_eq!(list.indices[..5], [0x3B, 0x6E0, 0x1A0, 0x17A, 0x17B]);
    }

    #[test]
    fn test_cpuid_override_reaches_the_guest() {
        let (hal, session) = session();
        session.create_vm().unwrap();

        let mut buffer = CpuidBuffer::<1> {
            header: KvmCpuid2 { nent: 1, padding: 0 },
            entries: [KvmCpuidEntry2 { function: 0x4000_0000, eax: 0x4000_0001, ebx: 0x1234, ..Default::default() }],
        };
        assert_eq!(unsafe { session.ioctl(KVM_SET_CPUID2, ptr(&mut buffer)) }, Ok(0));

        session.set_regs(&KvmRegs { rax: 0x4000_0000, ..Default::default() }).unwrap();
        hal.push_exit(MockExit::new(ExitReason::CPUID as u32).instruction_len(2));
        hal.push_exit(MockExit::new(ExitReason::IO_INSTRUCTION as u32).qualification(0x80 << 16).instruction_len(1));
        assert_eq!(session.run(), Ok(KvmExitReason::Io));

        let regs = session.get_regs().unwrap();
        assert_eq!(regs.rax, 0x4000_0001);
        assert_eq!(regs.rbx, 0x1234);
        assert!(hal.cpuid_calls().iter().all(|&(leaf, _)| leaf != 0x4000_0000));
    }

    #[test]
    fn test_msr_table_replaces_previous() {
        let (hal, session) = session();
        session.create_vm().unwrap();

        let mut first = MsrBuffer::<2> {
            header: KvmMsrs { nmsrs: 2, pad: 0 },
            entries: [KvmMsrEntry { index: 0x3B, data: 1, ..Default::default() }, KvmMsrEntry { index: 0x1A0, data: 2, ..Default::default() }],
        };
        let mut second = MsrBuffer::<1> { header: KvmMsrs { nmsrs: 1, pad: 0 }, entries: [KvmMsrEntry { index: 0x6E0, data: 0xABCD_0000_1234, ..Default::default() }] };
        unsafe {
            session.ioctl(KVM_SET_MSRS, ptr(&mut first)).unwrap();
            session.ioctl(KVM_SET_MSRS, ptr(&mut second)).unwrap();
        }

        assert_eq!(session.with_vm(|vm| Ok(vm.vcpu().msrs.len())), Ok(1));

        session.set_regs(&KvmRegs { rcx: 0x6E0, ..Default::default() }).unwrap();
        hal.push_exit(MockExit::new(ExitReason::RDMSR as u32).instruction_len(2));
        hal.push_exit(MockExit::new(ExitReason::IO_INSTRUCTION as u32).instruction_len(1));
        session.run().unwrap();

        let regs = session.get_regs().unwrap();
        assert_eq!(regs.rax, 0x1234);
        assert_eq!(regs.rdx, 0xABCD);
    }

    #[test]
    fn test_irq_line_does_not_wait_for_the_vm_lock() {
        let (_hal, session) = session();
        session.create_vm().unwrap();

        let held = session.vm.lock();
        let mut level = KvmIrqLevel { irq: 4, level: 1 };
        assert_eq!(unsafe { session.ioctl(KVM_IRQ_LINE, ptr(&mut level)) }, Ok(0));
        drop(held);

        assert_eq!(session.lines.pending(), 1 << 4);
    }

    #[test]
    fn test_state_round_trips_through_raw_commands() {
        let (_hal, session) = session();
        let mut scratch = 0u64;
        unsafe { session.ioctl(KVM_CREATE_VM, ptr(&mut scratch)).unwrap() };

        let mut regs = KvmRegs { rax: 1, rbx: 2, r15: 15, rip: 0xFFF0, rflags: 0x202, ..Default::default() };
        let expected = regs;
        let mut read = KvmRegs::default();
        let mut chip = KvmIrqchip { chip_id: 1, ..Default::default() };
        chip.chip[5] = 0x70;
        let mut read_chip = KvmIrqchip { chip_id: 1, ..Default::default() };
        let mut pit = KvmPitState::default();
        pit.channels[2].mode = 3;
        let mut read_pit = KvmPitState::default();

        unsafe {
            session.ioctl(KVM_SET_REGS, ptr(&mut regs)).unwrap();
            session.ioctl(KVM_GET_REGS, ptr(&mut read)).unwrap();
            session.ioctl(KVM_SET_IRQCHIP, ptr(&mut chip)).unwrap();
            session.ioctl(KVM_GET_IRQCHIP, ptr(&mut read_chip)).unwrap();
            session.ioctl(KVM_SET_PIT, ptr(&mut pit)).unwrap();
            session.ioctl(KVM_GET_PIT, ptr(&mut read_pit)).unwrap();
        }

        assert_eq!(read, expected);
        assert_eq!(read_chip.pic().irq_base, 0x70);
        assert_eq!(read_pit, pit);
    }

    #[test]
    fn test_memory_mailbox_and_run() {
        let (hal, session) = session();
        let mut scratch = 0u64;
        unsafe { session.ioctl(KVM_CREATE_VM, ptr(&mut scratch)).unwrap() };

        let mut region = KvmUserspaceMemoryRegion { slot: 0, flags: 0, guest_phys_addr: 0, memory_size: 0x10_0000, userspace_addr: 0x7000_0000_0000 };
        let mut address = 0u64;
        unsafe {
            assert_eq!(session.ioctl(KVM_SET_USER_MEMORY_REGION, ptr(&mut region)), Ok(0));
            assert_eq!(session.ioctl(KVM_MMAP_VCPU, ptr(&mut address)), Ok(0));
        }
        assert_ne!(address, 0);
        assert_eq!(hal.mapped_count(), 1);

        hal.push_exit(MockExit::new(ExitReason::IO_INSTRUCTION as u32).qualification((0x3F8 << 16) | (1 << 3)).instruction_len(1));
        assert_eq!(unsafe { session.ioctl(KVM_RUN, ptr(&mut scratch)) }, Ok(0));

        session
            .with_vm(|vm| {
                assert_eq!(vm.mailbox().exit_reason(), KvmExitReason::Io as u32);
                assert_eq!(vm.mailbox().io().port, 0x3F8);
                assert_eq!(vm.mailbox().io().direction, KVM_EXIT_IO_IN);
                assert_eq!(vm.vcpu().pending_io, Some(1));
                Ok(())
            })
            .unwrap();
    }
}

//! The KVM user-space ABI: command codes, capability numbers and the
//! fixed-layout structures exchanged with the controller.
//!
//! Reference: Linux `include/uapi/linux/kvm.h`.

use static_assertions::const_assert_eq;

pub const KVM_API_VERSION: u32 = 12;

/// `ioctl` type byte shared by every KVM command.
pub const KVMIO: u32 = 0xAE;

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, nr: u32, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | (KVMIO << 8) | nr
}

const fn io(nr: u32) -> u32 {
    ioc(IOC_NONE, nr, 0)
}

const fn ior<T>(nr: u32) -> u32 {
    ioc(IOC_READ, nr, core::mem::size_of::<T>())
}

const fn iow<T>(nr: u32) -> u32 {
    ioc(IOC_WRITE, nr, core::mem::size_of::<T>())
}

const fn iowr<T>(nr: u32) -> u32 {
    ioc(IOC_READ | IOC_WRITE, nr, core::mem::size_of::<T>())
}

pub const KVM_GET_API_VERSION: u32 = io(0x00);
pub const KVM_CREATE_VM: u32 = io(0x01);
pub const KVM_GET_MSR_INDEX_LIST: u32 = iowr::<KvmMsrList>(0x02);
pub const KVM_CHECK_EXTENSION: u32 = io(0x03);
pub const KVM_GET_VCPU_MMAP_SIZE: u32 = io(0x04);
pub const KVM_GET_SUPPORTED_CPUID: u32 = iowr::<KvmCpuid2>(0x05);
pub const KVM_CREATE_VCPU: u32 = io(0x41);
pub const KVM_SET_USER_MEMORY_REGION: u32 = iow::<KvmUserspaceMemoryRegion>(0x46);
pub const KVM_SET_TSS_ADDR: u32 = io(0x47);
pub const KVM_SET_IDENTITY_MAP_ADDR: u32 = iow::<u64>(0x48);
pub const KVM_CREATE_IRQCHIP: u32 = io(0x60);
pub const KVM_IRQ_LINE: u32 = iow::<KvmIrqLevel>(0x61);
pub const KVM_GET_IRQCHIP: u32 = iowr::<KvmIrqchip>(0x62);
pub const KVM_SET_IRQCHIP: u32 = ior::<KvmIrqchip>(0x63);
pub const KVM_CREATE_PIT: u32 = io(0x64);
pub const KVM_GET_PIT: u32 = iowr::<KvmPitState>(0x65);
pub const KVM_SET_PIT: u32 = ior::<KvmPitState>(0x66);
pub const KVM_RUN: u32 = io(0x80);
pub const KVM_GET_REGS: u32 = ior::<KvmRegs>(0x81);
pub const KVM_SET_REGS: u32 = iow::<KvmRegs>(0x82);
pub const KVM_GET_SREGS: u32 = ior::<KvmSregs>(0x83);
pub const KVM_SET_SREGS: u32 = iow::<KvmSregs>(0x84);
pub const KVM_SET_MSRS: u32 = iow::<KvmMsrs>(0x89);
pub const KVM_SET_SIGNAL_MASK: u32 = iow::<KvmSignalMask>(0x8B);
pub const KVM_GET_FPU: u32 = ior::<KvmFpu>(0x8C);
pub const KVM_SET_FPU: u32 = iow::<KvmFpu>(0x8D);
pub const KVM_SET_CPUID2: u32 = iow::<KvmCpuid2>(0x90);
/// Device specific: maps the run mailbox and writes its address back.
pub const KVM_MMAP_VCPU: u32 = io(0xE0);

/// Capabilities reported by `KVM_CHECK_EXTENSION`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvmCap {
    UserMemory = 3,
    SetTssAddr = 4,
    ExtCpuid = 7,
    MpState = 14,
    SyncMmu = 16,
    DestroyMemoryRegionWorks = 21,
    JoinMemoryRegionsWorks = 30,
    TscControl = 60,
}

impl KvmCap {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            3 => Self::UserMemory,
            4 => Self::SetTssAddr,
            7 => Self::ExtCpuid,
            14 => Self::MpState,
            16 => Self::SyncMmu,
            21 => Self::DestroyMemoryRegionWorks,
            30 => Self::JoinMemoryRegionsWorks,
            60 => Self::TscControl,
            _ => return None,
        })
    }
}

/// Values of `KvmRun::exit_reason`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvmExitReason {
    Unknown = 0,
    Io = 2,
    FailEntry = 9,
    Intr = 10,
}

impl KvmExitReason {
    pub fn from_u32(value: u32) -> Self {
        match value {
            2 => Self::Io,
            9 => Self::FailEntry,
            10 => Self::Intr,
            _ => Self::Unknown,
        }
    }
}

pub const KVM_EXIT_IO_IN: u8 = 0;
pub const KVM_EXIT_IO_OUT: u8 = 1;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmRegs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmSegment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: u8,
    pub dpl: u8,
    pub db: u8,
    pub s: u8,
    pub l: u8,
    pub g: u8,
    pub avl: u8,
    pub unusable: u8,
    pub padding: u8,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmDtable {
    pub base: u64,
    pub limit: u16,
    pub padding: [u16; 3],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmSregs {
    pub cs: KvmSegment,
    pub ds: KvmSegment,
    pub es: KvmSegment,
    pub fs: KvmSegment,
    pub gs: KvmSegment,
    pub ss: KvmSegment,
    pub tr: KvmSegment,
    pub ldt: KvmSegment,
    pub gdt: KvmDtable,
    pub idt: KvmDtable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub apic_base: u64,
    pub interrupt_bitmap: [u64; 4],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmCpuidEntry2 {
    pub function: u32,
    pub index: u32,
    pub flags: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub padding: [u32; 3],
}

/// Header of a `kvm_cpuid2`; `nent` entries follow it.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct KvmCpuid2 {
    pub nent: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmMsrEntry {
    pub index: u32,
    pub reserved: u32,
    pub data: u64,
}

/// Header of a `kvm_msrs`; `nmsrs` entries follow it.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct KvmMsrs {
    pub nmsrs: u32,
    pub pad: u32,
}

/// Header of a `kvm_msr_list`; `nmsrs` indices follow it.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct KvmMsrList {
    pub nmsrs: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmUserspaceMemoryRegion {
    pub slot: u32,
    pub flags: u32,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmIrqLevel {
    pub irq: u32,
    pub level: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmPitChannelState {
    pub count: u32,
    pub latched_count: u16,
    pub count_latched: u8,
    pub status_latched: u8,
    pub status: u8,
    pub read_state: u8,
    pub write_state: u8,
    pub write_latch: u8,
    pub rw_mode: u8,
    pub mode: u8,
    pub bcd: u8,
    pub gate: u8,
    pub count_load_time: i64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmPitState {
    pub channels: [KvmPitChannelState; 3],
}

/// Leading bytes of `kvm_pic_state` inside `KvmIrqchip::chip`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmPicState {
    pub last_irr: u8,
    pub irr: u8,
    pub imr: u8,
    pub isr: u8,
    pub priority_add: u8,
    pub irq_base: u8,
    pub read_reg_select: u8,
    pub poll: u8,
    pub special_mask: u8,
    pub init_state: u8,
    pub auto_eoi: u8,
    pub rotate_on_auto_eoi: u8,
    pub special_fully_nested_mode: u8,
    pub init4: u8,
    pub elcr: u8,
    pub elcr_mask: u8,
}

pub const KVM_IRQCHIP_PIC_MASTER: u32 = 0;
pub const KVM_IRQCHIP_PIC_SLAVE: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvmIrqchip {
    pub chip_id: u32,
    pub pad: u32,
    pub chip: [u8; 512],
}

impl Default for KvmIrqchip {
    fn default() -> Self {
        Self { chip_id: 0, pad: 0, chip: [0; 512] }
    }
}

impl KvmIrqchip {
    /// Interprets the chip payload as PIC state.
    pub fn pic(&self) -> KvmPicState {
        let b = &self.chip;
        KvmPicState {
            last_irr: b[0],
            irr: b[1],
            imr: b[2],
            isr: b[3],
            priority_add: b[4],
            irq_base: b[5],
            read_reg_select: b[6],
            poll: b[7],
            special_mask: b[8],
            init_state: b[9],
            auto_eoi: b[10],
            rotate_on_auto_eoi: b[11],
            special_fully_nested_mode: b[12],
            init4: b[13],
            elcr: b[14],
            elcr_mask: b[15],
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct KvmSignalMask {
    pub len: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct KvmFpu {
    pub fpr: [[u8; 16]; 8],
    pub fcw: u16,
    pub fsw: u16,
    pub ftwx: u8,
    pub pad1: u8,
    pub last_opcode: u16,
    pub last_ip: u64,
    pub last_dp: u64,
    pub xmm: [[u8; 16]; 16],
    pub mxcsr: u32,
    pub pad2: u32,
}

/// `kvm_run.io`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmRunIo {
    pub direction: u8,
    pub size: u8,
    pub port: u16,
    pub count: u32,
    pub data_offset: u64,
}

/// `kvm_run.hw`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmRunHw {
    pub hardware_exit_reason: u64,
}

/// `kvm_run.fail_entry`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmRunFailEntry {
    pub hardware_entry_failure_reason: u64,
    pub cpu: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union KvmRunExit {
    pub hw: KvmRunHw,
    pub fail_entry: KvmRunFailEntry,
    pub io: KvmRunIo,
    pub padding: [u8; 256],
}

/// The head of the shared run page.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct KvmRun {
    pub request_interrupt_window: u8,
    pub immediate_exit: u8,
    pub padding1: [u8; 6],
    pub exit_reason: u32,
    pub ready_for_interrupt_injection: u8,
    pub if_flag: u8,
    pub flags: u16,
    pub cr8: u64,
    pub apic_base: u64,
    pub exit: KvmRunExit,
}

const_assert_eq!(core::mem::size_of::<KvmRegs>(), 144);
const_assert_eq!(core::mem::size_of::<KvmSegment>(), 24);
const_assert_eq!(core::mem::size_of::<KvmDtable>(), 16);
const_assert_eq!(core::mem::size_of::<KvmSregs>(), 312);
const_assert_eq!(core::mem::size_of::<KvmCpuidEntry2>(), 40);
const_assert_eq!(core::mem::size_of::<KvmCpuid2>(), 8);
const_assert_eq!(core::mem::size_of::<KvmMsrEntry>(), 16);
const_assert_eq!(core::mem::size_of::<KvmMsrs>(), 8);
const_assert_eq!(core::mem::size_of::<KvmUserspaceMemoryRegion>(), 32);
const_assert_eq!(core::mem::size_of::<KvmIrqLevel>(), 8);
const_assert_eq!(core::mem::size_of::<KvmPitChannelState>(), 24);
const_assert_eq!(core::mem::size_of::<KvmPitState>(), 72);
const_assert_eq!(core::mem::size_of::<KvmPicState>(), 16);
const_assert_eq!(core::mem::size_of::<KvmIrqchip>(), 520);
const_assert_eq!(core::mem::size_of::<KvmFpu>(), 416);
const_assert_eq!(core::mem::size_of::<KvmRunIo>(), 16);
const_assert_eq!(core::mem::offset_of!(KvmRun, exit_reason), 8);
const_assert_eq!(core::mem::offset_of!(KvmRun, exit), 32);
const_assert_eq!(core::mem::size_of::<KvmRun>(), 288);

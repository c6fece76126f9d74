//! The boundary between the virtual-CPU engine and the machine it runs on.
//!
//! `VmxHardware` covers the privileged instructions the engine issues and
//! `HostServices` covers what the host kernel provides (page allocation,
//! memory pinning, signals, affinity). Everything above this module is generic
//! over [`Hal`], which lets the engine run against the in-memory `MockHal`
//! in tests.

use {
    crate::{error::HypervisorError, intel::registers::GuestRegisters},
    alloc::vec::Vec,
    core::ptr::NonNull,
};

pub const PAGE_SIZE: usize = 0x1000;

/// Result of a CPUID leaf, in register order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// A run of physically contiguous, page-aligned, zero-initialized host pages.
///
/// Frames are not freed on drop; owners hand them back through
/// [`HostServices::free_pages`].
#[derive(Debug)]
pub struct PageFrame {
    virt: NonNull<u8>,
    phys: u64,
    count: usize,
}

// The frame is exclusively owned by whichever table or block holds it.
unsafe impl Send for PageFrame {}
unsafe impl Sync for PageFrame {}

impl PageFrame {
    /// # Safety
    ///
    /// `virt` must point to `count` writable pages whose physical base is `phys`,
    /// valid until the frame is released.
    pub unsafe fn new(virt: NonNull<u8>, phys: u64, count: usize) -> Self {
        Self { virt, phys, count }
    }

    pub fn virt(&self) -> NonNull<u8> {
        self.virt
    }

    pub fn phys(&self) -> u64 {
        self.phys
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn len(&self) -> usize {
        self.count * PAGE_SIZE
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.virt.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.virt.as_ptr(), self.len()) }
    }

    /// Views the first page as a table of 512 eight-byte entries.
    pub fn entries(&self) -> &[u64] {
        unsafe { core::slice::from_raw_parts(self.virt.as_ptr() as *const u64, PAGE_SIZE / 8) }
    }

    pub fn entries_mut(&mut self) -> &mut [u64] {
        unsafe { core::slice::from_raw_parts_mut(self.virt.as_ptr() as *mut u64, PAGE_SIZE / 8) }
    }
}

/// Host context loaded by the processor on every VM-exit.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.5 Host-State Area
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub tr: u16,
    pub fs_base: u64,
    pub gs_base: u64,
    pub tr_base: u64,
    pub gdtr_base: u64,
    pub idtr_base: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
}

/// Privileged processor operations.
pub trait VmxHardware {
    /// Clears the VMCS at `region` and flushes it to memory.
    fn vmclear(&self, region: u64) -> Result<(), HypervisorError>;

    /// Makes the VMCS at `region` current on this processor.
    fn vmptrld(&self, region: u64) -> Result<(), HypervisorError>;

    fn vmread(&self, field: u32) -> u64;

    fn vmwrite(&self, field: u32, value: u64);

    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuidResult;

    fn rdmsr(&self, msr: u32) -> u64;

    fn disable_interrupts(&self);

    fn enable_interrupts(&self);

    /// Captures the current thread's host context.
    fn host_state(&self) -> HostState;

    /// Address the processor jumps to on VM-exit.
    fn exit_trampoline(&self) -> u64;

    /// Runs the guest until the next VM-exit and returns `true` if the entry
    /// instruction itself failed.
    ///
    /// # Safety
    ///
    /// A fully initialized VMCS must be current on this processor, host
    /// interrupts must be disabled and the caller must stay on this processor
    /// until the call returns. Not reentrant.
    unsafe fn enter_guest(&self, registers: &mut GuestRegisters) -> bool;
}

/// Services the host kernel provides to the engine.
pub trait HostServices {
    /// Allocates `count` zeroed, physically contiguous, page-aligned pages.
    fn allocate_pages(&self, count: usize) -> Option<PageFrame>;

    fn free_pages(&self, frame: PageFrame);

    /// Pins `[host_addr, host_addr + size)` of the calling client and returns
    /// the physical address of each page, `None` where it cannot be resolved.
    /// Returns `None` if the range cannot be pinned at all.
    fn pin_user_memory(&self, host_addr: u64, size: u64) -> Option<Vec<Option<u64>>>;

    /// Whether a host signal is pending for the calling client.
    fn signal_pending(&self) -> bool;

    /// Maps `frame` into the calling client and returns the client address.
    fn map_to_client(&self, frame: &PageFrame) -> Option<u64>;

    fn unmap_from_client(&self, address: u64, frame: &PageFrame);

    /// Binds the calling thread to the processor it runs on and returns its index.
    fn pin_processor(&self) -> usize;

    fn unpin_processor(&self, processor: usize);

    fn current_processor(&self) -> usize;
}

/// Everything the engine needs from the platform.
pub trait Hal: VmxHardware + HostServices + Send + Sync {}

impl<T: VmxHardware + HostServices + Send + Sync> Hal for T {}

//! Software-visible state of the single virtual CPU.
//!
//! Everything here lives outside the VMCS: the general registers between
//! entries, the shadow CR3, the paging flag that selects the interrupt vector
//! base, the controller-installed CPUID and MSR tables, the cached PIC and PIT
//! blocks, and the two APIC pages the VMCS points at.

use {
    crate::{
        error::HypervisorError,
        hal::Hal,
        intel::registers::GuestRegisters,
        kvm::{KvmCpuidEntry2, KvmIrqchip, KvmMsrEntry, KvmPitState, KvmRegs},
        utils::alloc::HostPages,
    },
    alloc::{sync::Arc, vec::Vec},
};

/// Number of PIC chips whose state is cached (master and slave).
pub const IRQCHIPS: usize = 2;

pub struct VCpu<H: Hal> {
    pub registers: GuestRegisters,

    /// Last value the guest moved into CR3.
    pub cr3_shadow: u64,

    /// Guest CR0.PG as last written by the guest.
    pub paging: bool,

    /// Operand size of an IN whose value the controller has not supplied yet.
    pub pending_io: Option<u8>,

    pub cpuid: Vec<KvmCpuidEntry2>,
    pub msrs: Vec<KvmMsrEntry>,
    pub irqchips: [KvmIrqchip; IRQCHIPS],
    pub pit: KvmPitState,

    virtual_apic: HostPages<H>,
    apic_access: HostPages<H>,
}

impl<H: Hal> VCpu<H> {
    pub fn new(hal: &Arc<H>) -> Result<Self, HypervisorError> {
        Ok(Self {
            registers: GuestRegisters::default(),
            cr3_shadow: 0,
            paging: false,
            pending_io: None,
            cpuid: Vec::new(),
            msrs: Vec::new(),
            irqchips: [KvmIrqchip::default(); IRQCHIPS],
            pit: KvmPitState::default(),
            virtual_apic: HostPages::allocate(hal, 1)?,
            apic_access: HostPages::allocate(hal, 1)?,
        })
    }

    pub fn virtual_apic_physical(&self) -> u64 {
        self.virtual_apic.phys()
    }

    pub fn apic_access_physical(&self) -> u64 {
        self.apic_access.phys()
    }

    /// Exact (function, index) match in the controller's CPUID table.
    pub fn cpuid_override(&self, function: u32, index: u32) -> Option<&KvmCpuidEntry2> {
        self.cpuid.iter().find(|entry| entry.function == function && entry.index == index)
    }

    pub fn msr_override(&self, index: u32) -> Option<u64> {
        self.msrs.iter().find(|entry| entry.index == index).map(|entry| entry.data)
    }

    /// Updates a modeled MSR. Returns `false` if `index` is not in the table.
    pub fn write_msr_override(&mut self, index: u32, value: u64) -> bool {
        match self.msrs.iter_mut().find(|entry| entry.index == index) {
            Some(entry) => {
                entry.data = value;
                true
            }
            None => false,
        }
    }

    /// Loads the value the controller left in the I/O data buffer into RAX.
    ///
    /// Byte and word reads keep the upper bits of RAX; a doubleword read
    /// zero-extends, as IN does natively.
    pub fn complete_pending_io(&mut self, data: &[u8]) {
        let Some(size) = self.pending_io.take() else {
            return;
        };

        let size = usize::from(size).min(8);
        let mut bytes = [0u8; 8];
        bytes[..size].copy_from_slice(&data[..size]);
        let value = u64::from_le_bytes(bytes);

        let rax = self.registers.rax;
        self.registers.rax = match size {
            1 => (rax & !0xFF) | value,
            2 => (rax & !0xFFFF) | value,
            _ => value,
        };

        log::trace!("IN completed with {:#x} ({} bytes)", value, size);
    }

    pub fn regs(&self) -> KvmRegs {
        let r = &self.registers;
        KvmRegs {
            rax: r.rax,
            rbx: r.rbx,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            rsp: r.rsp,
            rbp: r.rbp,
            r8: r.r8,
            r9: r.r9,
            r10: r.r10,
            r11: r.r11,
            r12: r.r12,
            r13: r.r13,
            r14: r.r14,
            r15: r.r15,
            rip: r.rip,
            rflags: r.rflags,
        }
    }

    pub fn set_regs(&mut self, regs: &KvmRegs) {
        let r = &mut self.registers;
        r.rax = regs.rax;
        r.rbx = regs.rbx;
        r.rcx = regs.rcx;
        r.rdx = regs.rdx;
        r.rsi = regs.rsi;
        r.rdi = regs.rdi;
        r.rsp = regs.rsp;
        r.rbp = regs.rbp;
        r.r8 = regs.r8;
        r.r9 = regs.r9;
        r.r10 = regs.r10;
        r.r11 = regs.r11;
        r.r12 = regs.r12;
        r.r13 = regs.r13;
        r.r14 = regs.r14;
        r.r15 = regs.r15;
        r.rip = regs.rip;
        r.rflags = regs.rflags;
    }
}

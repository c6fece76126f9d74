//! A module providing utilities and structures for handling VM exits.
//!
//! Every exit is classified by its basic exit reason and resolved by one
//! handler. A handler either patches the guest up so the run loop can enter it
//! again ([`ExitType::Continue`]) or fills the mailbox and hands control back
//! to the controller ([`ExitType::Stop`]).

use {
    crate::{
        error::HypervisorError,
        hal::Hal,
        intel::{
            ept::NestedPageTable,
            interrupts::InterruptLines,
            vcpu::VCpu,
            vmcs::LoadedVmcs,
            vmerror::ExitReason,
            vmexit::{
                apic::handle_apic_access,
                cpuid::handle_cpuid,
                cr::handle_cr_access,
                dr::handle_dr_access,
                ept::handle_ept_violation,
                interrupt::handle_external_interrupt,
                io::handle_io,
                msr::{handle_msr_access, MsrAccessType},
                task_switch::handle_task_switch,
            },
        },
        mailbox::Mailbox,
    },
    x86::vmx::vmcs::ro,
};

pub mod apic;
pub mod cpuid;
pub mod cr;
pub mod dr;
pub mod ept;
pub mod interrupt;
pub mod io;
pub mod msr;
pub mod task_switch;

/// What the run loop should do after a handled exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitType {
    /// Enter the guest again.
    Continue,
    /// Return to the controller; the mailbox describes why.
    Stop,
}

/// The VM-exit information fields captured right after the exit.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.9 VM-EXIT INFORMATION FIELDS
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Full exit-reason field, including the entry-failure bit.
    pub reason: u32,
    pub qualification: u64,
    pub instruction_len: u64,
    pub guest_physical: u64,
    pub interruption_info: u64,
}

impl ExitInfo {
    pub fn read<H: Hal>(vmcs: &LoadedVmcs<'_, H>) -> Self {
        Self {
            reason: vmcs.read(ro::EXIT_REASON) as u32,
            qualification: vmcs.read(ro::EXIT_QUALIFICATION),
            instruction_len: vmcs.read(ro::VMEXIT_INSTRUCTION_LEN),
            guest_physical: vmcs.read(ro::GUEST_PHYSICAL_ADDR_FULL),
            interruption_info: vmcs.read(ro::VMEXIT_INTERRUPTION_INFO),
        }
    }
}

/// Everything a handler may look at or change while the VMCS is still loaded.
pub struct ExitContext<'a, 'v, H: Hal> {
    pub vcpu: &'a mut VCpu<H>,
    pub vmcs: &'a LoadedVmcs<'v, H>,
    pub ept: &'a NestedPageTable<H>,
    pub mailbox: &'a mut Mailbox<H>,
    pub lines: &'a InterruptLines,
    pub info: ExitInfo,
}

impl<H: Hal> ExitContext<'_, '_, H> {
    /// Moves the guest past the instruction that caused the exit. The new RIP
    /// reaches the VMCS at the next entry.
    pub fn advance_guest_rip(&mut self) {
        self.vcpu.registers.rip += self.info.instruction_len;
    }
}

/// Handles the VM-exit.
///
/// Unknown basic exit reasons stop the loop with [`HypervisorError::UnhandledExit`]
/// after recording the raw reason in the mailbox.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: APPENDIX C VMX BASIC EXIT REASONS
pub fn handle_vmexit<H: Hal>(exit: &mut ExitContext<'_, '_, H>) -> Result<ExitType, HypervisorError> {
    let reason = ExitReason::from_u32(exit.info.reason);
    if !reason.is_routine() {
        log::debug!("VM-exit: {} at rip {:#x}", reason, exit.vcpu.registers.rip);
    }

    match reason {
        ExitReason::ExternalInterrupt => Ok(handle_external_interrupt(exit)),
        ExitReason::InterruptWindow | ExitReason::PreemptionTimer => Ok(ExitType::Continue),
        ExitReason::TaskSwitch => Ok(handle_task_switch(exit)),
        ExitReason::Cpuid => Ok(handle_cpuid(exit)),
        ExitReason::ControlRegisterAccess => Ok(handle_cr_access(exit)),
        ExitReason::MovDr => Ok(handle_dr_access(exit)),
        ExitReason::IoInstruction => Ok(handle_io(exit)),
        ExitReason::Rdmsr => Ok(handle_msr_access(exit, MsrAccessType::Read)),
        ExitReason::Wrmsr => Ok(handle_msr_access(exit, MsrAccessType::Write)),
        ExitReason::ApicAccess => Ok(handle_apic_access(exit)),
        ExitReason::EptViolation => Ok(handle_ept_violation(exit)),
        ExitReason::Unhandled(_) => {
            log::error!("{} (raw {:#x}), rip {:#x}", reason, exit.info.reason, exit.vcpu.registers.rip);
            exit.mailbox.set_unknown_exit(exit.info.reason);
            Err(HypervisorError::UnhandledExit(exit.info.reason))
        }
    }
}

/// Builds an [`ExitContext`] over mock state for handler tests.
#[cfg(test)]
pub(crate) mod harness {
    use {
        super::*,
        crate::{
            intel::vmcs::{ControlBlock, LoadedVmcs},
            mock::MockHal,
        },
        alloc::sync::Arc,
    };

    pub struct Harness {
        pub hal: Arc<MockHal>,
        pub vcpu: VCpu<MockHal>,
        pub control: ControlBlock<MockHal>,
        pub ept: NestedPageTable<MockHal>,
        pub mailbox: Mailbox<MockHal>,
        pub lines: InterruptLines,
    }

    impl Harness {
        pub fn new() -> Self {
            let hal = Arc::new(MockHal::new());
            Self {
                vcpu: VCpu::new(&hal).unwrap(),
                control: ControlBlock::create(&hal).unwrap(),
                ept: NestedPageTable::new(&hal).unwrap(),
                mailbox: Mailbox::new(&hal).unwrap(),
                lines: InterruptLines::new(),
                hal,
            }
        }

        /// Runs `handler` against `info` inside a VMCS bracket.
        pub fn handle<R>(
            &mut self,
            info: ExitInfo,
            handler: impl FnOnce(&mut ExitContext<'_, '_, MockHal>) -> R,
        ) -> R {
            let vmcs: LoadedVmcs<'_, MockHal> = self.control.load().unwrap();
            let mut exit = ExitContext {
                vcpu: &mut self.vcpu,
                vmcs: &vmcs,
                ept: &self.ept,
                mailbox: &mut self.mailbox,
                lines: &self.lines,
                info,
            };
            handler(&mut exit)
        }

        pub fn dispatch(&mut self, info: ExitInfo) -> Result<ExitType, HypervisorError> {
            self.handle(info, |exit| handle_vmexit(exit))
        }
    }

    pub fn exit(reason: u16, qualification: u64, instruction_len: u64) -> ExitInfo {
        ExitInfo { reason: reason as u32, qualification, instruction_len, ..Default::default() }
    }
}

//! Reads of the host registers that go into the VMCS host-state area.

use x86::{dtables::DescriptorTablePointer, msr};

/// Control registers and descriptor tables of the current processor.
#[derive(Debug)]
pub struct HostRegisters {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub gdtr: DescriptorTablePointer<u64>,
    pub idtr: DescriptorTablePointer<u64>,
}

impl HostRegisters {
    pub fn capture() -> Self {
        let mut gdtr = DescriptorTablePointer::<u64>::default();
        let mut idtr = DescriptorTablePointer::<u64>::default();

        unsafe {
            x86::dtables::sgdt(&mut gdtr);
            x86::dtables::sidt(&mut idtr);

            Self {
                cr0: x86::controlregs::cr0().bits() as u64,
                cr3: x86::controlregs::cr3(),
                cr4: x86::controlregs::cr4().bits() as u64,
                gdtr,
                idtr,
            }
        }
    }
}

pub fn rdmsr(index: u32) -> u64 {
    unsafe { msr::rdmsr(index) }
}

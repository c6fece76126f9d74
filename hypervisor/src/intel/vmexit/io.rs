//! Port I/O is forwarded to the controller through the mailbox.

use {
    crate::{
        hal::Hal,
        intel::vmexit::{ExitContext, ExitType},
        kvm::{KVM_EXIT_IO_IN, KVM_EXIT_IO_OUT},
    },
    bit_field::BitField,
};

/// Exit qualification for I/O instructions.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-5. Exit Qualification for I/O Instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoQualification {
    /// Operand size in bytes (1, 2 or 4).
    pub size: u8,
    pub input: bool,
    pub port: u16,
}

impl IoQualification {
    pub fn decode(qualification: u64) -> Self {
        Self {
            size: qualification.get_bits(0..3) as u8 + 1,
            input: qualification.get_bit(3),
            port: qualification.get_bits(16..32) as u16,
        }
    }
}

/// Handles an IN or OUT.
///
/// For OUT the low `size` bytes of RAX are copied into the data buffer. For IN
/// the load into RAX is deferred to the next run, once the controller has
/// written the value. Either way RIP moves past the instruction and the loop
/// stops with `KVM_EXIT_IO`.
pub fn handle_io<H: Hal>(exit: &mut ExitContext<'_, '_, H>) -> ExitType {
    let io = IoQualification::decode(exit.info.qualification);
    let direction = if io.input { KVM_EXIT_IO_IN } else { KVM_EXIT_IO_OUT };

    exit.mailbox.set_io(direction, io.size, io.port);

    if io.input {
        exit.vcpu.pending_io = Some(io.size);
    } else {
        let size = usize::from(io.size);
        let value = exit.vcpu.registers.rax.to_le_bytes();
        exit.mailbox.data_mut()[..size].copy_from_slice(&value[..size]);
    }

    log::trace!("{} port {:#x} ({} bytes)", if io.input { "IN" } else { "OUT" }, io.port, io.size);

    exit.advance_guest_rip();
    ExitType::Stop
}

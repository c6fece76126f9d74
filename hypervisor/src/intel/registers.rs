use static_assertions::const_assert_eq;

/// The collection of the guest general purpose register values.
///
/// The layout is shared with the transition trampoline in `vmlaunch.rs`, which
/// addresses every field by a fixed byte offset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsi: u64,
    pub rdi: u64,
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
    pub rsp: u64,
    pub rflags: u64,
    /// Not part of the VMCS guest state; swapped by the trampoline.
    pub cr2: u64,
}

const_assert_eq!(core::mem::offset_of!(GuestRegisters, rax), 0x00);
const_assert_eq!(core::mem::offset_of!(GuestRegisters, rdi), 0x28);
const_assert_eq!(core::mem::offset_of!(GuestRegisters, r15), 0x70);
const_assert_eq!(core::mem::offset_of!(GuestRegisters, rflags), 0x88);
const_assert_eq!(core::mem::offset_of!(GuestRegisters, cr2), 0x90);

impl GuestRegisters {
    /// Reads a general purpose register by the encoding used in exit qualifications.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-3. Exit Qualification for Control-Register Accesses
    pub fn by_index(&self, index: u8) -> u64 {
        match index & 0xF {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }

    /// Writes a general purpose register by its exit-qualification encoding.
    pub fn set_by_index(&mut self, index: u8, value: u64) {
        let slot = match index & 0xF {
            0 => &mut self.rax,
            1 => &mut self.rcx,
            2 => &mut self.rdx,
            3 => &mut self.rbx,
            4 => &mut self.rsp,
            5 => &mut self.rbp,
            6 => &mut self.rsi,
            7 => &mut self.rdi,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            _ => &mut self.r15,
        };
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_encoding_matches_qualification_order() {
        let mut regs = GuestRegisters::default();
        for index in 0..16u8 {
            regs.set_by_index(index, 0x100 + index as u64);
        }

        assert_eq!(regs.rax, 0x100);
        assert_eq!(regs.rcx, 0x101);
        assert_eq!(regs.rsp, 0x104);
        assert_eq!(regs.rdi, 0x107);
        assert_eq!(regs.r15, 0x10F);
        assert_eq!(regs.by_index(5), regs.rbp);
    }
}

//! Tunables of a virtual machine.

/// Fixed at session creation and shared by every VM of that session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Guest entries per `KVM_RUN` before giving up with a timeout.
    pub max_run_iterations: usize,

    /// Vector of IRQ 0 while guest paging is off (BIOS PIC base).
    pub real_mode_vector_base: u8,

    /// Vector of IRQ 0 once the guest has enabled paging.
    pub paged_vector_base: u8,

    /// Guest physical address of the APIC-access page.
    pub apic_access_gpa: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self { max_run_iterations: 1000, real_mode_vector_base: 0x08, paged_vector_base: 0x30, apic_access_gpa: 0xFEE0_0000 }
    }
}

impl VmConfig {
    /// Vector an interrupt line is delivered on.
    pub fn vector(&self, irq: u8, paging: bool) -> u8 {
        let base = if paging { self.paged_vector_base } else { self.real_mode_vector_base };
        base.wrapping_add(irq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_base_follows_paging() {
        let config = VmConfig::default();

        assert_eq!(config.vector(0, false), 0x08);
        assert_eq!(config.vector(4, false), 0x0C);
        assert_eq!(config.vector(0, true), 0x30);
        assert_eq!(config.vector(15, true), 0x3F);
    }
}

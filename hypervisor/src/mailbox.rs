//! The shared run page (`struct kvm_run`) and the port I/O data page behind it.

use {
    crate::{
        error::HypervisorError,
        hal::{Hal, PAGE_SIZE},
        kvm::{KvmExitReason, KvmRun, KvmRunFailEntry, KvmRunHw, KvmRunIo},
        utils::alloc::HostPages,
    },
    alloc::sync::Arc,
};

/// Pages mapped into the controller by `KVM_MMAP_VCPU`.
pub const MAILBOX_PAGES: usize = 2;

/// Page offset of the port I/O data buffer.
pub const PIO_PAGE_OFFSET: usize = 1;

pub struct Mailbox<H: Hal> {
    pages: HostPages<H>,
    client_address: Option<u64>,
}

impl<H: Hal> Mailbox<H> {
    pub fn new(hal: &Arc<H>) -> Result<Self, HypervisorError> {
        Ok(Self { pages: HostPages::allocate(hal, MAILBOX_PAGES)?, client_address: None })
    }

    pub fn size() -> usize {
        MAILBOX_PAGES * PAGE_SIZE
    }

    fn run(&self) -> &KvmRun {
        unsafe { &*(self.pages.virt().as_ptr() as *const KvmRun) }
    }

    fn run_mut(&mut self) -> &mut KvmRun {
        unsafe { &mut *(self.pages.virt().as_ptr() as *mut KvmRun) }
    }

    pub fn exit_reason(&self) -> u32 {
        self.run().exit_reason
    }

    pub fn set_exit_reason(&mut self, reason: KvmExitReason) {
        self.run_mut().exit_reason = reason as u32;
    }

    pub fn io(&self) -> KvmRunIo {
        unsafe { self.run().exit.io }
    }

    /// Describes a single port access whose data sits at the start of the data page.
    pub fn set_io(&mut self, direction: u8, size: u8, port: u16) {
        self.set_exit_reason(KvmExitReason::Io);
        self.run_mut().exit.io = KvmRunIo {
            direction,
            size,
            port,
            count: 1,
            data_offset: (PIO_PAGE_OFFSET * PAGE_SIZE) as u64,
        };
    }

    pub fn hardware_exit_reason(&self) -> u64 {
        unsafe { self.run().exit.hw.hardware_exit_reason }
    }

    pub fn set_unknown_exit(&mut self, hardware_exit_reason: u32) {
        self.set_exit_reason(KvmExitReason::Unknown);
        self.run_mut().exit.hw = KvmRunHw { hardware_exit_reason: hardware_exit_reason as u64 };
    }

    pub fn set_fail_entry(&mut self, reason: u32, cpu: usize) {
        self.set_exit_reason(KvmExitReason::FailEntry);
        self.run_mut().exit.fail_entry =
            KvmRunFailEntry { hardware_entry_failure_reason: reason as u64, cpu: cpu as u32 };
    }

    /// The port I/O data buffer.
    pub fn data(&self) -> &[u8] {
        &self.pages.as_slice()[PIO_PAGE_OFFSET * PAGE_SIZE..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.pages.as_mut_slice()[PIO_PAGE_OFFSET * PAGE_SIZE..]
    }

    /// Maps the mailbox into the calling client, once.
    pub fn map(&mut self, hal: &H) -> Result<u64, HypervisorError> {
        if let Some(address) = self.client_address {
            return Ok(address);
        }

        let address = hal.map_to_client(&self.pages).ok_or(HypervisorError::MailboxMapFailed)?;
        log::debug!("Mailbox mapped at {:#x}", address);
        self.client_address = Some(address);

        Ok(address)
    }

    pub fn client_address(&self) -> Option<u64> {
        self.client_address
    }
}

impl<H: Hal> Drop for Mailbox<H> {
    fn drop(&mut self) {
        if let Some(address) = self.client_address.take() {
            self.pages.host().unmap_from_client(address, &self.pages);
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::mock::MockHal};

    #[test]
    fn test_io_descriptor_points_at_data_page() {
        let hal = Arc::new(MockHal::new());
        let mut mailbox = Mailbox::new(&hal).unwrap();

        mailbox.set_io(crate::kvm::KVM_EXIT_IO_OUT, 4, 0x3F8);
        mailbox.data_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);

        let io = mailbox.io();
        assert_eq!(mailbox.exit_reason(), KvmExitReason::Io as u32);
        assert_eq!(io.port, 0x3F8);
        assert_eq!(io.count, 1);
        assert_eq!(io.data_offset, PAGE_SIZE as u64);
        assert_eq!(&mailbox.pages.as_slice()[PAGE_SIZE..PAGE_SIZE + 4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_mapping_is_reused_and_released() {
        let hal = Arc::new(MockHal::new());
        let mut mailbox = Mailbox::new(&hal).unwrap();

        let first = mailbox.map(&hal).unwrap();
        let second = mailbox.map(&hal).unwrap();
        assert_eq!(first, second);
        assert_eq!(hal.mapped_count(), 1);

        drop(mailbox);
        assert_eq!(hal.mapped_count(), 0);
        assert_eq!(hal.outstanding_pages(), 0);
    }
}

//! The KVM device.
//!
//! This crate is the device-file side of the engine: it keeps one session per
//! client, routes raw ioctls to it and turns engine errors into negative errno
//! values. Page allocation, memory pinning and the other host services come
//! from the embedding platform through [`Hal`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use {
    alloc::{collections::BTreeMap, sync::Arc},
    kvmx::{config::VmConfig, error::HypervisorError, hal::Hal, session::Session},
    log::LevelFilter,
    spin::Mutex,
};

/// Negative return values of [`DeviceRegistry::ioctl`].
pub mod errno {
    pub const ENOENT: i64 = 2;
    pub const EINTR: i64 = 4;
    pub const EIO: i64 = 5;
    pub const E2BIG: i64 = 7;
    pub const ENOMEM: i64 = 12;
    pub const EEXIST: i64 = 17;
    pub const EINVAL: i64 = 22;
    pub const EOPNOTSUPP: i64 = 95;
}

/// Identifies the process that opened the device.
pub type ClientId = u64;

/// Maps an engine error to its errno.
pub fn errno_of(error: HypervisorError) -> i64 {
    use errno::*;

    match error {
        HypervisorError::InvalidArgument => EINVAL,
        HypervisorError::TooSmall => E2BIG,
        HypervisorError::Unsupported | HypervisorError::VmNotCreated | HypervisorError::VmxUnsupported => EOPNOTSUPP,
        HypervisorError::VmAlreadyCreated => EEXIST,
        HypervisorError::OutOfMemory | HypervisorError::MailboxMapFailed => ENOMEM,
        // The controller re-runs after a timeout.
        HypervisorError::Timeout { .. } => EINTR,
        HypervisorError::HardwareEntryFailure(_)
        | HypervisorError::HardwareInstructionError(_)
        | HypervisorError::UnhandledExit(_)
        | HypervisorError::VmClearFailed
        | HypervisorError::VmPtrLoadFailed => EIO,
    }
}

struct Client<H: Hal> {
    open_count: usize,
    session: Arc<Session<H>>,
}

/// One session per client, created on first open and torn down on last close.
pub struct DeviceRegistry<H: Hal> {
    hal: Arc<H>,
    config: VmConfig,
    clients: Mutex<BTreeMap<ClientId, Client<H>>>,
}

impl<H: Hal> DeviceRegistry<H> {
    pub fn new(hal: &Arc<H>, config: VmConfig) -> Self {
        Self { hal: Arc::clone(hal), config, clients: Mutex::new(BTreeMap::new()) }
    }

    /// Returns the client's open count after this open.
    pub fn open(&self, client: ClientId) -> usize {
        let mut clients = self.clients.lock();
        let entry = clients.entry(client).or_insert_with(|| {
            log::info!("New session for client {:#x}", client);
            Client { open_count: 0, session: Arc::new(Session::new(&self.hal, self.config)) }
        });
        entry.open_count += 1;
        entry.open_count
    }

    /// Drops the client's session on its last close. A session still inside
    /// an ioctl is released when that call returns.
    pub fn close(&self, client: ClientId) -> Result<(), i64> {
        let mut clients = self.clients.lock();
        let Some(entry) = clients.get_mut(&client) else {
            log::warn!("Close from unknown client {:#x}", client);
            return Err(-errno::ENOENT);
        };

        entry.open_count -= 1;
        if entry.open_count == 0 {
            clients.remove(&client);
            log::info!("Session of client {:#x} closed", client);
        }

        Ok(())
    }

    pub fn session(&self, client: ClientId) -> Option<Arc<Session<H>>> {
        self.clients.lock().get(&client).map(|entry| Arc::clone(&entry.session))
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Routes a raw command to the client's session.
    ///
    /// # Safety
    ///
    /// `arg` must satisfy the contract of [`Session::ioctl`] for `command`.
    pub unsafe fn ioctl(&self, client: ClientId, command: u32, arg: *mut u8) -> i64 {
        let Some(session) = self.session(client) else {
            return -errno::ENOENT;
        };

        match session.ioctl(command, arg) {
            Ok(value) => value as i64,
            Err(error) => {
                log::debug!("Command {:#x} failed: {}", command, error);
                -errno_of(error)
            }
        }
    }
}

/// Checks for an Intel processor with VMX.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 24.6 DISCOVERING SUPPORT FOR VMX
pub fn check_vmx_support<H: Hal>(hal: &H) -> Result<(), HypervisorError> {
    let vendor = hal.cpuid(0, 0);
    let is_intel = [vendor.ebx, vendor.edx, vendor.ecx]
        .iter()
        .flat_map(|register| register.to_le_bytes())
        .eq(*b"GenuineIntel");
    if !is_intel {
        log::error!("CPU is not Intel");
        return Err(HypervisorError::VmxUnsupported);
    }

    // CPUID.1:ECX.VMX[bit 5]
    if hal.cpuid(1, 0).ecx & (1 << 5) == 0 {
        log::error!("VMX is not supported");
        return Err(HypervisorError::VmxUnsupported);
    }

    Ok(())
}

/// Module start: serial logging on COM2, then the VMX support check.
pub fn start<H: Hal>(hal: &Arc<H>) -> Result<DeviceRegistry<H>, HypervisorError> {
    // Initialize the COM2 port logger with level filter set to Info.
    com_logger::builder()
        .base(0x2f8)
        .filter(LevelFilter::Info)
        .setup();
    log::info!("KVM device starting");

    check_vmx_support(hal.as_ref())?;
    log::info!("Virtual Machine Extension (VMX) technology is supported");

    Ok(DeviceRegistry::new(hal, VmConfig::default()))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        kvmx::{
            hal::CpuidResult,
            intel::vmerror::ExitReason,
            kvm::{KvmRegs, KVM_CREATE_VM, KVM_GET_API_VERSION, KVM_GET_REGS, KVM_RUN},
            mock::{MockExit, MockHal},
        },
    };

    fn registry() -> (Arc<MockHal>, DeviceRegistry<MockHal>) {
        let hal = Arc::new(MockHal::new());
        let registry = DeviceRegistry::new(&hal, VmConfig::default());
        (hal, registry)
    }

    fn ptr<T>(value: &mut T) -> *mut u8 {
        value as *mut T as *mut u8
    }

    #[test]
    fn test_session_lives_until_last_close() {
        let (hal, registry) = registry();

        assert_eq!(registry.open(7), 1);
        assert_eq!(registry.open(7), 2);
        let mut scratch = 0u64;
        assert_eq!(unsafe { registry.ioctl(7, KVM_CREATE_VM, ptr(&mut scratch)) }, 0);
        assert!(hal.outstanding_pages() > 0);

        registry.close(7).unwrap();
        assert_eq!(registry.client_count(), 1);
        registry.close(7).unwrap();
        assert_eq!(registry.client_count(), 0);
        assert_eq!(hal.outstanding_pages(), 0);

        assert_eq!(registry.close(7), Err(-errno::ENOENT));
    }

    #[test]
    fn test_clients_are_isolated() {
        let (_hal, registry) = registry();
        registry.open(1);
        registry.open(2);
        let mut scratch = 0u64;

        unsafe {
            assert_eq!(registry.ioctl(1, KVM_CREATE_VM, ptr(&mut scratch)), 0);
            assert_eq!(registry.ioctl(2, KVM_CREATE_VM, ptr(&mut scratch)), 0);
            assert_eq!(registry.ioctl(1, KVM_CREATE_VM, ptr(&mut scratch)), -errno::EEXIST);
            assert_eq!(registry.ioctl(3, KVM_GET_API_VERSION, ptr(&mut scratch)), -errno::ENOENT);
        }
    }

    #[test]
    fn test_errors_become_negative_errno() {
        let (hal, registry) = registry();
        registry.open(1);
        let mut regs = KvmRegs::default();

        unsafe {
            assert_eq!(registry.ioctl(1, KVM_GET_API_VERSION, ptr(&mut regs)), 12);
            assert_eq!(registry.ioctl(1, KVM_GET_API_VERSION, core::ptr::null_mut()), -errno::EINVAL);
            assert_eq!(registry.ioctl(1, KVM_GET_REGS, ptr(&mut regs)), -errno::EOPNOTSUPP);
            assert_eq!(registry.ioctl(1, 0xDEAD, ptr(&mut regs)), -errno::EOPNOTSUPP);

            registry.ioctl(1, KVM_CREATE_VM, ptr(&mut regs));
            hal.repeat_exit(MockExit::new(ExitReason::CPUID as u32).instruction_len(2));
            assert_eq!(registry.ioctl(1, KVM_RUN, ptr(&mut regs)), -errno::EINTR);
        }
    }

    #[test]
    fn test_error_table() {
        assert_eq!(errno_of(HypervisorError::TooSmall), errno::E2BIG);
        assert_eq!(errno_of(HypervisorError::OutOfMemory), errno::ENOMEM);
        assert_eq!(errno_of(HypervisorError::HardwareEntryFailure(7)), errno::EIO);
        assert_eq!(errno_of(HypervisorError::UnhandledExit(12)), errno::EIO);
    }

    #[test]
    fn test_vmx_support_check() {
        let hal = MockHal::new();
        let vendor = CpuidResult { eax: 0xD, ebx: u32::from_le_bytes(*b"Genu"), edx: u32::from_le_bytes(*b"ineI"), ecx: u32::from_le_bytes(*b"ntel") };
        hal.set_cpuid(0, 0, vendor);
        hal.set_cpuid(1, 0, CpuidResult { ecx: 1 << 5, ..Default::default() });
        assert_eq!(check_vmx_support(&hal), Ok(()));

        hal.set_cpuid(1, 0, CpuidResult::default());
        assert_eq!(check_vmx_support(&hal), Err(HypervisorError::VmxUnsupported));

        hal.set_cpuid(0, 0, CpuidResult { ebx: u32::from_le_bytes(*b"Auth"), ..vendor });
        assert_eq!(check_vmx_support(&hal), Err(HypervisorError::VmxUnsupported));
    }
}

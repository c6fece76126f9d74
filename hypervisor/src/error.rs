use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("Caller buffer is smaller than the fixed result set")]
    TooSmall,
    #[error("Operation not supported")]
    Unsupported,
    #[error("VM-entry failed (exit reason {0:#x})")]
    HardwareEntryFailure(u32),
    #[error("VM instruction error {0}")]
    HardwareInstructionError(u32),
    #[error("Unhandled VM-exit reason {0:#x}")]
    UnhandledExit(u32),
    #[error("Run loop timed out, last exit reason {last_exit_reason:#x}")]
    Timeout { last_exit_reason: u32 },
    #[error("No virtual machine has been created for this session")]
    VmNotCreated,
    #[error("A virtual machine already exists for this session")]
    VmAlreadyCreated,
    #[error("Failed to allocate host pages")]
    OutOfMemory,
    #[error("Failed to execute VMCLEAR")]
    VmClearFailed,
    #[error("Failed to execute VMPTRLD")]
    VmPtrLoadFailed,
    #[error("Failed to map the run mailbox into the client")]
    MailboxMapFailed,
    #[error("VMX is not supported")]
    VmxUnsupported,
}

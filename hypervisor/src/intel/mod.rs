pub mod controls;
pub mod ept;
pub mod events;
pub mod interrupts;
pub mod registers;
pub mod segmentation;
#[cfg(target_arch = "x86_64")]
pub mod support;
pub mod vcpu;
pub mod vm;
pub mod vmcs;
pub mod vmerror;
pub mod vmexit;
#[cfg(target_arch = "x86_64")]
pub mod vmlaunch;

pub mod alloc;
#[cfg(target_arch = "x86_64")]
pub mod instructions;
pub mod processor;

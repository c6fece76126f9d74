//! A single-vCPU virtual machine engine for Intel VMX exposing the KVM
//! command surface.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod hal;
pub mod intel;
pub mod kvm;
pub mod mailbox;
pub mod session;
pub mod utils;

#[cfg(any(test, feature = "mock-hal"))]
pub mod mock;

//! Event injection through the VM-entry interruption-information field.

use bitfield::bitfield;

bitfield! {
    /// Represents the VM-Entry Interruption-Information Field.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-17. Format of the VM-Entry Interruption-Information Field
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EventInjection(u32);

    impl Debug;

    /// Vector of interrupt or exception
    pub get_vector, set_vector: 7, 0;

    /// Interruption type, see [`InterruptionType`].
    pub get_type, set_type: 10, 8;

    /// Deliver error code (0 = do not deliver; 1 = deliver)
    pub get_deliver_error_code, set_deliver_error_code: 11, 11;

    /// Valid
    pub get_valid, set_valid: 31, 31;
}

/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.8.3 VM-Entry Controls for Event Injection
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterruptionType {
    ExternalInterrupt = 0,
    NonMaskableInterrupt = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
}

impl EventInjection {
    /// A valid external interrupt with `vector`.
    pub fn external_interrupt(vector: u8) -> Self {
        let mut event = Self(0);
        event.set_vector(vector as u32);
        event.set_type(InterruptionType::ExternalInterrupt as u32);
        event.set_deliver_error_code(0);
        event.set_valid(1);
        event
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

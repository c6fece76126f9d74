//! This module provides utility functions for processor-related operations.

use crate::hal::HostServices;

/// Keeps the calling thread on one processor until it's dropped.
pub struct ProcessorPin<'a, H: HostServices + ?Sized> {
    host: &'a H,
    processor: usize,
}

impl<'a, H: HostServices + ?Sized> ProcessorPin<'a, H> {
    /// Binds the calling thread to the processor it is currently running on.
    pub fn current(host: &'a H) -> Self {
        let processor = host.pin_processor();
        log::trace!("Pinned to processor {}", processor);

        Self { host, processor }
    }

    pub fn processor(&self) -> usize {
        self.processor
    }

    /// Returns `false` if the thread is no longer on the pinned processor.
    pub fn still_pinned(&self) -> bool {
        self.host.current_processor() == self.processor
    }
}

impl<H: HostServices + ?Sized> Drop for ProcessorPin<'_, H> {
    /// Restores the affinity of the calling thread when the pin is dropped.
    fn drop(&mut self) {
        if !self.still_pinned() {
            log::warn!("Thread migrated off processor {} while pinned", self.processor);
        }
        self.host.unpin_processor(self.processor);
    }
}

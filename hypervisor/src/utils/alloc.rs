use {
    crate::{
        error::HypervisorError,
        hal::{HostServices, PageFrame},
    },
    alloc::sync::Arc,
    core::{
        mem::ManuallyDrop,
        ops::{Deref, DerefMut},
    },
};

/// Zeroed, physically contiguous host pages that go back to the host
/// allocator when dropped.
pub struct HostPages<H: HostServices> {
    host: Arc<H>,
    frame: ManuallyDrop<PageFrame>,
}

impl<H: HostServices> HostPages<H> {
    /// Allocates `count` pages through the host allocator.
    pub fn allocate(host: &Arc<H>, count: usize) -> Result<Self, HypervisorError> {
        let frame = host.allocate_pages(count).ok_or_else(|| {
            log::error!("Failed to allocate {} host page(s)", count);
            HypervisorError::OutOfMemory
        })?;

        Ok(Self { host: Arc::clone(host), frame: ManuallyDrop::new(frame) })
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }
}

impl<H: HostServices> Deref for HostPages<H> {
    type Target = PageFrame;

    fn deref(&self) -> &PageFrame {
        &self.frame
    }
}

impl<H: HostServices> DerefMut for HostPages<H> {
    fn deref_mut(&mut self) -> &mut PageFrame {
        &mut self.frame
    }
}

impl<H: HostServices> Drop for HostPages<H> {
    fn drop(&mut self) {
        // The frame is never touched again after this point.
        let frame = unsafe { ManuallyDrop::take(&mut self.frame) };
        self.host.free_pages(frame);
    }
}

//! The two dumb buffers behind the output.
//!
//! Presentation alternates between exactly two CPU-mapped buffers for the
//! lifetime of the process. Both are allocated once at startup and must end
//! up with the same pitch, otherwise row addressing in the content producer
//! would differ per buffer.

use anyhow::{bail, Context};
use drm::buffer::{Buffer, DrmFourcc};
use drm::control::dumbbuffer::{DumbBuffer, DumbMapping};
use drm::control::{framebuffer, Device as ControlDevice};
use tracing::debug;

pub struct Frame {
    fb: framebuffer::Handle,
    pitch: u32,
    mapping: DumbMapping<'static>,
}

impl Frame {
    fn allocate(
        device: &impl ControlDevice,
        size: (u32, u32),
        format: DrmFourcc,
    ) -> anyhow::Result<Self> {
        let db = device
            .create_dumb_buffer(size, format, 32)
            .context("error creating dumb buffer")?;
        let fb = device
            .add_framebuffer(&db, 24, 32)
            .context("error creating framebuffer")?;
        let pitch = db.pitch();

        // The mapping has to stay valid for the rest of the process, so the
        // buffer record it borrows is leaked. The kernel reclaims the handle
        // when the device is closed.
        let db: &'static mut DumbBuffer = Box::leak(Box::new(db));
        let mut mapping = device
            .map_dumb_buffer(db)
            .context("error mapping dumb buffer")?;
        mapping.as_mut().fill(0);

        debug!(
            "allocated {}x{} frame, pitch {pitch}, {} bytes",
            size.0,
            size.1,
            mapping.as_mut().len(),
        );

        Ok(Self { fb, pitch, mapping })
    }

    pub fn fb(&self) -> framebuffer::Handle {
        self.fb
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.mapping.as_mut()
    }
}

pub struct FramePair {
    frames: [Frame; 2],
}

impl FramePair {
    pub fn allocate(
        device: &impl ControlDevice,
        size: (u32, u32),
        format: DrmFourcc,
    ) -> anyhow::Result<Self> {
        let a = Frame::allocate(device, size, format)?;
        let b = Frame::allocate(device, size, format)?;
        ensure_matching_pitch(a.pitch, b.pitch)?;

        Ok(Self { frames: [a, b] })
    }

    pub fn frame(&self, index: usize) -> &Frame {
        &self.frames[index]
    }

    pub fn frame_mut(&mut self, index: usize) -> &mut Frame {
        &mut self.frames[index]
    }

    pub fn pitch(&self) -> u32 {
        self.frames[0].pitch
    }
}

/// Both buffers must share one pitch; frame geometry is computed once for
/// the pair.
pub(crate) fn ensure_matching_pitch(a: u32, b: u32) -> anyhow::Result<u32> {
    if a != b {
        bail!("buffer pitch mismatch: {a} vs {b}");
    }
    Ok(a)
}

#[cfg(test)]
mod tests {
    use super::ensure_matching_pitch;

    #[test]
    fn matching_pitch_passes_through() {
        assert_eq!(ensure_matching_pitch(7680, 7680).unwrap(), 7680);
    }

    #[test]
    fn pitch_mismatch_is_fatal() {
        assert!(ensure_matching_pitch(7680, 7936).is_err());
    }
}

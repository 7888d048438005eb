//! Binary layout of the shared segment.
//!
//! ```text
//! [0 .. frame_len)                 pixel data, row-major, 3 bytes per pixel
//! [frame_len .. frame_len + 4)     sequence counter, u32 little-endian
//! ```

use crate::error::{RelayError, RelayResult};

/// Bytes per pixel in the frame region.
pub const CHANNELS: usize = 3;

/// Size of the trailing sequence counter.
pub const SEQUENCE_BYTES: usize = 4;

/// Longest name accepted for a POSIX shm object or named semaphore.
const MAX_NAME_LEN: usize = 255;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    width: u32,
    height: u32,
}

impl FrameLayout {
    pub fn new(width: u32, height: u32) -> anyhow::Result<Self> {
        if width == 0 || height == 0 {
            anyhow::bail!("frame dimensions must be non-zero, got {}x{}", width, height);
        }
        (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(CHANNELS))
            .and_then(|v| v.checked_add(SEQUENCE_BYTES))
            .ok_or_else(|| {
                anyhow::anyhow!("frame dimensions overflow: {}x{}", width, height)
            })?;
        Ok(Self { width, height })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Length of the pixel region, `width * height * 3`.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * CHANNELS
    }

    /// Offset of the sequence counter, directly after the pixel region.
    pub fn sequence_offset(&self) -> usize {
        self.frame_len()
    }

    /// Total segment size, `width * height * 3 + 4`.
    pub fn segment_len(&self) -> usize {
        self.frame_len() + SEQUENCE_BYTES
    }
}

/// Checks a name for use with `shm_open`/`sem_open`: one leading slash and
/// nothing else that the kernel would reject.
pub fn validate_object_name(name: &str) -> RelayResult<()> {
    let invalid = |reason| RelayError::InvalidName {
        name: name.to_string(),
        reason,
    };
    let Some(rest) = name.strip_prefix('/') else {
        return Err(invalid("must start with '/'"));
    };
    if rest.is_empty() {
        return Err(invalid("must not be empty after the leading '/'"));
    }
    if rest.contains('/') {
        return Err(invalid("must not contain '/' after the first character"));
    }
    if rest.contains('\0') {
        return Err(invalid("must not contain NUL bytes"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("longer than 255 bytes"));
    }
    Ok(())
}

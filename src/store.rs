//! Shared frame store: the POSIX shared memory segment readers attach to.
//!
//! The segment is opened with `shm_open`, sized once with `ftruncate` and
//! mapped read-write with `memmap2`. The descriptor is closed right after
//! mapping; the mapping keeps the object alive.
//!
//! `publish` does not take the named lock itself. Callers hold the
//! [`NamedLock`](crate::gate::NamedLock) around every call, which
//! [`SharedResources::publish`](crate::lifecycle::SharedResources::publish)
//! does for them.

use std::ffi::CString;
use std::fs::{File, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::FromRawFd;
use std::sync::atomic::{fence, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{RelayError, RelayResult};
use crate::layout::{validate_object_name, FrameLayout, SEQUENCE_BYTES};

/// rw for everyone, so reader processes of other users can attach. The
/// umask narrows the mode given to `shm_open`, so a new segment is chmod-ed
/// back to it.
const SEGMENT_MODE: libc::mode_t = 0o666;

pub struct SharedFrameStore {
    name: String,
    layout: FrameLayout,
    map: Option<MmapMut>,
    fresh: bool,
}

impl SharedFrameStore {
    /// Open the named segment, creating and sizing it when it does not exist.
    ///
    /// An existing segment must already have exactly `layout.segment_len()`
    /// bytes; it is never resized because other processes may have it mapped.
    pub fn create(name: &str, layout: FrameLayout) -> RelayResult<Self> {
        let c_name = object_cstring(name)?;
        let flags = libc::O_CREAT | libc::O_RDWR;
        // SAFETY: c_name is a valid NUL-terminated string for the duration of the call.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, SEGMENT_MODE) };
        if fd < 0 {
            return Err(RelayError::resource(name, io::Error::last_os_error()));
        }
        // SAFETY: fd was just returned by shm_open and is owned by nobody else.
        let file = unsafe { File::from_raw_fd(fd) };

        let expected = layout.segment_len() as u64;
        let current = file
            .metadata()
            .map_err(|e| RelayError::resource(name, e))?
            .len();
        let fresh = current == 0;
        if fresh {
            file.set_len(expected)
                .map_err(|e| RelayError::resource(name, e))?;
            let mode = Permissions::from_mode(SEGMENT_MODE as u32);
            if let Err(e) = file.set_permissions(mode) {
                log::warn!("could not open up permissions of {}: {}", name, e);
            }
        } else if current != expected {
            return Err(RelayError::resource(
                name,
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "existing segment is {} bytes but {}x{} frames need {}; \
                         unlink it or restart with --reset-stale",
                        current,
                        layout.width(),
                        layout.height(),
                        expected
                    ),
                ),
            ));
        }

        // SAFETY: the segment is shared with other processes by design. This
        // process only writes it under the named lock, and readers never write.
        let map = unsafe { MmapOptions::new().len(layout.segment_len()).map_mut(&file) }
            .map_err(|e| RelayError::resource(name, e))?;
        drop(file);

        log::debug!(
            "mapped shared segment {} ({} bytes, {})",
            name,
            layout.segment_len(),
            if fresh { "created" } else { "reopened" }
        );

        Ok(Self {
            name: name.to_string(),
            layout,
            map: Some(map),
            fresh,
        })
    }

    /// Write one frame and its sequence number.
    ///
    /// Pixels land at offset 0, then the counter (little-endian) right after
    /// them. The caller must hold the named lock for the whole call.
    pub fn publish(&mut self, frame: &[u8], sequence: u32) -> RelayResult<()> {
        let frame_len = self.layout.frame_len();
        if frame.len() != frame_len {
            return Err(RelayError::FrameLength {
                expected: frame_len,
                actual: frame.len(),
            });
        }
        let map = self
            .map
            .as_mut()
            .ok_or_else(|| RelayError::Closed(self.name.clone()))?;

        let (pixels, counter) = map.split_at_mut(frame_len);
        pixels.copy_from_slice(frame);
        // Pixels must be visible before the counter that announces them.
        fence(Ordering::Release);
        counter[..SEQUENCE_BYTES].copy_from_slice(&sequence.to_le_bytes());
        Ok(())
    }

    /// Sequence number currently stored in the segment.
    pub fn sequence(&self) -> RelayResult<u32> {
        let map = self.mapped()?;
        let offset = self.layout.sequence_offset();
        let mut bytes = [0u8; SEQUENCE_BYTES];
        bytes.copy_from_slice(&map[offset..offset + SEQUENCE_BYTES]);
        Ok(u32::from_le_bytes(bytes))
    }

    /// Pixel region as currently stored in the segment.
    pub fn frame(&self) -> RelayResult<&[u8]> {
        let map = self.mapped()?;
        Ok(&map[..self.layout.frame_len()])
    }

    /// The whole segment: pixels followed by the counter bytes.
    pub fn segment(&self) -> RelayResult<&[u8]> {
        Ok(&self.mapped()?[..])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    /// Mapped length in bytes, or 0 once closed.
    pub fn segment_len(&self) -> usize {
        self.map.as_ref().map_or(0, |map| map.len())
    }

    /// True when this call to `create` allocated the segment.
    pub fn was_created(&self) -> bool {
        self.fresh
    }

    pub fn is_open(&self) -> bool {
        self.map.is_some()
    }

    /// Unmap the segment. Safe to call more than once.
    pub fn close(&mut self) {
        let Some(map) = self.map.take() else {
            return;
        };
        if let Err(e) = map.flush() {
            log::warn!("flush of shared segment {} failed: {}", self.name, e);
        }
        drop(map);
        log::info!("shared segment {} unmapped", self.name);
    }

    /// Remove a named segment from the OS namespace.
    ///
    /// Processes that still have it mapped keep a valid mapping. Returns
    /// `Ok(false)` when no segment with that name existed.
    pub fn unlink(name: &str) -> RelayResult<bool> {
        let c_name = object_cstring(name)?;
        // SAFETY: c_name is a valid NUL-terminated string for the duration of the call.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::NotFound {
            Ok(false)
        } else {
            Err(RelayError::resource(name, err))
        }
    }

    fn mapped(&self) -> RelayResult<&MmapMut> {
        self.map
            .as_ref()
            .ok_or_else(|| RelayError::Closed(self.name.clone()))
    }
}

impl Drop for SharedFrameStore {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn object_cstring(name: &str) -> RelayResult<CString> {
    validate_object_name(name)?;
    CString::new(name).map_err(|_| RelayError::InvalidName {
        name: name.to_string(),
        reason: "must not contain NUL bytes",
    })
}

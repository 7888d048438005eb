//! Frame ingestion collaborators.
//!
//! - `camera`: Hikvision ISAPI snapshot client (HTTP)
//! - `normalize`: JPEG decode, resize and channel ordering
//!
//! Both sit behind traits so the acquisition loop can run against fakes.
//! Neither touches shared memory; they run outside the named lock.

pub mod camera;
pub mod normalize;

pub use camera::{CameraConfig, HikvisionCamera};
pub use normalize::{ImageDecoder, PixelFormat};

use anyhow::Result;

/// Source of encoded snapshots.
pub trait FrameSource {
    /// Fetch one encoded image.
    ///
    /// `Ok(None)` means the camera answered without an image. Errors are
    /// treated as transient by the caller.
    fn fetch(&mut self) -> Result<Option<Vec<u8>>>;

    /// Short description for log lines.
    fn describe(&self) -> String;
}

/// Turns an encoded snapshot into exactly `width * height * 3` bytes.
pub trait FrameDecoder {
    fn decode(&mut self, encoded: &[u8]) -> Result<Vec<u8>>;
}

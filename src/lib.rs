//! live-alert capture
//!
//! Pulls snapshots from a network camera, normalizes them to a fixed
//! resolution and publishes the most recent one into POSIX shared memory so
//! detector processes can read it without talking to the camera.
//!
//! # Shared segment
//!
//! `/video_stream`, `width * height * 3 + 4` bytes:
//!
//! ```text
//! [pixel data, row-major, 3 bytes per pixel][u32 sequence, little-endian]
//! ```
//!
//! Every write happens while holding the named semaphore
//! `/live_alert_mutex` (initial value 1). Readers take the same semaphore,
//! copy the pixels and the counter, and release it. The counter advances by
//! one (wrapping) per published frame.
//!
//! # Module Structure
//!
//! - `layout`: segment geometry and object name rules
//! - `store`: the mapped segment (`SharedFrameStore`)
//! - `gate`: the named semaphore (`NamedLock`)
//! - `lifecycle`: open/teardown of both as one handle pair
//! - `capture`: the acquisition loop
//! - `ingest`: camera client and decoder
//! - `preview`, `config`, `logging`: the binary's support code

pub mod capture;
pub mod config;
pub mod error;
pub mod gate;
pub mod ingest;
pub mod layout;
pub mod lifecycle;
pub mod logging;
pub mod preview;
pub mod store;

pub use capture::{
    CaptureExit, CaptureLoop, CaptureSettings, CaptureStats, FrameSink, RateMeter, Shutdown,
};
pub use config::{CaptureConfig, CaptureOverrides};
pub use error::{RelayError, RelayResult};
pub use gate::{LockGuard, NamedLock};
pub use ingest::{
    CameraConfig, FrameDecoder, FrameSource, HikvisionCamera, ImageDecoder, PixelFormat,
};
pub use layout::{validate_object_name, FrameLayout};
pub use lifecycle::{ResourceNames, SharedResources, DEFAULT_LOCK_NAME, DEFAULT_SEGMENT_NAME};
pub use preview::{Preview, PreviewAction, SnapshotPreview};
pub use store::SharedFrameStore;

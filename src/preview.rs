//! Interactive preview for bench testing.
//!
//! There is no window: the last published frame is written to a JPEG file
//! that an image viewer can keep reloading, and typing `q` + Enter on stdin
//! asks the capture loop to stop.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, TryRecvError};

use anyhow::{anyhow, Context, Result};
use image::RgbImage;

use crate::ingest::normalize::to_rgb;
use crate::ingest::PixelFormat;
use crate::layout::FrameLayout;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreviewAction {
    Continue,
    Quit,
}

/// Shown a frame after every successful publish, outside the named lock.
pub trait Preview {
    fn show(&mut self, frame: &[u8]) -> Result<PreviewAction>;
}

pub struct SnapshotPreview {
    path: PathBuf,
    staging: PathBuf,
    layout: FrameLayout,
    format: PixelFormat,
    quit: Receiver<()>,
    input_closed: bool,
}

impl SnapshotPreview {
    /// Quit is requested by a message on `quit`. A disconnected sender only
    /// means nobody can ask any more; it never quits by itself.
    pub fn new(
        path: PathBuf,
        layout: FrameLayout,
        format: PixelFormat,
        quit: Receiver<()>,
    ) -> Self {
        let staging = path.with_extension("tmp.jpg");
        Self {
            path,
            staging,
            layout,
            format,
            quit,
            input_closed: false,
        }
    }

    /// Preview whose quit signal is a `q` line on stdin.
    pub fn with_stdin_quit(
        path: PathBuf,
        layout: FrameLayout,
        format: PixelFormat,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("preview-stdin".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    let Ok(line) = line else {
                        break;
                    };
                    if line.trim().eq_ignore_ascii_case("q") {
                        let _ = tx.send(());
                        break;
                    }
                }
            })
            .context("spawn preview stdin watcher")?;
        log::info!(
            "preview enabled: frames written to {}; type q + Enter to quit",
            path.display()
        );
        Ok(Self::new(path, layout, format, rx))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Preview for SnapshotPreview {
    fn show(&mut self, frame: &[u8]) -> Result<PreviewAction> {
        let rgb = to_rgb(frame, self.format);
        let image = RgbImage::from_raw(self.layout.width(), self.layout.height(), rgb)
            .ok_or_else(|| anyhow!("preview frame does not match {:?}", self.layout))?;
        image
            .save(&self.staging)
            .with_context(|| format!("write preview {}", self.staging.display()))?;
        std::fs::rename(&self.staging, &self.path)
            .with_context(|| format!("replace preview {}", self.path.display()))?;

        match self.quit.try_recv() {
            Ok(()) => Ok(PreviewAction::Quit),
            Err(TryRecvError::Empty) => Ok(PreviewAction::Continue),
            Err(TryRecvError::Disconnected) => {
                if !self.input_closed {
                    self.input_closed = true;
                    log::info!("preview input closed; quit with Ctrl-C instead");
                }
                Ok(PreviewAction::Continue)
            }
        }
    }
}

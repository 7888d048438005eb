//! Log destinations: stderr plus `<log_dir>/capture.log`.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const LOG_FILE_NAME: &str = "capture.log";

/// Writes every line to stderr and to a second writer.
pub struct Tee<W> {
    file: W,
}

impl<W: Write> Tee<W> {
    pub fn new(file: W) -> Self {
        Self { file }
    }

    pub fn into_inner(self) -> W {
        self.file
    }
}

impl<W: Write> Write for Tee<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // stderr going away must not stop the file log.
        let _ = io::stderr().write_all(buf);
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        self.file.flush()
    }
}

/// Create `log_dir`, open the log file for appending and install
/// `env_logger` (default level `info`, `RUST_LOG` overrides).
pub fn init(log_dir: &Path) -> Result<PathBuf> {
    let (path, file) = open_log_file(log_dir)?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(Tee::new(file))))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        })
        .try_init()
        .context("install logger")?;
    Ok(path)
}

pub fn open_log_file(log_dir: &Path) -> Result<(PathBuf, File)> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("create log directory {}", log_dir.display()))?;
    let path = log_dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("could not open log file {}", path.display()))?;
    Ok((path, file))
}

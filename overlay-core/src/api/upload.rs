//! Client-side checks and plumbing for `POST /upload`.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::ValidationError;

/// Largest file the backend accepts.
pub const MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

pub const UPLOAD_MIME: &str = "video/mp4";

/// Shared cancellation switch, checked while the request body streams.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress is reported as `(bytes_sent, total_bytes)`.
pub type ProgressFn = Box<dyn FnMut(u64, u64) + Send>;

/// A file that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub file_name: String,
    pub size: u64,
}

/// Check extension and size before any bytes go over the wire.
pub fn validate_upload(path: &Path) -> Result<UploadFile, ValidationError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let is_mp4 = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("mp4"));
    if !is_mp4 {
        return Err(ValidationError::UnsupportedFileType(file_name));
    }

    let metadata = std::fs::metadata(path)
        .map_err(|_| ValidationError::MissingFile(path.display().to_string()))?;
    if !metadata.is_file() {
        return Err(ValidationError::MissingFile(path.display().to_string()));
    }
    let size = metadata.len();
    if size == 0 {
        return Err(ValidationError::EmptyFile(file_name));
    }
    if size > MAX_UPLOAD_BYTES {
        return Err(ValidationError::FileTooLarge {
            size,
            limit: MAX_UPLOAD_BYTES,
        });
    }
    Ok(UploadFile { file_name, size })
}

pub(crate) const CANCELLED_MARKER: &str = "upload cancelled";

/// Wraps the request body: reports progress and aborts the stream once the
/// cancel flag is raised.
pub(crate) struct ProgressReader<R> {
    inner: R,
    sent: u64,
    total: u64,
    progress: Option<ProgressFn>,
    cancel: CancelFlag,
}

impl<R: Read> ProgressReader<R> {
    pub(crate) fn new(inner: R, total: u64, progress: Option<ProgressFn>, cancel: CancelFlag) -> Self {
        Self {
            inner,
            sent: 0,
            total,
            progress,
            cancel,
        }
    }
}

impl ProgressReader<File> {
    pub(crate) fn open(
        path: &Path,
        total: u64,
        progress: Option<ProgressFn>,
        cancel: CancelFlag,
    ) -> io::Result<Self> {
        Ok(Self::new(File::open(path)?, total, progress, cancel))
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other(CANCELLED_MARKER));
        }
        let n = self.inner.read(buf)?;
        self.sent += n as u64;
        if let Some(progress) = self.progress.as_mut() {
            progress(self.sent, self.total);
        }
        Ok(n)
    }
}

/// Whole-number percentage, `0` when the total is unknown.
pub fn percentage(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((sent.min(total) * 100) / total) as u8
}

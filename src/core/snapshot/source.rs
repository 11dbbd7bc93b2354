//! 视频源引用

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempPath;

const REMOTE_SCHEMES: [&str; 4] = ["http://", "https://", "rtsp://", "rtmp://"];

/// Immutable handle to the bytes a session decodes from.
///
/// A `Spooled` ref owns a temp file holding uploaded bytes; the file is
/// removed when the last clone is dropped.
#[derive(Clone)]
pub enum VideoSourceRef {
    Local(PathBuf),
    Remote(String),
    Spooled(Arc<TempPath>),
}

impl VideoSourceRef {
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        let lower = trimmed.to_ascii_lowercase();
        if REMOTE_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
            VideoSourceRef::Remote(trimmed.to_string())
        } else {
            VideoSourceRef::Local(PathBuf::from(trimmed))
        }
    }

    /// 将上传的视频字节落盘为临时文件
    pub fn spool(bytes: &[u8]) -> std::io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("snapshot-src-")
            .tempfile()?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(VideoSourceRef::Spooled(Arc::new(file.into_temp_path())))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, VideoSourceRef::Remote(_))
    }

    /// The string handed to the decoder as its input.
    pub fn locator(&self) -> String {
        match self {
            VideoSourceRef::Local(path) => path.to_string_lossy().into_owned(),
            VideoSourceRef::Remote(url) => url.clone(),
            VideoSourceRef::Spooled(path) => {
                let path: &Path = path;
                path.to_string_lossy().into_owned()
            }
        }
    }
}

impl fmt::Debug for VideoSourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoSourceRef::Local(path) => f.debug_tuple("Local").field(path).finish(),
            VideoSourceRef::Remote(url) => f.debug_tuple("Remote").field(url).finish(),
            VideoSourceRef::Spooled(_) => f.debug_tuple("Spooled").field(&self.locator()).finish(),
        }
    }
}

impl fmt::Display for VideoSourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.locator())
    }
}

use std::fmt;

use thiserror::Error;

/// 解码失败的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeCause {
    /// 容器或编码格式不受支持
    UnsupportedFormat,
    /// 格式可识别，但解码或渲染失败（包括等待超时）
    DecodeFailure,
    /// 拉流/读取过程中的网络错误
    Network,
    /// 加载被中止
    Aborted,
}

impl DecodeCause {
    /// Unsupported sources cannot be scrubbed either, so the UI should go
    /// straight to direct image upload.
    pub fn skips_preview(&self) -> bool {
        matches!(self, DecodeCause::UnsupportedFormat)
    }
}

impl fmt::Display for DecodeCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecodeCause::UnsupportedFormat => "unsupported-format",
            DecodeCause::DecodeFailure => "decode-failure",
            DecodeCause::Network => "network",
            DecodeCause::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("decode error ({cause}): {message}")]
pub struct DecodeError {
    pub cause: DecodeCause,
    pub message: String,
}

impl DecodeError {
    pub fn new(cause: DecodeCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(DecodeCause::UnsupportedFormat, message)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(DecodeCause::DecodeFailure, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(DecodeCause::Network, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(DecodeCause::Aborted, message)
    }

    /// 面向用户的提示文案
    pub fn user_message(&self) -> &'static str {
        match self.cause {
            DecodeCause::UnsupportedFormat => {
                "This video format is not supported for preview. Please upload a still image instead."
            }
            DecodeCause::DecodeFailure => {
                "The video could not be decoded. Pick a frame manually or upload an image."
            }
            DecodeCause::Network => {
                "The video could not be loaded because of a network error. Check the connection and pick a frame manually."
            }
            DecodeCause::Aborted => "Loading the video was cancelled.",
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upload rejected with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid upload response: {0}")]
    InvalidResponse(String),
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("unsupported image data")]
    UnsupportedImage,
    #[error("upload rejected: {0}")]
    Rejected(String),
}

/// Why a session handed control to manual capture.
#[derive(Debug, Clone, PartialEq)]
pub enum ManualReason {
    /// Every planned candidate came back black or failed to upload.
    Exhausted,
    /// The session deadline fired first.
    Timeout,
    Decode(DecodeError),
    /// Session-level fault, e.g. an event arriving in a state that cannot take it.
    Fault(String),
}

impl ManualReason {
    pub fn user_message(&self) -> &'static str {
        match self {
            ManualReason::Exhausted | ManualReason::Fault(_) => {
                "Could not extract a preview automatically. Pick a frame manually."
            }
            ManualReason::Timeout => {
                "Extracting a preview took too long. Pick a frame manually."
            }
            ManualReason::Decode(e) => e.user_message(),
        }
    }
}

impl fmt::Display for ManualReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManualReason::Exhausted => f.write_str("exhausted"),
            ManualReason::Timeout => f.write_str("timeout"),
            ManualReason::Decode(e) => write!(f, "{}", e),
            ManualReason::Fault(msg) => write!(f, "fault: {}", msg),
        }
    }
}

#[derive(Debug, Error)]
pub enum ManualCaptureError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("no frame has been previewed yet")]
    NothingPreviewed,
    #[error("the session this capture belongs to has been superseded")]
    Superseded,
    #[error("the session is still extracting automatically")]
    SessionRunning,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// 构建生产环境提取器时可能出现的错误
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("ffmpeg/ffprobe not found: {0}")]
    Ffmpeg(#[from] which::Error),
    #[error(transparent)]
    Uploader(#[from] UploadError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_displays_as_plain_word() {
        assert_eq!(ManualReason::Exhausted.to_string(), "exhausted");
    }

    #[test]
    fn test_only_unsupported_format_skips_preview() {
        assert!(DecodeCause::UnsupportedFormat.skips_preview());
        assert!(!DecodeCause::Network.skips_preview());
        assert!(!DecodeCause::DecodeFailure.skips_preview());
        assert!(!DecodeCause::Aborted.skips_preview());
    }

    #[test]
    fn test_decode_reason_uses_cause_message() {
        let reason = ManualReason::Decode(DecodeError::network("connection reset"));
        assert!(reason.user_message().contains("network"));
        assert!(reason.to_string().contains("connection reset"));
    }
}

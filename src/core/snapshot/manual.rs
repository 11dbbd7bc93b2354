//! 手动截帧：用户拖动进度条预览任意帧并确认上传，或直接上传一张图片

use std::sync::Arc;

use log::{debug, info, warn};

use super::config::ExtractorConfig;
use super::coordinator::{SessionGate, SessionId, SharedDecoder};
use super::error::{DecodeError, ManualCaptureError, UploadError};
use super::frame::FrameBuffer;
use super::uploader::{EncodedImage, SnapshotUploader, UploadResult};
use super::validator::{FrameQuality, FrameQualityValidator};

/// What the user sees while scrubbing.
#[derive(Debug, Clone)]
pub struct FramePreview {
    pub timestamp_seconds: f64,
    pub width: u32,
    pub height: u32,
    /// 仅供提示，黑帧同样可以确认
    pub quality: FrameQuality,
    pub thumbnail: EncodedImage,
}

pub struct ManualCaptureController {
    session: SessionId,
    decoder: SharedDecoder,
    validator: FrameQualityValidator,
    uploader: Arc<dyn SnapshotUploader>,
    jpeg_quality: u8,
    preview_max_width: u32,
    gate: Arc<SessionGate>,
    previewed: Option<FrameBuffer>,
}

impl ManualCaptureController {
    pub fn new(
        session: SessionId,
        decoder: SharedDecoder,
        validator: FrameQualityValidator,
        uploader: Arc<dyn SnapshotUploader>,
        config: &ExtractorConfig,
        gate: Arc<SessionGate>,
    ) -> Self {
        Self {
            session,
            decoder,
            validator,
            uploader,
            jpeg_quality: config.jpeg_quality,
            preview_max_width: config.preview_max_width,
            gate,
            previewed: None,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn previewed_timestamp(&self) -> Option<f64> {
        self.previewed.as_ref().map(|f| f.timestamp_seconds())
    }

    /// 只在会话已结束自动抽帧、且未被替换时可用
    fn ensure_current(&self) -> Result<(), ManualCaptureError> {
        if !self.gate.is_current(self.session) {
            Err(ManualCaptureError::Superseded)
        } else if !self.gate.is_settled(self.session) {
            Err(ManualCaptureError::SessionRunning)
        } else {
            Ok(())
        }
    }

    /// Seeks to `timestamp_seconds` (clamped into the clip) and returns a
    /// downscaled preview. The full-resolution frame is kept for `confirm`.
    pub async fn preview_at(&mut self, timestamp_seconds: f64) -> Result<FramePreview, ManualCaptureError> {
        self.ensure_current()?;

        let frame = {
            let mut decoder = self.decoder.lock().await;
            self.ensure_current()?;
            let duration = decoder.metadata().map(|m| m.duration);
            let target = clamp_timestamp(timestamp_seconds, duration);
            debug!("🖐️ session {} preview at {:.2}s", self.session, target);
            decoder.seek_and_capture(target).await?
        };
        self.ensure_current()?;

        let quality = self.validator.assess(&frame);
        let thumbnail = frame
            .fit_within(self.preview_max_width)
            .ok_or_else(|| DecodeError::failure("captured frame is unreadable"))?
            .encode_jpeg(self.jpeg_quality)
            .map_err(UploadError::from)?;

        let preview = FramePreview {
            timestamp_seconds: frame.timestamp_seconds(),
            width: frame.width,
            height: frame.height,
            quality,
            thumbnail,
        };
        self.previewed = Some(frame);
        Ok(preview)
    }

    /// Uploads the last previewed frame at full resolution. Failures are
    /// returned as-is.
    pub async fn confirm(&self) -> Result<UploadResult, ManualCaptureError> {
        self.confirm_with_progress(&|_| {}).await
    }

    pub async fn confirm_with_progress(
        &self,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<UploadResult, ManualCaptureError> {
        self.ensure_current()?;
        let frame = self
            .previewed
            .as_ref()
            .ok_or(ManualCaptureError::NothingPreviewed)?;

        let encoded = frame.encode_jpeg(self.jpeg_quality).map_err(UploadError::from)?;
        let result = self.uploader.upload(&encoded, progress).await.map_err(|e| {
            warn!("⚠️ session {} manual upload failed: {}", self.session, e);
            e
        })?;
        info!(
            "🖼️ session {} manual snapshot at {:.2}s: {}",
            self.session,
            frame.timestamp_seconds(),
            result.url
        );
        Ok(result)
    }

    /// 跳过解码，直接上传用户提供的图片
    pub async fn upload_external_image(&self, bytes: Vec<u8>) -> Result<UploadResult, ManualCaptureError> {
        self.ensure_current()?;
        let image = EncodedImage::sniff(bytes)?;
        debug!("📎 session {} external {} ({} bytes)", self.session, image.mime, image.len());

        let result = self.uploader.upload(&image, &|_| {}).await?;
        info!("🖼️ session {} external snapshot: {}", self.session, result.url);
        Ok(result)
    }
}

fn clamp_timestamp(timestamp_seconds: f64, duration: Option<f64>) -> f64 {
    let t = if timestamp_seconds.is_finite() {
        timestamp_seconds.max(0.0)
    } else {
        0.0
    };
    match duration {
        Some(d) if d.is_finite() && d > 0.0 => t.min(d),
        _ => t,
    }
}

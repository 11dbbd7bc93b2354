//! 视频封面提取器

use std::sync::Arc;

use log::info;

use crate::core::snapshot::{
    ConfigError, DecoderSubstrate, ExtractionCoordinator, ExtractionListener, ExtractorConfig,
    FfmpegSubstrate, HttpSnapshotUploader, ManualCaptureController, SessionHandle, SessionId,
    SetupError, SnapshotUploader, VideoSourceRef,
};

/// 视频封面提取器 - 自动抽帧 + 黑帧过滤 + 手动兜底
///
/// ```ignore
/// let extractor = SnapshotExtractor::with_ffmpeg(config, endpoint, listener)?;
/// let handle = extractor.supply_path("/data/cam-1.mp4");
/// if let Some(report) = handle.wait().await {
///     if report.accepted_url().is_none() {
///         let mut manual = extractor.manual_for(report.id);
///         manual.preview_at(3.0).await?;
///         manual.confirm().await?;
///     }
/// }
/// ```
pub struct SnapshotExtractor {
    coordinator: ExtractionCoordinator,
}

impl SnapshotExtractor {
    pub fn create(
        config: ExtractorConfig,
        substrate: Box<dyn DecoderSubstrate>,
        uploader: Arc<dyn SnapshotUploader>,
        listener: Arc<dyn ExtractionListener>,
    ) -> Result<Self, ConfigError> {
        let coordinator = ExtractionCoordinator::new(config, substrate, uploader, listener)?;
        info!("🎬 SnapshotExtractor: created");
        Ok(Self { coordinator })
    }

    /// 使用 PATH 中的 ffmpeg 解码，HTTP PUT 上传
    pub fn with_ffmpeg(
        config: ExtractorConfig,
        upload_endpoint: &str,
        listener: Arc<dyn ExtractionListener>,
    ) -> Result<Self, SetupError> {
        let substrate = FfmpegSubstrate::locate()?;
        let uploader = HttpSnapshotUploader::new(upload_endpoint)?;
        Ok(Self::create(
            config,
            Box::new(substrate),
            Arc::new(uploader),
            listener,
        )?)
    }

    /// 开始新会话，之前的会话作废
    pub fn supply_source(&self, source: VideoSourceRef) -> SessionHandle {
        self.coordinator.start(source)
    }

    pub fn supply_path(&self, input: &str) -> SessionHandle {
        self.supply_source(VideoSourceRef::parse(input))
    }

    /// 内存中的视频先落盘到临时文件，会话结束或被替换后删除
    pub fn supply_bytes(&self, bytes: &[u8]) -> std::io::Result<SessionHandle> {
        Ok(self.supply_source(VideoSourceRef::spool(bytes)?))
    }

    pub fn manual(&self, handle: &SessionHandle) -> ManualCaptureController {
        self.manual_for(handle.id())
    }

    pub fn manual_for(&self, session: SessionId) -> ManualCaptureController {
        self.coordinator.manual_controller(session)
    }

    pub fn current_session(&self) -> Option<SessionId> {
        self.coordinator.current_session()
    }

    pub fn cancel(&self) {
        self.coordinator.cancel()
    }

    pub fn config(&self) -> &ExtractorConfig {
        self.coordinator.config()
    }
}

impl Drop for SnapshotExtractor {
    fn drop(&mut self) {
        info!("🗑️ SnapshotExtractor: released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::mock::{MockSubstrate, MockUploader, RecordedEvent, RecordingListener};

    fn extractor(substrate: MockSubstrate) -> (SnapshotExtractor, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener::new());
        let extractor = SnapshotExtractor::create(
            ExtractorConfig::for_local_file(),
            Box::new(substrate),
            Arc::new(MockUploader::new()),
            listener.clone(),
        )
        .unwrap();
        (extractor, listener)
    }

    #[test]
    fn test_create_rejects_invalid_config() {
        let config = ExtractorConfig {
            candidate_timestamps: vec![],
            ..Default::default()
        };
        let result = SnapshotExtractor::create(
            config,
            Box::new(MockSubstrate::new()),
            Arc::new(MockUploader::new()),
            Arc::new(RecordingListener::new()),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supply_bytes_runs_a_session() {
        let (extractor, listener) = extractor(MockSubstrate::new().with_default_luma(64));
        assert_eq!(extractor.config().settle_delay_ms, 150);

        let handle = extractor.supply_bytes(b"\x00\x00\x00\x18ftypmp42").unwrap();
        let id = handle.id();
        assert_eq!(extractor.current_session(), Some(id));

        let report = handle.wait().await.unwrap();
        assert_eq!(report.id, id);
        assert!(matches!(
            listener.outcomes().as_slice(),
            [RecordedEvent::Accepted { session, .. }] if *session == id
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_clears_current_session() {
        let (extractor, listener) = extractor(MockSubstrate::new().with_default_luma(64));
        let handle = extractor.supply_path("https://media.example/live.m3u8");
        extractor.cancel();

        assert!(extractor.current_session().is_none());
        assert!(handle.wait().await.is_none());
        assert!(listener.events().is_empty());
    }
}

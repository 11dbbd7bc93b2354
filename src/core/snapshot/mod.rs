//! 视频封面自动抽帧
//!
//! 核心策略：
//! 1. 固定候选时间点 - 依次 seek 到 2s / 5s / 10s / 15s
//! 2. 黑帧检测 - 抽样计算平均亮度，过暗的帧跳过
//! 3. 状态机驱动 - 单一会话状态，超时或解码失败转入手动模式
//! 4. 手动兜底 - 用户拖动预览截帧，或直接上传图片

pub mod config;
pub mod coordinator;
pub mod decoder;
pub mod error;
pub mod ffmpeg;
pub mod frame;
pub mod manual;
pub mod mock;
pub mod source;
pub mod state_machine;
pub mod uploader;
pub mod validator;

pub use config::ExtractorConfig;
pub use coordinator::{
    plan_candidates, AttemptOutcome, ChannelListener, ExtractionAttempt, ExtractionCoordinator,
    ExtractionEvent, ExtractionListener, SessionHandle, SessionId, SessionReport,
};
pub use decoder::{DecodeSignal, DecoderEvent, DecoderSubstrate, FrameDecoder, SignalKind, VideoMetadata};
pub use error::{
    ConfigError, DecodeCause, DecodeError, ManualCaptureError, ManualReason, SetupError, UploadError,
};
pub use ffmpeg::FfmpegSubstrate;
pub use frame::FrameBuffer;
pub use manual::{FramePreview, ManualCaptureController};
pub use mock::{MockSubstrate, MockUploader};
pub use source::VideoSourceRef;
pub use state_machine::{SessionAction, SessionEvent, SessionState};
pub use uploader::{EncodedImage, HttpSnapshotUploader, SnapshotUploader, UploadResult};
pub use validator::{FrameQuality, FrameQualityValidator};

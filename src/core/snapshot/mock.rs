//! 测试替身：可编排的解码底层、上传器与回调记录器

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::coordinator::{ExtractionListener, SessionId};
use super::decoder::{DecodeSignal, DecoderEvent, DecoderSubstrate, SignalKind};
use super::error::{ManualReason, UploadError};
use super::frame::FrameBuffer;
use super::source::VideoSourceRef;
use super::uploader::{EncodedImage, SnapshotUploader, UploadResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockLoad {
    Ready,
    Fail(SignalKind),
    /// Never reports readiness nor failure.
    Hang,
}

/// Timestamps passed to `seek`, shared with the test.
pub type SeekLog = Arc<Mutex<Vec<f64>>>;

/// 底层生命周期计数，与测试共享
#[derive(Debug, Default)]
pub struct MockCounters {
    detaches: AtomicUsize,
    cancelled_seeks: AtomicUsize,
}

impl MockCounters {
    pub fn detaches(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }

    /// Seeks abandoned through `cancel_seek` while still pending.
    pub fn cancelled_seeks(&self) -> usize {
        self.cancelled_seeks.load(Ordering::SeqCst)
    }
}

pub struct MockSubstrate {
    width: u32,
    height: u32,
    duration: f64,
    load: MockLoad,
    luma: Vec<(f64, u8)>,
    default_luma: u8,
    seek_delay: Duration,
    seek_delays: Vec<(f64, Duration)>,
    hanging_seeks: Vec<f64>,
    failing_seeks: Vec<f64>,
    seeks: SeekLog,
    counters: Arc<MockCounters>,
    events: Option<mpsc::UnboundedSender<DecoderEvent>>,
    surface: Arc<Mutex<Option<FrameBuffer>>>,
    pending: Option<JoinHandle<()>>,
}

impl MockSubstrate {
    pub fn new() -> Self {
        Self {
            width: 160,
            height: 90,
            duration: 60.0,
            load: MockLoad::Ready,
            luma: Vec::new(),
            default_luma: 0,
            seek_delay: Duration::from_millis(50),
            seek_delays: Vec::new(),
            hanging_seeks: Vec::new(),
            failing_seeks: Vec::new(),
            seeks: Arc::new(Mutex::new(Vec::new())),
            counters: Arc::new(MockCounters::default()),
            events: None,
            surface: Arc::new(Mutex::new(None)),
            pending: None,
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_load(mut self, load: MockLoad) -> Self {
        self.load = load;
        self
    }

    /// 指定时间点渲染出的灰度值，未指定的时间点使用 default_luma
    pub fn with_luma_at(mut self, timestamp: f64, luma: u8) -> Self {
        self.luma.push((timestamp, luma));
        self
    }

    pub fn with_default_luma(mut self, luma: u8) -> Self {
        self.default_luma = luma;
        self
    }

    pub fn with_seek_delay(mut self, delay: Duration) -> Self {
        self.seek_delay = delay;
        self
    }

    /// 单独指定某个时间点的 seek 耗时
    pub fn with_seek_delay_at(mut self, timestamp: f64, delay: Duration) -> Self {
        self.seek_delays.push((timestamp, delay));
        self
    }

    pub fn with_hanging_seek_at(mut self, timestamp: f64) -> Self {
        self.hanging_seeks.push(timestamp);
        self
    }

    pub fn with_failing_seek_at(mut self, timestamp: f64) -> Self {
        self.failing_seeks.push(timestamp);
        self
    }

    pub fn seek_log(&self) -> SeekLog {
        self.seeks.clone()
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        self.counters.clone()
    }

    fn luma_for(&self, timestamp: f64) -> u8 {
        self.luma
            .iter()
            .find(|(t, _)| (*t - timestamp).abs() < 1e-6)
            .map(|(_, l)| *l)
            .unwrap_or(self.default_luma)
    }

    fn delay_for(&self, timestamp: f64) -> Duration {
        self.seek_delays
            .iter()
            .find(|(t, _)| (*t - timestamp).abs() < 1e-6)
            .map(|(_, d)| *d)
            .unwrap_or(self.seek_delay)
    }

    fn matches(list: &[f64], timestamp: f64) -> bool {
        list.iter().any(|t| (*t - timestamp).abs() < 1e-6)
    }
}

impl Default for MockSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderSubstrate for MockSubstrate {
    fn load(&mut self, _source: &VideoSourceRef, events: mpsc::UnboundedSender<DecoderEvent>) {
        match self.load {
            MockLoad::Ready => {
                let _ = events.send(DecoderEvent::DimensionsReady {
                    width: self.width,
                    height: self.height,
                });
                let _ = events.send(DecoderEvent::DurationKnown(self.duration));
            }
            MockLoad::Fail(kind) => {
                let _ = events.send(DecoderEvent::DecodeError(DecodeSignal::new(
                    kind,
                    "scripted load failure",
                )));
            }
            MockLoad::Hang => {}
        }
        self.events = Some(events);
    }

    fn seek(&mut self, ticket: u64, timestamp_seconds: f64) {
        if let Ok(mut seeks) = self.seeks.lock() {
            seeks.push(timestamp_seconds);
        }
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
        if Self::matches(&self.hanging_seeks, timestamp_seconds) {
            return;
        }
        let Some(events) = self.events.clone() else {
            return;
        };

        let fail = Self::matches(&self.failing_seeks, timestamp_seconds);
        let luma = self.luma_for(timestamp_seconds);
        let frame = FrameBuffer::uniform(
            self.width,
            self.height,
            [luma, luma, luma],
            Duration::from_secs_f64(timestamp_seconds.max(0.0)),
        );
        let surface = self.surface.clone();
        let delay = self.delay_for(timestamp_seconds);

        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if fail {
                let _ = events.send(DecoderEvent::SeekFailed {
                    ticket,
                    signal: DecodeSignal::new(SignalKind::Decode, "scripted seek failure"),
                });
                return;
            }
            if let Ok(mut slot) = surface.lock() {
                *slot = Some(frame);
            }
            let _ = events.send(DecoderEvent::SeekCompleted { ticket });
        }));
    }

    fn cancel_seek(&mut self) {
        if let Some(pending) = self.pending.take() {
            if !pending.is_finished() {
                self.counters.cancelled_seeks.fetch_add(1, Ordering::SeqCst);
            }
            pending.abort();
        }
    }

    fn render(&mut self) -> Result<FrameBuffer, DecodeSignal> {
        self.surface
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or_else(|| DecodeSignal::new(SignalKind::Decode, "nothing rendered"))
    }

    fn detach(&mut self) {
        self.counters.detaches.fetch_add(1, Ordering::SeqCst);
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
        self.events = None;
        if let Ok(mut slot) = self.surface.lock() {
            *slot = None;
        }
    }
}

/// 按调用顺序返回预设结果的上传器；脚本用完后一律成功
pub struct MockUploader {
    script: Mutex<VecDeque<Result<(), String>>>,
    uploads: Arc<Mutex<Vec<EncodedImage>>>,
}

impl MockUploader {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            uploads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing_first(count: usize) -> Self {
        let uploader = Self::new();
        if let Ok(mut script) = uploader.script.lock() {
            for i in 0..count {
                script.push_back(Err(format!("scripted failure #{}", i + 1)));
            }
        }
        uploader
    }

    pub fn call_count(&self) -> usize {
        self.uploads.lock().map(|u| u.len()).unwrap_or(0)
    }

    pub fn uploads(&self) -> Vec<EncodedImage> {
        self.uploads.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

impl Default for MockUploader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotUploader for MockUploader {
    async fn upload(
        &self,
        image: &EncodedImage,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<UploadResult, UploadError> {
        let call = {
            let mut uploads = self
                .uploads
                .lock()
                .map_err(|_| UploadError::Rejected("mock poisoned".into()))?;
            uploads.push(image.clone());
            uploads.len()
        };
        progress(0.0);

        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(Err(message)) => Err(UploadError::Rejected(message)),
            _ => {
                progress(1.0);
                Ok(UploadResult {
                    url: format!("https://snapshots.example/snapshot-{}.jpg", call),
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEvent {
    Accepted { session: SessionId, url: String },
    ManualModeRequired { session: SessionId, reason: ManualReason },
    UploadProgress { session: SessionId, fraction: f32 },
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// 终态回调（不含上传进度）
    pub fn outcomes(&self) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|e| !matches!(e, RecordedEvent::UploadProgress { .. }))
            .collect()
    }

    fn push(&self, event: RecordedEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl ExtractionListener for RecordingListener {
    fn on_accepted(&self, session: SessionId, url: &str) {
        self.push(RecordedEvent::Accepted {
            session,
            url: url.to_string(),
        });
    }

    fn on_manual_mode_required(&self, session: SessionId, reason: &ManualReason) {
        self.push(RecordedEvent::ManualModeRequired {
            session,
            reason: reason.clone(),
        });
    }

    fn on_upload_progress(&self, session: SessionId, fraction: f32) {
        self.push(RecordedEvent::UploadProgress { session, fraction });
    }
}

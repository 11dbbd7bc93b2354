//! 帧解码适配层
//!
//! The rendering environment (the "substrate") is event driven: it reports
//! readiness, seek completion and failures on a channel. `FrameDecoder`
//! turns that into two bounded async calls, `prepare` and
//! `seek_and_capture`.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::config::ExtractorConfig;
use super::error::{DecodeCause, DecodeError};
use super::frame::FrameBuffer;
use super::source::VideoSourceRef;

/// 底层报告的失败类型，对应媒体元素的四种错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Aborted,
    Network,
    Decode,
    SourceNotSupported,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeSignal {
    pub kind: SignalKind,
    pub message: String,
}

impl DecodeSignal {
    pub fn new(kind: SignalKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<DecodeSignal> for DecodeError {
    fn from(signal: DecodeSignal) -> Self {
        let cause = match signal.kind {
            SignalKind::Aborted => DecodeCause::Aborted,
            SignalKind::Network => DecodeCause::Network,
            SignalKind::Decode => DecodeCause::DecodeFailure,
            SignalKind::SourceNotSupported => DecodeCause::UnsupportedFormat,
        };
        DecodeError::new(cause, signal.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecoderEvent {
    DimensionsReady { width: u32, height: u32 },
    /// `f64::INFINITY` for unbounded streams.
    DurationKnown(f64),
    SeekCompleted { ticket: u64 },
    /// 某次 seek 自身的失败，带上该次 seek 的 ticket
    SeekFailed { ticket: u64, signal: DecodeSignal },
    /// Source-level failure, not tied to any seek.
    DecodeError(DecodeSignal),
}

/// The rendering environment a `FrameDecoder` drives.
///
/// Implementations report progress through the event sender given to
/// `load`. `seek` must eventually answer with `SeekCompleted` or
/// `SeekFailed` carrying the same ticket.
pub trait DecoderSubstrate: Send {
    fn load(&mut self, source: &VideoSourceRef, events: mpsc::UnboundedSender<DecoderEvent>);

    fn seek(&mut self, ticket: u64, timestamp_seconds: f64);

    /// Abandons the in-flight seek, if any. Nothing more may be reported
    /// for its ticket.
    fn cancel_seek(&mut self);

    /// Draws the current frame into the raster surface and reads it back.
    fn render(&mut self) -> Result<FrameBuffer, DecodeSignal>;

    /// Drops listeners and any in-flight work for the current source.
    fn detach(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    pub duration: f64,
}

impl VideoMetadata {
    pub fn has_finite_duration(&self) -> bool {
        self.duration.is_finite() && self.duration > 0.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecoderTiming {
    pub ready_timeout: Duration,
    pub seek_timeout: Duration,
    pub settle_delay: Duration,
}

impl DecoderTiming {
    pub fn from_config(config: &ExtractorConfig) -> Self {
        Self {
            ready_timeout: config.ready_timeout(),
            seek_timeout: config.seek_timeout(),
            settle_delay: config.settle_delay(),
        }
    }
}

impl Default for DecoderTiming {
    fn default() -> Self {
        Self::from_config(&ExtractorConfig::default())
    }
}

/// 单一共享的解码/光栅实例，调用方负责串行访问
pub struct FrameDecoder {
    substrate: Box<dyn DecoderSubstrate>,
    events: Option<mpsc::UnboundedReceiver<DecoderEvent>>,
    metadata: Option<VideoMetadata>,
    last_ticket: u64,
    timing: DecoderTiming,
}

impl FrameDecoder {
    pub fn new(substrate: Box<dyn DecoderSubstrate>, timing: DecoderTiming) -> Self {
        Self {
            substrate,
            events: None,
            metadata: None,
            last_ticket: 0,
            timing,
        }
    }

    pub fn metadata(&self) -> Option<VideoMetadata> {
        self.metadata
    }

    /// Loads `source` and waits, bounded by the readiness window, until both
    /// the native dimensions and the duration are known.
    pub async fn prepare(&mut self, source: &VideoSourceRef) -> Result<VideoMetadata, DecodeError> {
        self.release();

        let (tx, rx) = mpsc::unbounded_channel();
        self.substrate.load(source, tx);
        self.events = Some(rx);
        debug!("🎞️ loading {}", source);

        let ready_timeout = self.timing.ready_timeout;
        let outcome = tokio::time::timeout(ready_timeout, self.wait_until_ready()).await;
        let metadata = match outcome {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "⏱️ {} not ready within {}ms",
                    source,
                    ready_timeout.as_millis()
                );
                self.release();
                return Err(DecodeError::failure(format!(
                    "dimensions and duration not available within {}ms",
                    ready_timeout.as_millis()
                )));
            }
        };

        info!(
            "✅ {} ready: {}x{}, {:.2}s",
            source, metadata.width, metadata.height, metadata.duration
        );
        self.metadata = Some(metadata);
        Ok(metadata)
    }

    async fn wait_until_ready(&mut self) -> Result<VideoMetadata, DecodeError> {
        let Some(events) = self.events.as_mut() else {
            return Err(DecodeError::aborted("decoder detached while loading"));
        };

        let mut dimensions: Option<(u32, u32)> = None;
        let mut duration: Option<f64> = None;

        loop {
            match events.recv().await {
                Some(DecoderEvent::DimensionsReady { width, height }) => {
                    if width > 0 && height > 0 {
                        dimensions = Some((width, height));
                    } else {
                        debug!("ignoring empty dimensions {}x{}", width, height);
                    }
                }
                Some(DecoderEvent::DurationKnown(d)) => {
                    if !d.is_nan() {
                        duration = Some(d);
                    }
                }
                Some(DecoderEvent::DecodeError(signal)) => return Err(signal.into()),
                Some(DecoderEvent::SeekCompleted { ticket })
                | Some(DecoderEvent::SeekFailed { ticket, .. }) => {
                    debug!("discarding seek #{} outcome while loading", ticket);
                }
                None => return Err(DecodeError::aborted("decoder event stream closed while loading")),
            }

            if let (Some((width, height)), Some(duration)) = (dimensions, duration) {
                return Ok(VideoMetadata {
                    width,
                    height,
                    duration,
                });
            }
        }
    }

    /// Seeks, waits for the matching completion, lets the frame settle, then
    /// reads the rendered frame back.
    ///
    /// A seek that times out, or whose future is dropped before it answers,
    /// is cancelled on the substrate.
    pub async fn seek_and_capture(&mut self, timestamp_seconds: f64) -> Result<FrameBuffer, DecodeError> {
        if self.metadata.is_none() {
            return Err(DecodeError::failure("decoder has no prepared source"));
        }
        let Some(events) = self.events.as_mut() else {
            return Err(DecodeError::failure("decoder has no prepared source"));
        };

        self.last_ticket += 1;
        let ticket = self.last_ticket;
        let timing = self.timing;

        let mut guard = SeekGuard {
            substrate: &mut *self.substrate,
            ticket,
            in_flight: true,
        };
        guard.substrate.seek(ticket, timestamp_seconds);
        debug!("⏩ seek #{} to {:.2}s", ticket, timestamp_seconds);

        let outcome = tokio::time::timeout(timing.seek_timeout, Self::wait_for_seek(events, ticket)).await;
        match outcome {
            Ok(result) => {
                guard.in_flight = false;
                result?
            }
            Err(_) => {
                warn!(
                    "⏱️ seek #{} to {:.2}s did not complete within {}ms",
                    ticket,
                    timestamp_seconds,
                    timing.seek_timeout.as_millis()
                );
                return Err(DecodeError::failure(format!(
                    "seek to {:.2}s did not complete within {}ms",
                    timestamp_seconds,
                    timing.seek_timeout.as_millis()
                )));
            }
        }

        // seek 完成后首帧可能尚未渲染完整
        tokio::time::sleep(timing.settle_delay).await;

        let mut frame = guard.substrate.render().map_err(DecodeError::from)?;
        frame.timestamp = Duration::from_secs_f64(timestamp_seconds.max(0.0));
        Ok(frame)
    }

    async fn wait_for_seek(
        events: &mut mpsc::UnboundedReceiver<DecoderEvent>,
        ticket: u64,
    ) -> Result<(), DecodeError> {
        loop {
            match events.recv().await {
                Some(DecoderEvent::SeekCompleted { ticket: t }) if t == ticket => return Ok(()),
                Some(DecoderEvent::SeekFailed { ticket: t, signal }) if t == ticket => {
                    return Err(signal.into())
                }
                Some(DecoderEvent::SeekCompleted { ticket: t })
                | Some(DecoderEvent::SeekFailed { ticket: t, .. }) => {
                    debug!("discarding stale seek #{} outcome (waiting for #{})", t, ticket);
                }
                Some(DecoderEvent::DecodeError(signal)) => return Err(signal.into()),
                Some(other) => debug!("ignoring {:?} while seeking", other),
                None => return Err(DecodeError::aborted("decoder event stream closed while seeking")),
            }
        }
    }

    /// Detaches the current source; pending events are dropped with the
    /// receiver.
    pub fn release(&mut self) {
        if self.events.take().is_some() {
            debug!("🔌 detaching decoder listeners");
        }
        self.substrate.detach();
        self.metadata = None;
    }
}

/// 未完成的 seek 在超时或被丢弃时取消
struct SeekGuard<'a> {
    substrate: &'a mut (dyn DecoderSubstrate + 'static),
    ticket: u64,
    in_flight: bool,
}

impl Drop for SeekGuard<'_> {
    fn drop(&mut self) {
        if self.in_flight {
            debug!("✂️ cancelling seek #{}", self.ticket);
            self.substrate.cancel_seek();
        }
    }
}

impl Drop for FrameDecoder {
    fn drop(&mut self) {
        self.substrate.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::mock::{MockLoad, MockSubstrate};
    use std::sync::{Arc, Mutex};

    fn timing() -> DecoderTiming {
        DecoderTiming {
            ready_timeout: Duration::from_secs(10),
            seek_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_millis(200),
        }
    }

    fn source() -> VideoSourceRef {
        VideoSourceRef::parse("/tmp/cam.mp4")
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_reports_metadata() {
        let substrate = MockSubstrate::new().with_dimensions(1920, 1080).with_duration(30.0);
        let mut decoder = FrameDecoder::new(Box::new(substrate), timing());

        let meta = decoder.prepare(&source()).await.unwrap();
        assert_eq!((meta.width, meta.height), (1920, 1080));
        assert_eq!(meta.duration, 30.0);
        assert_eq!(decoder.metadata(), Some(meta));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_classifies_failure() {
        let substrate = MockSubstrate::new().with_load(MockLoad::Fail(SignalKind::SourceNotSupported));
        let mut decoder = FrameDecoder::new(Box::new(substrate), timing());

        let err = decoder.prepare(&source()).await.unwrap_err();
        assert_eq!(err.cause, DecodeCause::UnsupportedFormat);
        assert!(decoder.metadata().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_times_out_when_never_ready() {
        let substrate = MockSubstrate::new().with_load(MockLoad::Hang);
        let mut decoder = FrameDecoder::new(Box::new(substrate), timing());

        let started = tokio::time::Instant::now();
        let err = decoder.prepare(&source()).await.unwrap_err();
        assert_eq!(err.cause, DecodeCause::DecodeFailure);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_honors_settle_delay() {
        let substrate = MockSubstrate::new()
            .with_luma_at(2.0, 90)
            .with_seek_delay(Duration::from_millis(100));
        let mut decoder = FrameDecoder::new(Box::new(substrate), timing());
        decoder.prepare(&source()).await.unwrap();

        let started = tokio::time::Instant::now();
        let frame = decoder.seek_and_capture(2.0).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(frame.timestamp_seconds(), 2.0);
        assert_eq!(frame.data[0], 90);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_timeout_is_decode_failure() {
        let substrate = MockSubstrate::new().with_hanging_seek_at(5.0);
        let mut decoder = FrameDecoder::new(Box::new(substrate), timing());
        decoder.prepare(&source()).await.unwrap();

        let err = decoder.seek_and_capture(5.0).await.unwrap_err();
        assert_eq!(err.cause, DecodeCause::DecodeFailure);
        assert!(err.message.contains("did not complete"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_seek_does_not_poison_next_seek() {
        let substrate = MockSubstrate::new()
            .with_default_luma(80)
            .with_failing_seek_at(2.0)
            .with_seek_delay_at(2.0, Duration::from_secs(6));
        let counters = substrate.counters();
        let mut decoder = FrameDecoder::new(Box::new(substrate), timing());
        decoder.prepare(&source()).await.unwrap();

        let err = decoder.seek_and_capture(2.0).await.unwrap_err();
        assert!(err.message.contains("did not complete"));
        assert_eq!(counters.cancelled_seeks(), 1);

        // 被放弃的 seek 原本会在第 6 秒报错
        tokio::time::sleep(Duration::from_secs(2)).await;
        let frame = decoder.seek_and_capture(30.0).await.unwrap();
        assert_eq!(frame.timestamp_seconds(), 30.0);
        assert_eq!(frame.data[0], 80);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_capture_cancels_seek() {
        let substrate = MockSubstrate::new()
            .with_default_luma(80)
            .with_failing_seek_at(2.0)
            .with_seek_delay_at(2.0, Duration::from_secs(3));
        let counters = substrate.counters();
        let mut decoder = FrameDecoder::new(Box::new(substrate), timing());
        decoder.prepare(&source()).await.unwrap();

        let abandoned = tokio::time::timeout(Duration::from_secs(1), decoder.seek_and_capture(2.0)).await;
        assert!(abandoned.is_err());
        assert_eq!(counters.cancelled_seeks(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(decoder.seek_and_capture(5.0).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_failure_is_reported_for_its_own_ticket() {
        let substrate = MockSubstrate::new().with_failing_seek_at(10.0);
        let counters = substrate.counters();
        let mut decoder = FrameDecoder::new(Box::new(substrate), timing());
        decoder.prepare(&source()).await.unwrap();

        let err = decoder.seek_and_capture(10.0).await.unwrap_err();
        assert_eq!(err.cause, DecodeCause::DecodeFailure);
        assert_eq!(err.message, "scripted seek failure");
        assert_eq!(counters.cancelled_seeks(), 0);
    }

    #[tokio::test]
    async fn test_capture_without_prepare_fails() {
        let mut decoder = FrameDecoder::new(Box::new(MockSubstrate::new()), timing());
        assert!(decoder.seek_and_capture(2.0).await.is_err());
    }

    /// 先回一个过期 ticket 的完成事件，再回正确的
    struct LateEchoSubstrate {
        events: Option<mpsc::UnboundedSender<DecoderEvent>>,
        rendered: Arc<Mutex<u32>>,
    }

    impl DecoderSubstrate for LateEchoSubstrate {
        fn load(&mut self, _source: &VideoSourceRef, events: mpsc::UnboundedSender<DecoderEvent>) {
            let _ = events.send(DecoderEvent::DimensionsReady { width: 4, height: 4 });
            let _ = events.send(DecoderEvent::DurationKnown(20.0));
            self.events = Some(events);
        }

        fn seek(&mut self, ticket: u64, _timestamp_seconds: f64) {
            if let Some(events) = &self.events {
                let _ = events.send(DecoderEvent::SeekFailed {
                    ticket: ticket.saturating_sub(1),
                    signal: DecodeSignal::new(SignalKind::Decode, "left over from an abandoned seek"),
                });
                let _ = events.send(DecoderEvent::SeekCompleted { ticket: ticket + 100 });
                let _ = events.send(DecoderEvent::SeekCompleted { ticket: ticket.saturating_sub(1) });
                let _ = events.send(DecoderEvent::SeekCompleted { ticket });
            }
        }

        fn cancel_seek(&mut self) {}

        fn render(&mut self) -> Result<FrameBuffer, DecodeSignal> {
            *self.rendered.lock().unwrap() += 1;
            Ok(FrameBuffer::uniform(4, 4, [50, 50, 50], Duration::ZERO))
        }

        fn detach(&mut self) {
            self.events = None;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_seek_completions_are_discarded() {
        let rendered = Arc::new(Mutex::new(0));
        let substrate = LateEchoSubstrate {
            events: None,
            rendered: rendered.clone(),
        };
        let mut decoder = FrameDecoder::new(Box::new(substrate), timing());
        decoder.prepare(&source()).await.unwrap();

        decoder.seek_and_capture(2.0).await.unwrap();
        decoder.seek_and_capture(5.0).await.unwrap();
        assert_eq!(*rendered.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_clears_metadata() {
        let mut decoder = FrameDecoder::new(Box::new(MockSubstrate::new()), timing());
        decoder.prepare(&source()).await.unwrap();
        decoder.release();
        assert!(decoder.metadata().is_none());
        assert!(decoder.seek_and_capture(2.0).await.is_err());
    }
}

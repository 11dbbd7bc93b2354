//! 自动抽帧协调器
//!
//! Drives one session at a time through the candidate timestamps:
//! prepare, then seek/assess/upload per candidate, until an uploaded frame,
//! exhaustion, a decode error or the session deadline ends it. Every
//! outcome and progress callback is checked against the live session id
//! under the same lock that `start` takes, so nothing from a superseded
//! session reaches the listener.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::config::ExtractorConfig;
use super::decoder::{DecoderSubstrate, DecoderTiming, FrameDecoder};
use super::error::{ConfigError, DecodeError, ManualReason};
use super::manual::ManualCaptureController;
use super::source::VideoSourceRef;
use super::state_machine::{SessionAction, SessionEvent, SessionState};
use super::uploader::SnapshotUploader;
use super::validator::{FrameQuality, FrameQualityValidator};

/// 解码器在整个进程内只有一份，协调器与手动截帧串行使用
pub type SharedDecoder = Arc<tokio::sync::Mutex<FrameDecoder>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Pending,
    Black,
    UploadFailed,
    Accepted,
    CaptureFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionAttempt {
    pub index: usize,
    pub timestamp_seconds: f64,
    pub outcome: AttemptOutcome,
    pub average_luma: Option<f64>,
}

#[derive(Debug)]
pub struct ExtractionSession {
    pub id: SessionId,
    pub source: VideoSourceRef,
    pub attempts: Vec<ExtractionAttempt>,
    pub state: SessionState,
    pub started_at: Instant,
    pub deadline: Instant,
    plan: Vec<f64>,
}

impl ExtractionSession {
    fn new(id: SessionId, source: VideoSourceRef, deadline: Duration) -> Self {
        let started_at = Instant::now();
        Self {
            id,
            source,
            attempts: Vec::new(),
            state: SessionState::new(),
            started_at,
            deadline: started_at + deadline,
            plan: Vec::new(),
        }
    }

    fn apply(&mut self, event: SessionEvent) -> SessionAction {
        let (next, action) = self.state.transition(event);
        if next != self.state {
            debug!("🔀 session {}: {} -> {}", self.id, self.state.name(), next.name());
        }
        self.state = next;
        action
    }

    fn mark(&mut self, index: usize, outcome: AttemptOutcome) {
        if let Some(attempt) = self.attempts.iter_mut().find(|a| a.index == index) {
            attempt.outcome = outcome;
        }
    }

    fn into_report(self) -> SessionReport {
        SessionReport {
            id: self.id,
            source: self.source,
            attempts: self.attempts,
            state: self.state,
            elapsed: self.started_at.elapsed(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: SessionId,
    pub source: VideoSourceRef,
    pub attempts: Vec<ExtractionAttempt>,
    pub state: SessionState,
    pub elapsed: Duration,
}

impl SessionReport {
    pub fn accepted_url(&self) -> Option<&str> {
        match &self.state {
            SessionState::Succeeded { url } => Some(url),
            _ => None,
        }
    }

    pub fn manual_reason(&self) -> Option<ManualReason> {
        match &self.state {
            SessionState::ManualFallback { reason } => Some(reason.clone()),
            SessionState::Error { message } => Some(ManualReason::Fault(message.clone())),
            _ => None,
        }
    }

    pub fn outcomes(&self) -> Vec<AttemptOutcome> {
        self.attempts.iter().map(|a| a.outcome).collect()
    }
}

/// UI 层回调。回调在协调器内部锁中执行，不要在回调里同步地开始新会话。
pub trait ExtractionListener: Send + Sync {
    fn on_accepted(&self, session: SessionId, url: &str);

    fn on_manual_mode_required(&self, session: SessionId, reason: &ManualReason);

    fn on_upload_progress(&self, _session: SessionId, _fraction: f32) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionEvent {
    Accepted { session: SessionId, url: String },
    ManualModeRequired { session: SessionId, reason: ManualReason },
    UploadProgress { session: SessionId, fraction: f32 },
}

/// Forwards callbacks into a channel for hosts that prefer to poll.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ExtractionEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExtractionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ExtractionListener for ChannelListener {
    fn on_accepted(&self, session: SessionId, url: &str) {
        let _ = self.tx.send(ExtractionEvent::Accepted {
            session,
            url: url.to_string(),
        });
    }

    fn on_manual_mode_required(&self, session: SessionId, reason: &ManualReason) {
        let _ = self.tx.send(ExtractionEvent::ManualModeRequired {
            session,
            reason: reason.clone(),
        });
    }

    fn on_upload_progress(&self, session: SessionId, fraction: f32) {
        let _ = self.tx.send(ExtractionEvent::UploadProgress { session, fraction });
    }
}

/// 根据视频时长筛选候选时间点
///
/// Candidates at or past the end are dropped; a clip shorter than every
/// candidate is sampled once at its midpoint. Unknown or unbounded
/// durations keep the full list.
pub fn plan_candidates(candidates: &[f64], duration: f64) -> Vec<f64> {
    if !(duration.is_finite() && duration > 0.0) {
        return candidates.to_vec();
    }
    let plan: Vec<f64> = candidates.iter().copied().filter(|t| *t < duration).collect();
    if plan.is_empty() {
        vec![duration / 2.0]
    } else {
        plan
    }
}

pub struct SessionHandle {
    id: SessionId,
    outcome: oneshot::Receiver<SessionReport>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// `None` when the session was superseded or torn down before finishing.
    pub async fn wait(self) -> Option<SessionReport> {
        self.outcome.await.ok()
    }
}

/// 会话代际：当前会话，以及最近一次已上报结果的会话
#[derive(Debug, Default)]
pub struct SessionGate {
    current: AtomicU64,
    settled: AtomicU64,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, session: SessionId) {
        self.current.store(session.0, Ordering::SeqCst);
    }

    pub fn settle(&self, session: SessionId) {
        self.settled.store(session.0, Ordering::SeqCst);
    }

    pub fn is_current(&self, session: SessionId) -> bool {
        self.current.load(Ordering::SeqCst) == session.0
    }

    /// `session` is live and has already reported its outcome.
    pub fn is_settled(&self, session: SessionId) -> bool {
        self.is_current(session) && self.settled.load(Ordering::SeqCst) == session.0
    }
}

struct LiveSlot {
    id: SessionId,
    // 保持临时文件存活，直到被新会话替换
    source: Option<VideoSourceRef>,
    task: Option<JoinHandle<()>>,
    reported: bool,
}

struct CoordinatorInner {
    decoder: SharedDecoder,
    validator: FrameQualityValidator,
    uploader: Arc<dyn SnapshotUploader>,
    listener: Arc<dyn ExtractionListener>,
    config: ExtractorConfig,
    gate: Arc<SessionGate>,
    live: Mutex<LiveSlot>,
}

pub struct ExtractionCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl ExtractionCoordinator {
    pub fn new(
        config: ExtractorConfig,
        substrate: Box<dyn DecoderSubstrate>,
        uploader: Arc<dyn SnapshotUploader>,
        listener: Arc<dyn ExtractionListener>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let decoder = FrameDecoder::new(substrate, DecoderTiming::from_config(&config));
        let validator =
            FrameQualityValidator::with_params(config.black_luma_threshold, config.sample_ratio);

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                decoder: Arc::new(tokio::sync::Mutex::new(decoder)),
                validator,
                uploader,
                listener,
                config,
                gate: Arc::new(SessionGate::new()),
                live: Mutex::new(LiveSlot {
                    id: SessionId(0),
                    source: None,
                    task: None,
                    reported: true,
                }),
            }),
        })
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.inner.config
    }

    /// Starts a session for `source`, cancelling whatever session was live.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, source: VideoSourceRef) -> SessionHandle {
        let (tx, rx) = oneshot::channel();
        let mut live = self.inner.live.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(task) = live.task.take() {
            task.abort();
            if !live.reported {
                info!("⏹️ session {} superseded", live.id);
            }
        }

        let id = SessionId(live.id.0 + 1);
        live.id = id;
        live.reported = false;
        live.source = Some(source.clone());
        self.inner.gate.begin(id);

        let inner = self.inner.clone();
        live.task = Some(tokio::spawn(async move {
            if let Some(report) = inner.run_session(id, source).await {
                let _ = tx.send(report);
            }
        }));

        SessionHandle { id, outcome: rx }
    }

    /// Tears down the live session, if any. Nothing it does afterwards
    /// reaches the listener, and the decoder is detached once the session
    /// task lets go of it.
    pub fn cancel(&self) {
        let mut live = self.inner.live.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = live.task.take() {
            task.abort();
            if !live.reported {
                info!("⏹️ session {} cancelled", live.id);
            }
        }
        live.id = SessionId(live.id.0 + 1);
        live.reported = true;
        live.source = None;
        let cancelled = live.id;
        self.inner.gate.begin(cancelled);
        drop(live);

        self.inner.release_decoder(cancelled);
    }

    pub fn current_session(&self) -> Option<SessionId> {
        let live = self.inner.live.lock().unwrap_or_else(PoisonError::into_inner);
        live.source.as_ref().map(|_| live.id)
    }

    pub fn is_current(&self, session: SessionId) -> bool {
        self.inner.is_current(session)
    }

    /// 手动截帧控制器，绑定到指定会话；会话上报结果之前不可用
    pub fn manual_controller(&self, session: SessionId) -> ManualCaptureController {
        ManualCaptureController::new(
            session,
            self.inner.decoder.clone(),
            self.inner.validator.clone(),
            self.inner.uploader.clone(),
            &self.inner.config,
            self.inner.gate.clone(),
        )
    }
}

impl Drop for ExtractionCoordinator {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl CoordinatorInner {
    fn is_current(&self, session: SessionId) -> bool {
        self.gate.is_current(session)
    }

    /// 被中止的会话任务可能仍持有解码器锁，等它释放后再 detach
    fn release_decoder(&self, cancelled: SessionId) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let decoder = self.decoder.clone();
                let gate = self.gate.clone();
                runtime.spawn(async move {
                    let mut decoder = decoder.lock().await;
                    if gate.is_current(cancelled) {
                        decoder.release();
                    } else {
                        debug!("decoder already owned by a newer session");
                    }
                });
            }
            Err(_) => {
                if let Ok(mut decoder) = self.decoder.try_lock() {
                    decoder.release();
                }
            }
        }
    }

    async fn run_session(&self, id: SessionId, source: VideoSourceRef) -> Option<SessionReport> {
        let deadline = self.config.session_deadline();
        let mut session = ExtractionSession::new(id, source, deadline);
        info!("🎬 session {} started for {}", id, session.source);

        let driven = tokio::time::timeout(deadline, self.drive(&mut session)).await;
        if driven.is_err() {
            warn!("⏱️ session {} hit its {}ms deadline", id, deadline.as_millis());
            session.apply(SessionEvent::DeadlineExpired);
        }

        if !self.report(&session) {
            return None;
        }
        Some(session.into_report())
    }

    async fn drive(&self, session: &mut ExtractionSession) {
        let mut action = session.apply(SessionEvent::Start);
        loop {
            let event = match action {
                SessionAction::Prepare => self.prepare(session).await,
                SessionAction::Capture { index } => self.attempt(session, index).await,
                SessionAction::Finish | SessionAction::Ignore => return,
            };

            if !self.is_current(session.id) {
                debug!("👻 session {} is stale, dropping {:?}", session.id, event);
                return;
            }
            action = session.apply(event);
        }
    }

    async fn prepare(&self, session: &mut ExtractionSession) -> SessionEvent {
        let mut decoder = self.decoder.lock().await;
        match decoder.prepare(&session.source).await {
            Ok(metadata) => {
                session.plan = plan_candidates(&self.config.candidate_timestamps, metadata.duration);
                debug!("📋 session {} candidates: {:?}", session.id, session.plan);
                SessionEvent::Prepared {
                    candidates: session.plan.len(),
                }
            }
            Err(err) => {
                warn!("❌ session {} could not load source: {}", session.id, err);
                SessionEvent::PrepareFailed(err)
            }
        }
    }

    async fn attempt(&self, session: &mut ExtractionSession, index: usize) -> SessionEvent {
        let Some(&timestamp) = session.plan.get(index) else {
            return SessionEvent::CaptureFailed(DecodeError::failure(format!(
                "no candidate at index {}",
                index
            )));
        };
        session.attempts.push(ExtractionAttempt {
            index,
            timestamp_seconds: timestamp,
            outcome: AttemptOutcome::Pending,
            average_luma: None,
        });

        let captured = {
            let mut decoder = self.decoder.lock().await;
            decoder.seek_and_capture(timestamp).await
        };
        let frame = match captured {
            Ok(frame) => frame,
            Err(err) => {
                warn!("❌ session {} capture at {:.2}s failed: {}", session.id, timestamp, err);
                session.mark(index, AttemptOutcome::CaptureFailed);
                return SessionEvent::CaptureFailed(err);
            }
        };

        let luma = self.validator.average_luma(&frame);
        if let Some(attempt) = session.attempts.last_mut() {
            attempt.average_luma = luma;
        }
        if self.validator.assess(&frame) == FrameQuality::Black {
            debug!(
                "⬛ session {} frame at {:.2}s is black (luma {:?})",
                session.id, timestamp, luma
            );
            session.mark(index, AttemptOutcome::Black);
            return SessionEvent::FrameBlack;
        }

        // 已被替换的会话不再上传
        if !self.is_current(session.id) {
            return SessionEvent::UploadFailed;
        }

        let encoded = match frame.encode_jpeg(self.config.jpeg_quality) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!("⚠️ session {} could not encode frame at {:.2}s: {}", session.id, timestamp, err);
                session.mark(index, AttemptOutcome::UploadFailed);
                return SessionEvent::UploadFailed;
            }
        };

        let id = session.id;
        let progress = |fraction: f32| self.emit_progress(id, fraction);
        match self.uploader.upload(&encoded, &progress).await {
            Ok(result) => {
                session.mark(index, AttemptOutcome::Accepted);
                SessionEvent::Uploaded { url: result.url }
            }
            Err(err) => {
                warn!(
                    "⚠️ session {} upload of frame at {:.2}s failed, moving on: {}",
                    id, timestamp, err
                );
                session.mark(index, AttemptOutcome::UploadFailed);
                SessionEvent::UploadFailed
            }
        }
    }

    fn emit_progress(&self, session: SessionId, fraction: f32) {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if live.id == session && !live.reported {
            self.listener.on_upload_progress(session, fraction);
        }
    }

    /// Fires the terminal callback once, and only for the live session.
    fn report(&self, session: &ExtractionSession) -> bool {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if live.id != session.id || live.reported {
            debug!("👻 discarding outcome of stale session {}", session.id);
            return false;
        }
        live.reported = true;

        let id = session.id;
        self.gate.settle(id);
        match &session.state {
            SessionState::Succeeded { url } => {
                info!("🖼️ session {} accepted snapshot {}", id, url);
                self.listener.on_accepted(id, url);
            }
            SessionState::ManualFallback { reason } => {
                warn!("✋ session {} needs manual capture: {}", id, reason);
                self.listener.on_manual_mode_required(id, reason);
            }
            SessionState::Error { message } => {
                error!("❌ session {} failed: {}", id, message);
                self.listener
                    .on_manual_mode_required(id, &ManualReason::Fault(message.clone()));
            }
            other => {
                error!("❌ session {} stopped while {}", id, other.name());
                self.listener.on_manual_mode_required(
                    id,
                    &ManualReason::Fault(format!("stopped while {}", other.name())),
                );
            }
        }
        true
    }
}

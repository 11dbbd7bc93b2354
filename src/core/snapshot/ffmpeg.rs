//! 基于 ffprobe / ffmpeg 命令行的解码底层

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::decoder::{DecodeSignal, DecoderEvent, DecoderSubstrate, SignalKind};
use super::frame::FrameBuffer;
use super::source::VideoSourceRef;

static NETWORK_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)connection (refused|reset|timed out)|network is unreachable|server returned [45]\d\d|failed to resolve|name or service not known|end of file while|i/o error|tls|handshake",
    )
    .expect("valid regex")
});

static FORMAT_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)invalid data found|unknown format|could not find codec|decoder \S+ not found|unsupported codec|not supported|moov atom not found|no such file|does not contain any stream|protocol not found",
    )
    .expect("valid regex")
});

/// 根据 stderr 文本归类失败原因
pub fn classify_stderr(stderr: &str) -> SignalKind {
    if FORMAT_ERROR.is_match(stderr) {
        SignalKind::SourceNotSupported
    } else if NETWORK_ERROR.is_match(stderr) {
        SignalKind::Network
    } else {
        SignalKind::Decode
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
}

/// 解析 ffprobe JSON，得到宽、高与时长；没有时长的直播流记为无穷大
fn parse_probe(json: &[u8]) -> Result<(u32, u32, f64), DecodeSignal> {
    let probe: ProbeOutput = serde_json::from_slice(json)
        .map_err(|e| DecodeSignal::new(SignalKind::Decode, format!("unreadable ffprobe output: {}", e)))?;

    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .ok_or_else(|| DecodeSignal::new(SignalKind::SourceNotSupported, "no video stream found"))?;

    let width = stream.width.unwrap_or(0);
    let height = stream.height.unwrap_or(0);
    if width == 0 || height == 0 {
        return Err(DecodeSignal::new(
            SignalKind::SourceNotSupported,
            "video stream has no dimensions",
        ));
    }

    let duration = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or(stream.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .unwrap_or(f64::INFINITY);

    Ok((width, height, duration))
}

fn failure_signal(stderr: &[u8], status: std::process::ExitStatus) -> DecodeSignal {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if status.code().is_none() {
        return DecodeSignal::new(SignalKind::Aborted, "decoder process was terminated");
    }
    let message = if text.is_empty() {
        format!("exited with {}", status)
    } else {
        text.lines().last().unwrap_or(text).to_string()
    };
    DecodeSignal::new(classify_stderr(text), message)
}

pub struct FfmpegSubstrate {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    input: Option<String>,
    events: Option<mpsc::UnboundedSender<DecoderEvent>>,
    surface: Arc<Mutex<Option<FrameBuffer>>>,
    load_task: Option<JoinHandle<()>>,
    seek_task: Option<JoinHandle<()>>,
}

impl FfmpegSubstrate {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            input: None,
            events: None,
            surface: Arc::new(Mutex::new(None)),
            load_task: None,
            seek_task: None,
        }
    }

    /// 在 PATH 中查找 ffmpeg 与 ffprobe
    pub fn locate() -> Result<Self, which::Error> {
        let ffmpeg = which::which("ffmpeg")?;
        let ffprobe = which::which("ffprobe")?;
        info!("🔧 using {} / {}", ffmpeg.display(), ffprobe.display());
        Ok(Self::new(ffmpeg, ffprobe))
    }

    async fn probe(ffprobe: PathBuf, input: String) -> Result<(u32, u32, f64), DecodeSignal> {
        let output = Command::new(&ffprobe)
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(&input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DecodeSignal::new(SignalKind::Decode, format!("failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(failure_signal(&output.stderr, output.status));
        }
        parse_probe(&output.stdout)
    }

    async fn grab_frame(ffmpeg: PathBuf, input: String, timestamp: f64) -> Result<FrameBuffer, DecodeSignal> {
        let position = format!("{:.3}", timestamp.max(0.0));
        let output = Command::new(&ffmpeg)
            .args(["-v", "error", "-ss", position.as_str(), "-i"])
            .arg(&input)
            .args(["-frames:v", "1", "-f", "image2pipe", "-c:v", "png", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DecodeSignal::new(SignalKind::Decode, format!("failed to run ffmpeg: {}", e)))?;

        if !output.status.success() {
            return Err(failure_signal(&output.stderr, output.status));
        }
        if output.stdout.is_empty() {
            return Err(DecodeSignal::new(
                SignalKind::Decode,
                format!("no frame decoded at {:.2}s", timestamp),
            ));
        }

        let image = image::load_from_memory_with_format(&output.stdout, image::ImageFormat::Png)
            .map_err(|e| DecodeSignal::new(SignalKind::Decode, format!("unreadable frame: {}", e)))?;
        Ok(FrameBuffer::from_rgba_image(
            image.to_rgba8(),
            Duration::from_secs_f64(timestamp.max(0.0)),
        ))
    }
}

impl DecoderSubstrate for FfmpegSubstrate {
    fn load(&mut self, source: &VideoSourceRef, events: mpsc::UnboundedSender<DecoderEvent>) {
        self.detach();

        let input = source.locator();
        self.input = Some(input.clone());
        self.events = Some(events.clone());

        let ffprobe = self.ffprobe.clone();
        self.load_task = Some(tokio::spawn(async move {
            match Self::probe(ffprobe, input.clone()).await {
                Ok((width, height, duration)) => {
                    debug!("🔍 probed {}: {}x{} {:.2}s", input, width, height, duration);
                    let _ = events.send(DecoderEvent::DimensionsReady { width, height });
                    let _ = events.send(DecoderEvent::DurationKnown(duration));
                }
                Err(signal) => {
                    error!("❌ probe failed for {}: {}", input, signal.message);
                    let _ = events.send(DecoderEvent::DecodeError(signal));
                }
            }
        }));
    }

    fn seek(&mut self, ticket: u64, timestamp_seconds: f64) {
        if let Some(task) = self.seek_task.take() {
            task.abort();
        }
        let (Some(input), Some(events)) = (self.input.clone(), self.events.clone()) else {
            return;
        };

        let ffmpeg = self.ffmpeg.clone();
        let surface = self.surface.clone();
        self.seek_task = Some(tokio::spawn(async move {
            match Self::grab_frame(ffmpeg, input, timestamp_seconds).await {
                Ok(frame) => {
                    if let Ok(mut slot) = surface.lock() {
                        *slot = Some(frame);
                    }
                    let _ = events.send(DecoderEvent::SeekCompleted { ticket });
                }
                Err(signal) => {
                    let _ = events.send(DecoderEvent::SeekFailed { ticket, signal });
                }
            }
        }));
    }

    fn cancel_seek(&mut self) {
        // 丢弃任务即丢弃子进程，kill_on_drop 负责结束 ffmpeg
        if let Some(task) = self.seek_task.take() {
            task.abort();
        }
    }

    fn render(&mut self) -> Result<FrameBuffer, DecodeSignal> {
        let slot = self
            .surface
            .lock()
            .map_err(|_| DecodeSignal::new(SignalKind::Decode, "raster surface poisoned"))?;
        slot.clone()
            .ok_or_else(|| DecodeSignal::new(SignalKind::Decode, "no frame rendered yet"))
    }

    fn detach(&mut self) {
        if let Some(task) = self.load_task.take() {
            task.abort();
        }
        if let Some(task) = self.seek_task.take() {
            task.abort();
        }
        self.events = None;
        self.input = None;
        if let Ok(mut slot) = self.surface.lock() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_stderr() {
        assert_eq!(
            classify_stderr("cam.avi: Invalid data found when processing input"),
            SignalKind::SourceNotSupported
        );
        assert_eq!(
            classify_stderr("[tcp @ 0x1] Connection refused"),
            SignalKind::Network
        );
        assert_eq!(
            classify_stderr("Server returned 404 Not Found"),
            SignalKind::Network
        );
        assert_eq!(
            classify_stderr("error while decoding MB 12 7"),
            SignalKind::Decode
        );
    }

    #[test]
    fn test_parse_probe() {
        let json = br#"{
            "streams": [
                { "codec_type": "audio" },
                { "codec_type": "video", "width": 1920, "height": 1080 }
            ],
            "format": { "duration": "42.5" }
        }"#;
        assert_eq!(parse_probe(json).unwrap(), (1920, 1080, 42.5));
    }

    #[test]
    fn test_parse_probe_live_stream_has_infinite_duration() {
        let json = br#"{ "streams": [ { "codec_type": "video", "width": 640, "height": 480 } ], "format": {} }"#;
        let (_, _, duration) = parse_probe(json).unwrap();
        assert!(duration.is_infinite());
    }

    #[test]
    fn test_parse_probe_without_video_is_unsupported() {
        let json = br#"{ "streams": [ { "codec_type": "audio" } ] }"#;
        let signal = parse_probe(json).unwrap_err();
        assert_eq!(signal.kind, SignalKind::SourceNotSupported);
    }

    #[test]
    fn test_render_before_seek_fails() {
        let mut substrate = FfmpegSubstrate::new("ffmpeg", "ffprobe");
        assert!(substrate.render().is_err());
    }
}

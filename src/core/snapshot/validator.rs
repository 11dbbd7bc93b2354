use super::frame::FrameBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameQuality {
    Acceptable,
    Black,
}

/// 黑帧检测：按步长抽样像素，计算平均亮度
///
/// luma = 0.299·R + 0.587·G + 0.114·B, kept in integer thousandths so the
/// threshold comparison is exact.
#[derive(Debug, Clone)]
pub struct FrameQualityValidator {
    threshold: u8,
    stride: usize,
}

impl FrameQualityValidator {
    pub fn new() -> Self {
        Self::with_params(15, 0.1)
    }

    pub fn with_params(threshold: u8, sample_ratio: f32) -> Self {
        let stride = if sample_ratio > 0.0 && sample_ratio <= 1.0 {
            (1.0 / sample_ratio).round().max(1.0) as usize
        } else {
            1
        };
        Self { threshold, stride }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn assess(&self, frame: &FrameBuffer) -> FrameQuality {
        match self.sampled_luma_milli(frame) {
            Some((sum, samples)) if sum >= self.threshold as u64 * 1000 * samples => {
                FrameQuality::Acceptable
            }
            _ => FrameQuality::Black,
        }
    }

    /// 平均亮度（0-255），不可读的帧返回 None
    pub fn average_luma(&self, frame: &FrameBuffer) -> Option<f64> {
        self.sampled_luma_milli(frame)
            .map(|(sum, samples)| sum as f64 / (samples as f64 * 1000.0))
    }

    fn sampled_luma_milli(&self, frame: &FrameBuffer) -> Option<(u64, u64)> {
        if !frame.is_readable() {
            return None;
        }

        let mut sum = 0u64;
        let mut samples = 0u64;
        for rgba in frame.data.chunks_exact(4).step_by(self.stride) {
            sum += rgba[0] as u64 * 299 + rgba[1] as u64 * 587 + rgba[2] as u64 * 114;
            samples += 1;
        }

        if samples == 0 {
            None
        } else {
            Some((sum, samples))
        }
    }
}

impl Default for FrameQualityValidator {
    fn default() -> Self {
        Self::new()
    }
}

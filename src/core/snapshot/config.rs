use std::time::Duration;

use serde::Deserialize;

use super::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// 候选时间点（秒），严格递增
    pub candidate_timestamps: Vec<f64>,
    pub session_deadline_ms: u64,
    /// 等待尺寸与时长就绪的窗口
    pub ready_timeout_ms: u64,
    pub seek_timeout_ms: u64,
    /// seek 完成后采样前的等待
    pub settle_delay_ms: u64,
    pub black_luma_threshold: u8,
    /// 亮度采样比例，0.1 即每 10 个像素取 1 个
    pub sample_ratio: f32,
    pub jpeg_quality: u8,
    pub preview_max_width: u32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            candidate_timestamps: vec![2.0, 5.0, 10.0, 15.0],
            session_deadline_ms: 15_000,
            ready_timeout_ms: 10_000,
            seek_timeout_ms: 5_000,
            settle_delay_ms: 200,
            black_luma_threshold: 15,
            sample_ratio: 0.1,
            jpeg_quality: 85,
            preview_max_width: 640,
        }
    }
}

impl ExtractorConfig {
    pub fn for_remote_stream() -> Self {
        Self {
            ready_timeout_ms: 12_000,
            settle_delay_ms: 300,
            ..Self::default()
        }
    }

    pub fn for_local_file() -> Self {
        Self {
            ready_timeout_ms: 4_000,
            settle_delay_ms: 150,
            ..Self::default()
        }
    }

    /// Parses a JSON5 document; missing keys keep their defaults.
    ///
    /// ```ignore
    /// let config = ExtractorConfig::from_json5("{ candidate_timestamps: [1, 3], // short clips\n }")?;
    /// ```
    pub fn from_json5(text: &str) -> Result<Self, ConfigError> {
        let config: ExtractorConfig =
            json5::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.candidate_timestamps.is_empty() {
            return Err(ConfigError::Invalid(
                "candidate_timestamps must not be empty".into(),
            ));
        }
        if self
            .candidate_timestamps
            .iter()
            .any(|t| !t.is_finite() || *t < 0.0)
        {
            return Err(ConfigError::Invalid(
                "candidate timestamps must be finite and non-negative".into(),
            ));
        }
        if self.candidate_timestamps.windows(2).any(|w| w[1] <= w[0]) {
            return Err(ConfigError::Invalid(
                "candidate timestamps must be strictly increasing".into(),
            ));
        }
        for (name, value) in [
            ("session_deadline_ms", self.session_deadline_ms),
            ("ready_timeout_ms", self.ready_timeout_ms),
            ("seek_timeout_ms", self.seek_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if self.settle_delay_ms > 1_000 {
            return Err(ConfigError::Invalid(format!(
                "settle_delay_ms {} exceeds 1000",
                self.settle_delay_ms
            )));
        }
        if !(self.sample_ratio > 0.0 && self.sample_ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "sample_ratio {} must be in (0, 1]",
                self.sample_ratio
            )));
        }
        Ok(())
    }

    pub fn session_deadline(&self) -> Duration {
        Duration::from_millis(self.session_deadline_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn seek_timeout(&self) -> Duration {
        Duration::from_millis(self.seek_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExtractorConfig::default();
        assert_eq!(config.candidate_timestamps, vec![2.0, 5.0, 10.0, 15.0]);
        assert_eq!(config.session_deadline(), Duration::from_secs(15));
        assert_eq!(config.seek_timeout(), Duration::from_secs(5));
        assert_eq!(config.black_luma_threshold, 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json5_partial_override() {
        let text = r#"{
            // 短视频只取前两个点
            candidate_timestamps: [1, 3],
            settle_delay_ms: 250,
        }"#;
        let config = ExtractorConfig::from_json5(text).unwrap();
        assert_eq!(config.candidate_timestamps, vec![1.0, 3.0]);
        assert_eq!(config.settle_delay_ms, 250);
        assert_eq!(config.seek_timeout_ms, 5_000);
    }

    #[test]
    fn test_rejects_non_increasing_candidates() {
        let config = ExtractorConfig {
            candidate_timestamps: vec![2.0, 2.0, 5.0],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_bad_sample_ratio() {
        let config = ExtractorConfig {
            sample_ratio: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        let seek = ExtractorConfig {
            seek_timeout_ms: 0,
            ..Default::default()
        };
        match seek.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("seek_timeout_ms")),
            other => panic!("unexpected result {:?}", other),
        }

        let ready = ExtractorConfig {
            ready_timeout_ms: 0,
            ..Default::default()
        };
        match ready.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("ready_timeout_ms")),
            other => panic!("unexpected result {:?}", other),
        }

        assert!(matches!(
            ExtractorConfig::from_json5("{ seek_timeout_ms: 0 }"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_parse_error_is_reported() {
        assert!(matches!(
            ExtractorConfig::from_json5("{ candidate_timestamps: [1, "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_presets_validate() {
        assert!(ExtractorConfig::for_remote_stream().validate().is_ok());
        assert!(ExtractorConfig::for_local_file().validate().is_ok());
    }
}

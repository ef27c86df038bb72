use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::VocanaError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub profile: ProfileConfig,
    pub stream: StreamConfig,
    pub features: FeatureConfig,
    pub inference: InferenceConfig,
    pub buffer: BufferConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub name: String,
    pub description: String,
}

/// Analysis/synthesis window shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    #[default]
    Hann,
    Vorbis,
    SqrtHann,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub fft_size: usize,
    pub hop_size: usize,
    #[serde(default)]
    pub window: WindowKind,
    /// Window-sum entries below this are treated as degenerate and normalized to 1.0
    pub cola_epsilon: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub erb_band_count: usize,
    /// Number of low frequency bins covered by the deep filter and spectral features
    pub df_bins: usize,
    pub norm_alpha: f32,
    pub variance_floor: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LsnrConfig {
    pub min_db: f32,
    pub max_db_erb: f32,
    pub max_db_df: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub filter_order: usize,
    pub embedding_dim: usize,
    /// Hidden state widths per stage; 0 means the stage is stateless
    pub encoder_hidden: usize,
    pub erb_hidden: usize,
    pub df_hidden: usize,
    pub timeout_ms: u64,
    pub lsnr: LsnrConfig,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    pub max_buffer_samples: usize,
    pub overflow_threshold: u32,
    pub circuit_breaker_cooldown_ms: u64,
    pub crossfade_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub input_queue_batches: usize,
    pub output_queue_batches: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            input_queue_batches: 8,
            output_queue_batches: 8,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::balanced()
    }
}

impl Config {
    pub fn load(profile_name: &str) -> Result<Self> {
        let mut config = match profile_name {
            "balanced" => Self::balanced(),
            "low_latency" => Self::low_latency(),
            "robust" => Self::robust(),
            _ => {
                let config_path = Self::config_path(profile_name)?;
                Self::from_file(&config_path)?
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config TOML in {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    fn apply_env_overrides(&mut self) {
        if let Some(rate) = env_parse::<u32>("VOCANA_SAMPLE_RATE") {
            self.stream.sample_rate = rate;
        }
        if let Some(fft) = env_parse::<usize>("VOCANA_FFT_SIZE") {
            self.stream.fft_size = fft;
        }
        if let Some(hop) = env_parse::<usize>("VOCANA_HOP_SIZE") {
            self.stream.hop_size = hop;
        }
        if let Some(timeout) = env_parse::<u64>("VOCANA_INFERENCE_TIMEOUT_MS") {
            self.inference.timeout_ms = timeout;
        }
        if let Some(max) = env_parse::<usize>("VOCANA_MAX_BUFFER_SAMPLES") {
            self.buffer.max_buffer_samples = max;
        }
    }

    pub fn with_overrides(
        mut self,
        sample_rate: Option<u32>,
        hop_size: Option<usize>,
        timeout_ms: Option<u64>,
    ) -> Self {
        if let Some(rate) = sample_rate {
            self.stream.sample_rate = rate;
        }
        if let Some(hop) = hop_size {
            self.stream.hop_size = hop;
        }
        if let Some(timeout) = timeout_ms {
            self.inference.timeout_ms = timeout;
        }
        self
    }

    /// Number of one-sided spectrum bins
    pub fn freq_bins(&self) -> usize {
        self.stream.fft_size / 2 + 1
    }

    /// Reject configurations that would fail mid-stream
    pub fn validate(&self) -> std::result::Result<(), VocanaError> {
        let s = &self.stream;
        if s.sample_rate == 0 {
            return Err(VocanaError::config("sample_rate", s.sample_rate, "must be positive"));
        }
        if s.fft_size == 0 || s.fft_size % 2 != 0 {
            return Err(VocanaError::config("fft_size", s.fft_size, "must be positive and even"));
        }
        if s.hop_size == 0 || s.hop_size > s.fft_size {
            return Err(VocanaError::config(
                "hop_size",
                s.hop_size,
                "must be in 1..=fft_size",
            ));
        }
        if !(s.cola_epsilon > 0.0 && s.cola_epsilon.is_finite()) {
            return Err(VocanaError::config("cola_epsilon", s.cola_epsilon, "must be positive"));
        }

        let bins = self.freq_bins();
        let f = &self.features;
        if f.erb_band_count == 0 || f.erb_band_count > bins {
            return Err(VocanaError::config(
                "erb_band_count",
                f.erb_band_count,
                &format!("must be in 1..={}", bins),
            ));
        }
        if f.df_bins > bins {
            return Err(VocanaError::config(
                "df_bins",
                f.df_bins,
                &format!("must not exceed {} bins", bins),
            ));
        }
        if !(f.norm_alpha > 0.0 && f.norm_alpha < 1.0) {
            return Err(VocanaError::config("norm_alpha", f.norm_alpha, "must be in (0, 1)"));
        }
        if !(f.variance_floor > 0.0 && f.variance_floor.is_finite()) {
            return Err(VocanaError::config(
                "variance_floor",
                f.variance_floor,
                "must be positive",
            ));
        }

        let i = &self.inference;
        if i.filter_order == 0 {
            return Err(VocanaError::config("filter_order", i.filter_order, "must be positive"));
        }
        if i.queue_depth == 0 {
            return Err(VocanaError::config("queue_depth", i.queue_depth, "must be positive"));
        }
        if i.timeout_ms == 0 {
            return Err(VocanaError::config("timeout_ms", i.timeout_ms, "must be positive"));
        }

        let b = &self.buffer;
        if b.max_buffer_samples < s.hop_size {
            return Err(VocanaError::config(
                "max_buffer_samples",
                b.max_buffer_samples,
                "must hold at least one hop",
            ));
        }
        if b.overflow_threshold == 0 {
            return Err(VocanaError::config(
                "overflow_threshold",
                b.overflow_threshold,
                "must be positive",
            ));
        }

        let w = &self.worker;
        if w.input_queue_batches == 0 || w.output_queue_batches == 0 {
            return Err(VocanaError::config(
                "worker",
                format!("{}/{}", w.input_queue_batches, w.output_queue_batches),
                "queue depths must be positive",
            ));
        }

        Ok(())
    }

    fn config_path(profile_name: &str) -> Result<PathBuf> {
        let mut path = dirs::config_dir().context("Failed to get config directory")?;
        path.push("vocana");
        path.push(format!("{}.toml", profile_name));
        Ok(path)
    }

    pub fn balanced() -> Self {
        Self {
            profile: ProfileConfig {
                name: "Balanced".to_string(),
                description: "48kHz, 960-point FFT, 10ms hop".to_string(),
            },
            stream: StreamConfig {
                sample_rate: 48000,
                fft_size: 960,
                hop_size: 480,
                window: WindowKind::Hann,
                cola_epsilon: 1e-8,
            },
            features: FeatureConfig {
                erb_band_count: 32,
                df_bins: 96,
                norm_alpha: 0.99,
                variance_floor: 1e-8,
            },
            inference: InferenceConfig {
                filter_order: 5,
                embedding_dim: 256,
                encoder_hidden: 256,
                erb_hidden: 256,
                df_hidden: 256,
                timeout_ms: 20,
                lsnr: LsnrConfig {
                    min_db: -15.0,
                    max_db_erb: 35.0,
                    max_db_df: 35.0,
                },
                queue_depth: 4,
            },
            buffer: BufferConfig {
                max_buffer_samples: 4800,
                overflow_threshold: 5,
                circuit_breaker_cooldown_ms: 250,
                crossfade_samples: 64,
            },
            worker: WorkerConfig::default(),
        }
    }

    pub fn low_latency() -> Self {
        let mut config = Self::balanced();
        config.profile = ProfileConfig {
            name: "Low Latency".to_string(),
            description: "48kHz, 480-point FFT, 5ms hop".to_string(),
        };
        config.stream.fft_size = 480;
        config.stream.hop_size = 240;
        config.features.df_bins = 48;
        config.inference.timeout_ms = 8;
        config.buffer.max_buffer_samples = 2400;
        config.buffer.crossfade_samples = 32;
        config
    }

    pub fn robust() -> Self {
        let mut config = Self::balanced();
        config.profile = ProfileConfig {
            name: "Robust".to_string(),
            description: "48kHz, 960-point FFT, deep queues and relaxed deadline".to_string(),
        };
        config.inference.timeout_ms = 40;
        config.inference.queue_depth = 16;
        config.buffer.max_buffer_samples = 9600;
        config.buffer.overflow_threshold = 10;
        config.buffer.circuit_breaker_cooldown_ms = 500;
        config.worker = WorkerConfig {
            input_queue_batches: 32,
            output_queue_batches: 32,
        };
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_profiles_validate() {
        for config in [Config::balanced(), Config::low_latency(), Config::robust()] {
            assert!(config.validate().is_ok(), "{} failed", config.profile.name);
        }
    }

    #[test]
    fn test_rejects_odd_fft() {
        let mut config = Config::balanced();
        config.stream.fft_size = 961;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), 101);
    }

    #[test]
    fn test_rejects_hop_larger_than_fft() {
        let mut config = Config::balanced();
        config.stream.hop_size = 2000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_too_many_bands() {
        let mut config = Config::balanced();
        config.features.erb_band_count = config.freq_bins() + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_buffer_smaller_than_hop() {
        let mut config = Config::balanced();
        config.buffer.max_buffer_samples = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_inference_timeout() {
        let config = Config::balanced().with_overrides(None, None, Some(0));
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), 101);
        assert!(err.to_string().contains("timeout_ms"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml::to_string(&config).unwrap().as_bytes())
            .unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn test_toml_file_round_trip() {
        let config = Config::robust();
        let text = config.to_toml().unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();

        let loaded = Config::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut config = Config::balanced();
        config.inference.filter_order = 0;
        let text = toml::to_string(&config).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();

        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn test_with_overrides() {
        let config = Config::balanced().with_overrides(Some(16000), Some(160), None);
        assert_eq!(config.stream.sample_rate, 16000);
        assert_eq!(config.stream.hop_size, 160);
        assert_eq!(config.inference.timeout_ms, 20);
    }
}

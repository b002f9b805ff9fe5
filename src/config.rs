//! Configuration surfaced to the core (§6).
//!
//! The HTTP layer's YAML/env loading machinery is out of scope; this
//! module only owns the shape of the configuration the core consumes and
//! a minimal environment-variable loader in the teacher's style
//! (`std::env::var(...).unwrap_or_else(...)`), so the core can be
//! exercised standalone (see `src/bin/videoforge.rs`).

use std::time::Duration;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub workers: usize,
    pub queue_size: usize,
    pub max_concurrent: usize,
    pub process_timeout: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        let workers = num_cpus::get().min(8);
        Self {
            workers,
            queue_size: 64,
            max_concurrent: workers,
            process_timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub output_dir: String,
    pub temp_dir: String,
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: "./data/output".to_string(),
            temp_dir: "./data/tmp".to_string(),
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    pub allowed_domains: Vec<String>,
    pub allowlist_required: bool,
}

impl SecurityConfig {
    /// Allowed-domains list must not contain `*`; presence of `*` aborts
    /// startup.
    pub fn validate(&self) -> CoreResult<()> {
        if self.allowed_domains.iter().any(|d| d == "*") {
            return Err(CoreError::invalid_input(
                "security.allowed_domains must not contain a wildcard entry",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub enabled: bool,
    pub idle_timeout: Duration,
    pub startup_timeout: Duration,
    pub restart_max_attempts: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_timeout: Duration::from_secs(300),
            startup_timeout: Duration::from_secs(30),
            restart_max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    pub daemon: DaemonConfig,
    pub processing_timeout: Duration,
    pub binary_path: String,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            processing_timeout: Duration::from_secs(300),
            binary_path: "transcribe-daemon".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub binary_path: String,
    pub probe_path: String,
    pub timeout: Duration,
    pub quality: String,
    pub preset: String,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            probe_path: "ffprobe".to_string(),
            timeout: Duration::from_secs(1800),
            quality: "medium".to_string(),
            preset: "medium".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubtitleColors {
    pub word: String,
    pub outline: String,
}

#[derive(Debug, Clone)]
pub struct SubtitleDefaults {
    pub style: crate::model::SubtitleStyle,
    pub font_family: String,
    pub font_size: u32,
    pub position: crate::model::Position,
    pub colors: SubtitleColors,
}

impl Default for SubtitleDefaults {
    fn default() -> Self {
        Self {
            style: crate::model::SubtitleStyle::Progressive,
            font_family: "Arial".to_string(),
            font_size: 48,
            position: crate::model::Position::BottomCenter,
            colors: SubtitleColors {
                word: "#FFFFFF".to_string(),
                outline: "#000000".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub job: JobConfig,
    pub storage: StorageConfig,
    pub security: SecurityConfig,
    pub transcription: TranscriptionConfig,
    pub encoder: EncoderConfig,
    pub subtitles: SubtitleDefaults,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Loads configuration from environment variables, falling back to
    /// the defaults above. Validates process-fatal invariants (wildcard
    /// allowlist) before returning.
    pub fn from_env() -> CoreResult<Self> {
        let job = JobConfig {
            workers: env_or("JOB_WORKERS", JobConfig::default().workers),
            queue_size: env_or("JOB_QUEUE_SIZE", JobConfig::default().queue_size),
            max_concurrent: env_or("JOB_MAX_CONCURRENT", JobConfig::default().max_concurrent),
            process_timeout: Duration::from_secs(env_or(
                "JOB_PROCESS_TIMEOUT_SECS",
                JobConfig::default().process_timeout.as_secs(),
            )),
        };

        let storage = StorageConfig {
            output_dir: env_str("STORAGE_OUTPUT_DIR", &StorageConfig::default().output_dir),
            temp_dir: env_str("STORAGE_TEMP_DIR", &StorageConfig::default().temp_dir),
            retention_days: env_or("STORAGE_RETENTION_DAYS", StorageConfig::default().retention_days),
        };

        let allowed_domains = std::env::var("SECURITY_ALLOWED_DOMAINS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let security = SecurityConfig {
            allowlist_required: env_or("SECURITY_ALLOWLIST_REQUIRED", false),
            allowed_domains,
        };
        security.validate()?;

        let transcription = TranscriptionConfig {
            daemon: DaemonConfig {
                enabled: env_or("TRANSCRIPTION_DAEMON_ENABLED", DaemonConfig::default().enabled),
                idle_timeout: Duration::from_secs(env_or(
                    "TRANSCRIPTION_DAEMON_IDLE_TIMEOUT_SECS",
                    DaemonConfig::default().idle_timeout.as_secs(),
                )),
                startup_timeout: Duration::from_secs(env_or(
                    "TRANSCRIPTION_DAEMON_STARTUP_TIMEOUT_SECS",
                    DaemonConfig::default().startup_timeout.as_secs(),
                )),
                restart_max_attempts: env_or(
                    "TRANSCRIPTION_DAEMON_RESTART_MAX_ATTEMPTS",
                    DaemonConfig::default().restart_max_attempts,
                ),
            },
            processing_timeout: Duration::from_secs(env_or(
                "TRANSCRIPTION_PROCESSING_TIMEOUT_SECS",
                TranscriptionConfig::default().processing_timeout.as_secs(),
            )),
            binary_path: env_str(
                "TRANSCRIPTION_BINARY_PATH",
                &TranscriptionConfig::default().binary_path,
            ),
        };

        let encoder = EncoderConfig {
            binary_path: env_str("ENCODER_BINARY_PATH", &EncoderConfig::default().binary_path),
            probe_path: env_str("ENCODER_PROBE_PATH", &EncoderConfig::default().probe_path),
            timeout: Duration::from_secs(env_or(
                "ENCODER_TIMEOUT_SECS",
                EncoderConfig::default().timeout.as_secs(),
            )),
            quality: env_str("ENCODER_QUALITY", &EncoderConfig::default().quality),
            preset: env_str("ENCODER_PRESET", &EncoderConfig::default().preset),
        };

        Ok(Self {
            job,
            storage,
            security,
            transcription,
            encoder,
            subtitles: SubtitleDefaults::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_allowlist_is_rejected() {
        let cfg = SecurityConfig {
            allowed_domains: vec!["cdn.test".to_string(), "*".to_string()],
            allowlist_required: true,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn explicit_domains_pass_validation() {
        let cfg = SecurityConfig {
            allowed_domains: vec!["cdn.test".to_string()],
            allowlist_required: true,
        };
        assert!(cfg.validate().is_ok());
    }
}

//! Media Probe (§4.3) — probes a remote media URL without downloading it,
//! via an external probe tool (ffprobe-compatible). Grounded on the
//! `ffprobe_adapter` pattern: spawn the tool, capture stdout, parse its
//! structured JSON output.

use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

use crate::error::{CoreError, CoreResult, Kind};
use crate::model::ElementType;
use crate::validation;

/// Conservative fallback durations used by the orchestrator when a probe
/// fails for audio/video (§4.9 step 1).
pub const DEFAULT_AUDIO_DURATION: f64 = 10.0;
pub const DEFAULT_VIDEO_DURATION: f64 = 30.0;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProbeResult {
    pub duration: Option<f64>,
    pub format: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bitrate: Option<u64>,
    pub size: Option<u64>,
}

pub struct MediaProbe {
    probe_path: String,
    connect_timeout: Duration,
    total_timeout: Duration,
}

impl MediaProbe {
    pub fn new(probe_path: impl Into<String>) -> Self {
        Self {
            probe_path: probe_path.into(),
            connect_timeout: Duration::from_secs(10),
            total_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, total: Duration) -> Self {
        self.connect_timeout = connect;
        self.total_timeout = total;
        self
    }

    /// Resolves Google-Drive-style share URLs to a direct-content URL
    /// before probing. Any other URL passes through unchanged.
    pub fn resolve_share_url(url: &str) -> String {
        if let Some(id) = extract_drive_file_id(url) {
            format!("https://drive.google.com/uc?export=download&id={id}")
        } else {
            url.to_string()
        }
    }

    /// Probes `url` for `kind`. Does not download the resource — invokes
    /// the probe tool directly against the URL.
    pub async fn probe(
        &self,
        url: &str,
        kind: ElementType,
        allowed_domains: &[String],
        allowlist_required: bool,
    ) -> CoreResult<ProbeResult> {
        validation::validate_url(url, allowed_domains, allowlist_required)?;
        let resolved = Self::resolve_share_url(url);

        // The probe tool's own `-timeout` option bounds how long it will
        // spend establishing the connection; the outer `total_timeout`
        // below separately bounds the whole call including the read of
        // the probed metadata, per the "10s connect, 2min total" split.
        let connect_micros = self.connect_timeout.as_micros().to_string();
        let args = [
            "-v",
            "error",
            "-timeout",
            connect_micros.as_str(),
            "-show_entries",
            "format=duration,bit_rate,size:stream=width,height,codec_type",
            "-of",
            "json",
            resolved.as_str(),
        ];

        let run = async {
            let output = Command::new(&self.probe_path)
                .args(args)
                .output()
                .await
                .map_err(|e| CoreError::new(Kind::DownloadFailed, format!("failed to spawn probe tool: {e}")))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                return Err(CoreError::new(
                    Kind::DownloadFailed,
                    format!("probe tool exited non-zero: {stderr}"),
                ));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            parse_probe_json(&stdout, kind)
        };

        match timeout(self.total_timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::timeout("probe exceeded the configured timeout")),
        }
    }

    /// Probes with a conservative fallback for audio/video; image probing
    /// has no fallback since a failed image validation is fatal (§4.9).
    pub async fn probe_or_default(
        &self,
        url: &str,
        kind: ElementType,
        allowed_domains: &[String],
        allowlist_required: bool,
    ) -> CoreResult<ProbeResult> {
        match self.probe(url, kind, allowed_domains, allowlist_required).await {
            Ok(r) => Ok(r),
            Err(e) if kind == ElementType::Image => Err(e),
            Err(e) => {
                warn!(error = %e.message, url, "probe failed, substituting conservative default");
                let duration = match kind {
                    ElementType::Audio => DEFAULT_AUDIO_DURATION,
                    ElementType::Video => DEFAULT_VIDEO_DURATION,
                    _ => unreachable!("image handled above"),
                };
                Ok(ProbeResult {
                    duration: Some(duration),
                    format: "unknown".to_string(),
                    width: None,
                    height: None,
                    bitrate: None,
                    size: None,
                })
            }
        }
    }
}

fn extract_drive_file_id(url: &str) -> Option<String> {
    let marker = "drive.google.com";
    if !url.contains(marker) {
        return None;
    }
    if let Some(idx) = url.find("/d/") {
        let rest = &url[idx + 3..];
        let id: String = rest.chars().take_while(|c| *c != '/' && *c != '?').collect();
        if !id.is_empty() {
            return Some(id);
        }
    }
    if let Some(idx) = url.find("id=") {
        let rest = &url[idx + 3..];
        let id: String = rest.chars().take_while(|c| *c != '&').collect();
        if !id.is_empty() {
            return Some(id);
        }
    }
    None
}

fn parse_probe_json(json: &str, kind: ElementType) -> CoreResult<ProbeResult> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| CoreError::new(Kind::DownloadFailed, format!("probe output was not valid JSON: {e}")))?;

    let format_block = value.get("format");

    let duration = if kind == ElementType::Image {
        None
    } else {
        format_block
            .and_then(|f| f.get("duration"))
            .and_then(|d| d.as_str())
            .and_then(|s| s.parse::<f64>().ok())
    };

    let bitrate = format_block
        .and_then(|f| f.get("bit_rate"))
        .and_then(|b| b.as_str())
        .and_then(|s| s.parse::<u64>().ok());

    let size = format_block
        .and_then(|f| f.get("size"))
        .and_then(|s| s.as_str())
        .and_then(|s| s.parse::<u64>().ok());

    let streams = value.get("streams").and_then(|s| s.as_array());

    let video_stream = streams.and_then(|arr| {
        arr.iter().find(|s| {
            s.get("codec_type").and_then(|c| c.as_str()) == Some("video")
        })
    });

    let width = video_stream
        .and_then(|s| s.get("width"))
        .and_then(|w| w.as_u64())
        .map(|w| w as u32);
    let height = video_stream
        .and_then(|s| s.get("height"))
        .and_then(|h| h.as_u64())
        .map(|h| h as u32);

    if kind != ElementType::Image && duration.is_none() {
        return Err(CoreError::new(
            Kind::DownloadFailed,
            "probe output did not contain a duration",
        ));
    }
    if kind == ElementType::Image && video_stream.is_none() && streams.map(|s| s.is_empty()).unwrap_or(true) {
        return Err(CoreError::invalid_input("probe could not validate the image"));
    }

    Ok(ProbeResult {
        duration,
        format: "probed".to_string(),
        width,
        height,
        bitrate,
        size,
    })
}

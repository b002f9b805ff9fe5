//! Transcription Daemon Client (§4.4) — manages a long-running speech
//! recognition subprocess, framing requests/responses as one JSON object
//! per line over its stdio, with a restart policy and idle shutdown.
//!
//! Modeled as an explicit state machine rather than a plain library
//! call (§9 design note): crashes and restarts are first-class states.

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::DaemonConfig;
use crate::error::{CoreError, CoreResult, Kind};
use crate::model::WordTimestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Starting,
    Ready,
    Busy,
    Stopping,
    Crashed,
}

#[derive(Debug, Serialize)]
struct TranscribeRequest<'a> {
    audio_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    #[serde(default)]
    words: Vec<WordTimestamp>,
    #[serde(default)]
    language: String,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

pub struct TranscriptionResult {
    pub words: Vec<WordTimestamp>,
    pub language: String,
    pub duration: f64,
}

struct RunningDaemon {
    child: Child,
    stdin: tokio::process::ChildStdin,
    stdout: BufReader<tokio::process::ChildStdout>,
}

struct Inner {
    state: DaemonState,
    daemon: Option<RunningDaemon>,
    restart_attempts: u32,
    window_started: Option<Instant>,
    last_activity: Instant,
    /// Set after a request timeout whose response may still arrive on
    /// stdout; drained before the next request is sent so the two don't
    /// desync.
    pending_drain: bool,
}

/// Single-consumer client: access is serialized by the mutex held across
/// `Ready <-> Busy`, so concurrent requests queue (§5).
pub struct TranscriptionDaemonClient {
    binary_path: String,
    config: DaemonConfig,
    request_timeout: Duration,
    inner: Mutex<Inner>,
}

const READY_SENTINEL: &str = "READY";

impl TranscriptionDaemonClient {
    pub fn new(binary_path: impl Into<String>, config: DaemonConfig, request_timeout: Duration) -> Self {
        Self {
            binary_path: binary_path.into(),
            config,
            request_timeout,
            inner: Mutex::new(Inner {
                state: DaemonState::Stopped,
                daemon: None,
                restart_attempts: 0,
                window_started: None,
                last_activity: Instant::now(),
                pending_drain: false,
            }),
        }
    }

    pub async fn state(&self) -> DaemonState {
        self.inner.lock().await.state
    }

    /// Transcribes `audio_url`, starting or restarting the daemon as
    /// needed. Serializes with any other in-flight request.
    pub async fn transcribe(
        &self,
        audio_url: &str,
        language: Option<&str>,
        model: Option<&str>,
    ) -> CoreResult<TranscriptionResult> {
        let mut guard = self.inner.lock().await;

        self.maybe_idle_shutdown(&mut guard).await;

        if guard.daemon.is_none() {
            self.start_locked(&mut guard).await?;
        }

        if guard.pending_drain {
            self.drain_stale_response(&mut guard).await;
        }

        guard.state = DaemonState::Busy;
        let request = TranscribeRequest {
            audio_url,
            language,
            model,
        };
        let line = serde_json::to_string(&request)
            .map_err(|e| CoreError::new(Kind::TranscriptionFailed, format!("failed to encode request: {e}")))?;

        let result = self.send_request(&mut guard, &line).await;

        match &result {
            Ok(_) => {
                guard.state = DaemonState::Ready;
                guard.last_activity = Instant::now();
                guard.pending_drain = false;
            }
            Err(e) if e.kind == Kind::Timeout => {
                // The request was too slow, not the daemon: keep it
                // alive for the next call instead of burning a restart
                // attempt (§4.4). Its response may still land on stdout
                // later, so flag it for draining before the next send.
                warn!("transcription request timed out, keeping daemon alive");
                guard.state = DaemonState::Ready;
                guard.pending_drain = true;
            }
            Err(_) => {
                // Subprocess exit during a request: drop it so the next
                // call restarts fresh.
                guard.daemon = None;
                guard.state = DaemonState::Crashed;
                guard.pending_drain = false;
            }
        }

        result
    }

    /// Best-effort discard of a response left over from a timed-out
    /// request, so it isn't mistaken for the next request's response.
    async fn drain_stale_response(&self, guard: &mut Inner) {
        if let Some(daemon) = guard.daemon.as_mut() {
            let mut discard = String::new();
            let _ = timeout(Duration::from_millis(50), daemon.stdout.read_line(&mut discard)).await;
        }
        guard.pending_drain = false;
    }

    async fn send_request(&self, guard: &mut Inner, line: &str) -> CoreResult<TranscriptionResult> {
        let daemon = guard
            .daemon
            .as_mut()
            .ok_or_else(|| CoreError::new(Kind::TranscriptionFailed, "daemon is not running"))?;

        let write = async {
            daemon.stdin.write_all(line.as_bytes()).await?;
            daemon.stdin.write_all(b"\n").await?;
            daemon.stdin.flush().await?;

            let mut response_line = String::new();
            daemon.stdout.read_line(&mut response_line).await?;
            Ok::<String, std::io::Error>(response_line)
        };

        let response_line = match timeout(self.request_timeout, write).await {
            Ok(Ok(line)) if !line.is_empty() => line,
            Ok(Ok(_)) => {
                return Err(CoreError::new(
                    Kind::TranscriptionFailed,
                    "daemon closed its output stream",
                ))
            }
            Ok(Err(e)) => {
                return Err(CoreError::new(
                    Kind::TranscriptionFailed,
                    format!("i/o error talking to daemon: {e}"),
                ))
            }
            Err(_) => return Err(CoreError::timeout("transcription request timed out")),
        };

        let response: TranscribeResponse = serde_json::from_str(response_line.trim())
            .map_err(|e| CoreError::new(Kind::TranscriptionFailed, format!("failed to parse daemon response: {e}")))?;

        if let Some(msg) = response.error {
            return Err(CoreError::new(Kind::TranscriptionFailed, msg)
                .with_detail("code", response.code.unwrap_or_default()));
        }

        Ok(TranscriptionResult {
            words: response.words,
            language: response.language,
            duration: response.duration,
        })
    }

    async fn maybe_idle_shutdown(&self, guard: &mut Inner) {
        if guard.daemon.is_some()
            && guard.state == DaemonState::Ready
            && guard.last_activity.elapsed() > self.config.idle_timeout
        {
            info!("transcription daemon idle timeout reached, shutting down");
            self.stop_locked(guard).await;
        }
    }

    async fn stop_locked(&self, guard: &mut Inner) {
        guard.state = DaemonState::Stopping;
        if let Some(mut daemon) = guard.daemon.take() {
            let _ = daemon.child.kill().await;
        }
        guard.state = DaemonState::Stopped;
    }

    async fn start_locked(&self, guard: &mut Inner) -> CoreResult<()> {
        let now = Instant::now();
        match guard.window_started {
            Some(start) if now.duration_since(start) < Duration::from_secs(60) => {
                if guard.restart_attempts >= self.config.restart_max_attempts {
                    return Err(CoreError::new(
                        Kind::TranscriptionFailed,
                        "transcription daemon exceeded its restart budget",
                    ));
                }
            }
            _ => {
                guard.window_started = Some(now);
                guard.restart_attempts = 0;
            }
        }

        guard.state = DaemonState::Starting;

        let mut child = Command::new(&self.binary_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CoreError::new(Kind::TranscriptionFailed, format!("failed to spawn transcription daemon: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoreError::new(Kind::TranscriptionFailed, "daemon child has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::new(Kind::TranscriptionFailed, "daemon child has no stdout"))?;
        let mut stdout = BufReader::new(stdout);

        let mut sentinel_line = String::new();
        let wait_for_ready = async {
            loop {
                sentinel_line.clear();
                let n = stdout.read_line(&mut sentinel_line).await?;
                if n == 0 {
                    return Ok::<bool, std::io::Error>(false);
                }
                if sentinel_line.trim() == READY_SENTINEL {
                    return Ok(true);
                }
            }
        };

        let became_ready = match timeout(self.config.startup_timeout, wait_for_ready).await {
            Ok(Ok(ready)) => ready,
            Ok(Err(e)) => {
                error!(error = %e, "i/o error waiting for transcription daemon readiness");
                false
            }
            Err(_) => false,
        };

        if !became_ready {
            let _ = child.kill().await;
            guard.restart_attempts += 1;
            guard.state = DaemonState::Crashed;
            return Err(CoreError::timeout(
                "transcription daemon did not signal readiness in time",
            ));
        }

        guard.daemon = Some(RunningDaemon { child, stdin, stdout });
        guard.state = DaemonState::Ready;
        guard.restart_attempts = 0;
        guard.last_activity = Instant::now();
        Ok(())
    }

    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        self.stop_locked(&mut guard).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_without_optional_fields() {
        let req = TranscribeRequest {
            audio_url: "https://cdn.test/a.mp3",
            language: None,
            model: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("language"));
        assert!(!json.contains("model"));
    }

    #[test]
    fn error_response_is_parsed() {
        let raw = r#"{"error":"model not loaded","code":"model_error"}"#;
        let resp: TranscribeResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.error.as_deref(), Some("model not loaded"));
    }

    #[test]
    fn fresh_client_starts_stopped() {
        let client = TranscriptionDaemonClient::new(
            "nonexistent-transcription-binary-for-tests",
            DaemonConfig::default(),
            Duration::from_secs(5),
        );
        let state = tokio_test::block_on(client.state());
        assert_eq!(state, DaemonState::Stopped);
    }

    #[tokio::test]
    async fn transcribe_surfaces_spawn_failure_as_transcription_failed() {
        let client = TranscriptionDaemonClient::new(
            "nonexistent-transcription-binary-for-tests",
            DaemonConfig::default(),
            Duration::from_secs(5),
        );
        let err = client.transcribe("https://cdn.test/a.mp3", None, None).await.unwrap_err();
        assert_eq!(err.kind, Kind::TranscriptionFailed);
    }
}

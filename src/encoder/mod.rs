//! Encoder Command Builder (§4.6) — builds argv for the external video
//! encoder from a validated `VideoConfig`, injects the subtitle track,
//! and executes the encoder with no shell, streaming progress to a
//! bounded channel.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::EncoderConfig;
use crate::error::{CoreError, CoreResult, Kind};
use crate::model::{ElementType, Project, VideoConfig};
use crate::validation;

/// Progress sample forwarded from the encoder's stderr to the job
/// engine, coalesced to monotone non-decreasing percentages (§4.9 step
/// 4, §5).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeProgress(pub f32);

/// Resolves an overlay element's placement: explicit `(x, y)` wins when
/// given, otherwise an overlay with neither is anchored at the origin —
/// background and scene media never carry overlay coordinates, only
/// elements layered on top of them do.
fn overlay_xy(element: &crate::model::Element) -> (i32, i32) {
    (element.x.unwrap_or(0), element.y.unwrap_or(0))
}

/// Rejects any argv element containing an unescaped shell metacharacter.
/// The encoder is spawned with no shell, so this is defense-in-depth
/// against a downstream tool that might reinterpret the argument.
fn check_arg_safety(arg: &str) -> CoreResult<()> {
    const META: &[char] = &[';', '&', '|', '`', '$', '(', ')', '{', '}'];
    if arg.chars().any(|c| META.contains(&c)) {
        return Err(CoreError::invalid_input(format!(
            "encoder argument contains a shell metacharacter: {arg}"
        )));
    }
    Ok(())
}

pub struct EncoderCommandBuilder {
    config: EncoderConfig,
}

impl EncoderCommandBuilder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    /// Builds the argv for a config plus optional subtitle path.
    /// Preconditions (fail-fast, before any child process):
    /// - every `Src` passes URL validation and the domain allowlist;
    /// - the subtitle path (if any) is within `temp_dir`;
    /// - no argv element contains an unescaped shell metacharacter.
    pub fn build_args(
        &self,
        config: &VideoConfig,
        subtitle_path: Option<&Path>,
        subtitle_style: Option<&str>,
        temp_dir: &Path,
        allowed_domains: &[String],
        allowlist_required: bool,
    ) -> CoreResult<Vec<String>> {
        for project in config.projects() {
            self.validate_project_srcs(project, allowed_domains, allowlist_required)?;
        }

        if let Some(path) = subtitle_path {
            if !validation::is_within_base(temp_dir, path) {
                return Err(CoreError::invalid_input(
                    "subtitle path escapes the configured temp directory",
                ));
            }
        }

        let mut args = vec!["-y".to_string()];
        let mut input_index = 0usize;
        let mut filter_chains: Vec<String> = Vec::new();
        let mut audio_inputs: Vec<(usize, f64)> = Vec::new(); // (input index, delay seconds)
        // Overlay candidates: (input index, x, y, z-index), background
        // video/image excluded — only scene-level visual elements overlay.
        let mut overlay_inputs: Vec<(usize, i32, i32, i32)> = Vec::new();
        let mut background_video_input: Option<usize> = None;

        for project in config.projects() {
            // Backgrounds before scene media, in stable order.
            for element in &project.elements {
                self.append_input(&mut args, element, &mut input_index)?;
                if matches!(element.kind, ElementType::Video | ElementType::Image) {
                    background_video_input.get_or_insert(input_index - 1);
                }
            }

            let mut scene_start = 0.0_f64;
            for scene in &project.scenes {
                for element in &scene.elements {
                    match element.kind {
                        ElementType::Audio => {
                            self.append_input(&mut args, element, &mut input_index)?;
                            audio_inputs.push((input_index - 1, scene_start));
                        }
                        ElementType::Video | ElementType::Image => {
                            self.append_input(&mut args, element, &mut input_index)?;
                            if background_video_input.is_none() {
                                background_video_input = Some(input_index - 1);
                            } else {
                                let (x, y) = overlay_xy(element);
                                overlay_inputs.push((input_index - 1, x, y, element.z_index.unwrap_or(0)));
                            }
                        }
                        ElementType::Subtitles => {}
                    }
                }
                if let Some(first_audio) = scene.first_audio() {
                    scene_start += first_audio.duration.unwrap_or(0.0);
                }
            }
        }
        overlay_inputs.sort_by_key(|(_, _, _, z)| *z);

        // Mix every delayed audio input together.
        if !audio_inputs.is_empty() {
            let mut audio_labels = Vec::new();
            for (idx, (input_idx, delay)) in audio_inputs.iter().enumerate() {
                let delay_ms = (delay * 1000.0).round() as i64;
                let label = format!("a{idx}");
                filter_chains.push(format!(
                    "[{input_idx}:a]adelay={delay_ms}|{delay_ms}[{label}]"
                ));
                audio_labels.push(format!("[{label}]"));
            }
            filter_chains.push(format!(
                "{}amix=inputs={}:normalize=0[aout]",
                audio_labels.join(""),
                audio_labels.len()
            ));
        }

        let has_video = background_video_input.is_some();
        let mut video_label = format!("{}:v", background_video_input.unwrap_or(0));
        let mut video_is_filter_output = false;
        for (idx, (input_idx, x, y, _z)) in overlay_inputs.iter().enumerate() {
            let out_label = format!("ov{idx}");
            filter_chains.push(format!(
                "[{video_label}][{input_idx}:v]overlay={x}:{y}[{out_label}]"
            ));
            video_label = out_label;
            video_is_filter_output = true;
        }

        // A subtitle track is burned in only when there is an actual video
        // stream to draw it onto; an audio-only job has no such stream, so
        // `subtitle_path` is left unset for those by the orchestrator, but
        // guard here too rather than trust the caller.
        if let Some(sub_path) = subtitle_path {
            if has_video || video_is_filter_output {
                check_arg_safety(&sub_path.display().to_string())?;
                let escaped = sub_path.display().to_string().replace(':', "\\:");
                let current_ref = format!("[{video_label}]");
                let style_suffix = match subtitle_style {
                    Some(s) if !s.is_empty() => {
                        let escaped_style = s.replace(':', "\\:").replace(',', "\\,");
                        format!(":force_style='{escaped_style}'")
                    }
                    _ => String::new(),
                };
                filter_chains.push(format!("{current_ref}subtitles='{escaped}'{style_suffix}[vout]"));
                video_label = "vout".to_string();
                video_is_filter_output = true;
            }
        }

        if !filter_chains.is_empty() {
            args.push("-filter_complex".to_string());
            args.push(filter_chains.join(";"));
        }

        // A config with no video/image element anywhere (audio-only, per
        // §8 scenario 1) has no video stream to map; omitting -map here
        // produces an audio-only MP4 instead of a bogus "0:v" against an
        // input with no video track.
        if has_video || video_is_filter_output {
            args.push("-map".to_string());
            if video_is_filter_output {
                args.push(format!("[{video_label}]"));
            } else {
                args.push(video_label);
            }
        }
        if !audio_inputs.is_empty() {
            args.push("-map".to_string());
            args.push("[aout]".to_string());
        }

        args.push("-c:v".to_string());
        args.push("libx264".to_string());
        args.push("-preset".to_string());
        args.push(self.config.preset.clone());
        args.push("-crf".to_string());
        args.push(quality_to_crf(&self.config.quality).to_string());
        args.push("-c:a".to_string());
        args.push("aac".to_string());
        args.push("-f".to_string());
        args.push("mp4".to_string());

        for arg in &args {
            check_arg_safety(arg)?;
        }

        Ok(args)
    }

    fn validate_project_srcs(
        &self,
        project: &Project,
        allowed_domains: &[String],
        allowlist_required: bool,
    ) -> CoreResult<()> {
        for element in &project.elements {
            if let Some(src) = &element.src {
                validation::validate_url(src, allowed_domains, allowlist_required)?;
            }
        }
        for scene in &project.scenes {
            for element in &scene.elements {
                if let Some(src) = &element.src {
                    validation::validate_url(src, allowed_domains, allowlist_required)?;
                }
            }
        }
        Ok(())
    }

    fn append_input(
        &self,
        args: &mut Vec<String>,
        element: &crate::model::Element,
        input_index: &mut usize,
    ) -> CoreResult<()> {
        if let Some(src) = &element.src {
            check_arg_safety(src)?;
            args.push("-i".to_string());
            args.push(src.clone());
            *input_index += 1;
        }
        Ok(())
    }

    /// Spawns the encoder with the built argv (no shell). Progress lines
    /// parsed from stderr are forwarded to `progress_tx`; the channel is
    /// never allowed to block encoding, so sends use `try_send` and drop
    /// on backpressure.
    pub async fn execute(
        &self,
        args: &[String],
        output_path: &Path,
        progress_tx: mpsc::Sender<EncodeProgress>,
    ) -> CoreResult<()> {
        let mut full_args = args.to_vec();
        full_args.push(output_path.display().to_string());

        let mut child = Command::new(&self.config.binary_path)
            .args(&full_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CoreError::new(Kind::EncoderFailed, format!("failed to spawn encoder: {e}")))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CoreError::new(Kind::EncoderFailed, "encoder child has no stderr"))?;

        let drain = async move {
            let mut reader = BufReader::new(stderr).lines();
            let mut last_reported = -1.0_f32;
            while let Ok(Some(line)) = reader.next_line().await {
                if let Some(pct) = parse_progress_line(&line) {
                    let clamped = pct.max(last_reported);
                    if clamped > last_reported {
                        last_reported = clamped;
                        let _ = progress_tx.try_send(EncodeProgress(clamped));
                    }
                }
            }
        };

        let run = async {
            tokio::join!(drain, child.wait())
        };

        let (_, status) = match timeout(self.config.timeout, run).await {
            Ok((drain_result, status_result)) => (drain_result, status_result),
            Err(_) => {
                if let Err(e) = terminate_then_kill(&mut child).await {
                    warn!(error = %e, "failed to terminate encoder after timeout");
                }
                return Err(CoreError::timeout("encoder exceeded its configured timeout"));
            }
        };

        let status = status.map_err(|e| CoreError::new(Kind::EncoderFailed, format!("failed to wait on encoder: {e}")))?;

        if !status.success() {
            return Err(CoreError::new(
                Kind::EncoderFailed,
                format!("encoder exited with status {status}"),
            ));
        }

        info!(output = %output_path.display(), "encode finished");
        Ok(())
    }
}

async fn terminate_then_kill(child: &mut tokio::process::Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc_kill(pid as i32, 15);
            }
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    child.start_kill()?;
    let _ = child.wait().await;
    Ok(())
}

#[cfg(unix)]
unsafe fn libc_kill(pid: i32, sig: i32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    kill(pid, sig);
}

fn quality_to_crf(quality: &str) -> u32 {
    match quality {
        "low" => 28,
        "high" => 18,
        _ => 23, // medium / default
    }
}

fn parse_progress_line(line: &str) -> Option<f32> {
    // ffmpeg-style progress line: "frame= 120 fps=30 ... time=00:00:04.00 ..."
    let time_idx = line.find("time=")?;
    let rest = &line[time_idx + 5..];
    let ts = rest.split_whitespace().next()?;
    let mut parts = ts.split(':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    let seconds = h * 3600.0 + m * 60.0 + s;
    // Without the total duration in this scope, report an approximate
    // monotone percentage capped below 100; the final 100 is always
    // delivered by the orchestrator on success (§9).
    Some((seconds / (seconds + 1.0) * 99.0) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Element, ElementType, Project, Scene, VideoConfig};

    fn audio_element(src: &str, duration: f64) -> Element {
        Element {
            kind: ElementType::Audio,
            src: Some(src.to_string()),
            x: None,
            y: None,
            z_index: None,
            volume: None,
            duration: Some(duration),
            settings: None,
        }
    }

    #[test]
    fn rejects_config_with_unvalidated_host() {
        let builder = EncoderCommandBuilder::new(EncoderConfig::default());
        let config = VideoConfig(vec![Project {
            scenes: vec![Scene {
                id: "s1".into(),
                elements: vec![audio_element("http://127.0.0.1/a.mp3", 5.0)],
            }],
            elements: vec![],
            width: None,
            height: None,
            quality: None,
        }]);
        let err = builder
            .build_args(&config, None, None, Path::new("/tmp"), &[], false)
            .unwrap_err();
        assert_eq!(err.kind, Kind::InvalidInput);
    }

    #[test]
    fn builds_args_for_a_simple_single_scene_config() {
        let builder = EncoderCommandBuilder::new(EncoderConfig::default());
        let config = VideoConfig(vec![Project {
            scenes: vec![Scene {
                id: "s1".into(),
                elements: vec![audio_element("https://cdn.test/a.mp3", 12.0)],
            }],
            elements: vec![],
            width: None,
            height: None,
            quality: None,
        }]);
        let args = builder
            .build_args(&config, None, None, Path::new("/tmp"), &[], false)
            .unwrap();
        assert!(args.iter().any(|a| a == "https://cdn.test/a.mp3"));
        assert!(args.iter().any(|a| a == "-c:v"));
    }

    #[test]
    fn audio_only_config_emits_no_video_map() {
        let builder = EncoderCommandBuilder::new(EncoderConfig::default());
        let config = VideoConfig(vec![Project {
            scenes: vec![Scene {
                id: "s1".into(),
                elements: vec![audio_element("https://cdn.test/a.mp3", 12.0)],
            }],
            elements: vec![],
            width: None,
            height: None,
            quality: None,
        }]);
        let args = builder
            .build_args(&config, None, None, Path::new("/tmp"), &[], false)
            .unwrap();
        // No video/image element anywhere: no "-map *:v" should be
        // emitted, only the audio map.
        assert!(!args.iter().any(|a| a == "0:v" || a.starts_with("[vout]") || a == "[vout]"));
        let map_positions: Vec<usize> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| a.as_str() == "-map")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(map_positions.len(), 1, "only the audio -map should be present: {args:?}");
        assert_eq!(args[map_positions[0] + 1], "[aout]");
    }

    #[test]
    fn video_scene_emits_video_map() {
        let builder = EncoderCommandBuilder::new(EncoderConfig::default());
        let mut video_elem = audio_element("https://cdn.test/v.mp4", 12.0);
        video_elem.kind = ElementType::Video;
        let config = VideoConfig(vec![Project {
            scenes: vec![Scene {
                id: "s1".into(),
                elements: vec![video_elem, audio_element("https://cdn.test/a.mp3", 12.0)],
            }],
            elements: vec![],
            width: None,
            height: None,
            quality: None,
        }]);
        let args = builder
            .build_args(&config, None, None, Path::new("/tmp"), &[], false)
            .unwrap();
        let map_positions: Vec<usize> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| a.as_str() == "-map")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(map_positions.len(), 2);
        assert_eq!(args[map_positions[0] + 1], "0:v");
    }

    #[test]
    fn rejects_subtitle_path_outside_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let outside = std::env::temp_dir().join("not-in-job-dir.srt");
        std::fs::write(&outside, b"x").unwrap();
        let builder = EncoderCommandBuilder::new(EncoderConfig::default());
        let config = VideoConfig(vec![Project {
            scenes: vec![Scene {
                id: "s1".into(),
                elements: vec![audio_element("https://cdn.test/a.mp3", 12.0)],
            }],
            elements: vec![],
            width: None,
            height: None,
            quality: None,
        }]);
        let err = builder
            .build_args(&config, Some(&outside), None, dir.path(), &[], false)
            .unwrap_err();
        assert_eq!(err.kind, Kind::InvalidInput);
        let _ = std::fs::remove_file(&outside);
    }

    #[test]
    fn progress_line_parses_ffmpeg_time() {
        let pct = parse_progress_line("frame=  100 fps=25 q=-1.0 size=... time=00:00:04.00 bitrate=...");
        assert!(pct.is_some());
    }
}

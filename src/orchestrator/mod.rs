//! Pipeline Orchestrator (§4.9) — composes every other component into
//! the per-job sequence: probe, subtitle decision, transcription and
//! authoring, encode, store, cleanup.
//!
//! This is the one module allowed to depend on all the others (§9
//! design note); nothing else may import it.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{Config, SubtitleDefaults};
use crate::encoder::{EncodeProgress, EncoderCommandBuilder};
use crate::error::{CoreError, CoreResult};
use crate::model::{Element, ElementType, Project, SubtitleSettings, VideoConfig};
use crate::probe::MediaProbe;
use crate::store::ContentStore;
use crate::subtitles;
use crate::transcription::TranscriptionDaemonClient;

pub struct Orchestrator {
    probe: MediaProbe,
    transcription: TranscriptionDaemonClient,
    encoder: EncoderCommandBuilder,
    store: ContentStore,
    subtitle_defaults: SubtitleDefaults,
    allowed_domains: Vec<String>,
    allowlist_required: bool,
    temp_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(config: &Config) -> Self {
        Self {
            probe: MediaProbe::new(config.encoder.probe_path.clone()),
            transcription: TranscriptionDaemonClient::new(
                config.transcription.binary_path.clone(),
                config.transcription.daemon.clone(),
                config.transcription.processing_timeout,
            ),
            encoder: EncoderCommandBuilder::new(config.encoder.clone()),
            store: ContentStore::new(
                config.storage.output_dir.clone(),
                config.storage.temp_dir.clone(),
                config.storage.retention_days,
            ),
            subtitle_defaults: config.subtitles.clone(),
            allowed_domains: config.security.allowed_domains.clone(),
            allowlist_required: config.security.allowlist_required,
            temp_dir: PathBuf::from(config.storage.temp_dir.clone()),
        }
    }

    /// Test-only constructor wired to nonexistent binaries so callers
    /// can exercise job bookkeeping without spawning real subprocesses.
    #[cfg(test)]
    pub fn new_for_tests() -> Self {
        Self::new(&Config::default())
    }

    /// Runs the full per-job pipeline and returns the stored video's
    /// id. `progress` is forwarded coalesced, monotone non-decreasing
    /// percentages; sends never block the pipeline.
    pub async fn run(
        &self,
        job_id: &str,
        mut config: VideoConfig,
        progress: mpsc::Sender<f32>,
    ) -> CoreResult<String> {
        self.probe_pass(&mut config).await?;
        let _ = progress.try_send(5.0);

        let (subtitle_path, subtitle_style) = self.author_subtitles(job_id, &config, &progress).await?;

        let job_temp_dir = self.temp_dir.join(job_id);
        tokio::fs::create_dir_all(&job_temp_dir)
            .await
            .map_err(|e| CoreError::internal(format!("failed to create job temp dir: {e}")))?;

        let args = self.encoder.build_args(
            &config,
            subtitle_path.as_deref(),
            subtitle_style.as_deref(),
            &job_temp_dir,
            &self.allowed_domains,
            self.allowlist_required,
        )?;

        let output_path = job_temp_dir.join("output.mp4");
        self.run_encode(&args, &output_path, &progress).await?;

        let video_id = self.store.store(&output_path).await?;

        self.cleanup(&subtitle_path, &job_temp_dir).await;

        Ok(video_id)
    }

    /// Step 1: probes every audio/video/image element. Audio/video
    /// failures are non-fatal (a conservative default is substituted);
    /// image failures are fatal.
    async fn probe_pass(&self, config: &mut VideoConfig) -> CoreResult<()> {
        for project in config.projects_mut() {
            for element in &mut project.elements {
                self.probe_element(element).await?;
            }
            for scene in &mut project.scenes {
                for element in &mut scene.elements {
                    self.probe_element(element).await?;
                }
            }
        }
        Ok(())
    }

    async fn probe_element(&self, element: &mut Element) -> CoreResult<()> {
        let kind = element.kind;
        if !matches!(kind, ElementType::Audio | ElementType::Video | ElementType::Image) {
            return Ok(());
        }
        let Some(src) = element.src.clone() else {
            return Ok(());
        };
        let result = self
            .probe
            .probe_or_default(&src, kind, &self.allowed_domains, self.allowlist_required)
            .await?;
        element.duration = result.duration;
        Ok(())
    }

    /// Steps 2-3: selects the first project carrying a subtitles
    /// element, transcribes every scene's authoritative audio in order,
    /// and authors a single subtitle file for the whole job.
    async fn author_subtitles(
        &self,
        job_id: &str,
        config: &VideoConfig,
        progress: &mpsc::Sender<f32>,
    ) -> CoreResult<(Option<PathBuf>, Option<String>)> {
        let Some(project) = config.projects().iter().find(|p| p.has_subtitles()) else {
            return Ok((None, None));
        };

        let settings = find_subtitle_settings(project);
        let resolved = subtitles::merge_settings(&self.subtitle_defaults, settings);

        let durations: Vec<f64> = project
            .scenes
            .iter()
            .map(|s| s.first_audio().and_then(|a| a.duration).unwrap_or(0.0))
            .collect();
        let segments = subtitles::build_timing_segments(&durations);

        let mut all_events = Vec::new();
        for (scene, segment) in project.scenes.iter().zip(segments.iter()) {
            let Some(audio) = scene.first_audio() else { continue };
            let Some(src) = &audio.src else { continue };

            let result = self.transcription.transcribe(src, None, None).await?;
            let events = subtitles::build_events(resolved.style, &result.words, segment);
            all_events.extend(events);

            let frac = (segment.scene_index + 1) as f32 / project.scenes.len().max(1) as f32;
            let _ = progress.try_send(5.0 + frac * 40.0);
        }

        let job_temp_dir = self.temp_dir.join(job_id);
        let (path, count) = subtitles::write_subtitle_file(&job_temp_dir, &all_events).await?;
        let force_style = subtitles::force_style_string(&resolved);
        info!(job_id, events = count, "subtitle file authored");
        Ok((Some(path), Some(force_style)))
    }

    async fn run_encode(
        &self,
        args: &[String],
        output_path: &PathBuf,
        progress: &mpsc::Sender<f32>,
    ) -> CoreResult<()> {
        let (enc_tx, mut enc_rx) = mpsc::channel::<EncodeProgress>(16);
        let forward_progress = progress.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(EncodeProgress(pct)) = enc_rx.recv().await {
                let _ = forward_progress.try_send(45.0 + pct * 0.5);
            }
        });

        let result = self.encoder.execute(args, output_path, enc_tx).await;
        let _ = forwarder.await;
        result
    }

    async fn cleanup(&self, subtitle_path: &Option<PathBuf>, job_temp_dir: &PathBuf) {
        if let Some(path) = subtitle_path {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(error = %e, path = %path.display(), "failed to remove subtitle temp file");
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(job_temp_dir).await {
            warn!(error = %e, dir = %job_temp_dir.display(), "failed to remove job temp directory");
        }
    }
}

fn find_subtitle_settings(project: &Project) -> Option<&SubtitleSettings> {
    for element in &project.elements {
        if element.kind == ElementType::Subtitles {
            if let Some(s) = &element.settings {
                return Some(s);
            }
        }
    }
    for scene in &project.scenes {
        for element in &scene.elements {
            if element.kind == ElementType::Subtitles {
                if let Some(s) = &element.settings {
                    return Some(s);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Scene, VideoConfig};

    fn audio_only_project() -> Project {
        Project {
            scenes: vec![Scene {
                id: "s1".into(),
                elements: vec![Element {
                    kind: ElementType::Audio,
                    src: Some("https://cdn.test/a.mp3".into()),
                    x: None,
                    y: None,
                    z_index: None,
                    volume: None,
                    duration: Some(3.0),
                    settings: None,
                }],
            }],
            elements: vec![],
            width: None,
            height: None,
            quality: None,
        }
    }

    #[test]
    fn find_subtitle_settings_prefers_background_then_scene() {
        let mut project = audio_only_project();
        assert!(find_subtitle_settings(&project).is_none());

        project.scenes[0].elements.push(Element {
            kind: ElementType::Subtitles,
            src: None,
            x: None,
            y: None,
            z_index: None,
            volume: None,
            duration: None,
            settings: Some(SubtitleSettings { font_size: Some(50), ..Default::default() }),
        });
        let found = find_subtitle_settings(&project).unwrap();
        assert_eq!(found.font_size, Some(50));
    }

    #[tokio::test]
    async fn probe_pass_is_a_no_op_for_configs_with_no_media_elements() {
        let orchestrator = Orchestrator::new_for_tests();
        let mut config = VideoConfig(vec![Project {
            scenes: vec![],
            elements: vec![],
            width: None,
            height: None,
            quality: None,
        }]);
        assert!(orchestrator.probe_pass(&mut config).await.is_ok());
    }
}

//! Shared data types for video generation requests and job bookkeeping.
//!
//! These are the types that flow across component boundaries (§3 of the
//! design). Everything here is plain data; behavior lives in the
//! components that consume it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A position on a 3x3 grid used for overlays and subtitle placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Position {
    TopLeft,
    TopCenter,
    TopRight,
    CenterLeft,
    Center,
    CenterRight,
    BottomLeft,
    BottomCenter,
    BottomRight,
}

/// Subtitle presentation style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubtitleStyle {
    Progressive,
    Classic,
}

/// Per-element subtitle overrides. Any field left unset falls back to the
/// engine's global defaults (see `config::SubtitleDefaults`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubtitleSettings {
    pub style: Option<SubtitleStyle>,
    pub font_family: Option<String>,
    pub font_size: Option<u32>,
    pub word_color: Option<String>,
    pub line_color: Option<String>,
    pub shadow_color: Option<String>,
    pub shadow_offset: Option<u32>,
    pub box_color: Option<String>,
    pub position: Option<Position>,
    pub outline_color: Option<String>,
    pub outline_width: Option<u32>,
}

/// The kind of a scene/background element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Audio,
    Video,
    Image,
    Subtitles,
}

/// A single piece of media or overlay within a scene or a project's
/// background elements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Element {
    #[serde(rename = "type")]
    pub kind: ElementType,
    pub src: Option<String>,
    pub x: Option<i32>,
    pub y: Option<i32>,
    #[serde(rename = "z-index")]
    pub z_index: Option<i32>,
    pub volume: Option<f64>,
    /// Filled in by the media probe during orchestration; `None` until then.
    pub duration: Option<f64>,
    pub settings: Option<SubtitleSettings>,
}

impl Element {
    pub fn requires_src(&self) -> bool {
        matches!(
            self.kind,
            ElementType::Audio | ElementType::Video | ElementType::Image
        )
    }
}

/// A time-contiguous segment of a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub elements: Vec<Element>,
}

impl Scene {
    /// The first audio element, which is the authoritative timing source.
    pub fn first_audio(&self) -> Option<&Element> {
        self.elements
            .iter()
            .find(|e| e.kind == ElementType::Audio)
    }

    pub fn first_audio_mut(&mut self) -> Option<&mut Element> {
        self.elements
            .iter_mut()
            .find(|e| e.kind == ElementType::Audio)
    }

    pub fn has_subtitles(&self) -> bool {
        self.elements
            .iter()
            .any(|e| e.kind == ElementType::Subtitles)
    }
}

/// A complete project: background elements plus an ordered list of scenes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Project {
    pub scenes: Vec<Scene>,
    #[serde(default)]
    pub elements: Vec<Element>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: Option<String>,
}

impl Project {
    pub fn has_subtitles(&self) -> bool {
        self.elements
            .iter()
            .any(|e| e.kind == ElementType::Subtitles)
            || self.scenes.iter().any(|s| s.has_subtitles())
    }
}

/// The root request: an ordered sequence of projects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig(pub Vec<Project>);

impl VideoConfig {
    pub fn projects(&self) -> &[Project] {
        &self.0
    }

    pub fn projects_mut(&mut self) -> &mut [Project] {
        &mut self.0
    }
}

/// `(sceneIndex, startTime, endTime, duration)` on the continuous,
/// absolute video timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingSegment {
    pub scene_index: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
}

/// One transcribed word with scene-relative timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTimestamp {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

/// A subtitle event in absolute video time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleEvent {
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
    pub scene_index: usize,
}

/// Job lifecycle state. Terminal states are sticky: no transition leaves
/// `Completed`, `Failed`, or `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// A video-generation job tracked by the engine.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    #[serde(skip)]
    pub config: VideoConfig,
    /// Progress percentage, 0.0..=100.0, monotone non-decreasing.
    pub progress: f32,
    pub video_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: String, config: VideoConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Pending,
            config,
            progress: 0.0,
            video_id: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// A finished video recorded in the content store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredVideo {
    pub id: String,
    pub filename: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

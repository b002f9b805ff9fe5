//! Subtitle Authoring (§4.5) — scene-timing mapping, progressive/classic
//! event generation, and settings validation.

use std::path::{Path, PathBuf};

use regex::Regex;
use tokio::io::AsyncWriteExt;

use crate::config::SubtitleDefaults;
use crate::error::{CoreError, CoreResult};
use crate::model::{Position, Scene, SubtitleSettings, SubtitleStyle, TimingSegment, WordTimestamp, SubtitleEvent};

/// Builds the timing segments for a sequence of scenes from their
/// authoritative audio durations, per the rule in §3/§4.5: scene
/// duration is the real audio file duration of the scene's first audio
/// element, not the transcription's reported speech duration.
pub fn build_timing_segments(scene_audio_durations: &[f64]) -> Vec<TimingSegment> {
    let mut segments = Vec::with_capacity(scene_audio_durations.len());
    let mut cursor = 0.0;
    for (i, &duration) in scene_audio_durations.iter().enumerate() {
        let start = cursor;
        let end = start + duration;
        segments.push(TimingSegment {
            scene_index: i,
            start_time: start,
            end_time: end,
            duration,
        });
        cursor = end;
    }
    segments
}

/// Repairs non-monotone word timestamps by clamping to the prior word's
/// end, and clamps any event past the scene end (§9 open question).
fn repair_and_clamp(words: &[WordTimestamp], scene_duration: f64) -> Vec<WordTimestamp> {
    let mut out = Vec::with_capacity(words.len());
    let mut prev_end = 0.0_f64;
    for w in words {
        let mut start = w.start.max(prev_end);
        let mut end = w.end.max(start);
        end = end.min(scene_duration);
        start = start.min(end);
        out.push(WordTimestamp {
            word: w.word.clone(),
            start,
            end,
        });
        prev_end = end;
    }
    out
}

/// Builds classic-style events: one event per whole transcription
/// segment (here, the single per-scene transcription is treated as one
/// segment spanning all its words), mapped to absolute time.
pub fn build_classic_events(
    words: &[WordTimestamp],
    segment: &TimingSegment,
) -> Vec<SubtitleEvent> {
    let repaired = repair_and_clamp(words, segment.duration);
    if repaired.is_empty() {
        return Vec::new();
    }
    let text = repaired
        .iter()
        .map(|w| w.word.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let start = repaired.first().unwrap().start;
    let end = repaired.last().unwrap().end;
    vec![SubtitleEvent {
        start_time: segment.start_time + start,
        end_time: segment.start_time + end,
        text,
        scene_index: segment.scene_index,
    }]
}

/// Builds progressive-style events: one event per word, each showing the
/// concatenation of the first `k` words of the line.
pub fn build_progressive_events(
    words: &[WordTimestamp],
    segment: &TimingSegment,
) -> Vec<SubtitleEvent> {
    let repaired = repair_and_clamp(words, segment.duration);
    let mut events = Vec::with_capacity(repaired.len());
    let mut accumulated: Vec<&str> = Vec::new();
    for w in &repaired {
        accumulated.push(w.word.as_str());
        events.push(SubtitleEvent {
            start_time: segment.start_time + w.start,
            end_time: segment.start_time + w.end,
            text: accumulated.join(" "),
            scene_index: segment.scene_index,
        });
    }
    events
}

pub fn build_events(
    style: SubtitleStyle,
    words: &[WordTimestamp],
    segment: &TimingSegment,
) -> Vec<SubtitleEvent> {
    match style {
        SubtitleStyle::Classic => build_classic_events(words, segment),
        SubtitleStyle::Progressive => build_progressive_events(words, segment),
    }
}

/// Merges per-element overrides over the global defaults.
pub fn merge_settings(defaults: &SubtitleDefaults, overrides: Option<&SubtitleSettings>) -> ResolvedSettings {
    let o = overrides;
    ResolvedSettings {
        style: o.and_then(|s| s.style).unwrap_or(defaults.style),
        font_family: o
            .and_then(|s| s.font_family.clone())
            .unwrap_or_else(|| defaults.font_family.clone()),
        font_size: o.and_then(|s| s.font_size).unwrap_or(defaults.font_size),
        word_color: o
            .and_then(|s| s.word_color.clone())
            .unwrap_or_else(|| defaults.colors.word.clone()),
        line_color: o.and_then(|s| s.line_color.clone()),
        shadow_color: o.and_then(|s| s.shadow_color.clone()),
        shadow_offset: o.and_then(|s| s.shadow_offset).unwrap_or(0),
        box_color: o.and_then(|s| s.box_color.clone()),
        position: o.and_then(|s| s.position).unwrap_or(defaults.position),
        outline_color: o
            .and_then(|s| s.outline_color.clone())
            .unwrap_or_else(|| defaults.colors.outline.clone()),
        outline_width: o.and_then(|s| s.outline_width).unwrap_or(2),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSettings {
    pub style: SubtitleStyle,
    pub font_family: String,
    pub font_size: u32,
    pub word_color: String,
    pub line_color: Option<String>,
    pub shadow_color: Option<String>,
    pub shadow_offset: u32,
    pub box_color: Option<String>,
    pub position: Position,
    pub outline_color: String,
    pub outline_width: u32,
}

/// Converts a validated `#RRGGBB` hex color to the ASS/libass `&HBBGGRR&`
/// form the `subtitles` filter's `force_style` option expects.
fn hex_to_ass_color(hex: &str) -> String {
    let r = &hex[1..3];
    let g = &hex[3..5];
    let b = &hex[5..7];
    format!("&H{b}{g}{r}&").to_uppercase()
}

/// Numpad-style ASS alignment code for a 3x3 grid position.
fn ass_alignment(position: Position) -> u8 {
    match position {
        Position::BottomLeft => 1,
        Position::BottomCenter => 2,
        Position::BottomRight => 3,
        Position::CenterLeft => 4,
        Position::Center => 5,
        Position::CenterRight => 6,
        Position::TopLeft => 7,
        Position::TopCenter => 8,
        Position::TopRight => 9,
    }
}

/// Renders a resolved settings block into an ffmpeg `force_style` value
/// for the `subtitles` filter, so every field a caller sets (§2 component
/// table, "style-format emission") actually reaches the encoded video
/// instead of being validated and discarded.
///
/// `line_color`, when set, maps to ASS `SecondaryColour` — the karaoke
/// "not yet highlighted" color, which is the natural fit for a
/// progressive-style line whose words light up one at a time.
pub fn force_style_string(settings: &ResolvedSettings) -> String {
    let mut parts = vec![
        format!("FontName={}", settings.font_family),
        format!("FontSize={}", settings.font_size),
        format!("PrimaryColour={}", hex_to_ass_color(&settings.word_color)),
        format!("OutlineColour={}", hex_to_ass_color(&settings.outline_color)),
        format!("Outline={}", settings.outline_width),
        format!("Alignment={}", ass_alignment(settings.position)),
    ];

    if let Some(line_color) = &settings.line_color {
        parts.push(format!("SecondaryColour={}", hex_to_ass_color(line_color)));
    }

    // BorderStyle=3 renders an opaque box behind the text (BackColour is
    // its fill); BorderStyle=1 is the default outline+shadow style, where
    // BackColour instead tints the drop shadow.
    if let Some(box_color) = &settings.box_color {
        parts.push("BorderStyle=3".to_string());
        parts.push(format!("BackColour={}", hex_to_ass_color(box_color)));
    } else if let Some(shadow_color) = &settings.shadow_color {
        parts.push("BorderStyle=1".to_string());
        parts.push(format!("BackColour={}", hex_to_ass_color(shadow_color)));
    }
    if settings.shadow_offset > 0 {
        parts.push(format!("Shadow={}", settings.shadow_offset));
    }

    parts.join(",")
}

static HEX_COLOR: once_cell::sync::Lazy<Regex> =
    once_cell::sync::Lazy::new(|| Regex::new(r"^#[0-9A-Fa-f]{6}$").unwrap());

fn validate_color(label: &str, value: &str) -> CoreResult<()> {
    if !HEX_COLOR.is_match(value) {
        return Err(CoreError::invalid_input(format!(
            "{label} must be a #RRGGBB hex color, got '{value}'"
        )));
    }
    Ok(())
}

/// Validates one `SubtitleSettings` block against the ranges in §3.
/// Called before any transcription work (§4.5).
pub fn validate_settings(settings: &SubtitleSettings) -> CoreResult<()> {
    if let Some(size) = settings.font_size {
        if !(6..=300).contains(&size) {
            return Err(CoreError::invalid_input(
                "font-size must be between 6 and 300",
            ));
        }
    }
    if let Some(width) = settings.outline_width {
        if width > 20 {
            return Err(CoreError::invalid_input(
                "outline-width must be between 0 and 20",
            ));
        }
    }
    if let Some(offset) = settings.shadow_offset {
        if offset > 20 {
            return Err(CoreError::invalid_input(
                "shadow-offset must be between 0 and 20",
            ));
        }
    }
    for (label, value) in [
        ("word-color", &settings.word_color),
        ("line-color", &settings.line_color),
        ("shadow-color", &settings.shadow_color),
        ("box-color", &settings.box_color),
        ("outline-color", &settings.outline_color),
    ] {
        if let Some(v) = value {
            validate_color(label, v)?;
        }
    }
    // `position` and `style` are closed Rust enums: an unrecognized value
    // fails at JSON-deserialization time, before this function ever runs.
    Ok(())
}

/// Validates every `SubtitleSettings` across every project/scene in a
/// config. Aborts job creation on the first violation (§4.5).
pub fn validate_all<'a>(scenes: impl Iterator<Item = &'a Scene>) -> CoreResult<()> {
    for scene in scenes {
        for element in &scene.elements {
            if let Some(settings) = &element.settings {
                validate_settings(settings)?;
            }
        }
    }
    Ok(())
}

/// Writes subtitle events to a temp file under `temp_dir`, using a
/// UUID-based filename so concurrent jobs never collide. Returns the
/// path and the number of events written.
pub async fn write_subtitle_file(
    temp_dir: &Path,
    events: &[SubtitleEvent],
) -> CoreResult<(PathBuf, usize)> {
    tokio::fs::create_dir_all(temp_dir)
        .await
        .map_err(|e| CoreError::internal(format!("failed to create temp dir: {e}")))?;

    let filename = format!("{}.srt", uuid::Uuid::new_v4());
    let path = temp_dir.join(filename);

    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| CoreError::internal(format!("failed to create subtitle file: {e}")))?;

    let mut contents = String::new();
    for (i, event) in events.iter().enumerate() {
        contents.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            format_srt_timestamp(event.start_time),
            format_srt_timestamp(event.end_time),
            event.text
        ));
    }

    file.write_all(contents.as_bytes())
        .await
        .map_err(|e| CoreError::internal(format!("failed to write subtitle file: {e}")))?;

    Ok((path, events.len()))
}

fn format_srt_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as i64;
    let ms = total_ms % 1000;
    let total_s = total_ms / 1000;
    let s = total_s % 60;
    let total_m = total_s / 60;
    let m = total_m % 60;
    let h = total_m / 60;
    format!("{h:02}:{m:02}:{s:02},{ms:03}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_segments_cover_timeline_without_gaps() {
        let segments = build_timing_segments(&[12.0, 30.0, 5.5]);
        assert_eq!(segments[0].start_time, 0.0);
        assert_eq!(segments[0].end_time, 12.0);
        assert_eq!(segments[1].start_time, 12.0);
        assert_eq!(segments[2].end_time, 47.5);
        let total: f64 = segments.iter().map(|s| s.duration).sum();
        assert_eq!(total, 47.5);
    }

    #[test]
    fn progressive_events_use_absolute_scene_offset() {
        let words = vec![
            WordTimestamp { word: "hello".into(), start: 0.0, end: 0.4 },
            WordTimestamp { word: "world".into(), start: 0.4, end: 0.9 },
        ];
        let segment = TimingSegment { scene_index: 0, start_time: 0.0, end_time: 30.0, duration: 30.0 };
        let events = build_progressive_events(&words, &segment);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].start_time, 0.0);
        assert_eq!(events[0].end_time, 0.4);
        assert_eq!(events[0].text, "hello");
        assert_eq!(events[1].start_time, 0.4);
        assert_eq!(events[1].end_time, 0.9);
        assert_eq!(events[1].text, "hello world");
    }

    #[test]
    fn progressive_events_with_scene_offset_shift_absolute_time() {
        let words = vec![WordTimestamp { word: "hi".into(), start: 1.0, end: 1.5 }];
        let segment = TimingSegment { scene_index: 1, start_time: 12.0, end_time: 20.0, duration: 8.0 };
        let events = build_progressive_events(&words, &segment);
        assert_eq!(events[0].start_time, 13.0);
        assert_eq!(events[0].end_time, 13.5);
    }

    #[test]
    fn non_monotone_words_are_clamped_to_prior_end() {
        let words = vec![
            WordTimestamp { word: "a".into(), start: 1.0, end: 2.0 },
            WordTimestamp { word: "b".into(), start: 1.5, end: 1.8 }, // goes backwards
        ];
        let segment = TimingSegment { scene_index: 0, start_time: 0.0, end_time: 10.0, duration: 10.0 };
        let events = build_progressive_events(&words, &segment);
        assert!(events[1].start_time >= events[0].end_time);
    }

    #[test]
    fn word_past_scene_end_is_clamped_not_dropped() {
        let words = vec![WordTimestamp { word: "late".into(), start: 9.5, end: 11.0 }];
        let segment = TimingSegment { scene_index: 0, start_time: 0.0, end_time: 10.0, duration: 10.0 };
        let events = build_progressive_events(&words, &segment);
        assert_eq!(events.len(), 1);
        assert!(events[0].end_time <= segment.end_time);
    }

    #[test]
    fn font_size_boundaries() {
        let mut s = SubtitleSettings::default();
        s.font_size = Some(5);
        assert!(validate_settings(&s).is_err());
        s.font_size = Some(6);
        assert!(validate_settings(&s).is_ok());
        s.font_size = Some(300);
        assert!(validate_settings(&s).is_ok());
        s.font_size = Some(301);
        assert!(validate_settings(&s).is_err());
    }

    #[test]
    fn outline_width_and_shadow_offset_boundaries() {
        let mut s = SubtitleSettings::default();
        s.outline_width = Some(20);
        assert!(validate_settings(&s).is_ok());
        s.outline_width = Some(21);
        assert!(validate_settings(&s).is_err());

        let mut s = SubtitleSettings::default();
        s.shadow_offset = Some(20);
        assert!(validate_settings(&s).is_ok());
        s.shadow_offset = Some(21);
        assert!(validate_settings(&s).is_err());
    }

    #[test]
    fn color_validation_rejects_short_and_named_and_rgb_forms() {
        let mut s = SubtitleSettings::default();
        s.word_color = Some("#FFF".to_string());
        assert!(validate_settings(&s).is_err());
        s.word_color = Some("rgb(255,0,0)".to_string());
        assert!(validate_settings(&s).is_err());
        s.word_color = Some("red".to_string());
        assert!(validate_settings(&s).is_err());
        s.word_color = Some("#ff0000".to_string());
        assert!(validate_settings(&s).is_ok());
        s.word_color = Some("#FF0000".to_string());
        assert!(validate_settings(&s).is_ok());
    }

    #[test]
    fn force_style_carries_font_color_and_alignment() {
        let settings = ResolvedSettings {
            style: SubtitleStyle::Progressive,
            font_family: "Arial".to_string(),
            font_size: 48,
            word_color: "#FFFFFF".to_string(),
            line_color: None,
            shadow_color: None,
            shadow_offset: 0,
            box_color: None,
            position: Position::BottomCenter,
            outline_color: "#000000".to_string(),
            outline_width: 2,
        };
        let style = force_style_string(&settings);
        assert!(style.contains("FontName=Arial"));
        assert!(style.contains("FontSize=48"));
        assert!(style.contains("PrimaryColour=&HFFFFFF&"));
        assert!(style.contains("Alignment=2"));
    }

    #[test]
    fn force_style_uses_box_color_over_shadow_color_when_both_set() {
        let settings = ResolvedSettings {
            style: SubtitleStyle::Classic,
            font_family: "Arial".to_string(),
            font_size: 24,
            word_color: "#FFFFFF".to_string(),
            line_color: Some("#00FF00".to_string()),
            shadow_color: Some("#111111".to_string()),
            shadow_offset: 3,
            box_color: Some("#222222".to_string()),
            position: Position::TopLeft,
            outline_color: "#000000".to_string(),
            outline_width: 1,
        };
        let style = force_style_string(&settings);
        assert!(style.contains("BorderStyle=3"));
        assert!(style.contains("SecondaryColour="));
        assert!(style.contains("Shadow=3"));
        assert!(style.contains("Alignment=7"));
    }

    #[tokio::test]
    async fn subtitle_file_is_written_under_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let events = vec![SubtitleEvent {
            start_time: 0.0,
            end_time: 1.0,
            text: "hi".into(),
            scene_index: 0,
        }];
        let (path, count) = write_subtitle_file(dir.path(), &events).await.unwrap();
        assert_eq!(count, 1);
        assert!(path.starts_with(dir.path()));
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains("hi"));
    }
}

//! Transcript export formatters over persisted segments.
//!
//! Supports JSON, SRT, VTT and plain text output.

use std::fmt::Write as FmtWrite;

use crate::db::SegmentRecord;

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Pretty-printed JSON
    Json,
    /// SubRip subtitle format
    Srt,
    /// WebVTT subtitle format
    Vtt,
    /// Plain text with timestamps
    Text,
}

impl ExportFormat {
    /// Get file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Srt => "srt",
            ExportFormat::Vtt => "vtt",
            ExportFormat::Text => "txt",
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "srt" => Ok(ExportFormat::Srt),
            "vtt" | "webvtt" => Ok(ExportFormat::Vtt),
            "txt" | "text" => Ok(ExportFormat::Text),
            _ => Err(format!("Unknown export format: {}. Use json, srt, vtt, or text", s)),
        }
    }
}

/// Render segments (already ordered by sequence) in the given format
pub fn render(segments: &[SegmentRecord], format: ExportFormat) -> String {
    match format {
        ExportFormat::Json => serde_json::to_string_pretty(segments).unwrap_or_default(),
        ExportFormat::Srt => to_srt(segments),
        ExportFormat::Vtt => to_vtt(segments),
        ExportFormat::Text => to_text(segments),
    }
}

fn to_srt(segments: &[SegmentRecord]) -> String {
    let mut output = String::new();

    for (i, segment) in segments.iter().enumerate() {
        let _ = writeln!(output, "{}", i + 1);
        let _ = writeln!(
            output,
            "{} --> {}",
            format_srt_time(segment.start_time),
            format_srt_time(segment.end_time)
        );
        match segment.speaker_name {
            Some(ref name) => {
                let _ = writeln!(output, "[{}] {}", name, segment.text());
            }
            None => {
                let _ = writeln!(output, "{}", segment.text());
            }
        }
        let _ = writeln!(output);
    }

    output
}

fn to_vtt(segments: &[SegmentRecord]) -> String {
    let mut output = String::from("WEBVTT\n\n");

    for (i, segment) in segments.iter().enumerate() {
        let _ = writeln!(output, "{}", i + 1);
        let _ = writeln!(
            output,
            "{} --> {}",
            format_vtt_time(segment.start_time),
            format_vtt_time(segment.end_time)
        );
        match segment.speaker_name {
            Some(ref name) => {
                let _ = writeln!(output, "<v {}>{}", name, segment.text());
            }
            None => {
                let _ = writeln!(output, "{}", segment.text());
            }
        }
        let _ = writeln!(output);
    }

    output
}

fn to_text(segments: &[SegmentRecord]) -> String {
    let mut output = String::new();

    for segment in segments {
        let timestamp = format_timestamp(segment.start_time);
        match segment.speaker_name {
            Some(ref name) => {
                let _ = writeln!(output, "[{}] {}: {}", timestamp, name, segment.text());
            }
            None => {
                let _ = writeln!(output, "[{}] {}", timestamp, segment.text());
            }
        }
    }

    output
}

fn split_ms(seconds: f64) -> (u64, u64, u64, u64) {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    let secs = total_secs % 60;
    let total_mins = total_secs / 60;
    (total_mins / 60, total_mins % 60, secs, ms)
}

/// Format time for SRT (HH:MM:SS,mmm)
fn format_srt_time(seconds: f64) -> String {
    let (hours, mins, secs, ms) = split_ms(seconds);
    format!("{:02}:{:02}:{:02},{:03}", hours, mins, secs, ms)
}

/// Format time for VTT (HH:MM:SS.mmm)
fn format_vtt_time(seconds: f64) -> String {
    let (hours, mins, secs, ms) = split_ms(seconds);
    format!("{:02}:{:02}:{:02}.{:03}", hours, mins, secs, ms)
}

/// Format timestamp for text output (MM:SS)
fn format_timestamp(seconds: f64) -> String {
    let total_secs = seconds.max(0.0) as u64;
    let secs = total_secs % 60;
    let mins = total_secs / 60;

    if mins >= 60 {
        format!("{:02}:{:02}:{:02}", mins / 60, mins % 60, secs)
    } else {
        format!("{:02}:{:02}", mins, secs)
    }
}

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Audio length assumed when transcription finds no speech at all.
pub const FALLBACK_AUDIO_DURATION: f64 = 52.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineTiming {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl LineTiming {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Rough speaking time of a line: a quarter second per word, never under a second.
pub fn line_weight(line: &str) -> f64 {
    f64::max(1.0, 0.25 * line.split_whitespace().count() as f64)
}

/// Spreads `total` seconds over `lines` in proportion to [`line_weight`]. Starts are the
/// running sum of earlier durations, so the last line ends at `total` (up to float drift).
pub fn allocate_line_timings<S: AsRef<str>>(total: f64, lines: &[S]) -> Vec<LineTiming> {
    let weights: Vec<f64> = lines.iter().map(|l| line_weight(l.as_ref())).collect();
    let total_weight: f64 = weights.iter().sum();
    if lines.is_empty() || total_weight <= 0.0 {
        return Vec::new();
    }
    let scale = total / total_weight;

    let mut last_end = 0.0;
    lines
        .iter()
        .zip(weights)
        .map(|(line, weight)| {
            let duration = weight * scale;
            let timing = LineTiming {
                start: last_end,
                end: last_end + duration,
                text: line.as_ref().to_string(),
            };
            last_end += duration;
            timing
        })
        .collect()
}

pub fn save_timings<T: Serialize>(path: &Path, timings: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(timings)?;
    fs::write(path, json).with_context(|| format!("Failed to write '{}'", path.display()))
}

pub fn load_timings<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read '{}'", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Malformed timestamps in '{}'", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoomDirection {
    In,
    Out,
}

impl ZoomDirection {
    /// Odd lines (1-based) zoom in, even lines zoom out.
    pub fn for_line(number: usize) -> Self {
        if number % 2 == 1 {
            ZoomDirection::In
        } else {
            ZoomDirection::Out
        }
    }

    /// Scale factor at `t` seconds into a clip of `duration` seconds, moving linearly
    /// between `1.0` and `1.0 + amount`.
    pub fn factor(self, t: f64, duration: f64, amount: f64) -> f64 {
        let progress = if duration > 0.0 {
            (t / duration).clamp(0.0, 1.0)
        } else {
            0.0
        };
        match self {
            ZoomDirection::In => 1.0 + amount * progress,
            ZoomDirection::Out => 1.0 + amount - amount * progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_cover_the_audio() {
        let lines = [
            "Did you know that octopuses have three hearts?",
            "Wow.",
            "Two of them pump blood to the gills, while the third pumps it to the rest of the body.",
        ];
        let timings = allocate_line_timings(41.3, &lines);

        let sum: f64 = timings.iter().map(LineTiming::duration).sum();
        assert!((sum - 41.3).abs() < 1e-9);
        assert!((timings.last().unwrap().end - 41.3).abs() < 1e-9);
        assert_eq!(timings[0].start, 0.0);
        for pair in timings.windows(2) {
            assert!(pair[0].start <= pair[1].start);
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn short_lines_get_the_one_second_floor() {
        assert_eq!(line_weight("Wow."), 1.0);
        assert_eq!(line_weight("one two three four"), 1.0);
        assert_eq!(line_weight("one two three four five six"), 1.5);
        assert_eq!(line_weight(""), 1.0);
    }

    #[test]
    fn durations_are_proportional_to_weights() {
        // 8 words -> 2.0, 4 words -> 1.0 (floor), 12 words -> 3.0
        let lines = [
            "a b c d e f g h",
            "a b c d",
            "a b c d e f g h i j k l",
        ];
        let timings = allocate_line_timings(12.0, &lines);
        let durations: Vec<f64> = timings.iter().map(LineTiming::duration).collect();
        assert!((durations[0] - 4.0).abs() < 1e-9);
        assert!((durations[1] - 2.0).abs() < 1e-9);
        assert!((durations[2] - 6.0).abs() < 1e-9);
    }

    #[test]
    fn halving_word_counts_keeps_relative_durations() {
        let long = ["w ".repeat(16), "w ".repeat(24)];
        let short = ["w ".repeat(8), "w ".repeat(12)];
        let a = allocate_line_timings(30.0, &long);
        let b = allocate_line_timings(30.0, &short);
        assert!((a[0].duration() - b[0].duration()).abs() < 1e-9);
        assert!((a[1].duration() - b[1].duration()).abs() < 1e-9);
    }

    #[test]
    fn no_lines_no_timings() {
        let lines: [&str; 0] = [];
        assert!(allocate_line_timings(10.0, &lines).is_empty());
    }

    #[test]
    fn zoom_alternates_and_interpolates() {
        assert_eq!(ZoomDirection::for_line(1), ZoomDirection::In);
        assert_eq!(ZoomDirection::for_line(2), ZoomDirection::Out);

        let zin = ZoomDirection::In;
        assert!((zin.factor(0.0, 4.0, 0.2) - 1.0).abs() < 1e-12);
        assert!((zin.factor(2.0, 4.0, 0.2) - 1.1).abs() < 1e-12);
        assert!((zin.factor(4.0, 4.0, 0.2) - 1.2).abs() < 1e-12);

        let zout = ZoomDirection::Out;
        assert!((zout.factor(0.0, 4.0, 0.2) - 1.2).abs() < 1e-12);
        assert!((zout.factor(4.0, 4.0, 0.2) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn timings_round_trip_through_json_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("Timestamps").join("timestamps.json");
        let timings = allocate_line_timings(10.0, &["Hello world.", "Bye."]);
        save_timings(&path, &timings).unwrap();
        let loaded: Vec<LineTiming> = load_timings(&path).unwrap();
        assert_eq!(loaded, timings);
    }
}

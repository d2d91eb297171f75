use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::RgbaImage;
use tracing::{info, warn};

use crate::config::{CaptionConfig, WhisperConfig};
use crate::media::{
    AudioSource, EncoderSettings, FrameEncoder, decode_frames, extract_audio, print_progress,
    probe_video,
};
use crate::renderer::{CaptionLayout, CaptionRenderer, blend_onto, resolve_font_path};
use crate::timeline::{load_timings, save_timings};
use crate::transcriber::{Transcriber, WordTiming};
use crate::workspace::Workspace;

/// A rendered caption and the time window it is shown in.
pub struct CaptionOverlay {
    pub start: f64,
    pub end: f64,
    pub image: RgbaImage,
}

impl CaptionOverlay {
    pub fn is_visible_at(&self, t: f64) -> bool {
        is_visible(self.start, self.end, t)
    }
}

/// Captions are shown on the half-open window `[start, end)`.
pub fn is_visible(start: f64, end: f64, t: f64) -> bool {
    start <= t && t < end
}

/// Caption text for a spoken word, or `None` for blanks.
pub fn caption_text(word: &str) -> Option<String> {
    let trimmed = word.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_uppercase())
    }
}

pub struct CaptionGenerator {
    config: CaptionConfig,
    whisper: WhisperConfig,
    preset: String,
    fonts_dir: PathBuf,
}

impl CaptionGenerator {
    pub fn new(
        config: CaptionConfig,
        whisper: WhisperConfig,
        preset: String,
        fonts_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            whisper,
            preset,
            fonts_dir,
        }
    }

    /// Transcribes `audio` and writes its word-level timestamps to `output`.
    pub fn generate_word_timestamps(
        &self,
        audio: &Path,
        output: &Path,
    ) -> Result<Option<PathBuf>> {
        if !audio.exists() {
            warn!("❌ Audio file not found: {}", audio.display());
            return Ok(None);
        }
        info!("⏳ Generating word-level timestamps...");
        let mut transcriber = Transcriber::load(self.whisper.word_model, &self.whisper)?;
        let words = transcriber.transcribe_words(audio)?.words;
        save_timings(output, &words)?;
        info!(words = words.len(), "✅ Word timestamps saved to {}", output.display());
        Ok(Some(output.to_path_buf()))
    }

    /// Burns the words from `timestamps` into `video`, writing `output` with the original audio.
    pub fn add_captions(
        &self,
        video: &Path,
        timestamps: &Path,
        output: &Path,
    ) -> Result<Option<PathBuf>> {
        if !video.exists() {
            warn!("❌ Video file not found: {}", video.display());
            return Ok(None);
        }
        if !timestamps.exists() {
            warn!("❌ Timestamps file not found: {}", timestamps.display());
            return Ok(None);
        }

        let words: Vec<WordTiming> = load_timings(timestamps)?;
        let info = probe_video(video)?;
        let layout = CaptionLayout::for_frame(info.width, info.height, &self.config);
        let font_path = resolve_font_path(&self.fonts_dir.join(&self.config.font_file))
            .ok_or_else(|| anyhow::anyhow!("No usable font found for captions"))?;
        let renderer = CaptionRenderer::new(&font_path, layout, &self.config)?;

        let overlays = build_overlays(&renderer, &words);
        info!(captions = overlays.len(), "🖌️ Rendering captions");

        let settings = EncoderSettings {
            width: info.width,
            height: info.height,
            fps: info.fps,
            preset: self.preset.clone(),
        };
        let mut encoder = FrameEncoder::spawn(&settings, AudioSource::TrackOf(video), output)?;
        let expected_frames = (info.duration * info.fps).ceil().max(1.0) as u64;
        let progress_step = (info.fps as u64).max(1);

        let (width, height) = (info.width, info.height);
        let mut done = 0u64;
        let frames = decode_frames(video, |timestamp, mut frame| {
            for overlay in overlays.iter().filter(|o| o.is_visible_at(timestamp)) {
                let (x, y) = renderer.position(&overlay.image, width, height);
                blend_onto(&mut frame, &overlay.image, x, y);
            }
            done += 1;
            if done % progress_step == 0 && done < expected_frames {
                print_progress("📝 Captioning:", done, expected_frames);
            }
            encoder.write_frame(&frame)
        })
        .with_context(|| format!("Failed to caption '{}'", video.display()))?;
        print_progress("📝 Captioning:", frames, frames);

        let output = encoder.finish()?;
        info!(frames, "✅ Captioned video saved to {}", output.display());
        Ok(Some(output))
    }

    /// Extracts the audio of `video`, aligns its words and writes the captioned copy.
    pub fn process_video(
        &self,
        workspace: &Workspace,
        video: &Path,
        topic: &str,
    ) -> Result<Option<PathBuf>> {
        if !video.exists() {
            warn!("❌ Video file not found: {}", video.display());
            return Ok(None);
        }
        let audio = workspace.temp_audio_file();
        extract_audio(video, &audio)?;

        let timestamps = workspace.word_timestamps_file();
        if self.generate_word_timestamps(&audio, &timestamps)?.is_none() {
            return Ok(None);
        }
        self.add_captions(video, &timestamps, &workspace.captioned_video_file(topic))
    }
}

fn build_overlays(renderer: &CaptionRenderer, words: &[WordTiming]) -> Vec<CaptionOverlay> {
    words
        .iter()
        .filter_map(|word| {
            let text = caption_text(&word.text)?;
            Some(CaptionOverlay {
                start: word.start,
                end: word.end,
                image: renderer.render_word(&text),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caption_is_visible_on_half_open_window() {
        assert!(is_visible(1.0, 1.5, 1.0));
        assert!(is_visible(1.0, 1.5, 1.2));
        assert!(!is_visible(1.0, 1.5, 0.9));
        assert!(!is_visible(1.0, 1.5, 1.5));
        assert!(!is_visible(1.0, 1.5, 1.6));
    }

    #[test]
    fn words_are_uppercased_and_blanks_dropped() {
        assert_eq!(caption_text(" octopus,"), Some("OCTOPUS,".to_string()));
        assert_eq!(caption_text("   "), None);
        assert_eq!(caption_text(""), None);
    }

    #[test]
    fn missing_inputs_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path());
        let generator = CaptionGenerator::new(
            CaptionConfig::default(),
            WhisperConfig::default(),
            "ultrafast".to_string(),
            ws.fonts_dir(),
        );

        let video = tmp.path().join("missing.mp4");
        let out = tmp.path().join("out.mp4");
        assert!(generator.process_video(&ws, &video, "topic").unwrap().is_none());
        assert!(
            generator
                .add_captions(&video, &ws.word_timestamps_file(), &out)
                .unwrap()
                .is_none()
        );
        let audio = tmp.path().join("missing.wav");
        assert!(
            generator
                .generate_word_timestamps(&audio, &ws.word_timestamps_file())
                .unwrap()
                .is_none()
        );
    }
}

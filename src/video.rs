use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use tracing::{info, warn};

use crate::config::{VideoConfig, WhisperConfig};
use crate::media::{AudioSource, EncoderSettings, FrameEncoder, print_progress};
use crate::script::load_script_lines;
use crate::timeline::{
    FALLBACK_AUDIO_DURATION, LineTiming, ZoomDirection, allocate_line_timings, save_timings,
};
use crate::transcriber::Transcriber;
use crate::workspace::Workspace;

/// One slideshow entry: a script line's image shown for that line's duration.
#[derive(Debug, Clone, PartialEq)]
pub struct SlideClip {
    pub line: usize,
    pub image: PathBuf,
    pub duration: f64,
    pub zoom: ZoomDirection,
}

/// Pairs line `n` with `image_{n}.jpg`. Lines without an image are dropped, so later images
/// move earlier in the video.
pub fn plan_clips(timings: &[LineTiming], workspace: &Workspace) -> Vec<SlideClip> {
    timings
        .iter()
        .enumerate()
        .filter_map(|(i, timing)| {
            let line = i + 1;
            let image = workspace.image_file(line);
            if !image.exists() {
                warn!(line, "no image for line, dropping clip");
                return None;
            }
            Some(SlideClip {
                line,
                image,
                duration: timing.duration(),
                zoom: ZoomDirection::for_line(line),
            })
        })
        .collect()
}

/// Scales `image` to cover `width`x`height` and crops the overflow evenly from both sides.
pub fn fit_to_frame(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    let (img_width, img_height) = image.dimensions();
    let scale_x = width as f32 / img_width as f32;
    let scale_y = height as f32 / img_height as f32;
    let scale = scale_x.max(scale_y);

    let new_width = ((img_width as f32 * scale).round() as u32).max(width);
    let new_height = ((img_height as f32 * scale).round() as u32).max(height);
    let resized = imageops::resize(image, new_width, new_height, FilterType::Lanczos3);

    let crop_x = (new_width - width) / 2;
    let crop_y = (new_height - height) / 2;
    imageops::crop_imm(&resized, crop_x, crop_y, width, height).to_image()
}

/// The frame seen when `base` is enlarged by `factor` and re-centered on its original size.
pub fn zoom_frame(base: &RgbImage, factor: f64) -> RgbImage {
    let (width, height) = base.dimensions();
    if factor <= 1.0 {
        return base.clone();
    }
    let view_width = ((width as f64 / factor).round() as u32).clamp(1, width);
    let view_height = ((height as f64 / factor).round() as u32).clamp(1, height);
    let x = (width - view_width) / 2;
    let y = (height - view_height) / 2;
    let view = imageops::crop_imm(base, x, y, view_width, view_height).to_image();
    imageops::resize(&view, width, height, FilterType::Triangle)
}

pub struct VideoGenerator {
    config: VideoConfig,
    whisper: WhisperConfig,
}

impl VideoGenerator {
    pub fn new(config: VideoConfig, whisper: WhisperConfig) -> Self {
        Self { config, whisper }
    }

    /// Spoken length of `audio`: end of the last transcribed segment.
    pub fn measure_audio(&self, audio: &Path) -> Result<f64> {
        info!("⏳ Transcribing audio and generating timestamps...");
        let mut transcriber = Transcriber::load(self.whisper.segment_model, &self.whisper)?;
        let transcript = transcriber.transcribe(audio)?;
        Ok(transcript.duration().unwrap_or_else(|| {
            warn!("no speech segments found, assuming {FALLBACK_AUDIO_DURATION}s");
            FALLBACK_AUDIO_DURATION
        }))
    }

    pub fn line_timings(&self, workspace: &Workspace) -> Result<Vec<LineTiming>> {
        let total = self.measure_audio(&workspace.speech_file())?;
        let lines = load_script_lines(workspace.script_file())?;
        let timings = allocate_line_timings(total, &lines);

        let path = workspace.line_timestamps_file();
        save_timings(&path, &timings)?;
        info!(path = %path.display(), lines = timings.len(), total, "✅ Timestamps saved");
        Ok(timings)
    }

    /// Builds `Video/{topic}.mp4` from the script, images and voiceover in `workspace`.
    pub fn generate(&self, workspace: &Workspace, topic: &str) -> Result<PathBuf> {
        let audio = workspace.speech_file();
        if !audio.exists() {
            anyhow::bail!("Voiceover not found: {}", audio.display());
        }
        let timings = self.line_timings(workspace)?;
        let clips = plan_clips(&timings, workspace);
        if clips.is_empty() {
            anyhow::bail!("No generated images found, nothing to put in the video");
        }

        std::fs::create_dir_all(workspace.video_dir())?;
        let output = workspace.video_file(topic);
        self.render(&clips, &audio, &output)?;
        info!("✅ Video successfully saved as '{}'", output.display());
        Ok(output)
    }

    /// Renders the clips back to back with their zoom and muxes `audio` in.
    pub fn render(&self, clips: &[SlideClip], audio: &Path, output: &Path) -> Result<()> {
        let Some(first) = clips.first() else {
            anyhow::bail!("No clips to render");
        };
        let (width, height) = (self.config.width, self.config.height);
        let fps = self.config.fps as f64;
        let total_duration: f64 = clips.iter().map(|c| c.duration).sum();
        let total_frames = (total_duration * fps).ceil() as u64;
        info!(
            "Duration: {:.2}s, FPS: {}, Total frames: {}",
            total_duration, fps, total_frames
        );

        let settings = EncoderSettings {
            width,
            height,
            fps,
            preset: self.config.preset.clone(),
        };
        let mut encoder = FrameEncoder::spawn(&settings, AudioSource::File(audio), output)?;

        let mut clip_index = 0;
        let mut clip_start = 0.0;
        let mut base = self.load_clip_image(first)?;
        for frame_num in 0..total_frames {
            let timestamp = frame_num as f64 / fps;
            while clip_index + 1 < clips.len()
                && timestamp >= clip_start + clips[clip_index].duration
            {
                clip_start += clips[clip_index].duration;
                clip_index += 1;
                base = self.load_clip_image(&clips[clip_index])?;
            }

            let clip = &clips[clip_index];
            let factor = clip
                .zoom
                .factor(timestamp - clip_start, clip.duration, self.config.zoom as f64);
            if !encoder.write_frame(&zoom_frame(&base, factor))? {
                break;
            }

            if frame_num % (fps as u64).max(1) == 0 || frame_num + 1 == total_frames {
                print_progress("🎬 Progress:", frame_num + 1, total_frames);
            }
        }

        encoder.finish()?;
        Ok(())
    }

    fn load_clip_image(&self, clip: &SlideClip) -> Result<RgbImage> {
        let image = image::open(&clip.image)
            .with_context(|| format!("Failed to load image '{}'", clip.image.display()))?
            .to_rgb8();
        Ok(fit_to_frame(&image, self.config.width, self.config.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn missing_image_drops_its_clip() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path());
        ws.ensure_dirs().unwrap();
        for n in [1, 2, 4, 5] {
            std::fs::write(ws.image_file(n), b"jpeg").unwrap();
        }
        let lines = ["One two.", "Three.", "Four five six.", "Seven.", "Eight nine."];
        let timings = allocate_line_timings(20.0, &lines);

        let clips = plan_clips(&timings, &ws);

        assert_eq!(clips.len(), 4);
        assert_eq!(
            clips.iter().map(|c| c.line).collect::<Vec<_>>(),
            vec![1, 2, 4, 5]
        );
        let total: f64 = clips.iter().map(|c| c.duration).sum();
        assert!(total <= 20.0 + 1e-9);
        // Zoom direction follows the line number, not the clip position.
        assert_eq!(clips[2].zoom, ZoomDirection::Out);
        assert_eq!(clips[3].zoom, ZoomDirection::In);
    }

    #[test]
    fn rendering_no_clips_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path().join("empty.mp4");
        let generator = VideoGenerator::new(VideoConfig::default(), WhisperConfig::default());

        let err = generator
            .render(&[], &tmp.path().join("speech.mp3"), &output)
            .unwrap_err();
        assert!(err.to_string().contains("No clips"));
        assert!(!output.exists());
    }

    #[test]
    fn fit_to_frame_covers_and_crops() {
        let wide = RgbImage::from_pixel(400, 100, Rgb([10, 20, 30]));
        let fitted = fit_to_frame(&wide, 72, 128);
        assert_eq!(fitted.dimensions(), (72, 128));
        assert_eq!(fitted.get_pixel(36, 64).0, [10, 20, 30]);
    }

    #[test]
    fn zoom_keeps_frame_size_and_center() {
        let mut base = RgbImage::from_pixel(100, 200, Rgb([0, 0, 0]));
        // Border that zooming should push out of view.
        for x in 0..100 {
            base.put_pixel(x, 0, Rgb([255, 0, 0]));
        }
        for y in 90..110 {
            for x in 40..60 {
                base.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }

        let zoomed = zoom_frame(&base, 1.2);
        assert_eq!(zoomed.dimensions(), (100, 200));
        assert_eq!(zoomed.get_pixel(50, 100).0, [255, 255, 255]);
        assert_eq!(zoomed.get_pixel(50, 0).0, [0, 0, 0]);

        assert_eq!(zoom_frame(&base, 1.0), base);
    }
}

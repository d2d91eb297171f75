//! ffmpeg plumbing: raw-frame encoding through the `ffmpeg` executable and frame decoding
//! through libav.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Once;

use anyhow::{Context, Result};
use ffmpeg_next::{self as ffmpeg, format, media, software};
use ffmpeg::util::frame::video::Video;
use image::RgbImage;
use tracing::{debug, info, warn};

pub fn check_ffmpeg_available() -> Result<()> {
    match Command::new("ffmpeg").args(["-version"]).output() {
        Ok(_) => Ok(()),
        Err(_) => anyhow::bail!(
            "FFmpeg not found! Please install FFmpeg:\n\
            Fedora: sudo dnf install ffmpeg\n\
            Ubuntu: sudo apt install ffmpeg\n\
            macOS: brew install ffmpeg"
        ),
    }
}

pub fn best_available_encoder() -> Result<String> {
    let output = Command::new("ffmpeg").args(["-encoders"]).output()?;
    let encoders_output = String::from_utf8_lossy(&output.stdout);
    pick_encoder(&encoders_output)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("No suitable video encoder found"))
}

fn pick_encoder(encoders_output: &str) -> Option<&'static str> {
    ["libx264", "mpeg4", "mpeg2video"]
        .into_iter()
        .find(|encoder| encoders_output.contains(encoder))
}

/// Writes the audio track of `input` as 16 kHz mono PCM WAV.
pub fn extract_audio(input: &Path, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let result = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(input)
        .args(["-vn", "-ac", "1", "-ar", "16000", "-c:a", "pcm_s16le"])
        .arg(output)
        .output()
        .context("Failed to run ffmpeg")?;
    if !result.status.success() {
        anyhow::bail!(
            "FFmpeg audio extraction failed: {}",
            String::from_utf8_lossy(&result.stderr)
        );
    }
    Ok(())
}

/// Where the audio of an encoded video comes from.
pub enum AudioSource<'a> {
    /// A standalone audio file.
    File(&'a Path),
    /// The audio stream of another media file, if it has one.
    TrackOf(&'a Path),
}

pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub preset: String,
}

/// An `ffmpeg` child reading raw RGB24 frames from stdin. Dropping it before `finish` kills
/// the child and removes the partial output.
pub struct FrameEncoder {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    output: PathBuf,
    frame_bytes: usize,
    frames: u64,
}

impl FrameEncoder {
    pub fn spawn(
        settings: &EncoderSettings,
        audio: AudioSource<'_>,
        output: &Path,
    ) -> Result<Self> {
        let output_str = output
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid output path"))?;
        if !output_str.ends_with(".mp4") {
            anyhow::bail!("Output file must have .mp4 extension, got: {}", output_str);
        }
        check_ffmpeg_available()?;
        let video_encoder = best_available_encoder()?;
        info!("✅ Using video encoder: {video_encoder}");

        let mut cmd = Command::new("ffmpeg");
        // stderr is only read at the end, keep it short.
        cmd.args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-y",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
            "-s",
            &format!("{}x{}", settings.width, settings.height),
            "-r",
            &settings.fps.to_string(),
            "-i",
            "pipe:0",
        ]);
        let audio_map = match audio {
            AudioSource::File(path) => {
                cmd.arg("-i").arg(path);
                "1:a:0"
            }
            AudioSource::TrackOf(path) => {
                cmd.arg("-i").arg(path);
                "1:a:0?"
            }
        };
        cmd.args(["-map", "0:v:0", "-map", audio_map, "-c:v", video_encoder.as_str()]);
        if video_encoder == "libx264" {
            cmd.args(["-preset", settings.preset.as_str()]);
        }
        cmd.args(["-c:a", "aac", "-pix_fmt", "yuv420p", "-shortest"])
            .arg(output);

        let child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to start ffmpeg")?;
        Ok(Self::attach(
            child,
            output,
            settings.width as usize * settings.height as usize * 3,
        ))
    }

    fn attach(mut child: Child, output: &Path, frame_bytes: usize) -> Self {
        let stdin = child.stdin.take();
        Self {
            child: Some(child),
            stdin,
            output: output.to_path_buf(),
            frame_bytes,
            frames: 0,
        }
    }

    /// Returns `false` once ffmpeg has stopped reading (it reached the end of the shortest
    /// stream).
    pub fn write_frame(&mut self, frame: &RgbImage) -> Result<bool> {
        let raw = frame.as_raw();
        if raw.len() != self.frame_bytes {
            anyhow::bail!(
                "frame is {}x{}, encoder expects {} bytes",
                frame.width(),
                frame.height(),
                self.frame_bytes
            );
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Failed to open FFmpeg stdin"))?;

        match stdin.write_all(raw) {
            Ok(()) => {
                self.frames += 1;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!("📺 FFmpeg finished processing after {} frames", self.frames);
                Ok(false)
            }
            Err(e) => {
                self.abort();
                anyhow::bail!("FFmpeg write failed: {}", e)
            }
        }
    }

    pub fn finish(mut self) -> Result<PathBuf> {
        // Closing stdin signals the end of the video stream.
        drop(self.stdin.take());
        let child = self
            .child
            .take()
            .ok_or_else(|| anyhow::anyhow!("FFmpeg was already stopped"))?;
        info!("🔄 Finalizing video...");
        let output = child.wait_with_output()?;
        if !output.status.success() {
            let _ = std::fs::remove_file(&self.output);
            anyhow::bail!("FFmpeg failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(self.output.clone())
    }

    /// Kills and reaps ffmpeg, then deletes whatever it had written.
    fn abort(&mut self) {
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return;
        };
        let _ = child.kill();
        let _ = child.wait();
        if std::fs::remove_file(&self.output).is_ok() {
            warn!(
                path = %self.output.display(),
                frames = self.frames,
                "removed unfinished video"
            );
        }
    }
}

impl Drop for FrameEncoder {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Redraws a one-line progress bar on stdout.
pub fn print_progress(label: &str, done: u64, total: u64) {
    let progress = if total == 0 {
        100.0
    } else {
        (done as f32 / total as f32) * 100.0
    };
    let bar_width = 40;
    let filled = ((progress / 100.0 * bar_width as f32) as usize).min(bar_width);
    print!(
        "\r{label} |{}{}| {:.1}% ({}/{} frames)",
        "█".repeat(filled),
        "░".repeat(bar_width - filled),
        progress,
        done,
        total
    );
    let _ = std::io::stdout().flush();
    if done >= total {
        println!();
    }
}

static INIT: Once = Once::new();

fn init() -> Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = ffmpeg::init();
    });
    Ok(result?)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Container duration in seconds, `0.0` when unknown.
    pub duration: f64,
}

fn frame_rate_of(stream: &format::stream::Stream) -> f64 {
    let rate = stream.avg_frame_rate();
    if rate.denominator() != 0 && rate.numerator() > 0 {
        f64::from(rate)
    } else {
        24.0
    }
}

/// Dimensions and frame rate of the best video stream of `input_path`.
pub fn probe_video(input_path: &Path) -> Result<VideoInfo> {
    init()?;
    let input = format::input(&input_path)
        .with_context(|| format!("Failed to open video '{}'", input_path.display()))?;
    let stream = input
        .streams()
        .best(media::Type::Video)
        .ok_or(ffmpeg::Error::StreamNotFound)?;
    let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?
        .decoder()
        .video()?;
    Ok(VideoInfo {
        width: decoder.width(),
        height: decoder.height(),
        fps: frame_rate_of(&stream),
        duration: (input.duration().max(0) as f64) / f64::from(ffmpeg::ffi::AV_TIME_BASE),
    })
}

/// Decodes every frame of the best video stream of `input_path` to RGB and hands it to
/// `on_frame` with its presentation time in seconds. Stops early when `on_frame` returns
/// `false`. Returns the number of frames delivered.
pub fn decode_frames<F>(input_path: &Path, mut on_frame: F) -> Result<u64>
where
    F: FnMut(f64, RgbImage) -> Result<bool>,
{
    init()?;
    let mut input = format::input(&input_path)
        .with_context(|| format!("Failed to open video '{}'", input_path.display()))?;
    let stream = input
        .streams()
        .best(media::Type::Video)
        .ok_or(ffmpeg::Error::StreamNotFound)?;
    let stream_index = stream.index();
    let time_base: f64 = stream.time_base().into();
    let fps = frame_rate_of(&stream);

    let mut decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?
        .decoder()
        .video()?;
    let mut scaler = software::scaling::context::Context::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        format::Pixel::RGB24,
        decoder.width(),
        decoder.height(),
        software::scaling::Flags::BILINEAR,
    )?;

    let mut delivered = 0u64;
    let mut receive_frames = |decoder: &mut ffmpeg::decoder::Video| -> Result<bool> {
        let mut decoded = Video::empty();
        while decoder.receive_frame(&mut decoded).is_ok() {
            let mut rgb_frame = Video::empty();
            scaler.run(&decoded, &mut rgb_frame)?;
            let timestamp = match decoded.timestamp() {
                Some(pts) => pts as f64 * time_base,
                None => delivered as f64 / fps,
            };
            delivered += 1;
            if !on_frame(timestamp, packed_rgb(&rgb_frame)?)? {
                return Ok(false);
            }
        }
        Ok(true)
    };

    let mut finished_early = false;
    for (stream, packet) in input.packets() {
        if stream.index() != stream_index {
            continue;
        }
        decoder.send_packet(&packet)?;
        if !receive_frames(&mut decoder)? {
            finished_early = true;
            break;
        }
    }
    if !finished_early {
        decoder.send_eof()?;
        receive_frames(&mut decoder)?;
    }

    Ok(delivered)
}

/// Copies an RGB24 frame into a tightly packed image, dropping row padding.
fn packed_rgb(frame: &Video) -> Result<RgbImage> {
    let (width, height) = (frame.width(), frame.height());
    let stride = frame.stride(0);
    let row_bytes = width as usize * 3;
    let data = frame.data(0);
    let mut packed = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        packed.extend_from_slice(&data[start..start + row_bytes]);
    }
    RgbImage::from_raw(width, height, packed)
        .ok_or_else(|| anyhow::anyhow!("Failed to create image buffer"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_x264() {
        let listing = " V....D mpeg4  MPEG-4 part 2\n V....D libx264  libx264 H.264\n";
        assert_eq!(pick_encoder(listing), Some("libx264"));
        assert_eq!(pick_encoder(" V....D mpeg2video MPEG-2"), Some("mpeg2video"));
        assert_eq!(pick_encoder("A..... aac"), None);
    }

    #[test]
    fn encoder_requires_mp4_output() {
        let settings = EncoderSettings {
            width: 4,
            height: 4,
            fps: 24.0,
            preset: "ultrafast".to_string(),
        };
        let err = FrameEncoder::spawn(
            &settings,
            AudioSource::File(Path::new("speech.mp3")),
            Path::new("out.mkv"),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains(".mp4"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn dropping_an_unfinished_encoder_reaps_the_child_and_removes_output() {
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path().join("partial.mp4");
        std::fs::write(&output, b"truncated").unwrap();

        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id();
        let encoder = FrameEncoder::attach(child, &output, 12);
        assert!(Path::new(&format!("/proc/{pid}")).exists());

        drop(encoder);
        assert!(!Path::new(&format!("/proc/{pid}")).exists());
        assert!(!output.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn finished_encoder_keeps_its_output() {
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path().join("done.mp4");
        std::fs::write(&output, b"video").unwrap();

        let child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let mut encoder = FrameEncoder::attach(child, &output, 12);
        assert!(encoder.write_frame(&RgbImage::new(2, 2)).unwrap());
        assert!(encoder.write_frame(&RgbImage::new(3, 3)).is_err());

        assert_eq!(encoder.finish().unwrap(), output);
        assert!(output.exists());
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::{CreateSpeechRequestArgs, SpeechModel, Voice};
use tracing::{debug, info};

use crate::config::{VoiceBackend, VoiceConfig};

/// Blocking text-to-speech: returns once the audio file is fully written.
pub trait SpeechSynthesizer {
    fn name(&self) -> &str;
    fn synthesize(&self, text: &str, output: &Path) -> Result<()>;
}

pub fn select_backend(config: &VoiceConfig) -> Result<Box<dyn SpeechSynthesizer>> {
    match config.backend {
        VoiceBackend::Edge => Ok(Box::new(EdgeTts::new(config))),
        VoiceBackend::OpenAi => Ok(Box::new(OpenAiSpeech::new(config)?)),
    }
}

/// Microsoft Edge neural voices through the `edge-tts` command-line tool.
pub struct EdgeTts {
    executable: String,
    voice: String,
    pitch: String,
    rate: String,
}

impl EdgeTts {
    pub fn new(config: &VoiceConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            voice: config.voice.clone(),
            pitch: config.pitch.clone(),
            rate: config.rate.clone(),
        }
    }

    fn args(&self, text: &str, output: &Path) -> Vec<String> {
        // Offsets may start with '-', so they must be attached with '='.
        vec![
            "--voice".to_string(),
            self.voice.clone(),
            format!("--pitch={}", self.pitch),
            format!("--rate={}", self.rate),
            "--text".to_string(),
            text.to_string(),
            "--write-media".to_string(),
            output.to_string_lossy().into_owned(),
        ]
    }
}

impl SpeechSynthesizer for EdgeTts {
    fn name(&self) -> &str {
        "edge"
    }

    fn synthesize(&self, text: &str, output: &Path) -> Result<()> {
        debug!(voice = %self.voice, pitch = %self.pitch, rate = %self.rate, "running edge-tts");
        let result = Command::new(&self.executable)
            .args(self.args(text, output))
            .output()
            .with_context(|| {
                format!(
                    "Failed to run '{}'. Install it with: pip install edge-tts",
                    self.executable
                )
            })?;

        if !result.status.success() {
            anyhow::bail!(
                "edge-tts failed: {}",
                String::from_utf8_lossy(&result.stderr)
            );
        }
        Ok(())
    }
}

/// OpenAI speech endpoint. The request is async; it is driven to completion on a private
/// current-thread runtime.
pub struct OpenAiSpeech {
    client: Client<OpenAIConfig>,
    model: SpeechModel,
    voice: Voice,
    speed: f32,
    timeout: Duration,
}

impl OpenAiSpeech {
    pub fn new(config: &VoiceConfig) -> Result<Self> {
        let api_key = config
            .openai_api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY not found. Check your .env file."))?;
        Ok(Self {
            client: Client::with_config(OpenAIConfig::new().with_api_key(api_key)),
            model: parse_speech_model(&config.openai_model),
            voice: parse_voice(&config.openai_voice)?,
            speed: config.openai_speed,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    async fn speak(&self, text: &str, output: &Path) -> Result<()> {
        let request = CreateSpeechRequestArgs::default()
            .input(text)
            .voice(self.voice.clone())
            .model(self.model.clone())
            .speed(self.speed)
            .build()?;

        let response =
            tokio::time::timeout(self.timeout, self.client.audio().speech(request)).await??;
        response.save(output).await?;
        Ok(())
    }
}

impl SpeechSynthesizer for OpenAiSpeech {
    fn name(&self) -> &str {
        "openai"
    }

    fn synthesize(&self, text: &str, output: &Path) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start async runtime")?;
        runtime.block_on(self.speak(text, output))
    }
}

fn parse_speech_model(name: &str) -> SpeechModel {
    match name {
        "tts-1" => SpeechModel::Tts1,
        "tts-1-hd" => SpeechModel::Tts1Hd,
        other => SpeechModel::Other(other.to_string()),
    }
}

fn parse_voice(name: &str) -> Result<Voice> {
    Ok(match name.to_ascii_lowercase().as_str() {
        "alloy" => Voice::Alloy,
        "echo" => Voice::Echo,
        "fable" => Voice::Fable,
        "onyx" => Voice::Onyx,
        "nova" => Voice::Nova,
        "shimmer" => Voice::Shimmer,
        other => anyhow::bail!("unknown OpenAI voice: {other}"),
    })
}

pub struct VoiceoverGenerator {
    synthesizer: Box<dyn SpeechSynthesizer>,
    output_path: PathBuf,
}

impl VoiceoverGenerator {
    pub fn new(synthesizer: Box<dyn SpeechSynthesizer>, output_path: PathBuf) -> Self {
        Self {
            synthesizer,
            output_path,
        }
    }

    /// Replaces any previous voiceover with a fresh synthesis of `text`.
    pub fn generate(&self, text: &str) -> Result<PathBuf> {
        if self.output_path.exists() {
            fs::remove_file(&self.output_path).with_context(|| {
                format!(
                    "Failed to remove old voiceover '{}'",
                    self.output_path.display()
                )
            })?;
        }
        if let Some(parent) = self.output_path.parent() {
            fs::create_dir_all(parent)?;
        }

        info!(backend = self.synthesizer.name(), "synthesizing voiceover");
        self.synthesizer.synthesize(text, &self.output_path)?;

        if !self.output_path.exists() {
            anyhow::bail!(
                "{} finished without writing '{}'",
                self.synthesizer.name(),
                self.output_path.display()
            );
        }
        info!(path = %self.output_path.display(), "voiceover saved");
        Ok(self.output_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct RecordingSynth {
        saw_old_file: Rc<Cell<Option<bool>>>,
        write: bool,
    }

    impl SpeechSynthesizer for RecordingSynth {
        fn name(&self) -> &str {
            "recording"
        }

        fn synthesize(&self, text: &str, output: &Path) -> Result<()> {
            self.saw_old_file.set(Some(output.exists()));
            if self.write {
                fs::write(output, text.as_bytes())?;
            }
            Ok(())
        }
    }

    #[test]
    fn old_voiceover_is_removed_before_synthesis() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("Speech").join("speech.mp3");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"stale").unwrap();

        let saw_old_file = Rc::new(Cell::new(None));
        let generator = VoiceoverGenerator::new(
            Box::new(RecordingSynth {
                saw_old_file: Rc::clone(&saw_old_file),
                write: true,
            }),
            path.clone(),
        );
        let written = generator.generate("fresh narration").unwrap();

        assert_eq!(saw_old_file.get(), Some(false));
        assert_eq!(written, path);
        assert_eq!(fs::read_to_string(&path).unwrap(), "fresh narration");
    }

    #[test]
    fn synthesizer_that_writes_nothing_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let synth = RecordingSynth {
            saw_old_file: Rc::new(Cell::new(None)),
            write: false,
        };
        let generator = VoiceoverGenerator::new(Box::new(synth), tmp.path().join("speech.mp3"));
        assert!(generator.generate("text").is_err());
    }

    #[test]
    fn edge_offsets_are_attached_with_equals() {
        let config = VoiceConfig {
            pitch: "-5Hz".to_string(),
            ..VoiceConfig::default()
        };
        let args = EdgeTts::new(&config).args("Hello there", Path::new("out.mp3"));
        assert!(args.contains(&"--pitch=-5Hz".to_string()));
        assert!(args.contains(&"--rate=+13%".to_string()));
        assert_eq!(args.last().unwrap(), "out.mp3");
    }

    #[test]
    fn openai_backend_requires_key() {
        let config = VoiceConfig {
            backend: VoiceBackend::OpenAi,
            ..VoiceConfig::default()
        };
        assert!(select_backend(&config).is_err());
    }

    #[test]
    fn unknown_openai_voice_is_rejected() {
        assert!(parse_voice("Nova").is_ok());
        assert!(parse_voice("robot").is_err());
    }
}

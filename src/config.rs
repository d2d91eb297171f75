use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub llm: LlmConfig,
    pub voice: VoiceConfig,
    pub images: ImageConfig,
    pub video: VideoConfig,
    pub captions: CaptionConfig,
    pub whisper: WhisperConfig,
}

impl AppConfig {
    pub fn load_or_default(config_path: Option<&Path>) -> Result<Self> {
        match config_path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file '{}' does not exist", path.display());
                }
                Self::from_file(path)
            }
            None => Ok(AppConfig::default()),
        }
    }

    fn from_file(path: &Path) -> Result<Self> {
        let file_content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        Self::from_toml(&file_content).with_context(|| {
            format!(
                "Failed to parse config file '{}' - check TOML syntax",
                path.display()
            )
        })
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Overlays secrets and the voice choice from the process environment (and `.env`).
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("GEMINI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(voice) = non_empty("AssistantVoice") {
            self.voice.voice = voice;
        }
        if let Some(key) = non_empty("OPENAI_API_KEY") {
            self.voice.openai_api_key = Some(key);
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory that holds `Data/` and `Video/`.
    pub root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            root: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub script_model: String,
    pub prompt_model: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            api_key: None,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            script_model: "gemini-1.5-pro".to_string(),
            prompt_model: "gemini-2.0-flash".to_string(),
            timeout_secs: 120,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoiceBackend {
    #[default]
    #[serde(rename = "edge")]
    Edge,
    #[serde(rename = "openai")]
    OpenAi,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct VoiceConfig {
    pub backend: VoiceBackend,
    pub voice: String,
    pub pitch: String,
    pub rate: String,
    pub executable: String,
    pub openai_model: String,
    pub openai_voice: String,
    pub openai_speed: f32,
    #[serde(skip_serializing)]
    pub openai_api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        VoiceConfig {
            backend: VoiceBackend::default(),
            voice: "en-US-ChristopherNeural".to_string(),
            pitch: "+5Hz".to_string(),
            rate: "+13%".to_string(),
            executable: "edge-tts".to_string(),
            openai_model: "tts-1-hd".to_string(),
            openai_voice: "nova".to_string(),
            openai_speed: 1.13,
            openai_api_key: None,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ImageConfig {
    pub base_url: String,
    pub width: u32,
    pub height: u32,
    pub seed: u64,
    pub model: String,
    pub timeout_secs: u64,
    pub delay_ms: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        ImageConfig {
            base_url: "https://pollinations.ai/p".to_string(),
            width: 720,
            height: 1280,
            seed: 42,
            model: "flux".to_string(),
            timeout_secs: 35,
            delay_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u16,
    pub zoom: f32,
    pub preset: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        VideoConfig {
            width: 720,
            height: 1280,
            fps: 24,
            zoom: 0.2,
            preset: "ultrafast".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CaptionConfig {
    /// Looked up inside `Data/Fonts`; a system font is used when it is missing.
    pub font_file: String,
    pub font_scale: f32,
    pub padding_x: f32,
    pub padding_top: f32,
    pub padding_bottom: f32,
    pub text_color: String,
    pub background_color: String,
    pub bottom_offset: u32,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        CaptionConfig {
            font_file: "arial.ttf".to_string(),
            font_scale: 0.04,
            padding_x: 0.02,
            padding_top: 0.01,
            padding_bottom: 0.02,
            text_color: "#FFFFFF".to_string(),
            background_color: "#000000C8".to_string(),
            bottom_offset: 300,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct WhisperConfig {
    /// Model used to measure the voiceover length.
    pub segment_model: WhisperModel,
    /// Model used for word-level caption timing.
    pub word_model: WhisperModel,
    pub language: String,
    pub cpu: bool,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        WhisperConfig {
            segment_model: WhisperModel::Small,
            word_model: WhisperModel::Small,
            language: "en".to_string(),
            cpu: false,
        }
    }
}

impl WhisperConfig {
    pub fn is_english(&self) -> bool {
        self.language.eq_ignore_ascii_case("en") || self.language.eq_ignore_ascii_case("english")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhisperModel {
    #[serde(rename = "tiny")]
    Tiny,
    #[serde(rename = "base")]
    Base,
    #[serde(rename = "small")]
    Small,
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "large-v2")]
    LargeV2,
}

impl WhisperModel {
    /// English-only checkpoints are used when transcribing English, except for large-v2
    /// which has no `.en` variant.
    pub fn model_and_revision(&self, english: bool) -> (&'static str, &'static str) {
        if english {
            match self {
                Self::Tiny => ("openai/whisper-tiny.en", "refs/pr/15"),
                Self::Base => ("openai/whisper-base.en", "refs/pr/13"),
                Self::Small => ("openai/whisper-small.en", "refs/pr/10"),
                Self::Medium => ("openai/whisper-medium.en", "main"),
                Self::LargeV2 => ("openai/whisper-large-v2", "refs/pr/57"),
            }
        } else {
            match self {
                Self::Tiny => ("openai/whisper-tiny", "main"),
                Self::Base => ("openai/whisper-base", "refs/pr/22"),
                Self::Small => ("openai/whisper-small", "main"),
                Self::Medium => ("openai/whisper-medium", "main"),
                Self::LargeV2 => ("openai/whisper-large-v2", "refs/pr/57"),
            }
        }
    }

    pub fn is_multilingual_checkpoint(&self, english: bool) -> bool {
        !english || matches!(self, Self::LargeV2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [video]
            fps = 30

            [whisper]
            word_model = "large-v2"
            "#,
        )
        .unwrap();

        assert_eq!(config.video.fps, 30);
        assert_eq!(config.video.width, 720);
        assert_eq!(config.whisper.word_model, WhisperModel::LargeV2);
        assert_eq!(config.whisper.segment_model, WhisperModel::Small);
        assert_eq!(config.images.seed, 42);
        assert_eq!(config.voice.backend, VoiceBackend::Edge);
    }

    #[test]
    fn env_overrides_secrets_and_voice() {
        let mut config = AppConfig::default();
        config.apply_env_from(|key| match key {
            "GEMINI_API_KEY" => Some("gem-key".to_string()),
            "AssistantVoice" => Some("en-GB-RyanNeural".to_string()),
            "OPENAI_API_KEY" => Some("  ".to_string()),
            _ => None,
        });

        assert_eq!(config.llm.api_key.as_deref(), Some("gem-key"));
        assert_eq!(config.voice.voice, "en-GB-RyanNeural");
        assert!(config.voice.openai_api_key.is_none());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = AppConfig::load_or_default(Some(Path::new("/nonexistent/autoshorts.toml")))
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn english_large_model_uses_multilingual_checkpoint() {
        assert_eq!(
            WhisperModel::Small.model_and_revision(true).0,
            "openai/whisper-small.en"
        );
        assert!(WhisperModel::LargeV2.is_multilingual_checkpoint(true));
        assert!(!WhisperModel::Base.is_multilingual_checkpoint(true));
    }
}

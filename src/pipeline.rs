use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::captions::CaptionGenerator;
use crate::config::AppConfig;
use crate::images::{ImageGenerator, ImageReport, PollinationsSource};
use crate::llm::GeminiClient;
use crate::script::ScriptGenerator;
use crate::video::VideoGenerator;
use crate::voiceover::{VoiceoverGenerator, select_backend};
use crate::workspace::Workspace;

/// Runs the stages of a short, either one at a time or end to end. Components are built on
/// demand so that a single stage only needs the credentials it uses.
pub struct Pipeline {
    config: AppConfig,
    workspace: Workspace,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Self {
        let workspace = Workspace::new(&config.paths.root);
        Self { config, workspace }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn script_generator(&self) -> Result<ScriptGenerator> {
        let model = GeminiClient::new(&self.config.llm, &self.config.llm.script_model)?;
        Ok(ScriptGenerator::new(
            Box::new(model),
            self.workspace.script_file(),
        ))
    }

    pub fn voiceover_generator(&self) -> Result<VoiceoverGenerator> {
        let synthesizer = select_backend(&self.config.voice)?;
        Ok(VoiceoverGenerator::new(
            synthesizer,
            self.workspace.speech_file(),
        ))
    }

    pub fn image_generator(&self) -> Result<ImageGenerator> {
        let model = GeminiClient::new(&self.config.llm, &self.config.llm.prompt_model)?;
        let source = PollinationsSource::new(&self.config.images)?;
        Ok(ImageGenerator::new(
            Box::new(model),
            Box::new(source),
            Duration::from_millis(self.config.images.delay_ms),
        ))
    }

    pub fn video_generator(&self) -> VideoGenerator {
        VideoGenerator::new(self.config.video.clone(), self.config.whisper.clone())
    }

    pub fn caption_generator(&self) -> CaptionGenerator {
        CaptionGenerator::new(
            self.config.captions.clone(),
            self.config.whisper.clone(),
            self.config.video.preset.clone(),
            self.workspace.fonts_dir(),
        )
    }

    /// Generates the script for `topic`, stores it one sentence per line and returns the raw
    /// text.
    pub fn write_script(&self, topic: &str) -> Result<String> {
        self.workspace.ensure_dirs()?;
        let generator = self.script_generator()?;
        let script = generator.generate(topic)?;
        generator.save_formatted(&script)?;
        Ok(script)
    }

    /// Voices the stored script.
    pub fn record_voiceover(&self) -> Result<PathBuf> {
        let script_path = self.workspace.script_file();
        let script = fs::read_to_string(&script_path)
            .with_context(|| format!("Script not found: {}", script_path.display()))?;
        self.voiceover_generator()?.generate(&script)
    }

    pub fn create_images(&self) -> Result<ImageReport> {
        self.image_generator()?.generate_images(&self.workspace)
    }

    pub fn create_video(&self, topic: &str) -> Result<PathBuf> {
        self.video_generator().generate(&self.workspace, topic)
    }

    pub fn add_captions(&self, topic: &str) -> Result<Option<PathBuf>> {
        let video = self.workspace.video_file(topic);
        self.caption_generator()
            .process_video(&self.workspace, &video, topic)
    }

    /// The full run: clean up, write and voice the script, illustrate it, cut the video and
    /// caption it. The first failing stage ends the run.
    pub fn run(&self, topic: &str) -> Result<Option<PathBuf>> {
        info!(topic, root = %self.workspace.root().display(), "starting pipeline");
        self.workspace.clear_old_files()?;
        self.workspace.ensure_dirs()?;

        println!("📝 Generating script...");
        let script_generator = self.script_generator()?;
        let script = script_generator.generate(topic)?;

        println!("🎙️ Generating voiceover...");
        self.voiceover_generator()?.generate(&script)?;

        println!("✂️ Formatting script...");
        script_generator.save_formatted(&script)?;

        println!("🖼️ Generating images...");
        let report = self.create_images()?;
        println!("   {}/{} images saved", report.saved, report.requested);

        println!("🎬 Creating video...");
        let video = self.create_video(topic)?;

        println!("💬 Adding captions...");
        let captioned = self
            .caption_generator()
            .process_video(&self.workspace, &video, topic)?;
        Ok(captioned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline_in(root: &std::path::Path) -> Pipeline {
        let mut config = AppConfig::default();
        config.paths.root = root.to_path_buf();
        Pipeline::new(config)
    }

    #[test]
    fn workspace_follows_configured_root() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline_in(tmp.path());
        assert_eq!(pipeline.workspace().root(), tmp.path());
    }

    #[test]
    fn stages_needing_gemini_fail_without_key() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline_in(tmp.path());
        assert!(pipeline.script_generator().is_err());
        assert!(pipeline.image_generator().is_err());
    }

    #[test]
    fn voiceover_needs_a_script() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline_in(tmp.path());
        let err = pipeline.record_voiceover().unwrap_err();
        assert!(err.to_string().contains("Script not found"));
    }

    #[test]
    fn captions_skip_missing_video() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline_in(tmp.path());
        assert!(pipeline.add_captions("octopus").unwrap().is_none());
    }
}

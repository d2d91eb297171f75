use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ImageConfig;
use crate::llm::LanguageModel;
use crate::script::load_script_lines;
use crate::workspace::Workspace;

pub const IMAGE_PROMPT_INSTRUCTION: &str = "You are an AI prompt generator. Generate detailed AI \
image prompts based on the given text scene. Only generate one prompt in a paragraph.";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("image service answered with status {0}")]
    Status(u16),
    #[error("image request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("failed to save image: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that turns a text prompt into encoded image bytes.
pub trait ImageSource {
    fn fetch(&self, prompt: &str) -> Result<Vec<u8>, FetchError>;
}

/// Pollinations: `GET {base}/{prompt}?width=..&height=..&seed=..&model=..`.
pub struct PollinationsSource {
    client: Client,
    base_url: String,
    width: u32,
    height: u32,
    seed: u64,
    model: String,
}

impl PollinationsSource {
    pub fn new(config: &ImageConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            width: config.width,
            height: config.height,
            seed: config.seed,
            model: config.model.clone(),
        })
    }

    fn url_for(&self, prompt: &str) -> String {
        format!("{}/{}", self.base_url, urlencoding::encode(prompt))
    }
}

impl ImageSource for PollinationsSource {
    fn fetch(&self, prompt: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(self.url_for(prompt))
            .query(&[
                ("width", self.width.to_string()),
                ("height", self.height.to_string()),
                ("seed", self.seed.to_string()),
                ("model", self.model.clone()),
            ])
            .send()?;

        if response.status() != StatusCode::OK {
            return Err(FetchError::Status(response.status().as_u16()));
        }
        Ok(response.bytes()?.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageReport {
    pub requested: usize,
    pub saved: usize,
}

pub struct ImageGenerator {
    model: Box<dyn LanguageModel>,
    source: Box<dyn ImageSource>,
    delay: Duration,
}

impl ImageGenerator {
    pub fn new(
        model: Box<dyn LanguageModel>,
        source: Box<dyn ImageSource>,
        delay: Duration,
    ) -> Self {
        Self {
            model,
            source,
            delay,
        }
    }

    pub fn prompt_for_scene(&self, scene: &str) -> Result<String> {
        let prompt = self
            .model
            .generate(IMAGE_PROMPT_INSTRUCTION, &format!("Scene: {scene}"))?;
        Ok(prompt.trim().to_string())
    }

    /// One image per script line, saved as `image_{n}.jpg`. Failed downloads leave a gap in
    /// the numbering; prompt generation failures abort.
    pub fn generate_images(&self, workspace: &Workspace) -> Result<ImageReport> {
        let lines = load_script_lines(workspace.script_file())?;
        fs::create_dir_all(workspace.images_dir())?;

        let total = lines.len();
        let mut saved = 0;
        for (i, line) in lines.iter().enumerate() {
            let number = i + 1;
            info!("generating prompt for line {number}/{total}");
            let prompt = self.prompt_for_scene(line)?;
            info!(number, %prompt, "image prompt");

            let target = workspace.image_file(number);
            match self.download(&prompt, &target) {
                Ok(()) => {
                    saved += 1;
                    info!(number, path = %target.display(), "image saved");
                }
                Err(e) => warn!(number, error = %e, "skipping image"),
            }

            if number < total && !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
        }

        Ok(ImageReport {
            requested: total,
            saved,
        })
    }

    fn download(&self, prompt: &str, target: &Path) -> Result<(), FetchError> {
        let bytes = self.source.fetch(prompt)?;
        fs::write(target, bytes)?;
        Ok(())
    }
}

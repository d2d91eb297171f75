use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{info, warn};

use crate::llm::LanguageModel;

pub const SCRIPT_INSTRUCTION: &str = "You are a professional script writer. You are given a topic and must \
generate a professional script on that topic for a YouTube short about 45 seconds long. Make the \
script engaging, start with a hook, build curiosity, and provide only the script in plain text \
without any additional instructions such as visual directions, camera notes, sound cues like \
(Roaring sound), (Beat) or (pause), or speaker labels. Give only the script, make it 45 seconds \
long and finish the topic within this video. Do not announce a second part, and use easy English \
without hard words.";

static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]\s+").expect("valid sentence regex"));

pub struct ScriptGenerator {
    model: Box<dyn LanguageModel>,
    script_path: PathBuf,
}

impl ScriptGenerator {
    pub fn new(model: Box<dyn LanguageModel>, script_path: PathBuf) -> Self {
        Self { model, script_path }
    }

    /// Asks the model for a script on `topic` and stores the raw reply.
    pub fn generate(&self, topic: &str) -> Result<String> {
        info!(topic, "generating script");
        let script = self.model.generate(SCRIPT_INSTRUCTION, topic)?;
        write_text(&self.script_path, &script)?;
        Ok(script)
    }

    /// Rewrites the script file with one sentence per line.
    pub fn save_formatted(&self, script: &str) -> Result<()> {
        let formatted = format_script(script);
        write_text(&self.script_path, &formatted)?;
        info!(
            path = %self.script_path.display(),
            lines = formatted.lines().count(),
            "formatted script saved"
        );
        Ok(())
    }
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, text).with_context(|| format!("Failed to write '{}'", path.display()))
}

/// Splits after `.`, `!` or `?` followed by whitespace. Whitespace inside a sentence is
/// collapsed so every sentence occupies exactly one line.
pub fn format_script(text: &str) -> String {
    let mut sentences = Vec::new();
    let mut last = 0;
    for m in SENTENCE_END.find_iter(text) {
        // The punctuation is a single byte, keep it with its sentence.
        sentences.push(&text[last..m.start() + 1]);
        last = m.end();
    }
    sentences.push(&text[last..]);

    sentences
        .into_iter()
        .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Trimmed, non-empty lines of the script. A missing script yields no lines.
pub fn load_script_lines<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "script file not found");
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read script '{}'", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

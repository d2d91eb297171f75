use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Fixed working-directory layout shared by every stage.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Workspace {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join("Data").join("Scripts")
    }

    pub fn speech_dir(&self) -> PathBuf {
        self.root.join("Data").join("Speech")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("Data").join("Generated_Images")
    }

    pub fn timestamps_dir(&self) -> PathBuf {
        self.root.join("Data").join("Timestamps")
    }

    pub fn fonts_dir(&self) -> PathBuf {
        self.root.join("Data").join("Fonts")
    }

    pub fn video_dir(&self) -> PathBuf {
        self.root.join("Video")
    }

    pub fn script_file(&self) -> PathBuf {
        self.scripts_dir().join("script.txt")
    }

    pub fn speech_file(&self) -> PathBuf {
        self.speech_dir().join("speech.mp3")
    }

    pub fn temp_audio_file(&self) -> PathBuf {
        self.speech_dir().join("temp_audio.wav")
    }

    /// `index` is the 1-based script line number.
    pub fn image_file(&self, index: usize) -> PathBuf {
        self.images_dir().join(format!("image_{index}.jpg"))
    }

    pub fn line_timestamps_file(&self) -> PathBuf {
        self.timestamps_dir().join("timestamps.json")
    }

    pub fn word_timestamps_file(&self) -> PathBuf {
        self.timestamps_dir().join("word_level_timestamps.json")
    }

    pub fn video_file(&self, topic: &str) -> PathBuf {
        self.video_dir()
            .join(format!("{}.mp4", sanitize_file_stem(topic)))
    }

    pub fn captioned_video_file(&self, topic: &str) -> PathBuf {
        self.video_dir()
            .join(format!("{}_captioned.mp4", sanitize_file_stem(topic)))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.scripts_dir(),
            self.speech_dir(),
            self.images_dir(),
            self.timestamps_dir(),
            self.fonts_dir(),
            self.video_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory '{}'", dir.display()))?;
        }
        Ok(())
    }

    pub fn cleanup_dirs(&self) -> [PathBuf; 3] {
        [self.scripts_dir(), self.images_dir(), self.speech_dir()]
    }

    /// Empties the per-run directories. The directories themselves stay in place; entries
    /// that cannot be removed are logged and skipped.
    pub fn clear_old_files(&self) -> Result<()> {
        for dir in self.cleanup_dirs() {
            if !dir.exists() {
                continue;
            }
            let entries = fs::read_dir(&dir)
                .with_context(|| format!("Failed to list '{}'", dir.display()))?;
            for entry in entries {
                let path = match entry {
                    Ok(entry) => entry.path(),
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "unreadable directory entry");
                        continue;
                    }
                };
                if let Err(e) = remove_entry(&path) {
                    warn!(path = %path.display(), error = %e, "failed to delete old file");
                } else {
                    debug!(path = %path.display(), "deleted");
                }
            }
        }
        Ok(())
    }
}

fn remove_entry(path: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Makes a topic usable as a file name: path separators and reserved characters become `_`.
pub fn sanitize_file_stem(topic: &str) -> String {
    let cleaned: String = topic
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').trim();

    if cleaned.is_empty() {
        "output".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_files_are_numbered_from_one() {
        let ws = Workspace::new("/tmp/work");
        assert_eq!(
            ws.image_file(1),
            PathBuf::from("/tmp/work/Data/Generated_Images/image_1.jpg")
        );
    }

    #[test]
    fn topics_become_safe_file_names() {
        assert_eq!(sanitize_file_stem("Black holes"), "Black holes");
        assert_eq!(sanitize_file_stem("cats/dogs?"), "cats_dogs_");
        assert_eq!(sanitize_file_stem("  ..  "), "output");
        assert_eq!(sanitize_file_stem("../etc"), "_etc");
    }

    #[test]
    fn clear_old_files_keeps_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path());
        ws.ensure_dirs().unwrap();

        fs::write(ws.script_file(), "old script").unwrap();
        fs::write(ws.image_file(1), b"jpeg").unwrap();
        fs::create_dir_all(ws.speech_dir().join("nested")).unwrap();
        fs::write(ws.speech_dir().join("nested").join("x.mp3"), b"mp3").unwrap();
        fs::write(ws.line_timestamps_file(), "[]").unwrap();

        ws.clear_old_files().unwrap();

        for dir in ws.cleanup_dirs() {
            assert!(dir.is_dir(), "{} should still exist", dir.display());
            assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        }
        // Timestamps are not part of the cleanup set.
        assert!(ws.line_timestamps_file().exists());
    }

    #[test]
    fn clear_old_files_tolerates_missing_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path().join("fresh"));
        ws.clear_old_files().unwrap();
    }
}

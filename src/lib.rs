pub mod audio;
pub mod captions;
pub mod cli;
pub mod config;
pub mod images;
pub mod llm;
pub mod media;
pub mod pipeline;
pub mod renderer;
pub mod script;
pub mod timeline;
pub mod transcriber;
pub mod video;
pub mod voiceover;
pub mod whisper;
pub mod workspace;

pub use cli::{Cli, Command};
pub use config::AppConfig;
pub use pipeline::Pipeline;
pub use workspace::Workspace;

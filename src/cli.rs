use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, about = "Turns a topic into a captioned vertical short", long_about = None)]
pub struct Cli {
    /// Sets a custom config file
    #[arg(long, value_name = "CONFIG FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Topic of the short; asked for on stdin when omitted
    #[arg(short, long, value_name = "TOPIC")]
    pub topic: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate and format the script only
    Script {
        #[arg(short, long, value_name = "TOPIC")]
        topic: Option<String>,
    },
    /// Voice the stored script
    Voiceover,
    /// Generate one image per script line
    Images,
    /// Build the slideshow video from the stored script, images and voiceover
    Video {
        #[arg(short, long, value_name = "TOPIC")]
        topic: Option<String>,
    },
    /// Caption an existing video
    Captions {
        #[arg(short, long, value_name = "TOPIC")]
        topic: Option<String>,
    },
}

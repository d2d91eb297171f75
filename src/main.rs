use std::io::{self, BufRead, Write};

use anyhow::Result;
use autoshorts::{AppConfig, Cli, Command, Pipeline};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("❌ Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    // A missing .env is fine; the variables may come from the environment.
    let _ = dotenvy::dotenv();

    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_env();
    let pipeline = Pipeline::new(config);

    match cli.command {
        None => {
            let topic = topic_or_prompt(cli.topic)?;
            match pipeline.run(&topic)? {
                Some(path) => println!("\n🎉 Short complete: {}", path.display()),
                None => println!("\n⚠️ Video created, captions skipped"),
            }
        }
        Some(Command::Script { topic }) => {
            let topic = topic_or_prompt(topic.or(cli.topic))?;
            pipeline.write_script(&topic)?;
            println!(
                "✅ Script saved to {}",
                pipeline.workspace().script_file().display()
            );
        }
        Some(Command::Voiceover) => {
            let path = pipeline.record_voiceover()?;
            println!("✅ Voiceover saved to {}", path.display());
        }
        Some(Command::Images) => {
            let report = pipeline.create_images()?;
            println!(
                "✅ {}/{} images saved to {}",
                report.saved,
                report.requested,
                pipeline.workspace().images_dir().display()
            );
        }
        Some(Command::Video { topic }) => {
            let topic = topic_or_prompt(topic.or(cli.topic))?;
            let path = pipeline.create_video(&topic)?;
            println!("✅ Video saved to {}", path.display());
        }
        Some(Command::Captions { topic }) => {
            let topic = topic_or_prompt(topic.or(cli.topic))?;
            match pipeline.add_captions(&topic)? {
                Some(path) => println!("✅ Captioned video saved to {}", path.display()),
                None => println!("⚠️ Nothing to caption"),
            }
        }
    }
    Ok(())
}

fn topic_or_prompt(topic: Option<String>) -> Result<String> {
    if let Some(topic) = topic.filter(|t| !t.trim().is_empty()) {
        return Ok(topic.trim().to_string());
    }
    print!("Enter the topic: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let topic = line.trim();
    if topic.is_empty() {
        anyhow::bail!("No topic given");
    }
    Ok(topic.to_string())
}

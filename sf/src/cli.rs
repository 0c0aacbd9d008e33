//! Command-line interface for the `sf` binary
//!
//! The CLI is a thin driver: it loads config, boots the engine, and hands
//! jobs to the scheduler. The engine itself lives in the library.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "sf", about = "Shelf - scanned book reconstruction engine", version)]
pub struct Cli {
    /// Path to config file (defaults: .shelf.yml, ~/.config/shelf/shelf.yml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the reconstruction pipeline for one book
    Run {
        /// Book title
        title: String,

        /// Number of scanned pages
        #[arg(long)]
        pages: u64,

        /// Directory holding the page scans (overrides config)
        #[arg(long)]
        scans_dir: Option<PathBuf>,

        /// OCR provider name (overrides config)
        #[arg(long)]
        ocr: Option<String>,

        /// LLM provider name (overrides config)
        #[arg(long)]
        llm: Option<String>,
    },

    /// Check store and provider health
    Health,

    /// List configured providers
    Providers,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["sf", "run", "Moby Dick", "--pages", "600", "--ocr", "mistral"]);
        match cli.command {
            Command::Run { title, pages, ocr, .. } => {
                assert_eq!(title, "Moby Dick");
                assert_eq!(pages, 600);
                assert_eq!(ocr.as_deref(), Some("mistral"));
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_health_with_config() {
        let cli = Cli::parse_from(["sf", "health", "--config", "/tmp/shelf.yml"]);
        assert!(matches!(cli.command, Command::Health));
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/tmp/shelf.yml")));
    }
}

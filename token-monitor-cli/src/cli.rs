use clap::Parser;

/// Watches the SPL Token program and prints every token balance change.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Monitor only this mint. Overrides the targets from the configuration.
    pub mint: Option<String>,

    /// Path to a TOML configuration file.
    /// If not provided, defaults and environment variables are used.
    #[arg(short, long)]
    pub config: Option<String>,
}

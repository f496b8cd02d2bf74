use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rkstacks", version, about = "StackSet rollout controller")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the controller with a config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
}

//! imgflow CLI: configuration-driven image-classification pipeline.
//!
//! Runs ingestion, base-model preparation, training and evaluation as
//! resumable stages driven by `config/config.yaml` and `params.yaml`.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli)
}

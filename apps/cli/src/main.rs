//! gtfs-etl CLI: daily GTFS snapshot ingestion.
//!
//! Downloads and archives the live feed, computes daily statistics and
//! folds them into the temporal stop/route store.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}

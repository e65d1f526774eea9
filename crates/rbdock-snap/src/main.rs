//! rbd-snap entry point.

mod cli;

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cli::Cli;

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let level = if cli.debug { "rbd_snap=debug" } else { "rbd_snap=info" };
    let library = if cli.debug { "rbdock=debug" } else { "rbdock=info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::from_default_env()
                .add_directive(level.parse()?)
                .add_directive(library.parse()?),
        )
        .init();

    cli.execute()
}

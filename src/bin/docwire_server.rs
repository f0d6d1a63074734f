use std::{error::Error, process};

use clap::Parser;
use docwire::{ServerConfig, protocol::DocumentServer};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about = "In-memory document server speaking the docwire protocol", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: ServerConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    ctrlc::set_handler(|| {
        info!("interrupted, shutting down");
        process::exit(0);
    })?;

    let server = DocumentServer::bind(cli.config.address, cli.config.workers)?
        .with_backlog(cli.config.backlog);
    server.listen()?;
    Ok(())
}

use clap::{Parser, command};
use fwflash::error::FlashResult;
use list::{ListOptions, handle_listing};
use program::{ProgramOptions, handle_programming};

mod list;
mod program;
mod util;

#[derive(Parser, Debug, Clone)]
#[command(version, long_about = None)]
enum Cli {
    /// Program target device with options
    #[command(name = "program", alias = "p")]
    Program(ProgramOptions),

    /// List candidate serial ports and DFU devices
    #[command(name = "list", alias = "l")]
    List(ListOptions),
}

fn main() -> FlashResult<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli {
        Cli::Program(opts) => handle_programming(opts)?,
        Cli::List(opts) => handle_listing(opts)?,
    }

    Ok(())
}

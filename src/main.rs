use anyhow::{Error, Result};
use clap::Parser;
use log::{debug, info};

use mmapd::{Config, Server};

#[derive(Parser)]
#[command(about = "Serve files from the compiled in document root over HTTP/1.1")]
struct Opt {
    #[arg(
        long,
        short,
        help = "Verbosity level. Can be off, error, warn, info, debug, or trace.",
        default_value = "info"
    )]
    verbose: String,

    #[arg(value_parser = clap::value_parser!(u16).range(1..), help = "Port to listen on.")]
    port: u16,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    use std::str::FromStr;
    let level = log::LevelFilter::from_str(&opt.verbose)
        .map_err(|_| Error::msg(format!("Invalid verbosity string {:?}", opt.verbose)))?;
    stderrlog::new()
        .module(module_path!())
        .quiet(level == log::LevelFilter::Off)
        .verbosity((level as usize).saturating_sub(1))
        .timestamp(stderrlog::Timestamp::Millisecond)
        .init()?;

    let config = Config::new(opt.port);
    debug!("{config:?}");
    let mut server = Server::bind(config)?;
    server.install_signal_handlers()?;
    server.run()?;
    info!("Exiting");
    Ok(())
}

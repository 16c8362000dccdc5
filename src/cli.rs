//! Command-line interface: `iodns -c <config_file>` / `-h`/`--help`.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "iodns")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A DNS forwarder that tunnels queries to a remote ioserver")]
pub struct Cli {
    /// Config file, see iosocks(8) for its syntax
    #[arg(short = 'c', long = "config", value_name = "config_file")]
    pub config: PathBuf,
}

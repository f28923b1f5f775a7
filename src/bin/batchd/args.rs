use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub(crate) listen: IpAddr,
    /// (TCP) port to listen on. Overrides the configuration file.
    #[arg(short, long)]
    pub(crate) port: Option<u16>,
    /// YAML configuration file. Built-in defaults are used without one.
    #[arg(short, long)]
    pub(crate) config: Option<PathBuf>,
    /// Directory holding job files. Overrides the configuration file.
    #[arg(short, long)]
    pub(crate) spool_dir: Option<PathBuf>,
    /// Name this server answers to. Overrides the configuration file.
    #[arg(short = 'n', long)]
    pub(crate) server_name: Option<String>,
    /// Number of runtime worker threads.
    #[arg(short, long, default_value_t = 4)]
    pub(crate) workers: usize,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}

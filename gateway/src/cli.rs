use anyhow::Result;
use clap::Parser;
use std::env::current_dir;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
pub struct Opts {
    /// The IP address to listen on for the HTTP API.
    #[clap(long, default_value = "0.0.0.0:8000")]
    pub http_address: SocketAddr,

    /// Path of the gateway database file. Defaults to `data/gateway.sqlite`
    /// under the current working directory.
    #[clap(long)]
    database: Option<PathBuf>,

    /// If enabled logs will be in json format
    #[clap(short, long)]
    pub json: bool,
}

impl Opts {
    // use this method to parse the options from the cli.
    pub fn read() -> Opts {
        Opts::parse()
    }

    pub fn database(&self) -> Result<PathBuf> {
        let database = match self.database.clone() {
            None => current_dir()?.join("data").join("gateway.sqlite"),
            Some(path) => path,
        };

        Ok(database)
    }
}

use std::net::SocketAddr;

use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone, Default)]
#[structopt(name = "smqd", about = "SMQ message broker")]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Listener address, overrides listener.addr
    #[structopt(name = "laddr", long)]
    pub laddr: Option<SocketAddr>,

    /// Worker thread limit, overrides task.workers
    #[structopt(name = "workers", long)]
    pub workers: Option<usize>,
}

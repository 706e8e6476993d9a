#![deny(unsafe_code)]

use std::process;

use structopt::StructOpt;

use smq::conf::{Options, Settings};
use smq::logger::{config_logger, logger_init};
use smq::server::SmqServer;

fn main() {
    //init config
    let settings = Settings::new(Options::from_args()).expect("settings init failed");

    //init log
    let level = settings.log.level.inner();
    let logger = config_logger(settings.log.filename(), settings.log.to, level);
    logger_init(&logger, level).expect("logger init failed");

    let server = match SmqServer::start(settings) {
        Ok(server) => server,
        Err(e) => {
            log::error!("start smq broker failed: {:?}", e);
            eprintln!("start smq broker failed: {:?}", e);
            process::exit(1);
        }
    };

    if let Err(e) = ctrl_c() {
        log::error!("wait for ctrl-c failed, {}", e);
    }
    log::info!("shutting down");
    server.stop();
}

fn ctrl_c() -> std::io::Result<()> {
    tokio::runtime::Builder::new_current_thread().enable_io().build()?.block_on(tokio::signal::ctrl_c())
}

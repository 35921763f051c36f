//! Binary entry point: `vev <port> [<www_dir>]`.

use std::process;

use log::{error, info};

use vev::config::Config;
use vev::listener::Listener;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // A peer that disappears mid-response must surface as a write error,
    // not terminate the process.
    // SAFETY: installing SIG_IGN carries no data the handler could race on.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let config = match Config::from_args(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            eprintln!("usage: vev <port> [<www_dir>]");
            process::exit(1);
        }
    };

    let mut listener = match Listener::bind(config) {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind: {err}");
            process::exit(1);
        }
    };
    if let Ok(addr) = listener.local_addr() {
        info!("listening on {addr}");
    }
    listener.run();
}

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};
use tracing::Level;

use corehttpd::config::Config;
use corehttpd::worker::Worker;

const COPYRIGHT: &str = "copyright (c) 2021 Tom Dryer";

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

fn main() -> Result<()> {
    println!(
        "{}/{}, {}.",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        COPYRIGHT,
    );

    let config = Config::from_command_line()?;

    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(if config.verbose {
            Level::TRACE
        } else {
            Level::INFO
        })
        .with_writer(std::io::stderr)
        .init();

    let srv = config.build_server()?;
    let listener = config.create_listener()?;
    let mut worker =
        Worker::new(listener, config.max_connections).context("failed to set up listener")?;

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    // main loop
    while is_running() {
        worker.poll(&srv).context("select() failed")?;
    }
    tracing::info!("shutting down, {} open connections", worker.connection_count());
    worker.shutdown(&srv);

    // Stdout may already be gone when the access log goes there.
    if config.log_file.is_some() || config.syslog {
        worker.stats.print(&srv)?;
    }
    Ok(())
}

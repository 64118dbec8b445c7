//! saverbridge
//!
//! Runs an X11 screensaver hack into a capture window and re-presents that
//! window as a live Wayland surface.

mod binder;
mod bridge;
mod capture;
mod config;
mod error;
mod mux;
mod pool;
mod present;
mod session;
mod supervisor;

#[cfg(test)]
mod fakes;

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::binder::CapabilityBinder;
use crate::capture::x11::CaptureConnection;
use crate::config::Config;
use crate::mux::{Multiplexer, ShutdownRequest};
use crate::present::wayland::WaylandPresenter;
use crate::session::{LoopExit, Session};
use crate::supervisor::{ScreensaverProcess, SystemProcesses};

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "saverbridge=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        let program = args.first().map(String::as_str).unwrap_or("saverbridge");
        eprintln!("usage: {} <screensaver-path>", program);
        return ExitCode::FAILURE;
    }

    info!("Starting saverbridge {}", env!("CARGO_PKG_VERSION"));

    match run(Path::new(&args[1])) {
        Ok(exit) => {
            info!("Exiting: {}", exit);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Build everything in order and run the loop. Locals are declared in
/// construction order so they drop in reverse: presentation objects, frame
/// pool, Wayland connection, screensaver, capture window, X connection.
fn run(screensaver: &Path) -> Result<LoopExit> {
    let config = Config::load().unwrap_or_else(|e| {
        warn!("Failed to load config, using defaults: {:#}", e);
        Config::default()
    });
    let shutdown = ShutdownRequest::register().context("Failed to install signal handlers")?;

    let capture_conn = CaptureConnection::connect(config.capture.display.as_deref())?;
    let mut target = capture_conn.create_target()?;

    let mut saver = ScreensaverProcess::new(SystemProcesses);
    saver
        .launch(screensaver, target.window(), &config.screensaver)
        .context("Failed to start screensaver")?;

    let mut presenter = WaylandPresenter::connect(config.present.fullscreen)?;

    let binder = CapabilityBinder::new(target.geometry(), config.present.app_id.clone());
    let mut session = Session::new(&mut target, &mut presenter, binder);
    let mut mux = Multiplexer::new(config.event_loop.poll_timeout_ms, shutdown);

    let exit = mux.run(&mut session).context("Event loop failed")?;
    Ok(exit)
}

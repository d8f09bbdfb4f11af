mod buffer;
mod cache;
mod config;
mod daemon;
mod error;
mod image;
mod ipc;
mod output;
mod types;
mod workspaces;

use std::sync::atomic::{AtomicBool, Ordering};

use clap::CommandFactory;
use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use config::{Cli, Options};
use daemon::Daemon;

// Set from the signal handler; the poll loop wakes up with EINTR and
// observes it.
static EXIT: AtomicBool = AtomicBool::new(false);

pub fn should_exit() -> bool {
    EXIT.load(Ordering::Acquire)
}

extern "C" fn handle_signal(_: libc::c_int) {
    EXIT.store(true, Ordering::Release);
}

fn setup_signals() {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        let _ = sigaction(Signal::SIGINT, &action);
        let _ = sigaction(Signal::SIGTERM, &action);
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = Cli::command().get_matches();
    let options = Options::from_matches(&matches);

    log::info!("Starting wsbg v{}", env!("CARGO_PKG_VERSION"));
    setup_signals();

    let (mut daemon, conn, mut event_queue) = Daemon::new(options)?;
    let result = daemon.run(&conn, &mut event_queue);
    daemon.teardown();

    log::info!("Exiting wsbg");
    result
}

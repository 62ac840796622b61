//! Signal plumbing for the supervisor.
//!
//! SIGCHLD drives reaping, SIGTERM/SIGINT/SIGPWR request a shutdown with
//! their respective terminal scripts, SIGHUP requests a directory rescan.

use tokio::signal::unix::{signal, Signal, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sig {
    /// A child process exited.
    Child,
    Term,
    Int,
    Hup,
    Power,
}

pub struct SignalHandler {
    sigchld: Signal,
    sigterm: Signal,
    sigint: Signal,
    sighup: Signal,
    sigpwr: Signal,
}

impl SignalHandler {
    pub fn new() -> std::io::Result<Self> {
        Ok(SignalHandler {
            sigchld: signal(SignalKind::child())?,
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sighup: signal(SignalKind::hangup())?,
            sigpwr: signal(SignalKind::from_raw(libc::SIGPWR))?,
        })
    }

    /// Wait for the next signal of interest.
    pub async fn wait(&mut self) -> Sig {
        tokio::select! {
            _ = self.sigchld.recv() => Sig::Child,
            _ = self.sigterm.recv() => Sig::Term,
            _ = self.sigint.recv() => Sig::Int,
            _ = self.sighup.recv() => Sig::Hup,
            _ = self.sigpwr.recv() => Sig::Power,
        }
    }
}

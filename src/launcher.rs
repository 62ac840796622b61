//! Spawning, signalling, and the post-mortem restart policy.
//!
//! Services are invoked as `INITDIR/<name>` with no arguments, the
//! supervisor's environment, a fresh session, and a default signal mask.
//! Unless pass-through is requested, stdout and stderr share one pipe whose
//! read end is drained by an output-reader task.

use std::os::fd::OwnedFd;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::registry::SpawnMode;

/// A freshly spawned service process.
pub struct Spawned {
    pub child: Child,
    pub pid: Pid,
    /// Read end of the combined stdout/stderr pipe; absent for
    /// pass-through services.
    pub output: Option<pipe::Receiver>,
}

/// Fork and exec one service executable.
pub fn spawn_service(path: &Path, mode: SpawnMode) -> std::io::Result<Spawned> {
    let mut command = Command::new(path);
    detach_into_own_session(&mut command);

    let output = match mode {
        SpawnMode::PassThrough => {
            command.stdin(Stdio::inherit());
            command.stdout(Stdio::inherit());
            command.stderr(Stdio::inherit());
            None
        }
        SpawnMode::Normal | SpawnMode::RunOnce => {
            let (read_end, write_end) = nix::unistd::pipe()?;
            let write_dup = write_end.try_clone()?;
            command.stdin(Stdio::null());
            command.stdout(Stdio::from(write_end));
            command.stderr(Stdio::from(write_dup));
            Some(into_async_reader(read_end)?)
        }
    };

    let child = command.spawn()?;
    let pid = raw_pid(&child)?;
    debug!(path = %path.display(), %pid, "spawned service");
    Ok(Spawned { child, pid, output })
}

/// Spawn a boot-phase script. Scripts keep the supervisor's stdio.
pub fn spawn_script(path: &Path) -> std::io::Result<(Child, Pid)> {
    let mut command = Command::new(path);
    detach_into_own_session(&mut command);
    command.stdin(Stdio::inherit());
    command.stdout(Stdio::inherit());
    command.stderr(Stdio::inherit());
    let child = command.spawn()?;
    let pid = raw_pid(&child)?;
    Ok((child, pid))
}

fn raw_pid(child: &Child) -> std::io::Result<Pid> {
    let id = child
        .id()
        .ok_or_else(|| std::io::Error::other("spawned child has no pid"))?;
    Ok(Pid::from_raw(id as i32))
}

/// Children get their own session (detached controlling terminal) and a
/// clean signal mask. Whatever mask the supervisor runs under must not
/// leak into services; they expect the default disposition.
fn detach_into_own_session(command: &mut Command) {
    unsafe {
        command.pre_exec(|| {
            use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            let empty_mask = SigSet::empty();
            pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&empty_mask), None)
                .map_err(std::io::Error::from)?;
            Ok(())
        });
    }
}

fn into_async_reader(fd: OwnedFd) -> std::io::Result<pipe::Receiver> {
    let flags = OFlag::from_bits_truncate(fcntl(&fd, FcntlArg::F_GETFL)?);
    fcntl(&fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    pipe::Receiver::from_owned_fd(fd)
}

/// The kill sequence: wake a stopped process first so the termination
/// signal is actually delivered.
pub fn request_stop(pid: Pid) -> nix::Result<()> {
    let _ = kill(pid, Signal::SIGCONT);
    kill(pid, Signal::SIGTERM)
}

pub fn force_kill(pid: Pid) -> nix::Result<()> {
    kill(pid, Signal::SIGKILL)
}

pub fn send_hangup(pid: Pid) -> nix::Result<()> {
    kill(pid, Signal::SIGHUP)
}

/// Exit code recorded in the slot: the status byte, or 128 plus the signal
/// number for a signalled death.
pub fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

/// What the reaper does with a slot once its process died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathAction {
    /// Killed by the supervisor: park with the exit status and fire the
    /// death notification. A stale slot is released by the next reconcile,
    /// never while its process was alive.
    NotifyAndPark,
    /// Run-once service finished cleanly: release the slot.
    Release,
    /// Unexpected death past the cool-down: respawn immediately.
    Respawn,
    /// Unexpected death within the cool-down: park with the exit status.
    Park,
}

/// Restart policy for a dead service.
pub fn death_action(
    killed: bool,
    run_once: bool,
    clean_exit: bool,
    uptime: Duration,
    cooldown: Duration,
) -> DeathAction {
    if killed {
        DeathAction::NotifyAndPark
    } else if run_once && clean_exit {
        DeathAction::Release
    } else if !run_once && uptime >= cooldown {
        DeathAction::Respawn
    } else {
        DeathAction::Park
    }
}

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::timeout;

use super::control_client::ControlClient;

/// Core testing harness: a temporary service/boot directory pair and one
/// supervised daemon instance pointed at them through the environment.
pub struct DaemonHarness {
    temp_dir: TempDir,
    pub init_dir: PathBuf,
    pub boot_dir: PathBuf,
    pub socket_path: PathBuf,
    environment: HashMap<String, String>,
    daemon: Option<Child>,
    daemon_pid: Option<Pid>,
}

impl DaemonHarness {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        let init_dir = temp_dir.path().join("services");
        let boot_dir = temp_dir.path().join("boot");
        let socket_path = temp_dir.path().join("control.sock");
        std::fs::create_dir(&init_dir)?;
        std::fs::create_dir(&boot_dir)?;

        let mut environment = HashMap::new();
        environment.insert("SVCHUB_INIT_DIR".into(), init_dir.display().to_string());
        environment.insert("SVCHUB_BOOT_DIR".into(), boot_dir.display().to_string());
        environment.insert(
            "SVCHUB_CONTROL_SOCKET".into(),
            socket_path.display().to_string(),
        );
        // Keep reloads snappy for the tests.
        environment.insert("SVCHUB_RELOAD_DEBOUNCE_MS".into(), "50".into());

        Ok(Self {
            temp_dir,
            init_dir,
            boot_dir,
            socket_path,
            environment,
            daemon: None,
            daemon_pid: None,
        })
    }

    /// Override a daemon environment variable (tuning knobs); only
    /// effective before `start_daemon`.
    pub fn set_environment(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.environment.insert(key.into(), value.into());
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Drop an executable service script into the service directory.
    pub fn add_service(&self, name: &str, body: &str) -> Result<()> {
        let path = self.init_dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    pub fn remove_service(&self, name: &str) -> Result<()> {
        std::fs::remove_file(self.init_dir.join(name))?;
        Ok(())
    }

    pub fn add_boot_script(&self, name: &str, body: &str) -> Result<()> {
        let path = self.boot_dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    /// Spawn the daemon binary against the harness directories.
    pub async fn start_daemon(&mut self) -> Result<()> {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_svchub"));
        for (key, value) in &self.environment {
            cmd.env(key, value);
        }
        cmd.env("RUST_LOG", "svchub=debug");
        cmd.kill_on_drop(true);

        let child = cmd.spawn().context("Failed to spawn svchub daemon")?;
        let pid = Pid::from_raw(
            child
                .id()
                .ok_or_else(|| anyhow::anyhow!("Failed to get daemon PID"))? as i32,
        );
        self.daemon = Some(child);
        self.daemon_pid = Some(pid);
        Ok(())
    }

    pub fn daemon_pid(&self) -> Pid {
        self.daemon_pid.expect("daemon not started")
    }

    /// Connect to the control socket, waiting for the daemon to bind it.
    pub async fn connect(&self) -> Result<ControlClient> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match ControlClient::connect(&self.socket_path) {
                Ok(client) => return Ok(client),
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(err) => return Err(err).context("daemon never bound the control socket"),
            }
        }
    }

    pub fn signal_daemon(&self, signal: Signal) -> Result<()> {
        nix::sys::signal::kill(self.daemon_pid(), signal)?;
        Ok(())
    }

    /// Wait for the daemon to exit on its own.
    pub async fn wait_for_exit(&mut self, duration: Duration) -> Result<Option<ExitStatus>> {
        if let Some(child) = &mut self.daemon {
            match timeout(duration, child.wait()).await {
                Ok(result) => Ok(Some(result.context("daemon wait failed")?)),
                Err(_) => Ok(None),
            }
        } else {
            Ok(None)
        }
    }

    /// SIGTERM the daemon and require a clean exit.
    pub async fn shutdown_daemon(&mut self) -> Result<()> {
        self.signal_daemon(Signal::SIGTERM)?;
        let status = self
            .wait_for_exit(Duration::from_secs(10))
            .await?
            .ok_or_else(|| anyhow::anyhow!("daemon did not exit after SIGTERM"))?;
        anyhow::ensure!(status.success(), "daemon exited with {status:?}");
        Ok(())
    }

    /// Poll `probe` until it returns true or the timeout elapses.
    pub async fn wait_until<F>(&self, duration: Duration, mut probe: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if probe() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for DaemonHarness {
    fn drop(&mut self) {
        // Clean up the daemon and anything it left behind.
        if let Some(pid) = self.daemon_pid {
            let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
        }
    }
}

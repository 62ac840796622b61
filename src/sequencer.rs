//! Global boot/shutdown state machine.
//!
//! `SysInit → Startup → Running → Stopping → Shutdown → exit`. The phase
//! script of the moment is tracked here as the sole script child, distinct
//! from service slots; during reaping it is checked before the table.

use std::time::Duration;

use tokio::process::Child;
use tokio::time::Instant;

pub const STARTUP: &str = "startup";
pub const REBOOT: &str = "reboot";
pub const SHUTDOWN: &str = "shutdown";
pub const POWEROFF: &str = "poweroff";
pub const FAILURE: &str = "failure";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysState {
    SysInit,
    Startup,
    Running,
    Stopping,
    Shutdown,
}

/// What an escalation alarm fire means for still-running services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationStep {
    /// Log the stragglers and wait another interval.
    Retry,
    /// Retries exhausted: force-kill everything that remains.
    ForceKill,
}

struct ScriptChild {
    name: &'static str,
    child: Child,
}

pub struct Sequencer {
    state: SysState,
    script: Option<ScriptChild>,
    /// Terminal script chosen when the stop was requested.
    pending_script: &'static str,
    attempts: u32,
    retries: u32,
    interval: Duration,
    alarm_deadline: Option<Instant>,
}

impl Sequencer {
    pub fn new(interval: Duration, retries: u32) -> Self {
        Sequencer {
            state: SysState::SysInit,
            script: None,
            pending_script: POWEROFF,
            attempts: 0,
            retries,
            interval,
            alarm_deadline: None,
        }
    }

    pub fn state(&self) -> SysState {
        self.state
    }

    pub fn alarm_deadline(&self) -> Option<Instant> {
        self.alarm_deadline
    }

    pub fn terminal_script(&self) -> &'static str {
        self.pending_script
    }

    /// Track the startup script; unconditional at daemon start.
    pub fn begin_startup(&mut self, child: Child) {
        debug_assert_eq!(self.state, SysState::SysInit);
        self.script = Some(ScriptChild { name: STARTUP, child });
        self.state = SysState::Startup;
    }

    /// Enter steady state. Also used when the startup script is absent.
    pub fn enter_running(&mut self) {
        self.state = SysState::Running;
    }

    /// Record a stop request and arm the escalation alarm. Returns false
    /// when a shutdown is already in progress.
    pub fn request_stop(&mut self, script: &'static str) -> bool {
        match self.state {
            SysState::Stopping | SysState::Shutdown => false,
            _ => {
                self.pending_script = script;
                self.state = SysState::Stopping;
                self.attempts = 0;
                self.alarm_deadline = Some(Instant::now() + self.interval);
                true
            }
        }
    }

    /// An escalation alarm fired while stopping.
    pub fn on_alarm(&mut self) -> EscalationStep {
        self.attempts += 1;
        if self.attempts >= self.retries {
            self.alarm_deadline = None;
            EscalationStep::ForceKill
        } else {
            self.alarm_deadline = Some(Instant::now() + self.interval);
            EscalationStep::Retry
        }
    }

    /// A second stop signal while already stopping: skip the remaining
    /// retries entirely.
    pub fn force_escalation(&mut self) {
        self.attempts = self.retries;
        self.alarm_deadline = None;
    }

    /// Nothing left to escalate against (only a script child remains).
    pub fn disarm_alarm(&mut self) {
        self.alarm_deadline = None;
    }

    /// The teardown is complete once nothing tracked remains alive and no
    /// script is mid-run; the terminal script may then be spawned.
    pub fn ready_for_terminal(&self, n_alive: usize) -> bool {
        self.state == SysState::Stopping && n_alive == 0 && self.script.is_none()
    }

    /// Track the terminal script; the control socket closes with this.
    pub fn begin_terminal(&mut self, child: Child) {
        self.script = Some(ScriptChild {
            name: self.pending_script,
            child,
        });
        self.state = SysState::Shutdown;
        self.alarm_deadline = None;
    }

    /// Startup failed: the failure script becomes the terminal phase.
    pub fn begin_failure(&mut self, child: Child) {
        self.pending_script = FAILURE;
        self.script = Some(ScriptChild { name: FAILURE, child });
        self.state = SysState::Shutdown;
        self.alarm_deadline = None;
    }

    /// Mark the terminal phase complete without a script (absent file).
    pub fn terminal_skipped(&mut self) {
        self.state = SysState::Shutdown;
        self.alarm_deadline = None;
    }

    /// Non-blocking reap of the script child, if it exited.
    pub fn try_reap_script(&mut self) -> Option<(&'static str, std::process::ExitStatus)> {
        let script = self.script.as_mut()?;
        match script.child.try_wait() {
            Ok(Some(status)) => {
                let name = script.name;
                self.script = None;
                Some((name, status))
            }
            _ => None,
        }
    }
}

//! The event loop that owns everything.
//!
//! Single-threaded by construction: the process table and connection table
//! are touched only from this task. Satellite tasks (connection readers,
//! output-pipe readers, the directory watcher) communicate exclusively
//! through the event channel, and every wake dispatches to exactly one
//! handler.

use std::time::Instant;

use bytes::BytesMut;
use eyre::eyre;
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{Config, MAX_CONNECTIONS, MAX_SERVICES};
use crate::launcher::{self, DeathAction, Spawned};
use crate::loader;
use crate::protocol::{
    encode_buffer_reply, Attr, CommandCode, CommandError, Message, NOTIFY_DIED,
};
use crate::registry::{AllocError, ProcessTable, ServiceState, SpawnMode};
use crate::ring::RingBuffer;
use crate::sequencer::{self, EscalationStep, Sequencer, SysState};
use crate::server::{self, ConnectionTable};
use crate::signals::{Sig, SignalHandler};
use crate::watcher::DirWatcher;
use crate::Result;

/// Everything that can wake the loop besides a signal, an accept, or the
/// escalation alarm. This is the typed rendition of the original's packed
/// fd-dispatch key.
#[derive(Debug)]
pub enum Event {
    /// A decoded frame arrived on a control connection.
    Request { conn: usize, generation: u64, frame: BytesMut },
    /// A control connection reached EOF or failed.
    ConnClosed { conn: usize, generation: u64 },
    /// A chunk of combined stdout/stderr from a service.
    ServiceOutput { slot: usize, generation: u64, chunk: Vec<u8> },
    /// A service's output pipe closed.
    ServiceEof { slot: usize, generation: u64 },
    /// The service directory changed; reconcile it.
    Rescan,
}

/// Byte budget for one `list` page.
const LIST_PAGE: usize = 1024;

pub struct Supervisor {
    cfg: Config,
    table: ProcessTable,
    conns: ConnectionTable,
    seq: Sequencer,
    events_tx: mpsc::UnboundedSender<Event>,
    /// Set once the terminal phase finished; the loop returns it.
    finished: Option<Result<()>>,
    /// Set when the terminal script spawns: close the control plane.
    close_control: bool,
}

impl Supervisor {
    /// Run the daemon to completion.
    pub async fn run(cfg: Config) -> Result<()> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut signals = SignalHandler::new()?;
        let mut listener = Some(server::bind_control_socket(&cfg.control_path)?);

        let _watcher =
            match DirWatcher::start(&cfg.init_dir, cfg.reload_debounce, events_tx.clone()) {
                Ok(watcher) => Some(watcher),
                Err(err) => {
                    // SIGHUP still triggers rescans; only the automatic
                    // trigger is lost.
                    warn!(%err, "service directory watch unavailable");
                    None
                }
            };

        let mut sv = Supervisor {
            seq: Sequencer::new(cfg.escalate_interval, cfg.escalate_retries),
            table: ProcessTable::new(MAX_SERVICES),
            conns: ConnectionTable::new(MAX_CONNECTIONS),
            events_tx,
            finished: None,
            close_control: false,
            cfg,
        };
        sv.begin_boot();

        loop {
            let alarm = sv.seq.alarm_deadline();
            tokio::select! {
                sig = signals.wait() => sv.handle_signal(sig).await,
                accepted = accept_on(&listener), if listener.is_some() => match accepted {
                    Ok(stream) => sv.handle_accept(stream),
                    Err(err) => warn!(%err, "accept failed"),
                },
                Some(event) = events_rx.recv() => sv.handle_event(event).await,
                _ = tokio::time::sleep_until(alarm.unwrap_or_else(tokio::time::Instant::now)),
                    if alarm.is_some() => sv.handle_alarm(),
            }

            if sv.close_control {
                sv.close_control = false;
                listener = None;
                sv.conns.close_all();
            }
            if let Some(result) = sv.finished.take() {
                return result;
            }
        }
    }

    // ---- boot & shutdown sequencing ----

    fn begin_boot(&mut self) {
        let path = self.cfg.boot_dir.join(sequencer::STARTUP);
        match launcher::spawn_script(&path) {
            Ok((child, pid)) => {
                info!(script = %path.display(), %pid, "running startup script");
                self.seq.begin_startup(child);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("no startup script, entering steady state");
                self.seq.enter_running();
                self.rescan();
            }
            Err(err) => {
                error!(%err, "cannot run startup script");
                self.enter_failure();
            }
        }
    }

    /// Boot failed: run the failure script and exit hard afterwards.
    fn enter_failure(&mut self) {
        let path = self.cfg.boot_dir.join(sequencer::FAILURE);
        match launcher::spawn_script(&path) {
            Ok((child, pid)) => {
                info!(script = sequencer::FAILURE, %pid, "running failure script");
                self.seq.begin_failure(child);
            }
            Err(err) => {
                error!(%err, "cannot run failure script");
                self.finished = Some(Err(eyre!("startup failed and no failure script ran")));
            }
        }
    }

    /// Tear down all services ahead of running `script`.
    fn request_shutdown(&mut self, script: &'static str) {
        match self.seq.state() {
            SysState::Stopping => {
                // A repeated stop request skips the remaining retries.
                info!("stop requested again, escalating to SIGKILL");
                self.seq.force_escalation();
                self.kill_all(true);
            }
            SysState::Shutdown => {}
            _ => {
                if !self.seq.request_stop(script) {
                    return;
                }
                info!(script, "stopping all services");
                self.kill_all(false);
                self.maybe_run_terminal();
            }
        }
    }

    /// Send the kill sequence (or SIGKILL) to every live service.
    fn kill_all(&mut self, force: bool) {
        for (_, slot) in self.table.iter_mut() {
            if let Some(pid) = slot.pid {
                slot.killed = true;
                slot.state = ServiceState::Stopping;
                let res = if force {
                    launcher::force_kill(pid)
                } else {
                    launcher::request_stop(pid)
                };
                if let Err(err) = res {
                    debug!(service = %slot.name, %err, "kill failed");
                }
            }
        }
    }

    fn handle_alarm(&mut self) {
        let stragglers: Vec<String> = self
            .table
            .iter()
            .filter(|(_, s)| s.is_alive())
            .map(|(_, s)| s.name.clone())
            .collect();
        if stragglers.is_empty() {
            // Every service is dead; only a script child can be pending.
            self.seq.disarm_alarm();
            return;
        }
        match self.seq.on_alarm() {
            EscalationStep::Retry => {
                warn!(services = ?stragglers, "still waiting for services to exit");
            }
            EscalationStep::ForceKill => {
                warn!(services = ?stragglers, "escalating to SIGKILL");
                self.kill_all(true);
            }
        }
    }

    /// Once nothing is left alive and no script is mid-run, spawn the
    /// terminal script and close the control plane.
    fn maybe_run_terminal(&mut self) {
        if !self.seq.ready_for_terminal(self.table.n_alive()) {
            return;
        }
        self.close_control = true;
        let script = self.seq.terminal_script();
        let path = self.cfg.boot_dir.join(script);
        match launcher::spawn_script(&path) {
            Ok((child, pid)) => {
                info!(script, %pid, "running terminal script");
                self.seq.begin_terminal(child);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.seq.terminal_skipped();
                self.finished = Some(Ok(()));
            }
            Err(err) => {
                self.seq.terminal_skipped();
                self.finished = Some(Err(eyre!("cannot run terminal script {script}: {err}")));
            }
        }
    }

    fn on_script_exit(&mut self, name: &'static str, status: std::process::ExitStatus) {
        match self.seq.state() {
            SysState::Startup => {
                if status.success() {
                    info!("startup complete");
                    self.seq.enter_running();
                    self.rescan();
                } else {
                    error!(code = launcher::exit_code_of(status), "startup script failed");
                    self.enter_failure();
                }
            }
            // A stop request arrived while the startup script was still
            // running; its exit may complete the teardown.
            SysState::Stopping => self.maybe_run_terminal(),
            SysState::Shutdown => {
                self.finished = Some(if name == sequencer::FAILURE {
                    Err(eyre!("boot failed"))
                } else if status.success() {
                    Ok(())
                } else {
                    Err(eyre!(
                        "terminal script {name} exited with {}",
                        launcher::exit_code_of(status)
                    ))
                });
            }
            _ => {}
        }
    }

    // ---- signals & reaping ----

    async fn handle_signal(&mut self, sig: Sig) {
        match sig {
            Sig::Child => self.reap_children().await,
            Sig::Term => self.request_shutdown(sequencer::SHUTDOWN),
            Sig::Int => self.request_shutdown(sequencer::REBOOT),
            Sig::Power => self.request_shutdown(sequencer::POWEROFF),
            Sig::Hup => self.rescan(),
        }
    }

    /// Drain every currently-exited child: the tracked script first, then
    /// the service table.
    async fn reap_children(&mut self) {
        if let Some((name, status)) = self.seq.try_reap_script() {
            self.on_script_exit(name, status);
        }

        let mut dead = Vec::new();
        for (idx, slot) in self.table.iter_mut() {
            if let Some(child) = slot.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    dead.push((idx, status));
                }
            }
        }
        for (idx, status) in dead {
            self.handle_service_death(idx, status).await;
        }
        self.maybe_run_terminal();
    }

    async fn handle_service_death(&mut self, idx: usize, status: std::process::ExitStatus) {
        let teardown = matches!(self.seq.state(), SysState::Stopping | SysState::Shutdown);
        let cooldown = self.cfg.restart_cooldown;

        let Some(slot) = self.table.get_mut(idx) else {
            return;
        };
        let pid = slot.pid.take();
        slot.child = None;
        let name = slot.name.clone();
        let action = if teardown {
            DeathAction::NotifyAndPark
        } else {
            launcher::death_action(
                slot.killed,
                slot.run_once,
                status.success(),
                slot.started_at.elapsed(),
                cooldown,
            )
        };

        match action {
            DeathAction::NotifyAndPark => {
                slot.killed = false;
                park(slot, status);
                info!(service = %name, "service stopped");
                if let Some(pid) = pid {
                    self.notify_watchers(pid).await;
                }
            }
            DeathAction::Release => {
                info!(service = %name, "one-shot service finished");
                self.table.free(idx);
            }
            DeathAction::Respawn => {
                warn!(service = %name, code = launcher::exit_code_of(status),
                      "service died unexpectedly, restarting");
                let mode = mode_of(slot.run_once, slot.pass_through);
                if let Err(err) = self.spawn_slot(idx, mode) {
                    warn!(service = %name, %err, "restart failed");
                }
            }
            DeathAction::Park => {
                warn!(service = %name, code = launcher::exit_code_of(status),
                      "service died too quickly, not restarting");
                park(slot, status);
            }
        }
    }

    /// Exactly-once death notification to every connection watching `pid`.
    async fn notify_watchers(&mut self, pid: Pid) {
        for idx in self.conns.watchers_of(pid) {
            let payload = Message::new(NOTIFY_DIED).encode();
            let delivered = match self.conns.index_mut(idx) {
                Some(conn) => {
                    conn.watch_pid = None;
                    conn.send(payload).await
                }
                None => continue,
            };
            if !delivered {
                self.conns.close(idx);
            }
        }
    }

    // ---- directory reconciliation ----

    fn rescan(&mut self) {
        if self.seq.state() != SysState::Running {
            return;
        }
        let plan = match loader::reconcile(&mut self.table, &self.cfg.init_dir) {
            Ok(plan) => plan,
            Err(err) => {
                // Keep running under the last-known-good table.
                warn!(%err, "service directory unreadable, skipping reload");
                return;
            }
        };
        for name in &plan.freed {
            info!(service = %name, "service removed");
        }
        for idx in plan.to_stop {
            if let Some(slot) = self.table.get_mut(idx) {
                if let Some(pid) = slot.pid {
                    info!(service = %slot.name, "service removed, stopping it");
                    slot.killed = true;
                    slot.state = ServiceState::Stopping;
                    let _ = launcher::request_stop(pid);
                }
            }
        }
        for idx in plan.to_start {
            let name = self.table.get(idx).map(|s| s.name.clone());
            if let Err(err) = self.spawn_slot(idx, SpawnMode::Normal) {
                warn!(service = ?name, %err, "cannot start new service");
            }
        }
    }

    // ---- process lifecycle ----

    fn spawn_slot(&mut self, idx: usize, mode: SpawnMode) -> std::result::Result<Pid, CommandError> {
        let slot = self.table.get_mut(idx).ok_or(CommandError::UnknownService)?;
        if slot.is_alive() {
            return Err(CommandError::AlreadyRunning);
        }
        let name = slot.name.clone();
        let path = self.cfg.init_dir.join(&name);
        slot.state = ServiceState::Starting;

        match launcher::spawn_service(&path, mode) {
            Ok(Spawned { child, pid, output }) => {
                let generation = self.table.bump_generation(idx);
                let slot = self.table.get_mut(idx).expect("slot just spawned");
                slot.run_once = mode == SpawnMode::RunOnce;
                slot.pass_through = mode == SpawnMode::PassThrough;
                slot.killed = false;
                slot.exit_code = None;
                slot.pid = Some(pid);
                slot.child = Some(child);
                slot.state = ServiceState::Running;
                slot.started_at = Instant::now();
                if let Some(output) = output {
                    spawn_output_reader(output, idx, generation, self.events_tx.clone());
                }
                info!(service = %name, %pid, "service started");
                Ok(pid)
            }
            Err(err) => {
                warn!(service = %name, %err, "spawn failed");
                let slot = self.table.get_mut(idx).expect("slot still present");
                slot.state = ServiceState::Stopped;
                Err(CommandError::from_io(&err))
            }
        }
    }

    // ---- control plane ----

    fn handle_accept(&mut self, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        match self.conns.insert(write_half) {
            Some((idx, generation)) => {
                server::spawn_reader(read_half, idx, generation, self.events_tx.clone());
            }
            None => {
                warn!("connection table full, rejecting control client");
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Request { conn, generation, frame } => {
                self.handle_request(conn, generation, &frame).await;
            }
            Event::ConnClosed { conn, generation } => {
                if self.conns.get_mut(conn, generation).is_some() {
                    self.conns.close(conn);
                }
            }
            Event::ServiceOutput { slot, generation, chunk } => {
                let capacity = self.cfg.ring_capacity;
                if let Some(slot) = self.table.get_mut(slot) {
                    if slot.generation == generation && !slot.pass_through {
                        slot.ring
                            .get_or_insert_with(|| RingBuffer::new(capacity))
                            .write(&chunk);
                    }
                }
            }
            Event::ServiceEof { .. } => {}
            Event::Rescan => self.rescan(),
        }
    }

    async fn handle_request(&mut self, conn: usize, generation: u64, frame: &[u8]) {
        let msg = match Message::decode(frame) {
            Ok(msg) => msg,
            Err(err) => {
                // Protocol violations cost the client its connection.
                warn!(%err, "malformed control message");
                self.conns.close(conn);
                return;
            }
        };
        let reply = match CommandCode::from_code(msg.code) {
            Some(cmd) => self.execute(cmd, &msg, conn, generation),
            None => Some(Message::error(&CommandError::UnknownCommand).encode()),
        };
        if let Some(payload) = reply {
            self.send_reply(conn, generation, payload).await;
        }
    }

    async fn send_reply(&mut self, conn: usize, generation: u64, payload: BytesMut) {
        let delivered = match self.conns.get_mut(conn, generation) {
            Some(c) => c.send(payload).await,
            None => return,
        };
        if !delivered {
            self.conns.close(conn);
        }
    }

    /// Dispatch one command. `None` means the reply is deferred (a pending
    /// `stop` resolves through the death notification).
    fn execute(
        &mut self,
        cmd: CommandCode,
        msg: &Message,
        conn: usize,
        generation: u64,
    ) -> Option<BytesMut> {
        use CommandCode::*;
        let result = match cmd {
            List => {
                let cursor = msg.cursor().unwrap_or(0) as usize;
                return Some(encode_list_page(&self.table, cursor, LIST_PAGE));
            }
            Status => self.cmd_status(msg),
            GetBuf => match self.named_slot(msg) {
                Ok(idx) => {
                    let slot = self.table.get(idx).expect("index from lookup");
                    let segments = match &slot.ring {
                        Some(ring) => ring.snapshot(),
                        None => (&[][..], &[][..]),
                    };
                    // Encoded directly so the two wrap segments gather
                    // into one frame without an intermediate copy.
                    return Some(encode_buffer_reply(segments));
                }
                Err(err) => Err(err),
            },
            Start => self.cmd_start(msg, SpawnMode::Normal),
            Spawn => self.cmd_start(msg, SpawnMode::RunOnce),
            Stout => self.cmd_start(msg, SpawnMode::PassThrough),
            Stop => match self.cmd_stop(msg, conn, generation) {
                Ok(deferred) => {
                    if deferred {
                        return None;
                    }
                    Ok(Message::ok())
                }
                Err(err) => Err(err),
            },
            Flush => self.cmd_flush(msg),
            Remove => self.cmd_remove(msg),
            Sighup => self.cmd_sighup(msg),
            Reboot => self.cmd_power(sequencer::REBOOT),
            Shutdown => self.cmd_power(sequencer::SHUTDOWN),
            Poweroff => self.cmd_power(sequencer::POWEROFF),
        };
        Some(match result {
            Ok(reply) => reply.encode(),
            Err(err) => Message::error(&err).encode(),
        })
    }

    fn named_slot(&self, msg: &Message) -> std::result::Result<usize, CommandError> {
        let name = msg
            .name()
            .ok_or(CommandError::Os(nix::errno::Errno::EINVAL))?;
        self.table
            .find_by_name(name)
            .ok_or(CommandError::UnknownService)
    }

    fn cmd_status(&mut self, msg: &Message) -> std::result::Result<Message, CommandError> {
        let idx = self.named_slot(msg)?;
        let slot = self.table.get(idx).expect("index from lookup");
        let mut reply = Message::ok().with(Attr::Name(slot.name.clone()));
        if let Some(pid) = slot.pid {
            reply = reply
                .with(Attr::Pid(pid.as_raw()))
                .with(Attr::Uptime(slot.started_at.elapsed().as_secs()));
        } else if let Some(code) = slot.exit_code {
            reply = reply.with(Attr::ExitCode(code));
        }
        if slot.has_output() {
            reply = reply.with(Attr::HasOutput);
        }
        Ok(reply)
    }

    fn cmd_start(
        &mut self,
        msg: &Message,
        mode: SpawnMode,
    ) -> std::result::Result<Message, CommandError> {
        if matches!(self.seq.state(), SysState::Stopping | SysState::Shutdown) {
            return Err(CommandError::ShutdownInProgress);
        }
        let name = msg
            .name()
            .ok_or(CommandError::Os(nix::errno::Errno::EINVAL))?;
        let idx = match self.table.find_by_name(name) {
            Some(idx) => idx,
            None => self.table.allocate(name).map_err(|err| match err {
                AllocError::Full => CommandError::OutOfSlots,
                AllocError::Duplicate => CommandError::AlreadyRunning,
            })?,
        };
        let pid = self.spawn_slot(idx, mode)?;
        Ok(Message::ok().with(Attr::Pid(pid.as_raw())))
    }

    /// Returns Ok(true) when the reply is deferred to the notification.
    fn cmd_stop(
        &mut self,
        msg: &Message,
        conn: usize,
        generation: u64,
    ) -> std::result::Result<bool, CommandError> {
        let idx = self.named_slot(msg)?;
        let slot = self.table.get_mut(idx).expect("index from lookup");
        let Some(pid) = slot.pid else {
            return Err(CommandError::NotRunning);
        };
        launcher::request_stop(pid)
            .map_err(|errno| CommandError::Os(errno))?;
        slot.killed = true;
        slot.state = ServiceState::Stopping;
        if let Some(c) = self.conns.get_mut(conn, generation) {
            c.watch_pid = Some(pid);
        }
        Ok(true)
    }

    fn cmd_flush(&mut self, msg: &Message) -> std::result::Result<Message, CommandError> {
        let idx = self.named_slot(msg)?;
        let slot = self.table.get_mut(idx).expect("index from lookup");
        slot.ring = None;
        Ok(Message::ok())
    }

    fn cmd_remove(&mut self, msg: &Message) -> std::result::Result<Message, CommandError> {
        let idx = self.named_slot(msg)?;
        let slot = self.table.get(idx).expect("index from lookup");
        if slot.is_alive() {
            return Err(CommandError::StillRunning);
        }
        self.table.free(idx);
        Ok(Message::ok())
    }

    fn cmd_sighup(&mut self, msg: &Message) -> std::result::Result<Message, CommandError> {
        let idx = self.named_slot(msg)?;
        let slot = self.table.get(idx).expect("index from lookup");
        let Some(pid) = slot.pid else {
            return Err(CommandError::NotRunning);
        };
        launcher::send_hangup(pid).map_err(|errno| CommandError::Os(errno))?;
        Ok(Message::ok())
    }

    fn cmd_power(
        &mut self,
        script: &'static str,
    ) -> std::result::Result<Message, CommandError> {
        if matches!(self.seq.state(), SysState::Stopping | SysState::Shutdown) {
            return Err(CommandError::ShutdownInProgress);
        }
        // The reply goes out before teardown closes the control plane; the
        // terminal script only spawns once every service is reaped.
        self.request_shutdown(script);
        Ok(Message::ok())
    }
}

async fn accept_on(listener: &Option<UnixListener>) -> std::io::Result<UnixStream> {
    let listener = listener.as_ref().expect("guarded by is_some");
    let (stream, _addr) = listener.accept().await?;
    Ok(stream)
}

/// Record a terminal exit status on a slot; its record stays visible to
/// `list`/`status` until removed or restarted.
fn park(slot: &mut crate::registry::ServiceSlot, status: std::process::ExitStatus) {
    slot.exit_code = Some(launcher::exit_code_of(status));
    slot.state = if status.success() {
        ServiceState::ExitedOk
    } else {
        ServiceState::ExitedFail
    };
}

fn mode_of(run_once: bool, pass_through: bool) -> SpawnMode {
    if run_once {
        SpawnMode::RunOnce
    } else if pass_through {
        SpawnMode::PassThrough
    } else {
        SpawnMode::Normal
    }
}

/// Drain one service's output pipe into the event channel until EOF.
fn spawn_output_reader(
    mut output: pipe::Receiver,
    slot: usize,
    generation: u64,
    events: mpsc::UnboundedSender<Event>,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            match output.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = buf[..n].to_vec();
                    if events
                        .send(Event::ServiceOutput { slot, generation, chunk })
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
        let _ = events.send(Event::ServiceEof { slot, generation });
    });
}

/// Encode one page of `list`: per-service records in table order starting
/// at `cursor`, bounded by `budget` bytes, with a continuation cursor when
/// more slots remain.
pub fn encode_list_page(table: &ProcessTable, cursor: usize, budget: usize) -> BytesMut {
    let mut msg = Message::ok();
    let mut used = 0usize;
    let mut next = None;
    for (idx, slot) in table.iter() {
        if idx < cursor {
            continue;
        }
        // Worst-case record: name, one integer attribute, the output flag.
        let record_size = (4 + slot.name.len()) + 8 + 4;
        if used + record_size > budget {
            next = Some(idx as u32);
            break;
        }
        used += record_size;
        msg.attrs.push(Attr::Name(slot.name.clone()));
        if let Some(pid) = slot.pid {
            msg.attrs.push(Attr::Pid(pid.as_raw()));
        } else if let Some(code) = slot.exit_code {
            msg.attrs.push(Attr::ExitCode(code));
        }
        if slot.has_output() {
            msg.attrs.push(Attr::HasOutput);
        }
    }
    if let Some(next) = next {
        msg.attrs.push(Attr::Cursor(next));
    }
    msg.encode()
}

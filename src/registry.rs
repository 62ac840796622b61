use std::time::Instant;

use nix::unistd::Pid;
use tokio::process::Child;

use crate::ring::RingBuffer;

/// Lifecycle state of a service slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Known but not running, no exit status recorded.
    Stopped,
    /// Spawn in progress.
    Starting,
    /// Process is alive.
    Running,
    /// SIGTERM sent by the supervisor, waiting for the death.
    Stopping,
    /// Terminated with status 0.
    ExitedOk,
    /// Terminated with a non-zero status or by signal.
    ExitedFail,
}

/// How a service's stdio and lifetime are handled at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    /// Long-running, output captured into the ring buffer.
    Normal,
    /// One-shot: slot is released after a clean exit.
    RunOnce,
    /// Long-running, stdio inherited from the supervisor, no capture.
    PassThrough,
}

/// One entry in the process table, representing one named service.
#[derive(Debug)]
pub struct ServiceSlot {
    pub name: String,
    pub state: ServiceState,
    pub pid: Option<Pid>,
    pub child: Option<Child>,
    /// Exit code (or 128+signal) once the slot holds a terminal status.
    pub exit_code: Option<i32>,
    /// Captured output; allocated on first write, released on flush.
    pub ring: Option<RingBuffer>,
    pub run_once: bool,
    pub pass_through: bool,
    /// The supervisor sent the kill sequence; suppresses auto-restart.
    pub killed: bool,
    /// Reload bookkeeping: candidate for removal after the current scan.
    pub stale: bool,
    pub started_at: Instant,
    /// Bumped on every spawn so events from a previous occupant of a
    /// reused slot index can be discarded.
    pub generation: u64,
}

impl ServiceSlot {
    fn new(name: String, generation: u64) -> Self {
        ServiceSlot {
            name,
            state: ServiceState::Stopped,
            pid: None,
            child: None,
            exit_code: None,
            ring: None,
            run_once: false,
            pass_through: false,
            killed: false,
            stale: false,
            started_at: Instant::now(),
            generation,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.pid.is_some()
    }

    pub fn has_output(&self) -> bool {
        self.ring.as_ref().is_some_and(|r| !r.is_empty())
    }
}

/// Slot allocation failure.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AllocError {
    /// The fixed slot capacity is exhausted.
    #[error("process table is full")]
    Full,
    /// A slot with this name already exists.
    #[error("service name already in use")]
    Duplicate,
}

/// Bounded arena of service slots with stable indices.
///
/// A slot is never moved once allocated; removal clears it in place and
/// makes the index reusable.
pub struct ProcessTable {
    slots: Vec<Option<ServiceSlot>>,
    next_generation: u64,
}

impl ProcessTable {
    pub fn new(capacity: usize) -> Self {
        ProcessTable {
            slots: (0..capacity).map(|_| None).collect(),
            next_generation: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.name == name))
    }

    /// Allocate a slot for `name`, left stopped. The caller must not hold
    /// a slot for the same name already; duplicates are rejected.
    pub fn allocate(&mut self, name: &str) -> Result<usize, AllocError> {
        if self.find_by_name(name).is_some() {
            // Uniqueness invariant: at most one slot per name.
            return Err(AllocError::Duplicate);
        }
        let idx = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(AllocError::Full)?;
        let generation = self.next_generation;
        self.next_generation += 1;
        self.slots[idx] = Some(ServiceSlot::new(name.to_string(), generation));
        Ok(idx)
    }

    /// Clear a slot in place, releasing its ring buffer.
    pub fn free(&mut self, idx: usize) {
        self.slots[idx] = None;
    }

    pub fn get(&self, idx: usize) -> Option<&ServiceSlot> {
        self.slots.get(idx).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut ServiceSlot> {
        self.slots.get_mut(idx).and_then(|s| s.as_mut())
    }

    /// Hand out a fresh generation number for a respawn of an existing slot.
    pub fn bump_generation(&mut self, idx: usize) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        if let Some(slot) = self.get_mut(idx) {
            slot.generation = generation;
        }
        generation
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ServiceSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut ServiceSlot)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|s| (i, s)))
    }

    /// Number of slots whose process is still alive.
    pub fn n_alive(&self) -> usize {
        self.iter().filter(|(_, s)| s.is_alive()).count()
    }
}

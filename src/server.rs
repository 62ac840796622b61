//! Control-socket plumbing: the listener, the bounded connection table,
//! and frame transport.
//!
//! Each accepted connection is split: the read half lives in a spawned
//! reader task that forwards decoded frames into the supervisor's event
//! channel; the write half stays in the table so the supervisor can write
//! replies and asynchronous death notifications. Frames are length-prefixed
//! by `LengthDelimitedCodec`, preserving the protocol's one-message-per-read
//! contract over a stream socket.

use std::path::Path;
use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use nix::unistd::Pid;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::protocol::MAX_FRAME;
use crate::supervisor::Event;
use crate::Result;

/// Bound on one reply write before the connection is declared stuck. This
/// is the writability wait of the best-effort delivery rule; a client that
/// cannot drain a frame within it is closed, the service is unaffected.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME)
        .new_codec()
}

/// Remove a stale socket from a previous run and bind fresh.
pub fn bind_control_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale control socket"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    Ok(UnixListener::bind(path)?)
}

/// One accepted control client.
pub struct Connection {
    writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    /// Set while the client waits for a death notification after `stop`.
    pub watch_pid: Option<Pid>,
    pub generation: u64,
}

impl Connection {
    /// Best-effort frame delivery; false means the connection is beyond
    /// saving and the caller should drop it.
    pub async fn send(&mut self, payload: BytesMut) -> bool {
        match tokio::time::timeout(SEND_TIMEOUT, self.writer.send(payload.freeze())).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                debug!(%err, "control connection write failed");
                false
            }
            Err(_) => {
                warn!("control connection stalled, dropping it");
                false
            }
        }
    }
}

/// Bounded arena of control connections with stable indices.
pub struct ConnectionTable {
    conns: Vec<Option<Connection>>,
    next_generation: u64,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        ConnectionTable {
            conns: (0..capacity).map(|_| None).collect(),
            next_generation: 1,
        }
    }

    /// Adopt the write half of an accepted stream, or None when the table
    /// is full (the caller drops the connection).
    pub fn insert(&mut self, write_half: OwnedWriteHalf) -> Option<(usize, u64)> {
        let idx = self.conns.iter().position(|c| c.is_none())?;
        let generation = self.next_generation;
        self.next_generation += 1;
        self.conns[idx] = Some(Connection {
            writer: FramedWrite::new(write_half, codec()),
            watch_pid: None,
            generation,
        });
        Some((idx, generation))
    }

    /// Fetch a connection only if the generation still matches; a stale
    /// event for a reused index resolves to None.
    pub fn get_mut(&mut self, idx: usize, generation: u64) -> Option<&mut Connection> {
        self.conns
            .get_mut(idx)
            .and_then(|c| c.as_mut())
            .filter(|c| c.generation == generation)
    }

    pub fn close(&mut self, idx: usize) {
        if let Some(slot) = self.conns.get_mut(idx) {
            *slot = None;
        }
    }

    /// Indices of connections watching `pid`.
    pub fn watchers_of(&self, pid: Pid) -> Vec<usize> {
        self.conns
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().filter(|c| c.watch_pid == Some(pid)).map(|_| i))
            .collect()
    }

    pub fn index_mut(&mut self, idx: usize) -> Option<&mut Connection> {
        self.conns.get_mut(idx).and_then(|c| c.as_mut())
    }

    /// Drop every connection; used when shutdown closes the control plane.
    pub fn close_all(&mut self) {
        for slot in &mut self.conns {
            *slot = None;
        }
    }
}

/// Read frames off one connection and forward them as events until EOF or
/// error. Malformed framing shows up here as a codec error and closes the
/// connection.
pub fn spawn_reader(
    read_half: OwnedReadHalf,
    conn: usize,
    generation: u64,
    events: mpsc::UnboundedSender<Event>,
) {
    tokio::spawn(async move {
        let mut frames = FramedRead::new(read_half, codec());
        while let Some(res) = frames.next().await {
            match res {
                Ok(frame) => {
                    if events
                        .send(Event::Request { conn, generation, frame })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(err) => {
                    debug!(%err, "control connection read failed");
                    break;
                }
            }
        }
        let _ = events.send(Event::ConnClosed { conn, generation });
    });
}

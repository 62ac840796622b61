//! Reconciles the service directory against the process table.
//!
//! Valid entries are regular, executable files (or symlinks to them) whose
//! name fits the table's fixed width; hidden, non-executable, and oversized
//! entries are ignored. The diff is computed by marking: every in-use slot
//! is marked stale, the scan clears the mark for entries still present, and
//! whatever stays marked is stopped or freed afterwards.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::warn;

use crate::config::NAME_MAX;
use crate::registry::ProcessTable;

/// Outcome of a successful reconcile: what the supervisor should act on.
#[derive(Debug, Default)]
pub struct ReloadPlan {
    /// Slots newly allocated for entries that appeared, left stopped.
    pub to_start: Vec<usize>,
    /// Running slots whose entry disappeared; stop and free on reap.
    pub to_stop: Vec<usize>,
    /// Names of never-started slots whose entry disappeared, freed in place.
    pub freed: Vec<String>,
}

/// Make the table match the directory.
///
/// On a scan failure the stale marks are discarded and the table is left
/// untouched: services keep running under the last-known-good view rather
/// than being torn down over a partial scan.
pub fn reconcile(table: &mut ProcessTable, dir: &Path) -> io::Result<ReloadPlan> {
    for (_, slot) in table.iter_mut() {
        slot.stale = true;
    }

    let mut plan = ReloadPlan::default();
    if let Err(err) = scan(table, dir, &mut plan) {
        for (_, slot) in table.iter_mut() {
            slot.stale = false;
        }
        // Slots allocated before the failure stay; they were valid entries.
        return Err(err);
    }

    let mut stale = Vec::new();
    for (idx, slot) in table.iter() {
        if slot.stale {
            stale.push(idx);
        }
    }
    for idx in stale {
        let slot = table.get(idx).expect("stale index is in use");
        if slot.is_alive() {
            plan.to_stop.push(idx);
        } else {
            plan.freed.push(slot.name.clone());
            table.free(idx);
        }
    }
    Ok(plan)
}

fn scan(table: &mut ProcessTable, dir: &Path, plan: &mut ReloadPlan) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !entry_is_service(dir, name) {
            continue;
        }
        match table.find_by_name(name) {
            Some(idx) => {
                if let Some(slot) = table.get_mut(idx) {
                    slot.stale = false;
                }
            }
            None => match table.allocate(name) {
                Ok(idx) => plan.to_start.push(idx),
                Err(err) => {
                    warn!(service = name, %err, "cannot track new service");
                }
            },
        }
    }
    Ok(())
}

/// A service entry is a non-hidden, name-length-bounded, executable regular
/// file; symlinks are followed.
fn entry_is_service(dir: &Path, name: &str) -> bool {
    if name.starts_with('.') || name.len() > NAME_MAX {
        return false;
    }
    // Unreadable entries (racing unlink, dangling symlink) are skipped, not
    // treated as a scan failure.
    let Ok(meta) = std::fs::metadata(dir.join(name)) else {
        return false;
    };
    meta.is_file() && meta.permissions().mode() & 0o111 != 0
}

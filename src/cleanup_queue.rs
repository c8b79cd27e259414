//! C7 — Cleanup Queue + Reclaimer: an unbounded FIFO of files marked for deletion, and a
//! background worker that deletes them and prunes now-empty parent directories (§4.7).
use crate::error::ReclaimError;
use crate::types::InstanceRef;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

/// Producer handle for C7. Cloning is cheap (wraps an `UnboundedSender`); every producer in
/// §4.7 (C3 on abort, C5 after submit, C4 on orphan route) holds one of these.
#[derive(Clone)]
pub struct CleanupQueue {
    sender: UnboundedSender<InstanceRef>,
}

impl CleanupQueue {
    /// Enqueues `instance` for reclamation. Never blocks (the queue is unbounded, §4.7).
    pub fn enqueue(&self, instance: InstanceRef) {
        // The only way `send` fails is if every receiver has been dropped, which only happens
        // once the reclaimer has shut down; reclaim failures are swallowed, not fatal (§7).
        if self.sender.send(instance).is_err() {
            tracing::warn!("cleanup queue has no receiver; instance will not be reclaimed");
        }
    }
}

/// Builds a connected `(CleanupQueue, Reclaimer)` pair.
pub fn cleanup_queue() -> (CleanupQueue, Reclaimer) {
    let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
    (CleanupQueue { sender }, Reclaimer { receiver })
}

/// The single worker loop that actually deletes files (§4.7, §5: "A single reclaimer worker").
pub struct Reclaimer {
    receiver: UnboundedReceiver<InstanceRef>,
}

impl Reclaimer {
    /// Runs until the queue is closed or `cancel` fires. On cancellation, finishes the delete
    /// currently in flight (if any) and then exits (§5).
    pub async fn run(mut self, managed_root: Utf8PathBuf, cancel: CancellationToken) {
        loop {
            let instance = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("reclaimer received cancellation, draining queue");
                    break;
                }
                item = self.receiver.recv() => match item {
                    Some(instance) => instance,
                    None => break,
                },
            };
            reclaim_one(&managed_root, &instance);
        }
        // Drain whatever is already queued so the no-orphan-file property (§8 property 1)
        // holds even across a shutdown that races the last few enqueues.
        while let Ok(instance) = self.receiver.try_recv() {
            reclaim_one(&managed_root, &instance);
        }
    }
}

/// Deletes the instance's file (if present) and prunes now-empty ancestor directories, never
/// climbing above `managed_root` (§4.7). Failures are logged and swallowed — reclaim is never
/// fatal (§7).
fn reclaim_one(managed_root: &Utf8Path, instance: &InstanceRef) {
    match delete_file(&instance.absolute_path) {
        Ok(()) => tracing::info!(instance = %instance, "reclaimed"),
        Err(e) => tracing::warn!(instance = %instance, error = %e, "failed to delete file"),
    }
    if let Some(parent) = instance.absolute_path.parent() {
        if let Err(e) = prune_empty_dirs(managed_root, parent) {
            tracing::warn!(path = %parent, error = %e, "failed to prune directory");
        }
    }
}

fn delete_file(path: &Utf8Path) -> Result<(), ReclaimError> {
    match fs_err::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ReclaimError::Delete {
            path: path.to_path_buf(),
            source: std::io::Error::new(e.kind(), e.to_string()),
        }),
    }
}

/// Walks up from `dir`, removing directories that have become empty, stopping as soon as a
/// directory is non-empty or we've reached (and not removed) `managed_root` itself (§3, §4.7:
/// "Never remove the managed root itself").
fn prune_empty_dirs(managed_root: &Utf8Path, dir: &Utf8Path) -> Result<(), ReclaimError> {
    let mut current = dir.to_path_buf();
    loop {
        if current == managed_root || !current.starts_with(managed_root) {
            return Ok(());
        }
        let is_empty = match fs_err::read_dir(&current) {
            Ok(mut entries) => entries.next().is_none(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(ReclaimError::Prune {
                    path: current.clone(),
                    source: std::io::Error::new(e.kind(), e.to_string()),
                })
            }
        };
        if !is_empty {
            return Ok(());
        }
        match fs_err::remove_dir(&current) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(ReclaimError::Prune {
                    path: current.clone(),
                    source: std::io::Error::new(e.kind(), e.to_string()),
                })
            }
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return Ok(()),
        }
    }
}

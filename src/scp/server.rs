//! TCP accept loop for C3, structurally mirroring the teacher's `dicom_listener_tcp_loop`:
//! one thread pool dispatching `handle_connection` per accepted socket.
use crate::scp::association::{handle_connection, ScpDependencies};
use crate::thread_pool::ThreadPool;
use crate::types::AssociationId;
use std::net::{SocketAddrV4, TcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Poll interval while the listener has no pending connection, used to notice `cancel` without
/// blocking forever inside `accept()` (§5 "Cancellation").
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Runs the blocking accept loop until `cancel` fires. Intended to be driven from
/// `tokio::task::spawn_blocking`, matching the teacher's listener/async split (§5).
pub fn scp_listener_loop(
    address: SocketAddrV4,
    deps: Arc<ScpDependencies>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(address)?;
    listener.set_nonblocking(true)?;
    tracing::info!(address = %address, "listening for DICOM associations");

    let mut pool = ThreadPool::new(deps.settings.listener_threads.get(), "dicom_scp");
    let next_association_id = AtomicU64::new(1);

    loop {
        if cancel.is_cancelled() {
            tracing::info!("listener received shutdown signal");
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let association_id = AssociationId(next_association_id.fetch_add(1, Ordering::SeqCst));
                let deps = Arc::clone(&deps);
                let cancel = cancel.clone();
                tracing::debug!(association_id = %association_id, peer = %peer, "accepted connection");
                pool.execute(move || {
                    if let Err(e) = handle_connection(stream, association_id, &cancel, &deps) {
                        tracing::error!(association_id = %association_id, error = %e, "association ended with error");
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to accept connection");
            }
        }
    }

    pool.shutdown();
    Ok(())
}

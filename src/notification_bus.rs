//! C4 — Notification Bus: fans received-instance events out to the per-called-AE job
//! processor that owns them, and routes orphans (no processor registered) straight to
//! reclamation (§4.4).
use crate::cleanup_queue::CleanupQueue;
use crate::types::{CalledAeTitle, InstanceRef};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc::{Receiver, Sender};

/// Bounded per-processor mailbox size. Large enough to absorb a burst of instances from one
/// association without the publisher blocking on a slow processor for long (§4.4).
const PROCESSOR_CHANNEL_CAPACITY: usize = 256;

/// The publish side of the bus. C3 holds one of these; publishing is synchronous from the
/// SCP's point of view (blocking on channel backpressure, never dropping an instance, §4.4).
pub struct NotificationBus {
    processors: RwLock<HashMap<CalledAeTitle, Sender<InstanceRef>>>,
    cleanup: CleanupQueue,
}

impl NotificationBus {
    pub fn new(cleanup: CleanupQueue) -> Self {
        Self {
            processors: RwLock::new(HashMap::new()),
            cleanup,
        }
    }

    /// Registers the receiving end for `called_ae_title`'s job processor, returning the sender
    /// half for the bus to use. Re-registering replaces any prior registration (§4.4).
    pub fn register(&self, called_ae_title: CalledAeTitle) -> Receiver<InstanceRef> {
        let (sender, receiver) = tokio::sync::mpsc::channel(PROCESSOR_CHANNEL_CAPACITY);
        self.processors
            .write()
            .unwrap()
            .insert(called_ae_title, sender);
        receiver
    }

    pub fn unregister(&self, called_ae_title: &CalledAeTitle) {
        self.processors.write().unwrap().remove(called_ae_title);
    }

    /// Delivers `instance` to its called AE's processor. If no processor is registered, or its
    /// mailbox has been closed, the instance is routed to C7 as an orphan (§4.4: "An instance
    /// with no registered processor is reclaimed immediately rather than retained forever").
    pub async fn publish(&self, instance: InstanceRef) {
        let sender = self
            .processors
            .read()
            .unwrap()
            .get(&instance.called_ae_title)
            .cloned();

        let Some(sender) = sender else {
            tracing::warn!(instance = %instance, "no processor registered, routing to cleanup");
            self.cleanup.enqueue(instance);
            return;
        };

        if let Err(e) = sender.send(instance).await {
            tracing::warn!(
                instance = %e.0,
                "processor mailbox closed, routing to cleanup"
            );
            self.cleanup.enqueue(e.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup_queue::cleanup_queue;
    use crate::types::{AssociationId, CallingAeTitle};
    use tokio_util::sync::CancellationToken;

    fn instance(called_ae: &str) -> InstanceRef {
        InstanceRef {
            patient_id: "PAT1".to_string(),
            study_instance_uid: "STUDY_A".to_string(),
            series_instance_uid: "SER1".to_string(),
            sop_instance_uid: "1.2.3".to_string(),
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".to_string(),
            called_ae_title: CalledAeTitle::new(called_ae.to_string()),
            calling_ae_title: CallingAeTitle::new("MOD1".to_string()),
            association_id: AssociationId(1),
            received_at: time::OffsetDateTime::now_utc(),
            absolute_path: camino::Utf8PathBuf::from("/tmp/does-not-matter.dcm"),
        }
    }

    #[tokio::test]
    async fn publish_delivers_to_registered_processor() {
        let (cleanup, _reclaimer) = cleanup_queue();
        let bus = NotificationBus::new(cleanup);
        let mut rx = bus.register(CalledAeTitle::new("AET1".to_string()));

        bus.publish(instance("AET1")).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.sop_instance_uid, "1.2.3");
    }

    #[tokio::test]
    async fn publish_routes_orphan_to_cleanup() {
        let (cleanup, reclaimer) = cleanup_queue();
        let bus = NotificationBus::new(cleanup);

        bus.publish(instance("UNKNOWN_AET")).await;

        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        // Draining must not panic even though the file does not exist on disk.
        drop(bus);
        reclaimer.run(root, CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn unregister_stops_delivery_and_routes_to_cleanup() {
        let (cleanup, _reclaimer) = cleanup_queue();
        let bus = NotificationBus::new(cleanup);
        let _rx = bus.register(CalledAeTitle::new("AET1".to_string()));
        bus.unregister(&CalledAeTitle::new("AET1".to_string()));

        // No panic, no deadlock; falls through to the orphan path.
        bus.publish(instance("AET1")).await;
    }
}

//! Top-level wiring: constructs C1 through C8 and drives them together, mirroring the
//! teacher's `run_everything` (`try_join!` over a listener, a storage loop, and a registration
//! loop).
use crate::cleanup_queue::cleanup_queue;
use crate::job_processor;
use crate::job_submitter::JobSubmitter;
use crate::notification_bus::NotificationBus;
use crate::peer_registry::{PeerRegistry, PeerRegistrySnapshot};
use crate::platform_client::{JobsService, PayloadsService};
use crate::reception_store::ReceptionStore;
use crate::scp::association::ScpDependencies;
use crate::scp::server::scp_listener_loop;
use crate::settings::RelaySettings;
use crate::shutdown::Shutdown;
use crate::storage_gate::{FilesystemStorageGate, StorageGate};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

/// Runs every component until `shutdown` is cancelled, then drains each in turn and returns.
///
/// `jobs`/`payloads` are handed in rather than constructed here so that callers (the binary's
/// `main`, or integration tests) choose the concrete platform client (§4.6, §10.4).
pub async fn run(
    settings: RelaySettings,
    initial_registry: PeerRegistrySnapshot,
    jobs: Arc<dyn JobsService>,
    payloads: Arc<dyn PayloadsService>,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let settings = Arc::new(settings);

    let storage_gate: Arc<dyn StorageGate> = Arc::new(FilesystemStorageGate::new(
        settings.storage_root.clone(),
        settings.watermark_percent,
        settings.reserved_bytes,
    ));
    let reception_store = Arc::new(ReceptionStore::new(
        settings.storage_root.clone(),
        Arc::clone(&storage_gate),
    ));
    let (cleanup, reclaimer) = cleanup_queue();
    let bus = Arc::new(NotificationBus::new(cleanup.clone()));
    let registry = Arc::new(PeerRegistry::new(initial_registry));

    let submitter = Arc::new(JobSubmitter::new(
        jobs,
        payloads,
        Arc::clone(&storage_gate),
        settings.submission_workers,
        settings.rpc_timeout,
    ));

    let mut processor_handles = Vec::new();
    for called_ae in registry.load().called_aes() {
        let processor_settings = job_processor::parse_processor_config(&called_ae.processor_config)
            .map_err(|e| anyhow::anyhow!("invalid processorConfig for {}: {e}", called_ae.name))?;
        let receiver = bus.register(called_ae.ae_title.clone());
        let handle = job_processor::spawn(
            called_ae.ae_title.clone(),
            processor_settings,
            receiver,
            Arc::clone(&submitter),
            cleanup.clone(),
            shutdown.token(),
        );
        processor_handles.push(handle);
    }

    let reclaimer_handle = tokio::spawn(reclaimer.run(settings.storage_root.clone(), shutdown.token()));

    let deps = Arc::new(ScpDependencies {
        registry: Arc::clone(&registry),
        storage_gate,
        reception_store,
        bus: Arc::clone(&bus),
        cleanup,
        settings: Arc::clone(&settings),
        active_associations: Arc::new(AtomicUsize::new(0)),
        runtime: tokio::runtime::Handle::current(),
    });

    let listener_address = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, settings.listener_port);
    let listener_cancel = shutdown.token();
    let listener_handle = tokio::task::spawn_blocking(move || {
        scp_listener_loop(listener_address, deps, listener_cancel)
    });

    // Either Ctrl-C or an externally-cancelled token (e.g. a test driving `shutdown` directly)
    // ends the wait.
    tokio::select! {
        _ = shutdown.wait_for_signal() => {}
        _ = shutdown.token().cancelled() => {}
    }

    let grace_period = settings.grace_period;
    let drain = async move {
        listener_handle.await??;
        reclaimer_handle.await?;
        for handle in processor_handles {
            handle.await?;
        }
        Ok::<(), anyhow::Error>(())
    };
    // Bounded by `gracePeriod` (§5, §6): a collaborator that never drains stops the process from
    // exiting forever instead of just stopping this wait.
    match shutdown.within_grace_period(grace_period, drain).await {
        Some(result) => result,
        None => Ok(()),
    }
}

/// Calls [`run`] using configuration from environment variables, matching the teacher's
/// `run_everything_from_env` split between env-loading and wiring.
#[cfg(feature = "reqwest-client")]
pub async fn run_from_env(shutdown: Shutdown) -> anyhow::Result<()> {
    use crate::config::{bootstrap_registry_from_env, get_config};
    use crate::platform_client::http::HttpPlatformClient;

    let settings: RelaySettings = get_config().extract()?;
    let registry = bootstrap_registry_from_env()?;
    let client = Arc::new(HttpPlatformClient::new(
        settings.platform_base_url.clone(),
        reqwest::Client::new(),
    ));
    let jobs: Arc<dyn JobsService> = client.clone();
    let payloads: Arc<dyn PayloadsService> = client;

    run(settings, registry, jobs, payloads, shutdown).await
}

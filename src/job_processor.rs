//! C5 — Job Processor: one long-lived task per called-AE that groups instances into batches
//! and drives them through C6 with retry/backoff (§4.5).
use crate::cleanup_queue::CleanupQueue;
use crate::dicom_tags::{parse_tag_ref, read_tag_value};
use crate::error::ProcessorConfigError;
use crate::job_submitter::JobSubmitter;
use crate::types::{Batch, CalledAeTitle, InstanceRef, Priority, MAX_RETRY};
use camino::Utf8Path;
use dicom::core::Tag;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const MIN_TIMEOUT_SECS: u64 = 5;

/// A validated `processorConfig` map (§4.5's table). Construction is the only place unrecognized
/// keys and out-of-range values are rejected.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub timeout: Duration,
    pub job_retry_delay: Duration,
    pub priority: Priority,
    pub group_by: Tag,
    pub group_by_name: String,
    /// `(pipeline name, pipeline id)` pairs, in the order they were declared.
    pub pipelines: Vec<(String, String)>,
}

pub fn parse_processor_config(
    raw: &BTreeMap<String, String>,
) -> Result<ProcessorSettings, ProcessorConfigError> {
    let mut timeout_secs: u64 = 5;
    let mut job_retry_delay_ms: u64 = 5000;
    let mut priority = Priority::Normal;
    let mut group_by_name = "StudyInstanceUID".to_string();
    let mut pipelines = Vec::new();

    for (key, value) in raw {
        if let Some(name) = key.strip_prefix("pipeline-") {
            pipelines.push((name.to_string(), value.clone()));
            continue;
        }
        match key.as_str() {
            "timeout" => {
                timeout_secs = value
                    .parse()
                    .map_err(|_| ProcessorConfigError::InvalidTimeout)?;
                if timeout_secs < MIN_TIMEOUT_SECS {
                    return Err(ProcessorConfigError::InvalidTimeout);
                }
            }
            "jobRetryDelay" => {
                job_retry_delay_ms = value
                    .parse()
                    .map_err(|_| ProcessorConfigError::InvalidJobRetryDelay)?;
            }
            "priority" => {
                priority = value.parse()?;
            }
            "groupBy" => {
                group_by_name = value.clone();
            }
            other => return Err(ProcessorConfigError::UnrecognizedKey(other.to_string())),
        }
    }

    if pipelines.is_empty() {
        return Err(ProcessorConfigError::NoPipelinesConfigured);
    }
    let group_by = parse_tag_ref(&group_by_name)?;

    Ok(ProcessorSettings {
        timeout: Duration::from_secs(timeout_secs),
        job_retry_delay: Duration::from_millis(job_retry_delay_ms),
        priority,
        group_by,
        group_by_name,
        pipelines,
    })
}

/// Spawns C5 for one called-AE. Returns a handle that should be awaited on shutdown so the
/// caller knows the drain (§4.5 "Cancellation") has completed.
pub fn spawn(
    called_ae_title: CalledAeTitle,
    settings: ProcessorSettings,
    receiver: Receiver<InstanceRef>,
    submitter: Arc<JobSubmitter>,
    cleanup: CleanupQueue,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(
        called_ae_title,
        settings,
        receiver,
        submitter,
        cleanup,
        shutdown,
    ))
}

async fn run(
    called_ae_title: CalledAeTitle,
    settings: ProcessorSettings,
    mut receiver: Receiver<InstanceRef>,
    submitter: Arc<JobSubmitter>,
    cleanup: CleanupQueue,
    shutdown: CancellationToken,
) {
    let mut batches: HashMap<String, Batch> = HashMap::new();
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    let mut inflight: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!(called_ae_title = %called_ae_title, "job processor draining on shutdown");
                break;
            }
            maybe_instance = receiver.recv() => {
                match maybe_instance {
                    Some(instance) => handle_reception(&settings, &mut batches, instance, &cleanup),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                seal_quiescent_batches(&settings, &mut batches, &called_ae_title, &submitter, &cleanup, &mut inflight);
            }
            Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
        }
    }

    // Drain: hand every remaining instance (in-progress batches, plus anything still in the
    // mailbox) to C7, per §4.5 "Cancellation".
    receiver.close();
    while let Ok(instance) = receiver.try_recv() {
        handle_reception(&settings, &mut batches, instance, &cleanup);
    }
    for (_, batch) in batches.drain() {
        for item in batch.into_items() {
            cleanup.enqueue(item);
        }
    }
    while inflight.join_next().await.is_some() {}
}

fn handle_reception(
    settings: &ProcessorSettings,
    batches: &mut HashMap<String, Batch>,
    instance: InstanceRef,
    cleanup: &CleanupQueue,
) {
    let key = match read_tag_value(
        &instance.absolute_path,
        settings.group_by,
        &instance.sop_instance_uid,
    ) {
        Ok(key) => key,
        Err(e) => {
            tracing::error!(instance = %instance, error = %e, "grouping tag unreadable, reclaiming file");
            cleanup.enqueue(instance);
            return;
        }
    };

    batches
        .entry(key.clone())
        .and_modify(|b| b.append(instance.clone()))
        .or_insert_with(|| Batch::new(key, instance));
}

fn seal_quiescent_batches(
    settings: &ProcessorSettings,
    batches: &mut HashMap<String, Batch>,
    called_ae_title: &CalledAeTitle,
    submitter: &Arc<JobSubmitter>,
    cleanup: &CleanupQueue,
    inflight: &mut JoinSet<()>,
) {
    let sealed_keys: Vec<String> = batches
        .iter()
        .filter(|(_, batch)| batch.is_quiescent(settings.timeout))
        .map(|(key, _)| key.clone())
        .collect();

    for key in sealed_keys {
        let batch = batches.remove(&key).expect("key came from this map");
        if batch.is_empty() {
            tracing::warn!(called_ae_title = %called_ae_title, batch_key = %key, "discarding empty batch");
            continue;
        }
        let called_ae_title = called_ae_title.clone();
        let settings = settings.clone();
        let submitter = Arc::clone(submitter);
        let cleanup = cleanup.clone();
        inflight.spawn(async move {
            submit_batch(called_ae_title, settings, batch, submitter, cleanup).await;
        });
    }
}

/// Submits `batch` to every configured pipeline, retrying the whole set of pipelines together
/// up to `MAX_RETRY` times on any failure, then hands the batch's files to C7 either way
/// (§4.5 "Submit loop").
async fn submit_batch(
    called_ae_title: CalledAeTitle,
    settings: ProcessorSettings,
    batch: Batch,
    submitter: Arc<JobSubmitter>,
    cleanup: CleanupQueue,
) {
    let batch_key = batch.key.clone();
    let items = batch.into_items();
    let files: Vec<&Utf8Path> = items.iter().map(|i| i.absolute_path.as_path()).collect();

    let mut attempt = 0;
    let succeeded = loop {
        attempt += 1;
        let mut all_ok = true;
        for (pipeline_name, pipeline_id) in &settings.pipelines {
            let job_name = job_name_for(&called_ae_title, pipeline_name);
            match submitter
                .submit(pipeline_id, &job_name, settings.priority, &files)
                .await
            {
                Ok(receipt) => {
                    tracing::info!(
                        called_ae_title = %called_ae_title,
                        batch_key = %batch_key,
                        pipeline = %pipeline_name,
                        attempt,
                        job_id = %receipt.job_id,
                        "job submitted"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        called_ae_title = %called_ae_title,
                        batch_key = %batch_key,
                        pipeline = %pipeline_name,
                        attempt,
                        error = %e,
                        "pipeline submission failed"
                    );
                    all_ok = false;
                }
            }
        }
        if all_ok {
            break true;
        }
        if attempt >= MAX_RETRY {
            break false;
        }
        tokio::time::sleep(settings.job_retry_delay).await;
    };

    if !succeeded {
        tracing::error!(
            called_ae_title = %called_ae_title,
            batch_key = %batch_key,
            "batch exhausted retries, reclaiming files"
        );
    }

    for item in items {
        cleanup.enqueue(item);
    }
}

fn job_name_for(called_ae_title: &CalledAeTitle, pipeline_name: &str) -> String {
    let format = time::macros::format_description!(
        "[year][month][day][hour repr:24][minute][second]"
    );
    let timestamp = time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| "unknown-time".to_string());
    format!("{called_ae_title}-{pipeline_name}-{timestamp}")
}

//! Core data model shared by every component (§3 of the design).
#![allow(non_snake_case)]

use aliri_braid::braid;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

/// DICOM AE title of a peer we've been configured to listen for (the "called" side
/// of an association, i.e. our own identity as the peer sees it).
#[braid(serde)]
pub struct CalledAeTitle;

/// DICOM AE title of the peer initiating an association (the "calling" side).
#[braid(serde)]
pub struct CallingAeTitle;

/// A called-AE entity from the peer registry (§3 `CalledAE`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalledAe {
    /// Unique human-readable name for this entity.
    pub name: String,
    pub ae_title: CalledAeTitle,
    pub ignored_sop_classes: HashSet<String>,
    pub overwrite_same_instance: bool,
    /// Raw key/value configuration handed to the job processor (§4.5).
    pub processor_config: BTreeMap<String, String>,
}

/// A source peer allowed to open associations when `rejectUnknownSources` is set (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedSource {
    pub ae_title: CallingAeTitle,
    pub host_or_ip: String,
}

/// An export destination. The core only carries this because C8 owns it (§3); it is not
/// otherwise read by anything in this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub name: String,
    pub ae_title: String,
    pub host: String,
    pub port: u16,
}

/// Submission priority propagated to job creation (§4.5). All four are first-class; config
/// must declare one explicitly (§9 Open Question).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Lower,
    Normal,
    Higher,
    Immediate,
}

impl std::str::FromStr for Priority {
    type Err = crate::error::ProcessorConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lower" => Ok(Self::Lower),
            "normal" => Ok(Self::Normal),
            "higher" => Ok(Self::Higher),
            "immediate" => Ok(Self::Immediate),
            other => Err(crate::error::ProcessorConfigError::InvalidPriority(
                other.to_string(),
            )),
        }
    }
}

/// Monotonic per-process identifier for a single DICOM association (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssociationId(pub u64);

impl std::fmt::Display for AssociationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single DICOM instance that has been written to storage by C2 (§3 `InstanceRef`).
///
/// The triple (`called_ae_title`, `association_id`, `sop_instance_uid`) uniquely names the
/// file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRef {
    pub patient_id: String,
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub sop_class_uid: String,

    pub called_ae_title: CalledAeTitle,
    pub calling_ae_title: CallingAeTitle,
    pub association_id: AssociationId,
    pub received_at: time::OffsetDateTime,

    /// Absolute path under the managed storage root (§3 disk layout).
    pub absolute_path: Utf8PathBuf,
}

impl std::fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "InstanceRef(aet={}, assoc={}, sop={})",
            self.called_ae_title, self.association_id, self.sop_instance_uid
        )
    }
}

/// A group of instances sharing one value of the configured grouping tag (§3 `Batch`).
#[derive(Debug, Clone)]
pub struct Batch {
    /// The value of the grouping tag shared by every item.
    pub key: String,
    /// Ordered, deduplicated (by `sop_instance_uid`) set of instances.
    items: Vec<InstanceRef>,
    seen_sop_instance_uids: HashSet<String>,
    pub last_arrival_at: Instant,
    pub retries: u32,
}

impl Batch {
    pub fn new(key: String, first: InstanceRef) -> Self {
        let mut seen = HashSet::with_capacity(1);
        seen.insert(first.sop_instance_uid.clone());
        Self {
            key,
            items: vec![first],
            seen_sop_instance_uids: seen,
            last_arrival_at: Instant::now(),
            retries: 0,
        }
    }

    /// Appends `instance`, deduplicating by `sop_instance_uid`, and resets the quiescence clock.
    pub fn append(&mut self, instance: InstanceRef) {
        self.last_arrival_at = Instant::now();
        if self.seen_sop_instance_uids.insert(instance.sop_instance_uid.clone()) {
            self.items.push(instance);
        }
    }

    pub fn items(&self) -> &[InstanceRef] {
        &self.items
    }

    pub fn into_items(self) -> Vec<InstanceRef> {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_quiescent(&self, timeout: std::time::Duration) -> bool {
        self.last_arrival_at.elapsed() >= timeout
    }
}

/// Result of creating a job on the external pipeline platform (§3 `JobReceipt`). Opaque to
/// the core beyond these two identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReceipt {
    pub job_id: String,
    pub payload_id: String,
}

/// The maximum number of submission attempts for a single batch-pipeline pair (§4.5, §8).
pub const MAX_RETRY: u32 = 3;

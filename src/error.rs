//! One `thiserror` enum per failure domain, following §7's table of error kinds and the
//! teacher's convention of small, purpose-specific error types rather than one crate-wide enum.

/// Reasons an association is refused at admission time (§4.3). Each variant carries enough
/// information to pick a DICOM association-reject result/source/reason and to log at `warn`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("called AE title {0:?} is not configured")]
    UnknownCalledAe(String),

    #[error("calling AE title {calling_ae_title:?} from {host_or_ip} is not an allowed source")]
    UnknownSource {
        calling_ae_title: String,
        host_or_ip: String,
    },

    #[error("no storage resources available")]
    NoResources,

    #[error("too many active associations ({active}/{max})")]
    TooManyAssociations { active: usize, max: usize },
}

/// Errors while handling an established association's DIMSE traffic (§4.3, §7 "Reception I/O").
#[derive(thiserror::Error, Debug)]
pub enum AssociationError {
    #[error("I/O error on association: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read incoming DICOM command: {0}")]
    FailedToReadCommand(#[source] dicom::object::ReadError),

    #[error("failed to read DICOM data object: {0}")]
    FailedToReadObject(#[source] dicom::object::ReadError),

    #[error("failed to build DICOM meta file information: {0}")]
    FailedToBuildMeta(#[source] dicom::object::meta::Error),

    #[error("missing presentation context for incoming PDU")]
    MissingPresentationContext,

    #[error("missing required tag {0}")]
    MissingTag(&'static str),

    #[error("could not send response to peer: {0}")]
    CannotRespond(&'static str),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from C2 `persist` (§4.2).
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("storage partition is at or over the watermark")]
    DiskFull,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("instance for SOP instance UID {0:?} already exists and overwrite is disabled")]
    OverwriteConflict(String),

    #[error("failed to write DICOM object: {0}")]
    Write(#[from] dicom::object::WriteError),

    #[error("missing required tag {0}")]
    MissingRequiredTag(&'static str),
}

/// Why an incoming instance could not be routed into a batch (§7 "Grouping").
#[derive(thiserror::Error, Debug)]
pub enum GroupingError {
    #[error("grouping tag {tag} is missing or empty on instance {sop_instance_uid}")]
    MissingGroupingTag {
        tag: String,
        sop_instance_uid: String,
    },
}

/// A single C6 step's failure (§4.6, §7 "Submission"). Each attempt of a batch-pipeline pair
/// fails as a whole if any step fails.
#[derive(thiserror::Error, Debug)]
pub enum SubmissionError {
    #[error("createJob failed: {0}")]
    CreateJob(#[source] anyhow::Error),

    #[error("export denied: storage is at or over the watermark")]
    ExportDenied,

    #[error("uploadPayload failed: {0}")]
    UploadPayload(#[source] anyhow::Error),

    #[error("startJob failed: {0}")]
    StartJob(#[source] anyhow::Error),
}

/// Validation errors for a `CalledAe`'s `processorConfig` map (§4.5, §9).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorConfigError {
    #[error("unrecognized processor config key {0:?}")]
    UnrecognizedKey(String),

    #[error("no pipeline-<name> entries configured; at least one is required")]
    NoPipelinesConfigured,

    #[error("invalid timeout: must be an integer number of seconds >= 5")]
    InvalidTimeout,

    #[error("invalid jobRetryDelay: must be an integer number of milliseconds")]
    InvalidJobRetryDelay,

    #[error("invalid priority {0:?}: expected one of lower, normal, higher, immediate")]
    InvalidPriority(String),

    #[error("invalid groupBy tag reference {0:?}: expected \"gggg,eeee\"")]
    InvalidGroupBy(String),
}

/// Reclaim (C7) failures are always logged and swallowed by the caller; this type exists so
/// that logging call sites stay uniform (§7 "Reclaim").
#[derive(thiserror::Error, Debug)]
pub enum ReclaimError {
    #[error("failed to delete {path}: {source}")]
    Delete {
        path: camino::Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to prune directory {path}: {source}")]
    Prune {
        path: camino::Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

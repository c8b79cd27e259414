//! Process-wide settings, configurable via `RELAY_*` environment variables (§6).
use camino::Utf8PathBuf;
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct RelaySettings {
    /// Root of the managed storage tree (§3 disk layout). Must exist and be writable at
    /// startup (§6).
    pub storage_root: Utf8PathBuf,

    #[serde(default = "default_watermark_percent")]
    pub watermark_percent: f64,

    #[serde(default = "default_reserved_bytes")]
    pub reserved_bytes: u64,

    #[serde(default = "default_max_associations", deserialize_with = "clamp_max_associations")]
    pub max_associations: usize,

    #[serde(default)]
    pub reject_unknown_sources: bool,

    #[serde(default = "default_listener_port")]
    pub listener_port: u16,

    #[serde(default = "default_listener_threads")]
    pub listener_threads: NonZeroUsize,

    #[serde(default = "default_max_pdu_length")]
    pub max_pdu_length: u32,

    #[serde(default = "default_implementation_class_uid")]
    pub implementation_class_uid: String,

    #[serde(default = "default_implementation_version_name")]
    pub implementation_version_name: String,

    #[serde(with = "humantime_serde", default = "default_grace_period")]
    pub grace_period: Duration,

    #[serde(default = "default_submission_workers")]
    pub submission_workers: NonZeroUsize,

    #[serde(with = "humantime_serde", default = "default_rpc_timeout")]
    pub rpc_timeout: Duration,

    #[serde(default = "default_verification_transfer_syntaxes")]
    pub verification_transfer_syntaxes: Vec<String>,

    /// Base URL of the external inference/pipeline platform's HTTP API (§4.6). Required when
    /// the `reqwest-client` feature builds the default [`crate::platform_client::http::HttpPlatformClient`].
    pub platform_base_url: String,
}

impl RelaySettings {
    pub fn verification_transfer_syntaxes(&self) -> &[String] {
        &self.verification_transfer_syntaxes
    }
}

fn default_verification_transfer_syntaxes() -> Vec<String> {
    DEFAULT_VERIFICATION_TRANSFER_SYNTAXES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_watermark_percent() -> f64 {
    85.0
}

fn default_reserved_bytes() -> u64 {
    5 * 1024 * 1024 * 1024
}

fn default_max_associations() -> usize {
    25
}

/// Hard cap on `max_associations` regardless of configuration (§4.3 rule 4).
pub const MAX_ASSOCIATIONS_HARD_CAP: usize = 1000;

fn clamp_max_associations<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let configured = usize::deserialize(deserializer)?;
    if configured > MAX_ASSOCIATIONS_HARD_CAP {
        tracing::warn!(
            configured,
            hard_cap = MAX_ASSOCIATIONS_HARD_CAP,
            "maxAssociations exceeds the hard cap, clamping"
        );
        Ok(MAX_ASSOCIATIONS_HARD_CAP)
    } else {
        Ok(configured)
    }
}

fn default_listener_port() -> u16 {
    104
}

fn default_listener_threads() -> NonZeroUsize {
    NonZeroUsize::new(16).unwrap()
}

fn default_max_pdu_length() -> u32 {
    16384
}

fn default_implementation_class_uid() -> String {
    "1.2.826.0.1.3680043.8.498.1".to_string()
}

fn default_implementation_version_name() -> String {
    "RELAY_010".to_string()
}

fn default_grace_period() -> Duration {
    Duration::from_secs(30)
}

fn default_submission_workers() -> NonZeroUsize {
    NonZeroUsize::new(4).unwrap()
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

/// Default transfer syntaxes accepted for verification (C-ECHO) presentation contexts (§6).
pub const DEFAULT_VERIFICATION_TRANSFER_SYNTAXES: &[&str] = &[
    "1.2.840.10008.1.2",   // Implicit VR Little Endian
    "1.2.840.10008.1.2.1", // Explicit VR Little Endian
];

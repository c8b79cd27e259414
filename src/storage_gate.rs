//! C1 — Storage Gate: cheap, synchronous admission predicates over free disk space (§4.1).
use camino::Utf8Path;

/// Snapshot of the three independent admission booleans plus the raw free-byte count (§4.1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorageStatus {
    pub can_store: bool,
    pub can_export: bool,
    pub can_retrieve: bool,
    pub available_bytes: u64,
}

/// Reports on the free-space watermark of the managed storage partition. Implementations must
/// be cheap enough to call once per association (§4.1).
pub trait StorageGate: Send + Sync {
    fn status(&self) -> StorageStatus;

    fn can_store(&self) -> bool {
        self.status().can_store
    }

    fn can_export(&self) -> bool {
        self.status().can_export
    }

    fn can_retrieve(&self) -> bool {
        self.status().can_retrieve
    }

    fn available_bytes(&self) -> u64 {
        self.status().available_bytes
    }
}

/// A [`StorageGate`] backed by the OS's view of the filesystem holding `path`.
///
/// All three booleans currently share one predicate (§4.1): `used_percent < watermark_percent
/// AND available_bytes > reserved_bytes`.
pub struct FilesystemStorageGate {
    path: camino::Utf8PathBuf,
    watermark_percent: f64,
    reserved_bytes: u64,
}

impl FilesystemStorageGate {
    pub fn new(path: impl AsRef<Utf8Path>, watermark_percent: f64, reserved_bytes: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            watermark_percent,
            reserved_bytes,
        }
    }

    fn disk_stats(&self) -> std::io::Result<DiskStats> {
        statvfs_stats(self.path.as_std_path())
    }
}

impl StorageGate for FilesystemStorageGate {
    fn status(&self) -> StorageStatus {
        match self.disk_stats() {
            Ok(stats) => {
                let used_percent = stats.used_percent();
                let ok = used_percent < self.watermark_percent
                    && stats.available_bytes > self.reserved_bytes;
                StorageStatus {
                    can_store: ok,
                    can_export: ok,
                    can_retrieve: ok,
                    available_bytes: stats.available_bytes,
                }
            }
            Err(e) => {
                tracing::error!(path = self.path.as_str(), error = %e, "failed to stat storage root");
                StorageStatus {
                    can_store: false,
                    can_export: false,
                    can_retrieve: false,
                    available_bytes: 0,
                }
            }
        }
    }
}

struct DiskStats {
    total_bytes: u64,
    available_bytes: u64,
}

impl DiskStats {
    fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        let used = self.total_bytes.saturating_sub(self.available_bytes);
        (used as f64 / self.total_bytes as f64) * 100.0
    }
}

fn statvfs_stats(path: &std::path::Path) -> std::io::Result<DiskStats> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
    let block_size = stat.fragment_size();
    Ok(DiskStats {
        total_bytes: stat.blocks() * block_size,
        available_bytes: stat.blocks_available() * block_size,
    })
}

/// A fixed-value gate used by tests to exercise admission-monotonicity (§8 property 6) without
/// touching the real filesystem.
#[derive(Debug, Clone, Copy)]
pub struct FixedStorageGate(pub StorageStatus);

impl StorageGate for FixedStorageGate {
    fn status(&self) -> StorageStatus {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_gate_reports_configured_status() {
        let gate = FixedStorageGate(StorageStatus {
            can_store: false,
            can_export: false,
            can_retrieve: false,
            available_bytes: 123,
        });
        assert!(!gate.can_store());
        assert_eq!(gate.available_bytes(), 123);
    }

    #[test]
    fn monotonicity_lower_available_bytes_never_accepts() {
        let below = FixedStorageGate(StorageStatus {
            can_store: false,
            can_export: false,
            can_retrieve: false,
            available_bytes: 1,
        });
        let above = FixedStorageGate(StorageStatus {
            can_store: true,
            can_export: true,
            can_retrieve: true,
            available_bytes: 1_000_000,
        });
        assert!(!below.can_store());
        assert!(above.can_store());
    }
}

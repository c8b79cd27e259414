//! C2 — Reception Store: writes received instances to a deterministic on-disk layout and
//! yields [`InstanceRef`] handles (§4.2).
use crate::error::StorageError;
use crate::storage_gate::StorageGate;
use crate::types::{AssociationId, CalledAeTitle, CallingAeTitle, InstanceRef};
use camino::{Utf8Path, Utf8PathBuf};
use dicom::core::header::HasLength;
use dicom::dictionary_std::tags;
use dicom::object::DefaultDicomObject;
use std::sync::Arc;

/// Context for a single accepted DICOM instance, known before the dataset itself is inspected.
pub struct ReceptionContext {
    pub called_ae_title: CalledAeTitle,
    pub calling_ae_title: CallingAeTitle,
    pub association_id: AssociationId,
    pub overwrite_same_instance: bool,
}

/// Writes DICOM instances under the managed storage root (§3 disk layout: `<root>/<called AE
/// title>/<association id>/dcm/<patient id>/<study uid>/<series uid>/<sop uid>.dcm`).
pub struct ReceptionStore {
    root: Utf8PathBuf,
    gate: Arc<dyn StorageGate>,
}

impl ReceptionStore {
    pub fn new(root: impl Into<Utf8PathBuf>, gate: Arc<dyn StorageGate>) -> Self {
        Self {
            root: root.into(),
            gate,
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Materializes `obj` under the layout in §3. Directory creation is idempotent. If a file
    /// already exists for the same `sop_instance_uid` within the same called AE:
    ///
    /// - `overwrite_same_instance == true`: overwrite atomically (write-temp + rename).
    /// - otherwise: fail with [`StorageError::OverwriteConflict`] (§9 Open Question).
    pub fn persist(
        &self,
        ctx: &ReceptionContext,
        obj: &DefaultDicomObject,
    ) -> Result<InstanceRef, StorageError> {
        if !self.gate.can_store() {
            return Err(StorageError::DiskFull);
        }

        let patient_id = required_string(obj, tags::PATIENT_ID, "PatientID")?;
        let study_instance_uid =
            required_string(obj, tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?;
        let series_instance_uid =
            required_string(obj, tags::SERIES_INSTANCE_UID, "SeriesInstanceUID")?;
        let sop_instance_uid = required_string(obj, tags::SOP_INSTANCE_UID, "SOPInstanceUID")?;
        let sop_class_uid = required_string(obj, tags::SOP_CLASS_UID, "SOPClassUID")?;

        let relative = Utf8PathBuf::from(format!(
            "{}/{}/dcm/{}/{}/{}/{}.dcm",
            ctx.called_ae_title,
            ctx.association_id,
            &patient_id,
            &study_instance_uid,
            &series_instance_uid,
            &sop_instance_uid,
        ));
        let absolute_path = self.root.join(&relative);

        if let Some(parent) = absolute_path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        if absolute_path.exists() {
            if ctx.overwrite_same_instance {
                write_atomically(&absolute_path, obj)?;
            } else {
                return Err(StorageError::OverwriteConflict(sop_instance_uid));
            }
        } else {
            write_atomically(&absolute_path, obj)?;
        }

        Ok(InstanceRef {
            patient_id,
            study_instance_uid,
            series_instance_uid,
            sop_instance_uid,
            sop_class_uid,
            called_ae_title: ctx.called_ae_title.clone(),
            calling_ae_title: ctx.calling_ae_title.clone(),
            association_id: ctx.association_id,
            received_at: time::OffsetDateTime::now_utc(),
            absolute_path,
        })
    }
}

/// Writes `obj` to a sibling temp file, then renames it into place. Rename is atomic on the
/// same filesystem, satisfying the write-then-publish ordering contract (§4.2): by the time
/// `persist` returns, any reader opening `path` sees the complete file.
fn write_atomically(path: &Utf8Path, obj: &DefaultDicomObject) -> Result<(), StorageError> {
    let tmp_path = path.with_extension("dcm.tmp");
    obj.write_to_file(&tmp_path)?;
    fs_err::rename(&tmp_path, path)?;
    Ok(())
}

fn required_string(
    obj: &DefaultDicomObject,
    tag: dicom::core::Tag,
    name: &'static str,
) -> Result<String, StorageError> {
    let element = obj
        .element(tag)
        .map_err(|_| StorageError::MissingRequiredTag(name))?;
    if element.length() == dicom::core::header::Length(0) {
        return Err(StorageError::MissingRequiredTag(name));
    }
    element
        .string()
        .map(|s| s.trim().to_string())
        .map_err(|_| StorageError::MissingRequiredTag(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_gate::{FixedStorageGate, StorageStatus};
    use dicom::core::{DataElement, VR};
    use dicom::dicom_value;
    use dicom::object::{FileMetaTableBuilder, InMemDicomObject};

    fn ok_gate() -> Arc<dyn StorageGate> {
        Arc::new(FixedStorageGate(StorageStatus {
            can_store: true,
            can_export: true,
            can_retrieve: true,
            available_bytes: u64::MAX,
        }))
    }

    fn full_gate() -> Arc<dyn StorageGate> {
        Arc::new(FixedStorageGate(StorageStatus {
            can_store: false,
            can_export: false,
            can_retrieve: false,
            available_bytes: 0,
        }))
    }

    fn sample_object(sop_instance_uid: &str) -> DefaultDicomObject {
        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
            .media_storage_sop_instance_uid(sop_instance_uid)
            .transfer_syntax("1.2.840.10008.1.2.1")
            .build()
            .unwrap();
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            dicom_value!(Str, "PAT1"),
        ));
        obj.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "STUDY_A"),
        ));
        obj.put(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "SER1"),
        ));
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ));
        obj.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, "1.2.840.10008.5.1.4.1.1.7"),
        ));
        obj.with_exact_meta(meta)
    }

    fn ctx(overwrite: bool) -> ReceptionContext {
        ReceptionContext {
            called_ae_title: CalledAeTitle::new("AET1".to_string()),
            calling_ae_title: CallingAeTitle::new("MODALITY1".to_string()),
            association_id: AssociationId(1),
            overwrite_same_instance: overwrite,
        }
    }

    #[test]
    fn persist_rejects_when_disk_full() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            ReceptionStore::new(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(), full_gate());
        let err = store.persist(&ctx(false), &sample_object("1.2.3")).unwrap_err();
        assert!(matches!(err, StorageError::DiskFull));
    }

    #[test]
    fn persist_writes_expected_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReceptionStore::new(
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
            ok_gate(),
        );
        let instance = store.persist(&ctx(false), &sample_object("1.2.3")).unwrap();
        assert!(instance.absolute_path.exists());
        assert!(instance
            .absolute_path
            .as_str()
            .ends_with("AET1/1/dcm/PAT1/STUDY_A/SER1/1.2.3.dcm"));
    }

    #[test]
    fn persist_same_sop_instance_conflicts_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReceptionStore::new(
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
            ok_gate(),
        );
        store.persist(&ctx(false), &sample_object("1.2.3")).unwrap();
        let err = store
            .persist(&ctx(false), &sample_object("1.2.3"))
            .unwrap_err();
        assert!(matches!(err, StorageError::OverwriteConflict(_)));
    }

    #[test]
    fn persist_same_sop_instance_overwrites_when_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReceptionStore::new(
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
            ok_gate(),
        );
        store.persist(&ctx(true), &sample_object("1.2.3")).unwrap();
        let second = store.persist(&ctx(true), &sample_object("1.2.3")).unwrap();
        assert!(second.absolute_path.exists());
    }

    #[test]
    fn concurrent_persists_sharing_parent_dirs_do_not_fail() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ReceptionStore::new(
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
            ok_gate(),
        ));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let sop = format!("1.2.{i}");
                    store.persist(&ctx(false), &sample_object(&sop)).unwrap()
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}

//! C3 per-association state machine (§4.3). `AwaitingAssociate → Active → Releasing/Aborted`.
//!
//! File structurally mirrors `scp.rs` in the reference implementation this module descends
//! from ("mostly copied from dicom-rs"), adapted to hand-rolled PDU I/O (see `pdu_io`) so that
//! admission can reject before any AC is sent, and to publish-on-release / discard-on-abort
//! semantics instead of publishing per instance.
use crate::cleanup_queue::CleanupQueue;
use crate::error::{AdmissionError, AssociationError, AssociationError::*, StorageError};
use crate::notification_bus::NotificationBus;
use crate::peer_registry::PeerRegistry;
use crate::reception_store::{ReceptionContext, ReceptionStore};
use crate::scp::pdu_io::{
    self, AcceptedPresentationContext, DataPdu, DataPduOutcome, RjReason, RjResult, RjSource,
};
use crate::settings::RelaySettings;
use crate::storage_gate::StorageGate;
use crate::types::{AssociationId, CalledAeTitle, CallingAeTitle, InstanceRef};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const VERIFICATION_SOP_CLASS_UID: &str = "1.2.840.10008.1.1";

/// How long a data-transfer-phase read blocks before giving `run_active` a chance to notice
/// the shutdown token (§5 "Cancellation").
const READ_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// DIMSE status code for a successful C-STORE (PS3.7 Annex C).
const STATUS_SUCCESS: u16 = 0x0000;
/// Storage-service status for a duplicate SOP Instance UID that was not overwritten (PS3.4
/// Annex B.2, commonly implemented under this code even though the base standard leaves
/// vendor-specific duplicate handling unspecified).
const STATUS_DUPLICATE_SOP_INSTANCE: u16 = 0x0111;
/// General "cannot understand" failure (PS3.7 Annex C) for a C-STORE sub-operation that could
/// not be parsed or persisted for a reason other than duplication.
const STATUS_CANNOT_UNDERSTAND: u16 = 0xC000;

/// Shared collaborators every association needs; one instance is built once in `run.rs` and
/// handed to each connection the listener thread pool dispatches.
pub struct ScpDependencies {
    pub registry: Arc<PeerRegistry>,
    pub storage_gate: Arc<dyn StorageGate>,
    pub reception_store: Arc<ReceptionStore>,
    pub bus: Arc<NotificationBus>,
    pub cleanup: CleanupQueue,
    pub settings: Arc<RelaySettings>,
    /// Live count of established associations, for admission rule 4 and health reporting
    /// (§4.3, §10.5 `ScpHealth`).
    pub active_associations: Arc<AtomicUsize>,
    pub runtime: tokio::runtime::Handle,
}

impl ScpDependencies {
    /// Live snapshot for an out-of-scope HTTP health layer to poll (§10.5).
    pub fn health(&self) -> ScpHealth {
        ScpHealth {
            active_associations: self.active_associations.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time SCP health, read off the shared association counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScpHealth {
    pub active_associations: usize,
}

/// Handles one accepted TCP connection end to end: admission, DIMSE traffic, release/abort.
/// Called from the listener's thread pool (§5). `cancel` is polled throughout the data-transfer
/// phase so a shutdown in progress doesn't block this thread (and thus `ThreadPool::shutdown`)
/// forever on an idle peer.
pub fn handle_connection(
    mut stream: TcpStream,
    association_id: AssociationId,
    cancel: &CancellationToken,
    deps: &ScpDependencies,
) -> Result<(), AssociationError> {
    let peer_host = stream
        .peer_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let rq = pdu_io::read_associate_rq(&mut stream)?;
    let called_ae_title = CalledAeTitle::new(rq.called_ae_title.clone());
    let calling_ae_title = CallingAeTitle::new(rq.calling_ae_title.clone());

    if let Err(reject) = admit(&peer_host, &called_ae_title, &calling_ae_title, deps) {
        tracing::warn!(
            called_ae_title = %called_ae_title,
            calling_ae_title = %calling_ae_title,
            peer_host = %peer_host,
            reason = %reject,
            "rejecting association"
        );
        let (result, source, reason) = reject_code_for(&reject);
        pdu_io::write_associate_rj(&mut stream, result, source, reason)?;
        return Ok(());
    }

    let snapshot = deps.registry.load();
    let called_ae = snapshot
        .called_ae(&called_ae_title)
        .expect("admit() already confirmed this called AE is registered")
        .clone();

    let accepted = negotiate_presentation_contexts(
        &rq,
        deps.settings.verification_transfer_syntaxes(),
    );
    pdu_io::write_associate_ac(
        &mut stream,
        &rq.called_ae_title,
        &rq.calling_ae_title,
        deps.settings.max_pdu_length,
        &accepted,
        &deps.settings.implementation_class_uid,
        &deps.settings.implementation_version_name,
    )?;

    deps.active_associations.fetch_add(1, Ordering::SeqCst);
    let result = (|| {
        stream.set_read_timeout(Some(READ_POLL_INTERVAL))?;
        run_active(
            &mut stream,
            association_id,
            &called_ae_title,
            &calling_ae_title,
            &called_ae.ignored_sop_classes,
            called_ae.overwrite_same_instance,
            &accepted,
            cancel,
            deps,
        )
    })();
    deps.active_associations.fetch_sub(1, Ordering::SeqCst);
    result
}

/// Evaluates the four admission rules in §4.3 order, stopping at the first failure.
fn admit(
    peer_host: &str,
    called_ae_title: &CalledAeTitle,
    calling_ae_title: &CallingAeTitle,
    deps: &ScpDependencies,
) -> Result<(), AdmissionError> {
    let snapshot = deps.registry.load();

    if snapshot.called_ae(called_ae_title).is_none() {
        return Err(AdmissionError::UnknownCalledAe(called_ae_title.to_string()));
    }

    if deps.settings.reject_unknown_sources
        && !snapshot.is_allowed_source(calling_ae_title, peer_host)
    {
        return Err(AdmissionError::UnknownSource {
            calling_ae_title: calling_ae_title.to_string(),
            host_or_ip: peer_host.to_string(),
        });
    }

    if !deps.storage_gate.can_store() {
        return Err(AdmissionError::NoResources);
    }

    let active = deps.active_associations.load(Ordering::SeqCst);
    if active >= deps.settings.max_associations {
        return Err(AdmissionError::TooManyAssociations {
            active,
            max: deps.settings.max_associations,
        });
    }

    Ok(())
}

/// Maps an [`AdmissionError`] onto the A-ASSOCIATE-RJ result/source/reason triple the peer
/// receives (§4.3: "each failure produces a specific reject reason").
fn reject_code_for(err: &AdmissionError) -> (RjResult, RjSource, RjReason) {
    match err {
        AdmissionError::UnknownCalledAe(_) => (
            RjResult::RejectedPermanent,
            RjSource::ServiceUser,
            RjReason::CalledAeTitleNotRecognized,
        ),
        AdmissionError::UnknownSource { .. } => (
            RjResult::RejectedPermanent,
            RjSource::ServiceUser,
            RjReason::CallingAeTitleNotRecognized,
        ),
        AdmissionError::NoResources | AdmissionError::TooManyAssociations { .. } => (
            RjResult::RejectedPermanent,
            RjSource::ServiceProviderPresentation,
            RjReason::LocalLimitExceeded,
        ),
    }
}

fn negotiate_presentation_contexts(
    rq: &pdu_io::AssociateRq,
    verification_allowlist: &[String],
) -> Vec<AcceptedPresentationContext> {
    rq.presentation_contexts
        .iter()
        .filter_map(|pc| {
            if pc.abstract_syntax == VERIFICATION_SOP_CLASS_UID {
                let ts = pc
                    .transfer_syntaxes
                    .iter()
                    .find(|ts| verification_allowlist.iter().any(|a| a == *ts))?;
                Some(AcceptedPresentationContext {
                    id: pc.id,
                    transfer_syntax: ts.clone(),
                })
            } else {
                // Storage presentation contexts: accept the peer's first proposed transfer
                // syntax, no transcoding (§4.3 rule 5).
                let ts = pc.transfer_syntaxes.first()?;
                Some(AcceptedPresentationContext {
                    id: pc.id,
                    transfer_syntax: ts.clone(),
                })
            }
        })
        .collect()
}

/// Drives the data-transfer phase until release, abort, or a fatal transport error.
///
/// Delegates to [`run_active_loop`] and guarantees the "fully commits or contributes nothing"
/// rule (§4.3, §8 Property 1) on every exit path: the loop itself drains `committed` (publish on
/// release, discard on abort/EOF/cancel) whenever it returns `Ok`; if it returns `Err` instead —
/// a fatal transport error cut the association short — whatever is left in `committed` was
/// already written to disk by a prior, successful C-STORE sub-operation in this same
/// association and must still be reclaimed rather than orphaned.
#[allow(clippy::too_many_arguments)]
fn run_active(
    stream: &mut TcpStream,
    association_id: AssociationId,
    called_ae_title: &CalledAeTitle,
    calling_ae_title: &CallingAeTitle,
    ignored_sop_classes: &std::collections::HashSet<String>,
    overwrite_same_instance: bool,
    accepted: &[AcceptedPresentationContext],
    cancel: &CancellationToken,
    deps: &ScpDependencies,
) -> Result<(), AssociationError> {
    let mut committed: Vec<InstanceRef> = Vec::new();
    let result = run_active_loop(
        stream,
        association_id,
        called_ae_title,
        calling_ae_title,
        ignored_sop_classes,
        overwrite_same_instance,
        accepted,
        cancel,
        deps,
        &mut committed,
    );
    if result.is_err() {
        discard(deps, std::mem::take(&mut committed));
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn run_active_loop(
    stream: &mut TcpStream,
    association_id: AssociationId,
    called_ae_title: &CalledAeTitle,
    calling_ae_title: &CallingAeTitle,
    ignored_sop_classes: &std::collections::HashSet<String>,
    overwrite_same_instance: bool,
    accepted: &[AcceptedPresentationContext],
    cancel: &CancellationToken,
    deps: &ScpDependencies,
    committed: &mut Vec<InstanceRef>,
) -> Result<(), AssociationError> {
    let transfer_syntaxes: HashMap<u8, String> = accepted
        .iter()
        .map(|pc| (pc.id, pc.transfer_syntax.clone()))
        .collect();
    let ctx = ReceptionContext {
        called_ae_title: called_ae_title.clone(),
        calling_ae_title: calling_ae_title.clone(),
        association_id,
        overwrite_same_instance,
    };

    let mut instance_buffer: Vec<u8> = Vec::with_capacity(1024 * 1024);
    let mut msgid: u16 = 1;
    let mut sop_class_uid = String::new();
    let mut sop_instance_uid = String::new();

    loop {
        if cancel.is_cancelled() {
            tracing::info!(association_id = %association_id, "shutdown in progress, discarding in-flight association");
            discard(deps, std::mem::take(committed));
            return Ok(());
        }

        let pdu = match pdu_io::read_data_pdu(stream)? {
            DataPduOutcome::TimedOut => continue,
            DataPduOutcome::Eof => {
                tracing::warn!(association_id = %association_id, "connection closed without release, treating as abort");
                discard(deps, std::mem::take(committed));
                return Ok(());
            }
            DataPduOutcome::Pdu(pdu) => pdu,
        };

        match pdu {
            DataPdu::PData(items) => {
                for item in items {
                    if item.is_command {
                        let ts = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
                        let obj = InMemDicomObject::read_dataset_with_ts(item.data.as_slice(), &ts)
                            .map_err(FailedToReadCommand)?;
                        let command_field = obj
                            .element(tags::COMMAND_FIELD)
                            .map_err(|_| MissingTag("CommandField"))?
                            .uint16()
                            .map_err(|_| MissingTag("CommandField"))?;

                        if command_field == 0x0030 {
                            send_cecho_response(stream, item.presentation_context_id, msgid)?;
                        } else {
                            msgid = obj
                                .element(tags::MESSAGE_ID)
                                .map_err(|_| MissingTag("MessageID"))?
                                .to_int()
                                .map_err(|_| MissingTag("MessageID"))?;
                            sop_class_uid = obj
                                .element(tags::AFFECTED_SOP_CLASS_UID)
                                .map_err(|_| MissingTag("AffectedSOPClassUID"))?
                                .to_str()
                                .map_err(|_| MissingTag("AffectedSOPClassUID"))?
                                .to_string();
                            sop_instance_uid = obj
                                .element(tags::AFFECTED_SOP_INSTANCE_UID)
                                .map_err(|_| MissingTag("AffectedSOPInstanceUID"))?
                                .to_str()
                                .map_err(|_| MissingTag("AffectedSOPInstanceUID"))?
                                .to_string();
                        }
                        instance_buffer.clear();
                    } else if !item.is_last {
                        instance_buffer.extend_from_slice(&item.data);
                    } else {
                        instance_buffer.extend_from_slice(&item.data);

                        if ignored_sop_classes.contains(&sop_class_uid) {
                            send_cstore_response(
                                stream,
                                item.presentation_context_id,
                                msgid,
                                &sop_class_uid,
                                &sop_instance_uid,
                                STATUS_SUCCESS,
                            )?;
                            continue;
                        }

                        // §7 "Reception I/O": a parse or persist failure for one instance fails
                        // that C-STORE sub-operation with a DIMSE status; it never ends the
                        // association. Only a failure to write the response back to the peer
                        // (below, via `?`) is a fatal transport error.
                        let (status, stored) = store_instance(
                            deps,
                            &transfer_syntaxes,
                            item.presentation_context_id,
                            &instance_buffer,
                            &sop_class_uid,
                            &sop_instance_uid,
                            &ctx,
                        );
                        if let Some(instance) = stored {
                            committed.push(instance);
                        }
                        send_cstore_response(
                            stream,
                            item.presentation_context_id,
                            msgid,
                            &sop_class_uid,
                            &sop_instance_uid,
                            status,
                        )?;
                    }
                }
            }
            DataPdu::ReleaseRq => {
                pdu_io::write_release_rp(stream)?;
                tracing::info!(association_id = %association_id, instances = committed.len(), "association released, committing");
                for instance in committed.drain(..) {
                    deps.runtime.block_on(deps.bus.publish(instance));
                }
                return Ok(());
            }
            DataPdu::ReleaseRp => {
                discard(deps, std::mem::take(committed));
                return Ok(());
            }
            DataPdu::Abort => {
                tracing::info!(association_id = %association_id, instances = committed.len(), "association aborted, discarding");
                discard(deps, std::mem::take(committed));
                return Ok(());
            }
        }
    }
}

/// Parses and persists one C-STORE data-set fragment, classifying the outcome into a DIMSE
/// status to send back. A parse/persist failure here is an instance-level failure (§7): it is
/// never propagated as an `Err`, so the association always continues and a response is always
/// sent.
#[allow(clippy::too_many_arguments)]
fn store_instance(
    deps: &ScpDependencies,
    transfer_syntaxes: &HashMap<u8, String>,
    presentation_context_id: u8,
    raw_dataset: &[u8],
    sop_class_uid: &str,
    sop_instance_uid: &str,
    ctx: &ReceptionContext,
) -> (u16, Option<InstanceRef>) {
    let outcome: Result<InstanceRef, AssociationError> = (|| {
        let ts_uid = transfer_syntaxes
            .get(&presentation_context_id)
            .ok_or(MissingPresentationContext)?;
        let ts = TransferSyntaxRegistry
            .get(ts_uid)
            .ok_or(MissingPresentationContext)?;
        let obj = InMemDicomObject::read_dataset_with_ts(raw_dataset, ts).map_err(FailedToReadObject)?;

        let file_meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(sop_class_uid)
            .media_storage_sop_instance_uid(sop_instance_uid)
            .transfer_syntax(ts_uid)
            .build()
            .map_err(FailedToBuildMeta)?;
        let file_obj = obj.with_exact_meta(file_meta);

        Ok(deps.reception_store.persist(ctx, &file_obj)?)
    })();

    match outcome {
        Ok(instance) => (STATUS_SUCCESS, Some(instance)),
        Err(Storage(StorageError::OverwriteConflict(_))) => {
            tracing::warn!(sop_instance_uid, "duplicate SOP instance, not overwritten");
            (STATUS_DUPLICATE_SOP_INSTANCE, None)
        }
        Err(e) => {
            tracing::warn!(error = %e, sop_instance_uid, "C-STORE sub-operation failed, association continues");
            (STATUS_CANNOT_UNDERSTAND, None)
        }
    }
}

fn discard(deps: &ScpDependencies, committed: Vec<InstanceRef>) {
    for instance in committed {
        deps.cleanup.enqueue(instance);
    }
}

fn send_cstore_response(
    stream: &mut TcpStream,
    presentation_context_id: u8,
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> Result<(), AssociationError> {
    let obj: InMemDicomObject<StandardDataDictionary> = InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8001])),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0101])),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_instance_uid)),
    ]);
    let ts = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut buf = Vec::new();
    obj.write_dataset_with_ts(&mut buf, &ts)
        .map_err(|_| CannotRespond("could not write C-STORE response object"))?;
    pdu_io::write_pdata(stream, presentation_context_id, true, &buf)
        .map_err(|_| CannotRespond("failed to send C-STORE response object to SCU"))?;
    Ok(())
}

fn send_cecho_response(
    stream: &mut TcpStream,
    presentation_context_id: u8,
    message_id: u16,
) -> Result<(), AssociationError> {
    let obj: InMemDicomObject<StandardDataDictionary> = InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8030])),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0101])),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [0x0000])),
    ]);
    let ts = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut buf = Vec::new();
    obj.write_dataset_with_ts(&mut buf, &ts)
        .map_err(|_| CannotRespond("could not write C-ECHO response object"))?;
    pdu_io::write_pdata(stream, presentation_context_id, true, &buf)
        .map_err(|_| CannotRespond("failed to send C-ECHO response object to SCU"))?;
    Ok(())
}

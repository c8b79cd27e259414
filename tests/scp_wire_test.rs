//! Direct wire coverage for C3's data-transfer-phase state machine: a real `TcpStream` drives
//! `handle_connection` through association, C-STORE, and release/abort, exercising
//! `pdu_io::read_data_pdu`'s PDU parsing and `association::run_active`'s commit/discard paths
//! end to end rather than through `InMemDicomObject` fixtures alone.
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_pipeline_relay::cleanup_queue::{cleanup_queue, Reclaimer};
use dicom_pipeline_relay::notification_bus::NotificationBus;
use dicom_pipeline_relay::peer_registry::{PeerRegistry, PeerRegistrySnapshot};
use dicom_pipeline_relay::reception_store::ReceptionStore;
use dicom_pipeline_relay::scp::association::{handle_connection, ScpDependencies};
use dicom_pipeline_relay::settings::RelaySettings;
use dicom_pipeline_relay::storage_gate::{FixedStorageGate, StorageGate, StorageStatus};
use dicom_pipeline_relay::types::{AssociationId, CalledAe, CalledAeTitle};
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::collections::HashSet;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const STORAGE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.7";
const STORAGE_TRANSFER_SYNTAX: &str = "1.2.840.10008.1.2.1";

fn settings() -> RelaySettings {
    RelaySettings {
        storage_root: "/tmp/does-not-matter".into(),
        watermark_percent: 85.0,
        reserved_bytes: 0,
        max_associations: 25,
        reject_unknown_sources: false,
        listener_port: 0,
        listener_threads: std::num::NonZeroUsize::new(4).unwrap(),
        max_pdu_length: 16384,
        implementation_class_uid: "1.2.3.4".to_string(),
        implementation_version_name: "TEST".to_string(),
        grace_period: Duration::from_secs(1),
        submission_workers: std::num::NonZeroUsize::new(2).unwrap(),
        rpc_timeout: Duration::from_secs(5),
        verification_transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        platform_base_url: "http://localhost".to_string(),
    }
}

struct Harness {
    deps: Arc<ScpDependencies>,
    root: tempfile::TempDir,
    reclaimer: Option<Reclaimer>,
}

fn harness(overwrite_same_instance: bool, ignored_sop_classes: HashSet<String>) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let storage_root = camino::Utf8PathBuf::from_path_buf(root.path().to_path_buf()).unwrap();

    let registry = Arc::new(PeerRegistry::new(PeerRegistrySnapshot::new(
        vec![CalledAe {
            name: "AET1".to_string(),
            ae_title: CalledAeTitle::new("AET1".to_string()),
            ignored_sop_classes,
            overwrite_same_instance,
            processor_config: Default::default(),
        }],
        vec![],
        vec![],
    )));
    let storage_gate: Arc<dyn StorageGate> = Arc::new(FixedStorageGate(StorageStatus {
        can_store: true,
        can_export: true,
        can_retrieve: true,
        available_bytes: u64::MAX,
    }));
    let reception_store = Arc::new(ReceptionStore::new(storage_root, Arc::clone(&storage_gate)));
    let (cleanup, reclaimer) = cleanup_queue();
    let bus = Arc::new(NotificationBus::new(cleanup.clone()));

    let deps = Arc::new(ScpDependencies {
        registry,
        storage_gate,
        reception_store,
        bus,
        cleanup,
        settings: Arc::new(settings()),
        active_associations: Arc::new(AtomicUsize::new(0)),
        runtime: tokio::runtime::Handle::current(),
    });

    Harness {
        deps,
        root,
        reclaimer: Some(reclaimer),
    }
}

/// Writes a minimal A-ASSOCIATE-RQ proposing one storage presentation context, mirroring the
/// byte layout `pdu_io::read_associate_rq` expects.
fn write_associate_rq(stream: &mut TcpStream, pc_id: u8) {
    use std::io::Write;

    let mut abstract_and_ts = Vec::new();
    abstract_and_ts.push(0x30u8);
    abstract_and_ts.push(0x00);
    abstract_and_ts.extend_from_slice(&(STORAGE_SOP_CLASS.len() as u16).to_be_bytes());
    abstract_and_ts.extend_from_slice(STORAGE_SOP_CLASS.as_bytes());
    abstract_and_ts.push(0x40);
    abstract_and_ts.push(0x00);
    abstract_and_ts.extend_from_slice(&(STORAGE_TRANSFER_SYNTAX.len() as u16).to_be_bytes());
    abstract_and_ts.extend_from_slice(STORAGE_TRANSFER_SYNTAX.as_bytes());

    let mut pc_item_data = Vec::new();
    pc_item_data.push(pc_id);
    pc_item_data.extend_from_slice(&[0u8; 3]);
    pc_item_data.extend_from_slice(&abstract_and_ts);

    let mut pc_item = Vec::new();
    pc_item.push(0x20);
    pc_item.push(0x00);
    pc_item.extend_from_slice(&(pc_item_data.len() as u16).to_be_bytes());
    pc_item.extend_from_slice(&pc_item_data);

    let mut body = Vec::new();
    body.extend_from_slice(&1u16.to_be_bytes());
    body.extend_from_slice(&0u16.to_be_bytes());
    body.extend_from_slice(&ae_title_bytes("AET1"));
    body.extend_from_slice(&ae_title_bytes("MOD1"));
    body.extend_from_slice(&[0u8; 32]);
    body.extend_from_slice(&pc_item);

    let mut pdu = Vec::new();
    pdu.push(0x01);
    pdu.push(0x00);
    pdu.extend_from_slice(&(body.len() as u32).to_be_bytes());
    pdu.extend_from_slice(&body);
    stream.write_all(&pdu).unwrap();
    stream.flush().unwrap();
}

fn ae_title_bytes(title: &str) -> [u8; 16] {
    let mut buf = [b' '; 16];
    let bytes = title.as_bytes();
    let n = bytes.len().min(16);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

/// Reads and discards the A-ASSOCIATE-AC; the test already knows the negotiated presentation
/// context ID equals the one it proposed (negotiation echoes it back unchanged).
fn read_associate_ac(stream: &mut TcpStream) {
    use std::io::Read;
    let mut header = [0u8; 6];
    stream.read_exact(&mut header).unwrap();
    assert_eq!(header[0], 0x02, "expected A-ASSOCIATE-AC");
    let length = u32::from_be_bytes(header[2..6].try_into().unwrap());
    let mut body = vec![0u8; length as usize];
    stream.read_exact(&mut body).unwrap();
}

fn write_pdata(stream: &mut TcpStream, pc_id: u8, is_command: bool, data: &[u8]) {
    use std::io::Write;
    let control_header = (is_command as u8) | 0b10;
    let item_len = 2 + data.len();
    let mut body = Vec::new();
    body.extend_from_slice(&(item_len as u32).to_be_bytes());
    body.push(pc_id);
    body.push(control_header);
    body.extend_from_slice(data);

    let mut pdu = Vec::new();
    pdu.push(0x04);
    pdu.push(0x00);
    pdu.extend_from_slice(&(body.len() as u32).to_be_bytes());
    pdu.extend_from_slice(&body);
    stream.write_all(&pdu).unwrap();
    stream.flush().unwrap();
}

fn write_release_rq(stream: &mut TcpStream) {
    use std::io::Write;
    stream
        .write_all(&[0x05, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00])
        .unwrap();
    stream.flush().unwrap();
}

fn write_abort(stream: &mut TcpStream) {
    use std::io::Write;
    stream
        .write_all(&[0x07, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00])
        .unwrap();
    stream.flush().unwrap();
}

fn read_release_rp(stream: &mut TcpStream) {
    use std::io::Read;
    let mut header = [0u8; 6];
    stream.read_exact(&mut header).unwrap();
    assert_eq!(header[0], 0x06, "expected A-RELEASE-RP");
    let length = u32::from_be_bytes(header[2..6].try_into().unwrap());
    let mut body = vec![0u8; length as usize];
    stream.read_exact(&mut body).unwrap();
}

fn cstore_command_bytes(msgid: u16, sop_class_uid: &str, sop_instance_uid: &str) -> Vec<u8> {
    let obj: InMemDicomObject = InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0001])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [msgid])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0102])),
        DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_instance_uid)),
    ]);
    let ts = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut buf = Vec::new();
    obj.write_dataset_with_ts(&mut buf, &ts).unwrap();
    buf
}

fn dataset_bytes(patient: &str, study: &str, series: &str, sop_instance: &str, sop_class: &str) -> Vec<u8> {
    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class)
        .media_storage_sop_instance_uid(sop_instance)
        .transfer_syntax(STORAGE_TRANSFER_SYNTAX)
        .build()
        .unwrap();
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, patient)));
    obj.put(DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, study)));
    obj.put(DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, series)));
    obj.put(DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_instance)));
    obj.put(DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class)));
    let file_obj = obj.with_exact_meta(meta);
    let ts = dicom::transfer_syntax::TransferSyntaxRegistry
        .get(STORAGE_TRANSFER_SYNTAX)
        .unwrap();
    let mut buf = Vec::new();
    file_obj.write_dataset_with_ts(&mut buf, ts).unwrap();
    buf
}

fn read_cstore_status(stream: &mut TcpStream) -> u16 {
    use std::io::Read;
    let mut header = [0u8; 6];
    stream.read_exact(&mut header).unwrap();
    assert_eq!(header[0], 0x04, "expected P-DATA-TF carrying the C-STORE response");
    let length = u32::from_be_bytes(header[2..6].try_into().unwrap());
    let mut body = vec![0u8; length as usize];
    stream.read_exact(&mut body).unwrap();
    // body: item length(4) + pc id(1) + control header(1) + command dataset
    let item_len = u32::from_be_bytes(body[0..4].try_into().unwrap()) as usize;
    let command_bytes = &body[6..6 + item_len - 2];
    let ts = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let obj = InMemDicomObject::read_dataset_with_ts(command_bytes, &ts).unwrap();
    obj.element(tags::STATUS).unwrap().uint16().unwrap()
}

/// One C-STORE sub-operation followed by release commits the instance and returns success.
#[tokio::test]
async fn cstore_then_release_commits_one_instance() {
    let harness = harness(false, HashSet::new());
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let deps = Arc::clone(&harness.deps);
    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();

    let server = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        handle_connection(stream, AssociationId(1), &server_cancel, &deps)
    });

    let mut client = TcpStream::connect(addr).unwrap();
    write_associate_rq(&mut client, 1);
    read_associate_ac(&mut client);

    write_pdata(&mut client, 1, true, &cstore_command_bytes(1, STORAGE_SOP_CLASS, "1.2.1"));
    write_pdata(&mut client, 1, false, &dataset_bytes("PAT1", "STUDY_A", "SER1", "1.2.1", STORAGE_SOP_CLASS));
    let status = read_cstore_status(&mut client);
    assert_eq!(status, 0x0000);

    write_release_rq(&mut client);
    read_release_rp(&mut client);

    let result = server.join().unwrap();
    assert!(result.is_ok());

    let expected_path = harness
        .root
        .path()
        .join("AET1/1/dcm/PAT1/STUDY_A/SER1/1.2.1.dcm");
    assert!(expected_path.exists(), "committed instance should remain on disk after release");
}

/// Re-sending the same SOP Instance UID without `overwriteSameInstance` fails that
/// sub-operation with the duplicate-specific status while the association keeps going.
#[tokio::test]
async fn duplicate_sop_instance_gets_duplicate_status_and_association_continues() {
    let harness = harness(false, HashSet::new());
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let deps = Arc::clone(&harness.deps);
    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();

    let server = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        handle_connection(stream, AssociationId(1), &server_cancel, &deps)
    });

    let mut client = TcpStream::connect(addr).unwrap();
    write_associate_rq(&mut client, 1);
    read_associate_ac(&mut client);

    write_pdata(&mut client, 1, true, &cstore_command_bytes(1, STORAGE_SOP_CLASS, "1.2.1"));
    write_pdata(&mut client, 1, false, &dataset_bytes("PAT1", "STUDY_A", "SER1", "1.2.1", STORAGE_SOP_CLASS));
    assert_eq!(read_cstore_status(&mut client), 0x0000);

    // Same SOP Instance UID again: rejected as a duplicate, not a fatal error.
    write_pdata(&mut client, 1, true, &cstore_command_bytes(2, STORAGE_SOP_CLASS, "1.2.1"));
    write_pdata(&mut client, 1, false, &dataset_bytes("PAT1", "STUDY_A", "SER1", "1.2.1", STORAGE_SOP_CLASS));
    assert_eq!(read_cstore_status(&mut client), 0x0111);

    write_release_rq(&mut client);
    read_release_rp(&mut client);

    let result = server.join().unwrap();
    assert!(result.is_ok(), "association must survive an instance-level duplicate failure");
}

/// Aborting before release discards every instance committed so far via the reclaim path,
/// never the notification bus.
#[tokio::test]
async fn abort_discards_committed_instances() {
    let mut harness = harness(false, HashSet::new());
    let root = camino::Utf8PathBuf::from_path_buf(harness.root.path().to_path_buf()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let deps = Arc::clone(&harness.deps);
    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();

    let server = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        handle_connection(stream, AssociationId(1), &server_cancel, &deps)
    });

    let mut client = TcpStream::connect(addr).unwrap();
    write_associate_rq(&mut client, 1);
    read_associate_ac(&mut client);

    write_pdata(&mut client, 1, true, &cstore_command_bytes(1, STORAGE_SOP_CLASS, "1.2.1"));
    write_pdata(&mut client, 1, false, &dataset_bytes("PAT1", "STUDY_A", "SER1", "1.2.1", STORAGE_SOP_CLASS));
    assert_eq!(read_cstore_status(&mut client), 0x0000);

    write_abort(&mut client);
    let result = server.join().unwrap();
    assert!(result.is_ok());

    let reclaimer_cancel = CancellationToken::new();
    let reclaimer_handle = tokio::spawn(
        harness
            .reclaimer
            .take()
            .unwrap()
            .run(root, reclaimer_cancel.clone()),
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    reclaimer_cancel.cancel();
    reclaimer_handle.await.unwrap();

    let path = harness.root.path().join("AET1/1/dcm/PAT1/STUDY_A/SER1/1.2.1.dcm");
    assert!(!path.exists(), "aborted instance should be reclaimed via deps.cleanup.enqueue, not left orphaned");
}

/// An ignored SOP class is acknowledged as success without ever touching storage.
#[tokio::test]
async fn ignored_sop_class_responds_success_without_storing() {
    let mut ignored = HashSet::new();
    ignored.insert(STORAGE_SOP_CLASS.to_string());
    let harness = harness(false, ignored);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let deps = Arc::clone(&harness.deps);
    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();

    let server = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        handle_connection(stream, AssociationId(1), &server_cancel, &deps)
    });

    let mut client = TcpStream::connect(addr).unwrap();
    write_associate_rq(&mut client, 1);
    read_associate_ac(&mut client);

    write_pdata(&mut client, 1, true, &cstore_command_bytes(1, STORAGE_SOP_CLASS, "1.2.1"));
    write_pdata(&mut client, 1, false, &dataset_bytes("PAT1", "STUDY_A", "SER1", "1.2.1", STORAGE_SOP_CLASS));
    assert_eq!(read_cstore_status(&mut client), 0x0000);

    write_release_rq(&mut client);
    read_release_rp(&mut client);
    assert!(server.join().unwrap().is_ok());

    let path = harness.root.path().join("AET1/1/dcm/PAT1/STUDY_A/SER1/1.2.1.dcm");
    assert!(!path.exists(), "ignored SOP class must never be written to storage");
}

/// Cancelling the shutdown token mid-association discards any work committed so far instead of
/// hanging on the peer's next read (§5).
#[rstest]
#[case(true)]
#[case(false)]
#[tokio::test]
async fn cancellation_during_idle_read_ends_association_promptly(#[case] commit_one_first: bool) {
    let harness = harness(false, HashSet::new());
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let deps = Arc::clone(&harness.deps);
    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();

    let server = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        handle_connection(stream, AssociationId(1), &server_cancel, &deps)
    });

    let mut client = TcpStream::connect(addr).unwrap();
    write_associate_rq(&mut client, 1);
    read_associate_ac(&mut client);

    if commit_one_first {
        write_pdata(&mut client, 1, true, &cstore_command_bytes(1, STORAGE_SOP_CLASS, "1.2.1"));
        write_pdata(&mut client, 1, false, &dataset_bytes("PAT1", "STUDY_A", "SER1", "1.2.1", STORAGE_SOP_CLASS));
        assert_eq!(read_cstore_status(&mut client), 0x0000);
    }

    // Peer goes idle; the server must notice cancellation within one read-poll interval
    // instead of blocking on the socket forever.
    cancel.cancel();
    let result = tokio::task::spawn_blocking(move || server.join().unwrap())
        .await
        .unwrap();
    assert!(result.is_ok());
}

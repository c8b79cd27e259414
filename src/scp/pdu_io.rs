//! Minimal A-ASSOCIATE-RQ/AC/RJ wire handling (PS3.8 §9.3.2-9.3.4).
//!
//! `dicom-ul`'s high-level `ServerAssociationOptions::establish()` always accepts whatever
//! called AE title the peer proposes and has no hook to reject before the AC is sent (see
//! `scp.rs` in the reference implementation this module descends from). Our admission rules
//! (§4.3) must reject *before* any AC goes out, with a specific result/source/reason, so the
//! handshake itself is handled here at the byte level; the data-transfer PDUs after
//! A-ASSOCIATE-AC (P-DATA-TF, A-RELEASE-*, A-ABORT) are handled here too, at the same level of
//! abstraction, so the whole association is read through one consistent path.
use std::io::{self, Read, Write};
use std::net::TcpStream;

pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

#[derive(Debug, Clone)]
pub struct ProposedPresentationContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AssociateRq {
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub presentation_contexts: Vec<ProposedPresentationContext>,
    pub max_pdu_length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RjResult {
    RejectedPermanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RjSource {
    ServiceUser,
    ServiceProviderAcse,
    ServiceProviderPresentation,
}

/// Reject reasons (PS3.8 Table 9-21). The wire byte depends on both this and the paired
/// `RjSource`, so variants are named rather than numbered — see `write_associate_rj` for the
/// source-qualified mapping to the actual byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RjReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAeTitleNotRecognized,
    CalledAeTitleNotRecognized,
    /// Presentation-related-function reason 2: "local-limit-exceeded".
    LocalLimitExceeded,
}

/// Reads and parses one A-ASSOCIATE-RQ PDU from `stream`. Only the fields our admission rules
/// and presentation-context negotiation need are extracted; unrecognized variable items are
/// skipped.
pub fn read_associate_rq(stream: &mut TcpStream) -> io::Result<AssociateRq> {
    let mut header = [0u8; 6];
    stream.read_exact(&mut header)?;
    let pdu_type = header[0];
    if pdu_type != 0x01 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected A-ASSOCIATE-RQ (0x01), got PDU type {pdu_type:#04x}"),
        ));
    }
    let length = u32::from_be_bytes(header[2..6].try_into().unwrap());
    let mut body = vec![0u8; length as usize];
    stream.read_exact(&mut body)?;

    // Fixed fields: protocol-version(2) + reserved(2) + called-AE(16) + calling-AE(16) + reserved(32)
    if body.len() < 68 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated A-ASSOCIATE-RQ"));
    }
    let called_ae_title = ascii_field(&body[4..20]);
    let calling_ae_title = ascii_field(&body[20..36]);

    let mut presentation_contexts = Vec::new();
    let mut max_pdu_length = 16384;
    let mut offset = 68;
    while offset + 4 <= body.len() {
        let item_type = body[offset];
        let item_length = u16::from_be_bytes(body[offset + 2..offset + 4].try_into().unwrap()) as usize;
        let item_start = offset + 4;
        let item_end = (item_start + item_length).min(body.len());
        let item_data = &body[item_start..item_end];
        match item_type {
            0x20 => {
                if let Some(pc) = parse_presentation_context_rq(item_data) {
                    presentation_contexts.push(pc);
                }
            }
            0x50 => {
                max_pdu_length = parse_max_pdu_length(item_data).unwrap_or(max_pdu_length);
            }
            _ => {}
        }
        offset = item_end;
    }

    Ok(AssociateRq {
        called_ae_title,
        calling_ae_title,
        presentation_contexts,
        max_pdu_length,
    })
}

fn parse_presentation_context_rq(data: &[u8]) -> Option<ProposedPresentationContext> {
    if data.len() < 4 {
        return None;
    }
    let id = data[0];
    let mut abstract_syntax = String::new();
    let mut transfer_syntaxes = Vec::new();
    let mut offset = 4;
    while offset + 4 <= data.len() {
        let sub_type = data[offset];
        let sub_length = u16::from_be_bytes(data[offset + 2..offset + 4].try_into().unwrap()) as usize;
        let sub_start = offset + 4;
        let sub_end = (sub_start + sub_length).min(data.len());
        let sub_data = &data[sub_start..sub_end];
        match sub_type {
            0x30 => abstract_syntax = String::from_utf8_lossy(sub_data).trim().to_string(),
            0x40 => transfer_syntaxes.push(String::from_utf8_lossy(sub_data).trim().to_string()),
            _ => {}
        }
        offset = sub_end;
    }
    Some(ProposedPresentationContext {
        id,
        abstract_syntax,
        transfer_syntaxes,
    })
}

fn parse_max_pdu_length(user_info_data: &[u8]) -> Option<u32> {
    let mut offset = 0;
    while offset + 4 <= user_info_data.len() {
        let sub_type = user_info_data[offset];
        let sub_length =
            u16::from_be_bytes(user_info_data[offset + 2..offset + 4].try_into().unwrap()) as usize;
        let sub_start = offset + 4;
        let sub_end = (sub_start + sub_length).min(user_info_data.len());
        if sub_type == 0x51 && sub_end - sub_start == 4 {
            return Some(u32::from_be_bytes(
                user_info_data[sub_start..sub_end].try_into().unwrap(),
            ));
        }
        offset = sub_end;
    }
    None
}

fn ascii_field(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim().to_string()
}

fn ae_title_bytes(title: &str) -> [u8; 16] {
    let mut buf = [b' '; 16];
    let bytes = title.as_bytes();
    let n = bytes.len().min(16);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

/// Writes a minimal A-ASSOCIATE-RJ PDU (fixed 4-byte body, PS3.8 §9.3.4) and lets the caller
/// close the connection.
pub fn write_associate_rj(
    stream: &mut TcpStream,
    result: RjResult,
    source: RjSource,
    reason: RjReason,
) -> io::Result<()> {
    let result_byte = match result {
        RjResult::RejectedPermanent => 1u8,
    };
    let source_byte = match source {
        RjSource::ServiceUser => 1u8,
        RjSource::ServiceProviderAcse => 2u8,
        RjSource::ServiceProviderPresentation => 3u8,
    };
    let reason_byte = match reason {
        RjReason::NoReasonGiven => 1u8,
        RjReason::ApplicationContextNameNotSupported => 2u8,
        RjReason::CallingAeTitleNotRecognized => 3u8,
        RjReason::CalledAeTitleNotRecognized => 7u8,
        RjReason::LocalLimitExceeded => 2u8,
    };
    let mut pdu = Vec::with_capacity(10);
    pdu.push(0x03); // PDU type: A-ASSOCIATE-RJ
    pdu.push(0x00);
    pdu.extend_from_slice(&4u32.to_be_bytes());
    pdu.push(0x00); // reserved
    pdu.push(result_byte);
    pdu.push(source_byte);
    pdu.push(reason_byte);
    stream.write_all(&pdu)?;
    stream.flush()
}

/// One negotiated presentation context to report back in the AC.
pub struct AcceptedPresentationContext {
    pub id: u8,
    pub transfer_syntax: String,
}

/// Writes an A-ASSOCIATE-AC PDU. Rejected presentation contexts are not included in
/// `accepted`; the peer infers rejection from their absence is technically non-conformant
/// (a conformant AC should echo every proposed ID with an explicit reject reason) — callers
/// are expected to include a reject-reason entry for every proposed context they don't accept
/// via `AcceptedPresentationContext`-shaped rejects; this module reports whatever list it is
/// given verbatim.
pub fn write_associate_ac(
    stream: &mut TcpStream,
    called_ae_title: &str,
    calling_ae_title: &str,
    max_pdu_length: u32,
    accepted: &[AcceptedPresentationContext],
    implementation_class_uid: &str,
    implementation_version_name: &str,
) -> io::Result<()> {
    let mut body = Vec::new();
    body.extend_from_slice(&1u16.to_be_bytes()); // protocol version
    body.extend_from_slice(&0u16.to_be_bytes()); // reserved
    body.extend_from_slice(&ae_title_bytes(called_ae_title));
    body.extend_from_slice(&ae_title_bytes(calling_ae_title));
    body.extend_from_slice(&[0u8; 32]); // reserved

    body.push(0x10); // application context item
    body.push(0x00);
    body.extend_from_slice(&(APPLICATION_CONTEXT_NAME.len() as u16).to_be_bytes());
    body.extend_from_slice(APPLICATION_CONTEXT_NAME.as_bytes());

    for pc in accepted {
        let ts_item_len = 4 + pc.transfer_syntax.len();
        let mut pc_item = Vec::new();
        pc_item.push(pc.id);
        pc_item.push(0x00); // reserved
        pc_item.push(0x00); // result: acceptance
        pc_item.push(0x00); // reserved
        pc_item.push(0x40); // transfer syntax sub-item
        pc_item.push(0x00);
        pc_item.extend_from_slice(&(pc.transfer_syntax.len() as u16).to_be_bytes());
        pc_item.extend_from_slice(pc.transfer_syntax.as_bytes());
        debug_assert_eq!(pc_item.len(), 4 + ts_item_len);

        body.push(0x21); // presentation context item (AC)
        body.push(0x00);
        body.extend_from_slice(&(pc_item.len() as u16).to_be_bytes());
        body.extend_from_slice(&pc_item);
    }

    let mut user_info = Vec::new();
    user_info.push(0x51); // max length sub-item
    user_info.push(0x00);
    user_info.extend_from_slice(&4u16.to_be_bytes());
    user_info.extend_from_slice(&max_pdu_length.to_be_bytes());
    user_info.push(0x52); // implementation class UID
    user_info.push(0x00);
    user_info.extend_from_slice(&(implementation_class_uid.len() as u16).to_be_bytes());
    user_info.extend_from_slice(implementation_class_uid.as_bytes());
    user_info.push(0x55); // implementation version name
    user_info.push(0x00);
    user_info.extend_from_slice(&(implementation_version_name.len() as u16).to_be_bytes());
    user_info.extend_from_slice(implementation_version_name.as_bytes());

    body.push(0x50);
    body.push(0x00);
    body.extend_from_slice(&(user_info.len() as u16).to_be_bytes());
    body.extend_from_slice(&user_info);

    let mut pdu = Vec::with_capacity(6 + body.len());
    pdu.push(0x02); // PDU type: A-ASSOCIATE-AC
    pdu.push(0x00);
    pdu.extend_from_slice(&(body.len() as u32).to_be_bytes());
    pdu.extend_from_slice(&body);
    stream.write_all(&pdu)?;
    stream.flush()
}

/// One presentation-data-value item within a P-DATA-TF PDU (PS3.8 §9.3.5).
#[derive(Debug, Clone)]
pub struct PdvItem {
    pub presentation_context_id: u8,
    pub is_command: bool,
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// A data-transfer-phase PDU, i.e. anything that can arrive after A-ASSOCIATE-AC.
#[derive(Debug, Clone)]
pub enum DataPdu {
    PData(Vec<PdvItem>),
    ReleaseRq,
    ReleaseRp,
    Abort,
}

/// Result of one [`read_data_pdu`] call. A plain `Option` can't distinguish "peer closed the
/// socket" from "the read timed out with nothing to report yet" — callers need to treat those
/// very differently (the former ends the association, the latter just loops back around to
/// recheck the cancellation token, see `association::run_active`).
#[derive(Debug)]
pub enum DataPduOutcome {
    Pdu(DataPdu),
    /// Peer closed the socket without A-RELEASE/A-ABORT; callers treat this like an abort.
    Eof,
    /// `stream`'s read timeout elapsed before a full PDU arrived. Not an error — the caller is
    /// expected to poll a cancellation token and retry.
    TimedOut,
}

/// Reads one data-transfer-phase PDU. `stream` is expected to have a read timeout set (§5
/// "Cancellation") so this returns periodically even while the peer is idle.
pub fn read_data_pdu(stream: &mut TcpStream) -> io::Result<DataPduOutcome> {
    let mut header = [0u8; 6];
    if let Err(e) = stream.read_exact(&mut header) {
        return match e.kind() {
            io::ErrorKind::UnexpectedEof => Ok(DataPduOutcome::Eof),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Ok(DataPduOutcome::TimedOut),
            _ => Err(e),
        };
    }
    let pdu_type = header[0];
    let length = u32::from_be_bytes(header[2..6].try_into().unwrap()) as usize;
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body)?;

    let pdu = match pdu_type {
        0x04 => DataPdu::PData(parse_pdata(&body)),
        0x05 => DataPdu::ReleaseRq,
        0x06 => DataPdu::ReleaseRp,
        0x07 => DataPdu::Abort,
        _ => DataPdu::Abort,
    };
    Ok(DataPduOutcome::Pdu(pdu))
}

fn parse_pdata(body: &[u8]) -> Vec<PdvItem> {
    let mut items = Vec::new();
    let mut offset = 0;
    while offset + 4 <= body.len() {
        let item_length = u32::from_be_bytes(body[offset..offset + 4].try_into().unwrap()) as usize;
        let item_start = offset + 4;
        let item_end = (item_start + item_length).min(body.len());
        if item_end <= item_start + 2 {
            break;
        }
        let presentation_context_id = body[item_start];
        let control_header = body[item_start + 1];
        let data = body[item_start + 2..item_end].to_vec();
        items.push(PdvItem {
            presentation_context_id,
            is_command: control_header & 0b01 != 0,
            is_last: control_header & 0b10 != 0,
            data,
        });
        offset = item_end;
    }
    items
}

pub fn write_pdata(
    stream: &mut TcpStream,
    presentation_context_id: u8,
    is_command: bool,
    data: &[u8],
) -> io::Result<()> {
    let control_header = (is_command as u8) | 0b10; // always sent as a single, final fragment
    let item_len = 2 + data.len();
    let mut body = Vec::with_capacity(4 + item_len);
    body.extend_from_slice(&(item_len as u32).to_be_bytes());
    body.push(presentation_context_id);
    body.push(control_header);
    body.extend_from_slice(data);

    let mut pdu = Vec::with_capacity(6 + body.len());
    pdu.push(0x04);
    pdu.push(0x00);
    pdu.extend_from_slice(&(body.len() as u32).to_be_bytes());
    pdu.extend_from_slice(&body);
    stream.write_all(&pdu)?;
    stream.flush()
}

pub fn write_release_rp(stream: &mut TcpStream) -> io::Result<()> {
    stream.write_all(&[0x06, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00])?;
    stream.flush()
}

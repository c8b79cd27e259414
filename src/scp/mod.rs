//! C3 — DICOM SCP: TCP listener, per-association admission, and the DIMSE state machine.
pub mod association;
pub mod pdu_io;
pub mod server;

pub use association::ScpDependencies;
pub use server::scp_listener_loop;

//! # markup-bridge
//!
//! Protocol bridge between an editor's framed request/response transport
//! and a markup-language analysis backend running as a child process.
//!
//! The bridge receives markup+code host documents, holds their derived
//! HTML projections under a checksum-gated consistency protocol, and keeps
//! an independent backend process synchronized with those projections so
//! markup features (hover, completion, formatting) can be proxied to it.
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol::FrameCodec`]): incremental parser/encoder for
//!   the Content-Length framed transport
//! - **Store** ([`store::DocumentStore`]): per-URI document state with
//!   checksum-gated projection updates
//! - **Backend** ([`backend::MarkupBackend`]): child process lifecycle,
//!   projection synchronization, and feature proxying
//!
//! Data flows editor → codec → store → bridge → child process and back.
//! The orchestration server wiring these together lives outside this crate.
//!
//! ## Degradation
//!
//! A missing, crashed, or misbehaving backend never produces an error at
//! this crate's public surface: sync operations become no-ops and feature
//! calls return "no result". Only framing errors on a transport are fatal,
//! and only to that connection.

pub mod backend;
pub mod error;
pub mod protocol;
pub mod rpc;
pub mod store;

pub use backend::{BackendConfig, BackendState, MarkupBackend, RpcSession};
pub use error::{BridgeError, Result};
pub use protocol::FrameCodec;
pub use store::{Document, DocumentSnapshot, DocumentStore, Projection};

//! Backend module - child process bridge for the projected markup language.
//!
//! - [`MarkupBackend`] owns the child process lifecycle, the projection
//!   ledger, and feature proxying
//! - [`RpcSession`] carries the framed JSON-RPC session over the child's
//!   stdio streams
//! - [`locate_executable`] resolves the backend binary

mod bridge;
mod locator;
mod session;

pub use bridge::{
    virtual_uri, BackendConfig, BackendState, MarkupBackend, PROJECTION_LANGUAGE_ID,
    VIRTUAL_SUFFIX,
};
pub use locator::locate_executable;
pub use session::RpcSession;

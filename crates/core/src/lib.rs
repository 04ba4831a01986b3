//! Shared types consumed by every layer of the tenant compute runtime:
//! the host-context traits (`RequestCtx`, `Workspace`) and the base
//! error kind. Kept dependency-light on purpose — `vm-runtime` and
//! `engine` both sit on top of this crate.

mod ctx;
mod error;

pub use ctx::{HttpVersion, RequestBody, RequestCtx, VecWorkspace, Workspace};
pub use error::CoreError;

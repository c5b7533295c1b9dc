//! Kubernetes apply engine and its supporting pieces: resource discovery
//! and resolution, reconciliation, diff rendering and path filters.

pub mod builtin;
pub mod diff;
pub mod engine;
pub mod kpath;
pub mod resolve;
pub mod scheme;

pub use engine::{ApplyEngine, EngineError};
pub use resolve::{ApiResource, ResolveError, ResourceCache};

//! Amphipod is a Kubernetes addon installer framework. User scripts written
//! in a Python-dialect configuration language (Starlark) declare target
//! clusters and addon sets; the driver iterates cluster→addon, executes each
//! addon's `install`/`remove` callback, and the apply engine turns every
//! `kube.*` call into at most one HTTP exchange with the API server.

pub mod addon;
pub mod bridge;
pub mod cloud;
pub mod context;
pub mod driver;
pub mod generate;
pub mod helm;
pub mod k8s;
pub mod loader;
pub mod modules;
pub mod secrets;
pub mod store;
pub mod unittest;
pub mod util;
pub mod values;

/// Label attached to every object provisioned by the engine.
pub const HERITAGE_LABEL: &str = "heritage";

/// Value of the heritage label.
pub const HERITAGE_VALUE: &str = "amphipod";

/// Annotation carrying the JSON-serialized addon context at write time.
pub const CONTEXT_ANNOTATION: &str = "amphipod.dev/context";

/// File extensions accepted by the module loader.
pub const MODULE_EXTENSIONS: &[&str] = &["apd", "star"];

//! In-memory mock Kubernetes API server.
//!
//! Serves discovery plus GET/POST/PUT/DELETE over real HTTP so it works with
//! kubeconfig-based clients. The unit-test driver points fake `kube`
//! capabilities at one of these; integration tests assert on the recorded
//! requests.

pub mod discovery;
pub mod http;

pub use discovery::{MockDiscovery, MockResource};
pub use http::{MockK8sServer, RunningMockK8sServer};

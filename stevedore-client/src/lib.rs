//! Outbound HTTP clients.
//!
//! The janitor talks to two kinds of remote endpoints: peered registries
//! (replica sync, credential rotation, sublease issuance) and the
//! vulnerability scanner sidecar. Both are modelled as traits so that the
//! job tests can substitute fakes; the reqwest-backed implementations in
//! this crate are the production ones.

mod peer;
pub use peer::{
    HttpPeerClient, HttpPeerConnector, LastPulledMerge, PeerApi, PeerConnector, PeerError,
    PeerTag, ReplicationCredentials,
};

mod scanner;
pub use scanner::{HttpScannerClient, ScannerApi, ScannerError};

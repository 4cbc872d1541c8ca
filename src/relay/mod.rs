//! File relay between the scanner host and a remote compute host.
//!
//! The scanner side ([`RelayService`]) dials out to the compute side
//! ([`RelayPeer`]) and serves files from its local watcher. Requests and
//! responses are flat JSON objects, one per line; every response echoes the
//! request's fields.

pub mod allowlist;
pub mod handler;
pub mod peer;
pub mod protocol;
pub mod service;

pub use allowlist::AllowList;
pub use handler::{DiskAccess, FileAccess, RelayHandler};
pub use peer::RelayPeer;
pub use protocol::{RelayRecord, RelayRequest, RelayResponse};
pub use service::RelayService;

// Library exports for rtfmri
// The `rtf` binary and the integration tests build on these modules

pub mod config;
pub mod error;
pub mod ipc;
pub mod model;
pub mod relay;
pub mod run;
pub mod watch;
pub mod worker;

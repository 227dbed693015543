#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Backpressure (max-weight) routing for multi-radio mesh networks.
//!
//! [`Router`] is the synchronous per-node core; [`Daemon`] runs one on tokio with UDP HELLO
//! link sensing.

pub use bp_common::PeriodicTimer;
pub use bp_daemon::*;
pub use bp_routing::*;
pub use bp_wire as wire;

//! Bankgood clearing participant
//!
//! Sits between the banks: resolves recipient handles through its routing
//! table, forwards `initiated` transfers to the destination institution as
//! `forwarded`, and relays the destination's `processed` outcome back to the
//! origin as `completed`. It never touches account balances.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations)]

pub mod api;
pub mod clearing;
pub mod config;
pub mod consumer;
pub mod error;
pub mod routing;

pub use clearing::{Clearance, ClearingEngine, Relay};
pub use config::ClearingConfig;
pub use consumer::ClearingConsumer;
pub use error::{Error, Result};
pub use routing::{NewRoute, RouteUpdate, RoutingTable};

//! Bankgood bank participant
//!
//! Runs both saga roles of a bank on top of one ledger store:
//!
//! - **Origin**: reserve funds and emit `initiated`, then commit or release
//!   when `completed` arrives
//! - **Destination**: credit the recipient on `forwarded` and emit `processed`
//! - **Relay**: drain the transactional outbox onto the bus
//! - **Expiry**: optionally release reservations that never completed
//!
//! Every state change and the event announcing it commit in one store
//! transaction; the relay publishes afterwards with at-least-once delivery.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations)]

pub mod api;
pub mod config;
pub mod consumer;
pub mod destination;
pub mod error;
pub mod expiry;
pub mod metrics;
pub mod origin;
pub mod relay;
pub mod telemetry;

pub use config::{BankConfig, ExpiryConfig, HttpConfig, LogConfig};
pub use consumer::BankConsumer;
pub use destination::{DestinationSaga, Forwarding};
pub use error::{Error, Result};
pub use expiry::ReservationSweeper;
pub use origin::{Completion, OriginSaga, TransferReceipt, TransferRequest};
pub use relay::{OutboxRelay, RelayConfig, RelayReport};

//! Room relay and peer-to-peer file transfer.
//!
//! The relay (`relay`) brokers room membership and negotiation messages between
//! clients. Everything after negotiation happens between peers: `peer` drives one
//! negotiation state machine per remote client and `transfer` moves file bytes over
//! the resulting data channel.

pub mod client;
pub mod common;
pub mod peer;
pub mod relay;
pub mod transfer;
pub mod utils;

pub use common::{Config, ErrorCode, FileInfo, TransferConfig};

//! Wallet-side TON Connect protocol engine.
//!
//! Parses connection deeplinks, performs the encrypted handshake with
//! connected apps over an untrusted bridge, keeps the per-wallet registry
//! of connected apps, and turns app transaction requests into previews and
//! signed, broadcast messages.

pub mod bootstrap;
pub mod bridge;
pub mod chain;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod service;
pub mod settings;
pub mod store;
pub mod transfer;
pub mod wallet;

pub use error::{Error, Result};
pub use service::{Collaborators, ConnectionService};

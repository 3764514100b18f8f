//! Transfer construction and signing.
//!
//! [`TransactionMessageBuilder`] turns message intents into a chain-ready
//! message. It signs with whatever [`SigningStrategy`] it is handed and never
//! picks one itself.

mod builder;
mod intent;

pub use self::builder::{
    ChainMessage, SIGNATURE_LENGTH, SigningStrategy, TransactionMessageBuilder, UnsignedTransfer,
};
pub use self::intent::{MessageIntent, SendMode};

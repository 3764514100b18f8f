//! Persisted wallet-side state.

mod cursor;
mod outbox;
mod registry;
mod vault;

pub use self::cursor::CursorStore;
pub use self::outbox::{PendingReply, ReplyOutbox};
pub use self::registry::{AppRegistry, ConnectedApp};
pub use self::vault::{FileVault, MemoryVault, Vault};

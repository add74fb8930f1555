//! Reconciliation stores: the durable, cached source of truth for channels
//! and messages.
//!
//! Each store keeps an in-memory cache behind a single async mutex, so every
//! read-modify-write (find-or-append, re-sort, persist) runs to completion
//! before the next one starts. Persistence failures are logged and leave the
//! cache as the source of truth for the running session.

pub mod channels;
pub mod messages;
pub mod reconcile;

pub use channels::ChannelStore;
pub use messages::MessageStore;
pub use reconcile::{same_entity, Reconcile, ReconciliationKey, Upsert};

/// Capacity of each store's change notification channel.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Notification that a store mutated, for refreshing read-only projections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    MessageAdded { channel_id: String, message_id: String },
    MessageUpdated { channel_id: String, message_id: String },
    MessageDeleted { channel_id: String, message_id: String },
    /// A page of server history was merged into the channel.
    HistoryMerged { channel_id: String },
    ChannelsChanged,
}

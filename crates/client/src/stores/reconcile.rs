//! Identity and merge rule shared by the message and channel stores.
//!
//! A record is identified by a [`ReconciliationKey`]: the server id and, for
//! optimistic messages, the device-local id. Two keys name the same entity when
//! their server ids match, or when both carry the same local id.

use chasper_shared::{Channel, Message};

/// Dual identity of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationKey<'a> {
    pub id: Option<&'a str>,
    pub local_id: Option<&'a str>,
}

impl<'a> ReconciliationKey<'a> {
    pub fn new(id: Option<&'a str>, local_id: Option<&'a str>) -> Self {
        Self { id, local_id }
    }

    /// Key carrying only a server id.
    pub fn by_id(id: &'a str) -> Self {
        Self::new(Some(id), None)
    }
}

/// True when `a` and `b` refer to the same entity.
pub fn same_entity(a: &ReconciliationKey<'_>, b: &ReconciliationKey<'_>) -> bool {
    matches!((a.id, b.id), (Some(x), Some(y)) if x == y)
        || matches!((a.local_id, b.local_id), (Some(x), Some(y)) if x == y)
}

/// Records that can be merged by [`upsert`].
pub trait Reconcile {
    fn key(&self) -> ReconciliationKey<'_>;

    /// Carry over anything from the record being replaced that the incoming
    /// record should keep. Default: nothing.
    fn inherit(&mut self, _previous: &Self) {}
}

impl Reconcile for Message {
    fn key(&self) -> ReconciliationKey<'_> {
        ReconciliationKey::new(Some(&self.id), self.local_id.as_deref())
    }

    /// A confirmed copy from the server does not know the local id; keep it so
    /// the reconciled message stays traceable to its optimistic origin.
    fn inherit(&mut self, previous: &Self) {
        if self.local_id.is_none() {
            self.local_id.clone_from(&previous.local_id);
        }
    }
}

impl Reconcile for Channel {
    fn key(&self) -> ReconciliationKey<'_> {
        ReconciliationKey::by_id(&self.id)
    }
}

/// What [`upsert`] did with the incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
}

/// Replace the first record matching `item` in place, or append it.
///
/// Any further records matching the incoming key are folded into the
/// replacement and removed, so a list never holds two records for one entity.
pub fn upsert<T: Reconcile>(items: &mut Vec<T>, mut item: T) -> Upsert {
    let matches = {
        let key = item.key();
        matching_positions(items, &key)
    };

    let Some((&first, rest)) = matches.split_first() else {
        items.push(item);
        return Upsert::Inserted;
    };

    for &index in &matches {
        item.inherit(&items[index]);
    }
    items[first] = item;
    for &index in rest.iter().rev() {
        items.remove(index);
    }
    Upsert::Replaced
}

/// Indices of every record matching `key`, in list order.
pub fn matching_positions<T: Reconcile>(items: &[T], key: &ReconciliationKey<'_>) -> Vec<usize> {
    items
        .iter()
        .enumerate()
        .filter(|(_, existing)| same_entity(&existing.key(), key))
        .map(|(index, _)| index)
        .collect()
}

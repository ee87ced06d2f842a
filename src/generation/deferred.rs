use crate::generation::request::RequestSpec;
use crate::world::coord::ColumnPos;
use crate::world::pass::Pass;
use std::collections::{HashMap, VecDeque};

/// A request that did not fit in the bounded queue.
#[derive(Debug)]
pub struct DeferredEntry {
    pub spec: RequestSpec,
    /// Pass the column's persisted data has reached
    pub pass: Pass,
}

/// Overflow list for the request queue. Nothing in here is lost: entries are
/// moved back into the queue as capacity frees up, blocking ones first.
#[derive(Debug, Default)]
pub struct DeferredList {
    order: VecDeque<ColumnPos>,
    entries: HashMap<ColumnPos, DeferredEntry>,
}

impl DeferredList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry, merging into one already deferred for the same column
    pub fn push(&mut self, entry: DeferredEntry) {
        let pos = entry.spec.pos;
        let pass = entry.pass;
        match self.merge(entry.spec) {
            Ok(()) => {
                if let Some(existing) = self.entries.get_mut(&pos) {
                    existing.pass = existing.pass.max(pass);
                }
            }
            Err(spec) => {
                self.order.push_back(pos);
                self.entries.insert(pos, DeferredEntry { spec, pass });
            }
        }
    }

    /// Folds `spec` into the entry for the same column. Hands the spec back
    /// if the column is not deferred.
    pub fn merge(&mut self, spec: RequestSpec) -> Result<(), RequestSpec> {
        let Some(existing) = self.entries.get_mut(&spec.pos) else {
            return Err(spec);
        };
        existing.spec.until = existing.spec.until.max(spec.until);
        existing.spec.blocking |= spec.blocking;
        existing.spec.peek &= spec.peek;
        existing.spec.waiters.extend(spec.waiters);
        Ok(())
    }

    /// Next entry to admit: the oldest blocking one, else the oldest
    pub fn pop_next(&mut self) -> Option<DeferredEntry> {
        self.order.retain(|pos| self.entries.contains_key(pos));
        let position = self
            .order
            .iter()
            .position(|pos| self.entries[pos].spec.blocking)
            .unwrap_or(0);
        let pos = self.order.remove(position)?;
        self.entries.remove(&pos)
    }

    /// Puts an entry back at the head, e.g. after a failed admission
    pub fn push_front(&mut self, entry: DeferredEntry) {
        let pos = entry.spec.pos;
        if self.entries.insert(pos, entry).is_none() {
            self.order.push_front(pos);
        }
    }

    pub fn take(&mut self, pos: ColumnPos) -> Option<DeferredEntry> {
        self.entries.remove(&pos)
    }

    pub fn pass_of(&self, pos: ColumnPos) -> Option<Pass> {
        self.entries.get(&pos).map(|entry| entry.pass)
    }

    pub fn positions(&self) -> impl Iterator<Item = ColumnPos> + '_ {
        self.entries.keys().copied()
    }

    pub fn contains(&self, pos: ColumnPos) -> bool {
        self.entries.contains_key(&pos)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn describe(&self) -> Vec<String> {
        self.order
            .iter()
            .filter_map(|pos| self.entries.get(pos))
            .map(|entry| {
                format!(
                    "deferred {} pass={:?} until={:?} blocking={} waiters={}",
                    entry.spec.pos,
                    entry.pass,
                    entry.spec.until,
                    entry.spec.blocking,
                    entry.spec.waiters.len()
                )
            })
            .collect()
    }
}

use crate::error::{Result, StrataError};
use crate::generation::request::RequestFlag;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// An item the request queue can hold.
pub trait Queued {
    type Key: Copy + Eq + Hash + Debug;

    fn key(&self) -> Self::Key;
    fn flag(&self) -> RequestFlag;
    fn compare_flag(&self, current: RequestFlag, new: RequestFlag) -> bool;

    /// Claimed items are never drained by flag cleanup
    fn is_claimed(&self) -> bool {
        false
    }
}

struct IndexEntry<T> {
    /// Sequence number of the item's slot; `None` while detached
    seq: Option<u64>,
    item: Arc<T>,
}

struct Inner<T: Queued> {
    /// Slot `i` holds sequence number `front_seq + i`. Removed items leave a
    /// tombstone until the slot reaches the front or the ring is compacted.
    slots: VecDeque<Option<Arc<T>>>,
    front_seq: u64,
    tombstones: usize,
    index: HashMap<T::Key, IndexEntry<T>>,
    capacity: usize,
}

impl<T: Queued> Inner<T> {
    fn next_seq(&self) -> u64 {
        self.front_seq + self.slots.len() as u64
    }

    fn push_back(&mut self, item: Arc<T>) -> u64 {
        let seq = self.next_seq();
        self.slots.push_back(Some(item));
        seq
    }

    fn pop_front(&mut self) -> Option<Arc<T>> {
        while let Some(slot) = self.slots.pop_front() {
            self.front_seq += 1;
            match slot {
                Some(item) => return Some(item),
                None => self.tombstones -= 1,
            }
        }
        None
    }

    fn peek_front(&mut self) -> Option<&Arc<T>> {
        while let Some(None) = self.slots.front() {
            self.slots.pop_front();
            self.front_seq += 1;
            self.tombstones -= 1;
        }
        self.slots.front().and_then(|slot| slot.as_ref())
    }

    fn tombstone(&mut self, seq: u64) {
        if seq < self.front_seq {
            return;
        }
        let position = (seq - self.front_seq) as usize;
        if let Some(slot) = self.slots.get_mut(position) {
            if slot.take().is_some() {
                self.tombstones += 1;
            }
        }
        if self.tombstones > self.capacity.max(16) {
            self.compact();
        }
    }

    /// Drops tombstones and renumbers the surviving slots after the current tail
    fn compact(&mut self) {
        let survivors: Vec<Arc<T>> = self.slots.drain(..).flatten().collect();
        self.front_seq += survivors.len() as u64 + self.tombstones as u64;
        self.tombstones = 0;
        for item in survivors {
            let seq = self.push_back(item.clone());
            if let Some(entry) = self.index.get_mut(&item.key()) {
                entry.seq = Some(seq);
            }
        }
    }

    /// Moves the front item to the back, returning it
    fn rotate(&mut self) -> Option<Arc<T>> {
        let item = self.pop_front()?;
        let seq = self.push_back(item.clone());
        if let Some(entry) = self.index.get_mut(&item.key()) {
            entry.seq = Some(seq);
        }
        Some(item)
    }
}

/// Bounded FIFO of requests with an O(1) key index.
///
/// At most one entry per key and never more than `capacity` entries. All
/// methods lock internally.
pub struct RequestQueue<T: Queued> {
    inner: Mutex<Inner<T>>,
}

impl<T: Queued> RequestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        RequestQueue {
            inner: Mutex::new(Inner {
                slots: VecDeque::with_capacity(capacity),
                front_seq: 0,
                tombstones: 0,
                index: HashMap::with_capacity(capacity),
                capacity,
            }),
        }
    }

    pub fn enqueue(&self, item: Arc<T>) -> Result<()> {
        let mut inner = self.inner.lock();
        let key = item.key();
        if inner.index.contains_key(&key) {
            return Err(StrataError::DuplicateKey);
        }
        if inner.index.len() >= inner.capacity {
            return Err(StrataError::QueueCapacityExceeded {
                capacity: inner.capacity,
            });
        }
        let seq = inner.push_back(item.clone());
        inner.index.insert(key, IndexEntry { seq: Some(seq), item });
        Ok(())
    }

    pub fn dequeue(&self) -> Option<Arc<T>> {
        let mut inner = self.inner.lock();
        let item = inner.pop_front()?;
        inner.index.remove(&item.key());
        Some(item)
    }

    /// Takes the front item out of the ring but keeps its key reserved, so
    /// it can be processed outside the lock and put back with [`reinsert`].
    ///
    /// [`reinsert`]: RequestQueue::reinsert
    pub fn dequeue_keep_index(&self) -> Option<Arc<T>> {
        let mut inner = self.inner.lock();
        let item = inner.pop_front()?;
        if let Some(entry) = inner.index.get_mut(&item.key()) {
            entry.seq = None;
        }
        Some(item)
    }

    /// Puts a detached item back at the end. Returns false if its key was
    /// removed while it was out.
    pub fn reinsert(&self, item: Arc<T>) -> bool {
        let mut inner = self.inner.lock();
        let key = item.key();
        match inner.index.get(&key) {
            Some(entry) if entry.seq.is_none() && Arc::ptr_eq(&entry.item, &item) => {}
            _ => return false,
        }
        let seq = inner.push_back(item);
        if let Some(entry) = inner.index.get_mut(&key) {
            entry.seq = Some(seq);
        }
        true
    }

    /// Moves the front item to the back without touching the index
    pub fn requeue(&self) -> Option<Arc<T>> {
        self.inner.lock().rotate()
    }

    pub fn remove_by_key(&self, key: T::Key) -> Option<Arc<T>> {
        let mut inner = self.inner.lock();
        let entry = inner.index.remove(&key)?;
        if let Some(seq) = entry.seq {
            inner.tombstone(seq);
        }
        Some(entry.item)
    }

    pub fn get(&self, key: T::Key) -> Option<Arc<T>> {
        self.inner.lock().index.get(&key).map(|entry| entry.item.clone())
    }

    pub fn contains(&self, key: T::Key) -> bool {
        self.inner.lock().index.contains_key(&key)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// True while one more entry fits without eating into `margin`
    pub fn has_room(&self, margin: usize) -> bool {
        let inner = self.inner.lock();
        inner.index.len() + margin < inner.capacity
    }

    /// Read-only view that re-locks on every step. Entries moved to the back
    /// while the snapshot is walking are not visited again.
    pub fn snapshot(&self) -> Snapshot<'_, T> {
        let end = self.inner.lock().next_seq();
        Snapshot {
            queue: self,
            cursor: 0,
            end,
        }
    }

    /// Drains flagged entries from the front: dispose requests are removed,
    /// requeue requests move to the back with the flag cleared. Stops at the
    /// first live or claimed entry. Removed items go to `on_dispose` once the
    /// lock is released.
    pub fn cleanup_stale_flags<F>(&self, mut on_dispose: F) -> usize
    where
        F: FnMut(Arc<T>),
    {
        let mut disposed = Vec::new();
        {
            let mut inner = self.inner.lock();
            let mut budget = inner.slots.len();
            while budget > 0 {
                budget -= 1;
                let front = match inner.peek_front() {
                    Some(front) => front.clone(),
                    None => break,
                };
                if front.is_claimed() {
                    break;
                }
                match front.flag() {
                    RequestFlag::DisposeRequested | RequestFlag::Disposed => {
                        inner.pop_front();
                        inner.index.remove(&front.key());
                        front.compare_flag(RequestFlag::DisposeRequested, RequestFlag::Disposed);
                        disposed.push(front);
                    }
                    RequestFlag::RequeueRequested => {
                        front.compare_flag(RequestFlag::RequeueRequested, RequestFlag::Live);
                        inner.rotate();
                    }
                    RequestFlag::Live => break,
                }
            }
        }
        let removed = disposed.len();
        for item in disposed {
            on_dispose(item);
        }
        removed
    }

    /// Rotates up to `limit` entries from the front to the back and returns
    /// the first one `pick` accepts, along with how many entries were looked at.
    pub fn rotate_scan<F>(&self, limit: usize, mut pick: F) -> (Option<Arc<T>>, usize)
    where
        F: FnMut(&Arc<T>) -> bool,
    {
        let mut inner = self.inner.lock();
        let limit = limit.min(inner.slots.len() - inner.tombstones);
        for scanned in 1..=limit {
            let item = match inner.rotate() {
                Some(item) => item,
                None => return (None, scanned),
            };
            if pick(&item) {
                return (Some(item), scanned);
            }
        }
        (None, limit)
    }

    /// Only called while the workers are paused
    pub fn set_capacity(&self, capacity: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.index.len() > capacity {
            return Err(StrataError::QueueCapacityExceeded { capacity });
        }
        inner.capacity = capacity;
        Ok(())
    }

    /// Empties the queue, ring order first, then detached entries
    pub fn drain_all(&self) -> Vec<Arc<T>> {
        let mut inner = self.inner.lock();
        let mut drained: Vec<Arc<T>> = Vec::with_capacity(inner.index.len());
        while let Some(item) = inner.pop_front() {
            inner.index.remove(&item.key());
            drained.push(item);
        }
        drained.extend(inner.index.drain().map(|(_, entry)| entry.item));
        inner.tombstones = 0;
        drained
    }
}

/// Lazy iterator over the queue's live slots
pub struct Snapshot<'a, T: Queued> {
    queue: &'a RequestQueue<T>,
    cursor: u64,
    end: u64,
}

impl<T: Queued> Snapshot<'_, T> {
    /// Starts over from the current front
    pub fn restart(&mut self) {
        self.cursor = 0;
        self.end = self.queue.inner.lock().next_seq();
    }
}

impl<T: Queued> Iterator for Snapshot<'_, T> {
    type Item = Arc<T>;

    fn next(&mut self) -> Option<Arc<T>> {
        let inner = self.queue.inner.lock();
        let mut seq = self.cursor.max(inner.front_seq);
        while seq < self.end.min(inner.next_seq()) {
            let position = (seq - inner.front_seq) as usize;
            if let Some(Some(item)) = inner.slots.get(position) {
                self.cursor = seq + 1;
                return Some(item.clone());
            }
            seq += 1;
        }
        self.cursor = self.end;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rand::Rng;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

    struct Item {
        key: u32,
        flag: AtomicU8,
        claimed: AtomicBool,
    }

    impl Item {
        fn new(key: u32) -> Arc<Item> {
            Arc::new(Item {
                key,
                flag: AtomicU8::new(RequestFlag::Live as u8),
                claimed: AtomicBool::new(false),
            })
        }

        fn set(&self, flag: RequestFlag) {
            self.flag.store(flag as u8, Ordering::SeqCst);
        }
    }

    impl Queued for Item {
        type Key = u32;

        fn key(&self) -> u32 {
            self.key
        }

        fn flag(&self) -> RequestFlag {
            match self.flag.load(Ordering::SeqCst) {
                0 => RequestFlag::Live,
                1 => RequestFlag::RequeueRequested,
                2 => RequestFlag::DisposeRequested,
                _ => RequestFlag::Disposed,
            }
        }

        fn compare_flag(&self, current: RequestFlag, new: RequestFlag) -> bool {
            self.flag
                .compare_exchange(current as u8, new as u8, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        }

        fn is_claimed(&self) -> bool {
            self.claimed.load(Ordering::SeqCst)
        }
    }

    fn keys(queue: &RequestQueue<Item>) -> Vec<u32> {
        queue.snapshot().map(|item| item.key).collect()
    }

    #[test]
    fn test_capacity_and_duplicates() {
        let queue = RequestQueue::new(2);
        queue.enqueue(Item::new(1)).unwrap();
        assert_matches!(queue.enqueue(Item::new(1)), Err(StrataError::DuplicateKey));
        queue.enqueue(Item::new(2)).unwrap();
        assert_matches!(
            queue.enqueue(Item::new(3)),
            Err(StrataError::QueueCapacityExceeded { capacity: 2 })
        );
        assert_eq!(queue.count(), 2);
        assert!(!queue.has_room(0));
    }

    #[test]
    fn test_fifo_order_with_removal() {
        let queue = RequestQueue::new(8);
        for key in 0..5 {
            queue.enqueue(Item::new(key)).unwrap();
        }
        assert_eq!(queue.remove_by_key(2).map(|item| item.key), Some(2));
        assert!(queue.remove_by_key(2).is_none());
        assert_eq!(keys(&queue), vec![0, 1, 3, 4]);
        assert_eq!(queue.dequeue().map(|item| item.key), Some(0));
        assert_eq!(queue.requeue().map(|item| item.key), Some(1));
        assert_eq!(keys(&queue), vec![3, 4, 1]);
        assert_eq!(queue.count(), 3);
    }

    #[test]
    fn test_detached_entry_keeps_key_reserved() {
        let queue = RequestQueue::new(4);
        queue.enqueue(Item::new(7)).unwrap();
        queue.enqueue(Item::new(8)).unwrap();
        let item = queue.dequeue_keep_index().unwrap();
        assert_eq!(item.key, 7);
        assert!(queue.contains(7));
        assert_eq!(queue.count(), 2);
        assert_matches!(queue.enqueue(Item::new(7)), Err(StrataError::DuplicateKey));
        assert_eq!(keys(&queue), vec![8]);

        assert!(queue.reinsert(item.clone()));
        assert!(!queue.reinsert(item));
        assert_eq!(keys(&queue), vec![8, 7]);
    }

    #[test]
    fn test_cleanup_stops_at_first_live_entry() {
        let queue = RequestQueue::new(8);
        let items: Vec<_> = (0..5).map(Item::new).collect();
        for item in &items {
            queue.enqueue(item.clone()).unwrap();
        }
        items[0].set(RequestFlag::DisposeRequested);
        items[1].set(RequestFlag::RequeueRequested);
        items[3].set(RequestFlag::DisposeRequested);

        let mut disposed = Vec::new();
        let removed = queue.cleanup_stale_flags(|item| disposed.push(item.key));
        assert_eq!(removed, 1);
        assert_eq!(disposed, vec![0]);
        assert_eq!(items[0].flag(), RequestFlag::Disposed);
        assert_eq!(items[1].flag(), RequestFlag::Live);
        assert_eq!(keys(&queue), vec![2, 3, 4, 1]);
    }

    #[test]
    fn test_cleanup_skips_claimed_front() {
        let queue = RequestQueue::new(4);
        let item = Item::new(1);
        queue.enqueue(item.clone()).unwrap();
        item.set(RequestFlag::DisposeRequested);
        item.claimed.store(true, Ordering::SeqCst);
        assert_eq!(queue.cleanup_stale_flags(|_| {}), 0);
        item.claimed.store(false, Ordering::SeqCst);
        assert_eq!(queue.cleanup_stale_flags(|_| {}), 1);
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn test_rotate_scan_returns_first_match() {
        let queue = RequestQueue::new(8);
        for key in 0..4 {
            queue.enqueue(Item::new(key)).unwrap();
        }
        let (found, scanned) = queue.rotate_scan(8, |item| item.key == 2);
        assert_eq!(found.map(|item| item.key), Some(2));
        assert_eq!(scanned, 3);
        assert_eq!(keys(&queue), vec![3, 0, 1, 2]);

        let (found, scanned) = queue.rotate_scan(2, |item| item.key == 9);
        assert!(found.is_none());
        assert_eq!(scanned, 2);
    }

    #[test]
    fn test_snapshot_restart() {
        let queue = RequestQueue::new(4);
        queue.enqueue(Item::new(1)).unwrap();
        let mut snapshot = queue.snapshot();
        assert_eq!(snapshot.next().map(|item| item.key), Some(1));
        assert!(snapshot.next().is_none());
        queue.enqueue(Item::new(2)).unwrap();
        snapshot.restart();
        assert_eq!(snapshot.map(|item| item.key).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_set_capacity_refuses_to_shrink_below_count() {
        let queue = RequestQueue::new(4);
        for key in 0..3 {
            queue.enqueue(Item::new(key)).unwrap();
        }
        assert!(queue.set_capacity(2).is_err());
        queue.set_capacity(3).unwrap();
        assert_eq!(queue.capacity(), 3);
        assert_eq!(queue.drain_all().len(), 3);
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn test_fuzzed_operations_keep_invariants() {
        let mut rng = rand::thread_rng();
        let capacity = 16;
        let queue = RequestQueue::new(capacity);
        let mut model: HashSet<u32> = HashSet::new();
        let mut detached: Vec<Arc<Item>> = Vec::new();

        for _ in 0..5_000 {
            let key = rng.gen_range(0..40);
            match rng.gen_range(0..7) {
                0 | 1 => match queue.enqueue(Item::new(key)) {
                    Ok(()) => assert!(model.insert(key)),
                    Err(StrataError::DuplicateKey) => assert!(model.contains(&key)),
                    Err(StrataError::QueueCapacityExceeded { .. }) => {
                        assert_eq!(model.len(), capacity)
                    }
                    Err(other) => panic!("unexpected error {}", other),
                },
                2 => {
                    if let Some(item) = queue.dequeue() {
                        assert!(model.remove(&item.key));
                    }
                }
                3 => {
                    let removed = queue.remove_by_key(key);
                    assert_eq!(removed.is_some(), model.remove(&key));
                }
                4 => {
                    if let Some(item) = queue.dequeue_keep_index() {
                        detached.push(item);
                    }
                }
                5 => {
                    if let Some(item) = detached.pop() {
                        if queue.reinsert(item.clone()) {
                            assert!(model.contains(&item.key));
                        }
                    }
                }
                _ => {
                    queue.rotate_scan(rng.gen_range(1..6), |_| false);
                }
            }
            assert!(queue.count() <= capacity);
            assert_eq!(queue.count(), model.len());
            let visible = keys(&queue);
            let unique: HashSet<u32> = visible.iter().copied().collect();
            assert_eq!(unique.len(), visible.len());
        }
    }
}

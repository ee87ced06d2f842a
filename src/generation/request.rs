use crate::codec::Tag;
use crate::generation::queue::Queued;
use crate::world::coord::ColumnPos;
use crate::world::loaded::ColumnData;
use crate::world::pass::Pass;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

static CREATION_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Process-wide monotonic request sequence number
pub fn next_creation_time() -> u64 {
    CREATION_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// What a waiter learns once its column is settled.
#[derive(Debug, Clone)]
pub enum ColumnOutcome {
    Ready(Arc<ColumnData>),
    Failed { pos: ColumnPos, pass: Pass, reason: String },
}

/// Invoked on the main thread during hand-off
pub type ReadyCallback = Box<dyn FnOnce(ColumnOutcome) + Send>;

/// Shared by every column of an area load
pub type AreaCallback = Arc<dyn Fn(&ColumnOutcome) + Send + Sync>;

/// Request lifecycle flag. Only moved by compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestFlag {
    Live = 0,
    RequeueRequested = 1,
    DisposeRequested = 2,
    Disposed = 3,
}

impl RequestFlag {
    fn from_u8(value: u8) -> RequestFlag {
        match value {
            0 => RequestFlag::Live,
            1 => RequestFlag::RequeueRequested,
            2 => RequestFlag::DisposeRequested,
            _ => RequestFlag::Disposed,
        }
    }
}

struct Waiters {
    callbacks: Vec<ReadyCallback>,
    closed: bool,
}

/// Everything needed to (re)create a request; also what the deferred list
/// keeps for requests pushed out of the bounded queue.
pub struct RequestSpec {
    pub pos: ColumnPos,
    pub until: Pass,
    pub blocking: bool,
    pub peek: bool,
    pub params: Tag,
    pub waiters: Vec<ReadyCallback>,
}

impl RequestSpec {
    pub fn new(pos: ColumnPos, until: Pass) -> Self {
        RequestSpec {
            pos,
            until,
            blocking: false,
            peek: false,
            params: Tag::default(),
            waiters: Vec::new(),
        }
    }
}

impl fmt::Debug for RequestSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSpec")
            .field("pos", &self.pos)
            .field("until", &self.until)
            .field("blocking", &self.blocking)
            .field("peek", &self.peek)
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

/// One column moving through the generation passes.
pub struct ColumnRequest {
    pub pos: ColumnPos,
    pub map_index: u64,
    pub creation_time: u64,
    pub params: Tag,
    current_pass: AtomicU8,
    until_pass: AtomicU8,
    prettified: AtomicBool,
    blocking: AtomicBool,
    peek: AtomicBool,
    flag: AtomicU8,
    claimed: AtomicBool,
    terrain_attempts: AtomicU32,
    data: RwLock<Option<Arc<ColumnData>>>,
    waiters: Mutex<Waiters>,
}

impl ColumnRequest {
    pub fn new(spec: RequestSpec, map_size_x: i32) -> Self {
        ColumnRequest {
            pos: spec.pos,
            map_index: spec.pos.map_index(map_size_x),
            creation_time: next_creation_time(),
            params: spec.params,
            current_pass: AtomicU8::new(Pass::None as u8),
            until_pass: AtomicU8::new(spec.until as u8),
            prettified: AtomicBool::new(false),
            blocking: AtomicBool::new(spec.blocking),
            peek: AtomicBool::new(spec.peek),
            flag: AtomicU8::new(RequestFlag::Live as u8),
            claimed: AtomicBool::new(false),
            terrain_attempts: AtomicU32::new(0),
            data: RwLock::new(None),
            waiters: Mutex::new(Waiters {
                callbacks: spec.waiters,
                closed: false,
            }),
        }
    }

    pub fn current_pass(&self) -> Pass {
        Pass::from_u8(self.current_pass.load(Ordering::Acquire)).unwrap_or(Pass::Done)
    }

    /// Moves the request forward to `pass`; a lower value is ignored.
    /// Clears the neighbour validation of the previous pass.
    pub fn advance_to(&self, pass: Pass) {
        let previous = self.current_pass.fetch_max(pass as u8, Ordering::AcqRel);
        if previous < pass as u8 {
            self.prettified.store(false, Ordering::Release);
        }
    }

    pub fn until_pass(&self) -> Pass {
        Pass::from_u8(self.until_pass.load(Ordering::Acquire)).unwrap_or(Pass::Done)
    }

    /// Raises the ceiling. Returns true if it actually moved.
    pub fn raise_until(&self, pass: Pass) -> bool {
        self.until_pass.fetch_max(pass as u8, Ordering::AcqRel) < pass as u8
    }

    /// Reached its ceiling and waits for someone to raise it
    pub fn is_parked(&self) -> bool {
        self.current_pass() >= self.until_pass()
    }

    pub fn prettified(&self) -> bool {
        self.prettified.load(Ordering::Acquire)
    }

    pub fn set_prettified(&self) {
        self.prettified.store(true, Ordering::Release);
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Acquire)
    }

    pub fn set_blocking(&self) {
        self.blocking.store(true, Ordering::Release);
    }

    pub fn is_peek(&self) -> bool {
        self.peek.load(Ordering::Acquire)
    }

    /// A regular request for the same column turns a peek into a real load
    pub fn clear_peek(&self) {
        self.peek.store(false, Ordering::Release);
    }

    pub fn flag(&self) -> RequestFlag {
        RequestFlag::from_u8(self.flag.load(Ordering::Acquire))
    }

    pub fn compare_flag(&self, current: RequestFlag, new: RequestFlag) -> bool {
        self.flag
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Requests disposal unless already on the way out
    pub fn request_dispose(&self) -> bool {
        loop {
            let current = self.flag();
            match current {
                RequestFlag::DisposeRequested | RequestFlag::Disposed => return false,
                _ => {
                    if self.compare_flag(current, RequestFlag::DisposeRequested) {
                        return true;
                    }
                }
            }
        }
    }

    pub fn mark_disposed(&self) {
        self.flag
            .store(RequestFlag::Disposed as u8, Ordering::Release);
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self.flag(),
            RequestFlag::Live | RequestFlag::RequeueRequested
        )
    }

    /// Claims the request for processing. At most one thread holds it.
    pub fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_claim(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    pub fn next_terrain_attempt(&self) -> u32 {
        self.terrain_attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn data(&self) -> Option<Arc<ColumnData>> {
        self.data.read().clone()
    }

    pub fn set_data(&self, data: Arc<ColumnData>) {
        *self.data.write() = Some(data);
    }

    pub fn take_data(&self) -> Option<Arc<ColumnData>> {
        self.data.write().take()
    }

    /// Raises the ceiling to `until` and adds `callbacks` in one step, so a
    /// request parking concurrently never hands them a lower pass. Hands
    /// the callbacks back if the request was already handed off.
    pub fn add_waiters(
        &self,
        until: Pass,
        callbacks: Vec<ReadyCallback>,
    ) -> Result<(), Vec<ReadyCallback>> {
        let mut waiters = self.waiters.lock();
        if waiters.closed {
            return Err(callbacks);
        }
        self.raise_until(until);
        waiters.callbacks.extend(callbacks);
        Ok(())
    }

    /// Takes the waiters if the request is parked at its ceiling. They stay
    /// open for callers asking for a higher pass later.
    pub fn take_reached_waiters(&self) -> Vec<ReadyCallback> {
        let mut waiters = self.waiters.lock();
        if waiters.closed || !self.is_parked() {
            return Vec::new();
        }
        std::mem::take(&mut waiters.callbacks)
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().callbacks.len()
    }

    /// Takes the waiters and refuses new ones from now on
    pub fn close_waiters(&self) -> Vec<ReadyCallback> {
        let mut waiters = self.waiters.lock();
        waiters.closed = true;
        std::mem::take(&mut waiters.callbacks)
    }

    /// Turns the request back into a spec for the deferred list
    pub fn to_spec(&self, waiters: Vec<ReadyCallback>) -> RequestSpec {
        RequestSpec {
            pos: self.pos,
            until: self.until_pass(),
            blocking: self.is_blocking(),
            peek: self.is_peek(),
            params: self.params.clone(),
            waiters,
        }
    }
}

impl Queued for ColumnRequest {
    type Key = ColumnPos;

    fn key(&self) -> ColumnPos {
        self.pos
    }

    fn flag(&self) -> RequestFlag {
        ColumnRequest::flag(self)
    }

    fn compare_flag(&self, current: RequestFlag, new: RequestFlag) -> bool {
        ColumnRequest::compare_flag(self, current, new)
    }

    fn is_claimed(&self) -> bool {
        ColumnRequest::is_claimed(self)
    }
}

impl fmt::Debug for ColumnRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnRequest")
            .field("pos", &self.pos)
            .field("current", &self.current_pass())
            .field("until", &self.until_pass())
            .field("flag", &self.flag())
            .field("claimed", &self.is_claimed())
            .field("blocking", &self.is_blocking())
            .field("peek", &self.is_peek())
            .field("created", &self.creation_time)
            .finish()
    }
}

/// Releases a claim when dropped
pub struct ClaimGuard<'a>(&'a ColumnRequest);

impl<'a> ClaimGuard<'a> {
    /// Wraps a claim the caller already holds
    pub fn adopt(request: &'a ColumnRequest) -> Self {
        ClaimGuard(request)
    }

    pub fn try_new(request: &'a ColumnRequest) -> Option<Self> {
        request.try_claim().then(|| ClaimGuard(request))
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.0.release_claim();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(until: Pass) -> ColumnRequest {
        ColumnRequest::new(RequestSpec::new(ColumnPos::new(2, 3, 0), until), 16)
    }

    #[test]
    fn test_passes_only_move_forward() {
        let request = request(Pass::Done);
        request.advance_to(Pass::Vegetation);
        request.advance_to(Pass::Terrain);
        assert_eq!(request.current_pass(), Pass::Vegetation);
        assert_eq!(request.map_index, 3 * 16 + 2);
    }

    #[test]
    fn test_until_is_raise_only() {
        let request = request(Pass::Vegetation);
        assert!(!request.raise_until(Pass::Terrain));
        assert_eq!(request.until_pass(), Pass::Vegetation);
        assert!(request.raise_until(Pass::Done));
        assert_eq!(request.until_pass(), Pass::Done);
    }

    #[test]
    fn test_prettified_resets_on_advance() {
        let request = request(Pass::Done);
        request.advance_to(Pass::Terrain);
        request.set_prettified();
        request.advance_to(Pass::Terrain);
        assert!(request.prettified());
        request.advance_to(Pass::Vegetation);
        assert!(!request.prettified());
    }

    #[test]
    fn test_single_claim() {
        let request = request(Pass::Done);
        let guard = ClaimGuard::try_new(&request);
        assert!(guard.is_some());
        assert!(ClaimGuard::try_new(&request).is_none());
        drop(guard);
        assert!(ClaimGuard::try_new(&request).is_some());
    }

    #[test]
    fn test_dispose_flag_transitions() {
        let request = request(Pass::Done);
        assert!(request.compare_flag(RequestFlag::Live, RequestFlag::RequeueRequested));
        assert!(request.is_live());
        assert!(request.request_dispose());
        assert!(!request.request_dispose());
        assert!(!request.is_live());
        request.mark_disposed();
        assert_eq!(request.flag(), RequestFlag::Disposed);
    }

    #[test]
    fn test_closed_waiters_hand_back_callback() {
        let request = request(Pass::Terrain);
        assert!(request.add_waiters(Pass::Done, vec![Box::new(|_| {})]).is_ok());
        assert_eq!(request.until_pass(), Pass::Done);
        assert_eq!(request.close_waiters().len(), 1);
        assert!(request.add_waiters(Pass::Done, vec![Box::new(|_| {})]).is_err());
    }

    #[test]
    fn test_reached_waiters_only_taken_when_parked() {
        let request = request(Pass::Terrain);
        assert!(request.add_waiters(Pass::Terrain, vec![Box::new(|_| {})]).is_ok());
        assert!(request.take_reached_waiters().is_empty());
        request.advance_to(Pass::Terrain);
        assert_eq!(request.take_reached_waiters().len(), 1);
        assert_eq!(request.waiter_count(), 0);
        assert!(request.add_waiters(Pass::Done, Vec::new()).is_ok());
    }
}

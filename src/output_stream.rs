use core::fmt;
use std::{collections::VecDeque, fmt::Debug, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::watch;

/// Default number of retained entries for line-mode streams
pub const DEFAULT_LINE_CAPACITY: usize = 1000;
/// Default number of retained bytes for byte-mode streams
pub const DEFAULT_BYTE_CAPACITY: usize = 128 * 1024;

/// Decides when a stream's owning service counts as "up". Called after every
/// append with the retained entries (newest last) and the entry that was just
/// appended; returning `true` latches readiness permanently.
pub type ReadyPredicate<T> = Arc<dyn Fn(&VecDeque<T>, &T) -> bool + Send + Sync>;

/// Returns a [ReadyPredicate] that fires on the first line containing
/// `marker`, e.g. postgres' "database system is ready to accept connections".
pub fn line_marker(marker: impl AsRef<str>) -> ReadyPredicate<String> {
    let marker = marker.as_ref().to_owned();
    Arc::new(move |_, line: &String| line.contains(&marker))
}

/// A one-shot broadcast latch. Multiple tasks can `wait` on it; `set` wakes
/// all of them and every later `wait` resolves immediately. Cloning shares the
/// same latch.
#[derive(Clone)]
pub struct ReadyLatch {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ReadyLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ReadyLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyLatch")
            .field("set", &self.is_set())
            .finish()
    }
}

impl ReadyLatch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Idempotent
    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `set` has been called (immediately if it already has)
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // cannot fail, the sender is kept alive by `self`
        let _ = rx.wait_for(|set| *set).await;
    }
}

struct StreamState<T> {
    entries: VecDeque<T>,
    entries_removed: u64,
}

/// Bounded append-only history of one stdio channel with latched readiness.
///
/// Appending beyond `capacity` silently evicts from the front and counts the
/// evictions, so `entries_removed + len` is the monotonically increasing
/// logical length of everything ever appended. Readers take snapshots and
/// never block appenders for long; there is a single appender per stream.
pub struct OutputStream<T> {
    capacity: usize,
    state: Mutex<StreamState<T>>,
    predicate: Option<ReadyPredicate<T>>,
    ready: ReadyLatch,
    any_ready: ReadyLatch,
}

impl<T> Debug for OutputStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OutputStream")
            .field("capacity", &self.capacity)
            .field("len", &state.entries.len())
            .field("entries_removed", &state.entries_removed)
            .field("ready", &self.ready.is_set())
            .finish()
    }
}

impl<T> OutputStream<T> {
    /// `any_ready` is the latch shared with the sibling stream of the same
    /// process, tripped when either sibling becomes ready. A `predicate` of
    /// `None` means "ready on first append".
    pub fn new(
        capacity: usize,
        predicate: Option<ReadyPredicate<T>>,
        any_ready: ReadyLatch,
    ) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            state: Mutex::new(StreamState {
                entries: VecDeque::new(),
                entries_removed: 0,
            }),
            predicate,
            ready: ReadyLatch::new(),
            any_ready,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of currently retained entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries evicted from the front so far
    pub fn entries_removed(&self) -> u64 {
        self.state.lock().entries_removed
    }

    /// `entries_removed + len`, the sequence number of the next entry to be
    /// appended. Monotonically non-decreasing.
    pub fn logical_len(&self) -> u64 {
        let state = self.state.lock();
        state.entries_removed + (state.entries.len() as u64)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_set()
    }

    /// Forces the ready latch (and the shared any-ready latch). Idempotent;
    /// called on process exit so that no waiter stalls forever.
    pub fn mark_ready(&self) {
        self.ready.set();
        self.any_ready.set();
    }

    /// Resolves once this stream is ready
    pub async fn wait_ready(&self) {
        self.ready.wait().await
    }

    /// Resolves once this stream or its sibling is ready
    pub async fn wait_any_ready(&self) {
        self.any_ready.wait().await
    }

    /// Appends one entry, evicting from the front if over capacity, and runs
    /// the ready predicate if readiness has not latched yet.
    pub fn push(&self, entry: T) {
        self.extend([entry])
    }

    /// Appends every entry under a single lock acquisition
    pub fn extend<I: IntoIterator<Item = T>>(&self, entries: I) {
        let mut hit = false;
        {
            let mut state = self.state.lock();
            for entry in entries {
                state.entries.push_back(entry);
                while state.entries.len() > self.capacity {
                    state.entries.pop_front();
                    state.entries_removed += 1;
                }
                if !hit && !self.ready.is_set() {
                    hit = match (self.predicate.as_ref(), state.entries.back()) {
                        (None, _) => true,
                        (Some(predicate), Some(last)) => predicate(&state.entries, last),
                        // a zero-capacity stream retains nothing to evaluate
                        (Some(_), None) => false,
                    };
                }
            }
        }
        if hit {
            self.mark_ready();
        }
    }

    /// Merges a replicated suffix pulled from an origin stream that has
    /// already evicted `origin_removed` entries. If the origin evicted past
    /// our logical length there is a gap we can never recover; everything
    /// held is dropped and the eviction counter jumps to `origin_removed` so
    /// both sides agree on the `(entries_removed, entries)` decomposition.
    /// The entries then run through the normal append path (predicates
    /// included).
    pub fn absorb(&self, origin_removed: u64, entries: Vec<T>) {
        {
            let mut state = self.state.lock();
            let logical = state.entries_removed + (state.entries.len() as u64);
            if origin_removed > logical {
                state.entries.clear();
                state.entries_removed = origin_removed;
            }
        }
        self.extend(entries);
    }
}

impl<T: Clone> OutputStream<T> {
    /// `(entries_removed, retained entries)` at a point in time
    pub fn snapshot(&self) -> (u64, Vec<T>) {
        let state = self.state.lock();
        (state.entries_removed, state.entries.iter().cloned().collect())
    }
}

impl OutputStream<u8> {
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.extend(bytes.iter().copied())
    }
}

/// One stdio channel of a process, in either decoded-line or raw-byte mode
#[derive(Clone, Debug)]
pub enum OutputHandle {
    Lines(Arc<OutputStream<String>>),
    Bytes(Arc<OutputStream<u8>>),
}

impl OutputHandle {
    pub fn as_lines(&self) -> bool {
        matches!(self, Self::Lines(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Lines(s) => s.len(),
            Self::Bytes(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries_removed(&self) -> u64 {
        match self {
            Self::Lines(s) => s.entries_removed(),
            Self::Bytes(s) => s.entries_removed(),
        }
    }

    pub fn logical_len(&self) -> u64 {
        match self {
            Self::Lines(s) => s.logical_len(),
            Self::Bytes(s) => s.logical_len(),
        }
    }

    pub fn is_ready(&self) -> bool {
        match self {
            Self::Lines(s) => s.is_ready(),
            Self::Bytes(s) => s.is_ready(),
        }
    }

    pub fn mark_ready(&self) {
        match self {
            Self::Lines(s) => s.mark_ready(),
            Self::Bytes(s) => s.mark_ready(),
        }
    }

    pub async fn wait_ready(&self) {
        match self {
            Self::Lines(s) => s.wait_ready().await,
            Self::Bytes(s) => s.wait_ready().await,
        }
    }

    pub async fn wait_any_ready(&self) {
        match self {
            Self::Lines(s) => s.wait_any_ready().await,
            Self::Bytes(s) => s.wait_any_ready().await,
        }
    }

    /// Snapshot of the retained lines, `None` in byte mode
    pub fn lines(&self) -> Option<Vec<String>> {
        match self {
            Self::Lines(s) => Some(s.snapshot().1),
            Self::Bytes(_) => None,
        }
    }

    /// Snapshot of the retained bytes, `None` in line mode
    pub fn bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::Lines(_) => None,
            Self::Bytes(s) => Some(s.snapshot().1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_stream(capacity: usize) -> Arc<OutputStream<String>> {
        OutputStream::new(capacity, None, ReadyLatch::new())
    }

    #[test]
    fn eviction_keeps_logical_length() {
        let s = line_stream(3);
        for entry in ["a", "b", "c", "d", "e"] {
            s.push(entry.to_owned());
        }
        let (removed, entries) = s.snapshot();
        assert_eq!(entries, ["c", "d", "e"]);
        assert_eq!(removed, 2);
        assert_eq!(s.logical_len(), 5);
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn default_predicate_latches_on_first_append() {
        let s = line_stream(10);
        assert!(!s.is_ready());
        s.push("anything".to_owned());
        assert!(s.is_ready());
    }

    #[test]
    fn marker_predicate_latches_once_and_stays() {
        let any = ReadyLatch::new();
        let s = OutputStream::new(10, Some(line_marker("ready")), any.clone());
        s.push("starting up".to_owned());
        assert!(!s.is_ready());
        assert!(!any.is_set());
        s.push("database system is ready".to_owned());
        assert!(s.is_ready());
        assert!(any.is_set());
        // eviction and further appends never unlatch
        for i in 0..100 {
            s.push(format!("line {i}"));
        }
        assert!(s.is_ready());
    }

    #[test]
    fn any_ready_is_shared_between_siblings() {
        let any = ReadyLatch::new();
        let stdout = OutputStream::new(10, Some(line_marker("never")), any.clone());
        let stderr: Arc<OutputStream<String>> = OutputStream::new(10, None, any.clone());
        assert!(!stdout.is_ready());
        stderr.push("err".to_owned());
        assert!(!stdout.is_ready());
        assert!(any.is_set());
    }

    #[test]
    fn mark_ready_is_idempotent() {
        let s = line_stream(10);
        s.mark_ready();
        s.mark_ready();
        assert!(s.is_ready());
    }

    #[test]
    fn absorb_adopts_origin_eviction() {
        let s = line_stream(100);
        let entries: Vec<String> = (10..15).map(|i| format!("E{i}")).collect();
        s.absorb(10, entries.clone());
        let (removed, held) = s.snapshot();
        assert_eq!(removed, 10);
        assert_eq!(held, entries);
        assert_eq!(s.logical_len(), 15);
        // a second pull starting at the agreed offset appends normally
        s.absorb(10, vec!["E15".to_owned()]);
        assert_eq!(s.logical_len(), 15);
        s.absorb(15, vec!["E15".to_owned()]);
        assert_eq!(s.logical_len(), 16);
    }

    #[test]
    fn absorb_drops_unrecoverable_gap() {
        let s = line_stream(100);
        s.extend((0..5).map(|i| format!("E{i}")));
        // origin evicted past everything we hold plus a gap
        s.absorb(10, vec!["E10".to_owned()]);
        let (removed, held) = s.snapshot();
        assert_eq!(removed, 10);
        assert_eq!(held, ["E10"]);
        assert_eq!(s.logical_len(), 11);
    }

    #[test]
    fn byte_mode_counts_bytes() {
        let any = ReadyLatch::new();
        let s: Arc<OutputStream<u8>> = OutputStream::new(4, None, any);
        s.push_bytes(b"abcdef");
        let (removed, held) = s.snapshot();
        assert_eq!(removed, 2);
        assert_eq!(held, b"cdef");
        assert_eq!(s.logical_len(), 6);
    }

    #[tokio::test]
    async fn waiters_wake_on_set() {
        let s = line_stream(10);
        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.wait_ready().await })
        };
        tokio::task::yield_now().await;
        s.push("go".to_owned());
        waiter.await.unwrap();
        // late waiters resolve immediately
        s.wait_ready().await;
    }
}

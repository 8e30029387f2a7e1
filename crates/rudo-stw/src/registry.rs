//! The thread registry.
//!
//! A fixed table of [`THREAD_TABLE_SIZE`] buckets maps native thread ids to
//! [`ThreadRecord`]s. Records are reference counted so their address stays
//! stable for as long as anybody (a suspended thread, the initiator) holds
//! on to them. Buckets keep insertion order and are searched newest-first:
//! a thread id may be reused by the OS before the previous owner's record
//! was reaped, and the newest record always wins.
//!
//! All mutation happens under the allocation lock, which owns the registry.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sys_thread::NativeThreadId;

use crate::atomic::{FlagCell, SuspendCell, SuspendState, ThreadFlags};
use crate::context::{ContextSlot, SavedContext, ThreadRoots};
use crate::error::StwError;
use crate::suspend::Parker;

/// Number of hash buckets.
pub const THREAD_TABLE_SIZE: usize = 256;

/// Bucket index for `id`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn bucket_index(id: NativeThreadId) -> usize {
    let raw = id.as_raw();
    ((raw >> 8) ^ raw) as usize % THREAD_TABLE_SIZE
}

/// Control block of one registered thread.
pub struct ThreadRecord {
    id: NativeThreadId,
    collector: u64,
    stack_end: usize,
    pub(crate) flags: FlagCell,
    pub(crate) suspend: SuspendCell,
    /// Set while the thread runs code that never touches the managed heap.
    pub(crate) blocked: AtomicBool,
    /// Set while the thread is inside an allocator critical region.
    pub(crate) in_critical: AtomicBool,
    pub(crate) context: ContextSlot,
    pub(crate) parker: Parker,
}

impl ThreadRecord {
    fn new(id: NativeThreadId, stack_end: usize, collector: u64) -> Self {
        Self {
            id,
            collector,
            stack_end,
            flags: FlagCell::new(ThreadFlags::NONE),
            suspend: SuspendCell::new(),
            blocked: AtomicBool::new(false),
            in_critical: AtomicBool::new(false),
            context: ContextSlot::new(),
            parker: Parker::new(),
        }
    }

    /// Native id of the thread.
    #[must_use]
    pub const fn id(&self) -> NativeThreadId {
        self.id
    }

    /// Cold end of the thread's stack.
    #[must_use]
    pub const fn stack_end(&self) -> usize {
        self.stack_end
    }

    pub(crate) const fn collector(&self) -> u64 {
        self.collector
    }

    /// Current flags.
    #[must_use]
    pub fn flags(&self) -> ThreadFlags {
        self.flags.get()
    }

    /// Current suspend state.
    #[must_use]
    pub fn suspend_state(&self) -> SuspendState {
        self.suspend.load()
    }

    /// Returns `true` while the thread is in a blocking region.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Returns `true` unless the thread has finished.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.flags.contains(ThreadFlags::FINISHED)
    }

    /// Store a fresh context snapshot. Async-signal-safe.
    pub(crate) fn save_context(&self, context: &SavedContext) {
        self.context.store(context);
    }

    /// Roots described by the last snapshot.
    pub(crate) fn roots(&self) -> ThreadRoots {
        let context = self.context.load();
        ThreadRoots {
            id: self.id,
            stack_start: context.sp,
            stack_end: self.stack_end.max(context.sp),
            context,
        }
    }
}

impl fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("suspend", &self.suspend)
            .field("blocked", &self.is_blocked())
            .finish_non_exhaustive()
    }
}

/// Table of registered threads.
pub struct ThreadRegistry {
    buckets: Box<[Vec<Arc<ThreadRecord>>]>,
    bootstrap: Option<Arc<ThreadRecord>>,
    collector: u64,
    len: usize,
}

impl ThreadRegistry {
    /// An empty registry with its bootstrap record preallocated.
    #[must_use]
    pub fn new() -> Self {
        Self::for_collector(0)
    }

    pub(crate) fn for_collector(collector: u64) -> Self {
        let buckets = std::iter::repeat_with(Vec::new)
            .take(THREAD_TABLE_SIZE)
            .collect();
        Self {
            buckets,
            bootstrap: Some(Arc::new(ThreadRecord::new(
                NativeThreadId::from_raw(0),
                0,
                collector,
            ))),
            collector,
            len: 0,
        }
    }

    /// Insert a record for `id` whose stack ends at `stack_end`.
    ///
    /// The first registration uses the preallocated bootstrap record and is
    /// flagged [`ThreadFlags::MAIN_THREAD`].
    ///
    /// # Errors
    ///
    /// [`StwError::AlreadyRegistered`] if a live record for `id` exists,
    /// [`StwError::OutOfMemory`] if the bucket cannot grow.
    pub fn register(
        &mut self,
        id: NativeThreadId,
        stack_end: usize,
    ) -> Result<Arc<ThreadRecord>, StwError> {
        if self.lookup_live(id).is_some() {
            return Err(StwError::AlreadyRegistered(id));
        }
        self.buckets[bucket_index(id)]
            .try_reserve(1)
            .map_err(|_| StwError::OutOfMemory)?;

        let record = self.bootstrap.take().map_or_else(
            || Arc::new(ThreadRecord::new(id, stack_end, self.collector)),
            |boot| claim_bootstrap(boot, id, stack_end),
        );

        let bucket = &mut self.buckets[bucket_index(id)];
        bucket.push(Arc::clone(&record));
        self.len += 1;
        Ok(record)
    }

    /// Newest record for `id`, finished or not.
    #[must_use]
    pub fn lookup(&self, id: NativeThreadId) -> Option<&Arc<ThreadRecord>> {
        self.buckets[bucket_index(id)]
            .iter()
            .rev()
            .find(|record| record.id == id)
    }

    /// Newest live record for `id`.
    #[must_use]
    pub fn lookup_live(&self, id: NativeThreadId) -> Option<&Arc<ThreadRecord>> {
        self.buckets[bucket_index(id)]
            .iter()
            .rev()
            .find(|record| record.id == id && record.is_live())
    }

    /// Newest finished record for `id`.
    #[must_use]
    pub fn lookup_finished(&self, id: NativeThreadId) -> Option<&Arc<ThreadRecord>> {
        self.buckets[bucket_index(id)]
            .iter()
            .rev()
            .find(|record| record.id == id && !record.is_live())
    }

    /// Remove and return the newest record for `id`.
    pub fn remove(&mut self, id: NativeThreadId) -> Option<Arc<ThreadRecord>> {
        let bucket = &mut self.buckets[bucket_index(id)];
        let pos = bucket.iter().rposition(|record| record.id == id)?;
        self.len -= 1;
        Some(bucket.remove(pos))
    }

    /// Remove exactly `record`, returning whether it was present.
    pub fn remove_record(&mut self, record: &Arc<ThreadRecord>) -> bool {
        let bucket = &mut self.buckets[bucket_index(record.id)];
        match bucket.iter().position(|other| Arc::ptr_eq(other, record)) {
            Some(pos) => {
                bucket.remove(pos);
                self.len -= 1;
                true
            }
            None => false,
        }
    }

    /// Call `f` on every live record.
    pub fn for_each_live<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<ThreadRecord>),
    {
        for record in self.iter_live() {
            f(record);
        }
    }

    /// Iterate over every live record.
    pub fn iter_live(&self) -> impl Iterator<Item = &Arc<ThreadRecord>> {
        self.buckets
            .iter()
            .flatten()
            .filter(|record| record.is_live())
    }

    /// Number of records, finished ones included.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no record exists.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of live records.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.iter_live().count()
    }

    /// Drop every record except the newest one for `id`, which is returned.
    ///
    /// Used in a fork child, where only the forking thread survives.
    pub fn retain_only(&mut self, id: NativeThreadId) -> Option<Arc<ThreadRecord>> {
        let survivor = self.lookup(id).cloned();
        for bucket in self.buckets.iter_mut() {
            bucket.clear();
        }
        self.len = 0;
        let survivor = survivor?;
        survivor.flags.clear(ThreadFlags::FINISHED);
        self.buckets[bucket_index(id)].push(Arc::clone(&survivor));
        self.len = 1;
        Some(survivor)
    }
}

fn claim_bootstrap(
    mut boot: Arc<ThreadRecord>,
    id: NativeThreadId,
    stack_end: usize,
) -> Arc<ThreadRecord> {
    match Arc::get_mut(&mut boot) {
        Some(slot) => {
            slot.id = id;
            slot.stack_end = stack_end;
            slot.flags = FlagCell::new(ThreadFlags::MAIN_THREAD);
        }
        None => return Arc::new(ThreadRecord::new(id, stack_end, boot.collector)),
    }
    boot
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("len", &self.len)
            .field("live", &self.live_count())
            .finish_non_exhaustive()
    }
}

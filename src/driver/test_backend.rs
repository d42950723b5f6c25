//! A scriptable in-memory backend for tests.
//!
//! Objects are plain heap allocations, so mappings are real pointers and
//! contents survive a park/recycle round trip. Every knob a test needs is a
//! method on [`MockBackend`]; clones share state, so tests keep one while
//! the device owns another.

use {
    super::{
        backend::{Allocation, Backend, IdleCallback, RawFd},
        BackendCaps, BoFlags, DriverError, Handle, Madvise, QueueProgress,
    },
    std::{
        collections::{HashMap, HashSet},
        ptr::NonNull,
        sync::{Arc, Mutex, MutexGuard},
    },
};

#[derive(Clone)]
pub(crate) struct MockBackend {
    shared: Arc<Shared>,
}

struct Shared {
    alignment: u64,
    caps: BackendCaps,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    alloc_calls: u32,
    block_wait_clears: bool,
    busy: HashSet<Handle>,
    double_frees: u32,
    fail_allocations: u32,
    fail_exports: bool,
    fds: HashMap<RawFd, FdTarget>,
    frees: HashMap<Handle, u32>,
    lose_on_willneed: HashSet<Handle>,
    map_on_import: bool,
    mem_cleans: u32,
    mem_invalidates: u32,
    next_fd: RawFd,
    next_handle: Handle,
    objects: HashMap<Handle, Object>,
    opens: HashMap<Handle, u32>,
    queues: HashMap<u32, Queue>,
    unmap_calls: u32,
    wait_calls: u32,
}

#[derive(Clone, Copy)]
struct FdTarget {
    handle: Handle,
    size: u64,
}

struct Object {
    data: NonNull<u8>,
    size: u64,
}

// The raw data pointer is only dereferenced by the owning test thread.
unsafe impl Send for Object {}

impl Object {
    fn new(size: u64) -> Self {
        let data = Box::into_raw(vec![0u8; size as usize].into_boxed_slice()) as *mut u8;

        Self {
            data: NonNull::new(data).expect("Box::into_raw returned null"),
            size,
        }
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.data.as_ptr(),
                self.size as usize,
            )));
        }
    }
}

#[derive(Default)]
struct Queue {
    callbacks: Vec<(u64, IdleCallback)>,
    completed: u64,
    submitted: u64,
}

impl MockBackend {
    pub fn new(caps: BackendCaps) -> Self {
        Self::with_alignment(caps, 4096)
    }

    pub fn with_alignment(caps: BackendCaps, alignment: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                alignment,
                caps,
                state: Mutex::new(State {
                    block_wait_clears: true,
                    next_fd: 100,
                    ..Default::default()
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap()
    }

    /// Refuses the next `count` allocations.
    pub fn set_fail_allocations(&self, count: u32) {
        self.state().fail_allocations = count;
    }

    pub fn alloc_calls(&self) -> u32 {
        self.state().alloc_calls
    }

    pub fn free_count(&self, handle: Handle) -> u32 {
        self.state().frees.get(&handle).copied().unwrap_or_default()
    }

    pub fn open_count(&self, handle: Handle) -> u32 {
        self.state().opens.get(&handle).copied().unwrap_or_default()
    }

    /// Makes every export attempt fail.
    pub fn set_fail_exports(&self, fail: bool) {
        self.state().fail_exports = fail;
    }

    pub fn double_frees(&self) -> u32 {
        self.state().double_frees
    }

    pub fn mark_busy(&self, handle: Handle) {
        self.state().busy.insert(handle);
    }

    pub fn mark_idle(&self, handle: Handle) {
        self.state().busy.remove(&handle);
    }

    /// Makes unbounded waits report a timeout instead of draining the
    /// fence.
    pub fn set_block_wait_clears(&self, clears: bool) {
        self.state().block_wait_clears = clears;
    }

    /// The next willneed advice for `handle` reports its pages reclaimed.
    pub fn lose_pages_on_willneed(&self, handle: Handle) {
        self.state().lose_on_willneed.insert(handle);
    }

    /// Makes every `import_fd` translation return an eager CPU mapping.
    pub fn set_map_on_import(&self, map: bool) {
        self.state().map_on_import = map;
    }

    pub fn unmap_calls(&self) -> u32 {
        self.state().unmap_calls
    }

    /// Creates a foreign kernel object reachable only through the returned
    /// descriptor, as another process's export would be.
    pub fn register_foreign(&self, size: u64) -> RawFd {
        let mut state = self.state();

        let handle = state.fresh_handle();
        state.objects.insert(handle, Object::new(size));
        *state.opens.entry(handle).or_default() += 1;

        state.fresh_fd(FdTarget { handle, size })
    }

    /// Advances a queue's completion counter and fires any idle callbacks
    /// that were waiting on it.
    pub fn complete(&self, queue: u32, seqnum: u64) {
        let fired = {
            let mut state = self.state();
            let queue = state.queues.entry(queue).or_default();

            queue.submitted = queue.submitted.max(seqnum);
            queue.completed = queue.completed.max(seqnum);

            let completed = queue.completed;
            let mut fired = Vec::new();
            let mut idx = 0;

            while idx < queue.callbacks.len() {
                if queue.callbacks[idx].0 <= completed {
                    fired.push(queue.callbacks.swap_remove(idx).1);
                } else {
                    idx += 1;
                }
            }

            fired
        };

        // Callbacks re-enter the backend; never hold the state lock here.
        for callback in fired {
            callback();
        }
    }

    pub fn wait_calls(&self) -> u32 {
        self.state().wait_calls
    }

    /// CPU cache maintenance calls seen so far, as `(invalidates, cleans)`.
    pub fn mem_syncs(&self) -> (u32, u32) {
        let state = self.state();

        (state.mem_invalidates, state.mem_cleans)
    }

    /// Allocates outside the failure-injection path; for tests that build
    /// records by hand.
    pub fn allocate_raw(&self, size: u64, _flags: BoFlags) -> Allocation {
        let mut state = self.state();
        let handle = state.fresh_handle();

        state.objects.insert(handle, Object::new(size));
        *state.opens.entry(handle).or_default() += 1;

        Allocation {
            handle,
            gpu_addr: gpu_addr(handle),
            cpu_addr: None,
        }
    }
}

impl State {
    fn fresh_handle(&mut self) -> Handle {
        self.next_handle += 1;

        self.next_handle
    }

    fn fresh_fd(&mut self, target: FdTarget) -> RawFd {
        self.next_fd += 1;
        self.fds.insert(self.next_fd, target);

        self.next_fd
    }
}

fn gpu_addr(handle: Handle) -> u64 {
    (handle as u64) << 20
}

impl Backend for MockBackend {
    fn caps(&self) -> BackendCaps {
        self.shared.caps
    }

    fn alignment(&self) -> u64 {
        self.shared.alignment
    }

    fn allocate(&self, size: u64, flags: BoFlags) -> Result<Allocation, DriverError> {
        assert_eq!(size % self.shared.alignment, 0, "unrounded size {size}");

        let mut state = self.state();

        state.alloc_calls += 1;

        if state.fail_allocations > 0 {
            state.fail_allocations -= 1;

            return Err(DriverError::OutOfMemory);
        }

        let handle = state.fresh_handle();

        state.objects.insert(handle, Object::new(size));
        *state.opens.entry(handle).or_default() += 1;

        let _ = flags;

        Ok(Allocation {
            handle,
            gpu_addr: gpu_addr(handle),
            cpu_addr: None,
        })
    }

    fn free(&self, handle: Handle) {
        let mut state = self.state();

        if state.objects.remove(&handle).is_none() {
            state.double_frees += 1;
        }

        *state.frees.entry(handle).or_default() += 1;
    }

    fn wait(
        &self,
        handle: Handle,
        timeout_ns: i64,
        _include_readers: bool,
    ) -> Result<bool, DriverError> {
        let mut state = self.state();

        state.wait_calls += 1;

        if !state.busy.contains(&handle) {
            return Ok(true);
        }

        if timeout_ns == 0 {
            return Ok(false);
        }

        if state.block_wait_clears {
            state.busy.remove(&handle);

            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn madvise(&self, handle: Handle, advice: Madvise) -> bool {
        match advice {
            Madvise::DontNeed => true,
            Madvise::WillNeed => !self.state().lose_on_willneed.remove(&handle),
        }
    }

    fn import_fd(&self, fd: RawFd) -> Result<Allocation, DriverError> {
        let mut state = self.state();
        let target = *state.fds.get(&fd).ok_or(DriverError::InvalidData)?;

        // A freed handle is reopened by the kernel on re-import.
        if !state.objects.contains_key(&target.handle) {
            state.objects.insert(target.handle, Object::new(target.size));
            *state.opens.entry(target.handle).or_default() += 1;
        }

        let cpu_addr = state
            .map_on_import
            .then(|| state.objects[&target.handle].data);

        Ok(Allocation {
            handle: target.handle,
            gpu_addr: gpu_addr(target.handle),
            cpu_addr,
        })
    }

    fn export_fd(&self, handle: Handle) -> Result<RawFd, DriverError> {
        let mut state = self.state();

        if state.fail_exports {
            return Err(DriverError::Unsupported);
        }

        let size = state
            .objects
            .get(&handle)
            .map(|object| object.size)
            .ok_or(DriverError::InvalidData)?;

        Ok(state.fresh_fd(FdTarget { handle, size }))
    }

    fn dup_fd(&self, fd: RawFd) -> Result<RawFd, DriverError> {
        let mut state = self.state();
        let target = *state.fds.get(&fd).ok_or(DriverError::InvalidData)?;

        Ok(state.fresh_fd(target))
    }

    fn close_fd(&self, fd: RawFd) {
        self.state().fds.remove(&fd);
    }

    fn fd_size(&self, fd: RawFd) -> Option<u64> {
        self.state().fds.get(&fd).map(|target| target.size)
    }

    fn map(&self, handle: Handle, size: u64) -> Result<NonNull<u8>, DriverError> {
        let state = self.state();
        let object = state.objects.get(&handle).ok_or(DriverError::InvalidData)?;

        debug_assert!(size <= object.size);

        Ok(object.data)
    }

    fn unmap(&self, _addr: NonNull<u8>, _size: u64) {
        self.state().unmap_calls += 1;
    }

    fn mem_invalidate(&self, _addr: NonNull<u8>, _len: u64) {
        self.state().mem_invalidates += 1;
    }

    fn mem_clean(&self, _addr: NonNull<u8>, _len: u64) {
        self.state().mem_cleans += 1;
    }

    fn queue_progress(&self, queue: u32) -> QueueProgress {
        self.state()
            .queues
            .get(&queue)
            .map(|queue| QueueProgress {
                last_submitted: queue.submitted,
                last_completed: queue.completed,
            })
            .unwrap_or_default()
    }

    fn wait_event(&self, queue: u32, seqnum: u64, timeout_ns: i64) -> Result<bool, DriverError> {
        let mut state = self.state();
        let queue = state.queues.entry(queue).or_default();

        if queue.completed >= seqnum {
            return Ok(true);
        }

        if timeout_ns == 0 {
            return Ok(false);
        }

        // Pretend the GPU caught up. Idle callbacks are only fired through
        // an explicit `complete`, because this path may run under core
        // locks.
        queue.submitted = queue.submitted.max(seqnum);
        queue.completed = queue.completed.max(seqnum);

        Ok(true)
    }

    fn on_queue_idle(&self, queue: u32, seqnum: u64, callback: IdleCallback) -> bool {
        let mut state = self.state();
        let queue = state.queues.entry(queue).or_default();

        if queue.completed >= seqnum {
            return false;
        }

        queue.callbacks.push((seqnum, callback));

        true
    }
}

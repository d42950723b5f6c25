//! Device backend capability.

use {
    super::{BoFlags, DriverError},
    bitflags::bitflags,
    std::{os::raw::c_int, ptr::NonNull},
};

/// Kernel-side identifier of a buffer object, unique within a backend.
pub type Handle = u32;

/// A dma-buf style file descriptor as handed around by import and export.
pub type RawFd = c_int;

/// Callback registered through [`Backend::on_queue_idle`].
pub type IdleCallback = Box<dyn FnOnce() + Send + 'static>;

bitflags! {
    /// Optional behaviors a [`Backend`] implementation may provide.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct BackendCaps: u32 {
        /// `madvise` is implemented; cached objects may have their backing
        /// pages reclaimed by the kernel while parked.
        const MADVISE = 1 << 0;

        /// `on_queue_idle` is implemented; zero-reference objects with work
        /// in flight are reclaimed from a completion thread.
        const ASYNC_RECLAIM = 1 << 1;

        /// Per-queue submission counters are readable without a syscall;
        /// idleness is decided from tracked usage instead of a fence wait.
        const EVENT_SLOTS = 1 << 2;
    }
}

/// Advisory hint for [`Backend::madvise`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Madvise {
    /// The object is about to be used again; its backing pages are needed.
    WillNeed,

    /// The object is parked; the kernel may reclaim its backing pages.
    DontNeed,
}

/// A kernel allocation as returned by [`Backend::allocate`] or
/// [`Backend::import_fd`].
#[derive(Clone, Copy, Debug)]
pub struct Allocation {
    /// Kernel-side identifier; unique while the object is open.
    pub handle: Handle,

    /// GPU virtual address of the object.
    pub gpu_addr: u64,

    /// CPU mapping, for backends which map eagerly during allocation.
    pub cpu_addr: Option<NonNull<u8>>,
}

/// Event-slot progress of one execution queue.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QueueProgress {
    /// Sequence number of the newest submitted job.
    pub last_submitted: u64,

    /// Sequence number of the newest completed job.
    pub last_completed: u64,
}

/// Kernel interface consumed by the buffer object core.
///
/// Implementations wrap one device generation's ioctl surface. The core
/// guarantees that `free`, `wait`, `madvise`, `export_fd` and `map` are only
/// called with handles previously returned by `allocate` or `import_fd` and
/// not yet freed.
pub trait Backend: Send + Sync {
    /// The optional behaviors this backend provides.
    fn caps(&self) -> BackendCaps;

    /// Allocation granularity in bytes; a power of two. All object sizes are
    /// rounded up to this before any other operation sees them.
    fn alignment(&self) -> u64;

    /// Creates a kernel object of exactly `size` bytes.
    fn allocate(&self, size: u64, flags: BoFlags) -> Result<Allocation, DriverError>;

    /// Releases a kernel object.
    fn free(&self, handle: Handle);

    /// Blocks until the GPU is done with the object or `timeout_ns` elapses.
    ///
    /// `timeout_ns == 0` polls. Returns `Ok(true)` when idle and `Ok(false)`
    /// on timeout; any error is a contract violation.
    fn wait(&self, handle: Handle, timeout_ns: i64, include_readers: bool)
        -> Result<bool, DriverError>;

    /// Advises the kernel about upcoming use of the object's backing pages.
    ///
    /// Returns whether the pages are still resident. `false` after
    /// [`Madvise::WillNeed`] means the kernel reclaimed the backing store and
    /// the record must be discarded.
    fn madvise(&self, handle: Handle, advice: Madvise) -> bool;

    /// Translates a dma-buf file descriptor into a kernel object.
    ///
    /// Importing the same underlying object twice yields the same handle.
    fn import_fd(&self, fd: RawFd) -> Result<Allocation, DriverError>;

    /// Exports a kernel object as a dma-buf file descriptor.
    fn export_fd(&self, handle: Handle) -> Result<RawFd, DriverError>;

    /// Duplicates a dma-buf file descriptor.
    fn dup_fd(&self, fd: RawFd) -> Result<RawFd, DriverError>;

    /// Closes a dma-buf file descriptor owned by the core.
    fn close_fd(&self, fd: RawFd);

    /// Byte size of the object behind a dma-buf file descriptor, if the
    /// backend can determine it.
    fn fd_size(&self, fd: RawFd) -> Option<u64>;

    /// Maps the object into the process.
    fn map(&self, handle: Handle, size: u64) -> Result<NonNull<u8>, DriverError>;

    /// Releases a mapping previously returned by [`Backend::map`] or
    /// [`Backend::allocate`].
    fn unmap(&self, addr: NonNull<u8>, size: u64);

    /// Invalidates CPU cache lines covering `[addr, addr + len)` before a
    /// CPU read of GPU-written data.
    fn mem_invalidate(&self, addr: NonNull<u8>, len: u64) {
        let _ = (addr, len);
    }

    /// Cleans CPU cache lines covering `[addr, addr + len)` after a CPU
    /// write, making the data visible to the GPU.
    fn mem_clean(&self, addr: NonNull<u8>, len: u64) {
        let _ = (addr, len);
    }

    /// Submission counters of one queue.
    ///
    /// Only meaningful with [`BackendCaps::EVENT_SLOTS`].
    fn queue_progress(&self, queue: u32) -> QueueProgress {
        let _ = queue;

        QueueProgress::default()
    }

    /// Blocks until `queue` completes `seqnum` or `timeout_ns` elapses.
    ///
    /// Only meaningful with [`BackendCaps::EVENT_SLOTS`].
    fn wait_event(&self, queue: u32, seqnum: u64, timeout_ns: i64) -> Result<bool, DriverError> {
        let _ = (queue, seqnum, timeout_ns);

        Err(DriverError::Unsupported)
    }

    /// Registers `callback` to run once `queue` has completed `seqnum`.
    ///
    /// Returns `false`, dropping the callback unrun, when the queue is
    /// already past `seqnum`. Only meaningful with
    /// [`BackendCaps::ASYNC_RECLAIM`]; the callback may fire on any thread.
    fn on_queue_idle(&self, queue: u32, seqnum: u64, callback: IdleCallback) -> bool {
        let _ = (queue, seqnum, callback);

        false
    }
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn caps(&self) -> BackendCaps {
        (**self).caps()
    }

    fn alignment(&self) -> u64 {
        (**self).alignment()
    }

    fn allocate(&self, size: u64, flags: BoFlags) -> Result<Allocation, DriverError> {
        (**self).allocate(size, flags)
    }

    fn free(&self, handle: Handle) {
        (**self).free(handle)
    }

    fn wait(
        &self,
        handle: Handle,
        timeout_ns: i64,
        include_readers: bool,
    ) -> Result<bool, DriverError> {
        (**self).wait(handle, timeout_ns, include_readers)
    }

    fn madvise(&self, handle: Handle, advice: Madvise) -> bool {
        (**self).madvise(handle, advice)
    }

    fn import_fd(&self, fd: RawFd) -> Result<Allocation, DriverError> {
        (**self).import_fd(fd)
    }

    fn export_fd(&self, handle: Handle) -> Result<RawFd, DriverError> {
        (**self).export_fd(handle)
    }

    fn dup_fd(&self, fd: RawFd) -> Result<RawFd, DriverError> {
        (**self).dup_fd(fd)
    }

    fn close_fd(&self, fd: RawFd) {
        (**self).close_fd(fd)
    }

    fn fd_size(&self, fd: RawFd) -> Option<u64> {
        (**self).fd_size(fd)
    }

    fn map(&self, handle: Handle, size: u64) -> Result<NonNull<u8>, DriverError> {
        (**self).map(handle, size)
    }

    fn unmap(&self, addr: NonNull<u8>, size: u64) {
        (**self).unmap(addr, size)
    }

    fn mem_invalidate(&self, addr: NonNull<u8>, len: u64) {
        (**self).mem_invalidate(addr, len)
    }

    fn mem_clean(&self, addr: NonNull<u8>, len: u64) {
        (**self).mem_clean(addr, len)
    }

    fn queue_progress(&self, queue: u32) -> QueueProgress {
        (**self).queue_progress(queue)
    }

    fn wait_event(&self, queue: u32, seqnum: u64, timeout_ns: i64) -> Result<bool, DriverError> {
        (**self).wait_event(queue, seqnum, timeout_ns)
    }

    fn on_queue_idle(&self, queue: u32, seqnum: u64, callback: IdleCallback) -> bool {
        (**self).on_queue_idle(queue, seqnum, callback)
    }
}

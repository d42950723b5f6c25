//! Buffer object resource types.

use {
    super::{
        align_up,
        backend::{Handle, RawFd},
        device::Device,
        sync::{self, BoUsage},
        BoFlags, DriverError, GpuAccess,
    },
    derive_builder::{Builder, UninitializedFieldError},
    log::warn,
    std::{
        fmt::{Debug, Formatter},
        ops::Deref,
        ptr::NonNull,
        sync::{
            atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering},
            Arc, Weak,
        },
        thread::panicking,
    },
};

#[cfg(feature = "parking_lot")]
use parking_lot::Mutex;

#[cfg(not(feature = "parking_lot"))]
use std::sync::Mutex;

/// Sentinel stored while no exported dma-buf descriptor is cached.
const NO_FD: RawFd = -1;

/// A kernel buffer object record.
///
/// At most one record exists per kernel handle in a process; all importers
/// and the free-list cache share it. Records are handed to callers as
/// [`BoRef`], whose clone and drop drive the reference count.
pub struct Bo {
    cpu_addr: AtomicUsize,
    device: Weak<Device>,
    dmabuf_fd: AtomicI32,
    flags: AtomicU32,
    gpu_access: AtomicU8,
    gpu_addr: u64,
    handle: Handle,
    label: Mutex<String>,
    last_used_secs: AtomicU64,
    refcnt: AtomicU32,
    size: u64,

    pub(super) gpu_refcnt: AtomicU32,
    pub(super) usage: Mutex<Vec<BoUsage>>,
}

impl Bo {
    /// Creates a buffer object on the given device, recycling a compatible
    /// cached object when one is available.
    ///
    /// The requested size is rounded up to the backend's allocation
    /// granularity before anything else happens; `info.size` must be
    /// non-zero.
    #[profiling::function]
    pub fn create(device: &Arc<Device>, info: impl Into<BoInfo>) -> Result<BoRef, DriverError> {
        Device::create_bo(device, info.into())
    }

    /// Imports the kernel object behind a dma-buf file descriptor.
    ///
    /// Importing the same underlying object twice yields handles to the same
    /// record. Imported objects are marked [`BoFlags::SHARED`] and never
    /// enter the free-list cache.
    #[profiling::function]
    pub fn import(device: &Arc<Device>, fd: RawFd) -> Result<BoRef, DriverError> {
        Device::import_bo(device, fd)
    }

    pub(crate) fn new(
        device: Weak<Device>,
        handle: Handle,
        gpu_addr: u64,
        size: u64,
        flags: BoFlags,
        label: String,
    ) -> Self {
        Self {
            cpu_addr: AtomicUsize::new(0),
            device,
            dmabuf_fd: AtomicI32::new(NO_FD),
            flags: AtomicU32::new(flags.bits()),
            gpu_access: AtomicU8::new(0),
            gpu_addr,
            gpu_refcnt: AtomicU32::new(0),
            handle,
            label: Mutex::new(label),
            last_used_secs: AtomicU64::new(0),
            refcnt: AtomicU32::new(1),
            size,
            usage: Mutex::new(Vec::new()),
        }
    }

    /// The kernel-side identifier of this object.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Allocation-rounded byte size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// GPU virtual address of the object.
    pub fn gpu_addr(&self) -> u64 {
        self.gpu_addr
    }

    /// Current creation/sharing flags.
    pub fn flags(&self) -> BoFlags {
        BoFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub(super) fn add_flags(&self, flags: BoFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    /// A name for debugging purposes.
    pub fn label(&self) -> String {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let label = self.label.lock();

        #[cfg(not(feature = "parking_lot"))]
        let label = label.unwrap();

        label.clone()
    }

    /// Replaces the debugging label.
    pub fn set_label(&self, label: impl Into<String>) {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut guard = self.label.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut guard = guard.unwrap();

        *guard = label.into();
    }

    /// Snapshot of the reference count.
    ///
    /// Only meaningful for debugging; the value may change concurrently.
    pub fn ref_count(&self) -> u32 {
        self.refcnt.load(Ordering::Relaxed)
    }

    /// The CPU mapping, if one exists right now.
    pub fn mapping(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.cpu_addr.load(Ordering::Acquire) as *mut u8)
    }

    /// Maps the object into the process, creating the mapping on first use
    /// for [`BoFlags::DELAY_MMAP`] objects.
    ///
    /// # Panics
    ///
    /// Panics when called on a [`BoFlags::GROWABLE`] object; heap objects
    /// are never mapped.
    #[profiling::function]
    pub fn map(&self) -> Result<NonNull<u8>, DriverError> {
        if let Some(addr) = self.mapping() {
            return Ok(addr);
        }

        let flags = self.flags();

        assert!(
            !flags.contains(BoFlags::GROWABLE),
            "heap objects are never mapped"
        );

        if flags.contains(BoFlags::INVISIBLE) {
            return Err(DriverError::Unsupported);
        }

        let device = self.device_ref().ok_or(DriverError::InvalidData)?;
        let addr = device.backend().map(self.handle, self.size)?;

        match self.cpu_addr.compare_exchange(
            0,
            addr.as_ptr() as usize,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(addr),
            Err(existing) => {
                // Lost a mapping race; keep the winner.
                device.backend().unmap(addr, self.size);

                Ok(NonNull::new(existing as *mut u8).expect("mapping race left no mapping"))
            }
        }
    }

    /// Exports the object as a dma-buf file descriptor, marking it
    /// [`BoFlags::SHARED`] for the rest of its lifetime.
    ///
    /// The returned descriptor is owned by the caller; a duplicate of the
    /// first export is handed out on repeated calls.
    #[profiling::function]
    pub fn export(&self) -> Result<RawFd, DriverError> {
        let device = self.device_ref().ok_or(DriverError::InvalidData)?;

        device.export_bo(self)
    }

    /// Blocks until the GPU is done with the object or `timeout_ns` elapses.
    ///
    /// Returns whether the object is idle; `timeout_ns == 0` polls. Waits
    /// excluding readers are cheaper and frequently sufficient before a CPU
    /// read.
    #[profiling::function]
    pub fn wait(&self, timeout_ns: i64, include_readers: bool) -> bool {
        let Some(device) = self.device_ref() else {
            return true;
        };

        sync::wait_idle(device.backend(), self, timeout_ns, include_readers)
    }

    /// Records a GPU submission against this object.
    ///
    /// Called by the job-submission layer; one usage is kept per queue, the
    /// newest sequence number winning.
    pub fn access(&self, queue: u32, seqnum: u64, write: bool) {
        // The access bits are updated under the usage lock so that a
        // concurrent wait pruning the list cannot clear a bit this
        // submission just set.
        self.with_usages(|usages| {
            if let Some(usage) = usages.iter_mut().find(|usage| usage.queue == queue) {
                usage.seqnum = usage.seqnum.max(seqnum);
                usage.write |= write;
            } else {
                usages.push(BoUsage {
                    queue,
                    seqnum,
                    write,
                });
            }

            let bits = if write { GpuAccess::WRITE } else { GpuAccess::READ };
            self.gpu_access.fetch_or(bits.bits(), Ordering::Release);
        });
    }

    /// Invalidates CPU cache lines covering `offset..offset + len` before
    /// reading GPU-written data. A no-op for non-cacheable objects.
    pub fn invalidate(&self, offset: u64, len: u64) {
        self.cache_maintain(offset, len, true);
    }

    /// Cleans CPU cache lines covering `offset..offset + len` after a CPU
    /// write. A no-op for non-cacheable objects.
    pub fn clean(&self, offset: u64, len: u64) {
        self.cache_maintain(offset, len, false);
    }

    fn cache_maintain(&self, offset: u64, len: u64, invalidate: bool) {
        debug_assert!(offset.checked_add(len).is_some_and(|end| end <= self.size));

        if !self.flags().contains(BoFlags::CACHEABLE) {
            return;
        }

        let (Some(device), Some(addr)) = (self.device_ref(), self.mapping()) else {
            return;
        };

        let addr = unsafe { NonNull::new_unchecked(addr.as_ptr().add(offset as usize)) };

        if invalidate {
            device.backend().mem_invalidate(addr, len);
        } else {
            device.backend().mem_clean(addr, len);
        }
    }

    pub(super) fn device_ref(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    pub(super) fn gpu_access(&self) -> GpuAccess {
        GpuAccess::from_bits_truncate(self.gpu_access.load(Ordering::Acquire))
    }

    pub(super) fn set_gpu_access(&self, access: GpuAccess) {
        self.gpu_access.store(access.bits(), Ordering::Release);
    }

    pub(super) fn clear_gpu_access(&self, access: GpuAccess) {
        self.gpu_access.fetch_and(!access.bits(), Ordering::Release);
    }

    pub(super) fn refcnt_inc(&self) -> u32 {
        self.refcnt.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn refcnt_dec(&self) -> u32 {
        self.refcnt.fetch_sub(1, Ordering::Release)
    }

    pub(crate) fn refcnt_store(&self, value: u32) {
        self.refcnt.store(value, Ordering::Release);
    }

    /// Marks a cached record as handed out again. The caller must hold the
    /// lock of whichever structure owned the zero-reference record.
    pub(crate) fn revive(&self) {
        let prev = self.refcnt.swap(1, Ordering::Relaxed);

        debug_assert_eq!(prev, 0, "revived a record that was still referenced");
    }

    pub(super) fn set_mapping(&self, addr: NonNull<u8>) {
        self.cpu_addr
            .store(addr.as_ptr() as usize, Ordering::Release);
    }

    /// Installs a mapping unless one already exists; returns whether `addr`
    /// was adopted. The caller unmaps a refused address.
    pub(super) fn try_set_mapping(&self, addr: NonNull<u8>) -> bool {
        self.cpu_addr
            .compare_exchange(
                0,
                addr.as_ptr() as usize,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(super) fn take_mapping(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.cpu_addr.swap(0, Ordering::AcqRel) as *mut u8)
    }

    pub(super) fn dmabuf_fd(&self) -> RawFd {
        self.dmabuf_fd.load(Ordering::Acquire)
    }

    /// Caches an exported descriptor; returns `Err(fd)` when another thread
    /// won the race and the caller's descriptor must be closed.
    pub(super) fn set_dmabuf_fd(&self, fd: RawFd) -> Result<(), RawFd> {
        self.dmabuf_fd
            .compare_exchange(NO_FD, fd, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| fd)
    }

    pub(super) fn take_dmabuf_fd(&self) -> Option<RawFd> {
        let fd = self.dmabuf_fd.swap(NO_FD, Ordering::AcqRel);

        (fd != NO_FD).then_some(fd)
    }

    pub(crate) fn touch(&self, now_secs: u64) {
        // fetch_max keeps the stamp monotonic per record.
        self.last_used_secs.fetch_max(now_secs, Ordering::Relaxed);
    }

    pub(crate) fn last_used_secs(&self) -> u64 {
        self.last_used_secs.load(Ordering::Relaxed)
    }

    pub(super) fn with_usages<R>(&self, f: impl FnOnce(&mut Vec<BoUsage>) -> R) -> R {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut usages = self.usage.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut usages = usages.unwrap();

        f(&mut usages)
    }

    /// Zeroes the CPU-visible contents, when a mapping exists.
    pub(super) fn zero(&self) {
        if let Some(addr) = self.mapping() {
            unsafe {
                addr.as_ptr().write_bytes(0, self.size as usize);
            }
        }
    }
}

impl Debug for Bo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = self.label();

        if label.is_empty() {
            write!(f, "Bo({})", self.handle)
        } else {
            write!(f, "{} (Bo({}))", label, self.handle)
        }
    }
}

/// An owning handle to a [`Bo`].
///
/// Cloning takes an additional reference; dropping the last handle parks the
/// object in the device's free-list cache (or frees it, for shared objects
/// and disabled caches).
pub struct BoRef {
    bo: Arc<Bo>,
}

impl BoRef {
    pub(crate) fn new(bo: Arc<Bo>) -> Self {
        debug_assert_ne!(bo.ref_count(), 0);

        Self { bo }
    }

    /// Dismantles the handle without running the unreference path; device
    /// teardown reclaims every record wholesale instead.
    pub(super) fn into_record(self) -> Arc<Bo> {
        let this = std::mem::ManuallyDrop::new(self);

        unsafe { std::ptr::read(&this.bo) }
    }
}

impl Clone for BoRef {
    fn clone(&self) -> Self {
        let prev = self.bo.refcnt_inc();

        assert_ne!(prev, 0, "referenced a buffer object mid-reclaim");

        Self {
            bo: Arc::clone(&self.bo),
        }
    }
}

impl Debug for BoRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.bo.fmt(f)
    }
}

impl Deref for BoRef {
    type Target = Bo;

    fn deref(&self) -> &Self::Target {
        &self.bo
    }
}

impl Drop for BoRef {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        if let Some(device) = self.bo.device_ref() {
            device.unreference(&self.bo);
        } else {
            warn!("buffer object outlived its device: {:?}", self.bo);
        }
    }
}

/// Information used to create a [`Bo`] instance.
#[derive(Builder, Clone, Debug, Eq, PartialEq)]
#[builder(
    build_fn(private, name = "fallible_build", error = "BoInfoBuilderError"),
    derive(Clone, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct BoInfo {
    /// Requested byte size; rounded up to the backend's allocation
    /// granularity at creation time. Must be non-zero.
    pub size: u64,

    /// Creation flags.
    #[builder(default = "BoFlags::empty()")]
    pub flags: BoFlags,

    /// A name for debugging purposes.
    #[builder(default, setter(into))]
    pub label: String,
}

impl BoInfo {
    /// Specifies a flagless object of the given `size`.
    pub fn new(size: u64) -> BoInfo {
        BoInfo {
            size,
            flags: BoFlags::empty(),
            label: String::new(),
        }
    }

    /// Specifies an object of the given `size` and `flags`.
    pub fn with_flags(size: u64, flags: BoFlags) -> BoInfo {
        BoInfo {
            size,
            flags,
            label: String::new(),
        }
    }

    /// Converts a `BoInfo` into a `BoInfoBuilder`.
    pub fn to_builder(self) -> BoInfoBuilder {
        BoInfoBuilder {
            size: Some(self.size),
            flags: Some(self.flags),
            label: Some(self.label),
        }
    }

    pub(super) fn rounded_size(&self, alignment: u64) -> u64 {
        align_up(self.size, alignment)
    }
}

impl From<u64> for BoInfo {
    fn from(size: u64) -> Self {
        Self::new(size)
    }
}

impl BoInfoBuilder {
    /// Builds a new `BoInfo`.
    ///
    /// # Panics
    ///
    /// If the `size` field has not been set this function will panic.
    pub fn build(self) -> BoInfo {
        match self.fallible_build() {
            Err(BoInfoBuilderError(err)) => panic!("{err}"),
            Ok(info) => info,
        }
    }
}

impl From<BoInfoBuilder> for BoInfo {
    fn from(info: BoInfoBuilder) -> Self {
        info.build()
    }
}

#[derive(Debug)]
struct BoInfoBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for BoInfoBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}

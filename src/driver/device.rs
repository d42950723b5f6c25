//! Logical device and buffer object lifecycle.

use {
    super::{
        align_up,
        backend::{Allocation, Backend, BackendCaps, Handle, IdleCallback, RawFd},
        bo::{Bo, BoInfo, BoRef},
        registry::Registry,
        BoFlags, DriverError,
    },
    crate::pool::{BoCache, CacheStats},
    derive_builder::{Builder, UninitializedFieldError},
    log::{debug, info, trace, warn},
    std::{
        collections::HashMap,
        fmt::{Debug, Formatter},
        io::Write,
        sync::{
            atomic::{fence, Ordering},
            Arc, Weak,
        },
        thread::{panicking, sleep},
        time::{Duration, Instant},
    },
};

#[cfg(feature = "parking_lot")]
use parking_lot::Mutex;

#[cfg(not(feature = "parking_lot"))]
use std::sync::Mutex;

/// Backoff attempts after the kernel refuses an allocation; attempt `i`
/// sleeps `20 * i * i` milliseconds first.
const ALLOC_ATTEMPTS: u64 = 4;

/// Opaque handle to a device object.
///
/// The device owns the kernel backend, the process-wide handle registry and
/// the buffer object free-list pool. It is shared as `Arc<Device>`; records
/// carry a non-owning back-reference, so dropping the last `Arc` (after the
/// last [`BoRef`]) tears everything down.
pub struct Device {
    backend: Box<dyn Backend>,
    bo_log: Mutex<Option<Box<dyn Write + Send>>>,
    cache: Mutex<BoCache>,
    epoch: Instant,
    info: DeviceInfo,
    registry: Registry,
    tiler_heap: Mutex<Option<BoRef>>,
    weak: Weak<Device>,
}

impl Device {
    /// Opens a device over the given backend.
    ///
    /// A non-zero [`DeviceInfo::tiler_heap_size`] allocates the device-scope
    /// heap object up front; it lives for the device's lifetime and is
    /// released first on close.
    #[profiling::function]
    pub fn open(
        backend: impl Backend + 'static,
        info: impl Into<DeviceInfo>,
    ) -> Result<Arc<Self>, DriverError> {
        let info = info.into();
        let device = Arc::new_cyclic(|weak| Self {
            backend: Box::new(backend),
            bo_log: Mutex::new(None),
            cache: Mutex::new(BoCache::new(info.cache_bos)),
            epoch: Instant::now(),
            info,
            registry: Registry::new(),
            tiler_heap: Mutex::new(None),
            weak: weak.clone(),
        });

        debug_assert_eq!(
            device.backend.alignment().count_ones(),
            1,
            "Alignment must be a power of two"
        );

        if device.info.tiler_heap_size > 0 {
            let heap = Bo::create(
                &device,
                BoInfo {
                    size: device.info.tiler_heap_size,
                    flags: BoFlags::GROWABLE | BoFlags::INVISIBLE,
                    label: "tiler heap".to_owned(),
                },
            )?;

            #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
            let mut tiler_heap = device.tiler_heap.lock();

            #[cfg(not(feature = "parking_lot"))]
            let mut tiler_heap = tiler_heap.unwrap();

            *tiler_heap = Some(heap);
        }

        info!(
            "opened device ({} byte granules)",
            device.backend.alignment()
        );

        Ok(device)
    }

    /// Releases device-scope objects and empties the pool.
    ///
    /// Handles still held by callers stay memory-safe afterwards, but their
    /// kernel objects are on borrowed time; drop them first.
    #[profiling::function]
    pub fn close(&self) {
        let heap = {
            #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
            let mut tiler_heap = self.tiler_heap.lock();

            #[cfg(not(feature = "parking_lot"))]
            let mut tiler_heap = tiler_heap.unwrap();

            tiler_heap.take()
        };

        // Takes the normal unreference path, so it may briefly park.
        drop(heap);

        self.evict_all();
    }

    /// Frees every pooled object.
    ///
    /// Also invoked internally as the last-resort reclaimer when the kernel
    /// refuses an allocation.
    #[profiling::function]
    pub fn evict_all(&self) {
        let evicted = self.with_cache(|cache| cache.evict_all());

        self.destroy_records(evicted, "evict");
    }

    /// Point-in-time pool counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.with_cache(|cache| cache.stats())
    }

    /// Installs a sink for the textual buffer object log; one line per
    /// lifecycle operation.
    pub fn set_bo_log(&self, writer: impl Write + Send + 'static) {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut bo_log = self.bo_log.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut bo_log = bo_log.unwrap();

        *bo_log = Some(Box::new(writer));
    }

    pub(super) fn backend(&self) -> &dyn Backend {
        &*self.backend
    }

    #[profiling::function]
    pub(super) fn create_bo(this: &Arc<Self>, info: BoInfo) -> Result<BoRef, DriverError> {
        trace!("create: {:?}", info);

        assert_ne!(info.size, 0, "buffer object size must be non-zero");

        let size = info.rounded_size(this.backend.alignment());
        let flags = info.flags;

        if let Some(bo) = this.cache_fetch(size, flags, true) {
            return this.recycle(bo, info.label);
        }

        this.with_cache(|cache| cache.record_miss());

        let alloc = match this.backend.allocate(size, flags) {
            Ok(alloc) => alloc,
            Err(err) => {
                debug!("allocation of {size} bytes failed ({err}); scavenging");

                // A busy pooled object becomes usable if we are willing to
                // wait out the GPU.
                if let Some(bo) = this.cache_fetch(size, flags, false) {
                    return this.recycle(bo, info.label);
                }

                this.allocate_with_backoff(size, flags)?
            }
        };

        let bo = Arc::new(Bo::new(
            Arc::downgrade(this),
            alloc.handle,
            alloc.gpu_addr,
            size,
            flags,
            info.label,
        ));

        if let Some(addr) = alloc.cpu_addr {
            bo.set_mapping(addr);
        } else if !flags.intersects(BoFlags::INVISIBLE | BoFlags::GROWABLE | BoFlags::DELAY_MMAP) {
            match this.backend.map(alloc.handle, size) {
                Ok(addr) => bo.set_mapping(addr),
                Err(err) => {
                    warn!("unable to map fresh {:?}: {err}", bo);

                    this.backend.free(alloc.handle);

                    return Err(err);
                }
            }
        }

        if this.info.zero_bos {
            bo.zero();
        }

        this.registry.insert(Arc::clone(&bo));
        this.log_bo("new", &bo);

        Ok(BoRef::new(bo))
    }

    fn allocate_with_backoff(&self, size: u64, flags: BoFlags) -> Result<Allocation, DriverError> {
        for attempt in 0..ALLOC_ATTEMPTS {
            sleep(Duration::from_millis(20 * attempt * attempt));
            self.evict_all();

            match self.backend.allocate(size, flags) {
                Ok(alloc) => return Ok(alloc),
                Err(err) => debug!("allocation attempt {attempt} failed: {err}"),
            }
        }

        warn!("unable to allocate {size} bytes");

        Err(DriverError::OutOfMemory)
    }

    /// Finishes handing a pooled record back out.
    fn recycle(&self, bo: Arc<Bo>, label: String) -> Result<BoRef, DriverError> {
        bo.set_label(label);

        let flags = bo.flags();

        if bo.mapping().is_none()
            && !flags.intersects(BoFlags::INVISIBLE | BoFlags::GROWABLE | BoFlags::DELAY_MMAP)
        {
            match self.backend.map(bo.handle(), bo.size()) {
                Ok(addr) => bo.set_mapping(addr),
                Err(err) => {
                    warn!("unable to map recycled {:?}: {err}", bo);

                    // Never hand out a half-initialized record.
                    self.destroy_records(vec![bo], "free");

                    return Err(err);
                }
            }
        }

        if self.info.zero_bos {
            bo.zero();
        }

        self.log_bo("reuse", &bo);

        Ok(BoRef::new(bo))
    }

    fn cache_fetch(&self, size: u64, flags: BoFlags, dontwait: bool) -> Option<Arc<Bo>> {
        let outcome = self.with_cache(|cache| cache.fetch(self.backend(), size, flags, dontwait));

        if !outcome.reclaimed.is_empty() {
            self.destroy_records(outcome.reclaimed, "free");
        }

        outcome.bo
    }

    /// Drops one reference; the last one reclaims the record.
    #[profiling::function]
    pub(super) fn unreference(&self, bo: &Arc<Bo>) {
        let prev = bo.refcnt_dec();

        debug_assert_ne!(prev, 0, "unbalanced unreference");

        if prev != 1 {
            return;
        }

        fence(Ordering::Acquire);

        // The mapping can go before any lock is taken: nothing else
        // references the record, and an import racing us can only revive a
        // shared object, which remaps lazily.
        if let Some(addr) = bo.take_mapping() {
            self.backend.unmap(addr, bo.size());
        }

        enum Reclaim {
            Revived,
            Deferred,
            Done(Vec<Arc<Bo>>),
        }

        let outcome = self.registry.with(|records| {
            // A concurrent import of the same handle may have revived it.
            if bo.ref_count() != 0 {
                return Reclaim::Revived;
            }

            if self.backend.caps().contains(BackendCaps::ASYNC_RECLAIM)
                && self.register_idle_callbacks(bo)
            {
                return Reclaim::Deferred;
            }

            Reclaim::Done(self.finalize_locked(records, bo))
        });

        match outcome {
            Reclaim::Revived => {}
            Reclaim::Deferred => {
                // Drop the base count taken while registering; every queue
                // may already have finished.
                if bo.gpu_refcnt.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.finalize_deferred(bo);
                }
            }
            Reclaim::Done(stale) => self.release_records(stale, "evict"),
        }
    }

    /// Registers one idle callback per pending queue usage. Returns whether
    /// reclaim was handed off; the callbacks share a `gpu_refcnt` so only
    /// the last firing finalizes.
    fn register_idle_callbacks(&self, bo: &Arc<Bo>) -> bool {
        let usages = bo.with_usages(|usages| usages.clone());

        if usages.is_empty() {
            return false;
        }

        bo.gpu_refcnt.store(1, Ordering::Release);

        let mut registered = false;

        for usage in usages {
            let device = self.weak.clone();
            let record = Arc::clone(bo);

            bo.gpu_refcnt.fetch_add(1, Ordering::AcqRel);

            let callback: IdleCallback = Box::new(move || {
                if record.gpu_refcnt.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if let Some(device) = device.upgrade() {
                        device.finalize_deferred(&record);
                    }
                }
            });

            if self.backend.on_queue_idle(usage.queue, usage.seqnum, callback) {
                registered = true;
            } else {
                bo.gpu_refcnt.fetch_sub(1, Ordering::AcqRel);
            }
        }

        if !registered {
            bo.gpu_refcnt.store(0, Ordering::Release);
        }

        registered
    }

    /// Completes a reclaim that waited for the GPU; runs on whichever
    /// thread saw the last queue finish.
    #[profiling::function]
    fn finalize_deferred(&self, bo: &Arc<Bo>) {
        if let Some(addr) = bo.take_mapping() {
            self.backend.unmap(addr, bo.size());
        }

        let outcome = self.registry.with(|records| {
            // An import during the deferred window revives the record.
            if bo.ref_count() != 0 {
                return None;
            }

            Some(self.finalize_locked(records, bo))
        });

        if let Some(stale) = outcome {
            self.release_records(stale, "evict");
        }
    }

    /// Parks or frees a zero-reference record under the registry lock.
    ///
    /// Returns stale pool entries that aged out, already unlinked from the
    /// registry; the caller destroys them after unlocking. Refused records
    /// die here, before the lock drops, so a concurrent import can never
    /// adopt a stale kernel handle.
    fn finalize_locked(
        &self,
        records: &mut HashMap<Handle, Arc<Bo>>,
        bo: &Arc<Bo>,
    ) -> Vec<Arc<Bo>> {
        let parked = self.with_cache(|cache| cache.put(self.backend(), bo, self.now_secs()));

        match parked {
            Some(stale) => {
                self.log_bo("put", bo);

                for entry in &stale {
                    records.remove(&entry.handle());
                }

                stale
            }
            None => {
                // A revive-and-drop cycle can race two reclaims of the same
                // shared record here; only the one that still finds it in
                // the registry performs the free.
                match records.remove(&bo.handle()) {
                    Some(entry) if Arc::ptr_eq(&entry, bo) => {
                        self.release_record(bo, "free");
                    }
                    Some(entry) => {
                        // Same handle, different record: the kernel object
                        // was reopened by an import. Leave it alone.
                        records.insert(entry.handle(), entry);
                    }
                    None => {}
                }

                Vec::new()
            }
        }
    }

    #[profiling::function]
    pub(super) fn import_bo(this: &Arc<Self>, fd: RawFd) -> Result<BoRef, DriverError> {
        trace!("import: fd {fd}");

        enum Imported {
            Known(Arc<Bo>),
            Fresh(Arc<Bo>),
        }

        // The handle translation happens under the registry lock so that it
        // cannot interleave with a concurrent free of the same handle.
        let outcome = this.registry.with(|records| {
            let alloc = this.backend.import_fd(fd)?;

            if let Some(existing) = records.get(&alloc.handle) {
                let bo = Arc::clone(existing);

                // Racing an unreference that has not finalized: revive.
                if bo.ref_count() == 0 {
                    bo.refcnt_store(1);
                } else {
                    bo.refcnt_inc();
                }

                bo.add_flags(BoFlags::SHARED);

                // Backends may map eagerly on every translation; keep the
                // mapping if the record lost its own, else give it back.
                if let Some(addr) = alloc.cpu_addr {
                    if !bo.try_set_mapping(addr) {
                        this.backend.unmap(addr, bo.size());
                    }
                }

                return Ok(Imported::Known(bo));
            }

            let Some(size) = this.backend.fd_size(fd).filter(|size| *size > 0) else {
                warn!("unable to size imported dma-buf fd {fd}");

                // Leave no half-initialized slot behind.
                this.backend.free(alloc.handle);

                return Err(DriverError::InvalidData);
            };

            let bo = Arc::new(Bo::new(
                Arc::downgrade(this),
                alloc.handle,
                alloc.gpu_addr,
                align_up(size, this.backend.alignment()),
                BoFlags::SHARED,
                "import".to_owned(),
            ));

            if let Some(addr) = alloc.cpu_addr {
                bo.set_mapping(addr);
            }

            records.insert(alloc.handle, Arc::clone(&bo));

            Ok(Imported::Fresh(bo))
        })?;

        let bo = match outcome {
            Imported::Known(bo) => bo,
            Imported::Fresh(bo) => {
                // Keep a duplicate descriptor around for re-export.
                if let Ok(dup) = this.backend.dup_fd(fd) {
                    if bo.set_dmabuf_fd(dup).is_err() {
                        this.backend.close_fd(dup);
                    }
                }

                bo
            }
        };

        this.log_bo("import", &bo);

        Ok(BoRef::new(bo))
    }

    #[profiling::function]
    pub(super) fn export_bo(&self, bo: &Bo) -> Result<RawFd, DriverError> {
        let fd = match bo.dmabuf_fd() {
            fd if fd >= 0 => fd,
            _ => {
                // A failed export leaves the record unshared.
                let fresh = self.backend.export_fd(bo.handle())?;

                match bo.set_dmabuf_fd(fresh) {
                    Ok(()) => fresh,
                    Err(fresh) => {
                        // Another thread exported concurrently; keep its
                        // descriptor.
                        self.backend.close_fd(fresh);

                        bo.dmabuf_fd()
                    }
                }
            }
        };

        bo.add_flags(BoFlags::SHARED);
        self.log_bo("export", bo);

        self.backend.dup_fd(fd)
    }

    /// Unlinks `records` from the registry, then destroys them.
    fn destroy_records(&self, records: Vec<Arc<Bo>>, op: &str) {
        if records.is_empty() {
            return;
        }

        self.registry.with(|map| {
            for bo in &records {
                map.remove(&bo.handle());
            }
        });

        self.release_records(records, op);
    }

    fn release_records(&self, records: Vec<Arc<Bo>>, op: &str) {
        for bo in records {
            self.release_record(&bo, op);
        }
    }

    /// Hands a record, already unlinked everywhere, back to the kernel.
    fn release_record(&self, bo: &Arc<Bo>, op: &str) {
        self.log_bo(op, bo);

        if let Some(addr) = bo.take_mapping() {
            self.backend.unmap(addr, bo.size());
        }

        if let Some(fd) = bo.take_dmabuf_fd() {
            self.backend.close_fd(fd);
        }

        self.backend.free(bo.handle());
    }

    fn with_cache<R>(&self, f: impl FnOnce(&mut BoCache) -> R) -> R {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut cache = self.cache.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut cache = cache.unwrap();

        f(&mut cache)
    }

    fn now_secs(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    fn log_bo(&self, op: &str, bo: &Bo) {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut bo_log = self.bo_log.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut bo_log = bo_log.unwrap();

        let Some(writer) = bo_log.as_mut() else {
            return;
        };

        let label = bo.label();
        let label = if label.is_empty() { "-".to_owned() } else { label };
        let _ = writeln!(
            writer,
            "{}: {} {:x}..{:x} size {:8} label {} obj {:p},{},{}",
            self.epoch.elapsed().as_micros(),
            op,
            bo.gpu_addr(),
            bo.gpu_addr() + bo.size(),
            bo.size(),
            label,
            bo as *const Bo,
            bo.handle(),
            bo.dmabuf_fd(),
        );
    }

    #[cfg(test)]
    pub(super) fn registry_len(&self) -> usize {
        self.registry.len()
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("alignment", &self.backend.alignment())
            .field("caps", &self.backend.caps())
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        // The weak back-references are already dead, so records cannot take
        // the usual unreference path; tear the tables down directly.
        let heap = {
            #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
            let mut tiler_heap = self.tiler_heap.lock();

            #[cfg(not(feature = "parking_lot"))]
            let mut tiler_heap = tiler_heap.unwrap();

            tiler_heap.take()
        };

        if let Some(heap) = heap {
            drop(heap.into_record());
        }

        self.with_cache(|cache| cache.evict_all());

        let records = self
            .registry
            .with(|records| records.drain().map(|(_, bo)| bo).collect::<Vec<_>>());

        for bo in records {
            if let Some(addr) = bo.take_mapping() {
                self.backend.unmap(addr, bo.size());
            }

            if let Some(fd) = bo.take_dmabuf_fd() {
                self.backend.close_fd(fd);
            }

            self.backend.free(bo.handle());
        }
    }
}

/// Information used to create a [`Device`] instance.
#[derive(Builder, Clone, Copy, Debug, Eq, PartialEq)]
#[builder(
    build_fn(private, name = "fallible_build", error = "DeviceInfoBuilderError"),
    derive(Clone, Copy, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct DeviceInfo {
    /// Park zero-reference objects for reuse instead of freeing them.
    #[builder(default = "true")]
    pub cache_bos: bool,

    /// Byte size of the device-scope tiler heap object; zero allocates none.
    #[builder(default)]
    pub tiler_heap_size: u64,

    /// Zero the CPU-visible contents of every object handed out, fresh or
    /// recycled. A debugging aid.
    #[builder(default)]
    pub zero_bos: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        DeviceInfoBuilder::default().build()
    }
}

impl DeviceInfoBuilder {
    /// Builds a new `DeviceInfo`.
    pub fn build(self) -> DeviceInfo {
        self.fallible_build()
            .expect("All required fields set at initialization")
    }
}

impl From<DeviceInfoBuilder> for DeviceInfo {
    fn from(info: DeviceInfoBuilder) -> Self {
        info.build()
    }
}

#[derive(Debug)]
struct DeviceInfoBuilderError;

impl From<UninitializedFieldError> for DeviceInfoBuilderError {
    fn from(_: UninitializedFieldError) -> Self {
        Self
    }
}

//! Kernel buffer object interface based on smart pointers.
//!
//! # Resources
//!
//! Each [`Bo`] wraps an opaque kernel handle together with an information
//! structure describing the allocation. Records are shared: the same kernel
//! object is never represented by more than one record in a process, so
//! reference counting stays coherent across import and export.
//!
//! # Backends
//!
//! All kernel traffic goes through the [`Backend`] capability. A backend
//! maps onto one device generation's ioctl surface; the core only consults
//! [`BackendCaps`] bits and never interprets backend-specific opcodes.

mod backend;
mod bo;
mod device;
mod registry;

pub(crate) mod sync;

#[cfg(test)]
pub(crate) mod test_backend;

pub use self::{
    backend::{
        Allocation, Backend, BackendCaps, Handle, IdleCallback, Madvise, QueueProgress, RawFd,
    },
    bo::{Bo, BoInfo, BoInfoBuilder, BoRef},
    device::{Device, DeviceInfo, DeviceInfoBuilder},
    sync::BoUsage,
};

use {
    bitflags::bitflags,
    std::{
        error::Error,
        fmt::{Display, Formatter},
    },
};

bitflags! {
    /// Creation flags of a [`Bo`].
    ///
    /// The bit values are an implementation detail; only the set and its
    /// semantics are stable across backends.
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    pub struct BoFlags: u32 {
        /// The object has been exported to or imported from another process.
        ///
        /// Set once, never cleared, and never cached.
        const SHARED = 1 << 0;

        /// The GPU may fetch instructions from the object.
        const EXECUTABLE = 1 << 1;

        /// Heap-like object which the kernel grows on demand. Never mapped.
        const GROWABLE = 1 << 2;

        /// No CPU mapping is ever created.
        const INVISIBLE = 1 << 3;

        /// The CPU mapping is cached and requires explicit maintenance.
        const CACHEABLE = 1 << 4;

        /// Defer the CPU mapping until first use.
        const DELAY_MMAP = 1 << 5;

        /// The object backs an event/timeline structure.
        const EVENT = 1 << 6;
    }
}

bitflags! {
    /// Pending GPU access to a [`Bo`], maintained by the submission layer
    /// and cleared by confirmed waits.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct GpuAccess: u8 {
        /// Submitted work reads the object.
        const READ = 1 << 0;

        /// Submitted work writes the object.
        const WRITE = 1 << 1;
    }
}

/// Describes the result of a failed driver operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DriverError {
    /// The input data, or referenced data, is not valid for the current state.
    InvalidData,

    /// The requested feature, or input configuration, is not supported for the
    /// current state.
    Unsupported,

    /// The device has run out of physical memory.
    ///
    /// Many kernels return this value for generic or unhandled error
    /// conditions.
    OutOfMemory,
}

impl Display for DriverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for DriverError {}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert_eq!(
        alignment.count_ones(),
        1,
        "Alignment must be a power of two"
    );

    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn align_up_rounds_to_granule() {
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(align_up(1, 16384), 16384);
        assert_eq!(align_up(16385, 16384), 32768);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Alignment must be a power of two")]
    pub fn align_up_rejects_non_pot() {
        align_up(42, 3000);
    }

    #[test]
    pub fn shared_flag_is_distinct() {
        // Cache compatibility compares flag bits exactly; SHARED must never
        // alias another bit.
        for flag in [
            BoFlags::EXECUTABLE,
            BoFlags::GROWABLE,
            BoFlags::INVISIBLE,
            BoFlags::CACHEABLE,
            BoFlags::DELAY_MMAP,
            BoFlags::EVENT,
        ] {
            assert!(!flag.contains(BoFlags::SHARED));
        }
    }
}

//! Userspace pooling of GPU buffer objects.
//!
//! Allocating and freeing device memory through the kernel costs ioctl
//! round-trips, address-space setup and page pinning, so this crate keeps a
//! pool of recently released buffer objects and recycles them without
//! kernel involvement. Dropping the last handle to an object parks it;
//! creating a compatible object reclaims it; entries that sit parked for
//! more than a second or two age out.
//!
//! The kernel itself sits behind the [`driver::Backend`] capability, so the
//! lifecycle, registry and pooling logic are shared across device
//! generations and testable against a scripted backend.
//!
//! # Examples
//!
//! Basic usage:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use gem_pool::driver::{Backend, Bo, BoInfo, Device, DeviceInfo, DriverError};
//! # fn open_backend() -> Box<dyn Backend> { unimplemented!() }
//! # fn main() -> Result<(), DriverError> {
//! let device = Device::open(open_backend(), DeviceInfo::default())?;
//!
//! let bo = Bo::create(&device, BoInfo::new(64 * 1024))?;
//! drop(bo); // parked, not freed
//!
//! let again = Bo::create(&device, BoInfo::new(64 * 1024))?; // recycled
//! # Ok(()) }
//! ```

pub mod driver;
pub mod pool;

/// Things which are used with almost every buffer object.
pub mod prelude {
    pub use {
        super::{
            driver::{
                Backend, Bo, BoFlags, BoInfo, BoRef, Device, DeviceInfo, DriverError, GpuAccess,
            },
            pool::CacheStats,
        },
        log::{debug, error, info, trace, warn},
    };
}

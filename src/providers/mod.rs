//! Discovery providers: hardware file paths, accelerator entities, and
//! GPIO lines. Providers run their expensive scans on worker threads and
//! publish results as atomic snapshots; lookups always see the last
//! published state.

pub mod accel_entities;
pub mod gpio;
pub mod hwmon_files;

pub use accel_entities::{AccelEntities, AccelEntityProvider, CallbackId};
pub use gpio::{GpioProvider, GpioState};
pub use hwmon_files::{HwmonFileProvider, HwmonPaths, HwmonPathsHandle};

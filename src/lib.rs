//! Node Manager device layer.
//!
//! Samples platform power/thermal/utilization telemetry, fuses it into
//! platform-level readings, and applies power and performance limits to
//! hardware knobs (package/DRAM RAPL, accelerator power limits, turbo and
//! PROCHOT ratios, HWPM preferences, platform DC power).
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   Ports (outer boundary)                     │
//! │                                                              │
//! │  PeciTransport      ObjectService       GpioChips            │
//! │  (side-band bus)    (system bus)        (gpio cdev)          │
//! │                                                              │
//! │  ─────────────────── Port Trait Boundary ──────────────────  │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                  DeviceManager.tick()                  │  │
//! │  │   Sensors ──▶ ReadingStore ──▶ Readings ──▶ Knobs      │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                                                              │
//! │  WorkerPool (blocking I/O) · KnobExecutor (keyed writes)     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A single external timer drives [`manager::DeviceManager::tick`]; every
//! blocking operation (file I/O, bus transactions, discovery walks) runs on
//! the [`worker::WorkerPool`] and is picked up through polled task handles,
//! so a tick never blocks.

pub mod clock;
pub mod config;
pub mod diagnostics;
mod error;
pub mod knobs;
pub mod manager;
pub mod peci;
pub mod ports;
pub mod providers;
pub mod readings;
pub mod sensors;
pub mod store;
pub mod types;
pub mod worker;

pub use error::{Error, KnobError, StoreError};

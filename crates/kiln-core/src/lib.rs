//! Kiln core crate.
//!
//! Per-frame GPU command and resource lifecycle management: a fence-gated frame
//! ring, a command-list pool, descriptor heaps, buffer renaming and a pipeline
//! state cache, all driven by [`device::Device`] on top of a [`backend::Backend`].

pub mod backend;
pub mod command;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod format;
pub mod frame;
pub mod handle;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod resource;

mod buffer_pool;

pub use buffer_pool::{BufferAllocation, BufferClass, BufferPool, BufferPools};
pub use config::{DeviceConfig, HeapSizes, MAX_FRAMES_IN_FLIGHT};
pub use device::Device;
pub use error::{GpuError, GpuResult};
pub use frame::{FenceValue, FrameCounter};

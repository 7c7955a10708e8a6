use std::fmt;

use crate::descriptor::HeapKind;
use crate::frame::FenceValue;

/// Errors surfaced by the core.
///
/// Only [`GpuError::DeviceLost`] is recoverable, and only by the caller: the
/// device stops issuing GPU work and expects a full re-creation of dependent state.
/// Everything else is either a fatal native failure or a configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// The native device was removed or reset.
    DeviceLost { reason: String },
    /// A native object could not be created (out of memory, invalid descriptor).
    Creation { what: &'static str, reason: String },
    /// A fixed-capacity descriptor heap has no free slot left.
    HeapExhausted { kind: HeapKind, capacity: u32 },
    /// The per-frame transient uniform ring cannot fit an allocation.
    RingExhausted { requested: u64, capacity: u64 },
    /// A wait was requested on a fence value that was never signaled.
    FenceNotIssued { requested: FenceValue, last_signaled: FenceValue },
    /// Rejected configuration.
    InvalidConfig(String),
    /// A draw was issued without a required piece of state (e.g. vertex shader).
    IncompleteState(&'static str),
    /// A recording-only operation was called outside `begin_frame`/`present`.
    NotRecording,
    /// `begin_frame` was called while a frame is already being recorded.
    AlreadyRecording,
    /// A handle refers to an object that has been destroyed.
    StaleHandle(&'static str),
    /// Any other native backend failure.
    Backend(String),
}

impl GpuError {
    pub fn device_lost(reason: impl Into<String>) -> Self {
        Self::DeviceLost { reason: reason.into() }
    }

    pub fn creation(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Creation { what, reason: reason.into() }
    }

    #[inline]
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost { .. })
    }
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceLost { reason } => write!(f, "gpu device lost: {reason}"),
            Self::Creation { what, reason } => write!(f, "failed to create {what}: {reason}"),
            Self::HeapExhausted { kind, capacity } => {
                write!(f, "{kind:?} descriptor heap exhausted (capacity {capacity})")
            }
            Self::RingExhausted { requested, capacity } => write!(
                f,
                "uniform ring exhausted: {requested} bytes requested, capacity {capacity}"
            ),
            Self::FenceNotIssued { requested, last_signaled } => write!(
                f,
                "fence {} was never issued (last signaled {})",
                requested.get(),
                last_signaled.get()
            ),
            Self::InvalidConfig(msg) => write!(f, "invalid device configuration: {msg}"),
            Self::IncompleteState(what) => write!(f, "draw issued without {what}"),
            Self::NotRecording => f.write_str("no frame is being recorded"),
            Self::AlreadyRecording => f.write_str("a frame is already being recorded"),
            Self::StaleHandle(what) => write!(f, "stale {what} handle"),
            Self::Backend(msg) => write!(f, "backend error: {msg}"),
        }
    }
}

impl std::error::Error for GpuError {}

pub type GpuResult<T> = Result<T, GpuError>;

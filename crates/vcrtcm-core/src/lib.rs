//! Virtual CRTC manager.
//!
//! Decouples GPU frame production from pixel consumption. A frame producer (a GPU driver, a
//! software renderer) and a pixel consumer (USB display, video loopback, in-memory screen) never
//! talk to each other directly; both talk to [`Vcrtcm`], which owns:
//! - the pcon table, addressed by integer [`PconId`] handles,
//! - the attach/detach state machine binding one producer to one consumer,
//! - double-buffered push buffers the producer fills and the consumer reads, and
//! - emulated vblank timing for outputs without a refresh interrupt, driven by an external
//!   `now_ns` clock through [`Vcrtcm::tick`] (see the `tokio-driver` feature for a ready-made
//!   driver task).
//!
//! Consumers are created through pluggable pixel interface modules ([`PimFuncs`]). The
//! [`backend`] module has in-process collaborators for both sides.
#![forbid(unsafe_code)]

pub mod attach;
pub mod backend;
pub mod config;
pub mod cursor;
#[cfg(feature = "tokio-driver")]
pub mod driver;
pub mod error;
pub mod fb;
pub mod hal;
pub mod manager;
pub mod metrics;
pub mod pim;
pub mod push_buffer;
pub mod registry;
pub mod types;
pub mod vblank;

#[cfg(test)]
mod proptests;

pub use config::{ConfigError, VcrtcmConfig};
pub use cursor::{overlay_cursor, CursorImage, Frame};
#[cfg(feature = "tokio-driver")]
pub use driver::{spawn_vblank_driver, VblankDriverConfig, VblankDriverHandle};
pub use error::{ErrorKind, Result, VcrtcmError};
pub use hal::{GpuBufferHandle, GpuFuncs, GpuIrqFuncs, PconFuncs, PconIrqFuncs, VblankTiming};
pub use manager::{PconDescriptor, Vcrtcm};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pim::{PconInstance, PimFuncs, PimRegistration, PimSummary};
pub use push_buffer::{pages_for, PushBuffer, PushBufferInfo};
pub use registry::AttachPhase;
pub use types::{
    BufferKind, CursorDescriptor, DpmsState, FbDescriptor, FbStatus, Mode, PconId, PimId,
    PushSlot, XferCaps, XferMode,
};
pub use vblank::{period_ns_from_fps, VblankStamp};

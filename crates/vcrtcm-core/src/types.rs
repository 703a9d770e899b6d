//! Plain data shared between the manager and its collaborators.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VcrtcmError};

/// Stable integer handle of a pixel consumer instance. Unique while the pcon is allocated.
pub type PconId = u32;

/// Identifier assigned to a registered pixel interface module.
pub type PimId = u32;

bitflags! {
    /// Transfer directions an implementation supports.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct XferCaps: u32 {
        /// The GPU copies rendered frames into consumer-owned push buffers.
        const PUSH = 1 << 0;
        /// The consumer reads frames directly out of GPU memory.
        const PULL = 1 << 1;
    }
}

/// Negotiated transfer mode of an attachment.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XferMode {
    Push,
    Pull,
    PushPull,
}

impl XferMode {
    /// Intersect both sides' capabilities. Both directions available means `PushPull`.
    pub fn negotiate(gpu: XferCaps, consumer: XferCaps) -> Result<Self> {
        let common = gpu & consumer;
        if common.contains(XferCaps::PUSH | XferCaps::PULL) {
            Ok(Self::PushPull)
        } else if common.contains(XferCaps::PUSH) {
            Ok(Self::Push)
        } else if common.contains(XferCaps::PULL) {
            Ok(Self::Pull)
        } else {
            Err(VcrtcmError::Unsupported("no common transfer mode"))
        }
    }

    /// Whether frames travel through push buffers.
    pub fn uses_push_buffers(self) -> bool {
        !matches!(self, Self::Pull)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DpmsState {
    #[default]
    On,
    Standby,
    Suspend,
    Off,
}

/// Framebuffer geometry as programmed by the GPU side.
///
/// `viewport_x`/`viewport_y` locate the visible `hdisplay x vdisplay` window inside the
/// `width x height` surface.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FbDescriptor {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u32,
    pub viewport_x: u32,
    pub viewport_y: u32,
    pub hdisplay: u32,
    pub vdisplay: u32,
}

impl FbDescriptor {
    /// Tightly packed framebuffer showing the whole surface.
    pub fn packed(width: u32, height: u32, bpp: u32) -> Self {
        Self {
            width,
            height,
            pitch: width.saturating_mul(bpp / 8),
            bpp,
            viewport_x: 0,
            viewport_y: 0,
            hdisplay: width,
            vdisplay: height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn size_bytes(&self) -> Option<usize> {
        usize::try_from(self.pitch)
            .ok()?
            .checked_mul(usize::try_from(self.height).ok()?)
    }

    pub(crate) fn validate(&self, max_width: u32, max_height: u32) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        if self.width > max_width || self.height > max_height {
            return Err(VcrtcmError::invalid(format!(
                "framebuffer {}x{} exceeds {max_width}x{max_height}",
                self.width, self.height
            )));
        }
        if !matches!(self.bpp, 8 | 16 | 24 | 32) {
            return Err(VcrtcmError::invalid(format!(
                "unsupported framebuffer depth {}bpp",
                self.bpp
            )));
        }
        let row_bytes = u64::from(self.width) * u64::from(self.bpp / 8);
        if u64::from(self.pitch) < row_bytes {
            return Err(VcrtcmError::invalid(format!(
                "pitch {} shorter than a {row_bytes}-byte row",
                self.pitch
            )));
        }
        let right = u64::from(self.viewport_x) + u64::from(self.hdisplay);
        let bottom = u64::from(self.viewport_y) + u64::from(self.vdisplay);
        if right > u64::from(self.width) || bottom > u64::from(self.height) {
            return Err(VcrtcmError::invalid("viewport outside framebuffer"));
        }
        Ok(())
    }
}

/// Hardware cursor image geometry and position (screen coordinates, may be negative).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorDescriptor {
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    pub location_x: i32,
    pub location_y: i32,
    pub visible: bool,
}

impl CursorDescriptor {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn size_bytes(&self) -> Option<usize> {
        usize::try_from(self.width)
            .ok()?
            .checked_mul(usize::try_from(self.height).ok()?)?
            .checked_mul(usize::try_from(self.bpp / 8).ok()?)
    }

    pub(crate) fn validate(&self, max_width: u32, max_height: u32) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        if self.width > max_width || self.height > max_height {
            return Err(VcrtcmError::invalid(format!(
                "cursor {}x{} exceeds {max_width}x{max_height}",
                self.width, self.height
            )));
        }
        // Overlay assumes ARGB8888.
        if self.bpp != 32 {
            return Err(VcrtcmError::invalid(format!(
                "unsupported cursor depth {}bpp",
                self.bpp
            )));
        }
        Ok(())
    }
}

/// One display mode advertised by a consumer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mode {
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u32,
}

/// Which double-buffered push-buffer set an operation targets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
    Framebuffer,
    Cursor,
}

/// One of the two push-buffer slots.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PushSlot {
    #[default]
    Zero,
    One,
}

impl PushSlot {
    pub fn other(self) -> Self {
        match self {
            Self::Zero => Self::One,
            Self::One => Self::Zero,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Zero => 0,
            Self::One => 1,
        }
    }
}

bitflags! {
    /// Framebuffer status as reported through the non-blocking status path.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct FbStatus: u32 {
        /// A push into a push buffer is in progress.
        const PUSH_IN_PROGRESS = 1 << 0;
        /// A filled push buffer has not been accepted by the consumer yet.
        const XMIT_PENDING = 1 << 1;
        /// The consumer is still reading the previous frame.
        const CONSUMER_BUSY = 1 << 2;
        /// A page flip was requested and not yet transmitted.
        const FLIP_PENDING = 1 << 3;
    }
}

//! Frames handed to consumers and the software cursor overlay.

use crate::error::{Result, VcrtcmError};
use crate::types::{CursorDescriptor, FbDescriptor, PushSlot};

const CURSOR_BYTES_PER_PIXEL: usize = 4;

/// Cursor image that travelled with a frame.
#[derive(Copy, Clone, Debug)]
pub struct CursorImage<'a> {
    pub desc: CursorDescriptor,
    pub pixels: &'a [u8],
}

/// A filled push-buffer slot as seen by the consumer during `transmit`.
#[derive(Copy, Clone, Debug)]
pub struct Frame<'a> {
    /// Monotonic per-pcon frame counter.
    pub seq: u64,
    pub slot: PushSlot,
    pub fb: FbDescriptor,
    /// Framebuffer bytes (`fb.pitch * fb.height`, possibly followed by page padding).
    pub pixels: &'a [u8],
    pub cursor: Option<CursorImage<'a>>,
}

impl Frame<'_> {
    /// Copy the framebuffer into `out` and draw the cursor on top of it.
    ///
    /// The cursor is only drawn into 32bpp framebuffers; other depths get the plain copy.
    pub fn composite(&self, out: &mut Vec<u8>) -> Result<()> {
        let size = self
            .fb
            .size_bytes()
            .ok_or_else(|| VcrtcmError::invalid("framebuffer size overflows"))?;
        let src = self
            .pixels
            .get(..size)
            .ok_or_else(|| VcrtcmError::invalid("frame shorter than framebuffer"))?;
        out.clear();
        out.extend_from_slice(src);
        match &self.cursor {
            Some(cursor) if self.fb.bpp == 32 && cursor.desc.bpp == 32 => {
                overlay_cursor(out, &self.fb, cursor.pixels, &cursor.desc)?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Draw an ARGB8888 cursor into a 32bpp framebuffer.
///
/// A cursor pixel replaces the framebuffer pixel when its top (alpha) byte is non-zero. The
/// cursor is positioned in viewport coordinates and clipped to the `hdisplay x vdisplay`
/// viewport; rows and columns that fall off-screen (including negative locations) are skipped.
pub fn overlay_cursor(
    fb_bytes: &mut [u8],
    fb: &FbDescriptor,
    cursor_bytes: &[u8],
    cursor: &CursorDescriptor,
) -> Result<()> {
    if !cursor.visible || cursor.is_empty() || fb.is_empty() {
        return Ok(());
    }
    if fb.bpp != 32 || cursor.bpp != 32 {
        return Err(VcrtcmError::Unsupported("cursor overlay requires 32bpp"));
    }

    let fb_len = fb
        .size_bytes()
        .ok_or_else(|| VcrtcmError::invalid("framebuffer size overflows"))?;
    if fb_bytes.len() < fb_len {
        return Err(VcrtcmError::invalid("framebuffer memory too small"));
    }
    let cursor_len = cursor
        .size_bytes()
        .ok_or_else(|| VcrtcmError::invalid("cursor size overflows"))?;
    if cursor_bytes.len() < cursor_len {
        return Err(VcrtcmError::invalid("cursor image too small"));
    }

    let pitch = fb.pitch as usize;
    let cursor_w = cursor.width as usize;
    let hdisplay = i64::from(fb.hdisplay);
    let vdisplay = i64::from(fb.vdisplay);

    for row in 0..cursor.height as usize {
        let screen_y = i64::from(cursor.location_y) + row as i64;
        if screen_y < 0 {
            continue;
        }
        if screen_y >= vdisplay {
            break;
        }
        let fb_y = fb.viewport_y as usize + screen_y as usize;
        let src_row = &cursor_bytes[row * cursor_w * CURSOR_BYTES_PER_PIXEL..][..cursor_w * 4];

        for (col, src) in src_row.chunks_exact(CURSOR_BYTES_PER_PIXEL).enumerate() {
            let screen_x = i64::from(cursor.location_x) + col as i64;
            if screen_x < 0 {
                continue;
            }
            if screen_x >= hdisplay {
                break;
            }
            if src[3] == 0 {
                continue;
            }
            let fb_x = fb.viewport_x as usize + screen_x as usize;
            let dst = fb_y * pitch + fb_x * CURSOR_BYTES_PER_PIXEL;
            fb_bytes[dst..dst + CURSOR_BYTES_PER_PIXEL].copy_from_slice(src);
        }
    }
    Ok(())
}

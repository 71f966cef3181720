use std::time::SystemTime;

use crate::error::FrameDecodeError;

/// One decoded screencast still, RGBA8.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub timestamp: SystemTime,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Decodes one encoded still (JPEG or PNG).
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
    if bytes.is_empty() {
        return Err(FrameDecodeError::Empty);
    }
    let image = image::load_from_memory(bytes)?.into_rgba8();
    let (width, height) = image.dimensions();
    Ok(Frame {
        timestamp: SystemTime::now(),
        width,
        height,
        data: image.into_raw(),
    })
}

/// Off-screen and on-screen frame slots. Frames are decoded into the back
/// slot and only become visible through [`FrameBuffers::swap`].
#[derive(Debug, Default)]
pub struct FrameBuffers {
    back: Option<Frame>,
    front: Option<Frame>,
}

impl FrameBuffers {
    /// Places an already decoded frame in the back buffer.
    pub fn stage(&mut self, frame: Frame) {
        self.back = Some(frame);
    }

    /// Promotes the back buffer. Returns the new front frame, if any.
    pub fn swap(&mut self) -> Option<&Frame> {
        if self.back.is_some() {
            std::mem::swap(&mut self.back, &mut self.front);
            self.back = None;
        }
        self.front.as_ref()
    }

    pub fn front(&self) -> Option<&Frame> {
        self.front.as_ref()
    }

    pub fn clear(&mut self) {
        self.back = None;
        self.front = None;
    }
}

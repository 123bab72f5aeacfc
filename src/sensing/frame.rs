use std::{sync::mpsc, time::Duration};

use anyhow::{bail, Result};
use image::{ImageBuffer, Rgba, RgbaImage};

use super::phash::PerceptualHash;

/// A raw RGBA8 frame as delivered by the capture source.
///
/// `timestamp` is the presentation timestamp, monotonic and relative to the
/// start of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    timestamp: Duration,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, timestamp: Duration) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|count| count.checked_mul(4));
        if width == 0 || height == 0 || expected != Some(pixels.len()) {
            bail!(
                "frame buffer of {} bytes does not match {}x{} RGBA",
                pixels.len(),
                width,
                height
            );
        }

        Ok(Self {
            pixels,
            width,
            height,
            timestamp,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Borrowed view for resampling without copying the buffer.
    pub fn view(&self) -> ImageBuffer<Rgba<u8>, &[u8]> {
        // Dimensions were validated in `new`.
        ImageBuffer::from_raw(self.width, self.height, self.pixels.as_slice())
            .unwrap_or_else(|| unreachable!("frame dimensions validated at construction"))
    }

    pub fn to_rgba_image(&self) -> RgbaImage {
        RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
            .unwrap_or_else(|| unreachable!("frame dimensions validated at construction"))
    }
}

/// What the work context reports back to the cadence controller once it is
/// done with an admitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The frame was persisted (directly or spooled); its hash becomes the new
    /// reference.
    Committed(PerceptualHash),
    /// The frame was dropped somewhere downstream.
    Released,
}

/// Sole owner of an admitted frame while it travels through the work context.
///
/// Exactly one `Completion` is sent per guard: `commit` sends `Committed`,
/// every other exit path (errors, panics, channel failures) sends `Released`
/// from `Drop`.
pub struct InFlightFrame {
    frame: Option<Frame>,
    hash: PerceptualHash,
    done: Option<mpsc::Sender<Completion>>,
}

impl InFlightFrame {
    pub(crate) fn new(frame: Frame, hash: PerceptualHash, done: mpsc::Sender<Completion>) -> Self {
        Self {
            frame: Some(frame),
            hash,
            done: Some(done),
        }
    }

    pub fn frame(&self) -> &Frame {
        self.frame
            .as_ref()
            .unwrap_or_else(|| unreachable!("frame is only taken by commit"))
    }

    pub fn hash(&self) -> PerceptualHash {
        self.hash
    }

    /// Marks the frame as persisted and hands the pixels on (e.g. to the
    /// extraction lane).
    pub fn commit(mut self) -> Frame {
        if let Some(done) = self.done.take() {
            let _ = done.send(Completion::Committed(self.hash));
        }
        self.frame
            .take()
            .unwrap_or_else(|| unreachable!("frame is only taken by commit"))
    }
}

impl Drop for InFlightFrame {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(Completion::Released);
        }
    }
}

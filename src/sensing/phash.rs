use std::{fmt, str::FromStr};

use anyhow::{anyhow, Result};
use image::{imageops, DynamicImage};
use image_hasher::{HashAlg, Hasher, HasherConfig};
use serde::{Deserialize, Serialize};

use super::Frame;

/// Side of the square the frame is reduced to before hashing.
const HASH_INPUT_SIDE: u32 = 64;

/// 64-bit gradient hash of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerceptualHash(u64);

impl PerceptualHash {
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn distance(self, other: PerceptualHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for PerceptualHash {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        u64::from_str_radix(value, 16)
            .map(Self)
            .map_err(|err| anyhow!("invalid perceptual hash '{value}': {err}"))
    }
}

pub struct PerceptualHasher {
    hasher: Hasher,
}

impl PerceptualHasher {
    pub fn new() -> Self {
        let hasher = HasherConfig::new()
            .hash_alg(HashAlg::Gradient)
            .hash_size(8, 8)
            .to_hasher();
        Self { hasher }
    }

    /// Runs on the capture callback, so the frame is first shrunk from a
    /// borrowed view; the full buffer is never copied.
    pub fn compute(&self, frame: &Frame) -> PerceptualHash {
        let small = imageops::thumbnail(&frame.view(), HASH_INPUT_SIDE, HASH_INPUT_SIDE);
        let hash = self.hasher.hash_image(&DynamicImage::ImageRgba8(small));

        let mut bits = [0u8; 8];
        for (slot, byte) in bits.iter_mut().zip(hash.as_bytes()) {
            *slot = *byte;
        }
        PerceptualHash(u64::from_be_bytes(bits))
    }
}

impl Default for PerceptualHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn gradient_frame(width: u32, height: u32, invert: bool) -> Frame {
        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        for _y in 0..height {
            for x in 0..width {
                let mut value = ((x * 255) / width) as u8;
                if invert {
                    value = 255 - value;
                }
                pixels.extend_from_slice(&[value, value, value, 255]);
            }
        }
        Frame::new(pixels, width, height, Duration::ZERO).unwrap()
    }

    #[test]
    fn identical_frames_have_zero_distance() {
        let hasher = PerceptualHasher::new();
        let a = hasher.compute(&gradient_frame(128, 96, false));
        let b = hasher.compute(&gradient_frame(128, 96, false));
        assert_eq!(a.distance(b), 0);
    }

    #[test]
    fn inverted_frame_is_far_away() {
        let hasher = PerceptualHasher::new();
        let a = hasher.compute(&gradient_frame(128, 96, false));
        let b = hasher.compute(&gradient_frame(128, 96, true));
        assert!(a.distance(b) > 16, "distance was {}", a.distance(b));
    }

    #[test]
    fn hex_round_trip() {
        let hash = PerceptualHash::from_bits(0x00ff_10a0_0000_0001);
        assert_eq!(hash.to_string(), "00ff10a000000001");
        assert_eq!("00ff10a000000001".parse::<PerceptualHash>().unwrap(), hash);
        assert!("zz".parse::<PerceptualHash>().is_err());
    }
}

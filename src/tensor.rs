//! Payload tensors moved along pipeline edges.
//!
//! Images are (N, H, W, 3) f32 in 0..1, audio clips are (N, 1, S) f32.
//! Nothing here aliases: a payload is owned by exactly one edge at a time.

/// Frame batch, RGB interleaved.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub count: usize,
    pub height: usize,
    pub width: usize,
    data: Vec<f32>,
}

/// Single-channel coverage mask matching one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub height: usize,
    pub width: usize,
    data: Vec<f32>,
}

/// Compressed latent batch produced by the autoencoder seam.
#[derive(Debug, Clone, PartialEq)]
pub struct Latent {
    pub count: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

/// Opaque text-conditioning vector from the prompt encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(pub Vec<f32>);

/// Waveform batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub count: usize,
    pub channels: usize,
    pub samples: usize,
    data: Vec<f32>,
}

/// Catmull-Rom kernel used for bicubic sampling.
fn cubic(t: f32) -> f32 {
    let t = t.abs();
    if t <= 1.0 {
        1.5 * t * t * t - 2.5 * t * t + 1.0
    } else if t < 2.0 {
        -0.5 * (t * t * t - 5.0 * t * t + 8.0 * t - 4.0)
    } else {
        0.0
    }
}

impl Image {
    pub fn new(count: usize, height: usize, width: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), count * height * width * 3);
        Self {
            count,
            height,
            width,
            data,
        }
    }

    /// Solid-color seed frame.
    pub fn solid(width: usize, height: usize, value: f32) -> Self {
        Self::new(1, height, width, vec![value; height * width * 3])
    }

    /// Rebuilds frames from raw u8 RGB bytes, normalizing to 0..1. The byte
    /// count must be a whole number of (height, width) frames.
    pub fn from_rgb8(bytes: &[u8], height: usize, width: usize) -> Option<Self> {
        let frame = height.checked_mul(width)?.checked_mul(3)?;
        if frame == 0 || !bytes.len().is_multiple_of(frame) || bytes.is_empty() {
            return None;
        }
        let data = bytes.iter().map(|&b| b as f32 / 255.0).collect();
        Some(Self::new(bytes.len() / frame, height, width, data))
    }

    /// Raw u8 RGB wire form: scale, clamp, then cast.
    pub fn to_rgb8(&self) -> Vec<u8> {
        self.data
            .iter()
            .map(|&v| (v * 255.0).clamp(0.0, 255.0) as u8)
            .collect()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    fn pixel(&self, frame: usize, row: usize, col: usize) -> [f32; 3] {
        let base = ((frame * self.height + row) * self.width + col) * 3;
        [self.data[base], self.data[base + 1], self.data[base + 2]]
    }

    /// Bicubic resample of every frame to (width, height).
    pub fn resize(&self, width: usize, height: usize) -> Self {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let scale_x = self.width as f32 / width as f32;
        let scale_y = self.height as f32 / height as f32;
        let mut data = Vec::with_capacity(self.count * height * width * 3);
        for frame in 0..self.count {
            for row in 0..height {
                let src_y = (row as f32 + 0.5) * scale_y - 0.5;
                let base_y = src_y.floor() as isize;
                for col in 0..width {
                    let src_x = (col as f32 + 0.5) * scale_x - 0.5;
                    let base_x = src_x.floor() as isize;
                    let mut acc = [0.0f32; 3];
                    let mut weight_sum = 0.0f32;
                    for dy in -1..=2isize {
                        let sample_y = (base_y + dy).clamp(0, self.height as isize - 1) as usize;
                        let wy = cubic(src_y - (base_y + dy) as f32);
                        for dx in -1..=2isize {
                            let sample_x =
                                (base_x + dx).clamp(0, self.width as isize - 1) as usize;
                            let w = wy * cubic(src_x - (base_x + dx) as f32);
                            let p = self.pixel(frame, sample_y, sample_x);
                            acc[0] += p[0] * w;
                            acc[1] += p[1] * w;
                            acc[2] += p[2] * w;
                            weight_sum += w;
                        }
                    }
                    // kernel weights sum to ~1; normalize to kill edge drift
                    for channel in acc {
                        data.push(channel / weight_sum);
                    }
                }
            }
        }
        Self::new(self.count, height, width, data)
    }

    /// Interior crop at (x, y) with the given extent, clamped to the frame.
    pub fn crop(&self, x: usize, y: usize, width: usize, height: usize) -> Self {
        let x = x.min(self.width.saturating_sub(1));
        let y = y.min(self.height.saturating_sub(1));
        let width = width.clamp(1, self.width - x);
        let height = height.clamp(1, self.height - y);
        let mut data = Vec::with_capacity(self.count * height * width * 3);
        for frame in 0..self.count {
            for row in y..y + height {
                for col in x..x + width {
                    data.extend_from_slice(&self.pixel(frame, row, col));
                }
            }
        }
        Self::new(self.count, height, width, data)
    }

    /// Grows the frame by the given margins, replicating edge pixels into the
    /// new border, and returns the coverage mask: 1 in the border, feathering
    /// to 0 over `feather` pixels of the original interior.
    pub fn pad(&self, left: usize, top: usize, right: usize, bottom: usize, feather: usize) -> (Self, Mask) {
        let height = self.height + top + bottom;
        let width = self.width + left + right;
        let mut data = Vec::with_capacity(self.count * height * width * 3);
        for frame in 0..self.count {
            for row in 0..height {
                let src_row = row.saturating_sub(top).min(self.height - 1);
                for col in 0..width {
                    let src_col = col.saturating_sub(left).min(self.width - 1);
                    data.extend_from_slice(&self.pixel(frame, src_row, src_col));
                }
            }
        }

        let mut mask = Vec::with_capacity(height * width);
        for row in 0..height {
            for col in 0..width {
                let inside = row >= top
                    && row < top + self.height
                    && col >= left
                    && col < left + self.width;
                if !inside {
                    mask.push(1.0);
                    continue;
                }
                if feather == 0 {
                    mask.push(0.0);
                    continue;
                }
                // distance to the nearest padded edge, only on padded sides
                let mut distance = usize::MAX;
                if left > 0 {
                    distance = distance.min(col - left);
                }
                if right > 0 {
                    distance = distance.min(left + self.width - 1 - col);
                }
                if top > 0 {
                    distance = distance.min(row - top);
                }
                if bottom > 0 {
                    distance = distance.min(top + self.height - 1 - row);
                }
                if distance >= feather {
                    mask.push(0.0);
                } else {
                    mask.push(1.0 - distance as f32 / feather as f32);
                }
            }
        }
        (
            Self::new(self.count, height, width, data),
            Mask {
                height,
                width,
                data: mask,
            },
        )
    }

    /// Concatenates two batches of identical frame geometry.
    pub fn batch(mut self, other: Image) -> Self {
        assert_eq!(
            (self.height, self.width),
            (other.height, other.width),
            "batched frames must share geometry"
        );
        self.count += other.count;
        self.data.extend(other.data);
        self
    }

    /// Drops the seed frame so downstream concatenation does not repeat it.
    pub fn skip_first(mut self) -> Self {
        if self.count <= 1 {
            return self;
        }
        let frame = self.height * self.width * 3;
        self.data.drain(..frame);
        self.count -= 1;
        self
    }

    /// Copies the final frame out as a batch of one.
    pub fn last(&self) -> Self {
        let frame = self.height * self.width * 3;
        let start = (self.count - 1) * frame;
        Self::new(1, self.height, self.width, self.data[start..].to_vec())
    }
}

impl Mask {
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn value(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.width + col]
    }
}

impl Embedding {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if !bytes.len().is_multiple_of(4) {
            return None;
        }
        Some(Self(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ))
    }
}

impl Clip {
    pub fn new(count: usize, channels: usize, samples: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), count * channels * samples);
        Self {
            count,
            channels,
            samples,
            data,
        }
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Reinterprets raw little-endian f32 bytes as one mono clip.
    pub fn from_f32_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || !bytes.len().is_multiple_of(4) {
            return None;
        }
        let data: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let samples = data.len();
        Some(Self::new(1, 1, samples, data))
    }

    pub fn to_f32_bytes(&self) -> Vec<u8> {
        self.data.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Final `keep` samples of each channel, the continuation seed window.
    pub fn tail(&self, keep: usize) -> Self {
        let keep = keep.min(self.samples);
        let mut data = Vec::with_capacity(self.count * self.channels * keep);
        for chunk in self.data.chunks_exact(self.samples) {
            data.extend_from_slice(&chunk[self.samples - keep..]);
        }
        Self::new(self.count, self.channels, keep, data)
    }
}

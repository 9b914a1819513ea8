//! Procedural stand-ins for the inference collaborators.
//!
//! All of them are pure functions of their inputs plus the request seed, so
//! the pipeline is fully deterministic and testable without checkpoints. No
//! claim is made about the quality of the media they produce.
use crate::clip::fingerprint;
use crate::models::{
    Autoencoder, Diffusion, Interpolator, ModelError, Musician, SampleRequest, TextEncoder,
};
use crate::tensor::{Clip, Embedding, Image, Latent, Mask};

/// splitmix64; small, seedable, good enough for procedural content.
struct Stream(u64);

impl Stream {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e3779b97f4a7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    }

    /// Uniform in [0, 1).
    fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }

    /// Uniform in [-1, 1).
    fn next_signed(&mut self) -> f32 {
        self.next_f32() * 2.0 - 1.0
    }
}

/// Hash-seeded embedding generator.
#[derive(Debug)]
pub struct BuiltinTextEncoder {
    width: usize,
}

impl Default for BuiltinTextEncoder {
    fn default() -> Self {
        Self { width: 256 }
    }
}

impl TextEncoder for BuiltinTextEncoder {
    fn encode(&self, text: &str) -> Result<Embedding, ModelError> {
        let mut stream = Stream::new(fingerprint(text));
        Ok(Embedding(
            (0..self.width).map(|_| stream.next_signed()).collect(),
        ))
    }
}

/// Average-pooling autoencoder: 8x spatial reduction into 4 planar channels
/// (RGB means plus luminance).
#[derive(Debug)]
pub struct BuiltinAutoencoder {
    factor: usize,
}

impl Default for BuiltinAutoencoder {
    fn default() -> Self {
        Self { factor: 8 }
    }
}

impl BuiltinAutoencoder {
    fn pool(&self, image: &Image, mask: Option<&Mask>) -> Latent {
        let height = image.height.div_ceil(self.factor).max(1);
        let width = image.width.div_ceil(self.factor).max(1);
        let mut data = Vec::with_capacity(image.count * 4 * height * width);
        let pixels = image.data();
        for frame in 0..image.count {
            for channel in 0..4usize {
                for cell_row in 0..height {
                    for cell_col in 0..width {
                        let mut acc = 0.0f32;
                        let mut count = 0.0f32;
                        for row in cell_row * self.factor
                            ..((cell_row + 1) * self.factor).min(image.height)
                        {
                            for col in cell_col * self.factor
                                ..((cell_col + 1) * self.factor).min(image.width)
                            {
                                let base = ((frame * image.height + row) * image.width + col) * 3;
                                let value = if channel < 3 {
                                    pixels[base + channel]
                                } else {
                                    (pixels[base] + pixels[base + 1] + pixels[base + 2]) / 3.0
                                };
                                let keep = mask.map_or(1.0, |m| 1.0 - m.value(row, col));
                                acc += value * keep;
                                count += 1.0;
                            }
                        }
                        data.push(if count > 0.0 { acc / count } else { 0.0 });
                    }
                }
            }
        }
        Latent {
            count: image.count,
            channels: 4,
            height,
            width,
            data,
        }
    }
}

impl Autoencoder for BuiltinAutoencoder {
    fn encode(&self, image: &Image) -> Result<Latent, ModelError> {
        Ok(self.pool(image, None))
    }

    fn encode_masked(&self, image: &Image, mask: &Mask) -> Result<Latent, ModelError> {
        if (mask.height, mask.width) != (image.height, image.width) {
            return Err(ModelError::BadInput(format!(
                "mask {}x{} does not cover image {}x{}",
                mask.width, mask.height, image.width, image.height
            )));
        }
        Ok(self.pool(image, Some(mask)))
    }

    fn decode(&self, latent: &Latent) -> Result<Image, ModelError> {
        let height = latent.height * self.factor;
        let width = latent.width * self.factor;
        let plane = latent.height * latent.width;
        let mut data = Vec::with_capacity(latent.count * height * width * 3);
        for frame in 0..latent.count {
            let base = frame * latent.channels * plane;
            for row in 0..height {
                let cell_row = row / self.factor;
                for col in 0..width {
                    let cell = cell_row * latent.width + col / self.factor;
                    for channel in 0..3 {
                        let value = latent.data[base + channel * plane + cell];
                        data.push(value.clamp(0.0, 1.0));
                    }
                }
            }
        }
        Ok(Image::new(latent.count, height, width, data))
    }
}

/// Noise-blend sampler: folds the seed, the sampler/scheduler names and the
/// conditioning into a deterministic perturbation of the latent.
pub struct BuiltinDiffusion;

fn mean(embedding: &Embedding) -> f32 {
    if embedding.0.is_empty() {
        return 0.0;
    }
    embedding.0.iter().sum::<f32>() / embedding.0.len() as f32
}

impl Diffusion for BuiltinDiffusion {
    fn sample(&self, request: SampleRequest) -> Result<Latent, ModelError> {
        let denoise = request.denoise.clamp(0.0, 1.0);
        let mut stream = Stream::new(
            request.seed
                ^ fingerprint(request.sampler)
                ^ fingerprint(request.scheduler).rotate_left(17)
                ^ u64::from(request.steps).rotate_left(32),
        );
        let bias = 0.05 * request.guidance * (mean(request.positive) - mean(request.negative));
        let mut out = request.latent.clone();
        for value in &mut out.data {
            let noise = stream.next_f32();
            *value = *value * (1.0 - denoise) + noise * denoise + bias;
        }
        Ok(out)
    }
}

/// Linear in-between synthesis with the RIFE-style frame count contract.
pub struct BuiltinInterpolator;

impl Interpolator for BuiltinInterpolator {
    fn interpolate(
        &self,
        frames: &Image,
        _scale: f32,
        multiplier: u32,
    ) -> Result<Image, ModelError> {
        if frames.count < 2 || multiplier < 2 {
            return Ok(frames.clone());
        }
        let frame = frames.height * frames.width * 3;
        let pixels = frames.data();
        let mut data =
            Vec::with_capacity(((frames.count - 1) * multiplier as usize + 1) * frame);
        for pair in 0..frames.count - 1 {
            let a = &pixels[pair * frame..(pair + 1) * frame];
            let b = &pixels[(pair + 1) * frame..(pair + 2) * frame];
            for step in 0..multiplier {
                let t = step as f32 / multiplier as f32;
                data.extend(a.iter().zip(b).map(|(&x, &y)| x * (1.0 - t) + y * t));
            }
        }
        // closing frame
        data.extend_from_slice(&pixels[(frames.count - 1) * frame..]);
        Ok(Image::new(
            (frames.count - 1) * multiplier as usize + 1,
            frames.height,
            frames.width,
            data,
        ))
    }
}

/// Layered-sine music generator.
pub struct BuiltinMusician {
    rate: u32,
}

impl Default for BuiltinMusician {
    fn default() -> Self {
        Self { rate: 32000 }
    }
}

impl BuiltinMusician {
    fn synthesize(&self, prompts: &[String], duration: f32, phase: f32) -> Clip {
        let samples = (duration * self.rate as f32).ceil() as usize;
        let seed = prompts
            .iter()
            .fold(0x811c9dc5u64, |acc, p| acc ^ fingerprint(p).rotate_left(9));
        let mut stream = Stream::new(seed);
        let voices: Vec<(f32, f32)> = (0..3)
            .map(|_| (55.0 * (1.0 + stream.next_f32() * 15.0), 0.2))
            .collect();
        let data = (0..samples)
            .map(|i| {
                let t = phase + i as f32 / self.rate as f32;
                voices
                    .iter()
                    .map(|&(freq, amp)| amp * (std::f32::consts::TAU * freq * t).sin())
                    .sum::<f32>()
            })
            .collect();
        Clip::new(1, 1, samples, data)
    }
}

impl Musician for BuiltinMusician {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn generate(&self, prompts: &[String], duration: f32) -> Result<Clip, ModelError> {
        if duration <= 0.0 {
            return Err(ModelError::BadInput(format!("duration {duration}")));
        }
        Ok(self.synthesize(prompts, duration, 0.0))
    }

    fn generate_continuation(
        &self,
        tail: &Clip,
        rate: u32,
        prompts: &[String],
        duration: f32,
    ) -> Result<Clip, ModelError> {
        if duration <= 0.0 {
            return Err(ModelError::BadInput(format!("duration {duration}")));
        }
        let phase = tail.samples as f32 / rate.max(1) as f32;
        let mut clip = self.synthesize(prompts, duration, phase);
        // crossfade out of the seed window so consecutive clips join cleanly
        let fade = tail.samples.min(clip.samples);
        let seed = tail.data().to_vec();
        let data: Vec<f32> = clip
            .data()
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                if i < fade {
                    let t = i as f32 / fade as f32;
                    seed[seed.len() - fade + i] * (1.0 - t) + v * t
                } else {
                    v
                }
            })
            .collect();
        clip = Clip::new(1, 1, data.len(), data);
        Ok(clip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_encoder_is_deterministic() {
        let encoder = BuiltinTextEncoder::default();
        assert_eq!(
            encoder.encode("a train").unwrap(),
            encoder.encode("a train").unwrap()
        );
        assert_ne!(
            encoder.encode("a train").unwrap(),
            encoder.encode("a boat").unwrap()
        );
    }

    #[test]
    fn test_autoencoder_round_trip_constant() {
        let vae = BuiltinAutoencoder::default();
        let image = Image::solid(64, 64, 0.5);
        let decoded = vae.decode(&vae.encode(&image).unwrap()).unwrap();
        assert_eq!((decoded.height, decoded.width), (64, 64));
        for &v in decoded.data() {
            assert!((v - 0.5).abs() < 1e-5);
        }
    }

    #[test]
    fn test_autoencoder_rejects_misfit_mask() {
        let vae = BuiltinAutoencoder::default();
        let image = Image::solid(64, 64, 0.5);
        let (_, mask) = Image::solid(32, 32, 0.5).pad(4, 0, 0, 0, 2);
        assert!(vae.encode_masked(&image, &mask).is_err());
    }

    #[test]
    fn test_diffusion_same_seed_same_output() {
        let vae = BuiltinAutoencoder::default();
        let diffusion = BuiltinDiffusion;
        let encoder = BuiltinTextEncoder::default();
        let latent = vae.encode(&Image::solid(64, 64, 0.5)).unwrap();
        let positive = encoder.encode("p").unwrap();
        let negative = encoder.encode("n").unwrap();
        let request = |seed| SampleRequest {
            seed,
            steps: 5,
            guidance: 1.0,
            sampler: "lcm",
            scheduler: "sgm_uniform",
            denoise: 1.0,
            positive: &positive,
            negative: &negative,
            latent: &latent,
        };
        let a = diffusion.sample(request(42)).unwrap();
        let b = diffusion.sample(request(42)).unwrap();
        let c = diffusion.sample(request(43)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_interpolator_frame_count() {
        let interpolator = BuiltinInterpolator;
        let frames = Image::solid(8, 8, 0.0).batch(Image::solid(8, 8, 1.0));
        let out = interpolator.interpolate(&frames, 0.25, 6).unwrap();
        assert_eq!(out.count, 7);
        // midpoints actually blend
        let mid = out.data()[3 * 8 * 8 * 3];
        assert!((mid - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_musician_sample_counts_and_determinism() {
        let musician = BuiltinMusician::default();
        let prompts = vec!["calm".to_string()];
        let clip = musician.generate(&prompts, 10.0).unwrap();
        assert_eq!(clip.samples, 320000);
        assert_eq!(clip.channels, 1);
        assert_eq!(clip.data(), musician.generate(&prompts, 10.0).unwrap().data());
    }

    #[test]
    fn test_continuation_starts_on_the_seed() {
        let musician = BuiltinMusician::default();
        let prompts = vec!["calm".to_string()];
        let first = musician.generate(&prompts, 1.0).unwrap();
        let tail = first.tail(1600);
        let next = musician
            .generate_continuation(&tail, musician.sample_rate(), &prompts, 1.0)
            .unwrap();
        assert_eq!(next.samples, 32000);
        // the joint starts exactly where the seed ended
        assert!((next.data()[0] - tail.data()[0]).abs() < 1e-5);
    }
}

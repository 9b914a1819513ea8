//! Interfaces to the inference collaborators the pipeline drives.
//!
//! Everything behind these traits is an opaque compute step: it runs to
//! completion between two scheduler yield points and never suspends on its
//! own. The [`builtin`] module provides deterministic procedural
//! implementations so the binary runs without any checkpoint on disk; real
//! samplers, interpolators and music models plug in behind the same seams.
pub mod builtin;

use std::sync::Arc;

use thiserror::Error;

use crate::tensor::{Clip, Embedding, Image, Latent, Mask};

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model rejected input: {0}")]
    BadInput(String),
}

pub trait TextEncoder: Send + Sync {
    fn encode(&self, text: &str) -> Result<Embedding, ModelError>;
}

pub trait Autoencoder: Send + Sync {
    fn encode(&self, image: &Image) -> Result<Latent, ModelError>;
    /// Inpaint variant: masked regions are suppressed so the sampler fills
    /// them instead of copying them.
    fn encode_masked(&self, image: &Image, mask: &Mask) -> Result<Latent, ModelError>;
    fn decode(&self, latent: &Latent) -> Result<Image, ModelError>;
}

/// One denoising request. Sampler and scheduler are named the way checkpoints
/// name them; the builtin backend only folds them into its seed.
pub struct SampleRequest<'a> {
    pub seed: u64,
    pub steps: u32,
    pub guidance: f32,
    pub sampler: &'a str,
    pub scheduler: &'a str,
    pub denoise: f32,
    pub positive: &'a Embedding,
    pub negative: &'a Embedding,
    pub latent: &'a Latent,
}

pub trait Diffusion: Send + Sync {
    fn sample(&self, request: SampleRequest) -> Result<Latent, ModelError>;
}

pub trait Interpolator: Send + Sync {
    /// Expands N frames to (N−1)·multiplier+1 by synthesizing in-betweens.
    fn interpolate(&self, frames: &Image, scale: f32, multiplier: u32)
    -> Result<Image, ModelError>;
}

pub trait Musician: Send + Sync {
    fn sample_rate(&self) -> u32;
    fn generate(&self, prompts: &[String], duration: f32) -> Result<Clip, ModelError>;
    /// Continues from the tail of a prior clip so consecutive clips join
    /// without a seam.
    fn generate_continuation(
        &self,
        tail: &Clip,
        rate: u32,
        prompts: &[String],
        duration: f32,
    ) -> Result<Clip, ModelError>;
}

/// Resolved model handles for the image pipeline, shared by its stages.
#[derive(Clone)]
pub struct ImageModels {
    pub clip: Arc<dyn TextEncoder>,
    pub vae: Arc<dyn Autoencoder>,
    pub diffusion: Arc<dyn Diffusion>,
    pub interpolator: Arc<dyn Interpolator>,
}

impl ImageModels {
    pub fn builtin() -> Self {
        Self {
            clip: Arc::new(builtin::BuiltinTextEncoder::default()),
            vae: Arc::new(builtin::BuiltinAutoencoder::default()),
            diffusion: Arc::new(builtin::BuiltinDiffusion),
            interpolator: Arc::new(builtin::BuiltinInterpolator),
        }
    }
}

/// Resolved model handles for the sound pipeline.
#[derive(Clone)]
pub struct SoundModels {
    pub musician: Arc<dyn Musician>,
}

impl SoundModels {
    pub fn builtin() -> Self {
        Self {
            musician: Arc::new(builtin::BuiltinMusician::default()),
        }
    }
}

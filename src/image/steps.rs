//! Phase machines for the image stages.
//!
//! Each machine is one request's step sequence: every `advance` does one
//! opaque compute call and hands control back to the scheduler, so cancel
//! and pause land between any two calls. `Emit` is terminal.
use std::mem;

use crate::models::SampleRequest;
use crate::protocol::ImageDone;
use crate::state::ImageState;
use crate::tensor::{Embedding, Image, Latent, Mask};
use crate::work::{StageError, Step, Task};

use super::ImageContext;

/// Outpaint sampling runs the inpaint checkpoint flat out.
const EXTEND_SAMPLER: &str = "lcm";
const EXTEND_SCHEDULER: &str = "sgm_uniform";
const EXTEND_STEPS: u32 = 5;
const EXTEND_GUIDANCE: f32 = 1.0;
const EXTEND_DENOISE: f32 = 1.0;

const DETAIL_SAMPLER: &str = "euler_ancestral";
const DETAIL_SCHEDULER: &str = "sgm_uniform";

fn noise_seed() -> u64 {
    rand::random()
}

/// Multiplicative jitter in [1, 1+by); keeps long sequences from settling
/// into visibly repeating outpaint bands.
fn nudge(value: i64, by: f64) -> i64 {
    (value as f64 * (rand::random::<f64>() * by + 1.0)) as i64
}

#[derive(Debug, Clone, Copy)]
struct Margins {
    zoom: i64,
    left: i64,
    top: i64,
    right: i64,
    bottom: i64,
}

impl Margins {
    fn jittered(state: &ImageState) -> Self {
        Self {
            zoom: nudge(state.zoom, 0.25),
            left: nudge(state.left, 0.25),
            top: nudge(state.top, 0.25),
            right: nudge(state.right, 0.25),
            bottom: nudge(state.bottom, 0.25),
        }
    }

    fn pads(&self) -> bool {
        self.left > 0 || self.top > 0 || self.right > 0 || self.bottom > 0
    }

    fn shrinks(&self) -> bool {
        self.zoom > 0 || self.pads()
    }
}

fn clamp_dim(value: i64) -> usize {
    value.max(1) as usize
}

fn clamp_offset(value: i64) -> usize {
    value.max(0) as usize
}

/// Extend: upscale, zoom-crop, outpaint the borders back in.
pub struct ExtendTask {
    state: ImageState,
    context: ImageContext,
    phase: ExtendPhase,
}

enum ExtendPhase {
    Jitter {
        loaded: Image,
    },
    Upscale {
        loaded: Image,
        margins: Margins,
    },
    Crop {
        scaled: Image,
        margins: Margins,
    },
    Pad {
        scaled: Image,
        cropped: Image,
        margins: Margins,
    },
    Positive {
        scaled: Image,
        padded: Image,
        mask: Mask,
        margins: Margins,
    },
    Negative {
        scaled: Image,
        padded: Image,
        mask: Mask,
        margins: Margins,
        positive: Embedding,
    },
    Encode {
        scaled: Image,
        padded: Image,
        mask: Mask,
        margins: Margins,
        positive: Embedding,
        negative: Embedding,
    },
    Sample {
        scaled: Image,
        margins: Margins,
        positive: Embedding,
        negative: Embedding,
        latent: Latent,
    },
    Decode {
        scaled: Image,
        margins: Margins,
        sampled: Latent,
    },
    ZoomBack {
        scaled: Image,
        decoded: Image,
    },
    Finish {
        scaled: Image,
        zoomed: Image,
    },
    Spent,
}

impl ExtendTask {
    pub fn new(state: ImageState, loaded: Image, context: ImageContext) -> Self {
        Self {
            state,
            context,
            phase: ExtendPhase::Jitter { loaded },
        }
    }
}

impl Task for ExtendTask {
    type Output = (ImageState, Image, Image);

    fn version(&self) -> u64 {
        self.state.control.version
    }

    fn advance(&mut self) -> Result<Step<Self::Output>, StageError> {
        let state = &self.state;
        self.phase = match mem::replace(&mut self.phase, ExtendPhase::Spent) {
            ExtendPhase::Jitter { loaded } => ExtendPhase::Upscale {
                loaded,
                margins: Margins::jittered(state),
            },
            ExtendPhase::Upscale { loaded, margins } => {
                let scaled = loaded.resize(state.width, state.height);
                if margins.shrinks() {
                    ExtendPhase::Crop { scaled, margins }
                } else {
                    ExtendPhase::Finish {
                        zoomed: scaled.clone(),
                        scaled,
                    }
                }
            }
            ExtendPhase::Crop { scaled, margins } => {
                let cropped = scaled.crop(
                    clamp_offset(margins.zoom + margins.right),
                    clamp_offset(margins.zoom + margins.bottom),
                    clamp_dim(
                        state.width as i64 - margins.zoom * 2 - margins.left - margins.right,
                    ),
                    clamp_dim(
                        state.height as i64 - margins.zoom * 2 - margins.top - margins.bottom,
                    ),
                );
                if margins.pads() {
                    ExtendPhase::Pad {
                        scaled,
                        cropped,
                        margins,
                    }
                } else {
                    // zoom-only request; nothing to synthesize
                    ExtendPhase::ZoomBack {
                        scaled,
                        decoded: cropped,
                    }
                }
            }
            ExtendPhase::Pad {
                scaled,
                cropped,
                margins,
            } => {
                let feather = state.width.min(state.height) / 4;
                let (padded, mask) = cropped.pad(
                    clamp_offset(margins.left),
                    clamp_offset(margins.top),
                    clamp_offset(margins.right),
                    clamp_offset(margins.bottom),
                    feather,
                );
                ExtendPhase::Positive {
                    scaled,
                    padded,
                    mask,
                    margins,
                }
            }
            ExtendPhase::Positive {
                scaled,
                padded,
                mask,
                margins,
            } => {
                let positive = self.context.clips.encode(
                    "extend",
                    &state.positive,
                    self.context.models.clip.as_ref(),
                    &state.control.cache,
                )?;
                ExtendPhase::Negative {
                    scaled,
                    padded,
                    mask,
                    margins,
                    positive,
                }
            }
            ExtendPhase::Negative {
                scaled,
                padded,
                mask,
                margins,
                positive,
            } => {
                let negative = self.context.clips.encode(
                    "extend",
                    &state.negative,
                    self.context.models.clip.as_ref(),
                    &state.control.cache,
                )?;
                ExtendPhase::Encode {
                    scaled,
                    padded,
                    mask,
                    margins,
                    positive,
                    negative,
                }
            }
            ExtendPhase::Encode {
                scaled,
                padded,
                mask,
                margins,
                positive,
                negative,
            } => {
                let latent = self.context.models.vae.encode_masked(&padded, &mask)?;
                ExtendPhase::Sample {
                    scaled,
                    margins,
                    positive,
                    negative,
                    latent,
                }
            }
            ExtendPhase::Sample {
                scaled,
                margins,
                positive,
                negative,
                latent,
            } => {
                let sampled = self.context.models.diffusion.sample(SampleRequest {
                    seed: noise_seed(),
                    steps: EXTEND_STEPS,
                    guidance: EXTEND_GUIDANCE,
                    sampler: EXTEND_SAMPLER,
                    scheduler: EXTEND_SCHEDULER,
                    denoise: EXTEND_DENOISE,
                    positive: &positive,
                    negative: &negative,
                    latent: &latent,
                })?;
                ExtendPhase::Decode {
                    scaled,
                    margins,
                    sampled,
                }
            }
            ExtendPhase::Decode {
                scaled,
                margins,
                sampled,
            } => {
                let decoded = self.context.models.vae.decode(&sampled)?;
                if margins.zoom > 0 {
                    ExtendPhase::ZoomBack { scaled, decoded }
                } else {
                    ExtendPhase::Finish {
                        scaled,
                        zoomed: decoded,
                    }
                }
            }
            ExtendPhase::ZoomBack { scaled, decoded } => ExtendPhase::Finish {
                scaled,
                zoomed: decoded.resize(state.width, state.height),
            },
            ExtendPhase::Finish { scaled, zoomed } => {
                return Ok(Step::Emit((self.state.clone(), scaled, zoomed)));
            }
            ExtendPhase::Spent => unreachable!("extend task advanced past completion"),
        };
        Ok(Step::Hold)
    }
}

/// Detail: re-noise the extended frame with the request's own settings.
pub struct DetailTask {
    state: ImageState,
    context: ImageContext,
    phase: DetailPhase,
}

enum DetailPhase {
    Positive {
        scaled: Image,
        zoomed: Image,
    },
    Negative {
        scaled: Image,
        zoomed: Image,
        positive: Embedding,
    },
    Encode {
        scaled: Image,
        zoomed: Image,
        positive: Embedding,
        negative: Embedding,
    },
    Sample {
        scaled: Image,
        positive: Embedding,
        negative: Embedding,
        latent: Latent,
    },
    Decode {
        scaled: Image,
        sampled: Latent,
    },
    Spent,
}

impl DetailTask {
    pub fn new(state: ImageState, scaled: Image, zoomed: Image, context: ImageContext) -> Self {
        Self {
            state,
            context,
            phase: DetailPhase::Positive { scaled, zoomed },
        }
    }
}

impl Task for DetailTask {
    type Output = (ImageState, Image, Image);

    fn version(&self) -> u64 {
        self.state.control.version
    }

    fn advance(&mut self) -> Result<Step<Self::Output>, StageError> {
        let state = &self.state;
        self.phase = match mem::replace(&mut self.phase, DetailPhase::Spent) {
            DetailPhase::Positive { scaled, zoomed } => {
                let positive = self.context.clips.encode(
                    "detail",
                    &state.positive,
                    self.context.models.clip.as_ref(),
                    &state.control.cache,
                )?;
                DetailPhase::Negative {
                    scaled,
                    zoomed,
                    positive,
                }
            }
            DetailPhase::Negative {
                scaled,
                zoomed,
                positive,
            } => {
                let negative = self.context.clips.encode(
                    "detail",
                    &state.negative,
                    self.context.models.clip.as_ref(),
                    &state.control.cache,
                )?;
                DetailPhase::Encode {
                    scaled,
                    zoomed,
                    positive,
                    negative,
                }
            }
            DetailPhase::Encode {
                scaled,
                zoomed,
                positive,
                negative,
            } => {
                let latent = self.context.models.vae.encode(&zoomed)?;
                DetailPhase::Sample {
                    scaled,
                    positive,
                    negative,
                    latent,
                }
            }
            DetailPhase::Sample {
                scaled,
                positive,
                negative,
                latent,
            } => {
                let sampled = self.context.models.diffusion.sample(SampleRequest {
                    seed: noise_seed(),
                    steps: state.steps,
                    guidance: state.guidance,
                    sampler: DETAIL_SAMPLER,
                    scheduler: DETAIL_SCHEDULER,
                    denoise: state.denoise,
                    positive: &positive,
                    negative: &negative,
                    latent: &latent,
                })?;
                DetailPhase::Decode { scaled, sampled }
            }
            DetailPhase::Decode { scaled, sampled } => {
                let decoded = self.context.models.vae.decode(&sampled)?;
                return Ok(Step::Emit((self.state.clone(), scaled, decoded)));
            }
            DetailPhase::Spent => unreachable!("detail task advanced past completion"),
        };
        Ok(Step::Hold)
    }
}

/// Interpolate: batch the prior frame with the new one, then cascade the
/// configured passes.
pub struct InterpolateTask {
    state: ImageState,
    context: ImageContext,
    phase: InterpolatePhase,
}

enum InterpolatePhase {
    Batch { scaled: Image, decoded: Image },
    Pass { frames: Image, index: usize },
    Spent,
}

impl InterpolateTask {
    pub fn new(state: ImageState, scaled: Image, decoded: Image, context: ImageContext) -> Self {
        Self {
            state,
            context,
            phase: InterpolatePhase::Batch { scaled, decoded },
        }
    }
}

impl Task for InterpolateTask {
    type Output = (ImageState, Image);

    fn version(&self) -> u64 {
        self.state.control.version
    }

    fn advance(&mut self) -> Result<Step<Self::Output>, StageError> {
        self.phase = match mem::replace(&mut self.phase, InterpolatePhase::Spent) {
            InterpolatePhase::Batch { scaled, decoded } => InterpolatePhase::Pass {
                frames: scaled.batch(decoded),
                index: 0,
            },
            InterpolatePhase::Pass { frames, index } => {
                match self.state.interpolations.get(index) {
                    Some(&(scale, multiplier)) => InterpolatePhase::Pass {
                        frames: self
                            .context
                            .models
                            .interpolator
                            .interpolate(&frames, scale, multiplier)?,
                        index: index + 1,
                    },
                    // drop the seed frame so concatenation does not repeat it
                    None => return Ok(Step::Emit((self.state.clone(), frames.skip_first()))),
                }
            }
            InterpolatePhase::Spent => unreachable!("interpolate task advanced past completion"),
        };
        Ok(Step::Hold)
    }
}

/// Write: wire conversion, one contiguous ring write, completion record.
pub struct WriteTask {
    state: ImageState,
    context: ImageContext,
    phase: WritePhase,
}

enum WritePhase {
    Convert {
        frames: Image,
    },
    Publish {
        bytes: Vec<u8>,
        count: usize,
        height: usize,
        width: usize,
    },
    Spent,
}

impl WriteTask {
    pub fn new(state: ImageState, frames: Image, context: ImageContext) -> Self {
        Self {
            state,
            context,
            phase: WritePhase::Convert { frames },
        }
    }
}

impl Task for WriteTask {
    type Output = ImageDone;

    fn version(&self) -> u64 {
        self.state.control.version
    }

    fn advance(&mut self) -> Result<Step<ImageDone>, StageError> {
        self.phase = match mem::replace(&mut self.phase, WritePhase::Spent) {
            WritePhase::Convert { frames } => WritePhase::Publish {
                bytes: frames.to_rgb8(),
                count: frames.count,
                height: frames.height,
                width: frames.width,
            },
            WritePhase::Publish {
                bytes,
                count,
                height,
                width,
            } => {
                let ticket = self.context.memory.write(&bytes);
                if ticket.is_miss() {
                    return Err(StageError::Publish(bytes.len()));
                }
                let control = &self.state.control;
                return Ok(Step::Emit(ImageDone {
                    version: control.version,
                    tags: control.tags.clone(),
                    looping: control.looping,
                    description: control.description.clone(),
                    width,
                    height,
                    count,
                    offset: ticket.offset,
                    size: ticket.size,
                    generation: ticket.generation,
                }));
            }
            WritePhase::Spent => unreachable!("write task advanced past completion"),
        };
        Ok(Step::Hold)
    }
}

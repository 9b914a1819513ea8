//! The five-stage image pipeline: read, extend, detail, interpolate, write.
//!
//! One OS thread per stage, one unbounded channel per edge. Detail owns the
//! two extra edges: the bypass straight to write for `full: false` requests,
//! and the feedback edge that makes its freshest frame the seed of the next
//! cycle.
mod steps;

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use color_eyre::eyre::eyre;
use derive_new::new;
use tracing::{debug, error, info};

use crate::clip::ClipCache;
use crate::control::Value;
use crate::memory::Memory;
use crate::models::ImageModels;
use crate::protocol::Console;
use crate::signal::Signals;
use crate::state::ImageState;
use crate::tensor::Image;
use crate::work::{self, Packet, StageError};

/// read → extend, also the feedback target.
type ExtendJob = (ImageState, Image);
/// extend → detail: (scaled, zoomed).
type DetailJob = (ImageState, Image, Image);
/// detail → interpolate: (scaled, decoded).
type InterpolateJob = (ImageState, Image, Image);
/// interpolate → write, or detail → write on the bypass edge.
type WriteJob = (ImageState, Image);

/// Everything a stage shares: resolved model handles, the prompt cache, the
/// payload ring and the scheduling signals.
#[derive(new, Clone)]
pub struct ImageContext {
    pub models: ImageModels,
    pub clips: Arc<ClipCache>,
    pub memory: Arc<Memory>,
    pub signals: Arc<Signals>,
}

/// Materializes the seed payload a state describes, in priority order:
/// inline base64, ring reference, disk file, solid frame. `None` means the
/// message carries no seed and is dropped.
fn seed_image(state: &ImageState, memory: &Memory) -> Result<Option<Image>, StageError> {
    let control = &state.control;
    if let Some(data) = &control.data {
        let bytes = BASE64
            .decode(data)
            .map_err(|e| StageError::Load(format!("inline payload: {e}")))?;
        let (height, width) = control.shape.unwrap_or((state.height, state.width));
        return Image::from_rgb8(&bytes, height, width)
            .map(Some)
            .ok_or_else(|| {
                StageError::Load(format!("inline payload is not {width}x{height} rgb frames"))
            });
    }
    if control.size > 0 && control.generation > 0 {
        let bytes = memory
            .read(control.offset, control.size, control.generation)
            .ok_or_else(|| {
                StageError::Load(format!(
                    "ring window {}+{} of generation {} expired",
                    control.offset, control.size, control.generation
                ))
            })?;
        let (height, width) = control.shape.unwrap_or((state.height, state.width));
        return Image::from_rgb8(&bytes, height, width)
            .map(Some)
            .ok_or_else(|| {
                StageError::Load(format!("ring payload is not {width}x{height} rgb frames"))
            });
    }
    if let Some(path) = &control.load {
        let decoded = ::image::open(path)
            .map_err(|e| StageError::Load(format!("'{path}': {e}")))?
            .to_rgb8();
        let (width, height) = decoded.dimensions();
        return Image::from_rgb8(decoded.as_raw(), height as usize, width as usize)
            .map(Some)
            .ok_or_else(|| StageError::Load(format!("'{path}' decoded to nothing")));
    }
    if control.empty {
        return Ok(Some(Image::solid(state.width, state.height, 0.0)));
    }
    Ok(None)
}

/// The only stage that touches stdin and the scheduling sets.
fn read(console: &Console, context: &ImageContext, send: &Sender<Packet<ExtendJob>>) {
    loop {
        let line = match console.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("control stream failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let state = match Value::parse_line(&line)
            .map_err(|e| e.to_string())
            .and_then(|value| ImageState::from_value(&value).map_err(|e| e.to_string()))
        {
            Ok(state) => state,
            Err(e) => {
                error!("control line rejected: {e}");
                continue;
            }
        };
        let control = &state.control;
        context
            .signals
            .update(&control.cancel, &control.pause, &control.resume);
        if control.stop {
            context.signals.halt_below(control.version);
        }
        if control.skip {
            continue;
        }
        match seed_image(&state, &context.memory) {
            Ok(Some(loaded)) => {
                let _ = send.send(Packet::Work((state, loaded)));
            }
            Ok(None) => debug!("version {} carries no seed, dropped", control.version),
            Err(e) => error!("seed for version {} unavailable: {e}", control.version),
        }
    }
    info!("control stream closed, image pipeline shutting down");
    context.signals.shut_down();
    let _ = send.send(Packet::Close);
}

fn extend(
    context: ImageContext,
    receive: Receiver<Packet<ExtendJob>>,
    send: Sender<Packet<DetailJob>>,
) {
    work::work(
        &receive,
        &context.signals,
        |(state, loaded)| Some(steps::ExtendTask::new(state, loaded, context.clone())),
        |(state, scaled, zoomed)| {
            let _ = send.send(Packet::Work((state, scaled, zoomed)));
        },
    );
    let _ = send.send(Packet::Close);
}

fn detail(
    context: ImageContext,
    receive: Receiver<Packet<DetailJob>>,
    send: Sender<Packet<InterpolateJob>>,
    write: Sender<Packet<WriteJob>>,
    feedback: Sender<Packet<ExtendJob>>,
) {
    work::work(
        &receive,
        &context.signals,
        |(state, scaled, zoomed)| {
            Some(steps::DetailTask::new(state, scaled, zoomed, context.clone()))
        },
        |(state, scaled, decoded): (ImageState, Image, Image)| {
            if state.control.full {
                let _ = send.send(Packet::Work((state.clone(), scaled, decoded.clone())));
            } else {
                // host asked for the detailed frame as-is
                let _ = write.send(Packet::Work((state.clone(), decoded.clone())));
            }

            if context.signals.is_shut_down() {
                return;
            }
            if let Some(next) = state.next.clone() {
                match state.merged(&next) {
                    Ok(merged) => {
                        let loaded = match seed_image(&merged, &context.memory) {
                            Ok(Some(image)) => image,
                            Ok(None) => decoded,
                            Err(e) => {
                                debug!("chained seed fell back to the detailed frame: {e}");
                                decoded
                            }
                        };
                        let _ = feedback.send(Packet::Work((merged, loaded)));
                    }
                    Err(e) => error!(
                        "chained state for version {} rejected: {e}",
                        state.control.version
                    ),
                }
            } else if state.control.looping {
                let _ = feedback.send(Packet::Work((state, decoded)));
            }
        },
    );
    // write's close comes from interpolate, the last producer standing;
    // dropping the feedback sender here is enough for the cycle
    let _ = send.send(Packet::Close);
}

fn interpolate(
    context: ImageContext,
    receive: Receiver<Packet<InterpolateJob>>,
    send: Sender<Packet<WriteJob>>,
) {
    work::work(
        &receive,
        &context.signals,
        |(state, scaled, decoded)| {
            Some(steps::InterpolateTask::new(
                state,
                scaled,
                decoded,
                context.clone(),
            ))
        },
        |(state, frames)| {
            let _ = send.send(Packet::Work((state, frames)));
        },
    );
    let _ = send.send(Packet::Close);
}

fn write(console: &Console, context: ImageContext, receive: Receiver<Packet<WriteJob>>) {
    work::work(
        &receive,
        &context.signals,
        |(state, frames)| Some(steps::WriteTask::new(state, frames, context.clone())),
        |done| console.emit(&done),
    );
}

/// Wires the queues, spawns one named thread per stage, and joins them.
/// Returns once stdin reaches EOF and every in-flight task has drained.
pub fn run(console: Arc<Console>, context: ImageContext) -> color_eyre::Result<()> {
    let (a_tx, a_rx) = mpsc::channel();
    let (b_tx, b_rx) = mpsc::channel();
    let (c_tx, c_rx) = mpsc::channel();
    let (d_tx, d_rx) = mpsc::channel();
    let feedback = a_tx.clone();
    let direct = d_tx.clone();

    let workers = vec![
        work::spawn("read", {
            let console = Arc::clone(&console);
            let context = context.clone();
            move || read(&console, &context, &a_tx)
        })?,
        work::spawn("extend", {
            let context = context.clone();
            move || extend(context, a_rx, b_tx)
        })?,
        work::spawn("detail", {
            let context = context.clone();
            move || detail(context, b_rx, c_tx, direct, feedback)
        })?,
        work::spawn("interpolate", {
            let context = context.clone();
            move || interpolate(context, c_rx, d_tx)
        })?,
        work::spawn("write", move || write(&console, context, d_rx))?,
    ];
    for worker in workers {
        worker.join().map_err(|_| eyre!("image worker panicked"))?;
    }
    Ok(())
}

//! The three-stage sound pipeline: read, process, write.
//!
//! Looping works differently here than for images: a `loop` request feeds
//! its own clip straight back into the process queue, so the music continues
//! itself without a host round-trip.
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use color_eyre::eyre::eyre;
use derive_new::new;
use tracing::{debug, error, info};

use crate::control::Value;
use crate::memory::Memory;
use crate::models::SoundModels;
use crate::protocol::{Console, SoundDone};
use crate::signal::Signals;
use crate::state::SoundState;
use crate::tensor::Clip;
use crate::work::{self, Packet, StageError, Step, Task};

/// read → process, also the self-loop target. `None` is a cold start.
type ProcessJob = (SoundState, Option<Clip>);
type WriteJob = (SoundState, Clip);

#[derive(new, Clone)]
pub struct SoundContext {
    pub models: SoundModels,
    pub memory: Arc<Memory>,
    pub signals: Arc<Signals>,
}

/// Continuation window in samples: the clip tail the next clip grows out of.
fn overlap_samples(state: &SoundState, rate: u32) -> usize {
    (f64::from(state.duration) * f64::from(state.overlap) * f64::from(rate)).ceil() as usize
}

fn seed_clip(state: &SoundState, memory: &Memory) -> Result<Option<Clip>, StageError> {
    let control = &state.control;
    if let Some(data) = &control.data {
        let bytes = BASE64
            .decode(data)
            .map_err(|e| StageError::Load(format!("inline payload: {e}")))?;
        return Clip::from_f32_bytes(&bytes)
            .map(Some)
            .ok_or_else(|| StageError::Load("inline payload is not f32 samples".into()));
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
        return Clip::from_f32_bytes(&bytes)
            .map(Some)
            .ok_or_else(|| StageError::Load("ring payload is not f32 samples".into()));
    }
    Ok(None)
}

fn read(console: &Console, context: &SoundContext, send: &Sender<Packet<ProcessJob>>) {
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
            .and_then(|value| SoundState::from_value(&value).map_err(|e| e.to_string()))
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
        match seed_clip(&state, &context.memory) {
            Ok(Some(loaded)) => {
                let _ = send.send(Packet::Work((state, Some(loaded))));
            }
            // a cold start needs an explicit opt-in
            Ok(None) if control.empty => {
                let _ = send.send(Packet::Work((state, None)));
            }
            Ok(None) => debug!("version {} carries no seed, dropped", control.version),
            Err(e) => error!("seed for version {} unavailable: {e}", control.version),
        }
    }
    info!("control stream closed, sound pipeline shutting down");
    context.signals.shut_down();
    let _ = send.send(Packet::Close);
}

struct ProcessTask {
    state: SoundState,
    context: SoundContext,
    phase: ProcessPhase,
}

enum ProcessPhase {
    Warm { loaded: Option<Clip> },
    Generate { loaded: Option<Clip> },
    Spent,
}

impl Task for ProcessTask {
    type Output = (SoundState, Clip);

    fn version(&self) -> u64 {
        self.state.control.version
    }

    fn advance(&mut self) -> Result<Step<Self::Output>, StageError> {
        self.phase = match std::mem::replace(&mut self.phase, ProcessPhase::Spent) {
            ProcessPhase::Warm { loaded } => ProcessPhase::Generate { loaded },
            ProcessPhase::Generate { loaded } => {
                let musician = self.context.models.musician.as_ref();
                let state = &self.state;
                let clip = match loaded {
                    None => musician.generate(&state.prompts, state.duration)?,
                    Some(prior) => {
                        let rate = musician.sample_rate();
                        let tail = prior.tail(overlap_samples(state, rate));
                        musician.generate_continuation(
                            &tail,
                            rate,
                            &state.prompts,
                            state.duration,
                        )?
                    }
                };
                return Ok(Step::Emit((self.state.clone(), clip)));
            }
            ProcessPhase::Spent => unreachable!("process task advanced past completion"),
        };
        Ok(Step::Hold)
    }
}

fn process(
    context: SoundContext,
    receive: Receiver<Packet<ProcessJob>>,
    reinject: Sender<Packet<ProcessJob>>,
    send: Sender<Packet<WriteJob>>,
) {
    work::work(
        &receive,
        &context.signals,
        |(state, loaded)| {
            Some(ProcessTask {
                state,
                context: context.clone(),
                phase: ProcessPhase::Warm { loaded },
            })
        },
        |(state, clip): (SoundState, Clip)| {
            let _ = send.send(Packet::Work((state.clone(), clip.clone())));
            // the fresh clip seeds its own continuation
            if state.control.looping && !context.signals.is_shut_down() {
                let _ = reinject.send(Packet::Work((state, Some(clip))));
            }
        },
    );
    let _ = send.send(Packet::Close);
}

struct SoundWriteTask {
    state: SoundState,
    context: SoundContext,
    phase: SoundWritePhase,
}

enum SoundWritePhase {
    Convert { clip: Clip },
    Publish { bytes: Vec<u8>, clip: Clip },
    Spent,
}

impl Task for SoundWriteTask {
    type Output = SoundDone;

    fn version(&self) -> u64 {
        self.state.control.version
    }

    fn advance(&mut self) -> Result<Step<SoundDone>, StageError> {
        self.phase = match std::mem::replace(&mut self.phase, SoundWritePhase::Spent) {
            SoundWritePhase::Convert { clip } => SoundWritePhase::Publish {
                bytes: clip.to_f32_bytes(),
                clip,
            },
            SoundWritePhase::Publish { bytes, clip } => {
                let ticket = self.context.memory.write(&bytes);
                if ticket.is_miss() {
                    return Err(StageError::Publish(bytes.len()));
                }
                let control = &self.state.control;
                return Ok(Step::Emit(SoundDone {
                    version: control.version,
                    tags: control.tags.clone(),
                    looping: control.looping,
                    description: control.description.clone(),
                    overlap: self.state.overlap,
                    rate: self.context.models.musician.sample_rate(),
                    samples: clip.samples,
                    channels: clip.channels,
                    count: clip.count,
                    offset: ticket.offset,
                    size: ticket.size,
                    generation: ticket.generation,
                }));
            }
            SoundWritePhase::Spent => unreachable!("sound write task advanced past completion"),
        };
        Ok(Step::Hold)
    }
}

fn write(console: &Console, context: SoundContext, receive: Receiver<Packet<WriteJob>>) {
    work::work(
        &receive,
        &context.signals,
        |(state, clip)| {
            Some(SoundWriteTask {
                state,
                context: context.clone(),
                phase: SoundWritePhase::Convert { clip },
            })
        },
        |done| console.emit(&done),
    );
}

/// Wires the queues, spawns the three stage threads, joins them.
pub fn run(console: Arc<Console>, context: SoundContext) -> color_eyre::Result<()> {
    let (a_tx, a_rx) = mpsc::channel();
    let (b_tx, b_rx) = mpsc::channel();
    let reinject = a_tx.clone();

    let workers = vec![
        work::spawn("read", {
            let console = Arc::clone(&console);
            let context = context.clone();
            move || read(&console, &context, &a_tx)
        })?,
        work::spawn("process", {
            let context = context.clone();
            move || process(context, a_rx, reinject, b_tx)
        })?,
        work::spawn("write", move || write(&console, context, b_rx))?,
    ];
    for worker in workers {
        worker.join().map_err(|_| eyre!("sound worker panicked"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn context() -> (tempfile::TempDir, SoundContext) {
        let dir = tempdir().unwrap();
        let memory =
            Arc::new(Memory::with_options(dir.path().join("ring"), 1 << 22, 8, 0).unwrap());
        (
            dir,
            SoundContext::new(SoundModels::builtin(), memory, Arc::new(Signals::new())),
        )
    }

    fn state(version: u64) -> SoundState {
        let mut state = SoundState::default();
        state.control.version = version;
        state.control.empty = true;
        state.prompts = vec!["calm".into()];
        state.duration = 0.01;
        state.overlap = 0.5;
        state
    }

    #[test]
    fn test_overlap_samples_rounds_up() {
        let mut s = state(1);
        s.duration = 10.0;
        s.overlap = 0.5;
        assert_eq!(overlap_samples(&s, 32000), 160000);
        s.duration = 0.0001;
        assert_eq!(overlap_samples(&s, 32000), 2);
    }

    #[test]
    fn test_seed_clip_inline_and_ring() {
        let (_dir, context) = context();
        let clip = Clip::new(1, 1, 4, vec![0.1, 0.2, 0.3, 0.4]);
        let mut s = state(1);
        s.control.data = Some(BASE64.encode(clip.to_f32_bytes()));
        assert_eq!(seed_clip(&s, &context.memory).unwrap(), Some(clip.clone()));

        let ticket = context.memory.write(&clip.to_f32_bytes());
        let mut s = state(2);
        s.control.offset = ticket.offset;
        s.control.size = ticket.size;
        s.control.generation = ticket.generation;
        assert_eq!(seed_clip(&s, &context.memory).unwrap(), Some(clip));
    }

    #[test]
    fn test_seed_clip_absent() {
        let (_dir, context) = context();
        assert_eq!(seed_clip(&state(1), &context.memory).unwrap(), None);
    }

    #[test]
    fn test_loop_reinjects_continuation_with_overlap_tail() {
        let (_dir, context) = context();
        let (a_tx, a_rx) = mpsc::channel();
        let (b_tx, b_rx) = mpsc::channel();
        let reinject = a_tx.clone();
        let mut s = state(1);
        s.control.looping = true;
        a_tx.send(Packet::Work((s, None))).unwrap();

        let worker = {
            let context = context.clone();
            std::thread::spawn(move || process(context, a_rx, reinject, b_tx))
        };

        let recv = |label: &str| match b_rx.recv_timeout(Duration::from_secs(10)) {
            Ok(Packet::Work(job)) => job,
            other => panic!("expected {label}, got {other:?}"),
        };
        let (_, first) = recv("cold clip");
        // a second clip arrives with no further input: the self-loop fed it
        let (_, second) = recv("self-continued clip");

        context.signals.shut_down();
        a_tx.send(Packet::Close).unwrap();
        drop(a_tx);
        worker.join().unwrap();

        let samples = (0.01f32 * 32000.0).ceil() as usize;
        assert_eq!(first.samples, samples);
        assert_eq!(second.samples, samples);
        // the continuation starts exactly where the seed window began
        let keep = samples / 2;
        let joint = first.data()[first.samples - keep];
        assert!((second.data()[0] - joint).abs() < 1e-5);
    }

    #[test]
    fn test_pipeline_cold_start_publishes_one_clip() {
        let (_dir, context) = context();
        let sink = crate::protocol::testing::Sink::default();
        let script = "{'version': 1, 'empty': True, 'prompts': ['calm'], \
                      'duration': 0.01, 'overlap': 0.5, 'loop': False}\n";
        let console = Arc::new(Console::new(
            std::io::Cursor::new(script.to_string()),
            sink.clone(),
        ));
        run(console, context.clone()).unwrap();

        let lines: Vec<serde_json::Value> = sink
            .take()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 1);
        let done = &lines[0];
        assert_eq!(done["version"], 1);
        assert_eq!(done["rate"], 32000);
        assert_eq!(done["samples"], 320);
        assert_eq!(done["channels"], 1);
        let size = done["size"].as_u64().unwrap() as usize;
        assert_eq!(size, 320 * 4);
        let bytes = context
            .memory
            .read(
                done["offset"].as_u64().unwrap() as usize,
                size,
                done["generation"].as_u64().unwrap(),
            )
            .unwrap();
        assert_eq!(bytes.len(), size);
    }

    #[test]
    fn test_write_publishes_and_reports() {
        let (_dir, context) = context();
        let clip = Clip::new(1, 1, 8, vec![0.5; 8]);
        let mut task = SoundWriteTask {
            state: state(3),
            context: context.clone(),
            phase: SoundWritePhase::Convert { clip: clip.clone() },
        };
        let done = loop {
            match task.advance().unwrap() {
                Step::Hold => {}
                Step::Emit(done) => break done,
            }
        };
        assert_eq!(done.version, 3);
        assert_eq!(done.rate, 32000);
        assert_eq!((done.samples, done.channels, done.count), (8, 1, 1));
        let bytes = context
            .memory
            .read(done.offset, done.size, done.generation)
            .unwrap();
        assert_eq!(Clip::from_f32_bytes(&bytes), Some(clip));
    }
}

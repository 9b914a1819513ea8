//! Cooperative scheduler shared by every worker stage.
//!
//! A stage turns each incoming message into a [`Task`]: a phase machine that
//! is advanced one step per drain round. Between steps the scheduler checks
//! the cancel/pause sets, so a cancelled version dies at its next step and a
//! paused one rotates on the FIFO without burning compute.
use std::collections::VecDeque;
use std::io;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, warn};

use crate::clip::CacheError;
use crate::models::ModelError;
use crate::signal::Signals;

/// Poll interval for ingest while tasks are pending. With an empty FIFO the
/// ingest blocks instead.
pub const WAIT: Duration = Duration::from_millis(100);

/// Envelope on every forward edge. `Close` travels once, after the last
/// message; the feedback cycle means sender-drop alone cannot end the graph.
#[derive(Debug)]
pub enum Packet<T> {
    Work(T),
    Close,
}

/// One advancement of a task's phase machine.
#[derive(Debug)]
pub enum Step<T> {
    /// Cooperative yield point; check signals, come back next round.
    Hold,
    /// Terminal output for this task.
    Emit(T),
}

/// Recoverable per-task failure. The task is logged and dropped; the worker
/// keeps running and downstream simply never hears about the version.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("Seed payload could not be loaded: {0}")]
    Load(String),
    #[error("Ring write failed for {0} bytes")]
    Publish(usize),
}

pub trait Task {
    type Output;

    fn version(&self) -> u64;
    fn advance(&mut self) -> Result<Step<Self::Output>, StageError>;
}

/// Spawns one named worker thread.
pub fn spawn(
    name: &str,
    body: impl FnOnce() + Send + 'static,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name(name.to_string()).spawn(body)
}

/// Runs one worker's scheduling loop until the upstream edge closes and all
/// tasks have drained.
///
/// `begin` turns a message into a task (`None` drops the message, already
/// logged by the caller); `finish` publishes a completed task's output.
pub fn work<M, T>(
    receive: &Receiver<Packet<M>>,
    signals: &Signals,
    mut begin: impl FnMut(M) -> Option<T>,
    mut finish: impl FnMut(T::Output),
) where
    T: Task,
{
    let mut tasks: VecDeque<T> = VecDeque::new();
    let mut open = true;
    loop {
        if open {
            let received = if tasks.is_empty() {
                receive
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected)
            } else {
                receive.recv_timeout(WAIT)
            };
            match received {
                Ok(Packet::Work(message)) => {
                    if let Some(task) = begin(message) {
                        tasks.push_back(task);
                    }
                }
                Ok(Packet::Close) | Err(RecvTimeoutError::Disconnected) => open = false,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        if !open && tasks.is_empty() {
            return;
        }

        // Snapshot the FIFO length so tasks re-enqueued this round wait for
        // the next one; ingest never starves.
        let mut progressed = false;
        for _ in 0..tasks.len() {
            let mut task = match tasks.pop_front() {
                Some(task) => task,
                None => break,
            };
            let version = task.version();
            if signals.cancelled(version) {
                continue;
            }
            if signals.paused(version) {
                tasks.push_back(task);
                continue;
            }
            progressed = true;
            match task.advance() {
                Ok(Step::Hold) => tasks.push_back(task),
                Ok(Step::Emit(output)) => finish(output),
                Err(e) => error!("task for version {version} dropped: {e}"),
            }
        }

        // Upstream is gone and nothing can move: whatever is left is paused
        // and resume lines can no longer arrive.
        if !open && !progressed {
            if !tasks.is_empty() {
                warn!("dropping {} paused tasks at shutdown", tasks.len());
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Counts down `holds` yield points, then emits its version.
    struct Countdown {
        version: u64,
        holds: u32,
        fail: bool,
    }

    impl Task for Countdown {
        type Output = u64;

        fn version(&self) -> u64 {
            self.version
        }

        fn advance(&mut self) -> Result<Step<u64>, StageError> {
            if self.fail {
                return Err(StageError::Load("boom".into()));
            }
            if self.holds == 0 {
                Ok(Step::Emit(self.version))
            } else {
                self.holds -= 1;
                Ok(Step::Hold)
            }
        }
    }

    fn run(
        signals: &Signals,
        messages: Vec<Countdown>,
    ) -> Vec<u64> {
        let (tx, rx) = mpsc::channel();
        for message in messages {
            tx.send(Packet::Work(message)).unwrap();
        }
        tx.send(Packet::Close).unwrap();
        let mut done = Vec::new();
        work(&rx, signals, Some, |v| done.push(v));
        done
    }

    #[test]
    fn test_tasks_complete_in_fifo_order() {
        let signals = Signals::new();
        let done = run(
            &signals,
            vec![
                Countdown { version: 1, holds: 2, fail: false },
                Countdown { version: 2, holds: 2, fail: false },
            ],
        );
        assert_eq!(done, vec![1, 2]);
    }

    #[test]
    fn test_paused_task_is_overtaken_then_resumed() {
        let signals = Signals::new();
        signals.update(&[], &[1], &[]);
        let (tx, rx) = mpsc::channel();
        tx.send(Packet::Work(Countdown { version: 1, holds: 0, fail: false }))
            .unwrap();
        tx.send(Packet::Work(Countdown { version: 2, holds: 0, fail: false }))
            .unwrap();
        let mut done = Vec::new();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                // let version 2 overtake, then release version 1
                std::thread::sleep(WAIT * 2);
                signals.update(&[], &[], &[1]);
                tx.send(Packet::Close).unwrap();
            });
            work(&rx, &signals, Some, |v| done.push(v));
        });
        assert_eq!(done, vec![2, 1]);
    }

    #[test]
    fn test_cancelled_task_never_finishes() {
        let signals = Signals::new();
        signals.update(&[1], &[], &[]);
        let done = run(
            &signals,
            vec![
                Countdown { version: 1, holds: 5, fail: false },
                Countdown { version: 2, holds: 0, fail: false },
            ],
        );
        assert_eq!(done, vec![2]);
    }

    #[test]
    fn test_failed_task_is_dropped_not_fatal() {
        let signals = Signals::new();
        let done = run(
            &signals,
            vec![
                Countdown { version: 1, holds: 0, fail: true },
                Countdown { version: 2, holds: 0, fail: false },
            ],
        );
        assert_eq!(done, vec![2]);
    }

    #[test]
    fn test_paused_leftovers_dropped_at_close() {
        let signals = Signals::new();
        signals.update(&[], &[1], &[]);
        let done = run(
            &signals,
            vec![Countdown { version: 1, holds: 0, fail: false }],
        );
        assert!(done.is_empty());
    }

    #[test]
    fn test_begin_can_drop_messages() {
        let signals = Signals::new();
        let (tx, rx) = mpsc::channel();
        tx.send(Packet::Work(7u64)).unwrap();
        tx.send(Packet::Work(8u64)).unwrap();
        tx.send(Packet::Close).unwrap();
        let mut done = Vec::new();
        work(
            &rx,
            &signals,
            |v| {
                (v % 2 == 0).then_some(Countdown { version: v, holds: 0, fail: false })
            },
            |v| done.push(v),
        );
        assert_eq!(done, vec![8]);
    }
}

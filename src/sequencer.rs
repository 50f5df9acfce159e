//! Task Sequencer
//!
//! Runs a queue of asynchronous steps and reports one joint completion.
//!
//! Each queued unit is a closure handed a [`Completion`]. The unit starts
//! whatever work it needs (usually a spawned task) and signals the completion
//! when that work is finished. The sequencer only ever learns "done"; if a unit
//! can fail, the unit itself records the failure somewhere the caller can see.
//!
//! # Dispatch disciplines
//!
//! - **Sequential**: the next unit is dispatched only after this one signals.
//! - **Eager**: the next unit is dispatched right after this one is dispatched,
//!   so a run of eager units fans out while still completing once.
//!
//! ```ignore
//! let sequencer = TaskSequencer::new();
//! for name in names {
//!     let client = client.clone();
//!     sequencer.queue_future(Dispatch::Eager, async move {
//!         let _ = client.container(&name).await;
//!     });
//! }
//! sequencer.complete().await?;
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequencerError {
    #[error("A task sequencer run is already in progress")]
    AlreadyRunning,
}

/// How a queued unit hands over to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    #[default]
    Sequential,
    Eager,
}

type Action = Box<dyn FnOnce(Completion) + Send + 'static>;
type OnDone = Box<dyn FnOnce() + Send + 'static>;

struct QueuedTask {
    action: Action,
    dispatch: Dispatch,
}

#[derive(Default)]
struct RunState {
    pending: VecDeque<QueuedTask>,
    /// Units expected to complete in the active run
    todo: usize,
    /// Units that have completed in the active run
    done: usize,
    on_done: Option<OnDone>,
    running: bool,
    /// A `dispatch_next` loop is on some stack
    dispatching: bool,
    /// A sequential unit signalled while the loop was still on the stack
    resume: bool,
}

/// Queue of dependent asynchronous steps with one joint completion.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone, Default)]
pub struct TaskSequencer {
    state: Arc<Mutex<RunState>>,
}

impl TaskSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a unit. Units queued during an active run join that run.
    pub fn queue<F>(&self, dispatch: Dispatch, action: F)
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        let mut state = lock(&self.state);
        state.pending.push_back(QueuedTask {
            action: Box::new(action),
            dispatch,
        });
        if state.running {
            state.todo += 1;
        }
    }

    /// Append a unit whose work is a future. The future is spawned on the
    /// current tokio runtime when dispatched and completes the unit when it
    /// finishes.
    pub fn queue_future<Fut>(&self, dispatch: Dispatch, future: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.queue(dispatch, move |completion| {
            tokio::spawn(async move {
                future.await;
                completion.finish();
            });
        });
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Number of units waiting to be dispatched.
    pub fn pending(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Dispatch every queued unit once and call `on_done` once after all of
    /// them have signalled.
    ///
    /// An empty queue calls `on_done` before returning.
    ///
    /// # Errors
    /// `AlreadyRunning` if a previous run on this sequencer is unfinished.
    /// The active run is left untouched.
    pub fn run<F>(&self, on_done: F) -> Result<(), SequencerError>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = lock(&self.state);
            if state.running {
                return Err(SequencerError::AlreadyRunning);
            }

            if state.pending.is_empty() {
                drop(state);
                on_done();
                return Ok(());
            }

            state.running = true;
            state.todo = state.pending.len();
            state.done = 0;
            state.on_done = Some(Box::new(on_done));
            trace!(units = state.todo, "Task sequencer run started");
        }

        self.dispatch_next();
        Ok(())
    }

    /// Run the queue and wait for the joint completion.
    pub async fn complete(&self) -> Result<(), SequencerError> {
        let (tx, rx) = oneshot::channel();
        self.run(move || {
            let _ = tx.send(());
        })?;
        // The sender lives in the run state until on_done fires.
        let _ = rx.await;
        Ok(())
    }

    /// Dispatch units until one that must finish before its successor.
    ///
    /// Only one loop runs at a time. A sequential unit that signals while the
    /// loop is still on the stack leaves a resume marker instead of
    /// recursing, so synchronous units run in constant stack depth.
    fn dispatch_next(&self) {
        {
            let mut state = lock(&self.state);
            if state.dispatching {
                state.resume = true;
                return;
            }
            state.dispatching = true;
        }

        loop {
            let task = {
                let mut state = lock(&self.state);
                state.resume = false;
                let next = if state.running {
                    state.pending.pop_front()
                } else {
                    None
                };
                match next {
                    Some(task) => task,
                    None => {
                        state.dispatching = false;
                        return;
                    }
                }
            };

            let completion = Completion {
                state: Some(Arc::clone(&self.state)),
                dispatch: task.dispatch,
            };
            // No lock is held here; the action may signal synchronously.
            (task.action)(completion);

            if task.dispatch == Dispatch::Sequential {
                let mut state = lock(&self.state);
                if !state.resume {
                    state.dispatching = false;
                    return;
                }
            }
        }
    }
}

/// One-shot "done" signal handed to a queued unit.
///
/// Dropping a completion without calling [`Completion::finish`] counts as
/// completion, so a unit that bails out early cannot stall the run.
pub struct Completion {
    state: Option<Arc<Mutex<RunState>>>,
    dispatch: Dispatch,
}

impl Completion {
    pub fn finish(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };

        let mut guard = lock(&state);
        if !guard.running {
            return;
        }
        guard.done += 1;

        if guard.done >= guard.todo {
            guard.running = false;
            guard.todo = 0;
            guard.done = 0;
            let on_done = guard.on_done.take();
            drop(guard);
            trace!("Task sequencer run complete");
            if let Some(on_done) = on_done {
                on_done();
            }
        } else {
            drop(guard);
            if self.dispatch == Dispatch::Sequential {
                TaskSequencer { state }.dispatch_next();
            }
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.signal();
    }
}

fn lock(state: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
    // Poisoning only happens if an on_done callback panicked; the counters
    // themselves are always consistent when the lock is released.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

//! The task-dispatcher collaborator boundary.
//!
//! The engine depends only on the ability to enqueue a completion event to
//! a task and to attach/detach task references (§1, out of scope). This
//! module defines that seam as traits, plus [`ChannelDispatcher`]: a small
//! channel-backed reference implementation, sufficient to drive the
//! engine's own test suite and for callers with no richer scheduler of
//! their own.

use std::fmt;
use std::sync::mpsc::{Receiver, SendError, Sender};
use std::sync::{Arc, Mutex};

use crate::request::CompletionEvent;

/// An opaque, cloneable reference to a task that can receive completion
/// events. Cloning models "attach"; dropping the last clone models
/// "detach" — queued requests and in-flight internal events each hold
/// their own clone for exactly as long as the C original would hold an
/// attached reference.
pub trait TaskHandle: fmt::Debug + Send + Sync {
    /// A stable identity used by `cancel(task, ...)` to match queued
    /// requests against the task that submitted them.
    fn id(&self) -> u64;

    /// Downcasting hook so a [`TaskDispatcher`] implementation can recover
    /// its own concrete handle type. Trait-object upcasting to `dyn Any`
    /// is not available on this crate's MSRV, so each implementation
    /// threads it through explicitly.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// The task dispatcher itself: accepts completion events addressed to a
/// task and arranges for their action to run on some worker.
pub trait TaskDispatcher: fmt::Debug + Send + Sync {
    /// Enqueue `event` for `task`. The dispatcher owns scheduling; this
    /// call must not block the caller on the event's action running.
    fn send(&self, task: &dyn TaskHandle, event: CompletionEvent);
}

/// A trivial task handle identified by an incrementing counter, good
/// enough for tests and for single-process embeddings that do not need a
/// richer task model.
#[derive(Debug, Clone)]
pub struct ChannelTask {
    id: u64,
    sender: Sender<CompletionEvent>,
}

impl TaskHandle for ChannelTask {
    fn id(&self) -> u64 {
        self.id
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// A [`TaskDispatcher`] backed by an `mpsc` channel per task. `send`
/// delivers directly into the addressed task's channel; nothing here
/// invokes a completion "action" — callers drain their own
/// [`ChannelTask::receiver`] (held separately, see [`ChannelDispatcher::spawn_task`]).
#[derive(Debug, Default)]
pub struct ChannelDispatcher {
    next_id: Mutex<u64>,
}

impl ChannelDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(ChannelDispatcher {
            next_id: Mutex::new(0),
        })
    }

    /// Creates a new task and returns its handle along with the receiving
    /// end of its completion channel.
    pub fn spawn_task(&self) -> (ChannelTask, Receiver<CompletionEvent>) {
        let mut guard = self.next_id.lock().unwrap();
        let id = *guard;
        *guard += 1;
        let (sender, receiver) = std::sync::mpsc::channel();
        (ChannelTask { id, sender }, receiver)
    }
}

impl TaskDispatcher for ChannelDispatcher {
    fn send(&self, task: &dyn TaskHandle, event: CompletionEvent) {
        // `ChannelTask` is the only implementation this dispatcher knows
        // how to address; anything else is a caller bug, logged rather
        // than panicking since a dropped receiver is a normal shutdown
        // race, not a programming error on the engine's side.
        if let Some(task) = task.as_any().downcast_ref::<ChannelTask>() {
            if let Err(SendError(event)) = task.sender.send(event) {
                tracing::debug!(task = task_id(task), ?event, "completion dropped: task gone");
            }
        } else {
            tracing::warn!("ChannelDispatcher::send given a non-ChannelTask handle");
        }
    }
}

fn task_id(task: &ChannelTask) -> u64 {
    task.id
}

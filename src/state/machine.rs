//! State machine engine.
//!
//! Every controller is a [`Machine`] driven by a single tokio task that owns
//! its mailbox. Events are processed one at a time, in arrival order. A
//! transition may launch an async task; the task's result comes back through
//! the same mailbox as an ordinary input, so the machine never re-enters
//! itself.
//!
//! ```text
//!  send/dispatch ──▶ mailbox ──▶ on_event ──▶ commit ──▶ watch (snapshot)
//!                       ▲                        │
//!                       │                        └──▶ spawn task
//!                       └────── on_done ◀──────────────────┘
//! ```
//!
//! A commit publishes the state vector, the context and the derived state
//! path set together, so readers never see one without the others.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// A boxed, sendable future.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Called after every commit, on the machine's task.
pub type Observer<M> = Box<dyn Fn(&Snapshot<M>) + Send + Sync>;

/// A state vector: one tag per orthogonal region.
pub trait StateVector: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Every active state path, parents included
    /// (`"Initialized"`, `"Initialized.True"`, ...).
    fn paths(&self) -> BTreeSet<String>;
}

/// Expand a region's active branch into its path strings.
///
/// `region_paths("Phase", &["InProgress", "Guessing"])` yields
/// `Phase`, `Phase.InProgress` and `Phase.InProgress.Guessing`.
pub fn region_paths(region: &str, branch: &[&str]) -> Vec<String> {
    let mut paths = Vec::with_capacity(branch.len() + 1);
    let mut current = region.to_string();
    paths.push(current.clone());
    for segment in branch {
        current.push('.');
        current.push_str(segment);
        paths.push(current.clone());
    }
    paths
}

/// The outcome of handling one input.
pub struct Step<M: Machine> {
    pub state: M::State,
    pub context: M::Context,
    invoke: Option<BoxFuture<Result<M::Output, M::Failure>>>,
}

impl<M: Machine> Step<M> {
    pub fn new(state: M::State, context: M::Context) -> Self {
        Self {
            state,
            context,
            invoke: None,
        }
    }

    /// Launch `task` once this step commits.
    pub fn invoke<F>(mut self, task: F) -> Self
    where
        F: Future<Output = Result<M::Output, M::Failure>> + Send + 'static,
    {
        self.invoke = Some(Box::pin(task));
        self
    }
}

/// Behaviour of one machine.
///
/// Handlers receive the committed state and context and return a complete
/// replacement, so a rejected event leaves nothing behind.
pub trait Machine: Sized + Send + 'static {
    type State: StateVector;
    type Context: Clone + fmt::Debug + Send + Sync + 'static;
    type Event: fmt::Debug + Send + 'static;
    type Output: Send + 'static;
    type Failure: fmt::Display + Send + 'static;

    /// Name used in logs.
    fn name(&self) -> String;

    fn initial(&self) -> (Self::State, Self::Context);

    /// Handle an external event. `Ok(None)` accepts the event without a
    /// transition; `Err` rejects it with a reason.
    fn on_event(
        &mut self,
        state: &Self::State,
        context: &Self::Context,
        event: Self::Event,
    ) -> Result<Option<Step<Self>>, &'static str>;

    /// Handle the completion of an invoked task.
    fn on_done(
        &mut self,
        state: &Self::State,
        context: &Self::Context,
        result: Result<Self::Output, Self::Failure>,
    ) -> Option<Step<Self>>;
}

/// A committed machine state.
pub struct Snapshot<M: Machine> {
    pub state: M::State,
    pub context: M::Context,
    /// Active state paths, always derived from `state` in the same commit.
    pub paths: BTreeSet<String>,
    /// Number of commits so far; the initial state is version 0.
    pub version: u64,
}

impl<M: Machine> Snapshot<M> {
    pub fn matches(&self, path: &str) -> bool {
        self.paths.contains(path)
    }
}

impl<M: Machine> fmt::Debug for Snapshot<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("state", &self.state)
            .field("context", &self.context)
            .field("paths", &self.paths)
            .field("version", &self.version)
            .finish()
    }
}

/// An event that is not legal in the current state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid transition from {from:?} via {event}: {reason}")]
pub struct InvalidTransition {
    pub from: BTreeSet<String>,
    pub event: String,
    pub reason: &'static str,
}

/// Errors from talking to a machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MachineError {
    #[error(transparent)]
    Rejected(#[from] InvalidTransition),

    #[error("timed out after {waited:?} waiting for state")]
    Timeout { waited: Duration },

    #[error("machine stopped")]
    Stopped,
}

enum Input<M: Machine> {
    Event {
        event: M::Event,
        reply: Option<oneshot::Sender<Result<Arc<Snapshot<M>>, InvalidTransition>>>,
    },
    Done(Result<M::Output, M::Failure>),
    Stop,
}

/// Handle to a running machine. Cheap to clone.
pub struct MachineHandle<M: Machine> {
    name: Arc<str>,
    mailbox: mpsc::Sender<Input<M>>,
    state: watch::Receiver<Arc<Snapshot<M>>>,
}

impl<M: Machine> Clone for MachineHandle<M> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            mailbox: self.mailbox.clone(),
            state: self.state.clone(),
        }
    }
}

impl<M: Machine> fmt::Debug for MachineHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineHandle")
            .field("name", &self.name)
            .field("version", &self.state.borrow().version)
            .finish()
    }
}

impl<M: Machine> MachineHandle<M> {
    /// Start `machine` on the current tokio runtime. The initial state is
    /// published before this returns.
    pub fn spawn(machine: M, capacity: usize) -> Self {
        Self::spawn_observed(machine, capacity, None)
    }

    /// Like [`spawn`](Self::spawn), calling `observer` after every commit
    /// (including the initial state).
    pub fn spawn_observed(machine: M, capacity: usize, observer: Option<Observer<M>>) -> Self {
        let name: Arc<str> = Arc::from(machine.name());
        let (state, context) = machine.initial();
        let initial = Arc::new(Snapshot {
            paths: state.paths(),
            state,
            context,
            version: 0,
        });
        if let Some(observer) = &observer {
            observer(&initial);
        }

        let (mailbox, inbox) = mpsc::channel(capacity.max(1));
        let (publisher, state) = watch::channel(initial);

        let runner = Runner {
            name: Arc::clone(&name),
            machine,
            inbox,
            mailbox: mailbox.downgrade(),
            publisher,
            observer,
        };
        tokio::spawn(runner.run());

        Self {
            name,
            mailbox,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The latest committed snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot<M>> {
        Arc::clone(&self.state.borrow())
    }

    /// Receiver that sees every committed snapshot (latest wins).
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot<M>>> {
        self.state.clone()
    }

    /// Queue an event without waiting for it to be processed. Rejections are
    /// logged and dropped.
    pub async fn send(&self, event: M::Event) -> Result<(), MachineError> {
        self.mailbox
            .send(Input::Event { event, reply: None })
            .await
            .map_err(|_| MachineError::Stopped)
    }

    /// Queue an event and wait until it has been processed. Returns the
    /// snapshot current after the event, or the rejection.
    pub async fn dispatch(&self, event: M::Event) -> Result<Arc<Snapshot<M>>, MachineError> {
        let (reply, response) = oneshot::channel();
        self.mailbox
            .send(Input::Event {
                event,
                reply: Some(reply),
            })
            .await
            .map_err(|_| MachineError::Stopped)?;
        match response.await {
            Ok(result) => result.map_err(MachineError::from),
            Err(_) => Err(MachineError::Stopped),
        }
    }

    /// Wait until a committed snapshot satisfies `predicate`, for at most
    /// `timeout`.
    pub async fn wait_for<P>(&self, predicate: P, timeout: Duration) -> Result<Arc<Snapshot<M>>, MachineError>
    where
        P: Fn(&Snapshot<M>) -> bool,
    {
        let mut state = self.state.clone();
        let waiting = async move {
            loop {
                let current = Arc::clone(&state.borrow_and_update());
                if predicate(&current) {
                    return Ok(current);
                }
                if state.changed().await.is_err() {
                    // Publisher gone: the last value is final.
                    let last = Arc::clone(&state.borrow());
                    return if predicate(&last) {
                        Ok(last)
                    } else {
                        Err(MachineError::Stopped)
                    };
                }
            }
        };
        tokio::time::timeout(timeout, waiting)
            .await
            .map_err(|_| MachineError::Timeout { waited: timeout })?
    }

    /// Ask the machine to stop after the events already queued.
    pub async fn stop(&self) {
        let _ = self.mailbox.send(Input::Stop).await;
    }

    pub fn is_stopped(&self) -> bool {
        self.mailbox.is_closed()
    }
}

struct Runner<M: Machine> {
    name: Arc<str>,
    machine: M,
    inbox: mpsc::Receiver<Input<M>>,
    // Weak so that dropping every handle lets the machine wind down once
    // in-flight tasks have reported back.
    mailbox: mpsc::WeakSender<Input<M>>,
    publisher: watch::Sender<Arc<Snapshot<M>>>,
    observer: Option<Observer<M>>,
}

impl<M: Machine> Runner<M> {
    async fn run(mut self) {
        while let Some(input) = self.inbox.recv().await {
            match input {
                Input::Event { event, reply } => self.handle_event(event, reply),
                Input::Done(result) => {
                    let current = self.publisher.borrow().clone();
                    if let Some(step) = self.machine.on_done(&current.state, &current.context, result) {
                        self.commit(step);
                    }
                }
                Input::Stop => break,
            }
        }
        debug!(machine = %self.name, "machine stopped");
    }

    fn handle_event(
        &mut self,
        event: M::Event,
        reply: Option<oneshot::Sender<Result<Arc<Snapshot<M>>, InvalidTransition>>>,
    ) {
        let current = self.publisher.borrow().clone();
        let label = format!("{event:?}");

        let result = match self.machine.on_event(&current.state, &current.context, event) {
            Ok(Some(step)) => Ok(self.commit(step)),
            Ok(None) => Ok(current),
            Err(reason) => {
                debug!(machine = %self.name, event = %label, reason, "transition rejected");
                Err(InvalidTransition {
                    from: current.paths.clone(),
                    event: label,
                    reason,
                })
            }
        };

        if let Some(reply) = reply {
            // The caller may have stopped waiting; that is fine.
            let _ = reply.send(result);
        }
    }

    fn commit(&mut self, step: Step<M>) -> Arc<Snapshot<M>> {
        let Step {
            state,
            context,
            invoke,
        } = step;
        let version = self.publisher.borrow().version + 1;
        let snapshot = Arc::new(Snapshot {
            paths: state.paths(),
            state,
            context,
            version,
        });
        debug!(machine = %self.name, version, paths = ?snapshot.paths, "transition committed");

        self.publisher.send_replace(Arc::clone(&snapshot));
        if let Some(observer) = &self.observer {
            observer(&snapshot);
        }

        if let Some(task) = invoke {
            match self.mailbox.upgrade() {
                Some(mailbox) => {
                    let name = Arc::clone(&self.name);
                    tokio::spawn(async move {
                        let result = task.await;
                        if let Err(failure) = &result {
                            warn!(machine = %name, error = %failure, "invoked task failed");
                        }
                        let _ = mailbox.send(Input::Done(result)).await;
                    });
                }
                None => warn!(machine = %self.name, "no handles left, task not started"),
            }
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, PartialEq)]
    enum Door {
        Closed,
        Opening,
        Open,
        Jammed,
    }

    impl StateVector for Door {
        fn paths(&self) -> BTreeSet<String> {
            let tag = match self {
                Door::Closed => "Closed",
                Door::Opening => "Opening",
                Door::Open => "Open",
                Door::Jammed => "Jammed",
            };
            region_paths("Door", &[tag]).into_iter().collect()
        }
    }

    #[derive(Debug)]
    enum DoorEvent {
        Open { jam: bool },
        Close,
    }

    struct DoorMachine {
        delay: Duration,
    }

    impl Machine for DoorMachine {
        type State = Door;
        type Context = u32;
        type Event = DoorEvent;
        type Output = u32;
        type Failure = String;

        fn name(&self) -> String {
            "door".into()
        }

        fn initial(&self) -> (Door, u32) {
            (Door::Closed, 0)
        }

        fn on_event(&mut self, state: &Door, context: &u32, event: DoorEvent) -> Result<Option<Step<Self>>, &'static str> {
            match (state, event) {
                (Door::Closed | Door::Jammed, DoorEvent::Open { jam }) => {
                    let delay = self.delay;
                    let opens = *context + 1;
                    Ok(Some(Step::new(Door::Opening, *context).invoke(async move {
                        tokio::time::sleep(delay).await;
                        if jam {
                            Err("stuck".to_string())
                        } else {
                            Ok(opens)
                        }
                    })))
                }
                (Door::Opening | Door::Open, DoorEvent::Open { .. }) => Ok(None),
                (Door::Open, DoorEvent::Close) => Ok(Some(Step::new(Door::Closed, *context))),
                (_, DoorEvent::Close) => Err("door is not open"),
            }
        }

        fn on_done(&mut self, state: &Door, context: &u32, result: Result<u32, String>) -> Option<Step<Self>> {
            if *state != Door::Opening {
                return None;
            }
            Some(match result {
                Ok(opens) => Step::new(Door::Open, opens),
                Err(_) => Step::new(Door::Jammed, *context),
            })
        }
    }

    fn door() -> MachineHandle<DoorMachine> {
        MachineHandle::spawn(
            DoorMachine {
                delay: Duration::from_millis(20),
            },
            8,
        )
    }

    #[test]
    fn test_region_paths() {
        assert_eq!(
            region_paths("Phase", &["InProgress", "Guessing"]),
            vec!["Phase", "Phase.InProgress", "Phase.InProgress.Guessing"]
        );
        assert_eq!(region_paths("Phase", &[]), vec!["Phase"]);
    }

    #[tokio::test]
    async fn test_initial_snapshot_published() {
        let handle = door();
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.version, 0);
        assert!(snapshot.matches("Door.Closed"));
    }

    #[tokio::test]
    async fn test_task_success_transitions() {
        let handle = door();
        let after = handle.dispatch(DoorEvent::Open { jam: false }).await.unwrap();
        assert_eq!(after.state, Door::Opening);

        let open = handle
            .wait_for(|s| s.state == Door::Open, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(open.context, 1);
        assert_eq!(open.version, 2);
    }

    #[tokio::test]
    async fn test_task_failure_transitions_to_error_state() {
        let handle = door();
        handle.dispatch(DoorEvent::Open { jam: true }).await.unwrap();
        let jammed = handle
            .wait_for(|s| s.state == Door::Jammed, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(jammed.context, 0);

        // A fresh event recovers from the error state
        handle.dispatch(DoorEvent::Open { jam: false }).await.unwrap();
        handle
            .wait_for(|s| s.state == Door::Open, Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reentrant_event_ignored() {
        let handle = door();
        handle.dispatch(DoorEvent::Open { jam: false }).await.unwrap();
        let again = handle.dispatch(DoorEvent::Open { jam: false }).await.unwrap();
        assert_eq!(again.version, 1);

        let open = handle
            .wait_for(|s| s.state == Door::Open, Duration::from_secs(2))
            .await
            .unwrap();
        // Only one task ran
        assert_eq!(open.context, 1);
    }

    #[tokio::test]
    async fn test_rejection_leaves_state_untouched() {
        let handle = door();
        let err = handle.dispatch(DoorEvent::Close).await.unwrap_err();
        match err {
            MachineError::Rejected(invalid) => {
                assert_eq!(invalid.reason, "door is not open");
                assert!(invalid.from.contains("Door.Closed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(handle.snapshot().version, 0);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let handle = door();
        let err = handle
            .wait_for(|s| s.state == Door::Open, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MachineError::Timeout {
                waited: Duration::from_millis(30)
            }
        );
    }

    #[tokio::test]
    async fn test_stopped_machine() {
        let handle = door();
        handle.stop().await;
        let err = handle
            .wait_for(|s| s.state == Door::Open, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err, MachineError::Stopped);
        assert_eq!(handle.send(DoorEvent::Close).await, Err(MachineError::Stopped));
    }

    #[tokio::test]
    async fn test_task_result_applied_after_caller_gives_up() {
        let handle = door();
        let abandoned = tokio::time::timeout(Duration::from_millis(1), async {
            handle.dispatch(DoorEvent::Open { jam: false }).await?;
            handle
                .wait_for(|s| s.state == Door::Open, Duration::from_secs(5))
                .await
        })
        .await;
        assert!(abandoned.is_err());

        let open = handle
            .wait_for(|s| s.state == Door::Open, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(open.context, 1);
    }

    #[tokio::test]
    async fn test_observer_sees_every_commit() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = MachineHandle::spawn_observed(
            DoorMachine {
                delay: Duration::from_millis(5),
            },
            8,
            Some(Box::new(move |s: &Snapshot<DoorMachine>| sink.lock().push(s.version))),
        );
        handle.dispatch(DoorEvent::Open { jam: false }).await.unwrap();
        handle
            .wait_for(|s| s.state == Door::Open, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }
}

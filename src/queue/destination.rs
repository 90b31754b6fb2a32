//! Per-remote control plane: batching, dispatch, retry.
//!
//! Each destination owns a table of `PushOne` records keyed by URI, a
//! dispatcher thread and a bounded worker pool. Refs arriving for the same
//! URI coalesce into one batch; the batch dispatches when its delay timer
//! fires and a worker slot is free. Refs arriving while a batch is mid-push
//! land in a follow-up set that becomes a fresh batch at completion, so a
//! running refspec set is never mutated.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, unbounded};

use crate::config::RemoteConfig;
use crate::events::{Listeners, RefPushStatus, RefReplicatedEvent, notify};
use crate::git::push::{PushOutcome, push_batch};
use crate::store::{TaskStore, UriUpdates};

/// The wire-level push a destination drives. Swappable in tests.
pub type PushFn = Arc<dyn Fn(&Path, &UriUpdates, bool) -> PushOutcome + Send + Sync>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum PushState {
    /// Timer armed, waiting for the batching delay to elapse.
    Scheduled,
    /// Due, waiting for a worker slot.
    Pending,
    /// Handed to a worker.
    Running,
    /// Failed transiently, retry timer armed.
    Retrying,
}

struct PushOne {
    project: String,
    refs: BTreeSet<String>,
    state: PushState,
    retries_left: u32,
    /// Matches the most recently armed timer; stale timers are ignored.
    timer_epoch: u64,
    /// Refs that arrived while this batch was running.
    follow_up: BTreeSet<String>,
}

struct DestState {
    push_ones: HashMap<String, PushOne>,
    in_flight: usize,
    accepting: bool,
    next_epoch: u64,
}

enum Event {
    TimerFired { uri: String, epoch: u64 },
    Done { uri: String, outcome: PushOutcome },
    Shutdown,
}

struct Inner {
    config: RemoteConfig,
    git_dir: PathBuf,
    store: Arc<TaskStore>,
    listeners: Listeners,
    state: Mutex<DestState>,
    event_tx: Sender<Event>,
}

/// One configured remote with its queue, timers and workers.
pub struct Destination {
    inner: Arc<Inner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Destination {
    pub fn start(
        config: RemoteConfig,
        git_dir: PathBuf,
        store: Arc<TaskStore>,
        listeners: Listeners,
    ) -> Arc<Self> {
        Self::start_with_pusher(
            config,
            git_dir,
            store,
            listeners,
            Arc::new(|git_dir, updates, force| push_batch(git_dir, updates, force)),
        )
    }

    /// As [`Destination::start`], with the wire-level push swapped out.
    pub fn start_with_pusher(
        config: RemoteConfig,
        git_dir: PathBuf,
        store: Arc<TaskStore>,
        listeners: Listeners,
        pusher: PushFn,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = unbounded();
        // The dispatcher is the only sender on the work channel, so its
        // exit disconnects the workers.
        let (work_tx, work_rx) = unbounded::<UriUpdates>();

        let mut handles = Vec::new();
        for _ in 0..config.threads.max(1) {
            let work_rx: Receiver<UriUpdates> = work_rx.clone();
            let event_tx = event_tx.clone();
            let pusher = Arc::clone(&pusher);
            let git_dir = git_dir.clone();
            let force = config.force_update;
            handles.push(std::thread::spawn(move || {
                worker_loop(pusher, git_dir, force, work_rx, event_tx)
            }));
        }

        let inner = Arc::new(Inner {
            config,
            git_dir,
            store,
            listeners,
            state: Mutex::new(DestState {
                push_ones: HashMap::new(),
                in_flight: 0,
                accepting: true,
                next_epoch: 0,
            }),
            event_tx,
        });

        {
            let inner = Arc::clone(&inner);
            handles.push(std::thread::spawn(move || {
                dispatch_loop(inner, event_rx, work_tx)
            }));
        }

        Arc::new(Self {
            inner,
            handles: Mutex::new(handles),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.inner.config
    }

    /// Enqueue one ref for one URI. Returns false when the destination is
    /// no longer accepting work (stopped or mid-reload).
    pub fn schedule(&self, project: &str, uri: &str, ref_name: &str, now: bool) -> bool {
        let mut state = self.inner.state.lock().expect("destination state poisoned");
        let state = &mut *state;
        if !state.accepting {
            return false;
        }
        let delay = if now {
            Duration::ZERO
        } else {
            self.inner.config.delay()
        };
        match state.push_ones.get_mut(uri) {
            None => {
                let epoch = state.next_epoch;
                state.next_epoch += 1;
                state.push_ones.insert(
                    uri.to_string(),
                    PushOne {
                        project: project.to_string(),
                        refs: BTreeSet::from([ref_name.to_string()]),
                        state: PushState::Scheduled,
                        retries_left: self.inner.config.replication_retry,
                        timer_epoch: epoch,
                        follow_up: BTreeSet::new(),
                    },
                );
                self.inner.arm_timer(uri.to_string(), epoch, delay);
            }
            Some(push_one) => match push_one.state {
                // Coalesce without rearming: batching is bounded by the
                // delay of the first ref.
                PushState::Scheduled | PushState::Pending => {
                    push_one.refs.insert(ref_name.to_string());
                    if now && push_one.state == PushState::Scheduled {
                        push_one.timer_epoch = state.next_epoch;
                        let epoch = push_one.timer_epoch;
                        state.next_epoch += 1;
                        self.inner.arm_timer(uri.to_string(), epoch, Duration::ZERO);
                    }
                }
                PushState::Running => {
                    push_one.follow_up.insert(ref_name.to_string());
                }
                PushState::Retrying => {
                    push_one.refs.insert(ref_name.to_string());
                }
            },
        }
        true
    }

    /// True while the destination accepts new work.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().expect("destination state poisoned").accepting
    }

    /// True while any batch is pushing or awaiting a retry.
    pub fn is_replaying(&self) -> bool {
        let state = self.inner.state.lock().expect("destination state poisoned");
        state.in_flight > 0
            || state
                .push_ones
                .values()
                .any(|p| matches!(p.state, PushState::Running | PushState::Retrying))
    }

    /// Start accepting work again after a `shut_down`.
    pub fn resume(&self) {
        self.inner
            .state
            .lock()
            .expect("destination state poisoned")
            .accepting = true;
    }

    /// Stop accepting work and discard scheduled batches. Their tasks stay
    /// in the waiting store and replay on the next start. Running batches
    /// are left to finish; wait with [`Destination::drain`].
    pub fn shut_down(&self) {
        let mut state = self.inner.state.lock().expect("destination state poisoned");
        state.accepting = false;
        state
            .push_ones
            .retain(|_, p| matches!(p.state, PushState::Running));
    }

    /// Block until in-flight pushes complete, up to `timeout`.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_replaying() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Tear down the dispatcher and workers. Call after `shut_down` and
    /// `drain`; pending work stays persisted.
    pub fn join(&self) {
        let _ = self.inner.event_tx.send(Event::Shutdown);
        let mut handles = self.handles.lock().expect("destination handles poisoned");
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Inner {
    fn arm_timer(&self, uri: String, epoch: u64, delay: Duration) {
        let tx = self.event_tx.clone();
        std::thread::spawn(move || {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            // Receiver gone means the destination is shut down.
            let _ = tx.send(Event::TimerFired { uri, epoch });
        });
    }

    fn batch_for(&self, uri: &str, push_one: &PushOne) -> UriUpdates {
        UriUpdates {
            project: push_one.project.clone(),
            remote: self.config.name.clone(),
            uri: uri.to_string(),
            refs: push_one.refs.clone(),
        }
    }

    fn emit(&self, updates: &UriUpdates, status: RefPushStatus) {
        for ref_name in &updates.refs {
            notify(
                &self.listeners,
                &RefReplicatedEvent {
                    project: updates.project.clone(),
                    ref_name: ref_name.clone(),
                    uri: updates.uri.clone(),
                    remote: updates.remote.clone(),
                    status,
                },
            );
        }
    }
}

fn worker_loop(
    pusher: PushFn,
    git_dir: PathBuf,
    force: bool,
    work_rx: Receiver<UriUpdates>,
    event_tx: Sender<Event>,
) {
    for updates in work_rx {
        let uri = updates.uri.clone();
        let outcome = pusher(&git_dir, &updates, force);
        if event_tx.send(Event::Done { uri, outcome }).is_err() {
            break;
        }
    }
}

fn dispatch_loop(inner: Arc<Inner>, event_rx: Receiver<Event>, work_tx: Sender<UriUpdates>) {
    for event in event_rx {
        match event {
            Event::TimerFired { uri, epoch } => on_timer(&inner, &uri, epoch, &work_tx),
            Event::Done { uri, outcome } => on_done(&inner, &uri, outcome, &work_tx),
            Event::Shutdown => break,
        }
    }
}

fn on_timer(inner: &Inner, uri: &str, epoch: u64, work_tx: &Sender<UriUpdates>) {
    let mut state = inner.state.lock().expect("destination state poisoned");
    let state = &mut *state;
    let Some(push_one) = state.push_ones.get(uri) else {
        return;
    };
    if push_one.timer_epoch != epoch {
        return;
    }
    if matches!(push_one.state, PushState::Scheduled | PushState::Retrying) {
        try_dispatch(inner, state, uri, work_tx);
    }
}

/// Start the batch in the store and hand it to a worker, or park it as
/// Pending when the pool is saturated.
fn try_dispatch(inner: &Inner, state: &mut DestState, uri: &str, work_tx: &Sender<UriUpdates>) {
    let threads = inner.config.threads.max(1);
    let Some(push_one) = state.push_ones.get_mut(uri) else {
        return;
    };
    if state.in_flight >= threads {
        push_one.state = PushState::Pending;
        return;
    }
    let updates = inner.batch_for(uri, push_one);
    if let Err(e) = inner.store.start(&updates) {
        tracing::error!(remote = %inner.config.name, uri, error = %e, "failed to start tasks");
    }
    push_one.state = PushState::Running;
    state.in_flight += 1;
    tracing::debug!(
        remote = %inner.config.name,
        uri,
        refs = updates.refs.len(),
        "dispatching push"
    );
    if work_tx.send(updates).is_err() {
        tracing::error!(remote = %inner.config.name, uri, "worker pool is gone");
    }
}

fn on_done(inner: &Inner, uri: &str, outcome: PushOutcome, work_tx: &Sender<UriUpdates>) {
    // Settle the batch under the lock, emit after releasing it: listener
    // code must never run while the destination state is held, or a
    // panicking or reentrant listener would take the dispatcher with it.
    let emit = apply_outcome(inner, uri, outcome, work_tx);
    if let Some((updates, status)) = emit {
        inner.emit(&updates, status);
    }
}

fn apply_outcome(
    inner: &Inner,
    uri: &str,
    outcome: PushOutcome,
    work_tx: &Sender<UriUpdates>,
) -> Option<(UriUpdates, RefPushStatus)> {
    let mut state = inner.state.lock().expect("destination state poisoned");
    let state = &mut *state;
    state.in_flight = state.in_flight.saturating_sub(1);

    let Some(mut push_one) = state.push_ones.remove(uri) else {
        dispatch_pending(inner, state, work_tx);
        return None;
    };
    let updates = inner.batch_for(uri, &push_one);

    let status = match outcome {
        PushOutcome::Success => {
            if let Err(e) = inner.store.finish(&updates) {
                tracing::error!(remote = %inner.config.name, uri, error = %e, "failed to finish tasks");
            }
            RefPushStatus::Succeeded
        }
        PushOutcome::Permanent(error) => {
            tracing::error!(
                remote = %inner.config.name,
                uri,
                error = %error,
                "replication failed permanently"
            );
            if let Err(e) = inner.store.finish(&updates) {
                tracing::error!(remote = %inner.config.name, uri, error = %e, "failed to finish tasks");
            }
            RefPushStatus::Failed
        }
        PushOutcome::Transient(error) => {
            if !state.accepting {
                // Stopping: no retry timer, the task goes back to waiting
                // and the next run picks it up.
                tracing::info!(
                    remote = %inner.config.name,
                    uri,
                    error = %error,
                    "transient failure during shutdown, leaving task for next run"
                );
                if let Err(e) = inner.store.reset(&updates) {
                    tracing::error!(remote = %inner.config.name, uri, error = %e, "failed to reset tasks");
                }
                RefPushStatus::Deferred
            } else if push_one.retries_left > 0 {
                push_one.retries_left -= 1;
                if let Err(e) = inner.store.reset(&updates) {
                    tracing::error!(remote = %inner.config.name, uri, error = %e, "failed to reset tasks");
                }
                tracing::warn!(
                    remote = %inner.config.name,
                    uri,
                    error = %error,
                    retries_left = push_one.retries_left,
                    "replication failed, will retry"
                );

                // Refs that arrived mid-push ride along on the retry.
                let follow_up = std::mem::take(&mut push_one.follow_up);
                push_one.refs.extend(follow_up);
                push_one.state = PushState::Retrying;
                push_one.timer_epoch = state.next_epoch;
                let epoch = push_one.timer_epoch;
                state.next_epoch += 1;
                state.push_ones.insert(uri.to_string(), push_one);
                inner.arm_timer(uri.to_string(), epoch, inner.config.retry_delay());
                dispatch_pending(inner, state, work_tx);
                return Some((updates, RefPushStatus::Deferred));
            } else {
                tracing::error!(
                    remote = %inner.config.name,
                    uri,
                    error = %error,
                    "replication retry budget exhausted, giving up"
                );
                if let Err(e) = inner.store.finish(&updates) {
                    tracing::error!(remote = %inner.config.name, uri, error = %e, "failed to finish tasks");
                }
                RefPushStatus::Failed
            }
        }
    };

    // Batch is gone; refs that arrived while it ran become a fresh one.
    if !push_one.follow_up.is_empty() && state.accepting {
        let refs = std::mem::take(&mut push_one.follow_up);
        let epoch = state.next_epoch;
        state.next_epoch += 1;
        state.push_ones.insert(
            uri.to_string(),
            PushOne {
                project: push_one.project,
                refs,
                state: PushState::Scheduled,
                retries_left: inner.config.replication_retry,
                timer_epoch: epoch,
                follow_up: BTreeSet::new(),
            },
        );
        inner.arm_timer(uri.to_string(), epoch, inner.config.delay());
    }

    dispatch_pending(inner, state, work_tx);
    Some((updates, status))
}

fn dispatch_pending(inner: &Inner, state: &mut DestState, work_tx: &Sender<UriUpdates>) {
    let threads = inner.config.threads.max(1);
    loop {
        if state.in_flight >= threads {
            return;
        }
        let Some(uri) = state
            .push_ones
            .iter()
            .find(|(_, p)| p.state == PushState::Pending)
            .map(|(uri, _)| uri.clone())
        else {
            return;
        };
        try_dispatch(inner, state, &uri, work_tx);
    }
}

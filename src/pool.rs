//! The pool manager: owns the worker crew, the shared control state, and the
//! coordinated shutdown protocol.
//!
//! Results come back lazily and in completion order, never input order. The
//! first failure (or the caller abandoning the stream) triggers the full
//! shutdown sequence: announce, kill registered child-process trees, wait
//! for every worker to acknowledge, then tear the pool down. Worker threads
//! install no signal handlers of their own; interrupt handling stays with
//! the caller's thread of control.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::control::ControlState;
use crate::controller::CommandLineCaller;
use crate::kill;
use crate::label::{Label, Labeled, WorkerFailure};
use crate::worker::{Delivery, Envelope, Step, Task, WorkFn, WorkUnit, WorkerCtx};

/// Error surfaced by a result stream.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A work item failed inside a worker; the pool has been shut down.
    #[error("{}", worker_error_message(.label, .failure))]
    Worker {
        label: Option<Label>,
        #[source]
        failure: WorkerFailure,
    },
}

impl PoolError {
    pub fn label(&self) -> Option<&Label> {
        match self {
            PoolError::Worker { label, .. } => label.as_ref(),
        }
    }

    pub fn failure(&self) -> &WorkerFailure {
        match self {
            PoolError::Worker { failure, .. } => failure,
        }
    }
}

fn worker_error_message(label: &Option<Label>, failure: &WorkerFailure) -> String {
    match label {
        Some(label) => format!("work item labeled `{label}` failed: {failure}"),
        None => format!("work item failed: {failure}"),
    }
}

/// What travels back from the workers (and the feeder) to the manager.
enum Message<O> {
    Result(Delivery<O>),
    /// The input sequence is exhausted after `total` items.
    InputExhausted { total: usize },
}

/// Fans a sequence of items out across a fixed crew of workers.
///
/// Construct with [`PoolManager::new`] for an arbitrary work function or
/// [`PoolManager::for_commands`] for CLI controllers (which adds child-PID
/// tracking), then call one of `run`, `run_labeled`, or `run_numbered`
/// exactly once to obtain the lazy result stream.
pub struct PoolManager<I, O> {
    core: Option<PoolCore<I, O>>,
}

struct PoolCore<I, O> {
    control: Arc<ControlState>,
    numproc: usize,
    input_tx: SyncSender<Task<I>>,
    results_tx: mpsc::Sender<Message<O>>,
    results_rx: Receiver<Message<O>>,
    workers: Vec<JoinHandle<()>>,
}

impl<I, O> PoolManager<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Pool over an arbitrary per-item work function. `numproc` defaults to
    /// the machine's available parallelism.
    pub fn new<F>(work: F, numproc: Option<usize>) -> Self
    where
        F: Fn(I) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        Self::build(Arc::new(move |item, _ctx: &WorkerCtx| work(item)), numproc, false)
    }

    fn build(work: Arc<WorkFn<I, O>>, numproc: Option<usize>, track_pids: bool) -> Self {
        let numproc = numproc.unwrap_or_else(default_numproc).max(1);
        let control = Arc::new(ControlState::new(track_pids));
        // Bounded task queue: backpressure against infinite input sequences,
        // with room for the wake-up burst during shutdown announcement.
        let (input_tx, input_rx) = mpsc::sync_channel::<Task<I>>(numproc);
        let shared_rx = Arc::new(Mutex::new(input_rx));
        let (results_tx, results_rx) = mpsc::channel::<Message<O>>();

        let mut workers = Vec::with_capacity(numproc);
        for i in 0..numproc {
            let name = format!("crew-{i}");
            let envelope = Envelope::new(
                Arc::clone(&work),
                WorkerCtx {
                    name: name.clone(),
                    control: Arc::clone(&control),
                },
            );
            let task_rx = Arc::clone(&shared_rx);
            let delivery_tx = results_tx.clone();
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(envelope, task_rx, delivery_tx))
                .expect("spawn worker thread");
            workers.push(handle);
        }
        info!(numproc, track_pids, "worker pool started");

        PoolManager {
            core: Some(PoolCore {
                control,
                numproc,
                input_tx,
                results_tx,
                results_rx,
                workers,
            }),
        }
    }

    /// Fan the items out; the stream yields bare results in completion order.
    pub fn run<S>(mut self, sequence: S) -> PoolStream<I, O>
    where
        S: IntoIterator<Item = I>,
        S::IntoIter: Send + 'static,
    {
        let units = sequence.into_iter().map(WorkUnit::Plain);
        PoolStream {
            core: self.launch(units),
        }
    }

    /// Fan out caller-labeled `(label, item)` pairs; the stream yields
    /// `(label, result)` pairs.
    pub fn run_labeled<S, L>(mut self, sequence: S) -> LabeledPoolStream<I, O>
    where
        S: IntoIterator<Item = (L, I)>,
        S::IntoIter: Send + 'static,
        L: Into<Label>,
    {
        let units = sequence
            .into_iter()
            .map(|(label, item)| WorkUnit::Tagged(Labeled::new(label, item)));
        LabeledPoolStream {
            core: self.launch(units),
        }
    }

    /// Fan out with ordinal labels assigned by the pool.
    pub fn run_numbered<S>(mut self, sequence: S) -> LabeledPoolStream<I, O>
    where
        S: IntoIterator<Item = I>,
        S::IntoIter: Send + 'static,
    {
        let units = sequence
            .into_iter()
            .enumerate()
            .map(|(i, item)| WorkUnit::Tagged(Labeled::new(i as u64, item)));
        LabeledPoolStream {
            core: self.launch(units),
        }
    }

    fn launch(
        &mut self,
        units: impl Iterator<Item = WorkUnit<I>> + Send + 'static,
    ) -> StreamCore<I, O> {
        let core = self.core.take().expect("pool manager used exactly once");
        let feeder_tx = core.input_tx.clone();
        let exhausted_tx = core.results_tx.clone();
        let control = Arc::clone(&core.control);
        let feeder = std::thread::Builder::new()
            .name("crew-feeder".to_string())
            .spawn(move || {
                let mut fed = 0usize;
                for unit in units {
                    if !control.permission() {
                        return;
                    }
                    if feeder_tx.send(Task::Work(unit)).is_err() {
                        return;
                    }
                    fed += 1;
                }
                debug!(fed, "input sequence exhausted");
                let _ = exhausted_tx.send(Message::InputExhausted { total: fed });
            })
            .expect("spawn feeder thread");

        StreamCore {
            control: core.control,
            numproc: core.numproc,
            input_tx: Some(core.input_tx),
            results_rx: core.results_rx,
            feeder: Some(feeder),
            workers: core.workers,
            total: None,
            delivered: 0,
            error_on_label: None,
            state: StreamState::Running,
        }
    }
}

impl<I> PoolManager<I, CommandLineCaller>
where
    I: Send + 'static,
{
    /// Pool whose work is running CLI controllers built per item.
    ///
    /// The pool allocates the PID registry and binds a publisher into every
    /// caller so each child's PID is recorded against its worker's name
    /// before the worker blocks on the child. The finished caller (captured
    /// output included) is the item's result.
    pub fn for_commands<B>(builder: B, numproc: Option<usize>) -> Self
    where
        B: Fn(I) -> anyhow::Result<CommandLineCaller> + Send + Sync + 'static,
    {
        let work = move |item: I, ctx: &WorkerCtx| {
            let mut caller = builder(item)?;
            if let Some(publisher) = ctx.pid_publisher() {
                caller.set_pid_publisher(publisher);
            }
            caller.call()?;
            Ok(caller)
        };
        Self::build(Arc::new(work), numproc, true)
    }
}

impl<I, O> Drop for PoolManager<I, O> {
    fn drop(&mut self) {
        // A manager dropped without ever being run still owes its workers a
        // clean shutdown.
        if let Some(core) = self.core.take() {
            core.abort();
        }
    }
}

impl<I, O> PoolCore<I, O> {
    fn abort(self) {
        announce_and_quiesce(&self.control, self.numproc, &self.input_tx);
        let PoolCore {
            control,
            input_tx,
            workers,
            results_tx,
            results_rx,
            ..
        } = self;
        drop(input_tx);
        drop(results_tx);
        drop(results_rx);
        control.sleep_switch().release();
        for handle in workers {
            let _ = handle.join();
        }
    }
}

fn default_numproc() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn worker_loop<I, O>(
    envelope: Envelope<I, O>,
    tasks: Arc<Mutex<Receiver<Task<I>>>>,
    deliveries: mpsc::Sender<Message<O>>,
) {
    loop {
        // Holding the lock across the blocking recv is intentional: exactly
        // one idle worker waits on the queue, the rest wait on the lock.
        let task = {
            let queue = tasks.lock().expect("task queue lock poisoned");
            queue.recv()
        };
        let Ok(task) = task else {
            // Channel closed: the pool is finished with input.
            break;
        };
        match envelope.handle(task) {
            Step::Deliver(delivery) => {
                if deliveries.send(Message::Result(delivery)).is_err() {
                    break;
                }
            }
            Step::Skip => {}
            Step::Quiesced => break,
        }
    }
}

/// Announce + kill + quiescence-join, shared by the stream's shutdown and
/// the never-run manager's abort.
fn announce_and_quiesce<I>(
    control: &Arc<ControlState>,
    numproc: usize,
    input_tx: &SyncSender<Task<I>>,
) {
    debug!(numproc, "announcing pool shutdown");
    // One sentinel per worker, before permission flips, so a quiescing
    // worker never blocks on an empty sentinel queue.
    control.ready_to_die().put(numproc);
    control.revoke_permission();
    // Wake idle workers so they observe the revocation. A full queue means
    // no worker is idle; whatever is queued serves as the wake-up instead.
    for _ in 0..numproc {
        match input_tx.try_send(Task::Dummy) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => break,
        }
    }

    if let Some(registry) = control.pid_registry() {
        for pid in registry.snapshot() {
            info!(pid, "terminating child process tree on shutdown");
            if let Err(err) = kill::kill_tree(pid) {
                warn!(pid, "failed to kill child process tree: {err:#}");
            }
        }
    }

    control.ready_to_die().join();
    debug!("all workers quiesced");
}

enum StreamState {
    Running,
    Errored,
    Finished,
}

struct StreamCore<I, O> {
    control: Arc<ControlState>,
    numproc: usize,
    input_tx: Option<SyncSender<Task<I>>>,
    results_rx: Receiver<Message<O>>,
    feeder: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    total: Option<usize>,
    delivered: usize,
    error_on_label: Option<Label>,
    state: StreamState,
}

impl<I, O> StreamCore<I, O> {
    fn next_delivery(&mut self) -> Option<Result<(Option<Label>, O), PoolError>> {
        if !matches!(self.state, StreamState::Running) {
            return None;
        }
        loop {
            if let Some(total) = self.total
                && self.delivered >= total
            {
                self.state = StreamState::Finished;
                self.teardown();
                return None;
            }
            match self.results_rx.recv() {
                Ok(Message::InputExhausted { total }) => {
                    self.total = Some(total);
                }
                Ok(Message::Result(Delivery {
                    label,
                    outcome: Ok(output),
                })) => {
                    self.delivered += 1;
                    return Some(Ok((label, output)));
                }
                Ok(Message::Result(Delivery {
                    label,
                    outcome: Err(failure),
                })) => {
                    self.delivered += 1;
                    self.error_on_label = label.clone();
                    self.state = StreamState::Errored;
                    debug!("work item failed, shutting pool down");
                    self.shutdown();
                    return Some(Err(PoolError::Worker { label, failure }));
                }
                Err(_) => {
                    // Every sender is gone; nothing more can arrive.
                    self.state = StreamState::Finished;
                    self.teardown();
                    return None;
                }
            }
        }
    }

    /// Full shutdown: announce, kill child trees, wait for quiescence, then
    /// tear down.
    fn shutdown(&mut self) {
        if let Some(input_tx) = &self.input_tx {
            announce_and_quiesce(&self.control, self.numproc, input_tx);
        }
        self.teardown();
    }

    /// Normal-completion teardown: close the task queue, wake any parked
    /// workers, join everything.
    fn teardown(&mut self) {
        self.input_tx.take();
        self.control.sleep_switch().release();
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!("worker pool torn down");
    }
}

impl<I, O> Drop for StreamCore<I, O> {
    fn drop(&mut self) {
        // The caller abandoned the stream mid-run (or an interrupt unwound
        // through it): same protocol as a work-item failure.
        if matches!(self.state, StreamState::Running) {
            self.shutdown();
        }
    }
}

/// Lazy stream of unlabeled results, in completion order.
pub struct PoolStream<I, O> {
    core: StreamCore<I, O>,
}

impl<I, O> Iterator for PoolStream<I, O> {
    type Item = Result<O, PoolError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.core
            .next_delivery()
            .map(|res| res.map(|(_label, output)| output))
    }
}

impl<I, O> PoolStream<I, O> {
    /// Label of the item whose failure aborted the run, if any carried one.
    pub fn error_on_label(&self) -> Option<&Label> {
        self.core.error_on_label.as_ref()
    }
}

/// Lazy stream of `(label, result)` pairs, in completion order.
pub struct LabeledPoolStream<I, O> {
    core: StreamCore<I, O>,
}

impl<I, O> Iterator for LabeledPoolStream<I, O> {
    type Item = Result<(Label, O), PoolError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.core.next_delivery().map(|res| {
            res.map(|(label, output)| {
                (
                    label.expect("labeled stream delivers labeled results"),
                    output,
                )
            })
        })
    }
}

impl<I, O> LabeledPoolStream<I, O> {
    /// Label of the item whose failure aborted the run.
    pub fn error_on_label(&self) -> Option<&Label> {
        self.core.error_on_label.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Debug, thiserror::Error)]
    #[error("intentional test failure")]
    struct TestError;

    #[test]
    fn fans_out_all_items_and_collects_all_results() {
        let pool = PoolManager::new(|x: u64| Ok(x * 10), Some(3));
        let mut stream = pool.run(0..6u64);
        let mut results = BTreeSet::new();
        for item in &mut stream {
            results.insert(item.expect("no failures expected"));
        }
        assert_eq!(
            results,
            BTreeSet::from([0, 10, 20, 30, 40, 50])
        );
        // Normal completion: pool joined, permission never revoked.
        assert!(stream.core.workers.is_empty());
        assert!(stream.core.control.permission());
        assert!(stream.core.control.pid_registry().is_none());
    }

    #[test]
    fn failure_halts_the_pool_and_quiesces_every_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = {
            let calls = Arc::clone(&calls);
            PoolManager::new(
                move |x: u64| {
                    if calls.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                        return Err(anyhow::Error::new(TestError));
                    }
                    Ok(x)
                },
                Some(4),
            )
        };

        let mut stream = pool.run(0..6u64);
        let mut saw_error = false;
        for item in &mut stream {
            if let Err(err) = item {
                assert!(err.failure().downcast_ref::<TestError>().is_some());
                saw_error = true;
                break;
            }
        }
        assert!(saw_error, "the third invocation must fail");

        // Shutdown already completed inside the stream: permission revoked,
        // all sentinels acknowledged, workers joined.
        assert!(!stream.core.control.permission());
        assert_eq!(stream.core.control.ready_to_die().outstanding(), 0);
        assert!(stream.core.workers.is_empty());

        // No work function runs after shutdown.
        let settled = calls.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn labeled_failure_reports_the_failing_label() {
        let pool = PoolManager::new(
            |x: u64| {
                if x == 3 {
                    return Err(anyhow::Error::new(TestError));
                }
                Ok(x)
            },
            Some(3),
        );
        let labels: Vec<(String, u64)> = (0..6u64).map(|i| (i.to_string(), i)).collect();
        let mut stream = pool.run_labeled(labels);

        let mut failure = None;
        for item in &mut stream {
            match item {
                Ok((label, value)) => assert_eq!(label, Label::Name(value.to_string())),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        let err = failure.expect("payload 3 must fail");
        assert!(err.failure().downcast_ref::<TestError>().is_some());
        assert_eq!(err.label(), Some(&Label::Name("3".to_string())));
        assert_eq!(
            stream.error_on_label(),
            Some(&Label::Name("3".to_string()))
        );
    }

    #[test]
    fn numbered_run_delivers_every_ordinal_exactly_once() {
        let pool = PoolManager::new(|x: u64| Ok(x), Some(2));
        let stream = pool.run_numbered(10..20u64);
        let mut seen = BTreeSet::new();
        for item in stream {
            let (label, value) = item.expect("no failures expected");
            match label {
                Label::Ordinal(n) => {
                    assert_eq!(value, 10 + n);
                    assert!(seen.insert(n), "duplicate label {n}");
                }
                other => panic!("unexpected label {other:?}"),
            }
        }
        assert_eq!(seen, (0..10u64).collect::<BTreeSet<_>>());
    }

    #[test]
    fn abandoned_stream_shuts_the_pool_down() {
        let started = Instant::now();
        let pool = PoolManager::new(
            |x: u64| {
                std::thread::sleep(Duration::from_millis(10));
                Ok(x)
            },
            Some(2),
        );
        {
            let mut stream = pool.run(0..1_000_000u64);
            let first = stream.next().expect("one result");
            first.expect("no failure");
            // Dropping the stream here abandons the remaining input.
        }
        // The pool must wind down promptly instead of draining a million
        // items.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn empty_sequence_completes_immediately() {
        let pool = PoolManager::new(|x: u64| Ok(x), Some(2));
        let results: Vec<_> = pool.run(Vec::new()).collect();
        assert!(results.is_empty());
    }

    #[test]
    fn unused_manager_drops_cleanly() {
        let started = Instant::now();
        let pool = PoolManager::new(|x: u64| Ok(x), Some(4));
        drop(pool);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn panicking_work_function_surfaces_as_pool_error() {
        let pool = PoolManager::<u64, u64>::new(
            |x| {
                if x == 2 {
                    panic!("work function panicked on {x}");
                }
                Ok(x)
            },
            Some(2),
        );
        let mut saw_panic_failure = false;
        for item in pool.run(0..4u64) {
            if let Err(err) = item {
                assert!(err.failure().message.contains("panicked on 2"));
                saw_panic_failure = true;
                break;
            }
        }
        assert!(saw_panic_failure);
    }

    #[test]
    fn results_arrive_in_completion_order_not_input_order() {
        // The first item sleeps long enough that later items finish first.
        let pool = PoolManager::new(
            |x: u64| {
                if x == 0 {
                    std::thread::sleep(Duration::from_millis(200));
                }
                Ok(x)
            },
            Some(2),
        );
        let order: Vec<u64> = pool
            .run(0..4u64)
            .map(|r| r.expect("no failures"))
            .collect();
        assert_eq!(order.len(), 4);
        assert_ne!(order.first(), Some(&0), "slow first item cannot win");
    }
}

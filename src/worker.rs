//! The per-item wrapper executed inside each worker.
//!
//! Every task goes through the envelope: while permission holds, it unwraps
//! the label, invokes the bound work function, traps anything it throws, and
//! rewraps the outcome. Once permission is revoked the envelope acknowledges
//! one shutdown sentinel and parks the worker; the work function is never
//! touched again after that.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::debug;

use crate::control::ControlState;
use crate::controller::PidPublisher;
use crate::label::{Label, Labeled, WorkerFailure};

/// Work function bound into the pool: item plus worker context to outcome.
pub(crate) type WorkFn<I, O> = dyn Fn(I, &WorkerCtx) -> anyhow::Result<O> + Send + Sync;

/// A worker's identity and its handle on the shared control state.
pub(crate) struct WorkerCtx {
    pub(crate) name: String,
    pub(crate) control: Arc<ControlState>,
}

impl WorkerCtx {
    /// Publisher that records a child PID under this worker's name, when the
    /// pool tracks PIDs at all.
    pub(crate) fn pid_publisher(&self) -> Option<PidPublisher> {
        self.control.pid_registry()?;
        let control = Arc::clone(&self.control);
        let name = self.name.clone();
        Some(Arc::new(move |pid| {
            debug!(worker = %name, pid, "publishing child pid");
            if let Some(registry) = control.pid_registry() {
                registry.publish(&name, pid);
            }
        }))
    }
}

/// A task handed to a worker.
pub(crate) enum Task<I> {
    Work(WorkUnit<I>),
    /// Payload-free wake-up submitted during shutdown announcement so that
    /// idle workers re-check permission.
    Dummy,
}

pub(crate) enum WorkUnit<I> {
    Plain(I),
    Tagged(Labeled<I>),
}

/// A finished item on its way back to the manager.
pub(crate) struct Delivery<O> {
    pub(crate) label: Option<Label>,
    pub(crate) outcome: Result<O, WorkerFailure>,
}

/// What the worker loop should do after one envelope pass.
pub(crate) enum Step<O> {
    Deliver(Delivery<O>),
    Skip,
    Quiesced,
}

pub(crate) struct Envelope<I, O> {
    work: Arc<WorkFn<I, O>>,
    ctx: WorkerCtx,
}

impl<I, O> Envelope<I, O> {
    pub(crate) fn new(work: Arc<WorkFn<I, O>>, ctx: WorkerCtx) -> Self {
        Envelope { work, ctx }
    }

    pub(crate) fn handle(&self, task: Task<I>) -> Step<O> {
        if !self.ctx.control.permission() {
            // Shutdown observed: acknowledge one sentinel, then park until
            // the pool is torn down.
            debug!(worker = %self.ctx.name, "quiescing");
            let control = &self.ctx.control;
            control.ready_to_die().get();
            control.ready_to_die().task_done();
            control.sleep_switch().sleep();
            return Step::Quiesced;
        }

        match task {
            Task::Work(WorkUnit::Plain(item)) => Step::Deliver(Delivery {
                label: None,
                outcome: self.invoke(item),
            }),
            Task::Work(WorkUnit::Tagged(labeled)) => {
                let label = labeled.label().clone();
                match labeled.strip() {
                    Ok((item, reapply)) => {
                        let wrapped = reapply.apply(self.invoke(item));
                        let (label, outcome) = wrapped.into_parts();
                        Step::Deliver(Delivery {
                            label: Some(label),
                            outcome,
                        })
                    }
                    Err(err) => Step::Deliver(Delivery {
                        label: Some(label),
                        outcome: Err(WorkerFailure::from_error(err.into())),
                    }),
                }
            }
            Task::Dummy => Step::Skip,
        }
    }

    fn invoke(&self, item: I) -> Result<O, WorkerFailure> {
        match catch_unwind(AssertUnwindSafe(|| (self.work)(item, &self.ctx))) {
            Ok(Ok(output)) => {
                // The child is gone on success; retract this worker's entry.
                // On failure the entry stays so the manager can still tear
                // the (possibly live) child tree down.
                if let Some(registry) = self.ctx.control.pid_registry() {
                    registry.remove(&self.ctx.name);
                }
                Ok(output)
            }
            Ok(Err(err)) => Err(WorkerFailure::from_error(err)),
            Err(payload) => Err(WorkerFailure::from_panic(payload)),
        }
    }
}

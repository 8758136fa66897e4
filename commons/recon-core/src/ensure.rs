use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, StepError};

/// Smallest delay a step may ask for before the next invocation.
pub const DEFAULT_MIN_REQUEUE_AFTER: Duration = Duration::from_secs(5);

/// Configured floors below this are raised to it.
pub const REQUEUE_FLOOR_LIMIT: Duration = Duration::from_secs(1);

/// What a single ensure step wants the pipeline to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Effect is in place; move on to the next step.
    Continue,
    /// Partial progress; invoke again right away.
    RequeueImmediately,
    /// Waiting on something external; invoke again later.
    RequeueAfter(Duration),
}

/// Requeue decision returned by a pipeline run and by a reconcile
/// invocation. The default value means "steady state, nothing to do".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Action {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
}

impl Action {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue_now() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    pub fn requeue_after(after: Duration) -> Self {
        Self {
            requeue: true,
            requeue_after: Some(after),
        }
    }

    pub fn is_done(&self) -> bool {
        !self.requeue
    }
}

/// One idempotent unit of reconciliation.
///
/// A step must derive "already done" from `ctx` (i.e. from durable state),
/// never from memory of an earlier run: pipelines are rebuilt for every
/// invocation.
#[async_trait]
pub trait EnsureStep<C: Send>: Send + Sync {
    fn name(&self) -> &str;

    async fn ensure(&self, ctx: &mut C) -> Result<Outcome, Error>;
}

type StepFn<C> = Box<
    dyn for<'a> Fn(&'a mut C) -> BoxFuture<'a, Result<Outcome, Error>>
        + Send
        + Sync,
>;

/// Adapter turning a closure into a named step.
pub struct FnStep<C> {
    name: String,
    f: StepFn<C>,
}

impl<C> FnStep<C> {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut C) -> BoxFuture<'a, Result<Outcome, Error>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl<C: Send> EnsureStep<C> for FnStep<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure(&self, ctx: &mut C) -> Result<Outcome, Error> {
        (self.f)(ctx).await
    }
}

/// Ordered list of ensure steps for one invocation.
pub struct Pipeline<C> {
    steps: Vec<Box<dyn EnsureStep<C>>>,
    min_requeue_after: Duration,
}

impl<C: Send> Pipeline<C> {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            min_requeue_after: DEFAULT_MIN_REQUEUE_AFTER,
        }
    }

    pub fn step(mut self, step: impl EnsureStep<C> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn boxed_step(mut self, step: Box<dyn EnsureStep<C>>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_min_requeue_after(mut self, floor: Duration) -> Self {
        self.min_requeue_after = floor.max(REQUEUE_FLOOR_LIMIT);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run steps in order until one errors or asks for a requeue.
    ///
    /// `cancel` is checked before each step; a tripped token ends the run
    /// with [`Error::Cancelled`] attributed to the step that did not start.
    pub async fn run(
        &self,
        ctx: &mut C,
        cancel: &CancellationToken,
    ) -> Result<Action, StepError> {
        for step in &self.steps {
            let name = step.name();
            if cancel.is_cancelled() {
                debug!(step = name, "pipeline cancelled at step boundary");
                return Err(StepError::new(name, Error::Cancelled));
            }
            trace!(step = name, "ensure");
            match step.ensure(ctx).await {
                Ok(Outcome::Continue) => continue,
                Ok(Outcome::RequeueImmediately) => {
                    debug!(step = name, "step requested immediate requeue");
                    return Ok(Action::requeue_now());
                }
                Ok(Outcome::RequeueAfter(after)) => {
                    let after = after.max(self.min_requeue_after);
                    debug!(step = name, ?after, "step requested requeue");
                    return Ok(Action::requeue_after(after));
                }
                Err(e) => {
                    debug!(step = name, error = %e, "step failed");
                    return Err(StepError::new(name, e));
                }
            }
        }
        Ok(Action::done())
    }
}

impl<C: Send> Default for Pipeline<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Ctx {
        done: HashSet<&'static str>,
        effects: usize,
    }

    /// Applies its effect once; afterwards it only observes.
    struct Idempotent(&'static str);

    #[async_trait]
    impl EnsureStep<Ctx> for Idempotent {
        fn name(&self) -> &str {
            self.0
        }

        async fn ensure(&self, ctx: &mut Ctx) -> Result<Outcome, Error> {
            if ctx.done.insert(self.0) {
                ctx.effects += 1;
            }
            Ok(Outcome::Continue)
        }
    }

    struct Spy {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        result: fn() -> Result<Outcome, Error>,
    }

    impl Spy {
        fn new(
            name: &'static str,
            result: fn() -> Result<Outcome, Error>,
        ) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    name,
                    calls: calls.clone(),
                    result,
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl EnsureStep<Ctx> for Spy {
        fn name(&self) -> &str {
            self.name
        }

        async fn ensure(&self, _ctx: &mut Ctx) -> Result<Outcome, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    #[tokio::test]
    async fn all_continue_is_done() {
        let pipeline = Pipeline::new()
            .step(Idempotent("a"))
            .step(Idempotent("b"));
        let mut ctx = Ctx::default();
        let action =
            pipeline.run(&mut ctx, &CancellationToken::new()).await.unwrap();
        assert!(action.is_done());
        assert_eq!(action, Action::done());
    }

    #[tokio::test]
    async fn second_run_has_no_new_effects() {
        let pipeline = Pipeline::new()
            .step(Idempotent("a"))
            .step(Idempotent("b"));
        let mut ctx = Ctx::default();
        let cancel = CancellationToken::new();
        pipeline.run(&mut ctx, &cancel).await.unwrap();
        assert_eq!(ctx.effects, 2);
        let action = pipeline.run(&mut ctx, &cancel).await.unwrap();
        assert!(action.is_done());
        assert_eq!(ctx.effects, 2);
    }

    #[tokio::test]
    async fn error_short_circuits() {
        let (a, a_calls) = Spy::new("a", || Ok(Outcome::Continue));
        let (b, b_calls) = Spy::new("b", || Err(Error::retryable("boom")));
        let (c, c_calls) = Spy::new("c", || Ok(Outcome::Continue));
        let pipeline = Pipeline::new().step(a).step(b).step(c);

        let err = pipeline
            .run(&mut Ctx::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.step, "b");
        assert!(matches!(err.source, Error::Retryable(ref m) if m == "boom"));
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn requeue_short_circuits_without_error() {
        let (a, _) = Spy::new("a", || Ok(Outcome::RequeueImmediately));
        let (b, b_calls) = Spy::new("b", || Ok(Outcome::Continue));
        let pipeline = Pipeline::new().step(a).step(b);
        let action = pipeline
            .run(&mut Ctx::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(action, Action::requeue_now());
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn requeue_after_is_floored() {
        let (a, _) = Spy::new("a", || {
            Ok(Outcome::RequeueAfter(Duration::from_millis(10)))
        });
        let pipeline = Pipeline::new()
            .step(a)
            .with_min_requeue_after(Duration::from_secs(3));
        let action = pipeline
            .run(&mut Ctx::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(action, Action::requeue_after(Duration::from_secs(3)));

        let (b, _) = Spy::new("b", || {
            Ok(Outcome::RequeueAfter(Duration::from_secs(600)))
        });
        let pipeline = Pipeline::new().step(b);
        let action = pipeline
            .run(&mut Ctx::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(action.requeue_after, Some(Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn zero_floor_still_prevents_busy_requeue() {
        let (a, _) =
            Spy::new("a", || Ok(Outcome::RequeueAfter(Duration::ZERO)));
        let pipeline = Pipeline::new()
            .step(a)
            .with_min_requeue_after(Duration::ZERO);
        let action = pipeline
            .run(&mut Ctx::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(action, Action::requeue_after(REQUEUE_FLOOR_LIMIT));
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_steps() {
        let cancel = CancellationToken::new();
        let (a, a_calls) = Spy::new("a", || Ok(Outcome::Continue));
        let pipeline = Pipeline::new().step(a);
        cancel.cancel();
        let err = pipeline.run(&mut Ctx::default(), &cancel).await.unwrap_err();
        assert_eq!(err.step, "a");
        assert!(matches!(err.source, Error::Cancelled));
        assert!(!err.is_critical());
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn closures_can_be_steps() {
        let pipeline = Pipeline::new()
            .step(FnStep::new("count", |ctx: &mut Ctx| {
                Box::pin(async move {
                    ctx.effects += 1;
                    Ok(Outcome::Continue)
                })
            }))
            .step(Idempotent("after"));
        assert_eq!(pipeline.step_names(), vec!["count", "after"]);
        let mut ctx = Ctx::default();
        pipeline.run(&mut ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(ctx.effects, 2);
    }
}

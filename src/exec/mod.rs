use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::debug;
use rayon::prelude::*;

use crate::error::{EngineError, Result};

/// Scheduling abstraction for parallel reductions.
///
/// `call` runs a task list and blocks until all tasks finish, returning the
/// results in task order. On the first failure the remaining tasks are
/// requested to cancel and the first observed error is reported. Tasks must
/// periodically call [`require_active`](Context::require_active) to stay
/// cancellable.
pub trait Context: Sync {
    fn is_active(&self) -> bool;

    fn parallelism(&self) -> usize;

    fn require_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(EngineError::ExecutionAborted("context is inactive".into()))
        }
    }

    fn call<T, F>(&self, tasks: Vec<F>) -> Result<Vec<T>>
    where
        T: Send,
        F: FnOnce() -> Result<T> + Send;
}

/// Runs every task in the caller's thread.
#[derive(Debug, Default)]
pub struct SequentialContext {
    inactive: AtomicBool,
}

impl SequentialContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deactivates the context; subsequent `require_active` calls fail.
    pub fn deactivate(&self) {
        self.inactive.store(true, Ordering::Release);
    }
}

impl Context for SequentialContext {
    fn is_active(&self) -> bool {
        !self.inactive.load(Ordering::Acquire)
    }

    fn parallelism(&self) -> usize {
        1
    }

    fn call<T, F>(&self, tasks: Vec<F>) -> Result<Vec<T>>
    where
        T: Send,
        F: FnOnce() -> Result<T> + Send,
    {
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            self.require_active()?;
            results.push(task()?);
        }
        Ok(results)
    }
}

/// Pool-backed context. The first task error sets a shared abort flag that
/// makes the remaining tasks fail fast with `ExecutionAborted`.
pub struct ThreadPoolContext {
    pool: rayon::ThreadPool,
    inactive: AtomicBool,
}

impl ThreadPoolContext {
    pub fn new(parallelism: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .build()
            .map_err(|e| EngineError::ExecutionAborted(e.to_string()))?;
        debug!("thread pool context with parallelism {}", parallelism);
        Ok(Self {
            pool,
            inactive: AtomicBool::new(false),
        })
    }

    pub fn deactivate(&self) {
        self.inactive.store(true, Ordering::Release);
    }
}

impl Context for ThreadPoolContext {
    fn is_active(&self) -> bool {
        !self.inactive.load(Ordering::Acquire)
    }

    fn parallelism(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn call<T, F>(&self, tasks: Vec<F>) -> Result<Vec<T>>
    where
        T: Send,
        F: FnOnce() -> Result<T> + Send,
    {
        self.require_active()?;
        let abort = AtomicBool::new(false);
        let first_error: Mutex<Option<EngineError>> = Mutex::new(None);

        let outcomes: Vec<Result<T>> = self.pool.install(|| {
            tasks
                .into_par_iter()
                .map(|task| {
                    if abort.load(Ordering::Acquire) || !self.is_active() {
                        return Err(EngineError::ExecutionAborted(
                            "cancelled by sibling failure".into(),
                        ));
                    }
                    task().map_err(|e| {
                        abort.store(true, Ordering::Release);
                        let mut first = first_error.lock().unwrap();
                        if first.is_none() {
                            *first = Some(e.clone());
                        }
                        e
                    })
                })
                .collect()
        });

        if let Some(e) = first_error.into_inner().unwrap() {
            return Err(e);
        }
        outcomes.into_iter().collect()
    }
}

/// Serializes `call` while forwarding everything to an underlying context.
pub struct SingleThreadedContext<C> {
    inner: C,
    gate: Mutex<()>,
}

impl<C: Context> SingleThreadedContext<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            gate: Mutex::new(()),
        }
    }
}

impl<C: Context> Context for SingleThreadedContext<C> {
    fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    fn parallelism(&self) -> usize {
        self.inner.parallelism()
    }

    fn call<T, F>(&self, tasks: Vec<F>) -> Result<Vec<T>>
    where
        T: Send,
        F: FnOnce() -> Result<T> + Send,
    {
        let _serialized = self.gate.lock().unwrap();
        self.inner.call(tasks)
    }
}

#[cfg(test)]
mod exec_tests {

    use std::env::set_var;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;
    use crate::util;

    fn setup() {
        set_var("RUST_LOG", "info");
        util::init();
    }

    #[test]
    fn sequential_returns_in_task_order() {
        setup();
        let ctx = SequentialContext::new();
        let tasks: Vec<_> = (0..5).map(|i| move || Ok(i * 10)).collect();
        assert_eq!(ctx.call(tasks).unwrap(), vec![0, 10, 20, 30, 40]);
    }

    #[test]
    fn sequential_stops_at_first_error() {
        setup();
        let ran = Arc::new(AtomicUsize::new(0));
        let ctx = SequentialContext::new();
        let before = ran.clone();
        let after = ran.clone();
        let tasks: Vec<Box<dyn FnOnce() -> Result<usize> + Send>> = vec![
            Box::new(move || {
                before.fetch_add(1, Ordering::Relaxed);
                Ok(1)
            }),
            Box::new(|| Err(EngineError::Range("boom".into()))),
            Box::new(move || {
                after.fetch_add(1, Ordering::Relaxed);
                Ok(3)
            }),
        ];
        assert!(matches!(ctx.call(tasks), Err(EngineError::Range(_))));
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn inactive_context_aborts() {
        setup();
        let ctx = SequentialContext::new();
        ctx.deactivate();
        assert!(!ctx.is_active());
        assert!(matches!(
            ctx.require_active(),
            Err(EngineError::ExecutionAborted(_))
        ));
        let tasks: Vec<Box<dyn FnOnce() -> Result<usize> + Send>> = vec![Box::new(|| Ok(1))];
        assert!(ctx.call(tasks).is_err());
    }

    #[test]
    fn pool_returns_in_task_order() {
        setup();
        let ctx = ThreadPoolContext::new(4).unwrap();
        assert_eq!(ctx.parallelism(), 4);
        let tasks: Vec<_> = (0..64).map(|i| move || Ok(i)).collect();
        let results = ctx.call(tasks).unwrap();
        assert_eq!(results, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn pool_reports_the_first_error() {
        setup();
        let ctx = ThreadPoolContext::new(4).unwrap();
        let tasks: Vec<Box<dyn FnOnce() -> Result<usize> + Send>> = (0..32)
            .map(|i| {
                let task: Box<dyn FnOnce() -> Result<usize> + Send> = if i == 7 {
                    Box::new(|| Err(EngineError::Range("worker failure".into())))
                } else {
                    Box::new(move || Ok(i))
                };
                task
            })
            .collect();
        assert!(matches!(ctx.call(tasks), Err(EngineError::Range(_))));
    }

    #[test]
    fn single_threaded_wrapper_forwards() {
        setup();
        let ctx = SingleThreadedContext::new(SequentialContext::new());
        assert!(ctx.is_active());
        assert_eq!(ctx.parallelism(), 1);
        let tasks: Vec<_> = (0..3).map(|i| move || Ok(i)).collect();
        assert_eq!(ctx.call(tasks).unwrap(), vec![0, 1, 2]);
    }
}

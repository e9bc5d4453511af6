//! Fan-out/fan-in over blocking LLM calls.
//!
//! Spawns every tagged task on a bounded tokio blocking pool and joins them
//! all. Failure is isolated per task: an error or panic in one candidate is
//! recorded in its outcome and never cancels or fails the siblings. The
//! batch as a whole only errors when the runtime itself cannot be built;
//! "at least one task succeeded" policies belong to the caller.

use std::fmt;
use thiserror::Error;
use tokio::task::JoinSet;

const MAX_WORKER_THREADS: usize = 4;

pub struct TaggedTask<T, E> {
    name: String,
    run: Box<dyn FnOnce() -> Result<T, E> + Send + 'static>,
}

impl<T, E> TaggedTask<T, E> {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }
}

#[derive(Debug)]
pub enum TaskFailure<E> {
    Failed(E),
    Panicked(String),
}

impl<E: fmt::Display> fmt::Display for TaskFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::Failed(err) => write!(f, "{err}"),
            TaskFailure::Panicked(message) => write!(f, "task panicked: {message}"),
        }
    }
}

#[derive(Debug)]
pub struct TaggedOutcome<T, E> {
    pub name: String,
    pub result: Result<T, TaskFailure<E>>,
}

impl<T, E> TaggedOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("failed to start worker runtime: {0}")]
    Runtime(std::io::Error),
}

/// Runs all tasks concurrently and returns one outcome per task, in the
/// order the tasks were supplied.
pub fn join_all<T, E>(tasks: Vec<TaggedTask<T, E>>) -> Result<Vec<TaggedOutcome<T, E>>, FanoutError>
where
    T: Send + 'static,
    E: Send + 'static,
{
    if tasks.is_empty() {
        return Ok(Vec::new());
    }

    let workers = tasks.len().min(MAX_WORKER_THREADS);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .max_blocking_threads(workers)
        .build()
        .map_err(FanoutError::Runtime)?;

    let order: Vec<String> = tasks.iter().map(|task| task.name.clone()).collect();

    let mut outcomes = runtime.block_on(async move {
        let mut set = JoinSet::new();
        for (index, task) in tasks.into_iter().enumerate() {
            let TaggedTask { name, run } = task;
            set.spawn_blocking(move || (index, name, run()));
        }

        let mut collected: Vec<Option<TaggedOutcome<T, E>>> = Vec::new();
        collected.resize_with(set.len(), || None);

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, name, result)) => {
                    collected[index] = Some(TaggedOutcome {
                        name,
                        result: result.map_err(TaskFailure::Failed),
                    });
                }
                // A panicking task loses its index; it is matched back to
                // the first unfilled slot after the loop.
                Err(err) if err.is_panic() => {
                    log::warn!("fanout task panicked: {err}");
                }
                Err(err) => {
                    log::warn!("fanout task cancelled: {err}");
                }
            }
        }
        collected
    });

    let results = order
        .into_iter()
        .enumerate()
        .map(|(index, name)| match outcomes[index].take() {
            Some(outcome) => outcome,
            None => TaggedOutcome {
                name,
                result: Err(TaskFailure::Panicked(
                    "worker terminated before producing a result".to_string(),
                )),
            },
        })
        .collect();

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_preserve_submission_order() {
        let tasks: Vec<TaggedTask<u32, String>> = vec![
            TaggedTask::new("slow", || {
                std::thread::sleep(std::time::Duration::from_millis(30));
                Ok(1)
            }),
            TaggedTask::new("fast", || Ok(2)),
        ];

        let outcomes = join_all(tasks).unwrap();
        assert_eq!(outcomes[0].name, "slow");
        assert_eq!(outcomes[1].name, "fast");
        assert_eq!(*outcomes[0].result.as_ref().unwrap(), 1);
        assert_eq!(*outcomes[1].result.as_ref().unwrap(), 2);
    }

    #[test]
    fn one_failure_does_not_poison_the_batch() {
        let tasks: Vec<TaggedTask<&'static str, String>> = vec![
            TaggedTask::new("ok-a", || Ok("a")),
            TaggedTask::new("bad", || Err("backend unreachable".to_string())),
            TaggedTask::new("ok-b", || Ok("b")),
        ];

        let outcomes = join_all(tasks).unwrap();
        assert!(outcomes[0].is_success());
        assert!(!outcomes[1].is_success());
        assert!(outcomes[2].is_success());
        match &outcomes[1].result {
            Err(TaskFailure::Failed(message)) => assert_eq!(message, "backend unreachable"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn panic_is_recorded_as_failure() {
        let tasks: Vec<TaggedTask<u32, String>> = vec![
            TaggedTask::new("panics", || panic!("boom")),
            TaggedTask::new("survives", || Ok(7)),
        ];

        let outcomes = join_all(tasks).unwrap();
        assert!(matches!(
            outcomes[0].result,
            Err(TaskFailure::Panicked(_))
        ));
        assert_eq!(*outcomes[1].result.as_ref().unwrap(), 7);
    }

    #[test]
    fn empty_batch_is_a_noop() {
        let outcomes = join_all(Vec::<TaggedTask<(), String>>::new()).unwrap();
        assert!(outcomes.is_empty());
    }
}

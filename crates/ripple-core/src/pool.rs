//! Bounded-concurrency executor.
//!
//! Runs a worker over a list of items with at most `concurrency` invocations
//! in flight. Lanes pull the next index from a shared cursor, so a slow item
//! never holds back a static partition. Each invocation is isolated: an
//! error or panic is recorded against its own item and siblings keep going.
//! Results always come back in input order.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::join_all;
use futures::FutureExt;
use tracing::warn;

/// Why a single item did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemError<E> {
    /// The worker returned an error.
    Failed(E),
    /// The worker panicked; carries the panic message when it was a string.
    Panicked(String),
}

impl<E: std::fmt::Display> std::fmt::Display for ItemError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemError::Failed(e) => write!(f, "{e}"),
            ItemError::Panicked(msg) => write!(f, "worker panicked: {msg}"),
        }
    }
}

/// Outcome for one input item.
#[derive(Debug, Clone)]
pub struct ItemOutcome<T, R, E> {
    pub item: T,
    pub result: Result<R, ItemError<E>>,
}

impl<T, R, E> ItemOutcome<T, R, E> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Executor with a fixed upper bound on in-flight worker invocations.
#[derive(Debug, Clone, Copy)]
pub struct BoundedExecutor {
    concurrency: usize,
}

impl BoundedExecutor {
    /// `concurrency` is clamped to at least 1.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `worker` over `items`.
    ///
    /// Spawns `min(concurrency, items.len())` lanes on the current task; with
    /// a concurrency of 1 items are visited strictly in input order.
    pub async fn run<T, R, E, F, Fut>(&self, items: Vec<T>, worker: F) -> Vec<ItemOutcome<T, R, E>>
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let total = items.len();
        if total == 0 {
            return Vec::new();
        }

        let lanes = self.concurrency.min(total);
        let cursor = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<Result<R, ItemError<E>>>>> =
            Mutex::new((0..total).map(|_| None).collect());

        let lane = || async {
            loop {
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                if index >= total {
                    break;
                }
                let outcome = AssertUnwindSafe(worker(items[index].clone()))
                    .catch_unwind()
                    .await;
                let result = match outcome {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(ItemError::Failed(e)),
                    Err(payload) => {
                        let msg = panic_message(payload.as_ref());
                        warn!(index, panic = %msg, "bounded worker panicked");
                        Err(ItemError::Panicked(msg))
                    }
                };
                if let Ok(mut slots) = slots.lock() {
                    slots[index] = Some(result);
                }
            }
        };

        join_all((0..lanes).map(|_| lane())).await;

        let slots = slots.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        items
            .into_iter()
            .zip(slots)
            .map(|(item, slot)| ItemOutcome {
                item,
                result: slot.unwrap_or_else(|| {
                    Err(ItemError::Panicked("item was never claimed".to_string()))
                }),
            })
            .collect()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

//! Provides the request collapsing primitive which deduplicates concurrent loads.
//!
//! When many callers miss the cache for the same key at the same moment, we do not want each of
//! them to invoke the loader (or to fire a fetch at the owning peer) - that is the classic
//! thundering herd. Instead, the first caller becomes the **leader** and actually executes the
//! load, while all others simply await the leader's result. Both the value and the error of the
//! one execution are shared verbatim with every collapsed caller.
//!
//! Note that this primitive only deduplicates **concurrent** work - it does not cache. Once a
//! call has completed, its in-flight record is removed immediately and the next call for the
//! same key starts a fresh execution. The caching is the job of the
//! [Group](crate::group::Group) sitting on top.
use std::future::Future;
use std::sync::{Arc, Mutex};

use fnv::FnvHashMap;
use tokio::sync::broadcast;

/// The outcome of a collapsed execution.
///
/// The error travels inside an **Arc** as it has to be cloned once per collapsed caller, which
/// plain **anyhow** errors do not support.
pub type SharedResult<V> = Result<V, Arc<anyhow::Error>>;

/// Collapses concurrent executions for the same key into a single one.
///
/// For N concurrent [execute](SingleFlight::execute) calls with the same key, the wrapped task
/// runs exactly once and all N callers observe the outcome of that one execution.
///
/// # Examples
/// ```
/// # use ganymede::singleflight::SingleFlight;
/// # #[tokio::main]
/// # async fn main() {
/// let flights = SingleFlight::new();
///
/// let value = flights
///     .execute("answer", async { Ok(42) })
///     .await
///     .unwrap();
/// assert_eq!(value, 42);
/// # }
/// ```
#[derive(Default)]
pub struct SingleFlight<V: Clone> {
    in_flight: Mutex<FnvHashMap<String, broadcast::Sender<SharedResult<V>>>>,
}

/// Removes the in-flight record of a leader once its execution has completed.
///
/// The guard also covers the case of a leader future being dropped mid-execution (callers may
/// abandon a `get` at any await point): without the cleanup, the key would stay marked as
/// in-flight forever and every subsequent call for it would block indefinitely.
struct FlightGuard<'a, V: Clone> {
    flights: &'a SingleFlight<V>,
    key: &'a str,
    completed: bool,
}

impl<V: Clone> FlightGuard<'_, V> {
    /// Publishes the result of the leader's execution to all waiters and retires the record.
    ///
    /// The record is removed before the result is broadcast: a caller arriving after the
    /// removal starts a fresh execution, a caller which subscribed earlier still receives the
    /// buffered result.
    fn publish(mut self, result: SharedResult<V>) {
        self.completed = true;

        let sender = self.flights.in_flight.lock().unwrap().remove(self.key);
        if let Some(sender) = sender {
            // If no waiter collapsed onto this call, there is nobody to notify...
            let _ = sender.send(result);
        }
    }
}

impl<V: Clone> Drop for FlightGuard<'_, V> {
    fn drop(&mut self) {
        if !self.completed {
            // The leader was dropped before completing - retire the record so that the key
            // stays loadable. Dropping the sender wakes all waiters with a receive error.
            let _ = self.flights.in_flight.lock().unwrap().remove(self.key);
        }
    }
}

impl<V: Clone> SingleFlight<V> {
    /// Creates a new collapsing primitive with no calls in flight.
    pub fn new() -> Self {
        SingleFlight {
            in_flight: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Executes the given task unless a call for the same key is already in flight.
    ///
    /// If one is, this caller blocks until that call completes and returns its result. If none
    /// is, this caller registers itself as the leader, runs the task on its own, shares the
    /// outcome with everyone who collapsed onto it in the meantime and removes the in-flight
    /// record.
    ///
    /// The internal lock is only held to check, insert or remove the record - never across the
    /// execution of the task itself.
    pub async fn execute<F>(&self, key: &str, task: F) -> SharedResult<V>
    where
        F: Future<Output = anyhow::Result<V>>,
    {
        let mut receiver = {
            let mut in_flight = self.in_flight.lock().unwrap();
            match in_flight.get(key) {
                Some(sender) => Some(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    let _ = in_flight.insert(key.to_owned(), sender);
                    None
                }
            }
        };

        if let Some(receiver) = receiver.as_mut() {
            // Another call is already underway - await and share its outcome...
            return match receiver.recv().await {
                Ok(result) => result,
                Err(_) => Err(Arc::new(anyhow::anyhow!(
                    "The collapsed load for this key was abandoned before completing."
                ))),
            };
        }

        // ...otherwise this caller leads the execution.
        let guard = FlightGuard {
            flights: self,
            key,
            completed: false,
        };

        let result = task.await.map_err(Arc::new);
        guard.publish(result.clone());

        result
    }
}

#[cfg(test)]
mod tests {
    use crate::singleflight::SingleFlight;
    use crate::testing::test_async;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn concurrent_calls_collapse_into_one_execution() {
        test_async(async {
            let flights: Arc<SingleFlight<String>> = Arc::new(SingleFlight::new());
            let executions = Arc::new(AtomicUsize::new(0));

            let mut tasks = Vec::new();
            for _ in 0..8 {
                let flights = flights.clone();
                let executions = executions.clone();
                tasks.push(tokio::spawn(async move {
                    flights
                        .execute("key", async {
                            let _ = executions.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok("value".to_owned())
                        })
                        .await
                }));
            }

            for task in futures::future::join_all(tasks).await {
                assert_eq!(task.unwrap().unwrap(), "value".to_owned());
            }

            // All eight callers were served by a single execution...
            assert_eq!(executions.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn errors_are_shared_with_all_collapsed_callers() {
        test_async(async {
            let flights: Arc<SingleFlight<String>> = Arc::new(SingleFlight::new());
            let executions = Arc::new(AtomicUsize::new(0));

            let mut tasks = Vec::new();
            for _ in 0..4 {
                let flights = flights.clone();
                let executions = executions.clone();
                tasks.push(tokio::spawn(async move {
                    flights
                        .execute("key", async {
                            let _ = executions.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Err(anyhow::anyhow!("backend unavailable"))
                        })
                        .await
                }));
            }

            for task in futures::future::join_all(tasks).await {
                let error = task.unwrap().unwrap_err();
                assert_eq!(error.to_string(), "backend unavailable");
            }

            assert_eq!(executions.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn completed_calls_are_not_cached() {
        test_async(async {
            let flights: SingleFlight<i32> = SingleFlight::new();
            let executions = AtomicUsize::new(0);

            for _ in 0..3 {
                let value = flights
                    .execute("key", async {
                        let _ = executions.fetch_add(1, Ordering::SeqCst);
                        Ok(7)
                    })
                    .await
                    .unwrap();
                assert_eq!(value, 7);
            }

            // Sequential calls each trigger a fresh execution - collapsing only applies to
            // concurrent work...
            assert_eq!(executions.load(Ordering::SeqCst), 3);
        });
    }

    #[test]
    fn different_keys_do_not_collapse() {
        test_async(async {
            let flights: Arc<SingleFlight<String>> = Arc::new(SingleFlight::new());
            let executions = Arc::new(AtomicUsize::new(0));

            let mut tasks = Vec::new();
            for index in 0..4 {
                let flights = flights.clone();
                let executions = executions.clone();
                tasks.push(tokio::spawn(async move {
                    let key = format!("key{}", index);
                    flights
                        .execute(&key, async {
                            let _ = executions.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(key.clone())
                        })
                        .await
                }));
            }

            for (index, task) in futures::future::join_all(tasks).await.into_iter().enumerate() {
                assert_eq!(task.unwrap().unwrap(), format!("key{}", index));
            }

            assert_eq!(executions.load(Ordering::SeqCst), 4);
        });
    }
}

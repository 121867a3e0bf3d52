//! Async memoization primitive shared by the resource loader and the module
//! provider.

use std::future::Future;
use std::pin::pin;
use std::sync::Mutex;

use tokio::sync::Notify;

enum State<T> {
    NotStarted,
    InFlight,
    Done(T),
}

/// A once-per-process slot for the result of an expensive async acquisition.
///
/// The first caller runs the init future; concurrent callers await the same
/// in-flight outcome instead of duplicating the work. Success is cached for
/// the lifetime of the slot. Failure caches nothing: the error propagates to
/// the caller that ran the init, and any waiters retry from scratch with
/// their own init.
pub struct OnceState<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T: Clone> OnceState<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::NotStarted),
            notify: Notify::new(),
        }
    }

    /// True once a value has been stored.
    pub fn is_done(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Done(_))
    }

    pub async fn get_or_try_init<F, Fut, E>(&self, init: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut init = Some(init);
        loop {
            // Register for wakeups before inspecting the state so a
            // notify_waiters between the inspection and the await is not
            // lost.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            let run = {
                let mut state = self.state.lock().unwrap();
                match &*state {
                    State::Done(value) => return Ok(value.clone()),
                    State::InFlight => false,
                    State::NotStarted => {
                        *state = State::InFlight;
                        true
                    }
                }
            };

            if !run {
                notified.await;
                continue;
            }

            // This branch is reachable at most once per call: it consumes the
            // init and always returns.
            let Some(init) = init.take() else {
                unreachable!("init already consumed");
            };
            match init().await {
                Ok(value) => {
                    *self.state.lock().unwrap() = State::Done(value.clone());
                    self.notify.notify_waiters();
                    return Ok(value);
                }
                Err(err) => {
                    *self.state.lock().unwrap() = State::NotStarted;
                    self.notify.notify_waiters();
                    return Err(err);
                }
            }
        }
    }
}

impl<T: Clone> Default for OnceState<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn caches_success() {
        let slot = OnceState::new();
        let runs = AtomicUsize::new(0);
        for _ in 0..3 {
            let value: Result<u32, ()> = slot
                .get_or_try_init(|| async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await;
            assert_eq!(value, Ok(7));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(slot.is_done());
    }

    #[tokio::test]
    async fn failure_is_not_cached() {
        let slot = OnceState::new();
        let first: Result<u32, &str> = slot.get_or_try_init(|| async { Err("nope") }).await;
        assert_eq!(first, Err("nope"));
        assert!(!slot.is_done());
        let second: Result<u32, &str> = slot.get_or_try_init(|| async { Ok(3) }).await;
        assert_eq!(second, Ok(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_run() {
        let slot = Arc::new(OnceState::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let slot = slot.clone();
            let runs = runs.clone();
            tasks.push(tokio::spawn(async move {
                slot.get_or_try_init(|| async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, ()>(42)
                })
                .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.expect("join"), Ok(42));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}

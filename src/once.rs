use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        OnceLock,
    },
    task::{Context, Poll, Waker},
};

use parking_lot::{Condvar, Mutex};
use slab::Slab;

use crate::Error;

/// Runs an initializer at most once, no matter how many threads or tasks ask
/// for the value at the same time.
///
/// Blocking callers park on a condvar, async callers park their waker in a
/// slab. Both kinds of caller may race on the same guard. Once an initializer
/// has started the guard always fires: if it unwinds or its future is dropped,
/// the guard fires with [`Error::LoaderPanicked`] or [`Error::LoadCancelled`]
/// and never runs another initializer.
pub(crate) struct OnceGuard<T> {
    value: OnceLock<Result<T, Error>>,
    state: Mutex<State>,
    ready: Condvar,
}

enum State {
    Idle,
    Running { epoch: u64, wakers: Slab<Waker> },
}

impl<T> Default for OnceGuard<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OnceGuard<T> {
    pub fn new() -> Self {
        Self {
            value: OnceLock::new(),
            state: Mutex::new(State::Idle),
            ready: Condvar::new(),
        }
    }

    pub fn get(&self) -> Option<Result<&T, Error>> {
        self.value.get().map(fired)
    }

    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> Result<&T, Error> {
        if let Some(value) = self.get() {
            return value;
        }

        let mut state = self.state.lock();
        let running = loop {
            if let Some(value) = self.get() {
                return value;
            }
            match &*state {
                State::Idle => break self.start(&mut state),
                State::Running { .. } => self.ready.wait(&mut state),
            }
        };
        drop(state);

        running.complete(init())
    }

    pub async fn get_or_init_async<F>(&self, init: impl FnOnce() -> F) -> Result<&T, Error>
    where
        F: Future<Output = T>,
    {
        match (Claim { once: self, slot: None }).await {
            Claimed::Ready(value) => value,
            Claimed::Run(running) => running.complete(init().await),
        }
    }

    fn start(&self, state: &mut State) -> Running<'_, T> {
        static EPOCH: AtomicU64 = AtomicU64::new(0);

        debug_assert!(matches!(state, State::Idle));
        *state = State::Running {
            epoch: EPOCH.fetch_add(1, Ordering::Relaxed),
            wakers: Slab::new(),
        };
        Running {
            once: self,
            armed: true,
        }
    }

    /// Stores the outcome, then wakes everybody parked on the guard.
    fn fire(&self, outcome: Result<T, Error>) -> Result<&T, Error> {
        let fired = fired(self.value.get_or_init(|| outcome));

        let wakers = match std::mem::replace(&mut *self.state.lock(), State::Idle) {
            State::Running { wakers, .. } => wakers,
            State::Idle => Slab::new(),
        };
        self.ready.notify_all();
        wakers.into_iter().for_each(|(_, waker)| waker.wake());

        fired
    }
}

fn fired<T>(outcome: &Result<T, Error>) -> Result<&T, Error> {
    outcome.as_ref().map_err(|err| *err)
}

/// Held by whichever caller is currently running the initializer.
struct Running<'a, T> {
    once: &'a OnceGuard<T>,
    armed: bool,
}

impl<'a, T> Running<'a, T> {
    fn complete(mut self, value: T) -> Result<&'a T, Error> {
        self.armed = false;
        self.once.fire(Ok(value))
    }
}

impl<T> Drop for Running<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            let err = if std::thread::panicking() {
                Error::LoaderPanicked
            } else {
                Error::LoadCancelled
            };
            tracing::warn!(%err, "initializer did not finish");
            let _ = self.once.fire(Err(err));
        }
    }
}

enum Claimed<'a, T> {
    Ready(Result<&'a T, Error>),
    Run(Running<'a, T>),
}

/// Resolves once the guard has fired or this task has become the runner.
struct Claim<'a, T> {
    once: &'a OnceGuard<T>,
    slot: Option<(u64, usize)>,
}

impl<'a, T> Future for Claim<'a, T> {
    type Output = Claimed<'a, T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let once = self.once;
        if let Some(value) = once.get() {
            self.slot = None;
            return Poll::Ready(Claimed::Ready(value));
        }

        let mut state = once.state.lock();
        if let Some(value) = once.get() {
            self.slot = None;
            return Poll::Ready(Claimed::Ready(value));
        }

        match &mut *state {
            State::Idle => {
                self.slot = None;
                Poll::Ready(Claimed::Run(once.start(&mut state)))
            }
            State::Running { epoch, wakers } => {
                match self.slot {
                    Some((registered, key)) if registered == *epoch && wakers.contains(key) => {
                        wakers[key].clone_from(cx.waker());
                    }
                    _ => {
                        let key = wakers.insert(cx.waker().clone());
                        self.slot = Some((*epoch, key));
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for Claim<'_, T> {
    fn drop(&mut self) {
        if let Some((registered, key)) = self.slot.take() {
            if let State::Running { epoch, wakers } = &mut *self.once.state.lock() {
                if *epoch == registered && wakers.contains(key) {
                    wakers.remove(key);
                }
            }
        }
    }
}

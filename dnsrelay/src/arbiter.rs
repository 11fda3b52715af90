// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! The arbiter: a per-session, single-flight scheduler that decides which
//! of several candidate answers actually gets sent to the client.
//!
//! Each upstream response produces a verdict (drop/accept/delay). `Accept`
//! and `Delay` candidates are raced against each other: the first one whose
//! delay elapses wins, and firing is guaranteed to happen at most once even
//! though later, shorter delays can still beat an earlier, longer one.
//!
//! The scheduler itself is a single reschedulable timer task: only the
//! earliest-firing candidate seen so far has a live timer running. A new,
//! earlier candidate cancels that timer and starts its own. Cancellation
//! races with the old timer's own firing; both sides are reconciled by a
//! single atomic "already fired" flag, so at most one `on_fire` ever runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct Scheduled {
    fire_at: Instant,
    handle: JoinHandle<()>,
}

struct State {
    current: Option<Scheduled>,
}

/// Single-flight delay scheduler, one per client session.
pub struct Arbiter {
    state: Mutex<State>,
    fired: Arc<AtomicBool>,
}

impl Arbiter {
    /// Create an arbiter that has not yet fired.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State { current: None }),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Has some candidate already won? Once true, `submit` is a no-op.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Submit a candidate with the given delay. If the arbiter has already
    /// fired, this is ignored. Otherwise, if `delay` is earlier than the
    /// currently scheduled candidate (or nothing is scheduled yet), the
    /// existing timer is cancelled and replaced with one for this candidate.
    /// A zero delay fires `on_fire` immediately, synchronously, without ever
    /// spawning a timer task.
    pub async fn submit<F, Fut>(&self, delay: Duration, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.fired.load(Ordering::SeqCst) {
            return;
        }

        if delay.is_zero() {
            if self.fired.swap(true, Ordering::SeqCst) {
                return;
            }
            let mut guard = self.state.lock().await;
            if let Some(prev) = guard.current.take() {
                prev.handle.abort();
            }
            drop(guard);
            on_fire().await;
            return;
        }

        let fire_at = Instant::now() + delay;
        let mut guard = self.state.lock().await;
        if let Some(existing) = &guard.current {
            if existing.fire_at <= fire_at {
                return;
            }
        }

        if let Some(prev) = guard.current.take() {
            prev.handle.abort();
        }

        let fired = Arc::clone(&self.fired);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(fire_at.into()).await;
            if fired.swap(true, Ordering::SeqCst) {
                return;
            }
            on_fire().await;
        });

        guard.current = Some(Scheduled { fire_at, handle });
    }
}

impl Default for Arbiter {
    fn default() -> Self {
        Self::new()
    }
}

// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Hashed timing wheel for idle-connection eviction.
//!
//! Keys are never the raw fd. A fd can be reused by the kernel the instant it is closed; a
//! cancel-by-fd issued after that reuse would hit the wrong connection. Instead each scheduled
//! task is keyed by a [`TimerKey`] minted from a monotonically increasing counter, stable for the
//! lifetime of the logical connection it was created for.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::debug;

/// Opaque, monotonically increasing identity for a scheduled timer. Never reused, unlike a raw
/// file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey(u64);

/// Mints unique [`TimerKey`]s. One instance is shared by the reactor for the lifetime of the
/// process.
#[derive(Debug, Default)]
pub struct TimerKeyGenerator {
    next: AtomicU64,
}

impl TimerKeyGenerator {
    /// Produces a fresh, never-before-seen key.
    pub fn next(&self) -> TimerKey {
        TimerKey(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

type Callback = Box<dyn FnOnce() + Send>;

struct Task {
    key: TimerKey,
    rotation: u64,
    callback: Callback,
}

struct Inner {
    tick_ms: u64,
    slots: Vec<Vec<Task>>,
    index: HashMap<TimerKey, (usize, usize)>, // key -> (slot, index within that slot's Vec)
    current_slot: usize,
    current_tick: u64,
    closed: bool,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("tick_ms", &self.tick_ms)
            .field("slots", &self.slots.iter().map(Vec::len).collect::<Vec<_>>())
            .field("index", &self.index)
            .field("current_slot", &self.current_slot)
            .field("current_tick", &self.current_tick)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Inner {
    fn slot_for(&self, timeout_ms: u64) -> (usize, u64) {
        let ticks = timeout_ms.div_ceil(self.tick_ms).max(1);
        let slot = (self.current_slot as u64 + ticks) as usize % self.slots.len();
        let rotation = (self.current_slot as u64 + ticks) / self.slots.len() as u64;
        (slot, rotation)
    }

    fn schedule(&mut self, key: TimerKey, timeout_ms: u64, callback: Callback) {
        self.cancel(key);
        let (slot, rotation) = self.slot_for(timeout_ms);
        self.slots[slot].push(Task {
            key,
            rotation,
            callback,
        });
        self.index.insert(key, (slot, self.slots[slot].len() - 1));
    }

    fn cancel(&mut self, key: TimerKey) -> bool {
        let Some((slot, pos)) = self.index.remove(&key) else {
            return false;
        };
        // `swap_remove` moves the slot's last task into `pos` instead of shifting everything
        // after it down, so removal stays O(1) instead of O(slot length).
        self.slots[slot].swap_remove(pos);
        if let Some(moved) = self.slots[slot].get(pos) {
            if let Some(entry) = self.index.get_mut(&moved.key) {
                entry.1 = pos;
            }
        }
        true
    }

    /// Advances one tick, firing (and removing) every task in the current slot whose rotation has
    /// reached 0, and decrementing the rest.
    fn tick(&mut self) -> Vec<Callback> {
        self.current_slot = (self.current_slot + 1) % self.slots.len();
        self.current_tick += 1;

        let slot = &mut self.slots[self.current_slot];
        let mut fired = Vec::new();
        let mut remaining = Vec::with_capacity(slot.len());

        for mut task in slot.drain(..) {
            if task.rotation == 0 {
                self.index.remove(&task.key);
                fired.push(std::mem::replace(&mut task.callback, Box::new(|| {})));
            } else {
                task.rotation -= 1;
                remaining.push(task);
            }
        }

        for (i, task) in remaining.iter().enumerate() {
            self.index.insert(task.key, (self.current_slot, i));
        }
        *slot = remaining;

        fired
    }
}

/// A hashed timing wheel, ticking on its own background thread.
///
/// `tick_ms * slots` must be at least as large as the longest timeout the caller will ever
/// schedule, or a long timeout silently wraps to a shorter one.
#[derive(Debug)]
pub struct TimerWheel {
    inner: Arc<Mutex<Inner>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerWheel {
    /// Creates a wheel with `slots` buckets of `tick_ms` milliseconds each.
    pub fn new(tick_ms: u64, slots: usize) -> Self {
        assert!(tick_ms > 0, "tick_ms must be positive");
        assert!(slots > 0, "slots must be positive");

        Self {
            inner: Arc::new(Mutex::new(Inner {
                tick_ms,
                slots: (0..slots).map(|_| Vec::new()).collect(),
                index: HashMap::new(),
                current_slot: 0,
                current_tick: 0,
                closed: false,
            })),
            thread: Mutex::new(None),
        }
    }

    /// Schedules `callback` to run after `timeout_ms`, keyed by `key`. Scheduling over an existing
    /// key cancels the prior entry. A `timeout_ms` of 0 is rejected by the caller (spec.md: the
    /// idle timer is simply never scheduled when disabled).
    pub fn schedule(&self, key: TimerKey, timeout_ms: u64, callback: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        inner.schedule(key, timeout_ms, Box::new(callback));
    }

    /// Cancels a previously scheduled timer. Returns `true` if a task was actually removed.
    ///
    /// If a fire and a cancel race, the fire wins only if it has already removed the entry from
    /// the index by the time `cancel` runs; otherwise the cancel wins, which is exactly what this
    /// shared index (checked under the same lock `tick()` uses) guarantees.
    pub fn cancel(&self, key: TimerKey) -> bool {
        self.inner.lock().unwrap().cancel(key)
    }

    /// Advances the wheel by one tick's worth of time, firing due callbacks. Exposed for tests;
    /// `run()` drives this from a dedicated thread in production.
    pub fn tick(&self) {
        let fired = self.inner.lock().unwrap().tick();
        for callback in fired {
            callback();
        }
    }

    /// Starts the background thread that calls `tick()` every `tick_ms` milliseconds until
    /// `close()` is called. Missed ticks (e.g. scheduling jitter under load) coalesce: each call
    /// to `tick()` only advances by one slot, but the loop catches up by calling it repeatedly
    /// rather than skipping ahead.
    pub fn run(self: &Arc<Self>) {
        let wheel = Arc::clone(self);
        let tick_ms = self.inner.lock().unwrap().tick_ms;

        let handle = thread::Builder::new()
            .name("timer-wheel".into())
            .spawn(move || loop {
                thread::sleep(Duration::from_millis(tick_ms));
                if wheel.inner.lock().unwrap().closed {
                    return;
                }
                wheel.tick();
            })
            .expect("failed to spawn timer-wheel thread");

        *self.thread.lock().unwrap() = Some(handle);
    }

    /// Requests shutdown, joins the background thread, and drains any remaining tasks without
    /// firing them. Safe to call more than once.
    pub fn close(&self) {
        let already_closed = {
            let mut inner = self.inner.lock().unwrap();
            let was_closed = inner.closed;
            inner.closed = true;
            for slot in inner.slots.iter_mut() {
                slot.clear();
            }
            inner.index.clear();
            was_closed
        };

        if already_closed {
            return;
        }

        if let Some(handle) = self.thread.lock().unwrap().take() {
            debug!("joining timer-wheel thread");
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn keygen() -> TimerKeyGenerator {
        TimerKeyGenerator::default()
    }

    #[test]
    fn fires_after_enough_ticks() {
        let wheel = TimerWheel::new(10, 8);
        let gen = keygen();
        let key = gen.next();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        wheel.schedule(key, 25, move || flag.store(true, Ordering::SeqCst));

        wheel.tick();
        assert!(!fired.load(Ordering::SeqCst));
        wheel.tick();
        assert!(!fired.load(Ordering::SeqCst));
        wheel.tick();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_before_fire_prevents_callback() {
        let wheel = TimerWheel::new(10, 8);
        let gen = keygen();
        let key = gen.next();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        wheel.schedule(key, 10, move || flag.store(true, Ordering::SeqCst));
        assert!(wheel.cancel(key));
        wheel.tick();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn rescheduling_same_key_replaces_prior_entry() {
        let wheel = TimerWheel::new(10, 8);
        let gen = keygen();
        let key = gen.next();
        let count = Arc::new(AtomicU64::new(0));

        let c1 = Arc::clone(&count);
        wheel.schedule(key, 10, move || {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&count);
        wheel.schedule(key, 10, move || {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        wheel.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rotation_handles_long_timeouts_across_multiple_wraps() {
        let wheel = TimerWheel::new(10, 4); // wheel only covers 40ms directly
        let gen = keygen();
        let key = gen.next();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        wheel.schedule(key, 100, move || flag.store(true, Ordering::SeqCst));

        for _ in 0..9 {
            wheel.tick();
        }
        assert!(!fired.load(Ordering::SeqCst));
        wheel.tick();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn close_is_idempotent() {
        let wheel = TimerWheel::new(10, 4);
        wheel.close();
        wheel.close();
    }
}

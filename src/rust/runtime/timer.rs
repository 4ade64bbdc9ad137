// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! One-shot, periodic and next-tick timers driven by a logical clock.
//!
//! The clock only moves when [SharedTimer::advance_clock] is called. Every call is one scheduler tick: it fires the
//! entries that were due when the tick started, so callbacks scheduled from inside a callback (even with zero delay)
//! always wait for the next tick.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::core::cmp::Reverse;
use ::std::{
    cell::RefCell,
    collections::BinaryHeap,
    fmt,
    rc::{
        Rc,
        Weak,
    },
    time::{
        Duration,
        Instant,
    },
};

//==============================================================================
// Structures
//==============================================================================

enum Callback {
    Once(Box<dyn FnOnce() -> Result<(), Fail>>),
    Every(Box<dyn FnMut() -> Result<(), Fail>>),
}

struct TimerSlot {
    /// Re-arm period of a periodic timer.
    interval: Option<Duration>,
    callback: Option<Callback>,
    /// Bumped on every arm. Queue entries carrying an older generation are stale.
    generation: u64,
    is_cancelled: bool,
    has_fired: bool,
    timer: Weak<RefCell<Timer>>,
}

/// Handle to a scheduled callback. Clones refer to the same timer.
#[derive(Clone)]
pub struct TimerHandle(Rc<RefCell<TimerSlot>>);

struct TimerQueueEntry {
    expiry: Instant,
    /// Insertion order, so that entries with the same expiry fire first-in first-out.
    seq: u64,
    generation: u64,
    handle: TimerHandle,
}

/// Timer that holds one or more events for future wake up.
pub struct Timer {
    now: Instant,
    seq: u64,
    // Use a reverse to get a min heap.
    heap: BinaryHeap<Reverse<TimerQueueEntry>>,
}

#[derive(Clone)]
pub struct SharedTimer(Rc<RefCell<Timer>>);

//==============================================================================
// Thread Locals
//==============================================================================

thread_local! {
    static THREAD_TIMER: SharedTimer = SharedTimer::new(Instant::now());
}

//==============================================================================
// Associate Functions
//==============================================================================

impl SharedTimer {
    pub fn new(now: Instant) -> Self {
        Self(Rc::new(RefCell::new(Timer {
            now,
            seq: 0,
            heap: BinaryHeap::new(),
        })))
    }

    /// Returns the timer of the calling thread.
    pub fn current() -> Self {
        THREAD_TIMER.with(|timer| timer.clone())
    }

    pub fn now(&self) -> Instant {
        self.0.borrow().now
    }

    /// Runs `callback` once, `delay` after the current time.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() -> Result<(), Fail> + 'static,
    {
        let handle: TimerHandle = self.new_handle(None, Callback::Once(Box::new(callback)));
        let expiry: Instant = self.now() + delay;
        self.arm(&handle, expiry);
        handle
    }

    /// Runs `callback` every `interval` until the returned handle is cancelled.
    pub fn every<F>(&self, interval: Duration, callback: F) -> TimerHandle
    where
        F: FnMut() -> Result<(), Fail> + 'static,
    {
        let handle: TimerHandle = self.new_handle(Some(interval), Callback::Every(Box::new(callback)));
        let expiry: Instant = self.now() + interval;
        self.arm(&handle, expiry);
        handle
    }

    /// Runs `callback` on the next tick.
    pub fn next_tick<F>(&self, callback: F) -> TimerHandle
    where
        F: FnOnce() -> Result<(), Fail> + 'static,
    {
        self.schedule(Duration::ZERO, callback)
    }

    /// Moves time forward and fires every timer that was due when this tick started.
    pub fn advance_clock(&self, now: Instant) -> Result<(), Fail> {
        let expired: Vec<TimerQueueEntry> = {
            let mut timer = self.0.borrow_mut();
            if now > timer.now {
                timer.now = now;
            } else if now < timer.now {
                debug!("advance_clock(): clock would move backwards, firing at {:?}", timer.now);
            }
            let now: Instant = timer.now;
            let mut expired: Vec<TimerQueueEntry> = Vec::new();
            while let Some(Reverse(entry)) = timer.heap.peek() {
                if now < entry.expiry {
                    break;
                }
                let Reverse(entry) = timer.heap.pop().expect("should have an entry because we were able to peek");
                expired.push(entry);
            }
            expired
        };

        if !expired.is_empty() {
            trace!("advance_clock(): {} timers expiring", expired.len());
        }

        let mut expired = expired.into_iter();
        while let Some(entry) = expired.next() {
            if let Err(e) = entry.handle.fire(Some(entry.generation)) {
                // Keep whatever this tick did not get to.
                let mut timer = self.0.borrow_mut();
                for entry in expired {
                    timer.heap.push(Reverse(entry));
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Advances the clock to the wall-clock time.
    pub fn poll(&self) -> Result<(), Fail> {
        self.advance_clock(Instant::now())
    }

    /// Returns when the earliest live timer expires, if any.
    pub fn next_expiry(&self) -> Option<Instant> {
        let mut timer = self.0.borrow_mut();
        while let Some(Reverse(entry)) = timer.heap.peek() {
            if entry.handle.is_live(entry.generation) {
                return Some(entry.expiry);
            }
            timer.heap.pop();
        }
        None
    }

    fn new_handle(&self, interval: Option<Duration>, callback: Callback) -> TimerHandle {
        TimerHandle(Rc::new(RefCell::new(TimerSlot {
            interval,
            callback: Some(callback),
            generation: 0,
            is_cancelled: false,
            has_fired: false,
            timer: Rc::downgrade(&self.0),
        })))
    }

    fn arm(&self, handle: &TimerHandle, expiry: Instant) {
        let generation: u64 = {
            let mut slot = handle.0.borrow_mut();
            slot.generation += 1;
            slot.generation
        };
        let mut timer = self.0.borrow_mut();
        timer.seq += 1;
        let seq: u64 = timer.seq;
        timer.heap.push(Reverse(TimerQueueEntry {
            expiry,
            seq,
            generation,
            handle: handle.clone(),
        }));
    }
}

impl TimerHandle {
    /// Stops this timer. Its callback is dropped and will never run.
    pub fn cancel(&self) {
        let callback: Option<Callback> = {
            let mut slot = self.0.borrow_mut();
            slot.is_cancelled = true;
            slot.callback.take()
        };
        drop(callback);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.borrow().is_cancelled
    }

    /// Has this timer fired at least once?
    pub fn has_fired(&self) -> bool {
        self.0.borrow().has_fired
    }

    /// Is this timer still going to fire?
    pub fn is_active(&self) -> bool {
        let slot = self.0.borrow();
        !slot.is_cancelled && (slot.interval.is_some() || !slot.has_fired)
    }

    /// Fires this timer immediately instead of waiting for it to expire. Returns `false` when there was nothing to fire
    /// because the timer was cancelled or already spent.
    pub fn fire_now(&self) -> Result<bool, Fail> {
        if !self.is_active() {
            return Ok(false);
        }
        self.fire(None)?;
        Ok(true)
    }

    fn is_live(&self, generation: u64) -> bool {
        let slot = self.0.borrow();
        !slot.is_cancelled && slot.generation == generation && (slot.interval.is_some() || !slot.has_fired)
    }

    /// Runs the callback. `generation` identifies the queue entry that expired; `None` means an explicit fire.
    fn fire(&self, generation: Option<u64>) -> Result<(), Fail> {
        let callback: Callback = {
            let mut slot = self.0.borrow_mut();
            if let Some(generation) = generation {
                if slot.generation != generation {
                    return Ok(());
                }
            }
            if slot.is_cancelled || (slot.interval.is_none() && slot.has_fired) {
                return Ok(());
            }
            slot.has_fired = true;
            match slot.callback.take() {
                Some(callback) => callback,
                None => return Ok(()),
            }
        };

        match callback {
            Callback::Once(callback) => callback(),
            Callback::Every(mut callback) => {
                let result: Result<(), Fail> = callback();
                let rearm: Option<(SharedTimer, Duration)> = {
                    let mut slot = self.0.borrow_mut();
                    match (slot.is_cancelled, slot.interval, slot.timer.upgrade()) {
                        (false, Some(interval), Some(timer)) => {
                            slot.callback = Some(Callback::Every(callback));
                            Some((SharedTimer(timer), interval))
                        },
                        _ => None,
                    }
                };
                if let Some((timer, interval)) = rearm {
                    let expiry: Instant = timer.now() + interval;
                    timer.arm(self, expiry);
                }
                result
            },
        }
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// Runs `callback` once on this thread's timer, `delay` from now.
pub fn schedule<F>(delay: Duration, callback: F) -> TimerHandle
where
    F: FnOnce() -> Result<(), Fail> + 'static,
{
    SharedTimer::current().schedule(delay, callback)
}

/// Runs `callback` every `interval` on this thread's timer.
pub fn every<F>(interval: Duration, callback: F) -> TimerHandle
where
    F: FnMut() -> Result<(), Fail> + 'static,
{
    SharedTimer::current().every(interval, callback)
}

/// Runs `callback` on the next tick of this thread's timer.
pub fn next_tick<F>(callback: F) -> TimerHandle
where
    F: FnOnce() -> Result<(), Fail> + 'static,
{
    SharedTimer::current().next_tick(callback)
}

/// Current time of this thread's timer.
pub fn now() -> Instant {
    SharedTimer::current().now()
}

/// Runs one tick of this thread's timer at `now`.
pub fn advance_clock(now: Instant) -> Result<(), Fail> {
    SharedTimer::current().advance_clock(now)
}

/// Runs one tick of this thread's timer at the wall-clock time.
pub fn poll() -> Result<(), Fail> {
    SharedTimer::current().poll()
}

/// When the earliest live timer of this thread expires.
pub fn next_expiry() -> Option<Instant> {
    SharedTimer::current().next_expiry()
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Default for SharedTimer {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

impl PartialEq for TimerHandle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TimerHandle {}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.0.borrow();
        f.debug_struct("TimerHandle")
            .field("interval", &slot.interval)
            .field("is_cancelled", &slot.is_cancelled)
            .field("has_fired", &slot.has_fired)
            .finish()
    }
}

impl PartialEq for TimerQueueEntry {
    fn eq(&self, other: &TimerQueueEntry) -> bool {
        self.expiry == other.expiry && self.seq == other.seq
    }
}

impl Eq for TimerQueueEntry {}

impl PartialOrd for TimerQueueEntry {
    fn partial_cmp(&self, other: &TimerQueueEntry) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerQueueEntry {
    fn cmp(&self, other: &TimerQueueEntry) -> core::cmp::Ordering {
        // Compare timer queue entries by expiration time, then by insertion order.
        self.expiry.cmp(&other.expiry).then(self.seq.cmp(&other.seq))
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

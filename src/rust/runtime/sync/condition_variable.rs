// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::{
        Job,
        Wakeup,
    },
    sync::mutex::Mutex,
    timer,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    collections::VecDeque,
    mem,
    rc::Rc,
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

struct Waiter {
    mutex: Mutex,
    job: Job,
    /// Cleared when the job leaves `wait`, however it leaves.
    is_waiting: Rc<Cell<bool>>,
}

/// Condition variable for jobs. Waiters are woken in the order they started waiting.
#[derive(Clone, Default)]
pub struct ConditionVariable(Rc<RefCell<VecDeque<Waiter>>>);

struct WaiterGuard {
    cond_var: ConditionVariable,
    is_waiting: Rc<Cell<bool>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ConditionVariable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs waiting on this condition variable.
    pub fn waiter_count(&self) -> usize {
        self.0.borrow().len()
    }

    /// Releases `mutex` and suspends the calling job until it is signalled or `timeout` expires. The mutex is held
    /// again on return.
    pub async fn wait(&self, mutex: &Mutex, timeout: Option<Duration>) -> Result<Wakeup, Fail> {
        let is_waiting: Rc<Cell<bool>> = Rc::new(Cell::new(true));
        self.0.borrow_mut().push_back(Waiter {
            mutex: mutex.clone(),
            job: Job::current(),
            is_waiting: is_waiting.clone(),
        });
        let _guard: WaiterGuard = WaiterGuard {
            cond_var: self.clone(),
            is_waiting,
        };
        mutex.sleep_on(timeout).await
    }

    /// Wakes the longest waiting job, on the next tick.
    pub fn signal(&self) {
        loop {
            let waiter: Waiter = match self.0.borrow_mut().pop_front() {
                Some(waiter) => waiter,
                None => return,
            };
            if waiter.is_asleep() {
                Self::wake_on_next_tick(waiter);
                return;
            }
        }
    }

    /// Wakes every job that is waiting right now, on the next tick.
    pub fn broadcast(&self) {
        let waiters: VecDeque<Waiter> = mem::take(&mut *self.0.borrow_mut());
        for waiter in waiters {
            if waiter.is_asleep() {
                Self::wake_on_next_tick(waiter);
            }
        }
    }

    fn wake_on_next_tick(waiter: Waiter) {
        trace!("wake_on_next_tick(): {}", waiter.job);
        timer::next_tick(move || {
            if waiter.is_waiting.get() && waiter.is_asleep() {
                waiter.mutex.wake(&waiter.job)
            } else {
                Ok(())
            }
        });
    }
}

impl Waiter {
    /// Is the job still in the sleeping half of `wait`?
    fn is_asleep(&self) -> bool {
        self.job.is_alive() && self.job.is_asleep()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.is_waiting.set(false);
        let removed: Vec<Waiter> = {
            let mut waiters = self.cond_var.0.borrow_mut();
            let (removed, kept): (Vec<Waiter>, Vec<Waiter>) = mem::take(&mut *waiters)
                .into_iter()
                .partition(|waiter| Rc::ptr_eq(&waiter.is_waiting, &self.is_waiting));
            *waiters = kept.into();
            removed
        };
        drop(removed);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

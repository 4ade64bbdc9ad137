// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::{
        Job,
        State,
        Wakeup,
    },
    timer,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    collections::VecDeque,
    fmt,
    future::Future,
    rc::Rc,
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Identity of a mutex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MutexId(u64);

struct MutexInner {
    id: MutexId,
    /// The head of the queue holds the lock. The others wait in lock order.
    waiters: VecDeque<Job>,
    /// Has the head returned from `lock` yet? A head that was handed the lock may still be suspended.
    is_acquired: bool,
}

/// Mutex that hands the lock over to waiting jobs in the order they asked for it.
#[derive(Clone)]
pub struct Mutex(Rc<RefCell<MutexInner>>);

/// Takes a waiting job out of the queue if it stops waiting before it gets the lock.
struct WaitGuard {
    mutex: Mutex,
    job: Job,
    is_armed: bool,
}

//======================================================================================================================
// Thread Locals
//======================================================================================================================

thread_local! {
    static NEXT_MUTEX_ID: Cell<u64> = Cell::new(1);
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Mutex {
    pub fn new() -> Self {
        let id: MutexId = MutexId(NEXT_MUTEX_ID.with(|next| next.replace(next.get() + 1)));
        Self(Rc::new(RefCell::new(MutexInner {
            id,
            waiters: VecDeque::new(),
            is_acquired: false,
        })))
    }

    pub fn id(&self) -> MutexId {
        self.0.borrow().id
    }

    pub fn is_locked(&self) -> bool {
        !self.0.borrow().waiters.is_empty()
    }

    /// Returns the job that holds the lock.
    pub fn holder(&self) -> Option<Job> {
        self.0.borrow().waiters.front().cloned()
    }

    /// Acquires this lock, suspending the calling job until the lock is handed to it.
    pub async fn lock(&self) -> Result<(), Fail> {
        let job: Job = Job::current();
        if self.enqueue(&job)? {
            return Ok(());
        }

        let mut guard: WaitGuard = WaitGuard::new(self, &job);
        loop {
            job.suspend().await?;
            if self.is_head(&job) {
                guard.disarm();
                self.0.borrow_mut().is_acquired = true;
                return Ok(());
            }
        }
    }

    /// Acquires this lock only if nobody holds it.
    pub fn try_lock(&self) -> bool {
        let job: Job = Job::current();
        let mut inner = self.0.borrow_mut();
        if inner.waiters.is_empty() {
            inner.waiters.push_back(job);
            inner.is_acquired = true;
            true
        } else {
            false
        }
    }

    /// Releases this lock. The next waiter gets it on the next tick.
    pub fn unlock(&self) -> Result<(), Fail> {
        let job: Job = Job::current();
        let released: Option<Job> = {
            let mut inner = self.0.borrow_mut();
            if inner.waiters.front() == Some(&job) {
                inner.is_acquired = false;
                inner.waiters.pop_front()
            } else {
                None
            }
        };
        if released.is_none() {
            let cause: String = format!("{} does not hold mutex {:?}", job, self.id());
            error!("unlock(): {}", cause);
            return Err(Fail::new(libc::EPERM, &cause));
        }
        self.hand_off();
        Ok(())
    }

    /// Releases this lock, suspends the calling job until it is woken (or `timeout` expires) and then takes the lock
    /// back. The lock is held again on return whatever happened while asleep.
    pub async fn sleep_on(&self, timeout: Option<Duration>) -> Result<Wakeup, Fail> {
        let job: Job = Job::current();
        self.unlock()?;
        let slept: Result<Wakeup, Fail> = match timeout {
            Some(timeout) => job.sleep(timeout).await,
            None => job.suspend_as(State::AsleepMutex(self.id())).await,
        };
        let relocked: Result<(), Fail> = self.relock(&job).await;
        match (slept, relocked) {
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
            (Ok(wakeup), Ok(())) => Ok(wakeup),
        }
    }

    /// Runs `body` while holding this lock. The lock is released however `body` finishes.
    pub async fn synchronized<F, T>(&self, body: F) -> Result<T, Fail>
    where
        F: Future<Output = Result<T, Fail>>,
    {
        self.lock().await?;
        let result: Result<T, Fail> = body.await;
        let unlocked: Result<(), Fail> = self.unlock();
        match (result, unlocked) {
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    /// Wakes a job that is asleep in [Mutex::sleep_on].
    pub(crate) fn wake(&self, job: &Job) -> Result<(), Fail> {
        if let Some(handle) = job.timer() {
            handle.cancel();
            return job.resume_if(|state: &State| matches!(state, State::AsleepTimer(_)), Wakeup::Signal);
        }
        if job.mutex_asleep().is_some() {
            return job.resume(Wakeup::Signal);
        }
        let cause: String = format!("{} is not asleep ({:?})", job, job.state());
        error!("wake(): {}", cause);
        Err(Fail::new(libc::EINVAL, &cause))
    }

    /// Appends `job` to the queue. Returns whether it got the lock right away.
    fn enqueue(&self, job: &Job) -> Result<bool, Fail> {
        let mut inner = self.0.borrow_mut();
        if inner.waiters.contains(job) {
            let cause: String = format!("{} already holds or waits for mutex {:?}", job, inner.id);
            error!("lock(): {}", cause);
            return Err(Fail::new(libc::EDEADLK, &cause));
        }
        inner.waiters.push_back(job.clone());
        if inner.waiters.len() == 1 {
            inner.is_acquired = true;
            return Ok(true);
        }
        Ok(false)
    }

    /// Takes the lock back for a job that is leaving [Mutex::sleep_on]. A kill does not interrupt the wait; it is
    /// reported once the lock is held.
    async fn relock(&self, job: &Job) -> Result<(), Fail> {
        if !self.enqueue(job)? {
            let mut guard: WaitGuard = WaitGuard::new(self, job);
            loop {
                job.park().await?;
                if self.is_head(job) {
                    guard.disarm();
                    self.0.borrow_mut().is_acquired = true;
                    break;
                }
            }
        }
        if job.has_ended() {
            Err(Fail::killed())
        } else {
            Ok(())
        }
    }

    fn is_head(&self, job: &Job) -> bool {
        self.0.borrow().waiters.front() == Some(job)
    }

    /// Removes a job that gave up waiting. If it had already been handed the lock, the lock moves on.
    fn withdraw(&self, job: &Job) {
        let (removed, was_head) = {
            let mut inner = self.0.borrow_mut();
            match inner.waiters.iter().position(|waiter| waiter == job) {
                Some(0) => {
                    inner.is_acquired = false;
                    (inner.waiters.pop_front(), true)
                },
                Some(index) => (inner.waiters.remove(index), false),
                None => (None, false),
            }
        };
        drop(removed);
        if was_head {
            trace!("withdraw(): {} gave up the lock", job);
            self.hand_off();
        }
    }

    /// Resumes the new head of the queue on the next tick, unless it changed or took the lock in the meantime.
    fn hand_off(&self) {
        let head: Job = match self.0.borrow().waiters.front() {
            Some(head) => head.clone(),
            None => return,
        };
        let mutex: Mutex = self.clone();
        timer::next_tick(move || {
            if mutex.is_handed_to(&head) {
                head.resume(Wakeup::Signal)
            } else {
                Ok(())
            }
        });
    }

    /// Is `job` at the head of the queue but still waiting to return from `lock`?
    fn is_handed_to(&self, job: &Job) -> bool {
        let inner = self.0.borrow();
        !inner.is_acquired && inner.waiters.front() == Some(job)
    }
}

impl WaitGuard {
    fn new(mutex: &Mutex, job: &Job) -> Self {
        Self {
            mutex: mutex.clone(),
            job: job.clone(),
            is_armed: true,
        }
    }

    fn disarm(&mut self) {
        self.is_armed = false;
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.is_armed {
            self.mutex.withdraw(&self.job);
        }
    }
}

impl PartialEq for Mutex {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Mutex {}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("Mutex")
            .field("id", &inner.id)
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

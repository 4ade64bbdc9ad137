// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//==============================================================================
// Imports
//==============================================================================

use ::anyhow::Result;
use ::std::{
    cell::Cell,
    rc::Rc,
    time::Duration,
};
use ::tasklet::{
    defer,
    ensure_eq,
    ConditionVariable,
    Fail,
    Job,
    Mutex,
    Wakeup,
};
use common::{
    advance,
    new_log,
    settle,
    tick,
    Log,
};

//==============================================================================
// Mutex
//==============================================================================

#[test]
fn lock_order_is_submission_order() -> Result<()> {
    const NUM_JOBS: usize = 16;
    let mutex: Mutex = Mutex::new();
    let order: Log<usize> = new_log();
    let holders: Rc<Cell<usize>> = Rc::new(Cell::new(0));
    let max_holders: Rc<Cell<usize>> = Rc::new(Cell::new(0));

    for i in 0..NUM_JOBS {
        let (mutex, order, holders, max_holders) = (mutex.clone(), order.clone(), holders.clone(), max_holders.clone());
        defer(async move {
            mutex
                .synchronized(async {
                    holders.set(holders.get() + 1);
                    max_holders.set(max_holders.get().max(holders.get()));
                    order.borrow_mut().push(i);
                    // Hold the lock across a suspension point.
                    Job::current().sleep(Duration::from_millis(1)).await?;
                    holders.set(holders.get() - 1);
                    Ok(())
                })
                .await
        })?;
    }

    for _ in 0..NUM_JOBS {
        advance(Duration::from_millis(1))?;
        tick()?;
    }
    ensure_eq!(*order.borrow(), (0..NUM_JOBS).collect::<Vec<usize>>());
    ensure_eq!(max_holders.get(), 1);
    ensure_eq!(mutex.is_locked(), false);
    Ok(())
}

#[test]
fn synchronized_releases_the_lock_on_error() -> Result<()> {
    let mutex: Mutex = Mutex::new();
    let mutex_ref: Mutex = mutex.clone();
    let result: Result<Job, Fail> = defer(async move {
        mutex_ref
            .synchronized(async { Err::<(), Fail>(Fail::new(libc::EIO, "body failed")) })
            .await
    });
    ensure_eq!(result.map(|_| ()).map_err(|e| e.errno), Err(libc::EIO));
    ensure_eq!(mutex.is_locked(), false);
    Ok(())
}

#[test]
fn killed_holder_releases_the_lock_through_synchronized() -> Result<()> {
    let mutex: Mutex = Mutex::new();
    let log: Log<&'static str> = new_log();

    let mutex_ref: Mutex = mutex.clone();
    let holder: Job = defer(async move {
        mutex_ref
            .synchronized(async {
                Job::current().suspend().await?;
                Ok(())
            })
            .await
    })?;
    let (mutex_ref, log_ref) = (mutex.clone(), log.clone());
    defer(async move {
        mutex_ref
            .synchronized(async {
                log_ref.borrow_mut().push("second");
                Ok(())
            })
            .await
    })?;

    holder.kill()?;
    ensure_eq!(log.borrow().len(), 0);
    tick()?;
    ensure_eq!(*log.borrow(), vec!["second"]);
    ensure_eq!(mutex.is_locked(), false);
    Ok(())
}

//==============================================================================
// Condition Variable
//==============================================================================

fn spawn_waiter(
    cond_var: &ConditionVariable,
    mutex: &Mutex,
    id: usize,
    timeout: Option<Duration>,
    log: &Log<(usize, Wakeup, bool)>,
) -> Result<Job> {
    let (cond_var, mutex, log) = (cond_var.clone(), mutex.clone(), log.clone());
    let job: Job = defer(async move {
        mutex
            .synchronized(async {
                let wakeup: Wakeup = cond_var.wait(&mutex, timeout).await?;
                let is_holder: bool = mutex.holder() == Some(Job::current());
                log.borrow_mut().push((id, wakeup, is_holder));
                Ok(())
            })
            .await
    })?;
    Ok(job)
}

#[test]
fn signal_wakes_exactly_one_waiter_in_fifo_order() -> Result<()> {
    let cond_var: ConditionVariable = ConditionVariable::new();
    let mutex: Mutex = Mutex::new();
    let log: Log<(usize, Wakeup, bool)> = new_log();
    let first: Job = spawn_waiter(&cond_var, &mutex, 0, None, &log)?;
    for id in 1..4 {
        spawn_waiter(&cond_var, &mutex, id, None, &log)?;
    }

    first.kill()?;
    cond_var.signal();
    settle()?;
    ensure_eq!(*log.borrow(), vec![(1, Wakeup::Signal, true)]);

    cond_var.signal();
    settle()?;
    ensure_eq!(log.borrow().len(), 2);
    ensure_eq!(log.borrow()[1].0, 2);
    ensure_eq!(cond_var.waiter_count(), 1);
    Ok(())
}

#[test]
fn broadcast_wakes_everyone_waiting_at_call_time() -> Result<()> {
    let cond_var: ConditionVariable = ConditionVariable::new();
    let mutex: Mutex = Mutex::new();
    let log: Log<(usize, Wakeup, bool)> = new_log();
    for id in 0..3 {
        spawn_waiter(&cond_var, &mutex, id, None, &log)?;
    }

    cond_var.broadcast();
    spawn_waiter(&cond_var, &mutex, 99, None, &log)?;
    settle()?;

    let woken: Vec<usize> = log.borrow().iter().map(|(id, _, _)| *id).collect();
    ensure_eq!(woken, vec![0, 1, 2]);
    ensure_eq!(log.borrow().iter().all(|(_, _, is_holder)| *is_holder), true);
    ensure_eq!(cond_var.waiter_count(), 1);
    Ok(())
}

#[test]
fn timed_wait_holds_the_lock_on_return() -> Result<()> {
    let cond_var: ConditionVariable = ConditionVariable::new();
    let mutex: Mutex = Mutex::new();
    let log: Log<(usize, Wakeup, bool)> = new_log();
    spawn_waiter(&cond_var, &mutex, 0, Some(Duration::from_millis(5)), &log)?;
    spawn_waiter(&cond_var, &mutex, 1, Some(Duration::from_millis(50)), &log)?;

    // The first waiter times out.
    advance(Duration::from_millis(5))?;
    ensure_eq!(*log.borrow(), vec![(0, Wakeup::Timer, true)]);

    // The second one is signalled before its timeout.
    cond_var.signal();
    settle()?;
    ensure_eq!(*log.borrow(), vec![(0, Wakeup::Timer, true), (1, Wakeup::Signal, true)]);

    advance(Duration::from_millis(100))?;
    ensure_eq!(log.borrow().len(), 2);
    ensure_eq!(mutex.is_locked(), false);
    Ok(())
}

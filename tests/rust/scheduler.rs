// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//==============================================================================
// Imports
//==============================================================================

use ::anyhow::Result;
use ::std::time::Duration;
use ::tasklet::{
    defer,
    ensure_eq,
    Dispatch,
    ExecutionContext,
    Fail,
    Job,
    JobState,
    TaskPool,
    Wakeup,
};
use common::{
    advance,
    new_log,
    tick,
    Log,
};

//==============================================================================
// Join
//==============================================================================

#[test]
fn join_returns_only_after_the_target_ended() -> Result<()> {
    let seen: Log<JobState> = new_log();

    let target: Job = TaskPool::run(Some("target"), async {
        Job::current().sleep(Duration::from_millis(10)).await?;
        Ok(())
    })?;
    let (target_ref, seen_ref) = (target.clone(), seen.clone());
    let joiner: Job = TaskPool::run(Some("joiner"), async move {
        target_ref.join().await?;
        seen_ref.borrow_mut().push(target_ref.state());
        Ok(())
    })?;

    ensure_eq!(joiner.state(), JobState::JoinWaiting);
    ensure_eq!(joiner.joined_on(), target.id());
    ensure_eq!(seen.borrow().len(), 0);

    advance(Duration::from_millis(10))?;
    ensure_eq!(*seen.borrow(), vec![JobState::Ended]);
    ensure_eq!(joiner.has_ended(), true);
    Ok(())
}

#[test]
fn joining_an_ended_job_does_not_suspend() -> Result<()> {
    let target: Job = defer(async { Ok(()) })?;
    ensure_eq!(target.has_ended(), true);

    let target_ref: Job = target.clone();
    let joiner: Job = defer(async move { target_ref.join().await })?;
    ensure_eq!(joiner.has_ended(), true);
    Ok(())
}

#[test]
fn joining_oneself_is_a_deadlock() -> Result<()> {
    let errno: Log<i32> = new_log();
    let errno_ref: Log<i32> = errno.clone();
    defer(async move {
        if let Err(e) = Job::current().join().await {
            errno_ref.borrow_mut().push(e.errno);
        }
        Ok(())
    })?;
    ensure_eq!(*errno.borrow(), vec![libc::EDEADLK]);
    Ok(())
}

#[test]
fn killing_the_target_wakes_its_joiners() -> Result<()> {
    let target: Job = defer(async {
        Job::current().suspend().await?;
        Ok(())
    })?;
    let mut joiners: Vec<Job> = Vec::new();
    for _ in 0..2 {
        let target_ref: Job = target.clone();
        joiners.push(defer(async move { target_ref.join().await })?);
    }

    target.kill()?;
    for joiner in &joiners {
        ensure_eq!(joiner.has_ended(), true);
    }
    Ok(())
}

#[test]
fn killed_joiner_leaves_the_target_alone_once_its_context_moves_on() -> Result<()> {
    let first_target: Job = defer(async {
        Job::current().suspend().await?;
        Ok(())
    })?;
    let second_target: Job = defer(async {
        Job::current().suspend().await?;
        Ok(())
    })?;

    let target_ref: Job = first_target.clone();
    let killed_joiner: Job = defer(async move { target_ref.join().await })?;
    ensure_eq!(killed_joiner.state(), JobState::JoinWaiting);
    killed_joiner.kill()?;
    ensure_eq!(killed_joiner.has_ended(), true);
    ensure_eq!(TaskPool::idle_count(), 1);

    // Runs in the context the killed joiner left behind.
    let target_ref: Job = second_target.clone();
    let joiner: Job = defer(async move { target_ref.join().await })?;
    ensure_eq!(TaskPool::idle_count(), 0);
    ensure_eq!(joiner.joined_on(), second_target.id());

    first_target.kill()?;
    ensure_eq!(joiner.state(), JobState::JoinWaiting);

    second_target.kill()?;
    ensure_eq!(joiner.has_ended(), true);
    Ok(())
}

#[test]
fn join_resumed_early_is_refused() -> Result<()> {
    let errno: Log<i32> = new_log();
    let target: Job = defer(async {
        Job::current().suspend().await?;
        Ok(())
    })?;
    let (target_ref, errno_ref) = (target.clone(), errno.clone());
    let joiner: Job = defer(async move {
        if let Err(e) = target_ref.join().await {
            errno_ref.borrow_mut().push(e.errno);
        }
        Ok(())
    })?;

    joiner.schedule();
    tick()?;
    ensure_eq!(*errno.borrow(), vec![libc::EINVAL]);
    ensure_eq!(joiner.has_ended(), true);
    ensure_eq!(target.is_alive(), true);
    Ok(())
}

//==============================================================================
// Kill
//==============================================================================

#[test]
fn kill_cancels_the_sleep_timer() -> Result<()> {
    let log: Log<&'static str> = new_log();
    let log_ref: Log<&'static str> = log.clone();
    let sleeper: Job = defer(async move {
        Job::current().sleep(Duration::from_secs(1)).await?;
        log_ref.borrow_mut().push("woke up");
        Ok(())
    })?;
    ensure_eq!(sleeper.state(), JobState::AsleepTimer);
    ensure_eq!(sleeper.is_asleep(), true);

    sleeper.kill()?;
    ensure_eq!(sleeper.state(), JobState::Ended);

    advance(Duration::from_secs(2))?;
    ensure_eq!(log.borrow().len(), 0);
    ensure_eq!(TaskPool::busy_count(), 0);
    Ok(())
}

#[test]
fn killing_the_running_job_unwinds_it_immediately() -> Result<()> {
    let log: Log<&'static str> = new_log();
    let log_ref: Log<&'static str> = log.clone();
    let job: Job = defer(async move {
        log_ref.borrow_mut().push("before");
        Job::current().kill()?;
        log_ref.borrow_mut().push("after");
        Ok(())
    })?;
    ensure_eq!(*log.borrow(), vec!["before"]);
    ensure_eq!(job.state(), JobState::Ended);
    Ok(())
}

#[test]
fn killing_a_job_that_is_not_suspended_is_refused() -> Result<()> {
    let errno: Log<i32> = new_log();
    let errno_ref: Log<i32> = errno.clone();
    let outer: Job = defer(async move {
        let outer: Job = Job::current();
        defer(async move {
            if let Err(e) = outer.kill() {
                errno_ref.borrow_mut().push(e.errno);
            }
            Ok(())
        })?;
        Ok(())
    })?;
    ensure_eq!(*errno.borrow(), vec![libc::EBUSY]);
    ensure_eq!(outer.has_ended(), true);
    Ok(())
}

#[test]
fn killed_job_that_keeps_going_cannot_suspend_again() -> Result<()> {
    let log: Log<bool> = new_log();
    let log_ref: Log<bool> = log.clone();
    let job: Job = defer(async move {
        let job: Job = Job::current();
        let first: Result<Wakeup, Fail> = job.suspend().await;
        log_ref.borrow_mut().push(first.map_err(|e| e.is_killed()) == Err(true));
        let second: Result<Wakeup, Fail> = job.suspend().await;
        log_ref.borrow_mut().push(second.map_err(|e| e.is_killed()) == Err(true));
        Ok(())
    })?;

    job.kill()?;
    ensure_eq!(*log.borrow(), vec![true, true]);
    ensure_eq!(job.has_ended(), true);
    Ok(())
}

//==============================================================================
// Schedule And Wake
//==============================================================================

#[test]
fn scheduling_twice_resumes_once() -> Result<()> {
    let resumes: Log<Wakeup> = new_log();
    let resumes_ref: Log<Wakeup> = resumes.clone();
    let job: Job = defer(async move {
        loop {
            let wakeup: Wakeup = Job::current().suspend().await?;
            resumes_ref.borrow_mut().push(wakeup);
        }
    })?;

    job.schedule();
    job.schedule();
    ensure_eq!(job.state(), JobState::AsleepTimer);
    ensure_eq!(resumes.borrow().len(), 0);

    tick()?;
    tick()?;
    ensure_eq!(*resumes.borrow(), vec![Wakeup::Signal]);
    ensure_eq!(job.state(), JobState::Yielded);

    job.kill()?;
    Ok(())
}

#[test]
fn wake_cuts_a_sleep_short() -> Result<()> {
    let woken: Log<Wakeup> = new_log();
    let woken_ref: Log<Wakeup> = woken.clone();
    let sleeper: Job = defer(async move {
        let wakeup: Wakeup = Job::current().sleep(Duration::from_secs(60)).await?;
        woken_ref.borrow_mut().push(wakeup);
        Ok(())
    })?;

    sleeper.wake()?;
    ensure_eq!(*woken.borrow(), vec![Wakeup::Timer]);
    ensure_eq!(sleeper.has_ended(), true);
    ensure_eq!(sleeper.wake().map_err(|e| e.errno), Err(libc::EINVAL));
    Ok(())
}

//==============================================================================
// Pool
//==============================================================================

#[test]
fn submit_queues_beyond_capacity() -> Result<()> {
    const CAPACITY: usize = 4;
    TaskPool::set_capacity(CAPACITY);
    let started: Log<usize> = new_log();

    let mut dispatches: Vec<Dispatch> = Vec::new();
    for i in 0..=CAPACITY {
        let started_ref: Log<usize> = started.clone();
        dispatches.push(TaskPool::submit(None, async move {
            started_ref.borrow_mut().push(i);
            Job::current().suspend().await?;
            Ok(())
        })?);
    }

    for dispatch in &dispatches[..CAPACITY] {
        ensure_eq!(dispatch.is_queued(), false);
    }
    let last: &Dispatch = &dispatches[CAPACITY];
    ensure_eq!(last.is_queued(), true);
    ensure_eq!(started.borrow().len(), CAPACITY);
    ensure_eq!(TaskPool::busy_count(), CAPACITY);

    dispatches[1].job().kill()?;
    ensure_eq!(*started.borrow(), vec![0, 1, 2, 3, 4]);
    ensure_eq!(last.job().state(), JobState::Yielded);
    ensure_eq!(TaskPool::busy_count(), CAPACITY);
    ensure_eq!(TaskPool::queued_count(), 0);

    for dispatch in &dispatches {
        dispatch.job().kill()?;
    }
    ensure_eq!(TaskPool::busy_count(), 0);
    ensure_eq!(TaskPool::idle_count(), CAPACITY);
    Ok(())
}

#[test]
fn current_job_is_bound_inside_the_payload() -> Result<()> {
    let seen: Log<(bool, bool)> = new_log();
    let seen_ref: Log<(bool, bool)> = seen.clone();
    let job: Job = TaskPool::run(Some("worker"), async move {
        let context: ExecutionContext = ExecutionContext::current();
        let job: Job = Job::current();
        seen_ref.borrow_mut().push((context.is_root(), job.whois() == Some("worker".to_string())));
        Ok(())
    })?;
    ensure_eq!(*seen.borrow(), vec![(false, true)]);
    ensure_eq!(format!("{}", job), format!("[Job {} worker]", job.id().map(u64::from).unwrap_or(0)));
    ensure_eq!(Job::current().is_root(), true);
    Ok(())
}

#[test]
fn failing_payload_reaches_the_timer_tick() -> Result<()> {
    let job: Job = defer(async {
        Job::current().sleep(Duration::from_millis(1)).await?;
        Err(Fail::new(libc::EIO, "disk on fire"))
    })?;

    let result: Result<(), Fail> = advance(Duration::from_millis(1));
    ensure_eq!(result.map_err(|e| e.errno), Err(libc::EIO));
    ensure_eq!(job.has_ended(), true);
    ensure_eq!(TaskPool::busy_count(), 0);
    Ok(())
}

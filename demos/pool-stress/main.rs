// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

mod args;

//==============================================================================
// Imports
//==============================================================================

use crate::args::ProgramArguments;
use ::anyhow::{
    bail,
    Result,
};
use ::log::info;
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    collections::VecDeque,
    rc::Rc,
    time::Duration,
};
use ::tasklet::{
    runtime::{
        logging,
        timer,
    },
    ConditionVariable,
    Config,
    Dispatch,
    Fail,
    Job,
    Mutex,
    TaskPool,
};

//==============================================================================
// Application
//==============================================================================

/// Bounded buffer shared by producers and consumers.
#[derive(Clone)]
struct Channel {
    mutex: Mutex,
    not_empty: ConditionVariable,
    not_full: ConditionVariable,
    items: Rc<RefCell<VecDeque<usize>>>,
    consumed: Rc<Cell<usize>>,
    expected: usize,
}

impl Channel {
    const BUFFER_SIZE: usize = 8;
    /// How long a consumer waits before checking whether everything was consumed.
    const PATIENCE: Duration = Duration::from_millis(20);

    fn new(expected: usize) -> Self {
        Self {
            mutex: Mutex::new(),
            not_empty: ConditionVariable::new(),
            not_full: ConditionVariable::new(),
            items: Rc::new(RefCell::new(VecDeque::new())),
            consumed: Rc::new(Cell::new(0)),
            expected,
        }
    }

    async fn produce(self, count: usize) -> Result<(), Fail> {
        for item in 0..count {
            self.mutex
                .synchronized(async {
                    while self.items.borrow().len() >= Self::BUFFER_SIZE {
                        self.not_full.wait(&self.mutex, None).await?;
                    }
                    self.items.borrow_mut().push_back(item);
                    self.not_empty.signal();
                    Ok(())
                })
                .await?;
            Job::current().sleep(Duration::from_millis(1)).await?;
        }
        Ok(())
    }

    async fn consume(self) -> Result<(), Fail> {
        loop {
            let is_done: bool = self
                .mutex
                .synchronized(async {
                    while self.items.borrow().is_empty() && !self.is_drained() {
                        self.not_empty.wait(&self.mutex, Some(Self::PATIENCE)).await?;
                    }
                    let item: Option<usize> = self.items.borrow_mut().pop_front();
                    if item.is_some() {
                        self.consumed.set(self.consumed.get() + 1);
                        self.not_full.signal();
                    }
                    if self.is_drained() {
                        self.not_empty.broadcast();
                        return Ok(true);
                    }
                    Ok(false)
                })
                .await?;
            if is_done {
                return Ok(());
            }
            Job::current().schedule();
            Job::current().suspend().await?;
        }
    }

    fn is_drained(&self) -> bool {
        self.consumed.get() == self.expected
    }
}

//==============================================================================
// Main
//==============================================================================

fn main() -> Result<()> {
    let args: ProgramArguments = ProgramArguments::new(
        "pool-stress",
        "Microsoft Corporation",
        "Runs producer and consumer jobs over a bounded buffer.",
    )?;

    let config: Config = match args.get_config_path() {
        Some(path) => Config::new(path)?,
        None => Config::default(),
    };
    logging::initialize_with(&config.log_spec()?);
    TaskPool::configure(&config)?;

    let expected: usize = args.get_producers() * args.get_items();
    let channel: Channel = Channel::new(expected);

    let mut jobs: Vec<Job> = Vec::new();
    for i in 0..args.get_producers() {
        let whois: String = format!("producer-{}", i);
        let dispatch: Dispatch = TaskPool::submit(Some(&whois), channel.clone().produce(args.get_items()))?;
        jobs.push(dispatch.into_job());
    }
    for i in 0..args.get_consumers() {
        let whois: String = format!("consumer-{}", i);
        let dispatch: Dispatch = TaskPool::submit(Some(&whois), channel.clone().consume())?;
        jobs.push(dispatch.into_job());
    }
    info!(
        "main(): {} busy, {} queued (capacity {})",
        TaskPool::busy_count(),
        TaskPool::queued_count(),
        TaskPool::capacity()
    );

    // Bounded so that a lost wake-up shows up as an error instead of a hang.
    let max_ticks: usize = 16 * (expected + jobs.len());
    let mut ticks: usize = 0;
    while jobs.iter().any(Job::is_alive) {
        if ticks == max_ticks {
            bail!("{} items consumed out of {} after {} ticks", channel.consumed.get(), expected, ticks);
        }
        timer::advance_clock(timer::now() + Duration::from_millis(1))?;
        ticks += 1;
    }

    info!("main(): consumed {} items in {} ticks", channel.consumed.get(), ticks);
    println!("consumed {} items in {} ticks", channel.consumed.get(), ticks);
    Ok(())
}

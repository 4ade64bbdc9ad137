// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::std::{
    cell::RefCell,
    rc::Rc,
    time::Duration,
};
use ::tasklet::{
    runtime::timer,
    Fail,
};

//==============================================================================
// Structures
//==============================================================================

/// Shared record of what the jobs under test observed.
pub type Log<T> = Rc<RefCell<Vec<T>>>;

//==============================================================================
// Standalone Functions
//==============================================================================

pub fn new_log<T>() -> Log<T> {
    Rc::new(RefCell::new(Vec::new()))
}

/// Runs one scheduler tick without moving the clock.
pub fn tick() -> Result<(), Fail> {
    timer::advance_clock(timer::now())
}

/// Moves the clock forward by `duration` and fires whatever became due.
pub fn advance(duration: Duration) -> Result<(), Fail> {
    timer::advance_clock(timer::now() + duration)
}

/// Ticks until no timer is due any more.
#[allow(dead_code)]
pub fn settle() -> Result<(), Fail> {
    while let Some(expiry) = timer::next_expiry() {
        if expiry > timer::now() {
            break;
        }
        tick()?;
    }
    Ok(())
}

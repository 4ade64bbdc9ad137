// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod config;
pub mod fail;
pub mod logging;
pub mod scheduler;
pub mod sync;
pub mod timer;

pub use self::{
    fail::Fail,
    scheduler::{
        ExecutionContext,
        Job,
        TaskPool,
    },
    timer::SharedTimer,
};

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod context;
mod job;
mod pool;
mod yielder;

//==============================================================================
// Exports
//==============================================================================

pub use self::{
    context::{
        ExecutionContext,
        Wakeup,
    },
    job::{
        Job,
        JobId,
        JobState,
    },
    pool::{
        defer,
        Dispatch,
        TaskPool,
    },
};

pub(crate) use self::job::State;

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod condition_variable;
mod mutex;

//==============================================================================
// Exports
//==============================================================================

pub use self::{
    condition_variable::ConditionVariable,
    mutex::{
        Mutex,
        MutexId,
    },
};

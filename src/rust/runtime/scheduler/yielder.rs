// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::scheduler::context::{
    ExecutionContext,
    Resume,
};
use ::std::{
    future::Future,
    pin::Pin,
    task::{
        Context,
        Poll,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Eq, PartialEq)]
/// The state of the coroutine that is suspending.
enum YieldState {
    Running,
    Yielded,
}

/// Suspend is a future that hands control back to whoever resumed the execution context. It completes with the value
/// that the context is resumed with next.
pub(crate) struct Suspend {
    /// Context that is suspending.
    context: ExecutionContext,
    /// State of the yield.
    state: YieldState,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Suspend {
    pub(crate) fn new(context: ExecutionContext) -> Self {
        Self {
            context,
            state: YieldState::Running,
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Future for Suspend {
    type Output = Resume;

    /// The first poll always suspends. Later polls complete once the context has been resumed with a value.
    fn poll(self: Pin<&mut Self>, _context: &mut Context) -> Poll<Self::Output> {
        let self_: &mut Self = self.get_mut();
        if self_.state == YieldState::Running {
            // Whatever is in the inbox was meant for an earlier suspension point.
            self_.context.take_inbox();
            self_.state = YieldState::Yielded;
            return Poll::Pending;
        }
        match self_.context.take_inbox() {
            Some(value) => Poll::Ready(value),
            None => Poll::Pending,
        }
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Execution contexts.
//!
//! An execution context is a reusable coroutine. Resuming it polls its coroutine synchronously until the coroutine
//! suspends again, so exactly one context is active on a thread at any time. Contexts resumed from inside another
//! context nest: control returns to the resumer once the inner context suspends.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::job::Job,
};
use ::futures::{
    future::LocalBoxFuture,
    task::noop_waker_ref,
    FutureExt,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    fmt,
    future::Future,
    rc::Rc,
    task::{
        Context,
        Poll,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Why a suspended job was resumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wakeup {
    /// Explicitly resumed: scheduled, handed a lock, joined job ended or killed.
    Signal,
    /// A sleep timer expired.
    Timer,
}

/// Value handed to a context when it is resumed.
pub(crate) enum Resume {
    /// Wake the job that is suspended in this context.
    Wake(Wakeup),
    /// Run this job. Only an idle context accepts it.
    Dispatch(Job),
}

type Coroutine = LocalBoxFuture<'static, Result<(), Fail>>;

struct ContextInner {
    id: usize,
    is_root: bool,
    /// Job that is currently bound to this context.
    job: Option<Job>,
    /// Taken out while the context is running.
    coroutine: Option<Coroutine>,
    inbox: Option<Resume>,
    /// Failure raised while this context ran someone else's code. Reported by the resume that is in progress.
    deferred: Option<Fail>,
    is_retired: bool,
}

#[derive(Clone)]
pub struct ExecutionContext(Rc<RefCell<ContextInner>>);

/// Restores the previously active context when a resume returns, even by unwinding.
struct ActiveGuard {
    previous: Option<ExecutionContext>,
}

//======================================================================================================================
// Thread Locals
//======================================================================================================================

thread_local! {
    static NEXT_CONTEXT_ID: Cell<usize> = Cell::new(1);
    static ACTIVE_CONTEXT: RefCell<ExecutionContext> = RefCell::new(ExecutionContext::new_root());
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ExecutionContext {
    fn new_root() -> Self {
        let context: ExecutionContext = Self::with_inner(0, true);
        let job: Job = Job::root(&context);
        context.0.borrow_mut().job = Some(job);
        context
    }

    fn with_inner(id: usize, is_root: bool) -> Self {
        Self(Rc::new(RefCell::new(ContextInner {
            id,
            is_root,
            job: None,
            coroutine: None,
            inbox: None,
            deferred: None,
            is_retired: false,
        })))
    }

    /// Creates a context whose coroutine is built by `entry`. The coroutine starts on the first resume and reads the
    /// first resumption value from the inbox.
    pub(crate) fn create<F, Fut>(entry: F) -> Self
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<(), Fail>> + 'static,
    {
        let id: usize = NEXT_CONTEXT_ID.with(|next| next.replace(next.get() + 1));
        let context: ExecutionContext = Self::with_inner(id, false);
        let coroutine: Coroutine = entry(context.clone()).boxed_local();
        context.0.borrow_mut().coroutine = Some(coroutine);
        trace!("create(): context {}", id);
        context
    }

    /// Returns the context that is executing the caller.
    pub fn current() -> Self {
        ACTIVE_CONTEXT.with(|active| active.borrow().clone())
    }

    pub fn id(&self) -> usize {
        self.0.borrow().id
    }

    pub fn is_root(&self) -> bool {
        self.0.borrow().is_root
    }

    /// Has this context stopped for good?
    pub fn is_retired(&self) -> bool {
        self.0.borrow().is_retired
    }

    /// Is this context parked at a suspension point?
    pub fn is_suspended(&self) -> bool {
        self.0.borrow().coroutine.is_some()
    }

    /// Returns the job bound to this context, if any.
    pub fn job(&self) -> Option<Job> {
        self.0.borrow().job.clone()
    }

    /// Resumes the job suspended in this context and returns once the context suspends again. An error means that the
    /// context's dispatch loop failed and the context has been retired.
    pub fn resume(&self, wakeup: Wakeup) -> Result<(), Fail> {
        self.transfer(Resume::Wake(wakeup))
    }

    pub(crate) fn dispatch(&self, job: Job) -> Result<(), Fail> {
        self.transfer(Resume::Dispatch(job))
    }

    pub(crate) fn bind(&self, job: Option<Job>) {
        // Swap first so that the old job is not dropped while the context is borrowed.
        let old: Option<Job> = ::std::mem::replace(&mut self.0.borrow_mut().job, job);
        drop(old);
    }

    pub(crate) fn take_inbox(&self) -> Option<Resume> {
        self.0.borrow_mut().inbox.take()
    }

    /// Hands `failure` to the resume that is driving this context, without stopping the context. Only the first
    /// failure of a resume is kept, and a context that fails itself reports its own error instead.
    pub(crate) fn defer_failure(&self, failure: Fail) {
        let mut inner = self.0.borrow_mut();
        match inner.deferred {
            Some(_) => error!("defer_failure(): context {} dropped {:?}", inner.id, failure),
            None => inner.deferred = Some(failure),
        }
    }

    pub(crate) fn retire(&self) {
        let mut inner = self.0.borrow_mut();
        inner.is_retired = true;
        inner.inbox = None;
    }

    fn transfer(&self, value: Resume) -> Result<(), Fail> {
        let mut coroutine: Coroutine = {
            let mut inner = self.0.borrow_mut();
            if inner.is_root {
                panic!("resume(): cannot resume the root context");
            }
            let coroutine: Coroutine = match inner.coroutine.take() {
                Some(coroutine) => coroutine,
                None if inner.is_retired => panic!("resume(): context {} has retired", inner.id),
                None => panic!("resume(): double resume of context {}", inner.id),
            };
            inner.inbox = Some(value);
            coroutine
        };

        let result: Poll<Result<(), Fail>> = {
            let _active: ActiveGuard = ActiveGuard::enter(self.clone());
            let mut cx: Context = Context::from_waker(noop_waker_ref());
            coroutine.as_mut().poll(&mut cx)
        };

        let deferred: Option<Fail> = self.0.borrow_mut().deferred.take();
        let result: Result<(), Fail> = match result {
            Poll::Pending => {
                let mut inner = self.0.borrow_mut();
                inner.inbox = None;
                inner.coroutine = Some(coroutine);
                Ok(())
            },
            Poll::Ready(result) => {
                self.retire();
                drop(coroutine);
                trace!("resume(): context {} retired", self.id());
                result
            },
        };
        match (deferred, result) {
            (Some(deferred), Err(e)) => {
                error!("resume(): context {} also reported {:?}", self.id(), deferred);
                Err(e)
            },
            (Some(deferred), Ok(())) => Err(deferred),
            (None, result) => result,
        }
    }
}

impl ActiveGuard {
    fn enter(context: ExecutionContext) -> Self {
        let previous: ExecutionContext = ACTIVE_CONTEXT.with(|active| active.replace(context));
        Self {
            previous: Some(previous),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            ACTIVE_CONTEXT.with(|active| active.replace(previous));
        }
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ExecutionContext {}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("ExecutionContext")
            .field("id", &inner.id)
            .field("is_root", &inner.is_root)
            .field("is_retired", &inner.is_retired)
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

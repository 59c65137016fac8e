//! Future adapter: every `poll` is one slice.
//!
//! Work-stealing executors are M:N schedulers. Wrapping a task in
//! [`FiberFuture`] gives it a [`FiberContextHandle`] that is resumed before
//! each poll and suspended after it, on whichever worker thread the poll
//! lands on. Code inside the task sees its own context through
//! [`Context::current`]; other tasks polled on the same worker never do.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use crate::config::{self, Hazard};
use crate::context::Context;
use crate::storage::ThreadLocalStorage;

use super::{FiberContextHandle, SliceGuard};

/// A future running as a fiber with its own ambient context.
///
/// The inner future is also dropped inside a slice, so destructors of a
/// cancelled fiber see the fiber's context and not the canceller's.
#[must_use = "futures do nothing unless polled"]
pub struct FiberFuture<F: Future> {
    inner: Option<Pin<Box<F>>>,
    handle: FiberContextHandle,
}

impl<F: Future> FiberFuture<F> {
    /// Wrap `inner`, capturing the calling thread's current context.
    pub fn new(inner: F) -> Self {
        Self::with_handle(inner, FiberContextHandle::create())
    }

    pub fn with_handle(inner: F, handle: FiberContextHandle) -> Self {
        Self {
            inner: Some(Box::pin(inner)),
            handle,
        }
    }

    pub fn handle(&self) -> &FiberContextHandle {
        &self.handle
    }
}

impl<F: Future> Future for FiberFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let inner = match this.inner.as_mut() {
            Some(inner) => inner,
            None => panic!("`FiberFuture` polled after completion"),
        };
        let poll = match SliceGuard::enter(&mut this.handle, &ThreadLocalStorage) {
            Ok(_slice) => inner.as_mut().poll(cx),
            Err(err) => {
                config::report(Hazard::ProtocolMisuse, &err.to_string());
                inner.as_mut().poll(cx)
            }
        };
        if poll.is_ready() {
            this.release();
        }
        poll
    }
}

impl<F: Future> FiberFuture<F> {
    /// Drop the inner future within one last slice.
    fn release(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        match SliceGuard::enter(&mut self.handle, &ThreadLocalStorage) {
            Ok(_slice) => drop(inner),
            Err(err) => {
                config::report(Hazard::ProtocolMisuse, &err.to_string());
                drop(inner);
            }
        }
    }
}

impl<F: Future> Drop for FiberFuture<F> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Extension trait wrapping any future as a fiber.
pub trait FiberFutureExt: Future + Sized {
    /// Run as a fiber starting from the caller's current context.
    fn in_fiber(self) -> FiberFuture<Self> {
        FiberFuture::new(self)
    }

    /// Run as a fiber starting from `ctx`.
    fn in_fiber_with(self, ctx: Context) -> FiberFuture<Self> {
        FiberFuture::with_handle(self, FiberContextHandle::with_context(ctx))
    }
}

impl<F: Future> FiberFutureExt for F {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::{block_on, LocalPool};
    use futures::task::LocalSpawnExt;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Pending once, then ready: forces a suspension point.
    async fn yield_once() {
        let mut yielded = false;
        futures::future::poll_fn(|cx| {
            if yielded {
                Poll::Ready(())
            } else {
                yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        })
        .await
    }

    #[test]
    fn test_context_carries_across_await_points() {
        let outcome = block_on(
            async {
                Context::current()
                    .with_attribute("request", "r-1")
                    .make_current();
                yield_once().await;
                Context::current().attributes().get("request").map(str::to_owned)
            }
            .in_fiber_with(Context::root()),
        );
        assert_eq!(outcome.as_deref(), Some("r-1"));
        assert!(Context::current().attributes().get("request").is_none());
    }

    /// Records the `fiber` attribute visible when it is dropped.
    struct RecordOnDrop(Rc<RefCell<Option<String>>>);

    impl Drop for RecordOnDrop {
        fn drop(&mut self) {
            *self.0.borrow_mut() = Context::current().attributes().get("fiber").map(str::to_owned);
        }
    }

    #[test]
    fn test_cancelled_fiber_drops_under_its_own_context() {
        let seen: Rc<RefCell<Option<String>>> = Rc::default();
        let recorder = RecordOnDrop(Rc::clone(&seen));

        let outcome = block_on(
            async move {
                let mut b = async move {
                    let _recorder = recorder;
                    futures::future::pending::<()>().await;
                }
                .in_fiber_with(Context::root().with_attribute("fiber", "b"));

                assert!(futures::poll!(&mut b).is_pending());
                drop(b);
                Context::current().attributes().get("fiber").map(str::to_owned)
            }
            .in_fiber_with(Context::root().with_attribute("fiber", "a")),
        );

        assert_eq!(seen.borrow().as_deref(), Some("b"));
        assert_eq!(outcome.as_deref(), Some("a"));
        assert!(Context::current().attributes().get("fiber").is_none());
    }

    #[test]
    fn test_unpolled_fiber_drops_under_its_own_context() {
        let seen: Rc<RefCell<Option<String>>> = Rc::default();
        let recorder = RecordOnDrop(Rc::clone(&seen));
        let fiber = async move {
            let _recorder = recorder;
        }
        .in_fiber_with(Context::root().with_attribute("fiber", "idle"));

        let _outer = Context::root().with_attribute("fiber", "caller").attach();
        drop(fiber);
        assert_eq!(seen.borrow().as_deref(), Some("idle"));
        assert_eq!(Context::current().attributes().get("fiber"), Some("caller"));
    }

    #[test]
    fn test_interleaved_fibers_on_one_thread_do_not_leak() {
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let seen: Rc<RefCell<Vec<(String, Option<String>)>>> = Rc::default();

        for name in ["a", "b", "c"] {
            let seen = Rc::clone(&seen);
            let fiber = async move {
                Context::current().with_attribute("fiber", name).make_current();
                for _ in 0..3 {
                    yield_once().await;
                    let current = Context::current().attributes().get("fiber").map(str::to_owned);
                    seen.borrow_mut().push((name.to_string(), current));
                }
            }
            .in_fiber_with(Context::root());
            spawner.spawn_local(fiber).unwrap();
        }
        pool.run();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 9);
        for (name, current) in seen.iter() {
            assert_eq!(current.as_deref(), Some(name.as_str()));
        }
        assert!(Context::current().attributes().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_workers_do_not_leak_between_tasks() {
        let mut tasks = Vec::new();
        for i in 0..16 {
            let fiber = async move {
                let name = format!("task-{}", i);
                Context::current()
                    .with_attribute("task", name.clone())
                    .make_current();
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                    let current = Context::current();
                    assert_eq!(current.attributes().get("task"), Some(name.as_str()));
                }
                name
            }
            .in_fiber_with(Context::root());
            tasks.push(tokio::spawn(fiber));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap(), format!("task-{}", i));
        }
    }
}

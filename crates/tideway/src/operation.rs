//! Operation results and dispatch
//!
//! Every async call returns an [`Operation`]. It resolves exactly once and
//! can be awaited or handed a completion callback, never both, since both
//! consume it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tideway_common::{Result, TidewayError};
use tideway_executor::ThreadPoolExecutor;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::pool::Request;

enum State<T> {
    Pending(oneshot::Receiver<Result<T>>),
    /// `None` once the result has been handed out
    Ready(Option<Result<T>>),
}

/// One in-flight call
///
/// Dropping an `Operation` does not cancel the call; it still runs to
/// completion and releases its connection.
#[must_use = "operations run regardless, but their result is lost unless awaited or given a callback"]
pub struct Operation<T> {
    state: State<T>,
}

// No field is ever pinned structurally.
impl<T> Unpin for Operation<T> {}

fn abandoned() -> TidewayError {
    TidewayError::Internal("operation abandoned before completing".to_string())
}

impl<T> Operation<T> {
    /// An operation that has already resolved
    pub fn ready(result: Result<T>) -> Self {
        Self {
            state: State::Ready(Some(result)),
        }
    }

    fn pending(receiver: oneshot::Receiver<Result<T>>) -> Self {
        Self {
            state: State::Pending(receiver),
        }
    }

    /// True when the result is available without waiting
    pub fn is_ready(&self) -> bool {
        matches!(self.state, State::Ready(Some(_)))
    }
}

impl<T: Send + 'static> Operation<T> {
    /// Deliver the result to `callback` instead of awaiting it
    ///
    /// Inside a runtime the callback runs on a spawned task. Outside one, it
    /// runs on the calling thread.
    pub fn with_callback<F>(self, callback: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { callback(self.await) });
            }
            Err(_) => match self.state {
                State::Ready(slot) => callback(slot.unwrap_or_else(|| Err(abandoned()))),
                State::Pending(receiver) => {
                    callback(receiver.blocking_recv().unwrap_or_else(|_| Err(abandoned())))
                }
            },
        }
    }
}

impl<T> Future for Operation<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = match &mut this.state {
            State::Ready(slot) => {
                return Poll::Ready(slot.take().unwrap_or_else(|| {
                    Err(TidewayError::Internal(
                        "operation polled after completion".to_string(),
                    ))
                }))
            }
            State::Pending(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(received) => received.unwrap_or_else(|_| Err(abandoned())),
            },
        };
        this.state = State::Ready(None);
        Poll::Ready(result)
    }
}

impl<T> std::fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Pending(_) => "pending",
            State::Ready(Some(_)) => "ready",
            State::Ready(None) => "consumed",
        };
        f.debug_struct("Operation").field("state", &state).finish()
    }
}

/// Runs blocking calls on the executor and hands back [`Operation`]s
#[derive(Debug, Clone)]
pub(crate) struct Dispatcher {
    executor: Arc<ThreadPoolExecutor>,
}

impl Dispatcher {
    pub(crate) fn new(max_workers: Option<usize>) -> Self {
        Self {
            executor: Arc::new(ThreadPoolExecutor::new(max_workers)),
        }
    }

    pub(crate) fn executor(&self) -> &Arc<ThreadPoolExecutor> {
        &self.executor
    }

    /// Schedule `call` on a worker thread
    ///
    /// Outside a tokio runtime this returns an already failed operation.
    pub(crate) fn dispatch<T, F>(&self, operation: &'static str, call: F) -> Operation<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.dispatch_on(operation, None, call)
    }

    /// Like [`Dispatcher::dispatch`], but calls pinned to one request run in
    /// the order they were issued
    pub(crate) fn dispatch_on<T, F>(
        &self,
        operation: &'static str,
        request: Option<&Request>,
        call: F,
    ) -> Operation<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                return Operation::ready(Err(TidewayError::Runtime(format!(
                    "{} called outside a tokio runtime",
                    operation
                ))))
            }
        };

        // Taken here, on the caller's thread, so the ticket order is the issue order
        let turn = request.map(Request::take_turn);
        let (sender, receiver) = oneshot::channel();
        let executor = Arc::clone(&self.executor);
        tracing::trace!(operation, pinned = turn.is_some(), "dispatching operation");

        handle.spawn(async move {
            if let Some(turn) = &turn {
                turn.wait().await;
            }
            let result = executor.run(call).await.and_then(|r| r);
            drop(turn);
            if let Err(e) = &result {
                tracing::debug!(operation, error = %e, "operation failed");
            }
            // The caller may have dropped the operation
            let _ = sender.send(result);
        });

        Operation::pending(receiver)
    }
}

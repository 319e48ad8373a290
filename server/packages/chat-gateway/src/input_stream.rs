use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use chat_gateway_error::GatewayError;
use futures::Stream;
use parking_lot::Mutex;

use crate::events::InputEvent;

/// Terminal state of the controller. Closed-with-error is consumed once:
/// after the receiver raises the error the state collapses to `Closed`.
#[derive(Debug)]
enum StreamState {
    Open,
    Closed,
    ClosedWithError(GatewayError),
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<InputEvent>,
    state: StreamState,
    waker: Option<Waker>,
}

impl Inner {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// Push side of the input hand-off: accepts input events from arbitrary
/// callers and feeds the single [`InputReceiver`] consumed by the agent
/// driver. An event pushed while the consumer is parked is delivered
/// immediately; otherwise it queues in FIFO order.
#[derive(Debug, Clone)]
pub struct InputStreamController {
    inner: Arc<Mutex<Inner>>,
}

impl InputStreamController {
    /// Creates a controller and its single pull side.
    pub fn channel() -> (Self, InputReceiver) {
        let inner = Arc::new(Mutex::new(Inner {
            queue: VecDeque::new(),
            state: StreamState::Open,
            waker: None,
        }));
        (
            Self {
                inner: inner.clone(),
            },
            InputReceiver { inner },
        )
    }

    pub fn push(&self, event: InputEvent) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock();
        match inner.state {
            StreamState::Open => {
                inner.queue.push_back(event);
                inner.wake();
                Ok(())
            }
            _ => Err(GatewayError::StreamClosed),
        }
    }

    /// Marks the stream ended. Idempotent; queued events still drain.
    pub fn end(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, StreamState::Open) {
            inner.state = StreamState::Closed;
            inner.wake();
        }
    }

    /// Ends the stream only when no queued input remains. An event pushed
    /// after the deadline but before this runs keeps the stream open.
    pub fn end_if_idle(&self) {
        let mut inner = self.inner.lock();
        if inner.queue.is_empty() && matches!(inner.state, StreamState::Open) {
            inner.state = StreamState::Closed;
            inner.wake();
        }
    }

    /// Ends the stream with a terminal error raised to the consumer after
    /// the queue drains.
    pub fn end_with_error(&self, error: GatewayError) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, StreamState::Open) {
            inner.state = StreamState::ClosedWithError(error);
            inner.wake();
        }
    }

    /// Buffered events not yet delivered to the consumer.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_ended(&self) -> bool {
        !matches!(self.inner.lock().state, StreamState::Open)
    }
}

/// Pull side: exactly one logical consumer iterates this.
#[derive(Debug)]
pub struct InputReceiver {
    inner: Arc<Mutex<Inner>>,
}

impl Stream for InputReceiver {
    type Item = Result<InputEvent, GatewayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut inner = self.inner.lock();
        if let Some(event) = inner.queue.pop_front() {
            return Poll::Ready(Some(Ok(event)));
        }
        match std::mem::replace(&mut inner.state, StreamState::Closed) {
            StreamState::Open => {
                inner.state = StreamState::Open;
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            StreamState::Closed => Poll::Ready(None),
            StreamState::ClosedWithError(error) => Poll::Ready(Some(Err(error))),
        }
    }
}

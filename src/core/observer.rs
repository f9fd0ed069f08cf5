//! Response outcome observation.
//!
//! [`ResponseObserver`] tracks the final status code and cumulative body
//! bytes of a single response without changing its behavior. The status is
//! latched by the first status-setting call or the first body write,
//! whichever happens first; later attempts are ignored, mirroring the
//! transport's own "first header wins" rule.
//!
//! [`ObservedBody`] is the decorating body that feeds the observer while
//! frames stream through it. It forwards every frame untouched and reports
//! how the stream ended, so the access logger can emit its record exactly
//! once, after the true outcome of the response is known.
use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use bytes::Buf;
use http::StatusCode;
use http_body::{Body, Frame, SizeHint};

/// How a response body stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The body reached end-of-stream.
    Finished,
    /// The underlying body returned an error.
    Errored,
    /// The body was dropped before end-of-stream (peer went away).
    Aborted,
}

/// Shared per-response state: latched status, header-written flag and a
/// byte counter. Owned by exactly one request; the atomics exist because
/// the middleware and the streaming body hold the same handle, not for
/// cross-request sharing.
#[derive(Debug, Default)]
pub struct ResponseObserver {
    status: AtomicU16,
    header_written: AtomicBool,
    bytes_written: AtomicU64,
}

impl ResponseObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Latch a status code. Only the first call (or an earlier implicit
    /// latch from a body write) takes effect.
    pub fn latch_status(&self, status: StatusCode) {
        if self
            .header_written
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.status.store(status.as_u16(), Ordering::Release);
        }
    }

    /// Account for body bytes. The first write implicitly latches the
    /// default success status, matching an implicit header flush.
    pub fn record_write(&self, bytes: u64) {
        self.latch_status(StatusCode::OK);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// The latched status, or 200 if nothing was latched yet.
    pub fn status(&self) -> StatusCode {
        match self.status.load(Ordering::Acquire) {
            0 => StatusCode::OK,
            code => StatusCode::from_u16(code).unwrap_or(StatusCode::OK),
        }
    }

    /// Whether a status has been latched (explicitly or by a write).
    pub fn header_written(&self) -> bool {
        self.header_written.load(Ordering::Acquire)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

type CompletionHook = Box<dyn FnOnce(Completion) + Send>;

/// Body decorator that counts data bytes into a [`ResponseObserver`] and
/// invokes a completion hook exactly once when the stream ends, fails, or
/// is dropped mid-flight.
///
/// It is a drop-in substitute for the wrapped body: frames, end-of-stream
/// signaling and size hints all pass through unchanged, and the wrapped
/// body stays reachable through [`ObservedBody::get_ref`] for callers that
/// need capabilities of the original.
pub struct ObservedBody<B> {
    inner: B,
    observer: Arc<ResponseObserver>,
    completion: Option<CompletionHook>,
}

impl<B> ObservedBody<B> {
    pub fn new(inner: B, observer: Arc<ResponseObserver>) -> Self {
        Self {
            inner,
            observer,
            completion: None,
        }
    }

    /// Attach a hook fired exactly once with the stream's final outcome.
    pub fn with_completion(
        inner: B,
        observer: Arc<ResponseObserver>,
        hook: impl FnOnce(Completion) + Send + 'static,
    ) -> Self {
        Self {
            inner,
            observer,
            completion: Some(Box::new(hook)),
        }
    }

    pub fn observer(&self) -> &Arc<ResponseObserver> {
        &self.observer
    }

    /// The wrapped body.
    pub fn get_ref(&self) -> &B {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut B {
        &mut self.inner
    }

    fn complete(&mut self, outcome: Completion) {
        if let Some(hook) = self.completion.take() {
            hook(outcome);
        }
    }
}

impl<B> Body for ObservedBody<B>
where
    B: Body + Unpin,
    B::Data: Buf,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.observer.record_write(data.remaining() as u64);
                }
                // hyper may skip the final poll when the body reports
                // end-of-stream after its last frame
                if this.inner.is_end_stream() {
                    this.complete(Completion::Finished);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.complete(Completion::Errored);
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.complete(Completion::Finished);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for ObservedBody<B> {
    fn drop(&mut self) {
        self.complete(Completion::Aborted);
    }
}

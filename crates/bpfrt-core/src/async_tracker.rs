//! Asynchronous request tracking
//!
//! A request is identified by an opaque context token (typically the
//! address of the caller's request block). Its lifetime is a strict
//! state machine: pending, then exactly one of completed or cancelled.
//! A completion arriving after a cancellation is swallowed so the
//! issuer of the cancel never sees a late callback.

use std::collections::HashMap;

use crate::error::{BpfError, BpfResult};
use crate::spinlock::SpinLock;

/// Invoked when a pending request completes, with the context token,
/// the output length, and the request's result.
pub type CompletionCallback = Box<dyn FnOnce(usize, usize, BpfResult) + Send>;

/// Invoked when a pending request is cancelled, with the registered
/// cancel context.
pub type CancelCallback = Box<dyn FnOnce(usize) + Send>;

enum RequestState {
    Pending,
    Cancelled,
}

struct Request {
    state: RequestState,
    completion: Option<CompletionCallback>,
    cancel: Option<(usize, CancelCallback)>,
}

/// Tracks in-flight asynchronous requests.
///
/// Callbacks run on the thread that drives the transition and must not
/// re-enter the tracker for the same context.
pub struct AsyncTracker {
    requests: SpinLock<HashMap<usize, Request>>,
}

impl AsyncTracker {
    pub fn new() -> Self {
        AsyncTracker {
            requests: SpinLock::new(HashMap::new()),
        }
    }

    /// Begin tracking `context` with a completion callback.
    ///
    /// Registration is one-shot; a second registration for the same
    /// context fails with `InvalidArgument`.
    pub fn set_completion_callback(
        &self,
        context: usize,
        callback: CompletionCallback,
    ) -> BpfResult {
        let mut requests = self.requests.lock();
        if requests.contains_key(&context) {
            return Err(BpfError::InvalidArgument);
        }
        requests.insert(
            context,
            Request {
                state: RequestState::Pending,
                completion: Some(callback),
                cancel: None,
            },
        );
        Ok(())
    }

    /// Attach a cancel callback to a tracked context.
    ///
    /// Fails with `InvalidArgument` if the context is not tracked or a
    /// cancel callback is already attached.
    pub fn set_cancel_callback(
        &self,
        context: usize,
        cancel_context: usize,
        callback: CancelCallback,
    ) -> BpfResult {
        let mut requests = self.requests.lock();
        match requests.get_mut(&context) {
            Some(request) if request.cancel.is_none() => {
                request.cancel = Some((cancel_context, callback));
                Ok(())
            }
            _ => Err(BpfError::InvalidArgument),
        }
    }

    /// Complete a tracked request.
    ///
    /// In the pending state this invokes the completion callback with
    /// `(context, output_length, result)`. After a cancellation the
    /// completion is dropped silently. Untracked contexts are ignored.
    pub fn complete(&self, context: usize, output_length: usize, result: BpfResult) {
        let request = {
            let mut requests = self.requests.lock();
            requests.remove(&context)
        };
        // Callback runs outside the lock.
        if let Some(request) = request {
            if let (RequestState::Pending, Some(callback)) = (request.state, request.completion) {
                callback(context, output_length, result);
            }
        }
    }

    /// Cancel a tracked request.
    ///
    /// Returns true only on the pending-to-cancelled transition; the
    /// cancel callback fires on that transition and never again.
    pub fn cancel(&self, context: usize) -> bool {
        let cancel = {
            let mut requests = self.requests.lock();
            match requests.get_mut(&context) {
                Some(request) if matches!(request.state, RequestState::Pending) => {
                    request.state = RequestState::Cancelled;
                    request.completion = None;
                    request.cancel.take()
                }
                _ => return false,
            }
        };
        if let Some((cancel_context, callback)) = cancel {
            callback(cancel_context);
        }
        true
    }

    /// Number of contexts still tracked (pending or cancelled but not
    /// yet completed).
    pub fn tracked_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl Default for AsyncTracker {
    fn default() -> Self {
        AsyncTracker::new()
    }
}

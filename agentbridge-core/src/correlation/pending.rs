//! Pending requests and the waiter handed back to callers.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::BridgeError;
use crate::protocol::{Request, Response, WorkItems};
use crate::timeout::TimeoutChecker;

/// Address of a pending request in the correlation cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub registration: String,
    pub correlation_id: String,
}

impl PendingKey {
    #[must_use]
    pub fn new(registration: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            registration: registration.into(),
            correlation_id: correlation_id.into(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A dispatched request awaiting its reply.
///
/// Resolved at most once: the first call to [`PendingRequest::complete`]
/// takes the completion handle, every later call is a no-op.
#[derive(Debug)]
pub struct PendingRequest {
    key: PendingKey,
    created_at: DateTime<Utc>,
    started: Instant,
    checker: TimeoutChecker,
    work: Mutex<WorkItems>,
    completion: Mutex<Option<oneshot::Sender<Response>>>,
}

impl PendingRequest {
    /// Creates the entry and the waiter bound to it.
    #[must_use]
    pub fn new(key: PendingKey, request: Request, timeout: Duration) -> (Arc<Self>, PendingReply) {
        let (tx, rx) = oneshot::channel();
        let mut work = WorkItems::new(key.correlation_id.clone());
        // A fresh unit is never complete.
        let _ = work.push(request);

        let reply = PendingReply {
            key: key.clone(),
            rx,
        };
        let pending = Arc::new(Self {
            key,
            created_at: Utc::now(),
            started: Instant::now(),
            checker: TimeoutChecker::new(timeout),
            work: Mutex::new(work),
            completion: Mutex::new(Some(tx)),
        });
        (pending, reply)
    }

    #[must_use]
    pub fn key(&self) -> &PendingKey {
        &self.key
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.checker.timeout()
    }

    /// Time left before the request times out.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.checker.remaining(self.started, Instant::now())
    }

    /// Resolves the request with `response`. Returns false if it was
    /// already resolved.
    pub fn complete(&self, response: Response) -> bool {
        let Some(sender) = lock(&self.completion).take() else {
            return false;
        };
        lock(&self.work).resolve(response.clone());
        // The caller may have stopped waiting; nothing to do then.
        let _ = sender.send(response);
        true
    }

    /// Resolves the request with an `ERROR` response built from `err`.
    pub fn fail(&self, err: &BridgeError) -> bool {
        self.complete(Response::error(err))
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        lock(&self.completion).is_none()
    }

    /// Copy of the request/response exchange recorded so far.
    #[must_use]
    pub fn work_items(&self) -> WorkItems {
        lock(&self.work).clone()
    }
}

/// Future resolving to the reply of one dispatched request.
///
/// Never fails: every failure arrives as an `ERROR` response.
#[derive(Debug)]
pub struct PendingReply {
    key: PendingKey,
    rx: oneshot::Receiver<Response>,
}

impl PendingReply {
    /// A waiter that is already resolved with `response`.
    #[must_use]
    pub fn resolved(key: PendingKey, response: Response) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(response);
        Self { key, rx }
    }

    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.key.correlation_id
    }

    #[must_use]
    pub fn key(&self) -> &PendingKey {
        &self.key
    }
}

impl Future for PendingReply {
    type Output = Response;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let key = self.key.clone();
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Response::error(&BridgeError::Shutdown {
                    registration: key.registration,
                    reason: "pending request dropped without a reply".to_string(),
                })
            })
        })
    }
}

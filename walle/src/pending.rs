use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::{DashMap, mapref::entry::Entry};
use foldhash::fast::RandomState;
use tokio::sync::oneshot;

use crate::{
    error::{Error, ErrorKind, Result},
    msg::BizResponse,
    supervisor::TaskSupervisor,
};

struct PendingCall {
    token: u64,
    created_at: Instant,
    signal: oneshot::Sender<Result<()>>,
}

/// Correlates outstanding requests with the responses that arrive for them.
///
/// `waits` holds the signal of every call still in flight; `responses` holds
/// responses that were delivered but not yet claimed by their waiter. An
/// entry leaves `waits` exactly once, either through [`deliver`](Self::deliver)
/// or through the sweeper, and only the side that removed it signals the
/// waiter.
pub struct PendingCalls {
    timeout: Duration,
    token: AtomicU64,
    waits: DashMap<String, PendingCall, RandomState>,
    responses: DashMap<String, BizResponse, RandomState>,
}

impl PendingCalls {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            token: AtomicU64::default(),
            waits: DashMap::default(),
            responses: DashMap::default(),
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Starts tracking `request_id`.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateRequestId` if a call with the same id is still
    /// outstanding.
    pub fn register_wait(&self, request_id: &str) -> Result<PendingGuard<'_>> {
        let (tx, rx) = oneshot::channel();
        let token = self.token.fetch_add(1, Ordering::Relaxed);
        match self.waits.entry(request_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(Error::new(
                    ErrorKind::DuplicateRequestId,
                    format!("request id {request_id} is already pending"),
                ));
            }
            Entry::Vacant(entry) => {
                entry.insert(PendingCall {
                    token,
                    created_at: Instant::now(),
                    signal: tx,
                });
            }
        }
        Ok(PendingGuard {
            table: self,
            request_id: request_id.to_string(),
            token,
            rx: Some(rx),
            done: false,
        })
    }

    /// Hands `response` to the waiter of `request_id`.
    ///
    /// Returns `false` and drops the response if nobody waits for it, which
    /// happens when the call already timed out or the id is unknown.
    pub fn deliver(&self, request_id: &str, mut response: BizResponse) -> bool {
        let Some((_, call)) = self.waits.remove(request_id) else {
            tracing::info!(
                "request id {request_id} is not pending, discard response: {:?}",
                response.result
            );
            return false;
        };
        response.stamp_receive_time();
        self.responses.insert(request_id.to_string(), response);
        if call.signal.send(Ok(())).is_err() {
            // the waiter is gone and its guard has already cleaned up.
            self.responses.remove(request_id);
        }
        true
    }

    /// Resolves every wait older than the timeout with a `Timeout` error.
    ///
    /// Returns the number of calls evicted.
    pub fn sweep(&self) -> usize {
        let expired: Vec<String> = self
            .waits
            .iter()
            .filter(|entry| entry.created_at.elapsed() >= self.timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut count = 0;
        for request_id in expired {
            if let Some((_, call)) = self
                .waits
                .remove_if(&request_id, |_, call| call.created_at.elapsed() >= self.timeout)
            {
                tracing::warn!("request id {request_id} timed out after {:?}", self.timeout);
                let _ = call.signal.send(Err(Error::new(
                    ErrorKind::Timeout,
                    format!("request {request_id} timed out"),
                )));
                count += 1;
            }
        }
        count
    }

    /// Runs [`sweep`](Self::sweep) every `timeout` until `supervisor` stops.
    pub fn spawn_sweeper(self: &Arc<Self>, supervisor: &TaskSupervisor) {
        let this = Arc::downgrade(self);
        let period = self.timeout;
        supervisor.spawn("pending call sweeper", async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(this) = this.upgrade() else {
                    break;
                };
                this.sweep();
            }
        });
    }

    #[must_use]
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.waits.contains_key(request_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waits.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }
}

impl std::fmt::Debug for PendingCalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCalls")
            .field("timeout", &self.timeout)
            .field("waits", &self.waits.len())
            .field("responses", &self.responses.len())
            .finish()
    }
}

/// Handle of one registered call. Dropping it removes whatever the call
/// still owns in the table.
pub struct PendingGuard<'a> {
    table: &'a PendingCalls,
    request_id: String,
    token: u64,
    rx: Option<oneshot::Receiver<Result<()>>>,
    done: bool,
}

impl PendingGuard<'_> {
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Waits up to `timeout` for the response.
    ///
    /// If the wait expires but a response was delivered concurrently, the
    /// response wins over the timeout.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if no response arrived in time.
    pub async fn wait(mut self, timeout: Duration) -> Result<BizResponse> {
        let table = self.table;
        let token = self.token;
        let request_id = &self.request_id;
        let Some(rx) = self.rx.as_mut() else {
            return Err(Error::new(ErrorKind::InvalidArgument, "wait called twice"));
        };
        let result = match tokio::time::timeout(timeout, &mut *rx).await {
            Ok(signal) => table.claim(request_id, signal),
            Err(_) => {
                if table.cancel(request_id, token) {
                    Err(Error::new(
                        ErrorKind::Timeout,
                        format!("request {request_id} timed out"),
                    ))
                } else {
                    // deliver or the sweeper removed the wait first; its
                    // signal is already sent or about to be.
                    let signal = rx.await;
                    table.claim(request_id, signal)
                }
            }
        };
        self.done = true;
        result
    }
}

impl PendingCalls {
    fn cancel(&self, request_id: &str, token: u64) -> bool {
        self.waits
            .remove_if(request_id, |_, call| call.token == token)
            .is_some()
    }

    fn claim(
        &self,
        request_id: &str,
        signal: std::result::Result<Result<()>, oneshot::error::RecvError>,
    ) -> Result<BizResponse> {
        match signal {
            Ok(Ok(())) => self
                .responses
                .remove(request_id)
                .map(|(_, response)| response)
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::RecvFailed,
                        format!("response of {request_id} was claimed twice"),
                    )
                }),
            Ok(Err(err)) => Err(err),
            Err(e) => Err(Error::new(ErrorKind::RecvFailed, e.to_string())),
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        // close the receiver first: a deliver racing with this drop then
        // sees the send fail and removes its own response.
        drop(self.rx.take());
        if !self.done {
            self.table.cancel(&self.request_id, self.token);
            self.table.responses.remove(&self.request_id);
        }
    }
}

impl std::fmt::Debug for PendingGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingGuard")
            .field("request_id", &self.request_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: &str) -> BizResponse {
        BizResponse::ok(id, serde_json::json!(id))
    }

    #[tokio::test]
    async fn test_deliver_exactly_once() {
        let table = Arc::new(PendingCalls::new(Duration::from_secs(5)));

        let guard = table.register_wait("a").unwrap();
        assert!(table.is_pending("a"));

        let handle = {
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                assert!(table.deliver("a", response("a")));
                assert!(!table.deliver("a", response("a")));
            })
        };

        let rsp = guard.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(rsp.request_id, "a");
        assert!(rsp.receive_time.is_some());
        handle.await.unwrap();

        assert!(table.is_empty());
        assert!(table.responses.is_empty());
        assert!(!table.deliver("unknown", response("unknown")));
    }

    #[tokio::test]
    async fn test_duplicate_request_id() {
        let table = PendingCalls::new(Duration::from_secs(5));
        let guard = table.register_wait("dup").unwrap();
        let err = table.register_wait("dup").unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateRequestId);

        assert!(table.deliver("dup", response("dup")));
        guard.wait(Duration::from_secs(1)).await.unwrap();

        // the id is free again once the first call completed.
        let guard = table.register_wait("dup").unwrap();
        drop(guard);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let table = PendingCalls::new(Duration::from_secs(5));
        let guard = table.register_wait("slow").unwrap();

        let start = Instant::now();
        let err = guard.wait(Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(2));

        // a late response is discarded.
        assert!(!table.deliver("slow", response("slow")));
        assert!(table.responses.is_empty());
    }

    #[tokio::test]
    async fn test_delivered_response_beats_timeout() {
        let table = PendingCalls::new(Duration::from_secs(5));
        let guard = table.register_wait("fast").unwrap();
        assert!(table.deliver("fast", response("fast")));

        let rsp = guard.wait(Duration::ZERO).await.unwrap();
        assert_eq!(rsp.request_id, "fast");
    }

    #[tokio::test]
    async fn test_sweep() {
        let table = Arc::new(PendingCalls::new(Duration::from_millis(50)));
        let old = table.register_wait("old").unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let fresh = table.register_wait("fresh").unwrap();

        assert_eq!(table.sweep(), 1);
        assert!(!table.is_pending("old"));
        assert!(table.is_pending("fresh"));

        let err = old.wait(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(!table.deliver("old", response("old")));

        assert!(table.deliver("fresh", response("fresh")));
        fresh.wait(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_task() {
        let supervisor = TaskSupervisor::create();
        let table = Arc::new(PendingCalls::new(Duration::from_millis(50)));
        table.spawn_sweeper(&supervisor);

        let guard = table.register_wait("swept").unwrap();
        let start = Instant::now();
        let err = guard.wait(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_secs(1));

        supervisor.stop();
        supervisor.all_stopped().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_deliver_racing_abandoned_waits() {
        let table = PendingCalls::new(Duration::from_secs(5));
        let guard = table.register_wait("unclaimed").unwrap();
        assert!(table.deliver("unclaimed", response("unclaimed")));
        drop(guard);
        assert!(table.responses.is_empty());

        let table = Arc::new(PendingCalls::new(Duration::from_secs(5)));
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..500 {
            let id = format!("race-{i}");
            let waiter = {
                let table = Arc::clone(&table);
                let id = id.clone();
                async move {
                    // abandoned while a response may be in flight.
                    let guard = table.register_wait(&id).unwrap();
                    tokio::task::yield_now().await;
                    drop(guard);
                }
            };
            let deliverer = {
                let table = Arc::clone(&table);
                async move {
                    table.deliver(&id, response(&id));
                }
            };
            tasks.spawn(waiter);
            tasks.spawn(deliverer);
        }
        while let Some(r) = tasks.join_next().await {
            r.unwrap();
        }
        assert!(table.is_empty());
        assert!(table.responses.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_guard_cleans_up() {
        let table = PendingCalls::new(Duration::from_secs(5));
        let guard = table.register_wait("gone").unwrap();
        drop(guard);
        assert!(!table.is_pending("gone"));
        assert!(!table.deliver("gone", response("gone")));

        let guard = table.register_wait("abandoned").unwrap();
        let wait = guard.wait(Duration::from_secs(5));
        // dropping the wait future mid-flight abandons the call.
        let _ = tokio::time::timeout(Duration::from_millis(10), wait).await;
        assert!(!table.is_pending("abandoned"));
        assert!(table.responses.is_empty());
    }
}

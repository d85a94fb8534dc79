use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use foldhash::fast::RandomState;
use tokio::{sync::oneshot, time::Instant};

use crate::{
    Response, TaskSupervisor,
    error::{Error, ErrorKind, Result},
    msg::code,
};

struct PendingCall {
    tx: oneshot::Sender<Response>,
    deadline: Instant,
}

/// Correlates in-flight requests with the responses that eventually arrive.
///
/// Each registered id owns one oneshot channel; whoever removes the id from the
/// map first (a matching [`complete`](Self::complete), the caller's own timeout,
/// or the reaper) decides the outcome, and every later attempt is a no-op.
#[derive(Default)]
pub struct PendingCallTable {
    calls: DashMap<i64, PendingCall, RandomState>,
}

/// Caller side of one pending call. Dropping it before the call finishes
/// removes the table entry.
pub struct PendingCallHandle<'a> {
    table: &'a PendingCallTable,
    id: i64,
    rx: oneshot::Receiver<Response>,
    done: bool,
}

impl PendingCallTable {
    /// Registers `id` as pending, expiring `deadline_after` from now.
    ///
    /// # Errors
    ///
    /// Fails with `DuplicateRequestId` if `id` is already pending.
    pub fn register(&self, id: i64, deadline_after: Duration) -> Result<PendingCallHandle<'_>> {
        let (tx, rx) = oneshot::channel();
        match self.calls.entry(id) {
            Entry::Occupied(_) => {
                return Err(Error::new(
                    ErrorKind::DuplicateRequestId,
                    format!("request id {id} is already pending"),
                ));
            }
            Entry::Vacant(entry) => {
                entry.insert(PendingCall {
                    tx,
                    deadline: Instant::now() + deadline_after,
                });
            }
        }
        Ok(PendingCallHandle {
            table: self,
            id,
            rx,
            done: false,
        })
    }

    /// Hands `response` to the call registered under `response.id`.
    ///
    /// Returns false, without side effects, when the id is unknown or the call
    /// already finished.
    pub fn complete(&self, response: Response) -> bool {
        if let Some((_, call)) = self.calls.remove(&response.id) {
            let _ = call.tx.send(response);
            true
        } else {
            tracing::warn!("no pending call for response id: {}", response.id);
            false
        }
    }

    /// Drops the call without a response; its waiter sees a transport failure.
    pub fn cancel(&self, id: i64) -> bool {
        self.calls.remove(&id).is_some()
    }

    #[must_use]
    pub fn contains(&self, id: i64) -> bool {
        self.calls.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Completes every call whose deadline is at or before `now` with a link
    /// timeout. Returns how many calls this sweep finished.
    pub fn reap(&self, now: Instant) -> usize {
        let expired: Vec<i64> = self
            .calls
            .iter()
            .filter(|call| call.deadline <= now)
            .map(|call| *call.key())
            .collect();

        expired
            .into_iter()
            .filter(|id| self.complete(Response::link_timeout(*id)))
            .count()
    }

    /// Sweeps the table every `interval` until `supervisor` stops, so no call
    /// outlives its deadline by more than one interval even if nobody waits on it.
    pub fn start_reaper(self: &Arc<Self>, interval: Duration, supervisor: &TaskSupervisor) {
        let table = self.clone();
        supervisor.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = table.reap(Instant::now());
                if reaped > 0 {
                    tracing::warn!("reaped {reaped} timed out calls");
                }
            }
        });
    }
}

impl PendingCallHandle<'_> {
    #[must_use]
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Waits for the response, giving up after `timeout`.
    ///
    /// Never blocks past the timeout: on expiry the call is withdrawn from the
    /// table and a link-timeout response is returned, unless a real response won
    /// the race, in which case that one is returned.
    pub async fn wait(mut self, timeout: Duration) -> Response {
        let id = self.id;
        let result = tokio::time::timeout(timeout, &mut self.rx).await;
        self.done = true;
        match result {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Response::failure(id, code::TRANSPORT_FAILED, "call cancelled"),
            Err(_) => {
                if self.table.cancel(id) {
                    Response::link_timeout(id)
                } else {
                    // a completion removed the entry first; its send is already under way.
                    (&mut self.rx)
                        .await
                        .unwrap_or_else(|_| Response::link_timeout(id))
                }
            }
        }
    }
}

impl Drop for PendingCallHandle<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.table.cancel(self.id);
        }
    }
}

impl std::fmt::Debug for PendingCallTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCallTable")
            .field("pending", &self.calls.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_matches_id() {
        let table = Arc::new(PendingCallTable::default());
        let handle = table.register(7, Duration::from_secs(60)).unwrap();
        assert!(table.contains(7));

        let task = {
            let table = table.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                assert!(!table.complete(Response::success(8, json!("other"))));
                assert!(table.complete(Response::success(7, json!("done"))));
            })
        };

        let response = handle.wait(Duration::from_secs(5)).await;
        assert_eq!(response.id, 7);
        assert_eq!(response.result, json!("done"));
        assert!(!table.contains(7));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_complete_is_exactly_once() {
        let table = PendingCallTable::default();
        let handle = table.register(1, Duration::from_secs(60)).unwrap();
        assert!(table.complete(Response::success(1, json!(1))));
        assert!(!table.complete(Response::success(1, json!(2))));
        assert_eq!(table.reap(Instant::now() + Duration::from_secs(120)), 0);

        let response = handle.wait(Duration::from_secs(1)).await;
        assert_eq!(response.result, json!(1));
    }

    #[tokio::test]
    async fn test_duplicate_id() {
        let table = PendingCallTable::default();
        let _handle = table.register(1, Duration::from_secs(60)).unwrap();
        let err = table.register(1, Duration::from_secs(60)).err().unwrap();
        assert_eq!(err.kind, ErrorKind::DuplicateRequestId);
    }

    #[tokio::test]
    async fn test_local_timeout() {
        let table = PendingCallTable::default();
        let handle = table.register(3, Duration::from_secs(60)).unwrap();
        let response = handle.wait(Duration::from_millis(20)).await;
        assert_eq!(response.code, code::LINK_TIMEOUT);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_reap_expired() {
        let table = PendingCallTable::default();
        let short = table.register(1, Duration::from_secs(1)).unwrap();
        let _long = table.register(2, Duration::from_secs(60)).unwrap();

        assert_eq!(table.reap(Instant::now()), 0);
        assert_eq!(table.reap(Instant::now() + Duration::from_secs(2)), 1);
        assert!(!table.contains(1));
        assert!(table.contains(2));

        let response = short.wait(Duration::from_secs(60)).await;
        assert_eq!(response.code, code::LINK_TIMEOUT);
        assert_eq!(response.id, 1);
    }

    #[tokio::test]
    async fn test_reaper_sweeps_abandoned_calls() {
        let table = Arc::new(PendingCallTable::default());
        let supervisor = TaskSupervisor::create();
        table.start_reaper(Duration::from_millis(20), &supervisor);

        let handle = table.register(9, Duration::from_millis(30)).unwrap();
        // nobody waits: leak the handle so its drop cannot clean up.
        std::mem::forget(handle);
        assert!(table.contains(9));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!table.contains(9));
        supervisor.stop();
    }

    #[tokio::test]
    async fn test_dropped_handle_cleans_up() {
        let table = PendingCallTable::default();
        let handle = table.register(5, Duration::from_secs(60)).unwrap();
        drop(handle);
        assert!(!table.contains(5));
        assert!(!table.complete(Response::success(5, json!(null))));
    }
}

//! Request/response correlator
//!
//! HEOS responses carry no correlation token, only the echoed command. Requests
//! are therefore matched by command kind, with at most one request of a kind on
//! the wire at a time: a second `player/get_volume` waits (FIFO) until the first
//! one resolves or times out. Different kinds run concurrently.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{HeosError, Result};
use crate::heos::codec::{Command, Response};

/// Default bound on a single request/response cycle
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Where encoded command lines go
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue one encoded command line (without CRLF) for the socket
    async fn send_line(&self, line: String) -> Result<()>;
}

struct PendingRequest {
    id: u64,
    submitted_at: Instant,
    /// A late response of this kind was dropped while this request waited.
    /// That response may well have been ours, so a timeout here owes nothing.
    shadowed: bool,
    tx: oneshot::Sender<Result<Response>>,
}

enum Route {
    Deliver(PendingRequest),
    Late,
    Unsolicited,
}

#[derive(Default)]
struct PendingTable {
    next_id: u64,
    entries: HashMap<String, PendingRequest>,
    /// Responses still owed to requests that gave up waiting, per kind,
    /// as the instant each debt lapses
    late: HashMap<String, VecDeque<Instant>>,
}

impl PendingTable {
    /// Settle one unexpired debt for `kind`. Lapsed debts are forgotten.
    fn take_debt(&mut self, kind: &str, now: Instant) -> bool {
        let Some(debts) = self.late.get_mut(kind) else {
            return false;
        };
        while debts.front().map_or(false, |lapses_at| *lapses_at <= now) {
            debts.pop_front();
            tracing::debug!("Forgetting unanswered {} request", kind);
        }
        let paid = debts.pop_front().is_some();
        if debts.is_empty() {
            self.late.remove(kind);
        }
        paid
    }
}

pub struct Correlator {
    /// Per-kind FIFO ticket; tokio's Mutex queues waiters fairly
    tickets: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    pending: Mutex<PendingTable>,
    request_timeout: Duration,
}

impl Correlator {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            tickets: Mutex::new(HashMap::new()),
            pending: Mutex::new(PendingTable::default()),
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn ticket(&self, kind: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.tickets
            .lock()
            .entry(kind.to_string())
            .or_default()
            .clone()
    }

    /// Send `command` and wait for its response.
    ///
    /// Resolves with the response on success, `HeosError::Command` when the device
    /// reports `result=fail`, or `Timeout` after the request bound. Dropping the
    /// returned future abandons only this request.
    pub async fn submit(&self, command: &Command, transport: &dyn Transport) -> Result<Response> {
        let kind = command.kind();
        let ticket = self.ticket(&kind);
        let ticket_guard = ticket.lock().await;

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut table = self.pending.lock();
            table.next_id += 1;
            let id = table.next_id;
            table.entries.insert(
                kind.clone(),
                PendingRequest {
                    id,
                    submitted_at: Instant::now(),
                    shadowed: false,
                    tx,
                },
            );
            id
        };
        let mut registration = Registration {
            correlator: self,
            kind: &kind,
            id,
            sent: false,
        };

        let line = command.encode();
        tracing::debug!("TX: {}", line);
        transport.send_line(line).await?;
        registration.sent = true;

        let mut rx = rx;
        let result = match tokio::time::timeout(self.request_timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HeosError::Cancelled),
            Err(_) => match rx.try_recv() {
                // Resolved in the same instant the timer fired
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!("{} timed out after {:?}", kind, self.request_timeout);
                    Err(HeosError::Timeout {
                        command: kind.clone(),
                        after: self.request_timeout,
                    })
                }
            },
        };

        drop(registration);
        drop(ticket_guard);
        result
    }

    /// Route a decoded response to the request waiting for its kind
    pub fn resolve(&self, response: Response) {
        if response.is_under_process() {
            tracing::debug!("{} under process", response.command);
            return;
        }

        let route = {
            let mut table = self.pending.lock();
            if table.take_debt(&response.command, Instant::now()) {
                if let Some(pending) = table.entries.get_mut(&response.command) {
                    pending.shadowed = true;
                }
                Route::Late
            } else {
                match table.entries.remove(&response.command) {
                    Some(pending) => Route::Deliver(pending),
                    None => Route::Unsolicited,
                }
            }
        };

        let pending = match route {
            Route::Deliver(pending) => pending,
            Route::Late => {
                tracing::warn!("Dropping late response for {}", response.command);
                return;
            }
            Route::Unsolicited => {
                tracing::debug!("No pending request for {}, dropping response", response.command);
                return;
            }
        };

        let kind = response.command.clone();
        tracing::trace!(
            "{} resolved after {:?}",
            kind,
            pending.submitted_at.elapsed()
        );
        let result = match response.error() {
            Some(err) => Err(err),
            None => Ok(response),
        };
        if pending.tx.send(result).is_err() {
            tracing::debug!("Caller for {} went away before its response", kind);
        }
    }

    /// Resolve every pending request with `error` and forget owed late responses
    pub fn fail_all(&self, error: HeosError) {
        let drained: Vec<PendingRequest> = {
            let mut table = self.pending.lock();
            table.late.clear();
            table.entries.drain().map(|(_, pending)| pending).collect()
        };
        if !drained.is_empty() {
            tracing::debug!("Failing {} pending requests: {}", drained.len(), error);
        }
        for pending in drained {
            if pending.tx.send(Err(error.clone())).is_err() {
                tracing::trace!("Pending caller already gone");
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().entries.len()
    }
}

/// Removes the pending entry when `submit` finishes or is dropped. A request
/// that reached the wire without being answered leaves one owed late response,
/// which lapses two request timeouts after submission.
struct Registration<'a> {
    correlator: &'a Correlator,
    kind: &'a str,
    id: u64,
    sent: bool,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut table = self.correlator.pending.lock();
        let ours = table
            .entries
            .get(self.kind)
            .map_or(false, |pending| pending.id == self.id);
        if !ours {
            return;
        }
        let Some(pending) = table.entries.remove(self.kind) else {
            return;
        };
        if self.sent && !pending.shadowed {
            let lapses_at = pending.submitted_at + self.correlator.request_timeout * 2;
            table
                .late
                .entry(self.kind.to_string())
                .or_default()
                .push_back(lapses_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heos::codec::{decode, Message};
    use tokio::sync::mpsc;

    struct ChannelTransport(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send_line(&self, line: String) -> Result<()> {
            self.0.send(line).map_err(|_| HeosError::ConnectionLost)
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn send_line(&self, _line: String) -> Result<()> {
            Err(HeosError::NotConnected)
        }
    }

    fn setup(timeout: Duration) -> (Arc<Correlator>, Arc<ChannelTransport>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Correlator::new(timeout)),
            Arc::new(ChannelTransport(tx)),
            rx,
        )
    }

    fn volume_response(level: u8) -> Response {
        let line = format!(
            r#"{{"heos": {{"command": "player/get_volume", "result": "success", "message": "pid=1&level={}"}}}}"#,
            level
        );
        match decode(&line) {
            Message::Response(r) => r,
            other => panic!("expected response, got {:?}", other),
        }
    }

    fn get_volume() -> Command {
        Command::new("player", "get_volume").param("pid", 1)
    }

    #[tokio::test]
    async fn resolves_matching_kind() {
        let (correlator, transport, mut wire) = setup(DEFAULT_REQUEST_TIMEOUT);

        let c = correlator.clone();
        let t = transport.clone();
        let request = tokio::spawn(async move { c.submit(&get_volume(), t.as_ref()).await });

        assert_eq!(wire.recv().await.unwrap(), "heos://player/get_volume?pid=1");
        correlator.resolve(volume_response(25));

        let response = request.await.unwrap().unwrap();
        assert_eq!(response.require("level").unwrap(), "25");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn same_kind_is_serialized_fifo() {
        let (correlator, transport, mut wire) = setup(DEFAULT_REQUEST_TIMEOUT);

        let mut handles = Vec::new();
        for _ in 0..3 {
            let c = correlator.clone();
            let t = transport.clone();
            handles.push(tokio::spawn(async move {
                c.submit(&get_volume(), t.as_ref()).await
            }));
            tokio::task::yield_now().await;
        }

        for level in [10, 20, 30] {
            wire.recv().await.unwrap();
            // Only one of the three is ever on the wire
            assert!(wire.try_recv().is_err());
            assert_eq!(correlator.pending_count(), 1);
            correlator.resolve(volume_response(level));
        }

        let mut levels = Vec::new();
        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            levels.push(response.require("level").unwrap().to_string());
        }
        assert_eq!(levels, ["10", "20", "30"]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_is_not_matched_to_next_request() {
        let (correlator, transport, mut wire) = setup(Duration::from_secs(5));

        let first = correlator.submit(&get_volume(), transport.as_ref()).await;
        assert!(matches!(first, Err(HeosError::Timeout { .. })));
        wire.recv().await.unwrap();

        let c = correlator.clone();
        let t = transport.clone();
        let second = tokio::spawn(async move { c.submit(&get_volume(), t.as_ref()).await });
        wire.recv().await.unwrap();

        // Answer to the first request shows up now and must be discarded
        correlator.resolve(volume_response(11));
        assert_eq!(correlator.pending_count(), 1);

        correlator.resolve(volume_response(22));
        let response = second.await.unwrap().unwrap();
        assert_eq!(response.require("level").unwrap(), "22");
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_does_not_poison_its_kind() {
        let (correlator, transport, mut wire) = setup(Duration::from_secs(5));

        // Device swallows the first request entirely
        let first = correlator.submit(&get_volume(), transport.as_ref()).await;
        assert!(matches!(first, Err(HeosError::Timeout { .. })));
        wire.recv().await.unwrap();

        let mut outcomes = Vec::new();
        for level in [20, 30, 40] {
            let c = correlator.clone();
            let t = transport.clone();
            let request = tokio::spawn(async move { c.submit(&get_volume(), t.as_ref()).await });
            wire.recv().await.unwrap();
            correlator.resolve(volume_response(level));
            outcomes.push(
                request
                    .await
                    .unwrap()
                    .map(|r| r.require("level").unwrap().to_string()),
            );
        }

        // The first prompt answer cannot be told apart from the missing one
        assert!(matches!(outcomes[0], Err(HeosError::Timeout { .. })));
        assert_eq!(outcomes[1].as_ref().unwrap(), "30");
        assert_eq!(outcomes[2].as_ref().unwrap(), "40");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn owed_response_lapses_after_twice_the_timeout() {
        let (correlator, transport, mut wire) = setup(Duration::from_secs(5));

        let first = correlator.submit(&get_volume(), transport.as_ref()).await;
        assert!(matches!(first, Err(HeosError::Timeout { .. })));
        wire.recv().await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;

        let c = correlator.clone();
        let t = transport.clone();
        let second = tokio::spawn(async move { c.submit(&get_volume(), t.as_ref()).await });
        wire.recv().await.unwrap();
        correlator.resolve(volume_response(33));

        let response = second.await.unwrap().unwrap();
        assert_eq!(response.require("level").unwrap(), "33");
    }

    #[tokio::test]
    async fn device_failure_becomes_command_error() {
        let (correlator, transport, mut wire) = setup(DEFAULT_REQUEST_TIMEOUT);

        let c = correlator.clone();
        let t = transport.clone();
        let request = tokio::spawn(async move { c.submit(&get_volume(), t.as_ref()).await });
        wire.recv().await.unwrap();

        let Message::Response(fail) = decode(
            r#"{"heos": {"command": "player/get_volume", "result": "fail", "message": "eid=2&text=ID Not Valid"}}"#,
        ) else {
            panic!("expected response");
        };
        correlator.resolve(fail);

        match request.await.unwrap() {
            Err(HeosError::Command { eid, .. }) => assert_eq!(eid, 2),
            other => panic!("expected command error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn under_process_keeps_waiting() {
        let (correlator, transport, mut wire) = setup(DEFAULT_REQUEST_TIMEOUT);

        let c = correlator.clone();
        let t = transport.clone();
        let request = tokio::spawn(async move {
            c.submit(&Command::new("player", "get_players"), t.as_ref()).await
        });
        wire.recv().await.unwrap();

        for line in [
            r#"{"heos": {"command": "player/get_players", "result": "success", "message": "command under process"}}"#,
            r#"{"heos": {"command": "player/get_players", "result": "success", "message": ""}, "payload": []}"#,
        ] {
            let Message::Response(r) = decode(line) else {
                panic!("expected response");
            };
            correlator.resolve(r);
        }

        let response = request.await.unwrap().unwrap();
        assert!(!response.is_under_process());
    }

    #[tokio::test]
    async fn fail_all_resolves_every_pending_request() {
        let (correlator, transport, mut wire) = setup(DEFAULT_REQUEST_TIMEOUT);

        let mut handles = Vec::new();
        for name in ["get_volume", "get_mute", "get_play_state"] {
            let c = correlator.clone();
            let t = transport.clone();
            handles.push(tokio::spawn(async move {
                c.submit(&Command::new("player", name).param("pid", 1), t.as_ref())
                    .await
            }));
        }
        for _ in 0..3 {
            wire.recv().await.unwrap();
        }
        assert_eq!(correlator.pending_count(), 3);

        correlator.fail_all(HeosError::Cancelled);

        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Err(HeosError::Cancelled)));
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn send_failure_leaves_nothing_pending() {
        let correlator = Correlator::new(DEFAULT_REQUEST_TIMEOUT);
        let result = correlator.submit(&get_volume(), &FailingTransport).await;
        assert!(matches!(result, Err(HeosError::NotConnected)));
        assert_eq!(correlator.pending_count(), 0);

        // Nothing reached the wire, so nothing is owed
        let (_, transport, mut wire) = setup(DEFAULT_REQUEST_TIMEOUT);
        let correlator = Arc::new(correlator);
        let c = correlator.clone();
        let request = tokio::spawn(async move { c.submit(&get_volume(), transport.as_ref()).await });
        wire.recv().await.unwrap();
        correlator.resolve(volume_response(5));
        assert!(request.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn unsolicited_response_is_dropped() {
        let correlator = Correlator::new(DEFAULT_REQUEST_TIMEOUT);
        correlator.resolve(volume_response(50));
        assert_eq!(correlator.pending_count(), 0);
    }
}

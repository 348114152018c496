//! Correlation of outgoing commands with their responses.
//!
//! Every request gets a fresh token and a waiter in the table. The dispatch
//! task resolves waiters by token; callers await a [`PendingResponse`] that
//! finishes exactly once with the response, `Timeout` or `Cancelled`.
//!
//! List requests use a streaming waiter instead: partial results and the
//! terminating Ack/Nak all arrive on the same token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::ipc::FrameSink;
use crate::protocol::{Command, Frame};

enum Waiter {
    Single(oneshot::Sender<Command>),
    Stream(mpsc::UnboundedSender<Command>),
}

struct Entry {
    generation: u64,
    waiter: Waiter,
}

struct Inner {
    next_token: u32,
    generation: u64,
    pending: HashMap<u32, Entry>,
}

impl Inner {
    /// Next token that is neither zero nor outstanding.
    fn allocate(&mut self) -> (u32, u64) {
        loop {
            let token = self.next_token;
            self.next_token = self.next_token.wrapping_add(1);
            if token != 0 && !self.pending.contains_key(&token) {
                self.generation += 1;
                return (token, self.generation);
            }
        }
    }
}

/// Outstanding requests keyed by token.
pub struct CorrelationTable {
    inner: Mutex<Inner>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_token: 1,
                generation: 0,
                pending: HashMap::new(),
            }),
        }
    }
}

impl CorrelationTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a waiter, then send the frame `build` makes for its token.
    ///
    /// If the send fails the waiter is removed again and the send error is
    /// returned, so no entry outlives a request that never left.
    pub fn issue<F>(
        self: &Arc<Self>,
        sink: &FrameSink,
        budget: Duration,
        build: F,
    ) -> Result<PendingResponse, ClientError>
    where
        F: FnOnce(u32) -> Frame,
    {
        let (tx, rx) = oneshot::channel();
        let (token, generation) = self.register(Waiter::Single(tx));

        if let Err(e) = sink.send(&build(token)) {
            self.expire_generation(token, generation);
            return Err(e);
        }

        Ok(PendingResponse {
            token,
            generation,
            budget,
            deadline: Instant::now() + budget,
            rx,
            table: Arc::downgrade(self),
            finished: false,
        })
    }

    /// Like [`issue`](Self::issue), but every command carrying the token is
    /// forwarded until an Ack or Nak ends the stream.
    pub fn issue_stream<F>(
        self: &Arc<Self>,
        sink: &FrameSink,
        build: F,
    ) -> Result<(u32, mpsc::UnboundedReceiver<Command>), ClientError>
    where
        F: FnOnce(u32) -> Frame,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (token, generation) = self.register(Waiter::Stream(tx));

        if let Err(e) = sink.send(&build(token)) {
            self.expire_generation(token, generation);
            return Err(e);
        }
        Ok((token, rx))
    }

    fn register(&self, waiter: Waiter) -> (u32, u64) {
        let mut inner = self.lock();
        let (token, generation) = inner.allocate();
        inner.pending.insert(token, Entry { generation, waiter });
        debug!(token, pending = inner.pending.len(), "Registered pending request");
        (token, generation)
    }

    /// Hand `command` to the waiter for `token`.
    ///
    /// Returns false, and does nothing else, if no such waiter exists.
    pub fn resolve(&self, token: u32, command: Command) -> bool {
        let mut inner = self.lock();

        let is_stream = match inner.pending.get(&token) {
            Some(entry) => matches!(entry.waiter, Waiter::Stream(_)),
            None => {
                debug!(token, command_id = %command.command_id, "No waiter for token");
                return false;
            }
        };

        if is_stream && !command.is_response() {
            if let Some(Entry {
                waiter: Waiter::Stream(tx),
                ..
            }) = inner.pending.get(&token)
            {
                let _ = tx.send(command);
            }
            return true;
        }

        match inner.pending.remove(&token).map(|entry| entry.waiter) {
            Some(Waiter::Single(tx)) => {
                let _ = tx.send(command);
            }
            Some(Waiter::Stream(tx)) => {
                let _ = tx.send(command);
            }
            None => {}
        }
        true
    }

    /// Drop the waiter for `token`; later responses for it are ignored.
    pub fn expire(&self, token: u32) -> bool {
        let removed = self.lock().pending.remove(&token).is_some();
        if removed {
            warn!(token, "Request expired without response");
        }
        removed
    }

    fn expire_generation(&self, token: u32, generation: u64) -> bool {
        let mut inner = self.lock();
        match inner.pending.get(&token) {
            Some(entry) if entry.generation == generation => {
                inner.pending.remove(&token);
                true
            }
            _ => false,
        }
    }

    /// Drop every waiter. Each one observes `Cancelled`.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Entry> = self.lock().pending.drain().map(|(_, e)| e).collect();
        let count = drained.len();
        if count > 0 {
            debug!(count, "Cancelled pending requests");
        }
        drop(drained);
        count
    }

    pub fn outstanding(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_pending(&self, token: u32) -> bool {
        self.lock().pending.contains_key(&token)
    }

    /// Jump the token counter; lets tests exercise wrap-around.
    #[cfg(test)]
    fn set_next_token(&self, token: u32) {
        self.lock().next_token = token;
    }
}

/// The caller's side of one outstanding request.
///
/// Dropping it before it finishes removes the waiter from the table.
pub struct PendingResponse {
    token: u32,
    generation: u64,
    budget: Duration,
    deadline: Instant,
    rx: oneshot::Receiver<Command>,
    table: Weak<CorrelationTable>,
    finished: bool,
}

impl PendingResponse {
    pub fn token(&self) -> u32 {
        self.token
    }

    /// Wait for the response, the deadline, or cancellation.
    pub async fn wait(mut self) -> Result<Command, ClientError> {
        let outcome = timeout_at(self.deadline, &mut self.rx).await;
        self.finished = true;
        match outcome {
            Ok(Ok(command)) => Ok(command),
            Ok(Err(_)) => Err(ClientError::Cancelled),
            Err(_) => {
                if let Some(table) = self.table.upgrade() {
                    if table.expire_generation(self.token, self.generation) {
                        warn!(token = self.token, "Request timed out");
                    }
                }
                // A response may have landed between the deadline and expiry.
                match self.rx.try_recv() {
                    Ok(command) => Ok(command),
                    Err(_) => Err(ClientError::Timeout(self.budget)),
                }
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(table) = self.table.upgrade() {
            table.expire_generation(self.token, self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Link;
    use crate::protocol::CommandId;
    use pretty_assertions::assert_eq;

    const BUDGET: Duration = Duration::from_millis(200);

    fn ping(token: u32) -> Frame {
        Frame::from(Command::new(CommandId::Ping).with_token(token))
    }

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let (link, mut peer) = Link::memory(8);
        let table = CorrelationTable::new();

        let pending = table.issue(&link.sink, BUDGET, ping).unwrap();
        let token = pending.token();
        let sent = peer.recv().await.unwrap();
        assert_eq!(sent, ping(token));

        assert!(table.resolve(token, Command::ack(token, CommandId::Ping)));
        assert!(!table.resolve(token, Command::ack(token, CommandId::Ping)));

        let response = pending.wait().await.unwrap();
        assert_eq!(response.acked_command(), Some(CommandId::Ping));
        assert_eq!(table.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_tokens_are_unique_while_outstanding() {
        let (link, _peer) = Link::memory(8);
        let table = CorrelationTable::new();

        let a = table.issue(&link.sink, BUDGET, ping).unwrap();
        let b = table.issue(&link.sink, BUDGET, ping).unwrap();
        assert_ne!(a.token(), b.token());
        assert_ne!(a.token(), 0);
    }

    #[tokio::test]
    async fn test_token_wrap_skips_zero_and_outstanding() {
        let (link, _peer) = Link::memory(8);
        let table = CorrelationTable::new();

        let first = table.issue(&link.sink, BUDGET, ping).unwrap();
        assert_eq!(first.token(), 1);

        table.set_next_token(u32::MAX);
        let last = table.issue(&link.sink, BUDGET, ping).unwrap();
        assert_eq!(last.token(), u32::MAX);

        // 0 is reserved and 1 is still outstanding.
        let wrapped = table.issue(&link.sink, BUDGET, ping).unwrap();
        assert_eq!(wrapped.token(), 2);
    }

    #[tokio::test]
    async fn test_timeout_expires_entry() {
        let (link, _peer) = Link::memory(8);
        let table = CorrelationTable::new();

        let pending = table
            .issue(&link.sink, Duration::from_millis(20), ping)
            .unwrap();
        let token = pending.token();

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
        assert!(!table.is_pending(token));

        // Late response is a no-op.
        assert!(!table.resolve(token, Command::ack(token, CommandId::Ping)));
    }

    #[tokio::test]
    async fn test_cancel_all_resolves_every_waiter_cancelled() {
        let (link, _peer) = Link::memory(16);
        let table = CorrelationTable::new();

        let waiters: Vec<_> = (0..5)
            .map(|_| table.issue(&link.sink, Duration::from_secs(5), ping).unwrap())
            .collect();

        assert_eq!(table.cancel_all(), 5);
        for pending in waiters {
            assert!(matches!(pending.wait().await, Err(ClientError::Cancelled)));
        }
        assert_eq!(table.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_failed_send_leaves_no_entry() {
        let (link, peer) = Link::memory(1);
        drop(peer);
        let table = CorrelationTable::new();

        let result = table.issue(&link.sink, BUDGET, ping);
        assert!(matches!(result, Err(ClientError::Transport(_))));
        assert_eq!(table.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_removed() {
        let (link, _peer) = Link::memory(8);
        let table = CorrelationTable::new();

        let pending = table.issue(&link.sink, BUDGET, ping).unwrap();
        assert_eq!(table.outstanding(), 1);
        drop(pending);
        assert_eq!(table.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_stream_waiter_forwards_partials_until_ack() {
        let (link, _peer) = Link::memory(8);
        let table = CorrelationTable::new();

        let (token, mut rx) = table
            .issue_stream(&link.sink, |t| {
                Frame::from(Command::new(CommandId::List).with_token(t))
            })
            .unwrap();

        let item = Command::new(CommandId::List)
            .with_token(token)
            .with_u(3)
            .with_s("MyVar");
        assert!(table.resolve(token, item.clone()));
        assert!(table.is_pending(token));

        assert!(table.resolve(token, Command::ack(token, CommandId::List)));
        assert!(!table.is_pending(token));

        assert_eq!(rx.recv().await, Some(item));
        assert!(rx.recv().await.unwrap().is_ack());
        assert_eq!(rx.recv().await, None);
    }
}

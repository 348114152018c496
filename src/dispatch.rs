//! Inbound frame routing.
//!
//! The dispatch task hands every raw frame body to [`Dispatcher::on_raw`].
//! Responses go to the correlation table, data frames to the subscription
//! registry and its handlers, and log records to log handlers. Nothing on this
//! path returns an error to a caller: bad frames are counted and dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::correlation::CorrelationTable;
use crate::ipc::FrameSink;
use crate::models::{ClientEvent, DataRequestRecord, ListResult, LogRecord, CLIENT_VERSION};
use crate::protocol::{Command, CommandId, Frame};
use crate::subscriptions::{Delivery, SubscriptionRegistry};

/// A registered callback.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Fan-out list of handlers for one event category.
pub struct EventHandlers<T> {
    handlers: RwLock<Vec<Handler<T>>>,
}

impl<T> Default for EventHandlers<T> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }
}

impl<T> EventHandlers<T> {
    pub fn add(&self, handler: Handler<T>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    /// Call every handler in registration order.
    ///
    /// Runs on a snapshot, so a handler may register more handlers.
    pub fn emit(&self, event: &T) {
        let handlers: Vec<Handler<T>> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All caller-registered handlers.
#[derive(Default)]
pub struct ClientHandlers {
    pub status: EventHandlers<ClientEvent>,
    pub log: EventHandlers<LogRecord>,
    pub data: EventHandlers<DataRequestRecord>,
    pub list: EventHandlers<ListResult>,
    pub command_result: EventHandlers<Command>,
}

/// Running counters for the dispatch path.
#[derive(Default)]
pub struct DispatchStats {
    frames: AtomicU64,
    responses_routed: AtomicU64,
    responses_unmatched: AtomicU64,
    data_delivered: AtomicU64,
    data_dropped: AtomicU64,
    logs: AtomicU64,
    unroutable: AtomicU64,
    malformed: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DispatchStatsSnapshot {
    pub frames: u64,
    pub responses_routed: u64,
    /// Ack/Nak whose token had no waiter (late or uncorrelated).
    pub responses_unmatched: u64,
    pub data_delivered: u64,
    /// Data for an id that is not (or no longer) subscribed.
    pub data_dropped: u64,
    pub logs: u64,
    pub unroutable: u64,
    pub malformed: u64,
}

impl DispatchStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            responses_routed: self.responses_routed.load(Ordering::Relaxed),
            responses_unmatched: self.responses_unmatched.load(Ordering::Relaxed),
            data_delivered: self.data_delivered.load(Ordering::Relaxed),
            data_dropped: self.data_dropped.load(Ordering::Relaxed),
            logs: self.logs.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// What the dispatch loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAction {
    Continue,
    /// Server ended the session on its own.
    ServerDisconnected,
}

/// Routes inbound frames for one session.
pub struct Dispatcher {
    correlation: Arc<CorrelationTable>,
    registry: Arc<SubscriptionRegistry>,
    handlers: Arc<ClientHandlers>,
    stats: Arc<DispatchStats>,
    sink: FrameSink,
}

impl Dispatcher {
    pub fn new(
        correlation: Arc<CorrelationTable>,
        registry: Arc<SubscriptionRegistry>,
        handlers: Arc<ClientHandlers>,
        stats: Arc<DispatchStats>,
        sink: FrameSink,
    ) -> Self {
        Self {
            correlation,
            registry,
            handlers,
            stats,
            sink,
        }
    }

    pub fn on_raw(&self, body: &str) -> DispatchAction {
        DispatchStats::bump(&self.stats.frames);
        match Frame::decode(body) {
            Ok(frame) => self.on_frame(frame),
            Err(e) => {
                DispatchStats::bump(&self.stats.malformed);
                warn!("Dropping malformed frame: {}", e);
                DispatchAction::Continue
            }
        }
    }

    pub fn on_frame(&self, frame: Frame) -> DispatchAction {
        trace!(kind = frame.kind(), "Dispatching frame");
        match frame {
            Frame::Command(command) => return self.on_command(command),
            Frame::Data { request_id, data } => self.on_data(request_id, &data),
            Frame::Log(record) => {
                DispatchStats::bump(&self.stats.logs);
                self.handlers.log.emit(&record);
            }
            Frame::DataRequest { token, request } => {
                DispatchStats::bump(&self.stats.unroutable);
                debug!(token, request_id = request.request_id, "Unexpected data_request frame from server");
            }
            Frame::KeyEvent { token, key_id, .. } => {
                DispatchStats::bump(&self.stats.unroutable);
                debug!(token, key_id, "Unexpected key_event frame from server");
            }
        }
        DispatchAction::Continue
    }

    fn on_command(&self, command: Command) -> DispatchAction {
        match command.command_id {
            CommandId::Ack | CommandId::Nak => self.on_response(command),
            CommandId::Ping => {
                let reply = Command::ack(command.token, CommandId::Ping)
                    .with_f(f64::from(CLIENT_VERSION.0));
                if let Err(e) = self.sink.send(&Frame::from(reply)) {
                    warn!("Failed to answer server ping: {}", e);
                }
            }
            CommandId::Disconnect => {
                debug!("Server sent Disconnect");
                return DispatchAction::ServerDisconnected;
            }
            CommandId::List if command.token != 0 => {
                if !self.correlation.resolve(command.token, command) {
                    DispatchStats::bump(&self.stats.unroutable);
                }
            }
            other => {
                DispatchStats::bump(&self.stats.unroutable);
                debug!(command_id = %other, token = command.token, "Unroutable command from server");
            }
        }
        DispatchAction::Continue
    }

    fn on_response(&self, command: Command) {
        if command.is_nak() {
            warn!(
                command = ?command.acked_command(),
                token = command.token,
                "Server rejected command: {}",
                command.s_data
            );
        }

        let routed = command.token != 0 && self.correlation.resolve(command.token, command.clone());
        if routed {
            DispatchStats::bump(&self.stats.responses_routed);
        } else {
            DispatchStats::bump(&self.stats.responses_unmatched);
            debug!(token = command.token, "Response without a waiter");
        }

        self.handlers.command_result.emit(&command);
    }

    fn on_data(&self, request_id: u32, data: &[u8]) {
        let handlers = &self.handlers;
        match self
            .registry
            .deliver(request_id, data, |record| handlers.data.emit(record))
        {
            Ok(Delivery::Delivered) => DispatchStats::bump(&self.stats.data_delivered),
            Ok(Delivery::Dropped) => {
                DispatchStats::bump(&self.stats.data_dropped);
                debug!(request_id, "Data for unknown or removed request");
            }
            Err(e) => {
                DispatchStats::bump(&self.stats.malformed);
                warn!(request_id, "Dropping undecodable data: {}", e);
            }
        }
    }
}

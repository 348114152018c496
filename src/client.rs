//! The client facade.
//!
//! `SimClient` owns the link to the host, the server session layered on it,
//! the correlation table, the subscription registry and the handler lists.
//! Inbound frames are processed on a spawned dispatch task; request methods
//! await only their own response, so subscriptions and other requests keep
//! flowing while a caller waits.
//!
//! # Example
//!
//! ```ignore
//! use simcommander::{ClientConfig, SimClient};
//!
//! let client = SimClient::new(ClientConfig::from_env()?);
//! client.connect_host().await?;
//! let version = client.connect_server().await?;
//! let rpm = client.get_local_variable("ENGINE_RPM", "").await?;
//! client.disconnect_host().await?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ServerLogLevel};
use crate::correlation::{CorrelationTable, PendingResponse};
use crate::dispatch::{ClientHandlers, DispatchAction, DispatchStats, DispatchStatsSnapshot, Dispatcher};
use crate::error::ClientError;
use crate::ipc::{Connector, FrameSink, Link, LinkTasks, SocketConnector};
use crate::models::{
    is_settable_variable_type, CalcResultType, ClientEvent, ClientEventType, ClientStatus,
    ConnectionState, DataRequest, DataRequestRecord, DataValue, ListOutcome, ListResult,
    LogFacility, LogLevel, LookupItemType, RegisteredEvent, VariableRequest, VariableValue, Version,
    CLIENT_VERSION,
};
use crate::protocol::{Command, CommandId, Frame, KEY_EVENT_VALUES, MAX_COMMAND_STRING};
use crate::subscriptions::SubscriptionRegistry;

type Result<T> = std::result::Result<T, ClientError>;

/// Which connection layer a frame needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layer {
    Host,
    Server,
}

/// Connection state plus the sink of the current link.
///
/// Requests are issued while holding this lock, and disconnect cascades
/// cancel pending requests under it, so a request is either cancelled by a
/// disconnect or refused with `NotConnected`.
struct State {
    status: ClientStatus,
    sink: Option<FrameSink>,
    link_id: u64,
}

struct TrackedEvent {
    event: RegisteredEvent,
    sent_to_server: bool,
}

/// State shared with the dispatch task and list collectors.
struct Shared {
    state: Mutex<State>,
    correlation: Arc<CorrelationTable>,
    registry: Arc<SubscriptionRegistry>,
    handlers: Arc<ClientHandlers>,
    stats: Arc<DispatchStats>,
    server_version: AtomicU32,
    disposed: AtomicBool,
    requests_paused: AtomicBool,
    server_log_level: Mutex<Option<ServerLogLevel>>,
    events: Mutex<BTreeMap<u32, TrackedEvent>>,
    key_cache: Mutex<HashMap<String, u32>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn status(&self) -> ClientStatus {
        self.state().status
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn check_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            Err(ClientError::Disposed)
        } else {
            Ok(())
        }
    }

    fn emit(&self, event_type: ClientEventType, status: ClientStatus, message: impl Into<String>) {
        let event = ClientEvent {
            event_type,
            status,
            message: message.into(),
        };
        info!(event = ?event.event_type, host = %status.host, server = %status.server, "{}", event.message);
        self.handlers.status.emit(&event);
    }

    fn set_host(&self, host: ConnectionState, event_type: ClientEventType, message: impl Into<String>) {
        let status = {
            let mut state = self.state();
            state.status.host = host;
            state.status
        };
        self.emit(event_type, status, message);
    }

    fn set_server(&self, server: ConnectionState, event_type: ClientEventType, message: impl Into<String>) {
        let status = {
            let mut state = self.state();
            state.status.server = server;
            state.status
        };
        self.emit(event_type, status, message);
    }

    fn layer_sink(state: &State, layer: Layer) -> Result<&FrameSink> {
        let ready = match layer {
            Layer::Host => state.status.host_connected(),
            Layer::Server => state.status.host_connected() && state.status.server_connected(),
        };
        match (&state.sink, ready) {
            (Some(sink), true) => Ok(sink),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Register a waiter and send, or fail with `NotConnected`.
    fn issue<F>(&self, layer: Layer, budget: Duration, build: F) -> Result<PendingResponse>
    where
        F: FnOnce(u32) -> Frame,
    {
        let state = self.state();
        let sink = Self::layer_sink(&state, layer)?;
        self.correlation.issue(sink, budget, build)
    }

    fn issue_stream<F>(&self, build: F) -> Result<(u32, mpsc::UnboundedReceiver<Command>)>
    where
        F: FnOnce(u32) -> Frame,
    {
        let state = self.state();
        let sink = Self::layer_sink(&state, Layer::Server)?;
        self.correlation.issue_stream(sink, build)
    }

    /// Fire-and-forget send.
    fn send(&self, layer: Layer, frame: &Frame) -> Result<()> {
        let state = self.state();
        Self::layer_sink(&state, layer)?.send(frame)
    }

    /// Install a new link sink and mark the host connected.
    fn attach_link(&self, sink: FrameSink) -> (u64, ClientStatus) {
        let mut state = self.state();
        state.link_id += 1;
        state.sink = Some(sink);
        state.status.host = ConnectionState::ConnectedHost;
        (state.link_id, state.status)
    }

    /// End the server session: cancel every pending request and drop every
    /// subscription. With `notify`, tell the server first.
    fn end_server_session(&self, notify: bool, message: &str) {
        let (was_active, status, cancelled) = {
            let mut state = self.state();
            let was_active = state.status.server != ConnectionState::Disconnected;
            if notify && state.status.server == ConnectionState::ConnectedServer {
                if let Some(sink) = &state.sink {
                    if let Err(e) = sink.send(&Frame::from(Command::new(CommandId::Disconnect))) {
                        debug!("Could not notify server of disconnect: {}", e);
                    }
                }
            }
            state.status.server = ConnectionState::Disconnected;
            self.server_version.store(0, Ordering::SeqCst);
            let cancelled = self.correlation.cancel_all();
            (was_active, state.status, cancelled)
        };

        // Outside the state lock: removal waits for any in-progress data
        // delivery, whose handlers may read the status.
        let removed = self.registry.remove_all();
        if was_active {
            debug!(cancelled, removed, "Server session ended");
            self.emit(ClientEventType::ServerDisconnected, status, message);
        }
    }

    /// Drop the host link. `link_id` restricts this to a specific link so a
    /// stale dispatch task cannot tear down its replacement.
    fn end_host_link(&self, link_id: Option<u64>, message: &str) -> bool {
        {
            let state = self.state();
            if link_id.is_some_and(|id| id != state.link_id) {
                return false;
            }
        }
        self.end_server_session(false, message);

        let (was_connected, status) = {
            let mut state = self.state();
            if link_id.is_some_and(|id| id != state.link_id) {
                return false;
            }
            let was_connected = state.status.host != ConnectionState::Disconnected;
            state.sink = None;
            state.link_id += 1;
            state.status.host = ConnectionState::Disconnected;
            self.correlation.cancel_all();
            (was_connected, state.status)
        };
        if was_connected {
            self.emit(ClientEventType::HostDisconnected, status, message);
        }
        was_connected
    }
}

/// Dispatch task and link resources of the current host connection.
struct Session {
    shutdown: Option<oneshot::Sender<()>>,
    dispatch: JoinHandle<()>,
    _tasks: LinkTasks,
}

impl Session {
    fn close(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    fn abort(self) {
        self.dispatch.abort();
    }
}

async fn run_dispatch(
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    mut inbound: mpsc::Receiver<String>,
    mut shutdown: oneshot::Receiver<()>,
    link_id: u64,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                debug!(link_id, "Dispatch task stopped");
                return;
            }
            body = inbound.recv() => match body {
                Some(body) => {
                    if dispatcher.on_raw(&body) == DispatchAction::ServerDisconnected {
                        shared.end_server_session(false, "Server ended the session");
                    }
                }
                None => {
                    warn!(link_id, "Host link closed");
                    shared.end_host_link(Some(link_id), "Host link closed");
                    return;
                }
            }
        }
    }
}

async fn collect_list(
    handlers: Arc<ClientHandlers>,
    correlation: Arc<CorrelationTable>,
    kind: LookupItemType,
    token: u32,
    mut rx: mpsc::UnboundedReceiver<Command>,
    budget: Duration,
) {
    let mut items = Vec::new();
    let outcome = loop {
        // Each partial result restarts the deadline.
        match timeout(budget, rx.recv()).await {
            Ok(Some(command)) if command.is_ack() => break ListOutcome::Complete,
            Ok(Some(command)) if command.is_nak() => break ListOutcome::Rejected(command.s_data),
            Ok(Some(command)) => items.push((command.u_data as i32, command.s_data)),
            Ok(None) => break ListOutcome::Cancelled,
            Err(_) => {
                correlation.expire(token);
                break ListOutcome::TimedOut;
            }
        }
    };
    debug!(kind = kind.as_str(), count = items.len(), outcome = ?outcome, "List finished");
    handlers.list.emit(&ListResult {
        kind,
        outcome,
        items,
    });
}

/// Client for the simulator automation server.
pub struct SimClient {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl SimClient {
    /// Client that connects over the configured socket endpoint.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(SocketConnector))
    }

    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                status: ClientStatus::default(),
                sink: None,
                link_id: 0,
            }),
            correlation: CorrelationTable::new(),
            registry: Arc::new(SubscriptionRegistry::new()),
            handlers: Arc::new(ClientHandlers::default()),
            stats: Arc::new(DispatchStats::default()),
            server_version: AtomicU32::new(0),
            disposed: AtomicBool::new(false),
            requests_paused: AtomicBool::new(false),
            server_log_level: Mutex::new(config.server_log_level),
            events: Mutex::new(BTreeMap::new()),
            key_cache: Mutex::new(HashMap::new()),
        });
        Self {
            config,
            connector,
            shared,
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn status(&self) -> ClientStatus {
        self.shared.status()
    }

    pub fn host_state(&self) -> ConnectionState {
        self.status().host
    }

    pub fn server_state(&self) -> ConnectionState {
        self.status().server
    }

    /// True when the server session is up.
    pub fn is_connected(&self) -> bool {
        self.status().server_connected()
    }

    /// Version reported by the server at connect; `Version::NONE` otherwise.
    pub fn server_version(&self) -> Version {
        Version(self.shared.server_version.load(Ordering::SeqCst))
    }

    pub fn client_version(&self) -> Version {
        CLIENT_VERSION
    }

    pub fn dispatch_stats(&self) -> DispatchStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    pub fn on_status_changed<F>(&self, handler: F)
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.shared.handlers.status.add(Arc::new(handler));
    }

    pub fn on_log_record<F>(&self, handler: F)
    where
        F: Fn(&crate::models::LogRecord) + Send + Sync + 'static,
    {
        self.shared.handlers.log.add(Arc::new(handler));
    }

    /// Called on the dispatch task for every delivered subscription value.
    /// Must not block; hand slow work off to another task.
    pub fn on_data_received<F>(&self, handler: F)
    where
        F: Fn(&DataRequestRecord) + Send + Sync + 'static,
    {
        self.shared.handlers.data.add(Arc::new(handler));
    }

    pub fn on_list_result<F>(&self, handler: F)
    where
        F: Fn(&ListResult) + Send + Sync + 'static,
    {
        self.shared.handlers.list.add(Arc::new(handler));
    }

    /// Called for every Ack/Nak from the server, after correlation.
    pub fn on_command_result<F>(&self, handler: F)
    where
        F: Fn(&Command) + Send + Sync + 'static,
    {
        self.shared.handlers.command_result.add(Arc::new(handler));
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Open the host link. A no-op when already connected.
    pub async fn connect_host(&self) -> Result<()> {
        self.shared.check_disposed()?;
        let mut session = self.session.lock().await;
        self.connect_host_locked(&mut session, self.config.connect_timeout())
            .await
    }

    async fn connect_host_locked(&self, session: &mut Option<Session>, budget: Duration) -> Result<()> {
        if self.shared.status().host_connected() {
            return Ok(());
        }

        self.shared.set_host(
            ConnectionState::ConnectingHost,
            ClientEventType::HostConnecting,
            format!("Connecting to {}", self.config.endpoint),
        );

        let mut config = self.config.clone();
        config.connect_timeout_ms = budget.as_millis() as u64;
        let link = match self.connector.connect(&config).await {
            Ok(link) => link,
            Err(e) => {
                self.shared.set_host(
                    ConnectionState::Failed,
                    ClientEventType::HostFailed,
                    format!("Host connection failed: {}", e),
                );
                return Err(e);
            }
        };

        let Link {
            sink,
            inbound,
            tasks,
        } = link;
        let (link_id, status) = self.shared.attach_link(sink.clone());

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.shared.correlation),
            Arc::clone(&self.shared.registry),
            Arc::clone(&self.shared.handlers),
            Arc::clone(&self.shared.stats),
            sink,
        );
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let dispatch = tokio::spawn(run_dispatch(
            Arc::clone(&self.shared),
            dispatcher,
            inbound,
            shutdown_rx,
            link_id,
        ));

        if let Some(old) = session.replace(Session {
            shutdown: Some(shutdown_tx),
            dispatch,
            _tasks: tasks,
        }) {
            old.close();
        }

        self.shared.emit(
            ClientEventType::HostConnected,
            status,
            format!("Connected to {}", self.config.endpoint),
        );
        Ok(())
    }

    /// Start a server session on the open host link.
    ///
    /// Returns the server's version. Fails with `NotConnected` without a
    /// host link and `VersionMismatch` when the major versions differ.
    pub async fn connect_server(&self) -> Result<Version> {
        self.shared.check_disposed()?;
        let _session = self.session.lock().await;

        let status = self.shared.status();
        if status.server_connected() {
            return Ok(self.server_version());
        }
        if !status.host_connected() {
            return Err(ClientError::NotConnected);
        }

        self.shared.set_server(
            ConnectionState::ConnectingServer,
            ClientEventType::ServerConnecting,
            "Connecting to server",
        );

        let connect = Command::new(CommandId::Connect)
            .with_u(self.config.client_id)
            .with_s(self.config.client_name.clone());
        let response = match self.handshake(connect).await {
            Ok(response) => response,
            Err(e) => return Err(self.server_connect_failed(e)),
        };

        let version = Version(response.f_data as u32);
        if !CLIENT_VERSION.is_compatible_with(version) {
            if let Err(e) = self
                .shared
                .send(Layer::Host, &Frame::from(Command::new(CommandId::Disconnect)))
            {
                debug!("Could not notify server of version mismatch: {}", e);
            }
            return Err(self.server_connect_failed(ClientError::VersionMismatch {
                client: CLIENT_VERSION,
                server: version,
            }));
        }

        self.shared.server_version.store(version.0, Ordering::SeqCst);
        self.shared.set_server(
            ConnectionState::ConnectedServer,
            ClientEventType::ServerConnected,
            format!("Connected to server v{}", version),
        );
        self.restore_server_state();
        Ok(version)
    }

    async fn handshake(&self, connect: Command) -> Result<Command> {
        connect.check_string()?;
        let pending = self
            .shared
            .issue(Layer::Host, self.config.connect_timeout(), |token| {
                Frame::from(connect.with_token(token))
            })?;
        let response = pending.wait().await?;
        if response.is_nak() {
            return Err(ClientError::ServerRejected {
                command: CommandId::Connect,
                reason: response.s_data,
            });
        }
        Ok(response)
    }

    fn server_connect_failed(&self, error: ClientError) -> ClientError {
        self.shared.correlation.cancel_all();
        self.shared.set_server(
            ConnectionState::Failed,
            ClientEventType::ServerFailed,
            format!("Server connection failed: {}", error),
        );
        error
    }

    /// Push log level, pause state and calculator events to a fresh session.
    fn restore_server_state(&self) {
        let level = *lock(&self.shared.server_log_level);
        if let Some(level) = level {
            if let Err(e) = self.shared.send(Layer::Server, &Frame::from(log_level_command(level))) {
                warn!("Failed to push server log level: {}", e);
            }
        }

        let paused = self.shared.requests_paused.load(Ordering::SeqCst);
        if let Err(e) = self.shared.send(Layer::Server, &Frame::from(subscribe_command(paused))) {
            warn!("Failed to push data request pause state: {}", e);
        }

        let mut events = lock(&self.shared.events);
        // Removals queued while offline are moot on a new session.
        events.retain(|_, tracked| !tracked.event.code.is_empty());
        for tracked in events.values_mut() {
            let frame = Frame::from(
                Command::new(CommandId::Register)
                    .with_u(tracked.event.event_id)
                    .with_s(tracked.event.registration_string(true)),
            );
            match self.shared.send(Layer::Server, &frame) {
                Ok(()) => tracked.sent_to_server = true,
                Err(e) => warn!(event_id = tracked.event.event_id, "Failed to re-register event: {}", e),
            }
        }
    }

    /// Liveness check. Returns the server version, or `Version::NONE` if
    /// nothing answered within the ping timeout. Never fails.
    ///
    /// Opens the host link first if needed, within the same time budget.
    pub async fn ping_server(&self) -> Version {
        if self.shared.is_disposed() {
            return Version::NONE;
        }
        let budget = self.config.ping_timeout();
        let deadline = Instant::now() + budget;

        if !self.shared.status().host_connected() {
            let Ok(mut session) = timeout_at(deadline, self.session.lock()).await else {
                return Version::NONE;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            let connect_budget = remaining.min(self.config.connect_timeout());
            if let Err(e) = self.connect_host_locked(&mut session, connect_budget).await {
                debug!("Ping could not reach host: {}", e);
                return Version::NONE;
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Version::NONE;
        }
        let pending = match self.shared.issue(Layer::Host, remaining, |token| {
            Frame::from(Command::new(CommandId::Ping).with_token(token))
        }) {
            Ok(pending) => pending,
            Err(e) => {
                debug!("Ping not sent: {}", e);
                return Version::NONE;
            }
        };

        match pending.wait().await {
            Ok(response) if response.is_ack() => {
                let version = Version(response.f_data as u32);
                info!("Server responded to ping, version {}", version);
                version
            }
            Ok(response) => {
                warn!("Server refused ping: {}", response.s_data);
                Version::NONE
            }
            Err(e) => {
                warn!("Server did not respond to ping: {}", e);
                Version::NONE
            }
        }
    }

    /// End the server session. Pending requests resolve with `Cancelled`
    /// and all subscriptions are dropped. Safe to call when not connected.
    pub async fn disconnect_server(&self) -> Result<()> {
        self.shared.check_disposed()?;
        let _session = self.session.lock().await;
        self.shared.end_server_session(true, "Disconnected by client");
        Ok(())
    }

    /// Close the host link, ending the server session first.
    pub async fn disconnect_host(&self) -> Result<()> {
        self.shared.check_disposed()?;
        let mut session = self.session.lock().await;
        self.close_locked(&mut session);
        Ok(())
    }

    fn close_locked(&self, session: &mut Option<Session>) {
        self.shared.end_server_session(true, "Disconnected by client");
        self.shared.end_host_link(None, "Disconnected by client");
        if let Some(session) = session.take() {
            session.close();
        }
    }

    /// Disconnect everything and make the client unusable. Later calls
    /// fail with `Disposed`.
    pub async fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut session = self.session.lock().await;
        self.close_locked(&mut session);
        self.shared.registry.remove_all();
        self.shared.correlation.cancel_all();
        lock(&self.shared.events).clear();
        lock(&self.shared.key_cache).clear();
        info!("Client disposed");
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn request(&self, command: Command) -> Result<Command> {
        self.shared.check_disposed()?;
        command.check_string()?;
        let pending = self
            .shared
            .issue(Layer::Server, self.config.request_timeout(), |token| {
                Frame::from(command.with_token(token))
            })?;
        pending.wait().await
    }

    /// Like `request`, but a Nak becomes `ServerRejected`.
    async fn request_ack(&self, command: Command) -> Result<Command> {
        let command_id = command.command_id;
        let response = self.request(command).await?;
        if response.is_nak() {
            return Err(ClientError::ServerRejected {
                command: command_id,
                reason: response.s_data,
            });
        }
        Ok(response)
    }

    /// Send a command without waiting for a response.
    pub async fn send_command(&self, command: Command) -> Result<()> {
        self.shared.check_disposed()?;
        command.check_string()?;
        self.shared
            .send(Layer::Server, &Frame::from(command.with_token(0)))
    }

    /// Send a command and return the server's Ack or Nak as-is.
    pub async fn send_command_with_response(&self, command: Command) -> Result<Command> {
        self.request(command).await
    }

    // =========================================================================
    // Variables and calculator code
    // =========================================================================

    /// Read a variable. String variables carry their text in the result.
    pub async fn get_variable(&self, variable: &VariableRequest) -> Result<VariableValue> {
        self.get_variable_with_default(variable, 0.0).await
    }

    async fn get_variable_with_default(
        &self,
        variable: &VariableRequest,
        default: f64,
    ) -> Result<VariableValue> {
        let name = variable.command_string(false)?;
        let command_id = if variable.creates() {
            CommandId::GetCreate
        } else {
            CommandId::Get
        };
        let response = self
            .request_ack(
                Command::new(command_id)
                    .with_u(variable.variable_type as u32)
                    .with_f(default)
                    .with_s(name),
            )
            .await?;
        Ok(VariableValue::from_parts(response.f_data, response.s_data))
    }

    pub async fn get_local_variable(&self, name: &str, unit: &str) -> Result<f64> {
        self.get_variable(&VariableRequest::local(name).with_unit(unit))
            .await
            .map(|value| value.number)
    }

    /// Read a local variable, creating it with `default` if missing.
    pub async fn get_or_create_local_variable(&self, name: &str, default: f64, unit: &str) -> Result<f64> {
        self.get_variable_with_default(&VariableRequest::local_or_create(name).with_unit(unit), default)
            .await
            .map(|value| value.number)
    }

    pub async fn set_variable(&self, variable: &VariableRequest, value: f64) -> Result<()> {
        if !is_settable_variable_type(variable.variable_type) {
            return Err(ClientError::InvalidArgument(format!(
                "variable type '{}' is not settable",
                variable.variable_type
            )));
        }
        let name = variable.command_string(true)?;
        let command_id = if variable.creates() {
            CommandId::SetCreate
        } else {
            CommandId::Set
        };
        self.request_ack(
            Command::new(command_id)
                .with_u(variable.variable_type as u32)
                .with_f(value)
                .with_s(name),
        )
        .await?;
        Ok(())
    }

    pub async fn set_local_variable(&self, name: &str, value: f64, unit: &str) -> Result<()> {
        self.set_variable(&VariableRequest::local(name).with_unit(unit), value)
            .await
    }

    /// Set a local variable, creating it first if needed.
    pub async fn set_or_create_local_variable(&self, name: &str, value: f64, unit: &str) -> Result<()> {
        self.set_variable(&VariableRequest::local_or_create(name).with_unit(unit), value)
            .await
    }

    /// Run calculator code. The result is decoded per `result_type`;
    /// `CalcResultType::None` yields `None`.
    pub async fn execute_calculator_code(
        &self,
        code: &str,
        result_type: CalcResultType,
    ) -> Result<Option<DataValue>> {
        let response = self
            .request_ack(
                Command::new(CommandId::Exec)
                    .with_u(result_type.as_u32())
                    .with_s(code),
            )
            .await?;
        Ok(match result_type {
            CalcResultType::None => None,
            CalcResultType::Double => Some(DataValue::Float64(response.f_data)),
            CalcResultType::Integer => Some(DataValue::Int32(response.f_data as i32)),
            CalcResultType::String | CalcResultType::Formatted => {
                Some(DataValue::String(response.s_data))
            }
        })
    }

    // =========================================================================
    // Lookup and list
    // =========================================================================

    /// Resolve a name to its id. `Ok(None)` means the server does not know it.
    pub async fn lookup(&self, kind: LookupItemType, name: &str) -> Result<Option<i32>> {
        let response = self
            .request(
                Command::new(CommandId::Lookup)
                    .with_u(kind.as_u32())
                    .with_s(name),
            )
            .await?;
        if response.is_nak() {
            debug!(kind = kind.as_str(), name, "Lookup found nothing: {}", response.s_data);
            return Ok(None);
        }
        Ok(Some(response.f_data as i32))
    }

    /// Request a listing. Returns once the request is sent; the items arrive
    /// as one `ListResult` on the `on_list_result` handlers.
    pub async fn list(&self, kind: LookupItemType) -> Result<()> {
        self.shared.check_disposed()?;
        if !kind.is_listable() {
            return Err(ClientError::InvalidArgument(format!(
                "cannot list items of type {}",
                kind.as_str()
            )));
        }

        let (token, rx) = self.shared.issue_stream(|token| {
            Frame::from(
                Command::new(CommandId::List)
                    .with_token(token)
                    .with_u(kind.as_u32()),
            )
        })?;
        debug!(kind = kind.as_str(), token, "List requested");

        tokio::spawn(collect_list(
            Arc::clone(&self.shared.handlers),
            Arc::clone(&self.shared.correlation),
            kind,
            token,
            rx,
            self.config.request_timeout(),
        ));
        Ok(())
    }

    // =========================================================================
    // Data requests
    // =========================================================================

    /// Register a subscription locally and with the server. Returns when the
    /// server acknowledges the registration; values arrive separately.
    pub async fn save_data_request(&self, request: DataRequest) -> Result<()> {
        let request_id = request.request_id;
        let pending = self.issue_data_request(request)?;
        confirm_data_request(&self.shared, request_id, pending.wait().await)
    }

    /// Like [`save_data_request`](Self::save_data_request) but returns once
    /// the registration is sent. The server's Ack or Nak reaches
    /// `on_command_result` under the returned token; a Nak or timeout also
    /// drops the local record.
    pub fn save_data_request_async(&self, request: DataRequest) -> Result<u32> {
        let request_id = request.request_id;
        let pending = self.issue_data_request(request)?;
        let token = pending.token();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Err(e) = confirm_data_request(&shared, request_id, pending.wait().await) {
                warn!(request_id, "Data request not registered: {}", e);
            }
        });
        Ok(token)
    }

    fn issue_data_request(&self, request: DataRequest) -> Result<PendingResponse> {
        self.shared.check_disposed()?;
        request.validate()?;
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let request_id = request.request_id;
        self.shared.registry.register(request.clone())?;
        self.shared
            .issue(Layer::Server, self.config.request_timeout(), |token| {
                Frame::DataRequest { token, request }
            })
            .inspect_err(|_| {
                self.shared.registry.remove(request_id);
            })
    }

    /// Ask the server to deliver the current value of a subscription now.
    pub async fn update_data_request(&self, request_id: u32) -> Result<()> {
        self.shared.check_disposed()?;
        if !self.shared.registry.contains(request_id) {
            return Err(ClientError::NotFound(format!("data request {}", request_id)));
        }
        self.request_ack(Command::new(CommandId::Update).with_u(request_id))
            .await?;
        Ok(())
    }

    /// Remove a subscription. Local removal is immediate: no handler call for
    /// this id starts after this returns, whatever the server does.
    pub async fn remove_data_request(&self, request_id: u32) -> Result<()> {
        self.shared.check_disposed()?;
        if self.shared.registry.remove(request_id).is_none() {
            return Err(ClientError::NotFound(format!("data request {}", request_id)));
        }

        let pending = self
            .shared
            .issue(Layer::Server, self.config.request_timeout(), |token| {
                Frame::DataRequest {
                    token,
                    request: DataRequest::removal(request_id),
                }
            });
        let result = match pending {
            Ok(pending) => pending.wait().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(response) if response.is_nak() => {
                warn!(request_id, "Server refused removal: {}", response.s_data)
            }
            Ok(_) => debug!(request_id, "Data request removed"),
            Err(e) => warn!(request_id, "Server did not confirm removal: {}", e),
        }
        Ok(())
    }

    pub fn data_request(&self, request_id: u32) -> Option<DataRequestRecord> {
        self.shared.registry.get(request_id)
    }

    pub fn data_requests(&self) -> Vec<DataRequestRecord> {
        self.shared.registry.snapshot()
    }

    pub fn data_request_ids(&self) -> Vec<u32> {
        self.shared.registry.ids()
    }

    /// Pause or resume value delivery for all subscriptions. Remembered and
    /// re-applied on the next server connect.
    pub async fn set_data_requests_paused(&self, paused: bool) -> Result<()> {
        self.shared.check_disposed()?;
        if self.is_connected() {
            self.request_ack(subscribe_command(paused)).await?;
        }
        self.shared.requests_paused.store(paused, Ordering::SeqCst);
        Ok(())
    }

    // =========================================================================
    // Calculator events
    // =========================================================================

    /// Register calculator code under an event id. Queued while offline.
    /// Empty code removes the event.
    pub async fn register_event(&self, event: RegisteredEvent) -> Result<()> {
        self.shared.check_disposed()?;
        if event.code.is_empty() {
            return self.remove_event(event.event_id).await;
        }
        let registration = event.registration_string(true);
        if registration.len() > MAX_COMMAND_STRING {
            return Err(ClientError::InvalidArgument(format!(
                "event registration is {} bytes, maximum is {}",
                registration.len(),
                MAX_COMMAND_STRING
            )));
        }

        let include_name = {
            let mut events = lock(&self.shared.events);
            match events.get_mut(&event.event_id) {
                Some(tracked) => {
                    if !event.name.is_empty() && tracked.event.name != event.name {
                        return Err(ClientError::InvalidArgument(format!(
                            "cannot rename event {} after registration",
                            event.event_id
                        )));
                    }
                    if tracked.event.code == event.code {
                        debug!(event_id = event.event_id, "Event code unchanged");
                        return Ok(());
                    }
                    tracked.event.code = event.code.clone();
                    !tracked.sent_to_server
                }
                None => {
                    events.insert(
                        event.event_id,
                        TrackedEvent {
                            event: event.clone(),
                            sent_to_server: false,
                        },
                    );
                    true
                }
            }
        };

        if !self.is_connected() {
            debug!(event_id = event.event_id, "Event queued for next server connection");
            return Ok(());
        }

        self.request_ack(
            Command::new(CommandId::Register)
                .with_u(event.event_id)
                .with_s(event.registration_string(include_name)),
        )
        .await?;
        if let Some(tracked) = lock(&self.shared.events).get_mut(&event.event_id) {
            tracked.sent_to_server = true;
        }
        Ok(())
    }

    pub async fn remove_event(&self, event_id: u32) -> Result<()> {
        self.shared.check_disposed()?;
        let sent = {
            let mut events = lock(&self.shared.events);
            let Some(tracked) = events.get_mut(&event_id) else {
                return Err(ClientError::NotFound(format!("event {}", event_id)));
            };
            if !tracked.sent_to_server {
                events.remove(&event_id);
                return Ok(());
            }
            tracked.event.code.clear();
            true
        };

        if sent && self.is_connected() {
            self.request_ack(Command::new(CommandId::Register).with_u(event_id))
                .await?;
            lock(&self.shared.events).remove(&event_id);
        } else {
            debug!(event_id, "Event removal queued for next server connection");
        }
        Ok(())
    }

    /// Trigger a registered event.
    pub async fn transmit_event(&self, event_id: u32) -> Result<()> {
        self.shared.check_disposed()?;
        let known = lock(&self.shared.events)
            .get(&event_id)
            .is_some_and(|tracked| !tracked.event.code.is_empty());
        if !known {
            return Err(ClientError::NotFound(format!("event {}", event_id)));
        }
        self.request_ack(Command::new(CommandId::Transmit).with_u(event_id))
            .await?;
        Ok(())
    }

    /// The registered event with this id, if it has code.
    pub fn registered_event(&self, event_id: u32) -> Option<RegisteredEvent> {
        lock(&self.shared.events)
            .get(&event_id)
            .filter(|tracked| !tracked.event.code.is_empty())
            .map(|tracked| tracked.event.clone())
    }

    /// Registered events, ordered by id.
    pub fn registered_events(&self) -> Vec<RegisteredEvent> {
        lock(&self.shared.events)
            .values()
            .filter(|tracked| !tracked.event.code.is_empty())
            .map(|tracked| tracked.event.clone())
            .collect()
    }

    // =========================================================================
    // Key events and logging
    // =========================================================================

    /// Send a key event with up to [`KEY_EVENT_VALUES`] parameters. Missing
    /// parameters are sent as 0.
    pub async fn send_key_event(&self, key_id: u32, values: &[u32]) -> Result<()> {
        self.shared.check_disposed()?;
        if values.len() > KEY_EVENT_VALUES {
            return Err(ClientError::InvalidArgument(format!(
                "key event takes at most {} values, got {}",
                KEY_EVENT_VALUES,
                values.len()
            )));
        }
        let mut padded = [0u32; KEY_EVENT_VALUES];
        padded[..values.len()].copy_from_slice(values);

        let response = self
            .shared
            .issue(Layer::Server, self.config.request_timeout(), |token| {
                Frame::KeyEvent {
                    token,
                    key_id,
                    values: padded,
                }
            })?
            .wait()
            .await?;
        if response.is_nak() {
            return Err(ClientError::ServerRejected {
                command: CommandId::SendKey,
                reason: response.s_data,
            });
        }
        Ok(())
    }

    /// Send a key event by name. Resolved ids are cached per client.
    pub async fn send_key_event_by_name(&self, name: &str, values: &[u32]) -> Result<()> {
        let cached = lock(&self.shared.key_cache).get(name).copied();
        let key_id = match cached {
            Some(id) => id,
            None => {
                let id = self
                    .lookup(LookupItemType::KeyEventId, name)
                    .await?
                    .ok_or_else(|| ClientError::NotFound(format!("key event {}", name)))?;
                let id = id as u32;
                lock(&self.shared.key_cache).insert(name.to_string(), id);
                id
            }
        };
        self.send_key_event(key_id, values).await
    }

    /// Set the server's log level for the given facility. Remembered and
    /// re-applied on the next server connect.
    pub async fn set_server_log_level(&self, level: LogLevel, facility: LogFacility) -> Result<()> {
        self.shared.check_disposed()?;
        let setting = ServerLogLevel { level, facility };
        if self.is_connected() {
            self.request_ack(log_level_command(setting)).await?;
        }
        *lock(&self.shared.server_log_level) = Some(setting);
        Ok(())
    }
}

impl Drop for SimClient {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.abort();
        }
    }
}

/// Settle a data request registration. Anything but an Ack drops the
/// local record.
fn confirm_data_request(shared: &Shared, request_id: u32, result: Result<Command>) -> Result<()> {
    match result {
        Ok(response) if response.is_ack() => {
            debug!(request_id, "Data request registered");
            Ok(())
        }
        Ok(response) => {
            shared.registry.remove(request_id);
            Err(ClientError::ServerRejected {
                command: CommandId::Subscribe,
                reason: response.s_data,
            })
        }
        Err(e) => {
            shared.registry.remove(request_id);
            Err(e)
        }
    }
}

/// Subscribe with `u_data` 0 pauses delivery, 1 resumes it.
fn subscribe_command(paused: bool) -> Command {
    Command::new(CommandId::Subscribe).with_u(u32::from(!paused))
}

fn log_level_command(setting: ServerLogLevel) -> Command {
    Command::new(CommandId::Log)
        .with_u(setting.level as u32)
        .with_f(f64::from(setting.facility.bits()))
}

//! Data models for the simulator automation client.
//!
//! These types describe what flows between the caller, the client and the
//! server: connection state, subscription definitions and their decoded
//! values, log records, list results and calculator events. They use serde so
//! they can be carried verbatim inside wire frames.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::protocol::{MAX_COMMAND_STRING, MAX_REQUEST_STRING, MAX_UNIT_STRING};

// =============================================================================
// Versions
// =============================================================================

/// Byte-packed version number: `major << 24 | minor << 16 | patch << 8 | build`.
///
/// Zero is reserved for "no response" (see `SimClient::ping_server`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u32);

impl Version {
    /// The "server did not answer" sentinel.
    pub const NONE: Version = Version(0);

    pub const fn new(major: u8, minor: u8, patch: u8, build: u8) -> Self {
        Version((major as u32) << 24 | (minor as u32) << 16 | (patch as u32) << 8 | build as u32)
    }

    pub fn major(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn minor(&self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn patch(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn build(&self) -> u8 {
        self.0 as u8
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// Versions are compatible when their major byte matches.
    pub fn is_compatible_with(&self, other: Version) -> bool {
        self.major() == other.major()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major(),
            self.minor(),
            self.patch(),
            self.build()
        )
    }
}

const fn parse_version_part(s: &str) -> u8 {
    let bytes = s.as_bytes();
    let mut value: u32 = 0;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b < b'0' || b > b'9' {
            break;
        }
        value = value * 10 + (b - b'0') as u32;
        i += 1;
    }
    if value > 255 {
        255
    } else {
        value as u8
    }
}

/// Version of this client, derived from the crate version.
pub const CLIENT_VERSION: Version = Version::new(
    parse_version_part(env!("CARGO_PKG_VERSION_MAJOR")),
    parse_version_part(env!("CARGO_PKG_VERSION_MINOR")),
    parse_version_part(env!("CARGO_PKG_VERSION_PATCH")),
    0,
);

// =============================================================================
// Connection state
// =============================================================================

/// State of one connection layer (host link or server session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    ConnectingHost,
    ConnectedHost,
    ConnectingServer,
    ConnectedServer,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::ConnectingHost => "ConnectingHost",
            ConnectionState::ConnectedHost => "ConnectedHost",
            ConnectionState::ConnectingServer => "ConnectingServer",
            ConnectionState::ConnectedServer => "ConnectedServer",
            ConnectionState::Failed => "Failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of both connection layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientStatus {
    pub host: ConnectionState,
    pub server: ConnectionState,
}

impl ClientStatus {
    pub fn host_connected(&self) -> bool {
        self.host == ConnectionState::ConnectedHost
    }

    pub fn server_connected(&self) -> bool {
        self.server == ConnectionState::ConnectedServer
    }
}

/// What happened in a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientEventType {
    HostConnecting,
    HostConnected,
    HostDisconnected,
    HostFailed,
    ServerConnecting,
    ServerConnected,
    ServerDisconnected,
    ServerFailed,
}

/// Status change delivered to `on_status_changed` handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
    pub event_type: ClientEventType,
    pub status: ClientStatus,
    pub message: String,
}

// =============================================================================
// Logging
// =============================================================================

/// Log severity, shared with the server's logging command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    #[default]
    None,
    Critical,
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::None => "None",
            LogLevel::Critical => "Critical",
            LogLevel::Error => "Error",
            LogLevel::Warning => "Warning",
            LogLevel::Info => "Info",
            LogLevel::Debug => "Debug",
            LogLevel::Trace => "Trace",
        }
    }
}

/// Logging destination flags on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFacility {
    #[default]
    Remote,
    Console,
    File,
    All,
}

impl LogFacility {
    /// Bit value used in the `Log` command's `f_data`.
    pub fn bits(&self) -> u8 {
        match self {
            LogFacility::Console => 0x01,
            LogFacility::File => 0x02,
            LogFacility::Remote => 0x04,
            LogFacility::All => 0x07,
        }
    }
}

/// Which side produced a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Client,
    #[default]
    Server,
}

/// A log record pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    #[serde(default)]
    pub facility: LogFacility,
    #[serde(default)]
    pub source: LogSource,
    pub message: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            facility: LogFacility::Remote,
            source: LogSource::Server,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Lookup and list
// =============================================================================

/// Kinds of items that can be looked up or listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupItemType {
    #[default]
    None,
    LocalVariable,
    SimulatorVariable,
    TokenVariable,
    UnitType,
    KeyEventId,
    DataRequest,
    RegisteredEvent,
}

impl LookupItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupItemType::None => "None",
            LookupItemType::LocalVariable => "LocalVariable",
            LookupItemType::SimulatorVariable => "SimulatorVariable",
            LookupItemType::TokenVariable => "TokenVariable",
            LookupItemType::UnitType => "UnitType",
            LookupItemType::KeyEventId => "KeyEventId",
            LookupItemType::DataRequest => "DataRequest",
            LookupItemType::RegisteredEvent => "RegisteredEvent",
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Only these kinds can be listed; the rest support lookup only.
    pub fn is_listable(&self) -> bool {
        matches!(
            self,
            LookupItemType::LocalVariable
                | LookupItemType::DataRequest
                | LookupItemType::RegisteredEvent
        )
    }
}

/// How a list request finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListOutcome {
    /// Server sent the terminating acknowledgement.
    Complete,
    /// Server refused the listing.
    Rejected(String),
    /// No terminating marker arrived in time; `items` may be partial.
    TimedOut,
    /// Session went away while the list was in flight.
    Cancelled,
}

/// Result of one `list()` request, delivered once to `on_list_result` handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct ListResult {
    pub kind: LookupItemType,
    pub outcome: ListOutcome,
    /// Ordered `(id, name)` entries as received.
    pub items: Vec<(i32, String)>,
}

impl ListResult {
    pub fn is_complete(&self) -> bool {
        self.outcome == ListOutcome::Complete
    }
}

// =============================================================================
// Calculator and subscription types
// =============================================================================

/// Expected result type of calculator code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalcResultType {
    #[default]
    None,
    Double,
    Integer,
    String,
    Formatted,
}

impl CalcResultType {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Named variable, calculator code, or a removal marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    #[default]
    None,
    Named,
    Calculated,
}

/// How often the server re-evaluates a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePeriod {
    /// Only on an explicit `update_data_request`.
    Never,
    /// Once after registration, then only on explicit update.
    Once,
    /// Every server tick (`TICK_PERIOD_MS`).
    #[default]
    PerFrame,
    PerSecond,
    /// Every `interval` milliseconds.
    Millisecond,
}

impl UpdatePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdatePeriod::Never => "Never",
            UpdatePeriod::Once => "Once",
            UpdatePeriod::PerFrame => "PerFrame",
            UpdatePeriod::PerSecond => "PerSecond",
            UpdatePeriod::Millisecond => "Millisecond",
        }
    }
}

/// Declared storage type of a subscription value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    String { size: u32 },
    Bytes { size: u32 },
}

impl ValueType {
    pub fn byte_size(&self) -> usize {
        match self {
            ValueType::Int8 => 1,
            ValueType::Int16 => 2,
            ValueType::Int32 | ValueType::Float32 => 4,
            ValueType::Int64 | ValueType::Float64 => 8,
            ValueType::String { size } | ValueType::Bytes { size } => *size as usize,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, ValueType::String { .. } | ValueType::Bytes { .. })
    }
}

/// A decoded subscription value.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
}

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

impl DataValue {
    /// Decode little-endian value bytes according to the declared type.
    ///
    /// Extra trailing bytes are ignored; too few is a protocol error.
    pub fn decode(value_type: ValueType, bytes: &[u8]) -> Result<Self, ClientError> {
        let size = value_type.byte_size();
        if bytes.len() < size {
            return Err(ClientError::Protocol(format!(
                "value needs {} bytes, got {}",
                size,
                bytes.len()
            )));
        }

        let value = match value_type {
            ValueType::Int8 => DataValue::Int8(i8::from_le_bytes(fixed(bytes))),
            ValueType::Int16 => DataValue::Int16(i16::from_le_bytes(fixed(bytes))),
            ValueType::Int32 => DataValue::Int32(i32::from_le_bytes(fixed(bytes))),
            ValueType::Int64 => DataValue::Int64(i64::from_le_bytes(fixed(bytes))),
            ValueType::Float32 => DataValue::Float32(f32::from_le_bytes(fixed(bytes))),
            ValueType::Float64 => DataValue::Float64(f64::from_le_bytes(fixed(bytes))),
            ValueType::String { .. } => {
                let raw = &bytes[..size];
                let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
                DataValue::String(String::from_utf8_lossy(&raw[..end]).into_owned())
            }
            ValueType::Bytes { .. } => DataValue::Bytes(bytes[..size].to_vec()),
        };
        Ok(value)
    }

    /// Encode to little-endian bytes (the inverse of `decode`).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            DataValue::Int8(v) => v.to_le_bytes().to_vec(),
            DataValue::Int16(v) => v.to_le_bytes().to_vec(),
            DataValue::Int32(v) => v.to_le_bytes().to_vec(),
            DataValue::Int64(v) => v.to_le_bytes().to_vec(),
            DataValue::Float32(v) => v.to_le_bytes().to_vec(),
            DataValue::Float64(v) => v.to_le_bytes().to_vec(),
            DataValue::String(s) => s.as_bytes().to_vec(),
            DataValue::Bytes(b) => b.clone(),
        }
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataValue::Int8(v) => Some(*v as f64),
            DataValue::Int16(v) => Some(*v as f64),
            DataValue::Int32(v) => Some(*v as f64),
            DataValue::Int64(v) => Some(*v as f64),
            DataValue::Float32(v) => Some(*v as f64),
            DataValue::Float64(v) => Some(*v),
            DataValue::String(_) | DataValue::Bytes(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Int8(v) => write!(f, "{}", v),
            DataValue::Int16(v) => write!(f, "{}", v),
            DataValue::Int32(v) => write!(f, "{}", v),
            DataValue::Int64(v) => write!(f, "{}", v),
            DataValue::Float32(v) => write!(f, "{}", v),
            DataValue::Float64(v) => write!(f, "{}", v),
            DataValue::String(s) => f.write_str(s),
            DataValue::Bytes(b) => write!(f, "{:02x?}", b),
        }
    }
}

// =============================================================================
// Data requests
// =============================================================================

fn default_variable_type() -> char {
    'L'
}

/// Definition of a data subscription, as registered with the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    /// Caller-assigned unique id.
    pub request_id: u32,
    pub request_type: RequestType,
    /// Variable name, or full calculator code.
    pub name_or_code: String,
    #[serde(default)]
    pub unit_name: String,
    /// Variable type prefix for named requests ('L', 'A', 'T').
    #[serde(default = "default_variable_type")]
    pub variable_type: char,
    #[serde(default)]
    pub sim_var_index: u8,
    #[serde(default)]
    pub result_type: CalcResultType,
    pub value_type: ValueType,
    #[serde(default)]
    pub period: UpdatePeriod,
    /// Period multiplier; milliseconds for `UpdatePeriod::Millisecond`.
    #[serde(default)]
    pub interval: u32,
    /// Minimum numeric change before the server sends an update.
    /// Negative disables the comparison entirely.
    #[serde(default)]
    pub delta_epsilon: f32,
}

impl DataRequest {
    /// Subscribe to the result of calculator code.
    pub fn calculated(
        request_id: u32,
        result_type: CalcResultType,
        code: impl Into<String>,
        value_type: ValueType,
    ) -> Self {
        Self {
            request_id,
            request_type: RequestType::Calculated,
            name_or_code: code.into(),
            unit_name: String::new(),
            variable_type: 'Q',
            sim_var_index: 0,
            result_type,
            value_type,
            period: UpdatePeriod::PerFrame,
            interval: 0,
            delta_epsilon: 0.0,
        }
    }

    /// Subscribe to a named variable of the given type prefix.
    pub fn named(
        request_id: u32,
        variable_type: char,
        name: impl Into<String>,
        value_type: ValueType,
    ) -> Self {
        Self {
            request_id,
            request_type: RequestType::Named,
            name_or_code: name.into(),
            unit_name: String::new(),
            variable_type,
            sim_var_index: 0,
            result_type: CalcResultType::None,
            value_type,
            period: UpdatePeriod::PerFrame,
            interval: 0,
            delta_epsilon: 0.0,
        }
    }

    /// Subscribe to a simulator variable ('A') with unit and index.
    pub fn sim_var(
        request_id: u32,
        name: impl Into<String>,
        unit_name: impl Into<String>,
        sim_var_index: u8,
        value_type: ValueType,
    ) -> Self {
        let mut request = Self::named(request_id, 'A', name, value_type);
        request.unit_name = unit_name.into();
        request.sim_var_index = sim_var_index;
        request
    }

    /// Marker telling the server to drop a request.
    pub fn removal(request_id: u32) -> Self {
        Self {
            request_id,
            request_type: RequestType::None,
            name_or_code: String::new(),
            unit_name: String::new(),
            variable_type: 'L',
            sim_var_index: 0,
            result_type: CalcResultType::None,
            value_type: ValueType::Bytes { size: 0 },
            period: UpdatePeriod::Never,
            interval: 0,
            delta_epsilon: 0.0,
        }
    }

    pub fn with_period(mut self, period: UpdatePeriod, interval: u32) -> Self {
        self.period = period;
        self.interval = interval;
        self
    }

    pub fn with_delta_epsilon(mut self, delta_epsilon: f32) -> Self {
        self.delta_epsilon = delta_epsilon;
        self
    }

    /// Check the definition before it is registered anywhere.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.request_type == RequestType::None {
            return Err(ClientError::InvalidArgument(format!(
                "data request {} has no request type",
                self.request_id
            )));
        }
        if self.name_or_code.is_empty() {
            return Err(ClientError::InvalidArgument(format!(
                "data request {}: name or code cannot be empty",
                self.request_id
            )));
        }
        if self.name_or_code.len() > MAX_REQUEST_STRING {
            return Err(ClientError::InvalidArgument(format!(
                "data request {}: name or code is {} bytes, maximum is {}",
                self.request_id,
                self.name_or_code.len(),
                MAX_REQUEST_STRING
            )));
        }
        if self.unit_name.len() > MAX_UNIT_STRING {
            return Err(ClientError::InvalidArgument(format!(
                "data request {}: unit name is {} bytes, maximum is {}",
                self.request_id,
                self.unit_name.len(),
                MAX_UNIT_STRING
            )));
        }
        if self.value_type.byte_size() == 0 {
            return Err(ClientError::InvalidArgument(format!(
                "data request {}: value size cannot be zero",
                self.request_id
            )));
        }
        if self.period == UpdatePeriod::Millisecond && self.interval == 0 {
            return Err(ClientError::InvalidArgument(format!(
                "data request {}: millisecond period needs an interval",
                self.request_id
            )));
        }
        Ok(())
    }
}

impl fmt::Display for DataRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DataRequest{{{}; {:?}; period: {}; interval: {}; deltaE: {}; {:?}}}",
            self.request_id,
            self.request_type,
            self.period.as_str(),
            self.interval,
            self.delta_epsilon,
            self.name_or_code
        )
    }
}

/// A registered subscription plus the last value delivered for it.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRequestRecord {
    pub request: DataRequest,
    pub last_update: Option<DateTime<Utc>>,
    pub value: Option<DataValue>,
}

impl DataRequestRecord {
    pub fn new(request: DataRequest) -> Self {
        Self {
            request,
            last_update: None,
            value: None,
        }
    }

    pub fn request_id(&self) -> u32 {
        self.request.request_id
    }
}

// =============================================================================
// Variables
// =============================================================================

/// Variable types that accept a numeric id instead of a name.
pub fn is_indexed_variable_type(variable_type: char) -> bool {
    matches!(variable_type, 'A' | 'L' | 'T')
}

/// Variable types that accept a unit specifier.
pub fn is_unit_variable_type(variable_type: char) -> bool {
    matches!(variable_type, 'A' | 'C' | 'E' | 'L' | 'P')
}

/// Variable types that can be written.
pub fn is_settable_variable_type(variable_type: char) -> bool {
    matches!(variable_type, 'A' | 'C' | 'H' | 'K' | 'L' | 'Z')
}

/// Which variable to get or set, by name or numeric id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableRequest {
    pub variable_type: char,
    pub name: String,
    pub unit_name: String,
    /// Overrides `name` for indexed variable types.
    pub variable_id: Option<i32>,
    /// Overrides `unit_name` for indexed variable types.
    pub unit_id: Option<i32>,
    pub sim_var_index: u8,
    /// Create a local ('L') variable if it does not exist yet.
    pub create_local: bool,
}

impl VariableRequest {
    pub fn new(variable_type: char, name: impl Into<String>) -> Self {
        Self {
            variable_type,
            name: name.into(),
            unit_name: String::new(),
            variable_id: None,
            unit_id: None,
            sim_var_index: 0,
            create_local: false,
        }
    }

    pub fn local(name: impl Into<String>) -> Self {
        Self::new('L', name)
    }

    pub fn local_or_create(name: impl Into<String>) -> Self {
        let mut request = Self::local(name);
        request.create_local = true;
        request
    }

    pub fn sim_var(name: impl Into<String>, unit_name: impl Into<String>, index: u8) -> Self {
        let mut request = Self::new('A', name);
        request.unit_name = unit_name.into();
        request.sim_var_index = index;
        request
    }

    pub fn by_id(variable_type: char, variable_id: i32) -> Self {
        let mut request = Self::new(variable_type, String::new());
        request.variable_id = Some(variable_id);
        request
    }

    pub fn with_unit(mut self, unit_name: impl Into<String>) -> Self {
        self.unit_name = unit_name.into();
        self
    }

    /// Whether this request will use the create-if-missing command variant.
    pub fn creates(&self) -> bool {
        self.create_local && self.variable_type == 'L'
    }

    /// Build the `name[:index][,unit]` string sent in the command.
    ///
    /// Only local variables can be set by numeric id.
    pub fn command_string(&self, for_set: bool) -> Result<String, ClientError> {
        let indexed = if for_set {
            self.variable_type == 'L'
        } else {
            is_indexed_variable_type(self.variable_type)
        };

        let mut value = match self.variable_id {
            Some(id) if indexed && id > -1 => id.to_string(),
            Some(_) if !indexed && self.name.is_empty() => {
                return Err(ClientError::InvalidArgument(format!(
                    "variable type '{}' cannot be referenced by id",
                    self.variable_type
                )))
            }
            _ => self.name.clone(),
        };
        if value.is_empty() {
            return Err(ClientError::InvalidArgument(
                "variable name cannot be empty".to_string(),
            ));
        }

        if self.variable_type == 'A' && self.sim_var_index > 0 {
            value.push_str(&format!(":{}", self.sim_var_index));
        }
        if is_unit_variable_type(self.variable_type) {
            match self.unit_id {
                Some(id) if indexed && id > -1 => value.push_str(&format!(",{}", id)),
                _ if !self.unit_name.is_empty() => {
                    value.push(',');
                    value.push_str(&self.unit_name);
                }
                _ => {}
            }
        }

        if value.len() > MAX_COMMAND_STRING {
            return Err(ClientError::InvalidArgument(format!(
                "variable string is {} bytes, maximum is {}",
                value.len(),
                MAX_COMMAND_STRING
            )));
        }
        Ok(value)
    }
}

/// Value returned by a variable read.
///
/// Every read carries a number. String-typed variables (e.g. `A:ATC ID`)
/// also carry their text, in which case the number is usually zero.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VariableValue {
    pub number: f64,
    pub text: Option<String>,
}

impl VariableValue {
    /// Build from a response's numeric and string payloads. An empty string
    /// means the variable has no text value.
    pub fn from_parts(number: f64, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            number,
            text: (!text.is_empty()).then_some(text),
        }
    }

    pub fn as_f64(&self) -> f64 {
        self.number
    }

    pub fn as_str(&self) -> Option<&str> {
        self.text.as_deref()
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => f.write_str(text),
            None => write!(f, "{}", self.number),
        }
    }
}

// =============================================================================
// Calculator events
// =============================================================================

/// Reusable calculator code stored on the server under an event id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredEvent {
    pub event_id: u32,
    pub code: String,
    /// Optional custom name; cannot change after the first registration.
    #[serde(default)]
    pub name: String,
}

impl RegisteredEvent {
    pub fn new(event_id: u32, code: impl Into<String>) -> Self {
        Self {
            event_id,
            code: code.into(),
            name: String::new(),
        }
    }

    pub fn named(event_id: u32, code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            event_id,
            code: code.into(),
            name: name.into(),
        }
    }

    /// The registration string: `name$code` when a name is being sent.
    pub fn registration_string(&self, include_name: bool) -> String {
        if include_name && !self.name.is_empty() {
            format!("{}${}", self.name, self.code)
        } else {
            self.code.clone()
        }
    }
}

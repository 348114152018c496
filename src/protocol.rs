//! Wire vocabulary shared by client and server.
//!
//! Each frame body is one JSON object, internally tagged by `kind`:
//!
//! ```json
//! {"kind":"command","token":7,"command_id":"get","u_data":76,"f_data":0.0,"s_data":"MyVar"}
//! {"kind":"data_request","token":8,"request":{...}}
//! {"kind":"data","request_id":1,"data":[0,0,0,0,0,192,162,64]}
//! {"kind":"log","level":"info","message":"...","timestamp":1700000000000}
//! {"kind":"key_event","token":9,"key_id":66240,"values":[1,0,0,0,0]}
//! ```
//!
//! Responses to commands are `Ack`/`Nak` commands that echo the request
//! token and carry the original command id in `u_data`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::models::{DataRequest, LogRecord};

/// Maximum length of a command's string payload, in bytes.
pub const MAX_COMMAND_STRING: usize = 526;

/// Maximum length of a data request's name or calculator code.
pub const MAX_REQUEST_STRING: usize = 1029;

/// Maximum length of a unit name.
pub const MAX_UNIT_STRING: usize = 36;

/// Number of value slots carried by a key event.
pub const KEY_EVENT_VALUES: usize = 5;

/// Server tick period; the fastest a `PerFrame` subscription can update.
pub const TICK_PERIOD_MS: u64 = 25;

/// Command identifiers understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandId {
    #[default]
    None = 0,
    Ack,
    Nak,
    Ping,
    Connect,
    Disconnect,
    List,
    Lookup,
    Get,
    GetCreate,
    Set,
    SetCreate,
    Exec,
    Register,
    Transmit,
    Subscribe,
    Update,
    SendKey,
    Log,
}

impl CommandId {
    const ALL: [CommandId; 19] = [
        CommandId::None,
        CommandId::Ack,
        CommandId::Nak,
        CommandId::Ping,
        CommandId::Connect,
        CommandId::Disconnect,
        CommandId::List,
        CommandId::Lookup,
        CommandId::Get,
        CommandId::GetCreate,
        CommandId::Set,
        CommandId::SetCreate,
        CommandId::Exec,
        CommandId::Register,
        CommandId::Transmit,
        CommandId::Subscribe,
        CommandId::Update,
        CommandId::SendKey,
        CommandId::Log,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandId::None => "None",
            CommandId::Ack => "Ack",
            CommandId::Nak => "Nak",
            CommandId::Ping => "Ping",
            CommandId::Connect => "Connect",
            CommandId::Disconnect => "Disconnect",
            CommandId::List => "List",
            CommandId::Lookup => "Lookup",
            CommandId::Get => "Get",
            CommandId::GetCreate => "GetCreate",
            CommandId::Set => "Set",
            CommandId::SetCreate => "SetCreate",
            CommandId::Exec => "Exec",
            CommandId::Register => "Register",
            CommandId::Transmit => "Transmit",
            CommandId::Subscribe => "Subscribe",
            CommandId::Update => "Update",
            CommandId::SendKey => "SendKey",
            CommandId::Log => "Log",
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command or command response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Command {
    /// Correlation token; 0 for uncorrelated commands.
    #[serde(default)]
    pub token: u32,
    pub command_id: CommandId,
    #[serde(default)]
    pub u_data: u32,
    #[serde(default)]
    pub f_data: f64,
    #[serde(default)]
    pub s_data: String,
}

impl Command {
    pub fn new(command_id: CommandId) -> Self {
        Self {
            command_id,
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: u32) -> Self {
        self.token = token;
        self
    }

    pub fn with_u(mut self, u_data: u32) -> Self {
        self.u_data = u_data;
        self
    }

    pub fn with_f(mut self, f_data: f64) -> Self {
        self.f_data = f_data;
        self
    }

    pub fn with_s(mut self, s_data: impl Into<String>) -> Self {
        self.s_data = s_data.into();
        self
    }

    /// Positive response to `command`, echoing its token.
    pub fn ack(token: u32, command: CommandId) -> Self {
        Self::new(CommandId::Ack)
            .with_token(token)
            .with_u(command.as_u32())
    }

    /// Negative response to `command` with a reason.
    pub fn nak(token: u32, command: CommandId, reason: impl Into<String>) -> Self {
        Self::new(CommandId::Nak)
            .with_token(token)
            .with_u(command.as_u32())
            .with_s(reason)
    }

    pub fn is_ack(&self) -> bool {
        self.command_id == CommandId::Ack
    }

    pub fn is_nak(&self) -> bool {
        self.command_id == CommandId::Nak
    }

    pub fn is_response(&self) -> bool {
        self.is_ack() || self.is_nak()
    }

    /// For Ack/Nak, the command being answered.
    pub fn acked_command(&self) -> Option<CommandId> {
        if self.is_response() {
            CommandId::from_u32(self.u_data)
        } else {
            None
        }
    }

    /// Reject string payloads the server cannot hold.
    pub fn check_string(&self) -> Result<(), ClientError> {
        if self.s_data.len() > MAX_COMMAND_STRING {
            return Err(ClientError::InvalidArgument(format!(
                "{} string is {} bytes, maximum is {}",
                self.command_id,
                self.s_data.len(),
                MAX_COMMAND_STRING
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Command{{{}; token: {}; uData: {}; fData: {}; sData: {:?}}}",
            self.command_id, self.token, self.u_data, self.f_data, self.s_data
        )
    }
}

/// One message on the link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Command or response, either direction.
    Command(Command),
    /// Register, replace or remove a data subscription on the server.
    DataRequest { token: u32, request: DataRequest },
    /// Subscription value pushed by the server.
    Data { request_id: u32, data: Vec<u8> },
    /// Log record pushed by the server.
    Log(LogRecord),
    /// Key event with its value slots, answered by `Ack`/`Nak` of `SendKey`.
    KeyEvent {
        token: u32,
        key_id: u32,
        values: [u32; KEY_EVENT_VALUES],
    },
}

impl Frame {
    pub fn encode(&self) -> Result<String, ClientError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(body: &str) -> Result<Self, ClientError> {
        Ok(serde_json::from_str(body)?)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Command(_) => "command",
            Frame::DataRequest { .. } => "data_request",
            Frame::Data { .. } => "data",
            Frame::Log(_) => "log",
            Frame::KeyEvent { .. } => "key_event",
        }
    }
}

impl From<Command> for Frame {
    fn from(command: Command) -> Self {
        Frame::Command(command)
    }
}

use serde::de::IgnoredAny;
use std::fmt;

use crate::ipc::ProtocolError;

/// Control command sent from the supervisor to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Command {
    None = 0,
    Start = 1,
    Pause = 2,
    Resume = 3,
    Stop = 4,
}

impl Command {
    pub const fn tag(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for Command {
    type Error = ProtocolError;

    fn try_from(tag: i32) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Command::None),
            1 => Ok(Command::Start),
            2 => Ok(Command::Pause),
            3 => Ok(Command::Resume),
            4 => Ok(Command::Stop),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::None => "none",
            Command::Start => "start",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Stop => "stop",
        };
        f.write_str(name)
    }
}

/// Serialized job handed to the engine. The schema belongs to the engine;
/// this type only guarantees the text is well-formed JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescription(String);

impl JobDescription {
    pub fn from_value(value: &serde_json::Value) -> Self {
        Self(value.to_string())
    }

    pub fn from_json(text: impl Into<String>) -> Result<Self, serde_json::Error> {
        let text = text.into();
        serde_json::from_str::<IgnoredAny>(&text)?;
        Ok(Self(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for JobDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

use std::{fmt, str::FromStr};

use crate::error::Error;

/// The six channels hub and conversation driver talk over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    SamplingRequest,
    SamplingResult,
    ElicitationRequest,
    ElicitationResult,
    ToolCallResult,
    Progress,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Self::SamplingRequest,
        Self::SamplingResult,
        Self::ElicitationRequest,
        Self::ElicitationResult,
        Self::ToolCallResult,
        Self::Progress,
    ];

    /// What the hub listens to.
    pub const HUB_INBOUND: [Channel; 2] = [Self::SamplingResult, Self::ElicitationResult];

    /// What a conversation driver listens to.
    pub const DRIVER_INBOUND: [Channel; 4] = [
        Self::SamplingRequest,
        Self::ElicitationRequest,
        Self::ToolCallResult,
        Self::Progress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SamplingRequest => "mcp:sampling:request",
            Self::SamplingResult => "mcp:sampling:result",
            Self::ElicitationRequest => "mcp:elicitation:request",
            Self::ElicitationResult => "mcp:elicitation:result",
            Self::ToolCallResult => "mcp:toolcall:result",
            Self::Progress => "mcp:progress",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|channel| channel.as_str() == s)
            .ok_or_else(|| Error::UnknownChannel(s.to_string()))
    }
}

//! Bus payloads and their `{ id, data }` envelope.
//!
//! Every payload is an MCP object with the originating `toolCallId` merged
//! in; `id` is the hub session the traffic belongs to.

use {
    mcphub_mcp::types::{
        CreateMessageParams, CreateMessageResult, ElicitParams, ElicitResult, Progress,
        ToolsCallResult,
    },
    serde::{Deserialize, Serialize, de::DeserializeOwned},
    serde_json::Value,
};

use crate::{
    channel::Channel,
    error::{Error, Result},
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope<T> {
    pub id: String,
    pub data: T,
}

/// An MCP payload tagged with the tool call it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WithToolCall<T> {
    pub tool_call_id: String,
    #[serde(flatten)]
    pub inner: T,
}

impl<T> WithToolCall<T> {
    pub fn new(tool_call_id: impl Into<String>, inner: T) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            inner,
        }
    }
}

pub type SamplingRequest = WithToolCall<CreateMessageParams>;
pub type SamplingResult = WithToolCall<CreateMessageResult>;
pub type ElicitationRequest = WithToolCall<ElicitParams>;
pub type ElicitationResult = WithToolCall<ElicitResult>;
pub type ToolCallResultEvent = WithToolCall<ToolsCallResult>;
pub type ProgressEvent = WithToolCall<Progress>;

/// A payload together with the channel it travels on.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    SamplingRequest(SamplingRequest),
    SamplingResult(SamplingResult),
    ElicitationRequest(ElicitationRequest),
    ElicitationResult(ElicitationResult),
    ToolCallResult(ToolCallResultEvent),
    Progress(ProgressEvent),
}

/// A decoded message and the session it was addressed to.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub session_id: String,
    pub message: BusMessage,
}

fn payload<T: DeserializeOwned>(channel: Channel, data: Value) -> Result<WithToolCall<T>> {
    let payload: WithToolCall<T> =
        serde_json::from_value(data).map_err(|e| Error::malformed(channel, e.to_string()))?;
    if payload.tool_call_id.is_empty() {
        return Err(Error::malformed(channel, "toolCallId is empty"));
    }
    Ok(payload)
}

impl BusMessage {
    pub fn channel(&self) -> Channel {
        match self {
            Self::SamplingRequest(_) => Channel::SamplingRequest,
            Self::SamplingResult(_) => Channel::SamplingResult,
            Self::ElicitationRequest(_) => Channel::ElicitationRequest,
            Self::ElicitationResult(_) => Channel::ElicitationResult,
            Self::ToolCallResult(_) => Channel::ToolCallResult,
            Self::Progress(_) => Channel::Progress,
        }
    }

    pub fn tool_call_id(&self) -> &str {
        match self {
            Self::SamplingRequest(m) => &m.tool_call_id,
            Self::SamplingResult(m) => &m.tool_call_id,
            Self::ElicitationRequest(m) => &m.tool_call_id,
            Self::ElicitationResult(m) => &m.tool_call_id,
            Self::ToolCallResult(m) => &m.tool_call_id,
            Self::Progress(m) => &m.tool_call_id,
        }
    }

    /// Wrap in an envelope addressed to `session_id` and serialize.
    pub fn encode(&self, session_id: &str) -> Result<String> {
        let data = match self {
            Self::SamplingRequest(m) => serde_json::to_value(m)?,
            Self::SamplingResult(m) => serde_json::to_value(m)?,
            Self::ElicitationRequest(m) => serde_json::to_value(m)?,
            Self::ElicitationResult(m) => serde_json::to_value(m)?,
            Self::ToolCallResult(m) => serde_json::to_value(m)?,
            Self::Progress(m) => serde_json::to_value(m)?,
        };
        Ok(serde_json::to_string(&Envelope {
            id: session_id.to_string(),
            data,
        })?)
    }

    /// Parse and validate a raw payload received on `channel`.
    pub fn decode(channel: Channel, raw: &str) -> Result<Inbound> {
        let envelope: Envelope<Value> =
            serde_json::from_str(raw).map_err(|e| Error::malformed(channel, e.to_string()))?;
        if envelope.id.is_empty() {
            return Err(Error::malformed(channel, "envelope id is empty"));
        }
        let data = envelope.data;
        let message = match channel {
            Channel::SamplingRequest => Self::SamplingRequest(payload(channel, data)?),
            Channel::SamplingResult => Self::SamplingResult(payload(channel, data)?),
            Channel::ElicitationRequest => Self::ElicitationRequest(payload(channel, data)?),
            Channel::ElicitationResult => Self::ElicitationResult(payload(channel, data)?),
            Channel::ToolCallResult => Self::ToolCallResult(payload(channel, data)?),
            Channel::Progress => Self::Progress(payload(channel, data)?),
        };
        Ok(Inbound {
            session_id: envelope.id,
            message,
        })
    }
}

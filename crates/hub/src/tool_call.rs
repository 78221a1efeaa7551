//! Lifecycle of the tool calls a hub runs.
//!
//! ```text
//! running --elicitation request--> pendingElicitation --elicitation result--> running
//! running --sampling request-----> pendingSampling    --sampling result-----> running
//! running --final result---------> result
//! ```

use std::{
    collections::{HashMap, VecDeque},
    fmt,
};

use {serde::Serialize, tokio::time::Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolCallState {
    Running,
    PendingElicitation,
    PendingSampling,
    Result,
}

impl ToolCallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::PendingElicitation => "pendingElicitation",
            Self::PendingSampling => "pendingSampling",
            Self::Result => "result",
        }
    }

    pub fn can_move_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Running, Self::PendingElicitation)
                | (Self::Running, Self::PendingSampling)
                | (Self::Running, Self::Result)
                | (Self::PendingElicitation, Self::Running)
                | (Self::PendingSampling, Self::Running)
        )
    }
}

impl fmt::Display for ToolCallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("unknown tool call '{0}'")]
    UnknownCall(String),
    #[error("tool call id '{0}' is already in use")]
    DuplicateId(String),
    #[error("tool call id must not be empty")]
    EmptyId,
    #[error("tool call '{id}' is {from}, cannot move to {to}")]
    WrongState {
        id: String,
        from: ToolCallState,
        to: ToolCallState,
    },
    #[error("tool call '{0}' has already finished")]
    Finished(String),
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub state: ToolCallState,
    /// Every state the call has been in, oldest first.
    pub history: Vec<ToolCallState>,
    pub started_at: Instant,
    pub finished: bool,
}

/// All tool calls of one hub. Finished calls stay queryable until they fall
/// out of a bounded FIFO.
#[derive(Debug)]
pub struct ToolCallAggregate {
    calls: HashMap<String, ToolCall>,
    finished: VecDeque<String>,
    retention: usize,
}

pub const DEFAULT_RETENTION: usize = 256;

impl Default for ToolCallAggregate {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl ToolCallAggregate {
    pub fn new(retention: usize) -> Self {
        Self {
            calls: HashMap::new(),
            finished: VecDeque::new(),
            retention,
        }
    }

    pub fn start_tool_call(&mut self, id: &str, tool_name: &str) -> Result<(), StateError> {
        if id.is_empty() {
            return Err(StateError::EmptyId);
        }
        if self.calls.contains_key(id) {
            return Err(StateError::DuplicateId(id.to_string()));
        }
        self.calls.insert(id.to_string(), ToolCall {
            id: id.to_string(),
            tool_name: tool_name.to_string(),
            state: ToolCallState::Running,
            history: vec![ToolCallState::Running],
            started_at: Instant::now(),
            finished: false,
        });
        Ok(())
    }

    pub fn elicitation_request(&mut self, id: &str) -> Result<(), StateError> {
        self.transition(id, ToolCallState::PendingElicitation)
    }

    pub fn elicitation_result(&mut self, id: &str) -> Result<(), StateError> {
        self.expect_then(id, ToolCallState::PendingElicitation, ToolCallState::Running)
    }

    pub fn sampling_request(&mut self, id: &str) -> Result<(), StateError> {
        self.transition(id, ToolCallState::PendingSampling)
    }

    pub fn sampling_result(&mut self, id: &str) -> Result<(), StateError> {
        self.expect_then(id, ToolCallState::PendingSampling, ToolCallState::Running)
    }

    /// Move to the terminal `result` state; the call is finished afterwards.
    pub fn tool_call_result(&mut self, id: &str) -> Result<(), StateError> {
        self.transition(id, ToolCallState::Result)?;
        self.finish(id);
        Ok(())
    }

    /// Mark a call finished in whatever state it is in. Used when a call
    /// fails or is cancelled; the entry is kept, not removed.
    pub fn finish(&mut self, id: &str) {
        let Some(call) = self.calls.get_mut(id) else {
            return;
        };
        if call.finished {
            return;
        }
        call.finished = true;
        self.finished.push_back(id.to_string());
        while self.finished.len() > self.retention {
            if let Some(oldest) = self.finished.pop_front() {
                self.calls.remove(&oldest);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&ToolCall> {
        self.calls.get(id)
    }

    pub fn state(&self, id: &str) -> Option<ToolCallState> {
        self.calls.get(id).map(|call| call.state)
    }

    pub fn active(&self) -> impl Iterator<Item = &ToolCall> {
        self.calls.values().filter(|call| !call.finished)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// A result moves `pending → running`; arriving while the call is in any
    /// other state is a wrong-state error, not a silent no-op.
    fn expect_then(
        &mut self,
        id: &str,
        expected: ToolCallState,
        to: ToolCallState,
    ) -> Result<(), StateError> {
        let call = self.live(id)?;
        if call.state != expected {
            return Err(StateError::WrongState {
                id: id.to_string(),
                from: call.state,
                to,
            });
        }
        self.transition(id, to)
    }

    fn live(&mut self, id: &str) -> Result<&mut ToolCall, StateError> {
        let call = self
            .calls
            .get_mut(id)
            .ok_or_else(|| StateError::UnknownCall(id.to_string()))?;
        if call.finished {
            return Err(StateError::Finished(id.to_string()));
        }
        Ok(call)
    }

    fn transition(&mut self, id: &str, to: ToolCallState) -> Result<(), StateError> {
        let call = self.live(id)?;
        if !call.state.can_move_to(to) {
            return Err(StateError::WrongState {
                id: id.to_string(),
                from: call.state,
                to,
            });
        }
        call.state = to;
        call.history.push(to);
        Ok(())
    }
}

//! `<server>_<tool>` names that keep tools of different servers apart.

use crate::error::{HubError, Result};

pub const SEPARATOR: char = '_';

pub fn encode(server: &str, tool: &str) -> String {
    format!("{server}{SEPARATOR}{tool}")
}

/// Split at the first separator. Server names never contain one, tool names
/// may.
pub fn decode(name: &str) -> Result<(&str, &str)> {
    match name.split_once(SEPARATOR) {
        Some((server, tool)) if !server.is_empty() && !tool.is_empty() => Ok((server, tool)),
        _ => Err(HubError::invalid_input(format!(
            "'{name}' is not a qualified tool name (expected <server>_<tool>)"
        ))),
    }
}

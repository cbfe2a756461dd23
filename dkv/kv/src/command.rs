// Copyright 2022-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::{Deserialize, Serialize};

/// Characters the wire codec cannot carry inside a key or a value.
///
/// The admission layer rejects inputs containing these before a command is
/// ever encoded.
pub const RESERVED_CHARS: [char; 2] = [',', ':'];

/// A single replicated mutation of the key-value map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, val: String },
    Del { key: String },
}

/// Result of feeding one committed log entry through the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Applied,
    UnknownCommand,
}

impl Command {
    /// Encode into the comma-separated `field:value` wire form, e.g.
    /// `command:SET,key:a,val:b`.
    pub fn encode(&self) -> String {
        match self {
            Command::Set { key, val } => format!("command:SET,key:{key},val:{val}"),
            Command::Del { key } => format!("command:DEL,key:{key}"),
        }
    }

    /// Decode the wire form. Segments are split on `,`, then on the first
    /// `:`, and must arrive in the fixed field order. Returns `None` for
    /// anything else; the state machine reports those as [`ApplyOutcome::UnknownCommand`]
    /// rather than failing.
    pub fn decode(raw: &str) -> Option<Command> {
        let mut fields = Vec::new();
        for segment in raw.split(',') {
            fields.push(segment.split_once(':')?);
        }
        match fields.as_slice() {
            [("command", "SET"), ("key", key), ("val", val)] => Some(Command::Set {
                key: (*key).to_string(),
                val: (*val).to_string(),
            }),
            [("command", "DEL"), ("key", key)] => Some(Command::Del {
                key: (*key).to_string(),
            }),
            _ => None,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. } => key,
            Command::Del { key } => key,
        }
    }
}

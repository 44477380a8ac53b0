//! Line-oriented operator commands.
//!
//! ```text
//! // comments start with `//` or `#`
//! start 0 1 2     start (or restart) nodes
//! fail 1          crash nodes
//! 0 hello there   deliver the command `hello there` to node 0
//! echo text       print `text`
//! time            end the current round
//! exit            stop the run
//! ```
//!
//! The emulator runs a single node, so its commands carry no addresses:
//! `start`, `fail`, and any unrecognized line is a command for the local
//! node.

use std::collections::VecDeque;

use thiserror::Error;

use crate::{Address, Event, MAX_ADDRESS};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Invalid node address '{0}'")]
    InvalidAddress(String),
    #[error("'{0}' needs at least one node address")]
    MissingAddress(&'static str),
    #[error("Unrecognized command '{0}'")]
    Unknown(String),
    #[error("line {line}: {source}")]
    AtLine {
        line: usize,
        #[source]
        source: Box<Self>,
    },
}

/// Whether commands name their target nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    Simulation,
    /// Every node command targets `local`.
    Emulation { local: Address },
}

/// Parses one line into the events it describes.
///
/// Blank lines and comments produce no events.
///
/// # Errors
///
/// * If a node address is missing or invalid
/// * If the line is not a known command
pub fn parse_line<T>(line: &str, mode: CommandMode) -> Result<Vec<Event<T>>, CommandError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with("//") || line.starts_with('#') {
        return Ok(vec![]);
    }

    let (word, rest) = line
        .split_once(char::is_whitespace)
        .map_or((line, ""), |(word, rest)| (word, rest.trim_start()));

    match (word, mode) {
        ("time", _) => Ok(vec![Event::Time]),
        ("exit", _) => Ok(vec![Event::Exit]),
        ("echo", _) => Ok(vec![Event::Echo(rest.to_string())]),
        ("fail", CommandMode::Emulation { local }) => Ok(vec![Event::Failure(local)]),
        ("start", CommandMode::Emulation { local }) => Ok(vec![Event::Start(local)]),
        ("fail", CommandMode::Simulation) => {
            Ok(parse_addresses(rest, "fail")?.into_iter().map(Event::Failure).collect())
        }
        ("start", CommandMode::Simulation) => {
            Ok(parse_addresses(rest, "start")?.into_iter().map(Event::Start).collect())
        }
        (_, CommandMode::Emulation { local }) => Ok(vec![Event::Command {
            addr: local,
            command: line.to_string(),
        }]),
        (_, CommandMode::Simulation) => {
            if !word.bytes().all(|b| b.is_ascii_digit()) {
                return Err(CommandError::Unknown(line.to_string()));
            }
            Ok(vec![Event::Command {
                addr: parse_address(word)?,
                command: rest.to_string(),
            }])
        }
    }
}

/// Parses a whole command script.
///
/// # Errors
///
/// * If any line fails to parse, tagged with its 1-based line number
pub fn parse_script<T>(script: &str, mode: CommandMode) -> Result<VecDeque<Event<T>>, CommandError> {
    let mut events = VecDeque::new();
    for (i, line) in script.lines().enumerate() {
        let parsed = parse_line(line, mode).map_err(|e| CommandError::AtLine {
            line: i + 1,
            source: Box::new(e),
        })?;
        events.extend(parsed);
    }
    Ok(events)
}

/// Parses a whitespace separated list of node addresses.
///
/// # Errors
///
/// * If the list is empty
/// * If any entry is not an address in `0..=254`
pub fn parse_addresses(list: &str, command: &'static str) -> Result<Vec<Address>, CommandError> {
    let addrs = list
        .split_whitespace()
        .map(parse_address)
        .collect::<Result<Vec<_>, _>>()?;

    if addrs.is_empty() {
        return Err(CommandError::MissingAddress(command));
    }

    Ok(addrs)
}

fn parse_address(token: &str) -> Result<Address, CommandError> {
    token
        .parse::<Address>()
        .ok()
        .filter(|addr| *addr <= MAX_ADDRESS)
        .ok_or_else(|| CommandError::InvalidAddress(token.to_string()))
}

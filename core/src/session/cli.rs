// Remote CLI — response grammars and the per-destination request queue
//
// Replies carry no request id. A reply is offered to every pending command
// for its destination and routed by which command's grammar accepts it:
// a single match wins outright, several matches go to the oldest of them.

use crate::identity::KeyPrefix;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Shape of the reply a command is expected to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseGrammar {
    /// Firmware version string, e.g. `v1.7.1 (Build: 01-Jul-2025)`
    Version,
    /// Remote clock, e.g. `14:02 - 3/7/2025 UTC`
    Clock,
    /// Reply to `get <name>`: `> <value>`
    GetValue,
    /// Confirmation starting with `OK`
    Acknowledgement,
    /// Neighbour table: `-none-` or `<hex prefix>:<secs ago>:<snr>` lines
    Neighbors,
    /// Commands with no known reply format
    Any,
}

impl ResponseGrammar {
    /// Grammar for a command line
    pub fn for_command(command: &str) -> Self {
        let mut words = command.split_whitespace();
        let first = words.next().unwrap_or_default().to_ascii_lowercase();
        let second = words.next().map(|w| w.to_ascii_lowercase());

        match (first.as_str(), second.as_deref()) {
            ("ver" | "version", _) => Self::Version,
            ("clock", None) => Self::Clock,
            ("clock", Some(_)) | ("time", _) => Self::Acknowledgement,
            ("get", _) => Self::GetValue,
            ("set" | "password" | "advert" | "setperm" | "erase", _) => Self::Acknowledgement,
            ("neighbors" | "neighbours", _) => Self::Neighbors,
            _ => Self::Any,
        }
    }

    /// Whether `text` is a plausible reply under this grammar
    pub fn accepts(&self, text: &str) -> bool {
        let text = text.trim();
        if is_error_reply(text) {
            return true;
        }
        match self {
            Self::Version => {
                let mut chars = text.chars();
                (chars.next() == Some('v') && chars.next().is_some_and(|c| c.is_ascii_digit()))
                    || text.contains("Build:")
            }
            Self::Clock => text.contains(':') && text.ends_with("UTC"),
            Self::GetValue => text.starts_with("> "),
            Self::Acknowledgement => text.starts_with("OK"),
            Self::Neighbors => text == "-none-" || text.lines().all(is_neighbor_line),
            Self::Any => true,
        }
    }
}

/// Failure replies are valid answers to any command
fn is_error_reply(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.starts_with("error") || lower.starts_with("err:") || lower.contains("unknown command")
}

fn is_neighbor_line(line: &str) -> bool {
    let parts: Vec<&str> = line.trim().split(':').collect();
    parts.len() == 3
        && !parts[0].is_empty()
        && parts[0].chars().all(|c| c.is_ascii_hexdigit())
        && parts[1].parse::<u32>().is_ok()
        && parts[2].parse::<i32>().is_ok()
}

struct PendingCli {
    id: u64,
    command: String,
    grammar: ResponseGrammar,
    issued_at: Instant,
    sender: oneshot::Sender<String>,
}

/// Where a reply went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliDispatch {
    /// Resolved the named command
    Resolved { id: u64, command: String },
    /// No pending command accepted the reply
    Unmatched,
}

/// Outstanding CLI commands, ordered per destination by issue time
#[derive(Default)]
pub struct PendingCliTable {
    entries: HashMap<KeyPrefix, Vec<PendingCli>>,
    next_id: u64,
}

impl PendingCliTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a command; the receiver yields its reply
    pub fn register(&mut self, prefix: KeyPrefix, command: &str) -> (u64, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        self.next_id += 1;
        let id = self.next_id;
        self.entries.entry(prefix).or_default().push(PendingCli {
            id,
            command: command.to_string(),
            grammar: ResponseGrammar::for_command(command),
            issued_at: Instant::now(),
            sender: tx,
        });
        (id, rx)
    }

    /// Drop one request, leaving the rest of the destination's queue alone
    pub fn remove(&mut self, prefix: &KeyPrefix, id: u64) {
        if let Some(queue) = self.entries.get_mut(prefix) {
            queue.retain(|p| p.id != id);
            if queue.is_empty() {
                self.entries.remove(prefix);
            }
        }
    }

    pub fn pending_count(&self, prefix: &KeyPrefix) -> usize {
        self.entries.get(prefix).map_or(0, Vec::len)
    }

    /// Route a reply to the command whose grammar accepts it
    pub fn dispatch(&mut self, prefix: &KeyPrefix, text: &str) -> CliDispatch {
        let Some(queue) = self.entries.get_mut(prefix) else {
            return CliDispatch::Unmatched;
        };

        let matching: Vec<usize> = queue
            .iter()
            .enumerate()
            .filter(|(_, p)| p.grammar.accepts(text))
            .map(|(i, _)| i)
            .collect();

        let chosen = match matching.as_slice() {
            [] => return CliDispatch::Unmatched,
            [only] => *only,
            several => {
                let oldest = several
                    .iter()
                    .copied()
                    .min_by_key(|&i| (queue[i].issued_at, queue[i].id));
                match oldest {
                    Some(i) => {
                        tracing::debug!(
                            "Ambiguous reply for {} matched {} commands, using the oldest",
                            prefix,
                            several.len()
                        );
                        i
                    }
                    None => return CliDispatch::Unmatched,
                }
            }
        };

        let pending = queue.remove(chosen);
        if queue.is_empty() {
            self.entries.remove(prefix);
        }
        let _ = pending.sender.send(text.to_string());
        CliDispatch::Resolved {
            id: pending.id,
            command: pending.command,
        }
    }
}

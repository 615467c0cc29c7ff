//! Run configuration: which workload this process executes.
//!
//! The shape of the configuration file's first line selects the mode:
//! one token is a broadcast count, two tokens add a send target, three or
//! more tokens announce agreement proposals on the following lines.

use core::fmt;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use error_stack::{Report, ResultExt};

use crate::directory::ProcessId;
use crate::message::{self, MAX_DATAGRAM};

/// Room reserved for the five envelope header integers and separators when
/// checking that a proposal fits a single datagram.
const HEADER_BUDGET: usize = 128;

/// Marker error for configuration loading failures.
#[derive(Debug)]
pub struct ConfigError;

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid configuration file")
    }
}

impl core::error::Error for ConfigError {}

/// Workload selected by the configuration file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Perfect-link sends of `"1".."count"` to a single target process.
    Send { count: u64, target: ProcessId },
    /// FIFO broadcasts of `"1".."count"`.
    Broadcast { count: u64 },
    /// One lattice agreement proposal per slot, in slot order.
    Agreement { proposals: Vec<BTreeSet<u32>> },
}

impl Mode {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, a line does not
    /// parse, the proposal count does not match the header, or an encoded
    /// proposal would not fit in a single datagram.
    pub fn load(path: &Path) -> Result<Self, Report<ConfigError>> {
        let contents = fs::read_to_string(path)
            .change_context(ConfigError)
            .attach_with(|| format!("reading {}", path.display()))?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self, Report<ConfigError>> {
        let mut lines = contents.lines();
        let first = lines
            .next()
            .ok_or_else(|| Report::new(ConfigError).attach("empty configuration"))?;
        let tokens: Vec<&str> = first.split_whitespace().collect();

        match tokens.as_slice() {
            [count] => Ok(Self::Broadcast {
                count: parse_count(count)?,
            }),
            [count, target] => Ok(Self::Send {
                count: parse_count(count)?,
                target: ProcessId::new(
                    target
                        .parse()
                        .change_context(ConfigError)
                        .attach("bad target id")?,
                ),
            }),
            [count, _distinct, _per_proposal, ..] => {
                let slots: usize = count
                    .parse()
                    .change_context(ConfigError)
                    .attach("bad slot count")?;
                let mut proposals = Vec::new();
                for (index, line) in lines.enumerate().take(slots) {
                    let proposal = message::parse_set(line).ok_or_else(|| {
                        Report::new(ConfigError)
                            .attach(format!("proposal for slot {index} does not parse"))
                    })?;
                    if message::encode_set(&proposal).len() + HEADER_BUDGET > MAX_DATAGRAM {
                        return Err(Report::new(ConfigError).attach(format!(
                            "proposal for slot {index} exceeds the datagram size"
                        )));
                    }
                    proposals.push(proposal);
                }
                if proposals.len() != slots {
                    return Err(Report::new(ConfigError).attach(format!(
                        "expected {slots} proposals, found {}",
                        proposals.len()
                    )));
                }
                Ok(Self::Agreement { proposals })
            }
            [] => Err(Report::new(ConfigError).attach("blank first line")),
        }
    }
}

fn parse_count(token: &str) -> Result<u64, Report<ConfigError>> {
    token
        .parse()
        .change_context(ConfigError)
        .attach("bad message count")
}

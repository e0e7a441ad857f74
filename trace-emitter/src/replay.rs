//! Textual event scripts for driving a [`FunctionMonitor`] without an execution engine.
//!
//! Every non-empty line that does not start with `#` is one event:
//!
//! ```text
//! call <context> <space> <pc> <target> <sp|?>
//! ret <context> <space> <pc> <sp|?>
//! destroy <context>
//! ```
//!
//! Numbers are decimal or `0x` prefixed hexadecimal. A stack pointer of `?` stands for one the
//! engine could not resolve.

use std::io::BufRead;

use function_monitor::{AddressSpace, ContextId, FunctionMonitor, Snapshot};

use crate::config::parse_int;

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("line {line}: unknown event {event:?}")]
    UnknownEvent { line: usize, event: String },

    #[error("line {line}: {event} expects {expected} fields, found {found}")]
    FieldCount {
        line: usize,
        event: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: invalid number {value:?}")]
    InvalidNumber { line: usize, value: String },

    #[error("failed to read event script")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    Call { state: Snapshot, target: u64 },
    Return { state: Snapshot },
    Destroy { context: ContextId },
}

impl Event {
    /// Parses one script line. Blank lines and comments yield `None`.
    pub fn parse(line: usize, text: &str) -> Result<Option<Self>, ReplayError> {
        let text = text.trim();
        if text.is_empty() || text.starts_with('#') {
            return Ok(None);
        }

        let fields: Vec<&str> = text.split_whitespace().collect();
        let (event, args) = (fields[0], &fields[1..]);
        let count = |name: &'static str, expected: usize| {
            if args.len() == expected {
                Ok(())
            } else {
                Err(ReplayError::FieldCount {
                    line,
                    event: name,
                    expected,
                    found: args.len(),
                })
            }
        };
        let number = |value: &str| {
            parse_int(value).ok_or_else(|| ReplayError::InvalidNumber {
                line,
                value: String::from(value),
            })
        };
        let context = |value: &str| -> Result<ContextId, ReplayError> {
            let id = number(value)?;
            u32::try_from(id)
                .map(ContextId)
                .map_err(|_| ReplayError::InvalidNumber {
                    line,
                    value: String::from(value),
                })
        };
        let stack_pointer = |value: &str| match value {
            "?" => Ok(None),
            value => number(value).map(Some),
        };

        let event = match event {
            "call" => {
                count("call", 5)?;
                let state = Snapshot::new(
                    context(args[0])?,
                    AddressSpace(number(args[1])?),
                    number(args[2])?,
                    stack_pointer(args[4])?,
                );
                Self::Call {
                    state,
                    target: number(args[3])?,
                }
            }
            "ret" => {
                count("ret", 4)?;
                let state = Snapshot::new(
                    context(args[0])?,
                    AddressSpace(number(args[1])?),
                    number(args[2])?,
                    stack_pointer(args[3])?,
                );
                Self::Return { state }
            }
            "destroy" => {
                count("destroy", 1)?;
                Self::Destroy {
                    context: context(args[0])?,
                }
            }
            other => {
                return Err(ReplayError::UnknownEvent {
                    line,
                    event: String::from(other),
                })
            }
        };
        Ok(Some(event))
    }

    pub fn apply(&self, monitor: &mut FunctionMonitor) {
        match self {
            Self::Call { state, target } => monitor.on_call(state, *target),
            Self::Return { state } => monitor.on_return(state),
            Self::Destroy { context } => {
                monitor.on_context_destroyed(*context);
            }
        }
    }
}

/// Feeds every event of `script` to `monitor`, returning the number of events applied.
///
/// Stops at the first line that fails to parse.
pub fn replay<R: BufRead>(script: R, monitor: &mut FunctionMonitor) -> Result<usize, ReplayError> {
    let mut applied = 0;
    for (index, line) in script.lines().enumerate() {
        let line = line?;
        let Some(event) = Event::parse(index + 1, &line)? else {
            continue;
        };
        tracing::trace!(line = index + 1, event = ?event, "replaying event");
        event.apply(monitor);
        applied += 1;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_events() {
        let event = Event::parse(1, "call 1 0x1000 0x400000 0x401000 0x7ff0").unwrap();
        assert_eq!(
            event,
            Some(Event::Call {
                state: Snapshot::new(ContextId(1), AddressSpace(0x1000), 0x400000, Some(0x7ff0)),
                target: 0x401000,
            })
        );

        let event = Event::parse(2, "  ret 1 4096 0x401010 ?").unwrap();
        assert_eq!(
            event,
            Some(Event::Return {
                state: Snapshot::new(ContextId(1), AddressSpace(4096), 0x401010, None),
            })
        );

        let event = Event::parse(3, "destroy 7").unwrap();
        assert_eq!(
            event,
            Some(Event::Destroy {
                context: ContextId(7)
            })
        );
    }

    #[test]
    fn test_skip_blank_and_comments() {
        assert_eq!(Event::parse(1, "").unwrap(), None);
        assert_eq!(Event::parse(2, "   ").unwrap(), None);
        assert_eq!(Event::parse(3, "# call 1 1 1 1 1").unwrap(), None);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Event::parse(4, "jump 1 2"),
            Err(ReplayError::UnknownEvent { line: 4, .. })
        ));
        assert!(matches!(
            Event::parse(5, "ret 1 2 3"),
            Err(ReplayError::FieldCount {
                line: 5,
                expected: 4,
                found: 3,
                ..
            })
        ));
        assert!(matches!(
            Event::parse(6, "destroy 0x100000000"),
            Err(ReplayError::InvalidNumber { line: 6, .. })
        ));
        assert!(matches!(
            Event::parse(7, "call 1 1 pc 0x10 0x20"),
            Err(ReplayError::InvalidNumber { line: 7, .. })
        ));
    }

    #[test]
    fn test_replay_stops_at_bad_line() {
        let script = "call 1 1 0x10 0x100 0x8000\nbogus\nret 1 1 0x110 0x8000\n";
        let mut monitor = FunctionMonitor::new();
        let err = replay(script.as_bytes(), &mut monitor).unwrap_err();
        assert!(matches!(err, ReplayError::UnknownEvent { line: 2, .. }));
    }
}

//! Lines typed on stdin while `sigline run` is in the foreground.
//!
//! A plain line is `<contact> <text>`. Lines starting with `/` are commands:
//!
//! ```text
//! /open <contact>
//! /attach <contact> <path> [text]
//! /react <contact> <author> <timestamp> <emoji>
//! /unreact <contact> <author> <timestamp> <emoji>
//! /delete <contact> <timestamp>
//! /rename <contact> <name>
//! /reload
//! ```

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Send {
        to: String,
        text: String,
        attachments: Vec<String>,
    },
    React {
        to: String,
        author: String,
        timestamp: i64,
        emoji: String,
        remove: bool,
    },
    Delete {
        to: String,
        timestamp: i64,
    },
    Rename {
        id: String,
        name: String,
    },
    Open(String),
    Reload,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("not a message timestamp: {0:?}")]
    BadTimestamp(String),
    #[error("unknown command /{0}")]
    UnknownCommand(String),
}

const SEND_USAGE: &str = "<contact> <text>";
const ATTACH_USAGE: &str = "/attach <contact> <path> [text]";
const REACT_USAGE: &str = "/react <contact> <author> <timestamp> <emoji>";
const DELETE_USAGE: &str = "/delete <contact> <timestamp>";
const RENAME_USAGE: &str = "/rename <contact> <name>";
const OPEN_USAGE: &str = "/open <contact>";

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Input>, InputError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix('/') else {
        let (to, text) = split_word(line);
        if text.is_empty() {
            return Err(InputError::Usage(SEND_USAGE));
        }
        return Ok(Some(Input::Send {
            to: to.to_string(),
            text: text.to_string(),
            attachments: Vec::new(),
        }));
    };

    let (name, rest) = split_word(command);
    let input = match name {
        "open" => {
            let (to, extra) = split_word(rest);
            if to.is_empty() || !extra.is_empty() {
                return Err(InputError::Usage(OPEN_USAGE));
            }
            Input::Open(to.to_string())
        }
        "attach" => {
            let (to, rest) = split_word(rest);
            let (path, text) = split_word(rest);
            if path.is_empty() {
                return Err(InputError::Usage(ATTACH_USAGE));
            }
            Input::Send {
                to: to.to_string(),
                text: text.to_string(),
                attachments: vec![path.to_string()],
            }
        }
        "react" | "unreact" => {
            let words: Vec<&str> = rest.split_whitespace().collect();
            let [to, author, timestamp, emoji] = words[..] else {
                return Err(InputError::Usage(REACT_USAGE));
            };
            Input::React {
                to: to.to_string(),
                author: author.to_string(),
                timestamp: parse_timestamp(timestamp)?,
                emoji: emoji.to_string(),
                remove: name == "unreact",
            }
        }
        "delete" => {
            let words: Vec<&str> = rest.split_whitespace().collect();
            let [to, timestamp] = words[..] else {
                return Err(InputError::Usage(DELETE_USAGE));
            };
            Input::Delete {
                to: to.to_string(),
                timestamp: parse_timestamp(timestamp)?,
            }
        }
        "rename" => {
            let (id, name) = split_word(rest);
            if name.is_empty() {
                return Err(InputError::Usage(RENAME_USAGE));
            }
            Input::Rename {
                id: id.to_string(),
                name: name.to_string(),
            }
        }
        "reload" => Input::Reload,
        other => return Err(InputError::UnknownCommand(other.to_string())),
    };
    Ok(Some(input))
}

/// First whitespace-separated word and the trimmed remainder.
fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (s, ""),
    }
}

fn parse_timestamp(s: &str) -> Result<i64, InputError> {
    s.parse()
        .map_err(|_| InputError::BadTimestamp(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_line_sends_text() {
        assert_eq!(
            parse("+15555550001   hello there ").unwrap(),
            Some(Input::Send {
                to: "+15555550001".into(),
                text: "hello there".into(),
                attachments: vec![],
            })
        );
        assert_eq!(parse("   ").unwrap(), None);
        assert_eq!(
            parse("+15555550001").unwrap_err(),
            InputError::Usage(SEND_USAGE)
        );
    }

    #[test]
    fn attach_with_optional_text() {
        assert_eq!(
            parse("/attach AQID /tmp/cat.png look").unwrap(),
            Some(Input::Send {
                to: "AQID".into(),
                text: "look".into(),
                attachments: vec!["/tmp/cat.png".into()],
            })
        );
        assert!(matches!(
            parse("/attach AQID /tmp/cat.png").unwrap(),
            Some(Input::Send { text, .. }) if text.is_empty()
        ));
        assert!(parse("/attach AQID").is_err());
    }

    #[test]
    fn reactions_and_deletes() {
        assert_eq!(
            parse("/unreact +15555550001 +15555550002 1700000000000 👍").unwrap(),
            Some(Input::React {
                to: "+15555550001".into(),
                author: "+15555550002".into(),
                timestamp: 1_700_000_000_000,
                emoji: "👍".into(),
                remove: true,
            })
        );
        assert_eq!(
            parse("/delete +15555550001 12x").unwrap_err(),
            InputError::BadTimestamp("12x".into())
        );
        assert_eq!(
            parse("/delete +15555550001 12").unwrap(),
            Some(Input::Delete {
                to: "+15555550001".into(),
                timestamp: 12,
            })
        );
    }

    #[test]
    fn other_commands() {
        assert_eq!(parse("/reload").unwrap(), Some(Input::Reload));
        assert_eq!(
            parse("/open +15555550001").unwrap(),
            Some(Input::Open("+15555550001".into()))
        );
        assert_eq!(
            parse("/rename AQID The Book Club").unwrap(),
            Some(Input::Rename {
                id: "AQID".into(),
                name: "The Book Club".into(),
            })
        );
        assert_eq!(
            parse("/frobnicate").unwrap_err(),
            InputError::UnknownCommand("frobnicate".into())
        );
    }
}

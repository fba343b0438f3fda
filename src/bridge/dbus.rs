//! `dbus-send` command lines for the daemon's D-Bus interface, and parsers
//! for the literal replies they print.

use crate::proc::ProcessCommand;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::BTreeSet;
use thiserror::Error;

pub const SIGNAL_SERVICE: &str = "org.asamk.Signal";
const SIGNAL_PATH: &str = "/org/asamk/Signal";

#[derive(Debug, Error)]
pub enum DbusError {
    #[error("group id {id:?} is not valid base64")]
    InvalidGroupId {
        id: String,
        #[source]
        source: base64::DecodeError,
    },
}

/// Whom a send goes to. Groups are addressed by their raw id bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient<'a> {
    Individual(&'a str),
    Group(&'a str),
}

impl<'a> Recipient<'a> {
    pub fn new(id: &'a str) -> Self {
        if crate::envelope::is_number(id) {
            Self::Individual(id)
        } else {
            Self::Group(id)
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }

    fn arg(&self) -> Result<String, DbusError> {
        match self {
            Self::Individual(number) => Ok(format!("string:{number}")),
            Self::Group(id) => group_id_arg(id),
        }
    }
}

/// `array:byte:` argument for a base64 group id.
pub fn group_id_arg(group_id: &str) -> Result<String, DbusError> {
    let bytes = STANDARD
        .decode(group_id)
        .map_err(|source| DbusError::InvalidGroupId {
            id: group_id.to_string(),
            source,
        })?;
    let list: Vec<String> = bytes.iter().map(u8::to_string).collect();
    Ok(format!("array:byte:{}", list.join(",")))
}

/// Builds `dbus-send` invocations.
#[derive(Debug, Clone)]
pub struct DbusSend {
    program: String,
}

impl DbusSend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn method_call(&self) -> ProcessCommand {
        ProcessCommand::new(&self.program).args([
            "--session",
            "--type=method_call",
            "--print-reply=literal",
        ])
    }

    /// Call `method` on the signal-cli service.
    pub fn signal<I, S>(&self, method: &str, args: I) -> ProcessCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.method_call()
            .arg(format!("--dest={SIGNAL_SERVICE}"))
            .arg(SIGNAL_PATH)
            .arg(format!("{SIGNAL_SERVICE}.{method}"))
            .args(args)
    }

    /// Ask the bus daemon for every registered name.
    pub fn list_names(&self) -> ProcessCommand {
        self.method_call().args([
            "--dest=org.freedesktop.DBus",
            "/org/freedesktop/DBus",
            "org.freedesktop.DBus.ListNames",
        ])
    }

    pub fn send_message(
        &self,
        recipient: Recipient<'_>,
        message: &str,
        attachments: &[String],
    ) -> Result<ProcessCommand, DbusError> {
        let method = if recipient.is_group() {
            "sendGroupMessage"
        } else {
            "sendMessage"
        };
        Ok(self.signal(
            method,
            [
                format!("string:{message}"),
                format!("array:string:{}", attachments.join(",")),
                recipient.arg()?,
            ],
        ))
    }

    pub fn send_reaction(
        &self,
        recipient: Recipient<'_>,
        emoji: &str,
        remove: bool,
        target_author: &str,
        target_sent_timestamp: i64,
    ) -> Result<ProcessCommand, DbusError> {
        let method = if recipient.is_group() {
            "sendGroupMessageReaction"
        } else {
            "sendMessageReaction"
        };
        Ok(self.signal(
            method,
            [
                format!("string:{emoji}"),
                format!("boolean:{remove}"),
                format!("string:{target_author}"),
                format!("int64:{target_sent_timestamp}"),
                recipient.arg()?,
            ],
        ))
    }

    pub fn send_remote_delete(
        &self,
        recipient: Recipient<'_>,
        target_sent_timestamp: i64,
    ) -> Result<ProcessCommand, DbusError> {
        let method = if recipient.is_group() {
            "sendGroupRemoteDeleteMessage"
        } else {
            "sendRemoteDeleteMessage"
        };
        Ok(self.signal(
            method,
            [format!("int64:{target_sent_timestamp}"), recipient.arg()?],
        ))
    }

    /// Rename a contact (local only) or a group (sent to the server).
    pub fn rename(&self, recipient: Recipient<'_>, name: &str) -> Result<ProcessCommand, DbusError> {
        Ok(match recipient {
            Recipient::Individual(number) => self.signal(
                "setContactName",
                [format!("string:{number}"), format!("string:{name}")],
            ),
            Recipient::Group(id) => self.signal(
                "updateGroup",
                [
                    group_id_arg(id)?,
                    format!("string:{name}"),
                    "array:string:".to_string(),
                    "string:".to_string(),
                ],
            ),
        })
    }

    pub fn group_name(&self, group_id: &str) -> Result<ProcessCommand, DbusError> {
        Ok(self.signal("getGroupName", [group_id_arg(group_id)?]))
    }

    pub fn group_members(&self, group_id: &str) -> Result<ProcessCommand, DbusError> {
        Ok(self.signal("getGroupMembers", [group_id_arg(group_id)?]))
    }

    pub fn list_groups(&self) -> ProcessCommand {
        self.signal("listGroups", std::iter::empty::<String>())
    }

    pub fn list_numbers(&self) -> ProcessCommand {
        self.signal("listNumbers", std::iter::empty::<String>())
    }

    pub fn contact_name(&self, number: &str) -> ProcessCommand {
        self.signal("getContactName", [format!("string:{number}")])
    }

    pub fn version(&self) -> ProcessCommand {
        self.signal("version", std::iter::empty::<String>())
    }
}

/// Group name, or a shortened id when the group has none.
pub fn parse_group_name(output: &str, group_id: &str) -> String {
    let name = output.trim();
    if name.is_empty() {
        format!("{}[..]", group_id.chars().take(10).collect::<String>())
    } else {
        name.to_string()
    }
}

/// Member numbers from a literal `array [ ... ]` reply.
pub fn parse_group_members(output: &str) -> BTreeSet<String> {
    let output = output.trim_end();
    let inner = match (output.find('['), output.rfind(']')) {
        (Some(start), Some(end)) if start < end => &output[start + 1..end],
        _ => "",
    };
    inner.split_whitespace().map(str::to_string).collect()
}

/// Base64 group ids from a `listGroups` reply, where each id is printed as
/// a hex byte dump between `array of bytes [` and a closing `]` line.
pub fn parse_group_ids(output: &str) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    let mut current: Option<String> = None;
    for line in output.lines() {
        if line.ends_with("array of bytes [") {
            current = Some(String::new());
        } else if let Some(hex_digits) = current.as_mut() {
            if line.trim_start().starts_with(']') {
                match hex::decode(&*hex_digits) {
                    Ok(bytes) => {
                        ids.insert(STANDARD.encode(bytes));
                    }
                    Err(e) => tracing::warn!(error = %e, "skipping unparsable group id"),
                }
                current = None;
            } else {
                hex_digits.extend(line.chars().filter(|c| !c.is_whitespace()));
            }
        }
    }
    ids
}

/// Numbers from a `listNumbers` reply: the second line, minus its closing
/// bracket.
pub fn parse_numbers(output: &str) -> Vec<String> {
    let Some(line) = output.lines().nth(1) else {
        return Vec::new();
    };
    let mut chars = line.chars();
    chars.next_back();
    chars.as_str().split_whitespace().map(str::to_string).collect()
}

pub fn parse_contact_name(output: &str) -> String {
    output.trim().to_string()
}

pub fn parse_version(output: &str) -> String {
    format!("signal-cli {}", output.trim())
}

/// Whether a `ListNames` reply shows the daemon's service on the bus.
pub fn service_registered(list_names_output: &str) -> bool {
    list_names_output.contains(SIGNAL_SERVICE)
}

//! Turning a finished send command into a delivery outcome.

use crate::chat::delivery::DeliveryStatus;
use crate::proc::ProcessOutput;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendFailure {
    #[error("recipient's safety number has changed")]
    UntrustedIdentity,
    #[error("recipient is not registered")]
    UserUnregistered,
    /// Some group members could not be reached; the rest got the message.
    #[error("some group members are not registered")]
    PartialGroupFailure { timestamp_adj: Option<i64> },
    #[error("send failed")]
    Generic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Sent; the daemon may report the timestamp it actually used.
    Sent { timestamp_adj: Option<i64> },
    Failed(SendFailure),
}

impl SendOutcome {
    /// The delivery status to record, plus the timestamp to re-key to.
    pub fn delivery(&self) -> (DeliveryStatus, Option<i64>) {
        match self {
            Self::Sent { timestamp_adj } => (DeliveryStatus::Sent, *timestamp_adj),
            Self::Failed(SendFailure::PartialGroupFailure { timestamp_adj }) => {
                (DeliveryStatus::IgnoreReceipts, *timestamp_adj)
            }
            Self::Failed(_) => (DeliveryStatus::SendFailed, None),
        }
    }
}

/// Classify the output of a send command. Output that does not match any
/// known shape degrades to [`SendFailure::Generic`].
pub fn classify_send(output: &ProcessOutput, is_group: bool) -> SendOutcome {
    let text = output.text();
    if output.success() {
        let timestamp_adj = text
            .trim_end()
            .rsplit_once(char::is_whitespace)
            .map_or(text.trim(), |(_, last)| last)
            .parse()
            .ok();
        if timestamp_adj.is_none() {
            tracing::error!(output = %text, "send: failed to get adjusted envelope timestamp");
        }
        return SendOutcome::Sent { timestamp_adj };
    }

    let failure = if text.contains("UntrustedIdentity") || text.contains("Untrusted Identity") {
        SendFailure::UntrustedIdentity
    } else if text.contains("Unregistered user") {
        if is_group {
            tracing::warn!(output = %text, "some group members have uninstalled signal");
            let timestamp_adj = text
                .lines()
                .next()
                .and_then(|line| line.rsplit_once(": "))
                .and_then(|(_, ts)| ts.trim().parse().ok());
            match timestamp_adj {
                Some(_) => SendFailure::PartialGroupFailure { timestamp_adj },
                None => SendFailure::Generic,
            }
        } else {
            SendFailure::UserUnregistered
        }
    } else {
        SendFailure::Generic
    };
    SendOutcome::Failed(failure)
}

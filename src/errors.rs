//! Normalization of remote failures into user-facing messages.
//!
//! Failures are resolved in this order:
//!
//! | Priority | Match                                                      | Result                         |
//! |----------|------------------------------------------------------------|--------------------------------|
//! | 1        | revert payload decoded by the node client                  | the decoded reason             |
//! | 2        | `Returned values aren't valid, did it run Out of Gas?`     | [`MSG_CONTRACT_OR_FUNDS`]      |
//! | 3        | `VM Exception while processing transaction: out of gas`    | [`MSG_GAS_LIMIT_OR_FUNDS`]     |
//! | 4        | `base fee exceeds gas limit`                               | [`MSG_GAS_LIMIT_OR_FUNDS`]     |
//! | 5        | exactly one `revert` marker                                | trimmed text after the marker  |
//! | 6        | anything else                                              | `None`                         |
//!
//! New node messages are added as rows of [`RULES`].

use crate::chain::ChainError;

pub const MSG_CONTRACT_OR_FUNDS: &str =
    "The contract may not exist or the account does not have enough Ether.";
pub const MSG_GAS_LIMIT_OR_FUNDS: &str =
    "Increase the gas limit or add more Ether to the account.";

const REVERT_MARKER: &str = "revert";

/// A substring of a failure message and the message it maps to.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub pattern: &'static str,
    pub message: &'static str,
}

/// Checked in order; the first matching rule wins.
pub const RULES: &[Rule] = &[
    Rule {
        pattern: "Returned values aren't valid, did it run Out of Gas?",
        message: MSG_CONTRACT_OR_FUNDS,
    },
    Rule {
        pattern: "VM Exception while processing transaction: out of gas",
        message: MSG_GAS_LIMIT_OR_FUNDS,
    },
    Rule {
        pattern: "base fee exceeds gas limit",
        message: MSG_GAS_LIMIT_OR_FUNDS,
    },
];

/// Maps a remote failure to a user-facing message, if one can be derived.
pub fn normalize(failure: &ChainError) -> Option<String> {
    if let Some(reason) = failure.reason().map(str::trim).filter(|r| !r.is_empty()) {
        return Some(reason.to_string());
    }
    normalize_text(failure.message())
}

/// Applies [`RULES`] and the `revert` marker extraction to raw failure text.
pub fn normalize_text(text: &str) -> Option<String> {
    if let Some(rule) = RULES.iter().find(|rule| text.contains(rule.pattern)) {
        return Some(rule.message.to_string());
    }

    let mut parts = text.split(REVERT_MARKER);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(detail), None) => {
            let detail = detail.trim();
            (!detail.is_empty()).then(|| detail.to_string())
        }
        _ => None,
    }
}

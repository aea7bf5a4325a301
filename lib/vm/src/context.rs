//! What the node provides to a running contract.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use sysvmoc_types::Digest;
use thiserror::Error;

const CHARMAP: &[u8; 32] = b".12345abcdefghijklmnopqrstuvwxyz";

/// An account or action name, packed in 64 bits.
///
/// The text form has up to 13 characters: twelve from `.1-5a-z` followed
/// by an optional thirteenth from `.1-5a-j`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(pub u64);

/// A string is not a valid [`Name`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid name {0:?}")]
pub struct NameParseError(String);

fn char_to_symbol(c: u8) -> Option<u64> {
    match c {
        b'a'..=b'z' => Some(u64::from(c - b'a') + 6),
        b'1'..=b'5' => Some(u64::from(c - b'1') + 1),
        b'.' => Some(0),
        _ => None,
    }
}

impl FromStr for Name {
    type Err = NameParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NameParseError(s.to_owned());
        if s.len() > 13 {
            return Err(invalid());
        }
        let mut value = 0u64;
        for (i, c) in s.bytes().enumerate() {
            let symbol = char_to_symbol(c).ok_or_else(invalid)?;
            if i < 12 {
                value |= (symbol & 0x1f) << (64 - 5 * (i + 1));
            } else {
                if symbol > 0x0f {
                    return Err(invalid());
                }
                value |= symbol;
            }
        }
        Ok(Self(value))
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text = [b'.'; 13];
        let mut tmp = self.0;
        for i in 0..13 {
            let (mask, shift) = if i == 0 { (0x0f, 4) } else { (0x1f, 5) };
            text[12 - i] = CHARMAP[(tmp & mask) as usize];
            tmp >>= shift;
        }
        let len = text.iter().rposition(|&c| c != b'.').map_or(0, |p| p + 1);
        // every byte comes from CHARMAP
        f.write_str(std::str::from_utf8(&text[..len]).map_err(|_| fmt::Error)?)
    }
}

impl From<u64> for Name {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// The action being applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Action {
    /// Account whose code handles the action.
    pub account: Name,
    /// Action name.
    pub name: Name,
    /// Serialized action arguments.
    pub data: Vec<u8>,
}

/// Resource limits of an account, `-1` meaning unlimited.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// RAM quota in bytes.
    pub ram_bytes: i64,
    /// NET bandwidth weight.
    pub net_weight: i64,
    /// CPU bandwidth weight.
    pub cpu_weight: i64,
}

/// Callback run by a [`TransactionTimer`] when it expires.
pub type ExpirationCallback = Box<dyn Fn() + Send + Sync>;

/// The CPU deadline of the transaction being applied.
pub trait TransactionTimer: Send + Sync {
    /// `true` once the deadline has passed.
    fn expired(&self) -> bool;

    /// Installs the callback run when the deadline passes, replacing any
    /// previous one. `None` removes it.
    ///
    /// Once this returns, a removed callback is not running and will not
    /// run again.
    fn set_expiration_callback(&self, callback: Option<ExpirationCallback>);
}

/// The node state an executing contract reaches through intrinsics.
pub trait ApplyContext {
    /// Account whose code is running.
    fn receiver(&self) -> Name;

    /// The action being applied.
    fn action(&self) -> &Action;

    /// Account that sent the inline action being applied, if any.
    fn sender(&self) -> Option<Name> {
        None
    }

    /// `true` while applying a block or a speculative transaction, `false`
    /// for read-only transactions.
    fn is_write_window(&self) -> bool;

    /// Time of the pending block, in microseconds since the epoch.
    fn pending_block_time(&self) -> u64;

    /// Whether the protocol feature with this digest is active.
    fn is_feature_activated(&self, feature: &Digest) -> bool;

    /// Schedules an inline action given in its packed form.
    fn execute_inline(&mut self, packed_action: &[u8]) -> Result<(), String>;

    /// Appends contract output to the console.
    fn console_append(&mut self, text: &str);

    /// Resource limits of `account`.
    fn resource_limits(&self, account: Name) -> ResourceLimits;

    /// The deadline of the transaction.
    fn timer(&self) -> Arc<dyn TransactionTimer>;
}

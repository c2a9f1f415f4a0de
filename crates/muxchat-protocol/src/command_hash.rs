//! Command hashes and the hash → command table.
//!
//! Every frame starts with a fixed-width header identifying its command.
//! The header is derived from the command id alone:
//!
//! ```text
//! first  = MD5_HEX_UPPER(decimal(id))
//! header = MD5_HEX_UPPER(first + decimal(id))
//! ```
//!
//! so any peer that knows the catalogue computes identical headers. This
//! is routing, not authentication.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use md5::{Digest, Md5};
use serde::{Serialize, Serializer};

use crate::command::{CommandId, UNKNOWN_COMMAND};

/// Length of a command hash in bytes (32 upper-case hex characters).
pub const HASH_LEN: usize = 32;

/// Upper-case hex digest identifying one command on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandHash([u8; HASH_LEN]);

impl CommandHash {
    /// Derive the header for `id` with the two-round digest.
    pub fn of(id: CommandId) -> Self {
        let decimal = id.to_string();
        let first = md5_upper_hex(&decimal);
        let second = md5_upper_hex(&(first + &decimal));

        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(second.as_bytes());
        CommandHash(out)
    }

    /// Interpret exactly `HASH_LEN` bytes as a hash.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(CommandHash(arr))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Only ever built from hex digits or copied off the wire and then
        // compared; a non-UTF-8 header never reaches a lookup hit.
        std::str::from_utf8(&self.0).unwrap_or("<non-ascii>")
    }
}

impl fmt::Display for CommandHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for CommandHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandHash({})", self.as_str())
    }
}

impl Serialize for CommandHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

fn md5_upper_hex(input: &str) -> String {
    format!("{:X}", Md5::digest(input.as_bytes()))
}

/// Bijective mapping between registered command ids and their hashes.
///
/// The table is built once at startup. `install` replaces the whole
/// mapping; entries of commands left out of the new set are gone.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    commands: Vec<CommandId>,
    by_hash: HashMap<CommandHash, CommandId>,
    by_id: HashMap<CommandId, CommandHash>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table for `ids`.
    pub fn from_ids<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = CommandId>,
    {
        let mut table = Self::new();
        table.install(ids);
        table
    }

    /// Replace the registered command set.
    ///
    /// Duplicate ids are collapsed. The reserved sentinel `0` is skipped
    /// since it could never be told apart from an unresolved header.
    pub fn install<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = CommandId>,
    {
        self.commands.clear();
        self.by_hash.clear();
        self.by_id.clear();

        for id in ids {
            if id == UNKNOWN_COMMAND || self.by_id.contains_key(&id) {
                continue;
            }
            let hash = CommandHash::of(id);
            self.by_hash.insert(hash, id);
            self.by_id.insert(id, hash);
            self.commands.push(id);
        }
    }

    /// Resolve a wire header. Returns `UNKNOWN_COMMAND` on a miss.
    pub fn resolve(&self, header: &[u8]) -> CommandId {
        CommandHash::from_bytes(header)
            .and_then(|hash| self.by_hash.get(&hash).copied())
            .unwrap_or(UNKNOWN_COMMAND)
    }

    pub fn hash_of(&self, id: CommandId) -> Option<CommandHash> {
        self.by_id.get(&id).copied()
    }

    /// Registered ids, in registration order.
    pub fn commands(&self) -> &[CommandId] {
        &self.commands
    }

    /// Hash → id listing, ordered by hash.
    pub fn entries(&self) -> BTreeMap<CommandHash, CommandId> {
        self.by_hash.iter().map(|(h, id)| (*h, *id)).collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

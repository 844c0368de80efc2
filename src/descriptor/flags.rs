//! Security flag bitset carried in every descriptor.
//!
//! Bit positions match the capability tables the descriptor generators have
//! always emitted: bits 0-4 are a one-hot risk hint, bits 5-16 are capability
//! predicates. Anything above bit 16 is unknown to format versions 2 and 3.

use std::fmt;

use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};

use crate::risk::RiskLevel;

/// Bitset of capability predicates describing a command.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SecurityFlags(u32);

impl SecurityFlags {
    /// Producer hint: command is safe.
    pub const HINT_SAFE: Self = Self(1 << 0);
    /// Producer hint: low risk.
    pub const HINT_LOW: Self = Self(1 << 1);
    /// Producer hint: medium risk.
    pub const HINT_MEDIUM: Self = Self(1 << 2);
    /// Producer hint: high risk.
    pub const HINT_HIGH: Self = Self(1 << 3);
    /// Producer hint: critical risk.
    pub const HINT_CRITICAL: Self = Self(1 << 4);
    /// Runs as an ordinary user.
    pub const REQUIRES_USER: Self = Self(1 << 5);
    /// Needs sudo.
    pub const REQUIRES_SUDO: Self = Self(1 << 6);
    /// Needs root.
    pub const REQUIRES_ROOT: Self = Self(1 << 7);
    /// Destroys data or state.
    pub const DESTRUCTIVE: Self = Self(1 << 8);
    /// Performs network I/O.
    pub const NETWORK_ACCESS: Self = Self(1 << 9);
    /// Writes to the filesystem.
    pub const FILE_WRITE: Self = Self(1 << 10);
    /// Deletes filesystem entries.
    pub const FILE_DELETE: Self = Self(1 << 11);
    /// Modifies system configuration.
    pub const SYSTEM_MODIFY: Self = Self(1 << 12);
    /// Signals or controls other processes.
    pub const PROCESS_CONTROL: Self = Self(1 << 13);
    /// Can raise the caller's privilege.
    pub const PRIVILEGE_ESCALATION: Self = Self(1 << 14);
    /// Effects cannot be undone.
    pub const IRREVERSIBLE: Self = Self(1 << 15);
    /// Never mutates anything.
    pub const READ_ONLY: Self = Self(1 << 16);

    /// Every bit defined by format versions 2 and 3.
    pub const KNOWN: Self = Self((1 << 17) - 1);

    /// One-hot risk hint bits.
    pub const HINTS: Self = Self(0b1_1111);

    /// Flags describing a state-changing command.
    pub const MUTATING: Self = Self(
        Self::DESTRUCTIVE.0
            | Self::FILE_WRITE.0
            | Self::FILE_DELETE.0
            | Self::SYSTEM_MODIFY.0
            | Self::IRREVERSIBLE.0,
    );

    /// Flags that may not accompany [`SecurityFlags::HINT_SAFE`].
    const UNSAFE_FOR_SAFE_HINT: Self = Self(
        Self::DESTRUCTIVE.0
            | Self::PRIVILEGE_ESCALATION.0
            | Self::IRREVERSIBLE.0
            | Self::REQUIRES_ROOT.0,
    );

    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Wrap raw bits without validation.
    pub const fn from_bits_retain(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bit value.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True when no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when any bit of `other` is set in `self`.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Set union.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Set intersection.
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// True when the descriptor describes a state-changing command.
    pub const fn is_mutating(self) -> bool {
        self.intersects(Self::MUTATING)
    }

    /// Nonzero when the set violates the exclusion rules.
    ///
    /// Evaluated with masks only so the cost is the same whichever flags
    /// are present. The result is the offending bits OR-ed together.
    pub fn violations(self) -> u32 {
        let bits = self.0;
        let unknown = bits & !Self::KNOWN.0;

        // Clearing the lowest set hint bit leaves something only when more
        // than one hint is present.
        let hints = bits & Self::HINTS.0;
        let extra_hints = hints & hints.wrapping_sub(1);

        let read_only = all_ones_if_set(bits & Self::READ_ONLY.0);
        let read_only_conflict = read_only & bits & Self::MUTATING.0;

        let safe_hint = all_ones_if_set(bits & Self::HINT_SAFE.0);
        let safe_hint_conflict = safe_hint & bits & Self::UNSAFE_FOR_SAFE_HINT.0;

        unknown | extra_hints | read_only_conflict | safe_hint_conflict
    }

    /// Iterate over the names of the set flags, lowest bit first.
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        FLAG_TABLE
            .iter()
            .filter(move |entry| self.contains(entry.flag))
            .map(|entry| entry.name)
    }

    /// Parse a flag by its snake_case name.
    pub fn from_name(name: &str) -> Option<Self> {
        FLAG_TABLE
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.flag)
    }

    /// Parse a comma-separated list of flag names.
    ///
    /// Returns the first unrecognised name as the error.
    pub fn parse_list(list: &str) -> Result<Self, String> {
        list.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .try_fold(Self::empty(), |acc, name| {
                Self::from_name(name)
                    .map(|flag| acc.union(flag))
                    .ok_or_else(|| name.to_owned())
            })
    }
}

/// `u32::MAX` when `value` is nonzero, zero otherwise.
fn all_ones_if_set(value: u32) -> u32 {
    u32::from(value != 0).wrapping_neg()
}

impl std::ops::BitOr for SecurityFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for SecurityFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for SecurityFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecurityFlags({:#x}: ", self.0)?;
        f.debug_list().entries(self.names()).finish()?;
        f.write_str(")")
    }
}

impl Serialize for SecurityFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(None)?;
        for name in self.names() {
            seq.serialize_element(name)?;
        }
        seq.end()
    }
}

/// One row of the flag table: flag, name, and the risk it contributes on its own.
pub(crate) struct FlagEntry {
    pub(crate) flag: SecurityFlags,
    pub(crate) name: &'static str,
    pub(crate) baseline: RiskLevel,
}

const fn entry(flag: SecurityFlags, name: &'static str, baseline: RiskLevel) -> FlagEntry {
    FlagEntry {
        flag,
        name,
        baseline,
    }
}

/// Name and baseline risk for every known flag.
pub(crate) const FLAG_TABLE: [FlagEntry; 17] = [
    entry(SecurityFlags::HINT_SAFE, "hint_safe", RiskLevel::Safe),
    entry(SecurityFlags::HINT_LOW, "hint_low", RiskLevel::Low),
    entry(SecurityFlags::HINT_MEDIUM, "hint_medium", RiskLevel::Medium),
    entry(SecurityFlags::HINT_HIGH, "hint_high", RiskLevel::High),
    entry(SecurityFlags::HINT_CRITICAL, "hint_critical", RiskLevel::Critical),
    entry(SecurityFlags::REQUIRES_USER, "requires_user", RiskLevel::Low),
    entry(SecurityFlags::REQUIRES_SUDO, "requires_sudo", RiskLevel::High),
    entry(SecurityFlags::REQUIRES_ROOT, "requires_root", RiskLevel::High),
    entry(SecurityFlags::DESTRUCTIVE, "destructive", RiskLevel::Critical),
    entry(SecurityFlags::NETWORK_ACCESS, "network_access", RiskLevel::Medium),
    entry(SecurityFlags::FILE_WRITE, "file_write", RiskLevel::Medium),
    entry(SecurityFlags::FILE_DELETE, "file_delete", RiskLevel::High),
    entry(SecurityFlags::SYSTEM_MODIFY, "system_modify", RiskLevel::High),
    entry(SecurityFlags::PROCESS_CONTROL, "process_control", RiskLevel::Medium),
    entry(SecurityFlags::PRIVILEGE_ESCALATION, "privilege_escalation", RiskLevel::Critical),
    entry(SecurityFlags::IRREVERSIBLE, "irreversible", RiskLevel::High),
    entry(SecurityFlags::READ_ONLY, "read_only", RiskLevel::Safe),
];

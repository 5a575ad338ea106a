// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lifecycle Flags
//!
//! Every entity type carries a bitset of lifecycle flags drawn from its own
//! enumeration. Flags are intent markers: DELETE means removal has begun and
//! must complete, not that the object is gone.
//!
//! Allowed transitions are declared once per flag through [`Transition`] and
//! checked centrally by [`StateFlags::enable`] / [`StateFlags::disable`], so
//! handlers never hand-roll flag preconditions.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

/// Transition rule of a single flag
#[derive(Debug, Clone, Copy)]
pub struct Transition<F: 'static> {
    /// Flags that must already be set before this one can be enabled
    pub requires: &'static [F],
    /// Flags that must not be set when this one is enabled
    pub forbids: &'static [F],
    /// Once set, the flag can never be cleared
    pub sticky: bool,
}

impl<F: 'static> Transition<F> {
    pub const FREE: Transition<F> = Transition {
        requires: &[],
        forbids: &[],
        sticky: false,
    };
}

pub trait Flag: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Every variant, in bit order
    const ALL: &'static [Self];

    fn bit(self) -> u64;

    fn name(self) -> &'static str;

    fn transition(self) -> Transition<Self>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlagError {
    #[error("cannot set {flag}: requires {missing}")]
    MissingPrerequisite {
        flag: &'static str,
        missing: &'static str,
    },

    #[error("cannot set {flag} while {conflicting} is set")]
    Conflict {
        flag: &'static str,
        conflicting: &'static str,
    },

    #[error("{flag} cannot be cleared once set")]
    Sticky { flag: &'static str },

    #[error("unknown flag bits {bits:#x}")]
    UnknownBits { bits: u64 },
}

/// Bitset of lifecycle flags of one entity type
pub struct StateFlags<F> {
    bits: u64,
    _flag: PhantomData<F>,
}

impl<F: Flag> StateFlags<F> {
    pub fn empty() -> Self {
        Self {
            bits: 0,
            _flag: PhantomData,
        }
    }

    /// Builds a flag set without transition checks (initial state of a new object)
    pub fn with(flags: &[F]) -> Self {
        Self {
            bits: flags.iter().fold(0, |acc, f| acc | f.bit()),
            _flag: PhantomData,
        }
    }

    /// Restores a persisted bitset, rejecting bits no flag owns
    pub fn from_bits(bits: u64) -> Result<Self, FlagError> {
        let known = F::ALL.iter().fold(0, |acc, f| acc | f.bit());
        if bits & !known != 0 {
            return Err(FlagError::UnknownBits { bits: bits & !known });
        }
        Ok(Self {
            bits,
            _flag: PhantomData,
        })
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn is_set(&self, flag: F) -> bool {
        self.bits & flag.bit() != 0
    }

    pub fn is_any_set(&self, flags: &[F]) -> bool {
        flags.iter().any(|f| self.is_set(*f))
    }

    pub fn is_unset(&self, flag: F) -> bool {
        !self.is_set(flag)
    }

    /// Sets a flag after checking its transition rule. Setting an already set
    /// flag is a no-op.
    pub fn enable(&mut self, flag: F) -> Result<(), FlagError> {
        if self.is_set(flag) {
            return Ok(());
        }
        let rule = flag.transition();
        if let Some(missing) = rule.requires.iter().find(|f| !self.is_set(**f)) {
            return Err(FlagError::MissingPrerequisite {
                flag: flag.name(),
                missing: missing.name(),
            });
        }
        if let Some(conflicting) = rule.forbids.iter().find(|f| self.is_set(**f)) {
            return Err(FlagError::Conflict {
                flag: flag.name(),
                conflicting: conflicting.name(),
            });
        }
        self.bits |= flag.bit();
        Ok(())
    }

    pub fn enable_all(&mut self, flags: &[F]) -> Result<(), FlagError> {
        flags.iter().try_for_each(|f| self.enable(*f))
    }

    /// Clears a flag. Sticky flags refuse; clearing an unset flag is a no-op.
    pub fn disable(&mut self, flag: F) -> Result<(), FlagError> {
        if !self.is_set(flag) {
            return Ok(());
        }
        if flag.transition().sticky {
            return Err(FlagError::Sticky { flag: flag.name() });
        }
        self.bits &= !flag.bit();
        Ok(())
    }

    pub fn disable_all(&mut self, flags: &[F]) -> Result<(), FlagError> {
        flags.iter().try_for_each(|f| self.disable(*f))
    }

    pub fn iter(&self) -> impl Iterator<Item = F> + '_ {
        F::ALL.iter().copied().filter(move |f| self.is_set(*f))
    }

    pub fn names(&self) -> Vec<String> {
        self.iter().map(|f| f.name().to_string()).collect()
    }
}

impl<F: Flag> Default for StateFlags<F> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<F> Clone for StateFlags<F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F> Copy for StateFlags<F> {}

impl<F> PartialEq for StateFlags<F> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<F> Eq for StateFlags<F> {}

impl<F: Flag> fmt::Debug for StateFlags<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(Flag::name)).finish()
    }
}

impl<F> Serialize for StateFlags<F> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.bits)
    }
}

impl<'de, F: Flag> Deserialize<'de> for StateFlags<F> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u64::deserialize(deserializer)?;
        Self::from_bits(bits).map_err(serde::de::Error::custom)
    }
}

/// Declares a flag enum together with its [`Flag`] impl.
///
/// Each variant names its bit, its display label and its transition rule:
/// `Variant(bit) "LABEL" requires [..] forbids [..] sticky bool`.
macro_rules! lifecycle_flags {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $(
                $variant:ident($bit:literal) $label:literal
                requires [$($req:ident),*]
                forbids [$($forb:ident),*]
                sticky $sticky:literal
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $crate::domain::flags::Flag for $name {
            const ALL: &'static [Self] = &[$(Self::$variant),+];

            fn bit(self) -> u64 {
                match self {
                    $(Self::$variant => 1u64 << $bit),+
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }

            fn transition(self) -> $crate::domain::flags::Transition<Self> {
                match self {
                    $(Self::$variant => $crate::domain::flags::Transition {
                        requires: &[$(Self::$req),*],
                        forbids: &[$(Self::$forb),*],
                        sticky: $sticky,
                    }),+
                }
            }
        }
    };
}

pub(crate) use lifecycle_flags;

lifecycle_flags! {
    /// Flag shared by object types whose only lifecycle state is pending deletion
    pub enum DeleteFlag {
        Delete(0) "DELETE" requires [] forbids [] sticky true,
    }
}

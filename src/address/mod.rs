//! Hierarchical addressing for the coordinator -> agent -> worker -> test tree.
//!
//! An address is a level plus one index per level. Indices below the
//! address' own level are always zero, so the tuple fully determines the path
//! from the root. Ordering is structural: level first, then each index.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AddressError;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressLevel {
    Root,
    Agent,
    Worker,
    Test,
}

impl AddressLevel {
    #[must_use]
    pub const fn code(self) -> i8 {
        match self {
            AddressLevel::Root => 0,
            AddressLevel::Agent => 1,
            AddressLevel::Worker => 2,
            AddressLevel::Test => 3,
        }
    }

    /// Decodes a wire level code.
    ///
    /// # Errors
    ///
    /// Returns an error for codes outside `0..=3`.
    pub fn from_code(code: i8) -> Result<Self, AddressError> {
        match code {
            0 => Ok(AddressLevel::Root),
            1 => Ok(AddressLevel::Agent),
            2 => Ok(AddressLevel::Worker),
            3 => Ok(AddressLevel::Test),
            _ => Err(AddressError::UnknownLevel { code }),
        }
    }

    #[must_use]
    pub const fn child(self) -> Option<Self> {
        match self {
            AddressLevel::Root => Some(AddressLevel::Agent),
            AddressLevel::Agent => Some(AddressLevel::Worker),
            AddressLevel::Worker => Some(AddressLevel::Test),
            AddressLevel::Test => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SimulatorAddress {
    level: AddressLevel,
    agent_index: u32,
    worker_index: u32,
    test_index: u32,
}

impl SimulatorAddress {
    pub const COORDINATOR: SimulatorAddress = SimulatorAddress {
        level: AddressLevel::Root,
        agent_index: 0,
        worker_index: 0,
        test_index: 0,
    };

    /// Builds and validates an address from its raw parts.
    ///
    /// # Errors
    ///
    /// Returns an error when an index at or above `level` is zero, or an
    /// index below `level` is set.
    pub fn new(
        level: AddressLevel,
        agent_index: u32,
        worker_index: u32,
        test_index: u32,
    ) -> Result<Self, AddressError> {
        let address = Self {
            level,
            agent_index,
            worker_index,
            test_index,
        };
        address.validate()?;
        Ok(address)
    }

    #[must_use]
    pub const fn coordinator() -> Self {
        Self::COORDINATOR
    }

    /// # Errors
    ///
    /// Returns an error when `agent_index` is zero.
    pub fn agent(agent_index: u32) -> Result<Self, AddressError> {
        Self::new(AddressLevel::Agent, agent_index, 0, 0)
    }

    /// # Errors
    ///
    /// Returns an error when any index is zero.
    pub fn worker(agent_index: u32, worker_index: u32) -> Result<Self, AddressError> {
        Self::new(AddressLevel::Worker, agent_index, worker_index, 0)
    }

    /// # Errors
    ///
    /// Returns an error when any index is zero.
    pub fn test(agent_index: u32, worker_index: u32, test_index: u32) -> Result<Self, AddressError> {
        Self::new(AddressLevel::Test, agent_index, worker_index, test_index)
    }

    #[must_use]
    pub const fn level(&self) -> AddressLevel {
        self.level
    }

    #[must_use]
    pub const fn agent_index(&self) -> u32 {
        self.agent_index
    }

    #[must_use]
    pub const fn worker_index(&self) -> u32 {
        self.worker_index
    }

    #[must_use]
    pub const fn test_index(&self) -> u32 {
        self.test_index
    }

    /// Index this address carries at `level`, zero when `level` is root or
    /// below the address' own level.
    #[must_use]
    pub const fn index_at(&self, level: AddressLevel) -> u32 {
        match level {
            AddressLevel::Root => 0,
            AddressLevel::Agent => self.agent_index,
            AddressLevel::Worker => self.worker_index,
            AddressLevel::Test => self.test_index,
        }
    }

    /// Own-level index; zero for the coordinator.
    #[must_use]
    pub const fn own_index(&self) -> u32 {
        self.index_at(self.level)
    }

    /// Same tuple with the own-level index cleared.
    ///
    /// # Errors
    ///
    /// Returns `RootHasNoParent` for the coordinator address.
    pub fn parent(&self) -> Result<Self, AddressError> {
        match self.level {
            AddressLevel::Root => Err(AddressError::RootHasNoParent),
            AddressLevel::Agent => Ok(Self::COORDINATOR),
            AddressLevel::Worker => Ok(Self {
                level: AddressLevel::Agent,
                agent_index: self.agent_index,
                worker_index: 0,
                test_index: 0,
            }),
            AddressLevel::Test => Ok(Self {
                level: AddressLevel::Worker,
                agent_index: self.agent_index,
                worker_index: self.worker_index,
                test_index: 0,
            }),
        }
    }

    /// # Errors
    ///
    /// Returns an error for test addresses (leaves) and for a zero index.
    pub fn child(&self, index: u32) -> Result<Self, AddressError> {
        let Some(level) = self.level.child() else {
            return Err(AddressError::TestHasNoChildren {
                address: self.to_string(),
            });
        };
        let mut child = *self;
        child.level = level;
        match level {
            AddressLevel::Agent => child.agent_index = index,
            AddressLevel::Worker => child.worker_index = index,
            AddressLevel::Test => child.test_index = index,
            AddressLevel::Root => {}
        }
        child.validate()?;
        Ok(child)
    }

    /// True when `other` is a strict descendant of `self`.
    #[must_use]
    pub fn is_ancestor_of(&self, other: &SimulatorAddress) -> bool {
        if self.level >= other.level {
            return false;
        }
        [AddressLevel::Agent, AddressLevel::Worker, AddressLevel::Test]
            .into_iter()
            .filter(|level| *level <= self.level)
            .all(|level| self.index_at(level) == other.index_at(level))
    }

    /// Index of the direct child on the path from `self` to `descendant`.
    #[must_use]
    pub fn child_index_toward(&self, descendant: &SimulatorAddress) -> Option<u32> {
        if !self.is_ancestor_of(descendant) {
            return None;
        }
        self.level
            .child()
            .map(|level| descendant.index_at(level))
    }

    /// # Errors
    ///
    /// Returns an error when the index layout does not match the level.
    pub fn validate(&self) -> Result<(), AddressError> {
        for level in [AddressLevel::Agent, AddressLevel::Worker, AddressLevel::Test] {
            let value = self.index_at(level);
            if level <= self.level {
                if value == 0 {
                    return Err(AddressError::ZeroIndex { level });
                }
            } else if value != 0 {
                return Err(AddressError::UnexpectedIndex {
                    level,
                    own: self.level,
                    value,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for SimulatorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            AddressLevel::Root => f.write_str("C"),
            AddressLevel::Agent => write!(f, "A{}", self.agent_index),
            AddressLevel::Worker => write!(f, "A{}_W{}", self.agent_index, self.worker_index),
            AddressLevel::Test => write!(
                f,
                "A{}_W{}_T{}",
                self.agent_index, self.worker_index, self.test_index
            ),
        }
    }
}

impl FromStr for SimulatorAddress {
    type Err = AddressError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed == "C" {
            return Ok(Self::COORDINATOR);
        }
        let parse_error = || AddressError::Parse {
            value: value.to_owned(),
        };

        let mut indices = [0u32; 3];
        let mut depth = 0usize;
        for (position, part) in trimmed.split('_').enumerate() {
            let expected = match position {
                0 => 'A',
                1 => 'W',
                2 => 'T',
                _ => return Err(parse_error()),
            };
            let digits = part.strip_prefix(expected).ok_or_else(parse_error)?;
            let index = digits.parse::<u32>().map_err(|_err| parse_error())?;
            let slot = indices.get_mut(position).ok_or_else(parse_error)?;
            *slot = index;
            depth = position.saturating_add(1);
        }

        let level = match depth {
            1 => AddressLevel::Agent,
            2 => AddressLevel::Worker,
            3 => AddressLevel::Test,
            _ => return Err(parse_error()),
        };
        let [agent_index, worker_index, test_index] = indices;
        Self::new(level, agent_index, worker_index, test_index)
    }
}

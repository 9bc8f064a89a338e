//! Member roles
//!
//! Closed set, totally ordered by rank:
//! Owner (4) > Admin (3) > Member (2) > Reader (1) > Removed (0).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::wire::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Removed,
    Reader,
    Member,
    Admin,
    Owner,
}

impl Role {
    pub fn rank(self) -> u8 {
        match self {
            Role::Removed => 0,
            Role::Reader => 1,
            Role::Member => 2,
            Role::Admin => 3,
            Role::Owner => 4,
        }
    }

    pub fn from_rank(rank: u8) -> Result<Self, DecodeError> {
        Ok(match rank {
            0 => Role::Removed,
            1 => Role::Reader,
            2 => Role::Member,
            3 => Role::Admin,
            4 => Role::Owner,
            tag => return Err(DecodeError::UnknownTag { what: "role", tag }),
        })
    }

    /// May author data messages
    pub fn can_write(self) -> bool {
        self.rank() >= Role::Member.rank()
    }

    /// May issue AdmitKey / UpdateKey
    pub fn can_admit(self) -> bool {
        self.rank() >= Role::Admin.rank()
    }

    pub fn is_removed(self) -> bool {
        self == Role::Removed
    }
}

impl PartialOrd for Role {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Role {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Removed => "removed",
            Role::Reader => "reader",
            Role::Member => "member",
            Role::Admin => "admin",
            Role::Owner => "owner",
        };
        f.write_str(name)
    }
}

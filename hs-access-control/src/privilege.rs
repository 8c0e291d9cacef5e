//! Privilege levels.
//!
//! Levels form a total order, `None < View < Change < Owner`, so combining
//! privileges from several sources is a plain `max`.

use crate::error::AccessError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeLevel {
    /// No access
    #[default]
    None,
    /// Read-only access
    View,
    /// Can modify content and metadata
    Change,
    /// Full control, including sharing ownership and deletion
    Owner,
}

impl PrivilegeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivilegeLevel::None => "none",
            PrivilegeLevel::View => "view",
            PrivilegeLevel::Change => "change",
            PrivilegeLevel::Owner => "owner",
        }
    }

    pub fn is_none(&self) -> bool {
        *self == PrivilegeLevel::None
    }

    pub fn can_view(&self) -> bool {
        *self >= PrivilegeLevel::View
    }

    pub fn can_change(&self) -> bool {
        *self >= PrivilegeLevel::Change
    }

    pub fn is_owner(&self) -> bool {
        *self == PrivilegeLevel::Owner
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrivilegeLevel {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(PrivilegeLevel::None),
            "view" => Ok(PrivilegeLevel::View),
            "change" => Ok(PrivilegeLevel::Change),
            "owner" => Ok(PrivilegeLevel::Owner),
            other => Err(AccessError::InvalidPrivilege(format!(
                "unknown privilege level '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_order() {
        assert!(PrivilegeLevel::Owner > PrivilegeLevel::Change);
        assert!(PrivilegeLevel::Change > PrivilegeLevel::View);
        assert!(PrivilegeLevel::View > PrivilegeLevel::None);
        assert_eq!(
            PrivilegeLevel::View.max(PrivilegeLevel::Change),
            PrivilegeLevel::Change
        );
    }

    #[test]
    fn test_parse_round_trip() {
        for level in [PrivilegeLevel::View, PrivilegeLevel::Change, PrivilegeLevel::Owner] {
            assert_eq!(level.as_str().parse::<PrivilegeLevel>().unwrap(), level);
        }
        assert!("admin".parse::<PrivilegeLevel>().is_err());
    }
}

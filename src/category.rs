// 🏷️ Category - The fixed set of tracked history categories
//
// Each user carries one legacy date list per category and one slice of the
// event log per category. The set is closed: a new category is a code
// change, never configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ReconcileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    /// Any relapse
    #[serde(rename = "relapse")]
    Relapse,

    #[serde(rename = "mastOnly")]
    MastOnly,

    #[serde(rename = "pornOnly")]
    PornOnly,
}

impl Category {
    /// Every category, in display order
    pub const ALL: [Category; 3] = [Category::Relapse, Category::MastOnly, Category::PornOnly];

    /// Storage name, as written in both the legacy records and the event log
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Relapse => "relapse",
            Category::MastOnly => "mastOnly",
            Category::PornOnly => "pornOnly",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relapse" => Ok(Category::Relapse),
            "mastOnly" | "mast-only" | "mast_only" => Ok(Category::MastOnly),
            "pornOnly" | "porn-only" | "porn_only" => Ok(Category::PornOnly),
            other => Err(ReconcileError::UnknownCategory(other.to_string())),
        }
    }
}

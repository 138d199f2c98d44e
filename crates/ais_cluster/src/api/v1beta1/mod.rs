use core::fmt;
use std::fmt::Display;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod aistore;

/// One of the two daemon kinds that make up a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Gateway daemons. Stateless and interchangeable.
    Proxy,
    /// Storage daemons. Each replica owns its own data.
    Target,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Proxy, Role::Target];

    /// Token used in every generated resource name.
    pub fn token(&self) -> &'static str {
        match self {
            Role::Proxy => "proxy",
            Role::Target => "target",
        }
    }

    pub fn function(&self) -> &'static str {
        match self {
            Role::Proxy => "gateway",
            Role::Target => "storage",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

use serde::{Deserialize, Serialize};

use super::ServiceKey;

/// Request path criterion of a routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum PathMatch {
    Exact(String),
    Prefix(String),
    Regex(String),
}

/// String criterion applied to a header value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum StringMatch {
    Exact(String),
    Prefix(String),
    Regex(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMatch {
    pub name: String,
    pub matcher: StringMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedDestination {
    pub service: ServiceKey,
    #[serde(default = "default_destination_weight")]
    pub weight: u32,
}

fn default_destination_weight() -> u32 {
    100
}

/// Traffic-routing rule owned by a service; matches requests addressed to
/// that service and splits them across destinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub name: String,
    /// Lower values are evaluated first.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub path: Option<PathMatch>,
    #[serde(default)]
    pub headers: Vec<HeaderMatch>,
    #[serde(default)]
    pub destinations: Vec<WeightedDestination>,
}

impl RoutingRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            path: None,
            headers: Vec::new(),
            destinations: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_path(mut self, path: PathMatch) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, matcher: StringMatch) -> Self {
        self.headers.push(HeaderMatch { name: name.into(), matcher });
        self
    }

    pub fn with_destination(mut self, service: ServiceKey, weight: u32) -> Self {
        self.destinations.push(WeightedDestination { service, weight });
        self
    }
}

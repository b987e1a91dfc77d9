//! Broker route descriptors and per-environment route sets

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One broker endpoint plus the queue/topic name on it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteDescriptor {
    /// Broker endpoint address, e.g. `nats://10.0.0.4:4222`
    pub route: String,
    /// Topic or queue name
    pub name: String,
    /// Backend specific knobs (channel names, queue groups, ...)
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl RouteDescriptor {
    pub fn new(route: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            name: name.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Same endpoint, different queue name
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            route: self.route.clone(),
            name: name.into(),
            parameters: self.parameters.clone(),
        }
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }
}

impl fmt::Display for RouteDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.route, self.name)
    }
}

/// Client routes for one environment/machine combination
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRouteSet {
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub machine_name: Option<String>,
    /// Requests fan out to every send route
    #[serde(default)]
    pub send: Vec<RouteDescriptor>,
    /// Where replies for this client arrive
    #[serde(default)]
    pub receive: Option<RouteDescriptor>,
}

/// Server routes for one environment/machine combination
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRouteSet {
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub machine_name: Option<String>,
    /// One listener per receive route
    #[serde(default)]
    pub receive: Vec<RouteDescriptor>,
    /// Reply destinations for raw requests, which carry no routes of their own
    #[serde(default)]
    pub send: Vec<RouteDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_name_keeps_endpoint() {
        let route = RouteDescriptor::new("memory://bus", "replies").with_parameter("channel", "a");
        let mangled = route.with_name("replies_42");

        assert_eq!(mangled.route, "memory://bus");
        assert_eq!(mangled.name, "replies_42");
        assert_eq!(mangled.parameter("channel"), Some("a"));
        assert_eq!(mangled.to_string(), "memory://bus/replies_42");
    }
}

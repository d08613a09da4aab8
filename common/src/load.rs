use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Load factors within this distance of each other are considered equal when
/// ranking hosts; the tiebreak then prefers the bigger machine.
const LOAD_FACTOR_EPSILON: f32 = 0.01;

/// Current and maximum load of one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeLoad {
    pub host: String,
    pub current_load: f32,
    pub max_load: f32,
}

impl NodeLoad {
    pub fn new(host: impl Into<String>, current_load: f32, max_load: f32) -> Self {
        Self {
            host: host.into(),
            current_load,
            max_load,
        }
    }

    /// Fraction of this host's capacity in use. A factor >= 1.0 means the
    /// host is maxed out.
    pub fn load_factor(&self) -> f32 {
        if self.max_load <= 0.0 {
            return f32::MAX;
        }
        self.current_load / self.max_load
    }

    pub fn exceeds_maximum(&self) -> bool {
        self.load_factor() >= 1.0
    }
}

/// Per-host load snapshot used for one dispatch round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemLoad {
    nodes: HashMap<String, NodeLoad>,
}

impl SystemLoad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: NodeLoad) {
        self.nodes.insert(node.host.clone(), node);
    }

    pub fn get(&self, host: &str) -> Option<&NodeLoad> {
        self.nodes.get(host)
    }

    /// Account for a job that was just accepted by `host`, so the rest of the
    /// round sees the updated figure.
    pub fn update_node_load(&mut self, host: &str, delta: f32) -> bool {
        match self.nodes.get_mut(host) {
            Some(node) => {
                node.current_load += delta;
                true
            }
            None => false,
        }
    }

    pub fn hosts(&self) -> impl Iterator<Item = &NodeLoad> {
        self.nodes.values()
    }

    /// Rank two hosts for dispatch: lower load factor first; when the factors
    /// are about the same, the host with the larger maximum goes first.
    pub fn compare_hosts(&self, host_a: &str, host_b: &str) -> std::cmp::Ordering {
        let (Some(a), Some(b)) = (self.get(host_a), self.get(host_b)) else {
            return std::cmp::Ordering::Equal;
        };
        if (a.load_factor() - b.load_factor()).abs() <= LOAD_FACTOR_EPSILON {
            return b
                .max_load
                .partial_cmp(&a.max_load)
                .unwrap_or(std::cmp::Ordering::Equal);
        }
        a.load_factor()
            .partial_cmp(&b.load_factor())
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn load_factor_handles_zero_max() {
        let node = NodeLoad::new("http://a", 1.0, 0.0);
        assert!(node.exceeds_maximum());
    }

    #[test]
    fn lower_factor_wins() {
        let mut load = SystemLoad::new();
        load.add(NodeLoad::new("http://a", 1.0, 4.0));
        load.add(NodeLoad::new("http://b", 3.0, 4.0));
        assert_eq!(load.compare_hosts("http://a", "http://b"), Ordering::Less);
    }

    #[test]
    fn tie_prefers_bigger_host() {
        // Equal factors (0.5), so the 8-core class machine should come first.
        let mut load = SystemLoad::new();
        load.add(NodeLoad::new("http://small", 2.0, 4.0));
        load.add(NodeLoad::new("http://big", 4.0, 8.0));
        assert_eq!(
            load.compare_hosts("http://big", "http://small"),
            Ordering::Less
        );
    }

    #[test]
    fn accepted_job_shifts_the_ranking() {
        let mut load = SystemLoad::new();
        load.add(NodeLoad::new("http://a", 0.0, 2.0));
        load.add(NodeLoad::new("http://b", 0.5, 2.0));
        assert_eq!(load.compare_hosts("http://a", "http://b"), Ordering::Less);
        assert!(load.update_node_load("http://a", 1.5));
        assert_eq!(load.compare_hosts("http://a", "http://b"), Ordering::Greater);
    }
}

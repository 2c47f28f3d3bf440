//! Read routing strategies
//!
//! A closed set of algorithms behind one `select` contract. Each strategy
//! keeps its own cursor, rebuilt whenever the membership of the enabled set
//! changes so it never points at a node that left.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::core::node_registry::Node;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingAlgorithm {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastResponseTime,
}

impl fmt::Display for LoadBalancingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadBalancingAlgorithm::RoundRobin => "round_robin",
            LoadBalancingAlgorithm::WeightedRoundRobin => "weighted_round_robin",
            LoadBalancingAlgorithm::LeastResponseTime => "least_response_time",
        };
        f.write_str(name)
    }
}

impl FromStr for LoadBalancingAlgorithm {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "round_robin" | "rr" => Ok(LoadBalancingAlgorithm::RoundRobin),
            "weighted_round_robin" | "weighted" | "wrr" => {
                Ok(LoadBalancingAlgorithm::WeightedRoundRobin)
            }
            "least_response_time" | "least_time" | "lrt" => {
                Ok(LoadBalancingAlgorithm::LeastResponseTime)
            }
            other => Err(AppError::ConfigError(format!(
                "Unknown routing strategy: {}",
                other
            ))),
        }
    }
}

/// Position in the enabled set, tied to the membership it was built for
#[derive(Debug, Clone, Default)]
pub struct RoutingCursor {
    members: Vec<String>,
    index: usize,
    /// Selections already given to the node at `index` in this cycle
    served: u32,
}

impl RoutingCursor {
    /// Rebuild against a new membership.
    ///
    /// The pointer stays on the same node when it is still enabled and
    /// restarts at the first node otherwise.
    fn sync(&mut self, enabled: &[Node]) {
        let unchanged = self.members.len() == enabled.len()
            && self.members.iter().zip(enabled).all(|(m, n)| *m == n.name);
        if unchanged {
            return;
        }

        let current = self.members.get(self.index).cloned();
        self.members = enabled.iter().map(|n| n.name.clone()).collect();

        match current.and_then(|name| self.members.iter().position(|m| *m == name)) {
            Some(position) => self.index = position,
            None => {
                self.index = 0;
                self.served = 0;
            }
        }
    }

    fn advance(&mut self) {
        self.served = 0;
        self.index = (self.index + 1) % self.members.len().max(1);
    }
}

/// Routing strategy with its private cursor
#[derive(Debug, Clone)]
pub enum RoutingStrategy {
    RoundRobin(RoutingCursor),
    WeightedRoundRobin(RoutingCursor),
    LeastResponseTime,
}

impl RoutingStrategy {
    pub fn new(algorithm: LoadBalancingAlgorithm) -> Self {
        match algorithm {
            LoadBalancingAlgorithm::RoundRobin => {
                RoutingStrategy::RoundRobin(RoutingCursor::default())
            }
            LoadBalancingAlgorithm::WeightedRoundRobin => {
                RoutingStrategy::WeightedRoundRobin(RoutingCursor::default())
            }
            LoadBalancingAlgorithm::LeastResponseTime => RoutingStrategy::LeastResponseTime,
        }
    }

    pub fn algorithm(&self) -> LoadBalancingAlgorithm {
        match self {
            RoutingStrategy::RoundRobin(_) => LoadBalancingAlgorithm::RoundRobin,
            RoutingStrategy::WeightedRoundRobin(_) => LoadBalancingAlgorithm::WeightedRoundRobin,
            RoutingStrategy::LeastResponseTime => LoadBalancingAlgorithm::LeastResponseTime,
        }
    }

    /// Pick one node name from the enabled set
    pub fn select(&mut self, enabled: &[Node]) -> Result<String> {
        if enabled.is_empty() {
            return Err(AppError::NoAvailableNode(
                "No enabled database nodes available for SELECT".to_string(),
            ));
        }

        let selected = match self {
            RoutingStrategy::RoundRobin(cursor) => {
                cursor.sync(enabled);
                let node = &enabled[cursor.index];
                cursor.advance();
                node
            }
            RoutingStrategy::WeightedRoundRobin(cursor) => {
                cursor.sync(enabled);
                let node = &enabled[cursor.index];
                cursor.served += 1;
                if cursor.served >= node.weight {
                    cursor.advance();
                }
                node
            }
            // min_by_key keeps the first of equal keys, i.e. registration order
            RoutingStrategy::LeastResponseTime => enabled
                .iter()
                .min_by_key(|n| n.last_latency.unwrap_or(Duration::MAX))
                .unwrap_or(&enabled[0]),
        };

        Ok(selected.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node_registry::NodeState;
    use crate::infrastructure::memory_driver::MemoryDriver;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn node(name: &str, weight: u32) -> Node {
        Node {
            name: name.to_string(),
            driver: Arc::new(MemoryDriver::new(name)),
            weight,
            state: NodeState::Up,
            disable_reason: None,
            last_probe: None,
            last_latency: None,
            queries_served: 0,
        }
    }

    fn with_latency(mut node: Node, millis: u64) -> Node {
        node.last_latency = Some(Duration::from_millis(millis));
        node
    }

    fn picks(strategy: &mut RoutingStrategy, enabled: &[Node], count: usize) -> Vec<String> {
        (0..count)
            .map(|_| strategy.select(enabled).unwrap())
            .collect()
    }

    #[test]
    fn test_empty_set_has_no_available_node() {
        for algorithm in [
            LoadBalancingAlgorithm::RoundRobin,
            LoadBalancingAlgorithm::WeightedRoundRobin,
            LoadBalancingAlgorithm::LeastResponseTime,
        ] {
            let mut strategy = RoutingStrategy::new(algorithm);
            assert!(matches!(
                strategy.select(&[]),
                Err(AppError::NoAvailableNode(_))
            ));
        }
    }

    #[test]
    fn test_round_robin_cycles_in_registration_order() {
        let enabled = vec![node("a", 1), node("b", 1), node("c", 1)];
        let mut strategy = RoutingStrategy::new(LoadBalancingAlgorithm::RoundRobin);
        assert_eq!(
            picks(&mut strategy, &enabled, 4),
            vec!["a", "b", "c", "a"]
        );
    }

    #[test]
    fn test_round_robin_survives_membership_change() {
        let mut strategy = RoutingStrategy::new(LoadBalancingAlgorithm::RoundRobin);
        let all = vec![node("a", 1), node("b", 1), node("c", 1)];
        assert_eq!(picks(&mut strategy, &all, 1), vec!["a"]);

        // pointer was on b; b leaves so the cursor restarts
        let without_b = vec![node("a", 1), node("c", 1)];
        assert_eq!(picks(&mut strategy, &without_b, 3), vec!["a", "c", "a"]);

        // pointer is on c and c is still enabled
        assert_eq!(picks(&mut strategy, &all, 3), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_weighted_round_robin_pattern() {
        let enabled = vec![node("A", 3), node("B", 1), node("C", 1)];
        let mut strategy = RoutingStrategy::new(LoadBalancingAlgorithm::WeightedRoundRobin);
        assert_eq!(
            picks(&mut strategy, &enabled, 10),
            vec!["A", "A", "A", "B", "C", "A", "A", "A", "B", "C"]
        );
    }

    #[test]
    fn test_weighted_round_robin_any_window_is_proportional() {
        let enabled = vec![node("db1", 3), node("db2", 1), node("db3", 1), node("db4", 2)];
        let total: u32 = enabled.iter().map(|n| n.weight).sum();
        let mut strategy = RoutingStrategy::new(LoadBalancingAlgorithm::WeightedRoundRobin);
        let sequence = picks(&mut strategy, &enabled, (total * 4) as usize);

        for start in 0..(total as usize * 3) {
            let mut counts: HashMap<&str, u32> = HashMap::new();
            for name in &sequence[start..start + total as usize] {
                *counts.entry(name.as_str()).or_default() += 1;
            }
            for n in &enabled {
                assert_eq!(counts.get(n.name.as_str()).copied().unwrap_or(0), n.weight);
            }
        }
    }

    #[test]
    fn test_weighted_round_robin_restarts_when_node_leaves() {
        let mut strategy = RoutingStrategy::new(LoadBalancingAlgorithm::WeightedRoundRobin);
        let all = vec![node("A", 2), node("B", 1), node("C", 1)];
        assert_eq!(picks(&mut strategy, &all, 3), vec!["A", "A", "B"]);

        let without_c = vec![node("A", 2), node("B", 1)];
        assert_eq!(picks(&mut strategy, &without_c, 3), vec!["A", "A", "B"]);
    }

    #[test]
    fn test_least_response_time() {
        let enabled = vec![
            with_latency(node("a", 1), 40),
            with_latency(node("b", 1), 5),
            with_latency(node("c", 1), 20),
        ];
        let mut strategy = RoutingStrategy::new(LoadBalancingAlgorithm::LeastResponseTime);
        assert_eq!(picks(&mut strategy, &enabled, 2), vec!["b", "b"]);
    }

    #[test]
    fn test_least_response_time_ties_and_unobserved() {
        let enabled = vec![
            node("unobserved", 1),
            with_latency(node("first", 1), 10),
            with_latency(node("second", 1), 10),
        ];
        let mut strategy = RoutingStrategy::new(LoadBalancingAlgorithm::LeastResponseTime);
        assert_eq!(strategy.select(&enabled).unwrap(), "first");

        let none_observed = vec![node("x", 1), node("y", 1)];
        assert_eq!(strategy.select(&none_observed).unwrap(), "x");
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!(
            "weighted_round_robin".parse::<LoadBalancingAlgorithm>().unwrap(),
            LoadBalancingAlgorithm::WeightedRoundRobin
        );
        assert_eq!(
            "least-response-time".parse::<LoadBalancingAlgorithm>().unwrap(),
            LoadBalancingAlgorithm::LeastResponseTime
        );
        assert!("random".parse::<LoadBalancingAlgorithm>().is_err());
        assert_eq!(
            RoutingStrategy::new(LoadBalancingAlgorithm::RoundRobin).algorithm(),
            LoadBalancingAlgorithm::RoundRobin
        );
    }
}

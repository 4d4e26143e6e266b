//! Node selection policies
//!
//! The controller hands the current active set to a [`SelectionPolicy`] for
//! every routed connection. Policies only keep positional state, never a copy
//! of the membership, so the pool can grow and shrink underneath them.

use crate::error::PoolError;
use crate::node::Node;
use rand::Rng;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Picks one node out of the active set
pub trait SelectionPolicy: Send + Sync {
    /// Choose a node. Fails with `NoBackendsAvailable` on an empty slice.
    fn choose(&self, nodes: &[Arc<Node>]) -> Result<Arc<Node>, PoolError>;

    /// Name used in logs and the admin API
    fn name(&self) -> &'static str;
}

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalanceStrategy {
    /// Round-robin: distribute connections evenly in order
    #[default]
    RoundRobin,
    /// Least connections: select the node with fewest attached connections
    LeastConnections,
    /// Random: uniformly pick a node
    Random,
}

impl LoadBalanceStrategy {
    pub fn build(self) -> Box<dyn SelectionPolicy> {
        match self {
            LoadBalanceStrategy::RoundRobin => Box::new(RoundRobin::new()),
            LoadBalanceStrategy::LeastConnections => Box::new(LeastConnections),
            LoadBalanceStrategy::Random => Box::new(RandomChoice),
        }
    }
}

/// Cycles through the active set in order, starting at index 0.
///
/// The cursor survives membership changes. When the set shrinks below the
/// cursor, the next selection wraps to index 0.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next index for a set of `len` nodes
    fn next_index(&self, len: usize) -> usize {
        let previous = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                Some(if cursor >= len { 1 } else { cursor + 1 })
            })
            // The closure never returns None
            .unwrap_or_else(|current| current);

        if previous >= len {
            0
        } else {
            previous
        }
    }
}

impl SelectionPolicy for RoundRobin {
    fn choose(&self, nodes: &[Arc<Node>]) -> Result<Arc<Node>, PoolError> {
        if nodes.is_empty() {
            return Err(PoolError::NoBackendsAvailable);
        }
        let index = self.next_index(nodes.len());
        Ok(Arc::clone(&nodes[index]))
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

/// Picks the node with the fewest attached connections; ties go to the
/// earliest node in the active order.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl SelectionPolicy for LeastConnections {
    fn choose(&self, nodes: &[Arc<Node>]) -> Result<Arc<Node>, PoolError> {
        nodes
            .iter()
            .min_by_key(|node| node.connection_count())
            .cloned()
            .ok_or(PoolError::NoBackendsAvailable)
    }

    fn name(&self) -> &'static str {
        "least-connections"
    }
}

/// Picks a node uniformly at random
#[derive(Debug, Default)]
pub struct RandomChoice;

impl SelectionPolicy for RandomChoice {
    fn choose(&self, nodes: &[Arc<Node>]) -> Result<Arc<Node>, PoolError> {
        if nodes.is_empty() {
            return Err(PoolError::NoBackendsAvailable);
        }
        let index = rand::thread_rng().gen_range(0..nodes.len());
        Ok(Arc::clone(&nodes[index]))
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn nodes(ports: &[u16]) -> Vec<Arc<Node>> {
        ports.iter().map(|&p| Arc::new(Node::new(p))).collect()
    }

    fn ports_of(picks: &[Arc<Node>]) -> Vec<u16> {
        picks.iter().map(|n| n.port()).collect()
    }

    #[test]
    fn test_round_robin_visits_each_node_in_order() {
        let policy = RoundRobin::new();
        let set = nodes(&[8080, 8081, 8082]);

        let picks: Vec<_> = (0..6).map(|_| policy.choose(&set).unwrap()).collect();
        assert_eq!(
            ports_of(&picks),
            vec![8080, 8081, 8082, 8080, 8081, 8082]
        );
    }

    #[test]
    fn test_round_robin_n_calls_cover_all_nodes_once() {
        let policy = RoundRobin::new();
        let set = nodes(&[1, 2, 3, 4, 5]);

        // Start from an arbitrary position
        policy.choose(&set).unwrap();
        policy.choose(&set).unwrap();

        let seen: HashSet<u16> = (0..set.len())
            .map(|_| policy.choose(&set).unwrap().port())
            .collect();
        assert_eq!(seen.len(), set.len());
    }

    #[test]
    fn test_round_robin_wraps_when_set_shrinks() {
        let policy = RoundRobin::new();
        let large = nodes(&[1, 2, 3, 4]);
        for _ in 0..3 {
            policy.choose(&large).unwrap();
        }

        // Cursor now points at index 3, past the end of the smaller set
        let small = nodes(&[10, 11]);
        assert_eq!(policy.choose(&small).unwrap().port(), 10);
        assert_eq!(policy.choose(&small).unwrap().port(), 11);
        assert_eq!(policy.choose(&small).unwrap().port(), 10);
    }

    #[test]
    fn test_round_robin_keeps_position_when_set_grows() {
        let policy = RoundRobin::new();
        let small = nodes(&[1, 2]);
        policy.choose(&small).unwrap();

        let large = nodes(&[1, 2, 3]);
        assert_eq!(policy.choose(&large).unwrap().port(), 2);
        assert_eq!(policy.choose(&large).unwrap().port(), 3);
        assert_eq!(policy.choose(&large).unwrap().port(), 1);
    }

    #[test]
    fn test_round_robin_concurrent_callers_share_cursor() {
        let policy = Arc::new(RoundRobin::new());
        let set = Arc::new(nodes(&[1, 2, 3, 4]));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let policy = Arc::clone(&policy);
                let set = Arc::clone(&set);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| policy.choose(&set).unwrap().port())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counts = [0usize; 4];
        for handle in handles {
            for port in handle.join().unwrap() {
                counts[(port - 1) as usize] += 1;
            }
        }

        // 400 picks over 4 nodes with a shared cursor land exactly evenly
        assert_eq!(counts, [100, 100, 100, 100]);
    }

    #[test]
    fn test_empty_set_fails_fast() {
        let empty: Vec<Arc<Node>> = Vec::new();

        for strategy in [
            LoadBalanceStrategy::RoundRobin,
            LoadBalanceStrategy::LeastConnections,
            LoadBalanceStrategy::Random,
        ] {
            let policy = strategy.build();
            assert!(matches!(
                policy.choose(&empty),
                Err(PoolError::NoBackendsAvailable)
            ));
        }
    }

    #[test]
    fn test_least_connections() {
        let policy = LeastConnections;
        let set = nodes(&[1, 2, 3]);

        let _a = set[0].connect();
        let _b = set[0].connect();
        let _c = set[2].connect();

        assert_eq!(policy.choose(&set).unwrap().port(), 2);

        let _d = set[1].connect();
        let _e = set[1].connect();
        // Node 3 now has the fewest
        assert_eq!(policy.choose(&set).unwrap().port(), 3);
    }

    #[test]
    fn test_least_connections_tie_goes_to_first() {
        let policy = LeastConnections;
        let set = nodes(&[1, 2, 3]);
        assert_eq!(policy.choose(&set).unwrap().port(), 1);
    }

    #[test]
    fn test_random_stays_in_bounds() {
        let policy = RandomChoice;
        let set = nodes(&[1, 2, 3]);
        for _ in 0..100 {
            let port = policy.choose(&set).unwrap().port();
            assert!((1..=3).contains(&port));
        }
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(LoadBalanceStrategy::RoundRobin.build().name(), "round-robin");
        assert_eq!(
            LoadBalanceStrategy::LeastConnections.build().name(),
            "least-connections"
        );
        assert_eq!(LoadBalanceStrategy::Random.build().name(), "random");
    }
}

//! Relay forwarding table
//!
//! Bidirectional association between two (connection, circuit) pairs, held
//! by an intermediate hop. Entries are always inserted and removed as a
//! symmetric pair; an entry exists at a node only when that node is not an
//! endpoint of the logical path.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{CircuitId, ConnId};

/// One side of a forwarding association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteEndpoint {
    pub conn: ConnId,
    pub circuit: CircuitId,
}

impl RouteEndpoint {
    pub fn new(conn: ConnId, circuit: CircuitId) -> Self {
        Self { conn, circuit }
    }
}

/// Symmetric (connection, circuit) forwarding table.
#[derive(Default)]
pub struct RelayTable {
    inner: Mutex<HashMap<RouteEndpoint, RouteEndpoint>>,
}

impl RelayTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert both directions of an association.
    pub fn set(&self, a: RouteEndpoint, b: RouteEndpoint) {
        let mut inner = self.inner.lock().expect("poisoned lock");
        inner.insert(a, b);
        inner.insert(b, a);
    }

    /// Look up the paired side for one direction.
    pub fn get(&self, src: RouteEndpoint) -> Option<RouteEndpoint> {
        self.inner.lock().expect("poisoned lock").get(&src).copied()
    }

    /// Remove both directions. Returns the paired side, if any.
    pub fn delete(&self, src: RouteEndpoint) -> Option<RouteEndpoint> {
        let mut inner = self.inner.lock().expect("poisoned lock");
        let dst = inner.remove(&src)?;
        inner.remove(&dst);
        Some(dst)
    }

    /// Remove every pair referencing the given connection. Returns the
    /// removed pairs so the caller can propagate teardown to the far sides.
    pub fn closed(&self, conn: ConnId) -> Vec<(RouteEndpoint, RouteEndpoint)> {
        let mut inner = self.inner.lock().expect("poisoned lock");
        let keys: Vec<RouteEndpoint> = inner
            .iter()
            .filter(|(src, dst)| src.conn == conn || dst.conn == conn)
            .map(|(src, _)| *src)
            .collect();

        let mut removed = Vec::new();
        for src in keys {
            if let Some(dst) = inner.remove(&src) {
                inner.remove(&dst);
                // Report each pair once, from the side on the closed
                // connection.
                if src.conn == conn {
                    removed.push((src, dst));
                } else {
                    removed.push((dst, src));
                }
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("poisoned lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Used on restart.
    pub fn clear(&self) {
        self.inner.lock().expect("poisoned lock").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetry() {
        let table = RelayTable::new();
        let a = RouteEndpoint::new(1, 101);
        let b = RouteEndpoint::new(2, 100);

        table.set(a, b);
        assert_eq!(table.get(a), Some(b));
        assert_eq!(table.get(b), Some(a));

        assert_eq!(table.delete(a), Some(b));
        assert_eq!(table.get(a), None);
        assert_eq!(table.get(b), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_delete_from_either_side() {
        let table = RelayTable::new();
        let a = RouteEndpoint::new(1, 7);
        let b = RouteEndpoint::new(3, 8);

        table.set(a, b);
        assert_eq!(table.delete(b), Some(a));
        assert!(table.is_empty());
    }

    #[test]
    fn test_closed_sweeps_connection() {
        let table = RelayTable::new();
        let a1 = RouteEndpoint::new(1, 11);
        let b1 = RouteEndpoint::new(2, 21);
        let a2 = RouteEndpoint::new(1, 13);
        let b2 = RouteEndpoint::new(3, 31);
        let c = RouteEndpoint::new(4, 41);
        let d = RouteEndpoint::new(5, 51);

        table.set(a1, b1);
        table.set(a2, b2);
        table.set(c, d);

        let mut removed = table.closed(1);
        removed.sort_by_key(|(src, _)| src.circuit);
        assert_eq!(removed, vec![(a1, b1), (a2, b2)]);

        // The unrelated pair survives.
        assert_eq!(table.get(c), Some(d));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_closed_reports_far_side_closures() {
        let table = RelayTable::new();
        let a = RouteEndpoint::new(1, 11);
        let b = RouteEndpoint::new(2, 21);
        table.set(a, b);

        // Closing the far-side connection still removes the pair, reported
        // from the closed side.
        let removed = table.closed(2);
        assert_eq!(removed, vec![(b, a)]);
        assert!(table.is_empty());
    }
}

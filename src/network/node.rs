use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    addr: String,
}

impl Node {
    fn new(addr: String) -> Node {
        Node { addr }
    }

    pub fn get_addr(&self) -> &str {
        self.addr.as_str()
    }
}

/// Known peers, in the order they were learned.
#[derive(Default)]
pub struct Nodes {
    inner: RwLock<Vec<Node>>,
}

impl Nodes {
    pub fn new() -> Nodes {
        Nodes::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Node>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Node>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true when `addr` was not known before.
    pub fn add_node(&self, addr: &str) -> bool {
        let mut inner = self.write();
        if inner.iter().any(|x| x.get_addr() == addr) {
            return false;
        }
        inner.push(Node::new(addr.to_string()));
        true
    }

    pub fn evict_node(&self, addr: &str) {
        self.write().retain(|x| x.get_addr() != addr);
    }

    /// Known addresses other than the ones in `exclude`.
    pub fn addresses_except(&self, exclude: &[&str]) -> Vec<String> {
        self.read()
            .iter()
            .map(|node| node.get_addr())
            .filter(|addr| !exclude.contains(addr))
            .map(str::to_string)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn node_is_known(&self, addr: &str) -> bool {
        self.read().iter().any(|x| x.get_addr() == addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_evict() {
        let nodes = Nodes::new();
        assert!(nodes.is_empty());
        assert!(nodes.add_node("127.0.0.1:3000"));
        assert!(!nodes.add_node("127.0.0.1:3000"));
        assert!(nodes.add_node("127.0.0.1:3001"));
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes.addresses_except(&[]), vec!["127.0.0.1:3000", "127.0.0.1:3001"]);

        nodes.evict_node("127.0.0.1:3000");
        assert!(!nodes.node_is_known("127.0.0.1:3000"));
        assert!(nodes.node_is_known("127.0.0.1:3001"));
    }

    #[test]
    fn test_addresses_except() {
        let nodes = Nodes::new();
        for addr in ["a:1", "b:2", "c:3"] {
            nodes.add_node(addr);
        }
        assert_eq!(nodes.addresses_except(&["b:2"]), vec!["a:1", "c:3"]);
        assert_eq!(nodes.len(), 3);
    }
}

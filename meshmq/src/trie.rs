use std::fmt;
use std::hash::Hash;

use crate::topic::{Level, Topic};
use crate::types::HashMap;

pub type TopicTree<K, V> = Node<K, V>;

/// Level-indexed tree of topic filters.
///
/// Every node stands for one filter level; values stored on a node belong to the filter
/// spelled by the path from the root. Values are keyed so that re-inserting under the
/// same key replaces instead of duplicating.
pub struct Node<K, V> {
    values: HashMap<K, V>,
    branches: HashMap<Level, Node<K, V>>,
}

impl<K, V> Default for Node<K, V> {
    #[inline]
    fn default() -> Node<K, V> {
        Self { values: HashMap::default(), branches: HashMap::default() }
    }
}

impl<K, V> Node<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Returns the value previously stored under `key` for this filter.
    #[inline]
    pub fn insert(&mut self, topic_filter: &Topic, key: K, value: V) -> Option<V> {
        let mut node = self;
        for level in topic_filter.levels() {
            node = node.branches.entry(level.clone()).or_default();
        }
        node.values.insert(key, value)
    }

    /// Removes `key` from the filter's node and prunes branches left empty.
    #[inline]
    pub fn remove(&mut self, topic_filter: &Topic, key: &K) -> Option<V> {
        self._remove(topic_filter.levels(), key)
    }

    fn _remove(&mut self, path: &[Level], key: &K) -> Option<V> {
        let Some((first, rest)) = path.split_first() else {
            return self.values.remove(key);
        };
        let child = self.branches.get_mut(first)?;
        let removed = child._remove(rest, key);
        if child.is_empty() {
            self.branches.remove(first);
        }
        removed
    }

    /// Collects the values of every filter that selects the topic name `topic`.
    #[inline]
    pub fn matches(&self, topic: &[Level], out: &mut Vec<V>) {
        self._matches(topic, true, out)
    }

    fn _matches(&self, path: &[Level], root: bool, out: &mut Vec<V>) {
        let Some((first, rest)) = path.split_first() else {
            // `a/#` also selects `a`
            if let Some(n) = self.branches.get(&Level::MultiWildcard) {
                out.extend(n.values.values().cloned());
            }
            out.extend(self.values.values().cloned());
            return;
        };

        // wildcards never select a `$` first level
        if !(root && first.is_metadata()) {
            if let Some(n) = self.branches.get(&Level::MultiWildcard) {
                out.extend(n.values.values().cloned());
            }
            if let Some(n) = self.branches.get(&Level::SingleWildcard) {
                n._matches(rest, false, out);
            }
        }

        if !first.is_wildcard() {
            if let Some(n) = self.branches.get(first) {
                n._matches(rest, false, out);
            }
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.branches.is_empty()
    }

    #[inline]
    pub fn values_size(&self) -> usize {
        self.values.len() + self.branches.values().map(|n| n.values_size()).sum::<usize>()
    }

    #[inline]
    pub fn nodes_size(&self) -> usize {
        self.branches.len() + self.branches.values().map(|n| n.nodes_size()).sum::<usize>()
    }
}

impl<K, V> fmt::Debug for Node<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node {{ nodes_size: {}, values_size: {} }}", self.nodes_size(), self.values_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> Topic {
        s.parse().expect("valid topic")
    }

    fn matched(tree: &TopicTree<u64, &'static str>, topic: &str) -> Vec<&'static str> {
        let mut out = Vec::new();
        tree.matches(t(topic).levels(), &mut out);
        out.sort();
        out
    }

    #[test]
    fn test_matches() {
        let mut tree: TopicTree<u64, &'static str> = TopicTree::default();
        tree.insert(&t("sport/+/player1"), 1, "sport/+/player1");
        tree.insert(&t("sport/#"), 2, "sport/#");
        tree.insert(&t("#"), 3, "#");
        tree.insert(&t("+/tennis/#"), 4, "+/tennis/#");
        tree.insert(&t("$SYS/#"), 5, "$SYS/#");

        assert_eq!(
            matched(&tree, "sport/tennis/player1"),
            vec!["#", "+/tennis/#", "sport/#", "sport/+/player1"]
        );
        assert_eq!(matched(&tree, "sport/tennis/player1/ranking"), vec!["#", "+/tennis/#", "sport/#"]);
        assert_eq!(matched(&tree, "sport"), vec!["#", "sport/#"]);
        assert_eq!(matched(&tree, "sport/tennis"), vec!["#", "+/tennis/#", "sport/#"]);
        assert_eq!(matched(&tree, "$SYS/brokers"), vec!["$SYS/#"]);
        assert_eq!(matched(&tree, ""), vec!["#"]);
    }

    #[test]
    fn test_insert_replaces_and_remove_prunes() {
        let mut tree: TopicTree<u64, &'static str> = TopicTree::default();
        assert_eq!(tree.insert(&t("a/+/c"), 1, "v1"), None);
        assert_eq!(tree.insert(&t("a/+/c"), 1, "v2"), Some("v1"));
        tree.insert(&t("a/+/c"), 2, "other");
        tree.insert(&t("a/#"), 1, "hash");
        assert_eq!(tree.values_size(), 3);

        assert_eq!(tree.remove(&t("a/+/c"), &1), Some("v2"));
        assert_eq!(tree.remove(&t("a/+/c"), &1), None);
        assert_eq!(tree.remove(&t("a/+/c"), &2), Some("other"));
        assert_eq!(tree.nodes_size(), 2);
        assert_eq!(tree.remove(&t("a/#"), &1), Some("hash"));
        assert!(tree.is_empty());
        assert_eq!(tree.remove(&t("x/y"), &1), None);
    }
}

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{Dependency, DependencyType, EngineError, NodeRef, VersionKey};

/// Node of the dependency graph with the attributes used for tie-breaking.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GraphNode {
    pub node: NodeRef,
    pub version: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    version: VersionKey,
    created_at: OffsetDateTime,
    node: NodeRef,
}

/// DAG over migrations, seeds and versions.
///
/// `requires` edges point from a dependent to its prerequisite and must stay
/// acyclic. `conflicts_with` edges are symmetric and stored normalized.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<NodeRef, GraphNode>,
    requires: BTreeMap<NodeRef, BTreeSet<NodeRef>>,
    required_by: BTreeMap<NodeRef, BTreeSet<NodeRef>>,
    conflicts: BTreeSet<(NodeRef, NodeRef)>,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from stored records without re-validating them.
    pub fn from_parts<'a>(
        nodes: impl IntoIterator<Item = GraphNode>,
        edges: impl IntoIterator<Item = &'a Dependency>,
    ) -> Self {
        let mut graph = Self::new();
        for node in nodes {
            graph.insert_node(node);
        }
        for edge in edges {
            graph.link(edge.source, edge.target, edge.dependency_type);
        }
        graph
    }

    pub fn insert_node(&mut self, node: GraphNode) {
        self.nodes.insert(node.node, node);
    }

    #[must_use]
    pub fn contains(&self, node: NodeRef) -> bool {
        self.nodes.contains_key(&node)
    }

    #[must_use]
    pub fn node(&self, node: NodeRef) -> Option<&GraphNode> {
        self.nodes.get(&node)
    }

    /// Adds an edge after checking it keeps `requires` acyclic and does not
    /// force two conflicting nodes into the same run. On error the graph is unchanged.
    ///
    /// # Errors
    /// Returns [`EngineError::CyclicDependency`] when a `requires` edge would
    /// close a cycle and [`EngineError::Conflict`] when a conflicting pair would
    /// end up in one another's prerequisite closure.
    pub fn add_dependency(
        &mut self,
        source: NodeRef,
        target: NodeRef,
        dependency_type: DependencyType,
    ) -> Result<(), EngineError> {
        if source == target {
            return Err(EngineError::Validation(format!(
                "{source} cannot depend on itself"
            )));
        }
        if dependency_type == DependencyType::Requires {
            if let Some(path) = self.cycle_through(source, target) {
                return Err(EngineError::CyclicDependency {
                    path: path.iter().map(ToString::to_string).collect(),
                });
            }
        }

        let mut candidate = self.clone();
        candidate.link(source, target, dependency_type);
        if let Some((left, right)) = candidate.forced_conflict() {
            return Err(EngineError::Conflict {
                left: left.to_string(),
                right: right.to_string(),
            });
        }
        *self = candidate;
        Ok(())
    }

    pub fn remove_dependency(
        &mut self,
        source: NodeRef,
        target: NodeRef,
        dependency_type: DependencyType,
    ) {
        match dependency_type {
            DependencyType::Requires => {
                if let Some(targets) = self.requires.get_mut(&source) {
                    targets.remove(&target);
                }
                if let Some(sources) = self.required_by.get_mut(&target) {
                    sources.remove(&source);
                }
            }
            DependencyType::ConflictsWith => {
                self.conflicts.remove(&normalized(source, target));
            }
        }
    }

    /// Path `source -> target -> ... -> source` if adding `source requires target`
    /// would close a cycle.
    #[must_use]
    pub fn cycle_through(&self, source: NodeRef, target: NodeRef) -> Option<Vec<NodeRef>> {
        if source == target {
            return Some(vec![source, target]);
        }
        let mut parent: BTreeMap<NodeRef, NodeRef> = BTreeMap::new();
        let mut stack = vec![target];
        let mut seen = BTreeSet::from([target]);
        while let Some(current) = stack.pop() {
            if current == source {
                let mut path = vec![source];
                let mut cursor = source;
                while let Some(previous) = parent.get(&cursor) {
                    path.push(*previous);
                    cursor = *previous;
                }
                path.push(source);
                path.reverse();
                return Some(path);
            }
            for next in self.prerequisites(current) {
                if seen.insert(next) {
                    parent.insert(next, current);
                    stack.push(next);
                }
            }
        }
        None
    }

    /// Direct prerequisites of `node`.
    #[must_use]
    pub fn prerequisites(&self, node: NodeRef) -> Vec<NodeRef> {
        self.requires
            .get(&node)
            .map(|targets| targets.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Nodes that directly require `node`.
    #[must_use]
    pub fn dependents(&self, node: NodeRef) -> Vec<NodeRef> {
        self.required_by
            .get(&node)
            .map(|sources| sources.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn conflicts_of(&self, node: NodeRef) -> Vec<NodeRef> {
        self.conflicts
            .iter()
            .filter_map(|(left, right)| {
                if *left == node {
                    Some(*right)
                } else if *right == node {
                    Some(*left)
                } else {
                    None
                }
            })
            .collect()
    }

    /// `roots` plus everything they transitively require.
    #[must_use]
    pub fn requires_closure(&self, roots: impl IntoIterator<Item = NodeRef>) -> BTreeSet<NodeRef> {
        self.walk(roots, &self.requires)
    }

    /// `roots` plus everything that transitively requires them.
    #[must_use]
    pub fn dependents_closure(
        &self,
        roots: impl IntoIterator<Item = NodeRef>,
    ) -> BTreeSet<NodeRef> {
        self.walk(roots, &self.required_by)
    }

    /// # Errors
    /// Returns [`EngineError::Conflict`] for the first `conflicts_with` edge
    /// whose endpoints are both candidates.
    pub fn validate_no_conflicts(&self, candidates: &BTreeSet<NodeRef>) -> Result<(), EngineError> {
        match self
            .conflicts
            .iter()
            .find(|(left, right)| candidates.contains(left) && candidates.contains(right))
        {
            Some((left, right)) => Err(EngineError::Conflict {
                left: left.to_string(),
                right: right.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Topological order of `candidates`, prerequisites first.
    ///
    /// Edges to nodes outside the candidate set are ignored. Ready nodes are
    /// taken in ascending (version, creation time, id) order, so the result
    /// is deterministic.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown candidate and
    /// [`EngineError::CyclicDependency`] if the candidates contain a cycle.
    pub fn resolve_order(
        &self,
        candidates: &BTreeSet<NodeRef>,
    ) -> Result<Vec<NodeRef>, EngineError> {
        let mut keys = BTreeMap::new();
        for candidate in candidates {
            let node = self
                .nodes
                .get(candidate)
                .ok_or_else(|| EngineError::NotFound(candidate.to_string()))?;
            keys.insert(
                *candidate,
                OrderKey {
                    version: VersionKey::new(&node.version),
                    created_at: node.created_at,
                    node: *candidate,
                },
            );
        }

        let mut pending: BTreeMap<NodeRef, usize> = candidates
            .iter()
            .map(|candidate| {
                let count = self
                    .prerequisites(*candidate)
                    .iter()
                    .filter(|target| candidates.contains(target))
                    .count();
                (*candidate, count)
            })
            .collect();

        let mut ready: BTreeSet<OrderKey> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .filter_map(|(node, _)| keys.get(node).cloned())
            .collect();
        let mut ordered = Vec::with_capacity(candidates.len());

        while let Some(next) = ready.pop_first() {
            pending.remove(&next.node);
            ordered.push(next.node);
            for dependent in self.dependents(next.node) {
                if let Some(count) = pending.get_mut(&dependent) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        if let Some(key) = keys.get(&dependent) {
                            ready.insert(key.clone());
                        }
                    }
                }
            }
        }

        if pending.is_empty() {
            return Ok(ordered);
        }

        let remaining: BTreeSet<NodeRef> = pending.keys().copied().collect();
        Err(EngineError::CyclicDependency {
            path: self
                .cycle_within(&remaining)
                .iter()
                .map(ToString::to_string)
                .collect(),
        })
    }

    /// Conflicting pair where one endpoint is in the other's prerequisite closure.
    #[must_use]
    pub fn forced_conflict(&self) -> Option<(NodeRef, NodeRef)> {
        self.conflicts.iter().copied().find(|(left, right)| {
            self.requires_closure([*left]).contains(right)
                || self.requires_closure([*right]).contains(left)
        })
    }

    fn link(&mut self, source: NodeRef, target: NodeRef, dependency_type: DependencyType) {
        match dependency_type {
            DependencyType::Requires => {
                self.requires.entry(source).or_default().insert(target);
                self.required_by.entry(target).or_default().insert(source);
            }
            DependencyType::ConflictsWith => {
                self.conflicts.insert(normalized(source, target));
            }
        }
    }

    fn walk(
        &self,
        roots: impl IntoIterator<Item = NodeRef>,
        edges: &BTreeMap<NodeRef, BTreeSet<NodeRef>>,
    ) -> BTreeSet<NodeRef> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<NodeRef> = roots.into_iter().collect();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(next) = edges.get(&current) {
                stack.extend(next.iter().copied().filter(|node| !seen.contains(node)));
            }
        }
        seen
    }

    // Every node left after Kahn's pass has a remaining prerequisite, so
    // following prerequisites from any of them must revisit a node.
    fn cycle_within(&self, remaining: &BTreeSet<NodeRef>) -> Vec<NodeRef> {
        let Some(start) = remaining.first().copied() else {
            return Vec::new();
        };
        let mut path = vec![start];
        let mut position = BTreeMap::from([(start, 0_usize)]);
        let mut current = start;
        loop {
            let next = self
                .prerequisites(current)
                .into_iter()
                .find(|node| remaining.contains(node));
            let Some(next) = next else {
                return path;
            };
            if let Some(index) = position.get(&next) {
                let mut cycle = path.split_off(*index);
                cycle.push(next);
                return cycle;
            }
            position.insert(next, path.len());
            path.push(next);
            current = next;
        }
    }
}

fn normalized(left: NodeRef, right: NodeRef) -> (NodeRef, NodeRef) {
    if left <= right {
        (left, right)
    } else {
        (right, left)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{now_utc, UnitId, UnitRef};
    use proptest::prelude::*;
    use time::Duration;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn unit_node(version: &str, offset_seconds: i64) -> GraphNode {
        GraphNode {
            node: UnitRef::migration(UnitId::new()).into(),
            version: version.to_string(),
            created_at: now_utc() + Duration::seconds(offset_seconds),
        }
    }

    fn graph_of(nodes: &[GraphNode]) -> DependencyGraph {
        DependencyGraph::from_parts(nodes.iter().cloned(), std::iter::empty())
    }

    #[test]
    fn orders_prerequisites_first() {
        let a = unit_node("1.0.0", 0);
        let b = unit_node("1.0.0", 1);
        let c = unit_node("1.0.0", 2);
        let mut graph = graph_of(&[a.clone(), b.clone(), c.clone()]);
        // a was created first but has to wait for c.
        must_ok(graph.add_dependency(a.node, c.node, DependencyType::Requires));

        let all = BTreeSet::from([a.node, b.node, c.node]);
        let order = must_ok(graph.resolve_order(&all));
        assert_eq!(order, vec![b.node, c.node, a.node]);
    }

    #[test]
    fn pre_release_is_ordered_before_its_release() {
        let release = unit_node("2.0.0", 0);
        let candidate = unit_node("2.0.0-rc1", 5);
        let graph = graph_of(&[release.clone(), candidate.clone()]);

        let all = BTreeSet::from([release.node, candidate.node]);
        assert_eq!(
            must_ok(graph.resolve_order(&all)),
            vec![candidate.node, release.node]
        );
    }

    #[test]
    fn ties_break_by_version_then_creation_time() {
        let late_old_version = unit_node("1.9.0", 10);
        let early_new_version = unit_node("1.10.0", 0);
        let same_version_later = unit_node("1.10.0", 5);
        let graph = graph_of(&[
            late_old_version.clone(),
            early_new_version.clone(),
            same_version_later.clone(),
        ]);

        let all = BTreeSet::from([
            late_old_version.node,
            early_new_version.node,
            same_version_later.node,
        ]);
        assert_eq!(
            must_ok(graph.resolve_order(&all)),
            vec![
                late_old_version.node,
                early_new_version.node,
                same_version_later.node
            ]
        );
    }

    #[test]
    fn cycle_closing_edge_is_rejected_and_graph_unchanged() {
        let a = unit_node("1.0.0", 0);
        let b = unit_node("1.0.0", 1);
        let c = unit_node("1.0.0", 2);
        let mut graph = graph_of(&[a.clone(), b.clone(), c.clone()]);
        must_ok(graph.add_dependency(b.node, a.node, DependencyType::Requires));
        must_ok(graph.add_dependency(c.node, b.node, DependencyType::Requires));

        let err = graph.add_dependency(a.node, c.node, DependencyType::Requires);
        match err {
            Err(EngineError::CyclicDependency { path }) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
        assert!(graph.prerequisites(a.node).is_empty());
        assert_eq!(graph.dependents(c.node), Vec::<NodeRef>::new());
        let all = BTreeSet::from([a.node, b.node, c.node]);
        assert_eq!(must_ok(graph.resolve_order(&all)), vec![a.node, b.node, c.node]);
    }

    #[test]
    fn stored_cycles_surface_at_resolve_time() {
        let a = unit_node("1.0.0", 0);
        let b = unit_node("1.0.0", 1);
        let edges = [
            Dependency {
                id: crate::DependencyId::new(),
                source: a.node,
                target: b.node,
                dependency_type: DependencyType::Requires,
                created_by: "t".to_string(),
                created_at: now_utc(),
            },
            Dependency {
                id: crate::DependencyId::new(),
                source: b.node,
                target: a.node,
                dependency_type: DependencyType::Requires,
                created_by: "t".to_string(),
                created_at: now_utc(),
            },
        ];
        let graph = DependencyGraph::from_parts([a.clone(), b.clone()], edges.iter());
        let err = graph.resolve_order(&BTreeSet::from([a.node, b.node]));
        assert!(matches!(err, Err(EngineError::CyclicDependency { path }) if path.len() == 3));
    }

    #[test]
    fn conflicts_are_detected_only_when_both_are_candidates() {
        let a = unit_node("1.0.0", 0);
        let b = unit_node("1.0.0", 1);
        let c = unit_node("1.0.0", 2);
        let mut graph = graph_of(&[a.clone(), b.clone(), c.clone()]);
        must_ok(graph.add_dependency(b.node, a.node, DependencyType::Requires));
        must_ok(graph.add_dependency(c.node, a.node, DependencyType::Requires));
        must_ok(graph.add_dependency(c.node, b.node, DependencyType::ConflictsWith));

        let all = BTreeSet::from([a.node, b.node, c.node]);
        assert!(matches!(
            graph.validate_no_conflicts(&all),
            Err(EngineError::Conflict { .. })
        ));

        let pair = BTreeSet::from([a.node, b.node]);
        must_ok(graph.validate_no_conflicts(&pair));
        assert_eq!(must_ok(graph.resolve_order(&pair)), vec![a.node, b.node]);
        assert_eq!(graph.conflicts_of(b.node), vec![c.node]);
    }

    #[test]
    fn conflict_inside_a_prerequisite_closure_is_rejected() {
        let a = unit_node("1.0.0", 0);
        let b = unit_node("1.0.0", 1);
        let c = unit_node("1.0.0", 2);
        let mut graph = graph_of(&[a.clone(), b.clone(), c.clone()]);
        must_ok(graph.add_dependency(b.node, a.node, DependencyType::Requires));
        must_ok(graph.add_dependency(c.node, b.node, DependencyType::Requires));

        let err = graph.add_dependency(c.node, a.node, DependencyType::ConflictsWith);
        assert!(matches!(err, Err(EngineError::Conflict { .. })));
        assert!(graph.conflicts_of(a.node).is_empty());
    }

    #[test]
    fn closures_follow_edges_both_ways() {
        let a = unit_node("1.0.0", 0);
        let b = unit_node("1.0.0", 1);
        let c = unit_node("1.0.0", 2);
        let d = unit_node("1.0.0", 3);
        let mut graph = graph_of(&[a.clone(), b.clone(), c.clone(), d.clone()]);
        must_ok(graph.add_dependency(b.node, a.node, DependencyType::Requires));
        must_ok(graph.add_dependency(c.node, b.node, DependencyType::Requires));

        assert_eq!(
            graph.requires_closure([c.node]),
            BTreeSet::from([a.node, b.node, c.node])
        );
        assert_eq!(
            graph.dependents_closure([a.node]),
            BTreeSet::from([a.node, b.node, c.node])
        );
        assert_eq!(graph.requires_closure([d.node]), BTreeSet::from([d.node]));

        graph.remove_dependency(c.node, b.node, DependencyType::Requires);
        assert_eq!(graph.requires_closure([c.node]), BTreeSet::from([c.node]));
    }

    #[test]
    fn unknown_candidates_are_reported() {
        let graph = DependencyGraph::new();
        let stray: NodeRef = UnitRef::seed(UnitId::new()).into();
        assert!(matches!(
            graph.resolve_order(&BTreeSet::from([stray])),
            Err(EngineError::NotFound(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn resolve_order_respects_every_requires_edge(
            versions in proptest::collection::vec(0_u8..4, 1..24),
            edges in proptest::collection::vec((0_usize..24, 0_usize..24), 0..64),
        ) {
            let nodes: Vec<GraphNode> = versions
                .iter()
                .enumerate()
                .map(|(index, minor)| {
                    let offset = i64::try_from(index).unwrap_or(0);
                    unit_node(&format!("1.{minor}.0"), offset)
                })
                .collect();
            let mut graph = graph_of(&nodes);
            for (from, to) in edges {
                let (from, to) = (from % nodes.len(), to % nodes.len());
                if from > to {
                    // Only later-to-earlier edges, so the input is acyclic.
                    prop_assert!(graph
                        .add_dependency(nodes[from].node, nodes[to].node, DependencyType::Requires)
                        .is_ok());
                }
            }

            let all: BTreeSet<NodeRef> = nodes.iter().map(|node| node.node).collect();
            let order = graph.resolve_order(&all);
            prop_assert!(order.is_ok());
            let order = order.unwrap_or_default();
            prop_assert_eq!(order.len(), nodes.len());

            let position: BTreeMap<NodeRef, usize> =
                order.iter().enumerate().map(|(index, node)| (*node, index)).collect();
            for node in &order {
                for prerequisite in graph.requires_closure([*node]) {
                    prop_assert!(position[&prerequisite] <= position[node]);
                }
            }

            prop_assert_eq!(graph.resolve_order(&all).unwrap_or_default(), order);
        }
    }
}

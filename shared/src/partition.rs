//! Binary space partition over the world rectangle.
//!
//! Partitions live in an arena keyed by [`PartitionId`]; parent and child
//! links are identity lookups rather than owning pointers. Only leaves hold
//! occupants and authority delegations. A partition's identity is
//! provisional (negative) until the coordinator commits a durable id for it,
//! at which point every link pointing at it is rewritten.

use crate::authority::{Authority, AuthorityId, AuthorityRegistry, HostId};
use crate::error::{ZoneError, ZoneResult};
use crate::geometry::{Rect, SplitAxis};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub i64);

impl PartitionId {
    /// Provisional identities are negative placeholders that have not been
    /// committed to the durable store yet.
    pub fn is_provisional(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zone-{}", self.0)
    }
}

/// Occupant count per partition, taken from a live snapshot.
pub type Occupancy = HashMap<PartitionId, usize>;

/// Population thresholds driving split and merge decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopulationLimits {
    pub overpopulated: usize,
    pub underpopulated: usize,
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub id: PartitionId,
    pub parent: Option<PartitionId>,
    pub children: Option<[PartitionId; 2]>,
    pub axis: SplitAxis,
    pub depth: u32,
    pub authorities: AuthorityRegistry,
}

impl Partition {
    fn new(id: PartitionId, parent: Option<PartitionId>, depth: u32) -> Self {
        Self {
            id,
            parent,
            children: None,
            axis: SplitAxis::for_depth(depth),
            depth,
            authorities: AuthorityRegistry::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }
}

/// One partition as it is persisted and sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRow {
    pub id: PartitionId,
    pub parent: Option<PartitionId>,
    pub children: Option<[PartitionId; 2]>,
    pub axis: SplitAxis,
}

/// Full snapshot of the tree plus every delegation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMap {
    pub version: u64,
    pub world: Rect,
    pub partitions: Vec<PartitionRow>,
    pub authorities: Vec<Authority>,
}

/// Result of splitting a leaf.
#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub children: [PartitionId; 2],
    /// Delegations removed from the former leaf. They are never inherited
    /// by the children.
    pub stripped: Vec<Authority>,
}

#[derive(Debug, Clone)]
pub struct PartitionTree {
    world: Rect,
    root: PartitionId,
    nodes: HashMap<PartitionId, Partition>,
    next_provisional: i64,
}

impl PartitionTree {
    /// Creates a tree whose single provisional root covers the whole world.
    pub fn new(world: Rect) -> Self {
        let root = PartitionId(-1);
        let mut nodes = HashMap::new();
        nodes.insert(root, Partition::new(root, None, 0));

        Self {
            world,
            root,
            nodes,
            next_provisional: -2,
        }
    }

    pub fn world(&self) -> Rect {
        self.world
    }

    pub fn root(&self) -> PartitionId {
        self.root
    }

    pub fn get(&self, id: PartitionId) -> Option<&Partition> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: PartitionId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_leaf(&self, id: PartitionId) -> bool {
        self.nodes.get(&id).map(Partition::is_leaf).unwrap_or(false)
    }

    /// All leaf ids in ascending order.
    pub fn leaves(&self) -> Vec<PartitionId> {
        let mut leaves: Vec<PartitionId> = self
            .nodes
            .values()
            .filter(|p| p.is_leaf())
            .map(|p| p.id)
            .collect();
        leaves.sort();
        leaves
    }

    pub fn sibling(&self, id: PartitionId) -> Option<PartitionId> {
        let parent = self.nodes.get(&id)?.parent?;
        let [low, high] = self.nodes.get(&parent)?.children?;
        Some(if low == id { high } else { low })
    }

    /// Computes the rectangle of a partition by halving the world along the
    /// path from the root.
    pub fn rect_of(&self, id: PartitionId) -> ZoneResult<Rect> {
        let mut path = Vec::new();
        let mut current = id;
        loop {
            let node = self
                .nodes
                .get(&current)
                .ok_or(ZoneError::UnknownPartition(current))?;
            match node.parent {
                Some(parent) => {
                    path.push(current);
                    current = parent;
                }
                None => break,
            }
        }

        let mut rect = self.world;
        let mut node = &self.nodes[&self.root];
        for step in path.into_iter().rev() {
            let [low, _] = node
                .children
                .ok_or_else(|| ZoneError::MalformedMap(format!("{} has no children", node.id)))?;
            let (low_rect, high_rect) = rect.halves(node.axis);
            rect = if step == low { low_rect } else { high_rect };
            node = self
                .nodes
                .get(&step)
                .ok_or(ZoneError::UnknownPartition(step))?;
        }
        Ok(rect)
    }

    /// Returns the unique leaf whose rectangle contains the point. Points
    /// outside the world are clamped onto its border first.
    pub fn resolve_point(&self, x: f32, y: f32) -> PartitionId {
        let (x, y) = self.world.clamp_point(x, y);
        let mut rect = self.world;
        let mut current = self.root;

        while let Some(node) = self.nodes.get(&current) {
            let Some([low, high]) = node.children else {
                break;
            };
            let (low_rect, high_rect) = rect.halves(node.axis);
            if low_rect.contains(x, y) {
                current = low;
                rect = low_rect;
            } else {
                current = high;
                rect = high_rect;
            }
        }
        current
    }

    pub fn registry(&self, id: PartitionId) -> Option<&AuthorityRegistry> {
        self.nodes.get(&id).map(|p| &p.authorities)
    }

    /// Defensive copy of a partition's delegations. Empty for unknown ids.
    pub fn authorities(&self, id: PartitionId) -> Vec<Authority> {
        self.registry(id).map(|r| r.entries()).unwrap_or_default()
    }

    /// Every delegation in the tree, ordered by authority id.
    pub fn all_authorities(&self) -> Vec<Authority> {
        let mut all: Vec<Authority> = self
            .nodes
            .values()
            .flat_map(|p| p.authorities.iter().cloned())
            .collect();
        all.sort_by_key(|a| a.id);
        all
    }

    pub fn find_authority(&self, id: AuthorityId) -> Option<&Authority> {
        self.nodes.values().find_map(|p| p.authorities.get(id))
    }

    /// Delegates a leaf to a host.
    pub fn add_authority(&mut self, authority: Authority) -> ZoneResult<()> {
        let node = self
            .nodes
            .get_mut(&authority.partition)
            .ok_or(ZoneError::UnknownPartition(authority.partition))?;
        if !node.is_leaf() {
            return Err(ZoneError::NotALeaf(node.id));
        }
        node.authorities.add(authority)
    }

    pub fn remove_authority(&mut self, id: AuthorityId) -> Option<Authority> {
        self.nodes
            .values_mut()
            .find_map(|p| p.authorities.remove(id))
    }

    /// Drops every delegation whose host fails the liveness check.
    pub fn drop_authorities<F>(&mut self, mut is_live: F) -> Vec<Authority>
    where
        F: FnMut(HostId) -> bool,
    {
        let mut dropped = Vec::new();
        for node in self.nodes.values_mut() {
            dropped.extend(node.authorities.retain_live(&mut is_live));
        }
        dropped.sort_by_key(|a| a.id);
        dropped
    }

    /// Number of delegations held by each host across all partitions.
    pub fn delegation_counts(&self) -> HashMap<HostId, usize> {
        let mut counts = HashMap::new();
        for authority in self.nodes.values().flat_map(|p| p.authorities.iter()) {
            *counts.entry(authority.host).or_insert(0) += 1;
        }
        counts
    }

    /// True when the leaf's occupant count reached the overpopulation threshold.
    pub fn evaluate_split(
        &self,
        leaf: PartitionId,
        occupancy: &Occupancy,
        limits: PopulationLimits,
    ) -> bool {
        self.is_leaf(leaf) && occupants(occupancy, leaf) >= limits.overpopulated
    }

    /// Returns the parent to collapse when the leaf and its sibling can be
    /// merged without the combined population immediately re-triggering a
    /// split.
    pub fn evaluate_merge(
        &self,
        leaf: PartitionId,
        occupancy: &Occupancy,
        limits: PopulationLimits,
    ) -> Option<PartitionId> {
        if !self.is_leaf(leaf) || leaf == self.root {
            return None;
        }
        let count = occupants(occupancy, leaf);
        if count > limits.underpopulated {
            return None;
        }
        let sibling = self.sibling(leaf)?;
        if !self.is_leaf(sibling) {
            return None;
        }
        if count + occupants(occupancy, sibling) >= limits.overpopulated {
            return None;
        }
        self.nodes.get(&leaf)?.parent
    }

    /// Splits a leaf into two provisional children and strips its delegations.
    pub fn split(&mut self, leaf: PartitionId) -> ZoneResult<SplitOutcome> {
        let depth = {
            let node = self
                .nodes
                .get(&leaf)
                .ok_or(ZoneError::UnknownPartition(leaf))?;
            if !node.is_leaf() {
                return Err(ZoneError::NotALeaf(leaf));
            }
            node.depth
        };

        let low = self.allocate_provisional();
        let high = self.allocate_provisional();
        self.nodes.insert(low, Partition::new(low, Some(leaf), depth + 1));
        self.nodes.insert(high, Partition::new(high, Some(leaf), depth + 1));

        let node = self
            .nodes
            .get_mut(&leaf)
            .ok_or(ZoneError::UnknownPartition(leaf))?;
        node.children = Some([low, high]);
        node.axis = SplitAxis::for_depth(depth);
        let stripped = node.authorities.clear();

        debug!("Split {} into {} and {}", leaf, low, high);
        Ok(SplitOutcome {
            children: [low, high],
            stripped,
        })
    }

    /// Collapses two sibling leaves back into their parent. Both children's
    /// delegations are stripped and returned; the merged leaf starts empty.
    pub fn merge(&mut self, parent: PartitionId) -> ZoneResult<Vec<Authority>> {
        let [low, high] = self
            .nodes
            .get(&parent)
            .ok_or(ZoneError::UnknownPartition(parent))?
            .children
            .ok_or(ZoneError::NotMergeable(parent))?;
        if !self.is_leaf(low) || !self.is_leaf(high) {
            return Err(ZoneError::NotMergeable(parent));
        }

        let mut stripped = Vec::new();
        for child in [low, high] {
            if let Some(mut node) = self.nodes.remove(&child) {
                stripped.extend(node.authorities.clear());
            }
        }
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children = None;
        }

        debug!("Merged {} and {} into {}", low, high, parent);
        Ok(stripped)
    }

    /// Provisional ids in the order they were handed out.
    pub fn provisional_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self
            .nodes
            .keys()
            .filter(|id| id.is_provisional())
            .copied()
            .collect();
        ids.sort_by(|a, b| b.cmp(a));
        ids
    }

    /// Rewrites a provisional identity to its durable one, fixing the parent
    /// link, both child links and the delegations it holds.
    pub fn commit_identity(&mut self, provisional: PartitionId, durable: PartitionId) -> ZoneResult<()> {
        if self.nodes.contains_key(&durable) {
            return Err(ZoneError::MalformedMap(format!("{} already exists", durable)));
        }
        let mut node = self
            .nodes
            .remove(&provisional)
            .ok_or(ZoneError::UnknownPartition(provisional))?;
        node.id = durable;
        node.authorities.rekey_partition(durable);

        if let Some(parent) = node.parent.and_then(|p| self.nodes.get_mut(&p)) {
            if let Some(children) = parent.children.as_mut() {
                for child in children.iter_mut() {
                    if *child == provisional {
                        *child = durable;
                    }
                }
            }
        }
        if let Some(children) = node.children {
            for child in children {
                if let Some(child) = self.nodes.get_mut(&child) {
                    child.parent = Some(durable);
                }
            }
        }
        if self.root == provisional {
            self.root = durable;
        }

        self.nodes.insert(durable, node);
        Ok(())
    }

    /// Commits every provisional identity using ids from `allocate`.
    /// Returns the (provisional, durable) pairs that were rewritten.
    pub fn commit_provisional<F>(&mut self, mut allocate: F) -> ZoneResult<Vec<(PartitionId, PartitionId)>>
    where
        F: FnMut() -> PartitionId,
    {
        let mut committed = Vec::new();
        for provisional in self.provisional_ids() {
            let durable = allocate();
            self.commit_identity(provisional, durable)?;
            committed.push((provisional, durable));
        }
        Ok(committed)
    }

    pub fn to_map(&self, version: u64) -> PartitionMap {
        let mut partitions: Vec<PartitionRow> = self
            .nodes
            .values()
            .map(|p| PartitionRow {
                id: p.id,
                parent: p.parent,
                children: p.children,
                axis: p.axis,
            })
            .collect();
        partitions.sort_by_key(|row| row.id);

        PartitionMap {
            version,
            world: self.world,
            partitions,
            authorities: self.all_authorities(),
        }
    }

    pub fn from_map(map: &PartitionMap) -> ZoneResult<Self> {
        let roots: Vec<&PartitionRow> = map.partitions.iter().filter(|r| r.parent.is_none()).collect();
        let root = match roots.as_slice() {
            [root] => root.id,
            _ => {
                return Err(ZoneError::MalformedMap(format!(
                    "expected one root, found {}",
                    roots.len()
                )))
            }
        };

        let rows: HashMap<PartitionId, &PartitionRow> =
            map.partitions.iter().map(|r| (r.id, r)).collect();
        let mut nodes = HashMap::new();
        let mut queue = VecDeque::from([(root, 0u32)]);
        while let Some((id, depth)) = queue.pop_front() {
            let row = rows.get(&id).ok_or(ZoneError::UnknownPartition(id))?;
            let mut node = Partition::new(id, row.parent, depth);
            node.axis = row.axis;
            node.children = row.children;
            if let Some(children) = row.children {
                for child in children {
                    queue.push_back((child, depth + 1));
                }
            }
            if nodes.insert(id, node).is_some() {
                return Err(ZoneError::MalformedMap(format!("{} reachable twice", id)));
            }
        }
        if nodes.len() != map.partitions.len() {
            return Err(ZoneError::MalformedMap("unreachable partitions".to_string()));
        }

        let lowest = nodes.keys().map(|id| id.0).min().unwrap_or(0);
        let mut tree = Self {
            world: map.world,
            root,
            nodes,
            next_provisional: lowest.min(0) - 1,
        };
        for authority in &map.authorities {
            tree.add_authority(authority.clone())?;
        }
        tree.check_invariants()?;
        Ok(tree)
    }

    /// Verifies the structural invariants: leaf iff no children, only
    /// leaves hold delegations, and child/parent links agree.
    pub fn check_invariants(&self) -> ZoneResult<()> {
        for node in self.nodes.values() {
            match node.children {
                Some(children) => {
                    if !node.authorities.is_empty() {
                        return Err(ZoneError::MalformedMap(format!(
                            "non-leaf {} holds delegations",
                            node.id
                        )));
                    }
                    for child in children {
                        let child = self
                            .nodes
                            .get(&child)
                            .ok_or(ZoneError::UnknownPartition(child))?;
                        if child.parent != Some(node.id) {
                            return Err(ZoneError::MalformedMap(format!(
                                "{} does not point back to {}",
                                child.id, node.id
                            )));
                        }
                    }
                }
                None => {
                    if node.authorities.iter().any(|a| a.partition != node.id) {
                        return Err(ZoneError::MalformedMap(format!(
                            "{} holds a foreign delegation",
                            node.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn allocate_provisional(&mut self) -> PartitionId {
        let id = PartitionId(self.next_provisional);
        self.next_provisional -= 1;
        id
    }
}

fn occupants(occupancy: &Occupancy, id: PartitionId) -> usize {
    occupancy.get(&id).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn world() -> Rect {
        Rect::new(0.0, 0.0, 800.0, 600.0)
    }

    fn limits() -> PopulationLimits {
        PopulationLimits {
            overpopulated: 8,
            underpopulated: 2,
        }
    }

    fn authority(id: u64, partition: PartitionId, host: u32) -> Authority {
        let addr: SocketAddr = format!("127.0.0.1:{}", 7000 + host).parse().unwrap();
        Authority::new(AuthorityId(id), partition, HostId(host), addr)
    }

    /// Root split vertically, both halves split horizontally.
    fn four_leaf_tree() -> (PartitionTree, [PartitionId; 4]) {
        let mut tree = PartitionTree::new(world());
        let [left, right] = tree.split(tree.root()).unwrap().children;
        let [top_left, bottom_left] = tree.split(left).unwrap().children;
        let [top_right, bottom_right] = tree.split(right).unwrap().children;
        (tree, [top_left, bottom_left, top_right, bottom_right])
    }

    #[test]
    fn test_new_tree_is_single_provisional_leaf() {
        let tree = PartitionTree::new(world());
        assert_eq!(tree.len(), 1);
        assert!(tree.root().is_provisional());
        assert_eq!(tree.leaves(), vec![tree.root()]);
        assert_eq!(tree.resolve_point(10.0, 10.0), tree.root());
    }

    #[test]
    fn test_resolve_point_four_leaves() {
        let (tree, [top_left, bottom_left, top_right, bottom_right]) = four_leaf_tree();

        assert_eq!(tree.resolve_point(100.0, 100.0), top_left);
        assert_eq!(tree.resolve_point(100.0, 500.0), bottom_left);
        assert_eq!(tree.resolve_point(700.0, 100.0), top_right);
        assert_eq!(tree.resolve_point(700.0, 500.0), bottom_right);

        // Boundaries belong to the high half.
        assert_eq!(tree.resolve_point(400.0, 100.0), top_right);
        assert_eq!(tree.resolve_point(100.0, 300.0), bottom_left);
    }

    #[test]
    fn test_resolve_point_clamps_outside_world() {
        let (tree, [top_left, _, _, bottom_right]) = four_leaf_tree();
        assert_eq!(tree.resolve_point(-50.0, -50.0), top_left);
        assert_eq!(tree.resolve_point(5000.0, 5000.0), bottom_right);
    }

    #[test]
    fn test_rect_of_matches_resolution() {
        let (tree, leaves) = four_leaf_tree();
        for leaf in leaves {
            let rect = tree.rect_of(leaf).unwrap();
            let (cx, cy) = (rect.x + rect.width / 2.0, rect.y + rect.height / 2.0);
            assert_eq!(tree.resolve_point(cx, cy), leaf);
            assert_eq!(rect.width, 400.0);
            assert_eq!(rect.height, 300.0);
        }
    }

    #[test]
    fn test_split_axis_follows_depth() {
        let (tree, [top_left, ..]) = four_leaf_tree();
        let root = tree.get(tree.root()).unwrap();
        assert_eq!(root.axis, SplitAxis::Vertical);
        let left = tree.get(top_left).unwrap().parent.unwrap();
        assert_eq!(tree.get(left).unwrap().axis, SplitAxis::Horizontal);
        assert_eq!(tree.get(top_left).unwrap().depth, 2);
    }

    #[test]
    fn test_split_strips_authorities() {
        let mut tree = PartitionTree::new(world());
        let root = tree.root();
        tree.add_authority(authority(1, root, 1)).unwrap();
        tree.add_authority(authority(2, root, 2)).unwrap();

        let outcome = tree.split(root).unwrap();
        assert_eq!(outcome.stripped.len(), 2);
        for child in outcome.children {
            assert!(tree.authorities(child).is_empty());
        }
        assert!(tree.authorities(root).is_empty());
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_split_rejects_non_leaf() {
        let (mut tree, _) = four_leaf_tree();
        let root = tree.root();
        assert!(matches!(tree.split(root), Err(ZoneError::NotALeaf(_))));
    }

    #[test]
    fn test_authority_only_on_leaves() {
        let (mut tree, _) = four_leaf_tree();
        let root = tree.root();
        let result = tree.add_authority(authority(1, root, 1));
        assert!(matches!(result, Err(ZoneError::NotALeaf(_))));
    }

    #[test]
    fn test_evaluate_split_threshold() {
        let tree = PartitionTree::new(world());
        let root = tree.root();
        let mut occupancy = Occupancy::new();

        occupancy.insert(root, 7);
        assert!(!tree.evaluate_split(root, &occupancy, limits()));
        occupancy.insert(root, 8);
        assert!(tree.evaluate_split(root, &occupancy, limits()));
    }

    #[test]
    fn test_root_never_merges() {
        let tree = PartitionTree::new(world());
        assert!(tree
            .evaluate_merge(tree.root(), &Occupancy::new(), limits())
            .is_none());
    }

    #[test]
    fn test_evaluate_merge_rules() {
        let mut tree = PartitionTree::new(world());
        let root = tree.root();
        let [left, right] = tree.split(root).unwrap().children;
        let mut occupancy = Occupancy::new();

        occupancy.insert(left, 1);
        occupancy.insert(right, 3);
        assert_eq!(tree.evaluate_merge(left, &occupancy, limits()), Some(root));

        // Left is not underpopulated.
        occupancy.insert(left, 3);
        assert_eq!(tree.evaluate_merge(left, &occupancy, limits()), None);

        // Combined population would immediately split again.
        occupancy.insert(left, 2);
        occupancy.insert(right, 6);
        assert_eq!(tree.evaluate_merge(left, &occupancy, limits()), None);

        // Sibling is not a leaf.
        occupancy.insert(right, 0);
        tree.split(right).unwrap();
        assert_eq!(tree.evaluate_merge(left, &occupancy, limits()), None);
    }

    #[test]
    fn test_split_then_merge_restores_leaf_rects() {
        let (mut tree, _) = four_leaf_tree();
        let mut before: Vec<(f32, f32, f32, f32)> = tree
            .leaves()
            .into_iter()
            .map(|id| {
                let r = tree.rect_of(id).unwrap();
                (r.x, r.y, r.width, r.height)
            })
            .collect();

        let target = tree.resolve_point(100.0, 100.0);
        tree.split(target).unwrap();
        assert_eq!(tree.leaves().len(), 5);
        tree.merge(target).unwrap();

        let mut after: Vec<(f32, f32, f32, f32)> = tree
            .leaves()
            .into_iter()
            .map(|id| {
                let r = tree.rect_of(id).unwrap();
                (r.x, r.y, r.width, r.height)
            })
            .collect();
        before.sort_by(|a, b| a.partial_cmp(b).unwrap());
        after.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(before, after);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_merge_strips_both_children() {
        let mut tree = PartitionTree::new(world());
        let root = tree.root();
        let [left, right] = tree.split(root).unwrap().children;
        tree.add_authority(authority(1, left, 1)).unwrap();
        tree.add_authority(authority(2, right, 2)).unwrap();

        let stripped = tree.merge(root).unwrap();
        assert_eq!(stripped.len(), 2);
        assert!(tree.is_leaf(root));
        assert!(tree.authorities(root).is_empty());
        assert!(!tree.contains(left));
    }

    #[test]
    fn test_commit_identity_rewrites_links() {
        let mut tree = PartitionTree::new(world());
        let root = tree.root();
        let [left, right] = tree.split(root).unwrap().children;
        tree.add_authority(authority(1, left, 1)).unwrap();

        let mut next = 100;
        let committed = tree
            .commit_provisional(|| {
                next += 1;
                PartitionId(next)
            })
            .unwrap();
        assert_eq!(committed.len(), 3);
        assert!(tree.provisional_ids().is_empty());

        let root = tree.root();
        assert!(!root.is_provisional());
        let [new_left, new_right] = tree.get(root).unwrap().children.unwrap();
        assert!(!tree.contains(left));
        assert!(!tree.contains(right));
        assert_eq!(tree.get(new_left).unwrap().parent, Some(root));
        assert_eq!(tree.get(new_right).unwrap().parent, Some(root));
        assert_eq!(tree.authorities(new_left)[0].partition, new_left);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_from_map_rebuilds_tree() {
        let (mut tree, [top_left, ..]) = four_leaf_tree();
        tree.add_authority(authority(5, top_left, 3)).unwrap();

        let map = tree.to_map(9);
        let rebuilt = PartitionTree::from_map(&map).unwrap();

        assert_eq!(map.version, 9);
        assert_eq!(rebuilt.leaves(), tree.leaves());
        assert_eq!(rebuilt.resolve_point(100.0, 100.0), top_left);
        assert_eq!(rebuilt.authorities(top_left).len(), 1);
        assert_eq!(rebuilt.get(top_left).unwrap().depth, 2);
    }

    #[test]
    fn test_from_map_rejects_two_roots() {
        let tree = PartitionTree::new(world());
        let mut map = tree.to_map(1);
        map.partitions.push(PartitionRow {
            id: PartitionId(42),
            parent: None,
            children: None,
            axis: SplitAxis::Vertical,
        });
        assert!(matches!(
            PartitionTree::from_map(&map),
            Err(ZoneError::MalformedMap(_))
        ));
    }

    #[test]
    fn test_delegation_counts() {
        let (mut tree, [a, b, c, _]) = four_leaf_tree();
        tree.add_authority(authority(1, a, 1)).unwrap();
        tree.add_authority(authority(2, b, 1)).unwrap();
        tree.add_authority(authority(3, c, 2)).unwrap();

        let counts = tree.delegation_counts();
        assert_eq!(counts.get(&HostId(1)), Some(&2));
        assert_eq!(counts.get(&HostId(2)), Some(&1));
        assert_eq!(counts.get(&HostId(3)), None);
    }
}

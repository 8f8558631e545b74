//! The journal: an append-only arena of nodes for one sub-stage.

use crate::node::Node;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Journal {
    pub stage_name: String,
    pub run_id: Option<String>,
    pub nodes: Vec<Node>,
}

impl Journal {
    pub fn new(stage_name: impl Into<String>, run_id: Option<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            run_id,
            nodes: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append a node, assigning its step to the insertion index.
    pub fn append(&mut self, mut node: Node) -> &Node {
        node.step = Some(self.nodes.len());
        self.nodes.push(node);
        self.nodes.last().unwrap_or_else(|| unreachable!())
    }

    pub fn node_by_id(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_by_id_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    /// Nodes with no parent: the search roots.
    pub fn draft_nodes(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.parent.is_none()).collect()
    }

    pub fn buggy_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.is_buggy == Some(true))
            .collect()
    }

    pub fn good_nodes(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.good()).collect()
    }

    pub fn children_of(&self, id: &str) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.parent.as_deref() == Some(id))
            .collect()
    }

    pub fn is_leaf(&self, id: &str) -> bool {
        self.children_of(id).is_empty()
    }

    /// All leaves of the subtree rooted at `id`.
    pub fn leaves_of<'a>(&'a self, id: &str) -> Vec<&'a Node> {
        let Some(node) = self.node_by_id(id) else {
            return Vec::new();
        };
        let children = self.children_of(id);
        if children.is_empty() {
            return vec![node];
        }
        children
            .into_iter()
            .flat_map(|c| self.leaves_of(&c.id))
            .collect()
    }

    /// Walk parent links up to the root of the tree containing `id`.
    pub fn root_of<'a>(&'a self, id: &str) -> Option<&'a Node> {
        let mut current = self.node_by_id(id)?;
        let mut hops = 0usize;
        while let Some(parent_id) = current.parent.as_deref() {
            match self.node_by_id(parent_id) {
                Some(parent) => current = parent,
                None => break,
            }
            hops += 1;
            if hops > self.nodes.len() {
                // Defend against a malformed parent cycle.
                break;
            }
        }
        Some(current)
    }

    /// Length of the consecutive-debug chain ending at `id` (0 when the node
    /// is not a debug node).
    pub fn debug_depth(&self, id: &str) -> usize {
        let mut depth = 0usize;
        let mut current = self.node_by_id(id);
        while let Some(node) = current {
            let Some(parent_id) = node.parent.as_deref() else {
                break;
            };
            let Some(parent) = self.node_by_id(parent_id) else {
                break;
            };
            if parent.is_buggy != Some(true) {
                break;
            }
            depth += 1;
            current = Some(parent);
            if depth > self.nodes.len() {
                break;
            }
        }
        depth
    }

    /// draft / debug / improve classification of a prospective child of
    /// `parent` (None ⇒ draft).
    pub fn node_kind(&self, parent: Option<&str>) -> &'static str {
        match parent.and_then(|id| self.node_by_id(id)) {
            None => "draft",
            Some(p) if p.is_buggy == Some(true) => "debug",
            Some(_) => "improve",
        }
    }
}

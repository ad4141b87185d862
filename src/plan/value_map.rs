//! Dense value ids
//!
//! Ids are assigned once per session: graph inputs first, then initializers
//! (by name), then node outputs in topological order. Every frame of the
//! session indexes its value store with these ids.

use std::collections::HashMap;

use crate::error::{ForgeError, ForgeResult};
use crate::graph::Graph;

#[derive(Debug, Clone, Default)]
pub struct ValueNameIdxMap {
    names: Vec<String>,
    ids: HashMap<String, usize>,
}

impl ValueNameIdxMap {
    pub fn new(graph: &Graph) -> Self {
        let mut map = Self::default();
        for name in graph.inputs() {
            map.add(name);
        }
        for name in graph.initializers().keys() {
            map.add(name);
        }
        for &index in graph.topological_order() {
            for out in graph.node(index).output_names() {
                map.add(out);
            }
        }
        map
    }

    fn add(&mut self, name: &str) -> usize {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len();
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.ids.get(name).copied()
    }

    /// Id of `name` or `NotFound`
    pub fn require(&self, name: &str) -> ForgeResult<usize> {
        self.get(name)
            .ok_or_else(|| ForgeError::NotFound(format!("no value named '{}'", name)))
    }

    pub fn name(&self, id: usize) -> &str {
        &self.names[id]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// `(id, name)` pairs in id order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.names.iter().enumerate().map(|(id, n)| (id, n.as_str()))
    }
}

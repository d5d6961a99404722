//! Path resolution
//!
//! Walks a slash-separated virtual path over the node registry and produces
//! a [`Descriptor`]: the resolved node kind for the exact path (`object`),
//! the structure to use when listing it as a directory (`content`), and
//! every path field accumulated on the way down (owner, repo, branch, ...).
//! Resolution is purely structural; no network calls happen here.

use std::collections::{BTreeMap, VecDeque};

use crate::error::{Error, Result};
use crate::github::nodes::{map_lookup, render_template, Child, NodeKind, Structure};

/// What a resolved path contains when listed as a directory
#[derive(Debug, Clone, Copy)]
pub enum Content {
    /// Objects of one node kind
    Node(NodeKind),
    /// A literal virtual directory of fixed segment names
    Map(&'static [(&'static str, Child)]),
}

/// A fully resolved virtual path.
///
/// Fields are only ever added during resolution and lazy header fetches; a
/// field once set is never replaced by a different value.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// The original path, kept for error messages
    pub full_path: String,
    /// Node kind resolved for the exact path
    pub object: NodeKind,
    /// Structure used when listing this path as a directory
    pub content: Content,
    /// Structural parent of the resolved node along the walked route
    pub parent: Option<NodeKind>,
    fields: BTreeMap<&'static str, String>,
}

impl Descriptor {
    fn new(full_path: &str) -> Self {
        Self {
            full_path: full_path.to_string(),
            object: NodeKind::Root,
            content: Content::Node(NodeKind::Owner),
            parent: None,
            fields: BTreeMap::new(),
        }
    }

    /// Get a path field accumulated during resolution.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|v| v.as_str())
    }

    /// Add a field. A field that is already set keeps its value: resolution
    /// only ever adds information.
    pub fn set_field(&mut self, name: &'static str, value: String) {
        self.fields.entry(name).or_insert(value);
    }

    /// Forget a field (used when an ambiguous reference is replaced by the
    /// concrete branch/tag/commit field).
    pub(crate) fn clear_field(&mut self, name: &str) {
        self.fields.remove(name);
    }

    /// Copy fields learned through another descriptor (a parent head call)
    /// into this one. Existing fields keep their values.
    pub(crate) fn adopt_fields(&mut self, other: &Descriptor) {
        for (&name, value) in &other.fields {
            self.fields.entry(name).or_insert_with(|| value.clone());
        }
    }

    /// Render a `{field}` URL template from this descriptor's fields.
    pub fn render(&self, template: &str) -> Result<String> {
        render_template(template, &self.full_path, |name| {
            self.field(name).map(|v| v.to_string())
        })
    }
}

/// Resolve a virtual path into a descriptor.
pub fn resolve(path: &str) -> Result<Descriptor> {
    let mut segments: VecDeque<String> = path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();

    let mut spec = Descriptor::new(path);
    let mut node = NodeKind::Root;
    while !segments.is_empty() {
        node = next_node(node, &mut segments, &mut spec)?;
    }
    Ok(spec)
}

/// One step of the resolution state machine.
///
/// Consumes at least one segment (or empties the queue), so the walk always
/// terminates. On a terminal case the descriptor's `object`/`content` are
/// set and the queue is empty when this returns.
fn next_node(
    node: NodeKind,
    segments: &mut VecDeque<String>,
    spec: &mut Descriptor,
) -> Result<NodeKind> {
    let def = node.def();

    // Leaf: the remainder of the path is one hierarchical field value
    if let Structure::Leaf = def.structure {
        if let Some(key) = def.key {
            let rest: Vec<String> = segments.drain(..).collect();
            spec.set_field(key, rest.join("/"));
        } else {
            segments.clear();
        }
        spec.object = node;
        spec.content = Content::Node(node);
        return Ok(node);
    }

    // Keyed node: exactly one segment becomes its field
    if let Some(key) = def.key {
        if let Some(segment) = segments.pop_front() {
            spec.set_field(key, segment);
        }
    }

    // Path exhausted here: this node is a directory boundary
    let Some(segment) = segments.pop_front() else {
        spec.object = node;
        spec.content = match def.structure {
            Structure::Uniform(child) => Content::Node(child),
            Structure::Map(entries) => Content::Map(entries),
            Structure::Leaf => Content::Node(node),
        };
        return Ok(node);
    };

    match def.structure {
        Structure::Uniform(child) => {
            // The segment belongs to the child; put it back and descend
            segments.push_front(segment);
            spec.parent = Some(node);
            Ok(child)
        }
        Structure::Map(entries) => descend_map(node, entries, segment, segments, spec),
        Structure::Leaf => unreachable!(),
    }
}

/// Walk (possibly nested) literal maps until a node kind is reached or the
/// path ends inside the map.
fn descend_map(
    node: NodeKind,
    entries: &'static [(&'static str, Child)],
    segment: String,
    segments: &mut VecDeque<String>,
    spec: &mut Descriptor,
) -> Result<NodeKind> {
    let mut entries = entries;
    let mut segment = segment;

    loop {
        let child = map_lookup(entries, &segment)
            .ok_or_else(|| Error::NotFound(spec.full_path.clone()))?;

        match child {
            Child::Map(inner) => match segments.pop_front() {
                Some(next) => {
                    entries = inner;
                    segment = next;
                }
                None => {
                    // Path ends on a nested virtual directory
                    spec.object = node;
                    spec.content = Content::Map(inner);
                    return Ok(node);
                }
            },
            Child::Node(child_kind) => match segments.pop_front() {
                Some(next) => {
                    segments.push_front(next);
                    spec.parent = Some(node);
                    return Ok(child_kind);
                }
                None => {
                    // Path ends exactly on this mapping entry
                    let child_def = child_kind.def();
                    if child_def.key.is_some() {
                        // A directory of keyed child objects; its own headers
                        // come from the node holding the map
                        spec.object = node;
                        spec.content = Content::Node(child_kind);
                    } else {
                        spec.object = child_kind;
                        spec.content = match child_def.structure {
                            Structure::Uniform(grand) => Content::Node(grand),
                            Structure::Map(inner) => Content::Map(inner),
                            Structure::Leaf => Content::Node(child_kind),
                        };
                    }
                    return Ok(child_kind);
                }
            },
        }
    }
}

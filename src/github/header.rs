//! Lazy object headers
//!
//! An [`ObjectHeader`] is the materialized instance of a virtual tree node:
//! a capability-set view over header fields that may be known already (from
//! a listing), fetchable through the node's own head call, or borrowed from
//! a named parent kind. The self head call happens at most once per
//! instance; a field still missing afterwards does not exist for this
//! object and fails permanently.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::github::list::list_tree_raw;
use crate::github::nodes::{set_header, NodeKind};
use crate::github::resolve::Descriptor;
use crate::rest::client::check;
use crate::rest::{Method, RestClient};
use crate::system::Headers;

struct Inner {
    spec: Descriptor,
    values: BTreeMap<String, Value>,
    self_fetched: bool,
}

/// Header view over one resolved virtual tree object.
///
/// Owned by the resolution call or stream that created it; holds a shared
/// handle to the REST client.
pub struct ObjectHeader {
    client: Arc<RestClient>,
    node: NodeKind,
    inner: Mutex<Inner>,
}

impl ObjectHeader {
    /// Head the object a descriptor resolves to, eagerly issuing its self
    /// head call. Ambiguous references and the default-branch marker are
    /// resolved to their concrete kind first.
    pub fn fetch(client: Arc<RestClient>, spec: &Descriptor) -> Result<Self> {
        Self::fetch_node(client, spec.object, spec)
    }

    /// Head an explicit node kind against the descriptor (used for parent
    /// head calls).
    pub fn fetch_node(client: Arc<RestClient>, node: NodeKind, spec: &Descriptor) -> Result<Self> {
        let mut spec = spec.clone();
        let (node, known) = resolve_dynamic(&client, &mut spec, node)?;

        match known {
            // A detection probe already returned this object's headers; keep
            // them and defer any further self fetch
            Some(values) => Ok(Self::with_known(client, node, spec, values)),
            None => {
                let mut inner = Inner {
                    spec,
                    values: BTreeMap::new(),
                    self_fetched: true,
                };
                inner.values = head_obj(&client, node, &mut inner.spec)?;
                Ok(Self {
                    client,
                    node,
                    inner: Mutex::new(inner),
                })
            }
        }
    }

    /// Wrap already-known header values (from a listing result) without any
    /// network call; missing fields are fetched lazily on access.
    pub fn with_known(
        client: Arc<RestClient>,
        node: NodeKind,
        spec: Descriptor,
        values: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            client,
            node,
            inner: Mutex::new(Inner {
                spec,
                values,
                self_fetched: false,
            }),
        }
    }

    /// Concrete node kind of this object (references are already resolved).
    pub fn node(&self) -> NodeKind {
        self.node
    }

    /// Snapshot of the descriptor, including fields added by lazy fetches.
    pub fn spec(&self) -> Descriptor {
        self.inner.lock().unwrap().spec.clone()
    }

    /// Get a header field as a string.
    pub fn get_str(&self, key: &str) -> Result<String> {
        match self.get(key)? {
            Value::String(s) => Ok(s),
            other => Ok(other.to_string()),
        }
    }

    /// Ensure the node's own head call ran (at most once per instance).
    fn update_self(&self, inner: &mut Inner) -> Result<()> {
        if inner.self_fetched {
            return Ok(());
        }
        let fetched = head_obj(&self.client, self.node, &mut inner.spec)?;
        inner.values.extend(fetched);
        inner.self_fetched = true;
        Ok(())
    }

    /// Fill the fields borrowed from `parent` by heading the parent kind.
    fn update_from_parent(&self, inner: &mut Inner, parent: NodeKind) -> Result<()> {
        if let Some(parent_key) = parent.def().key {
            if inner.spec.field(parent_key).is_none() {
                self.update_spec_parent_ref(inner, parent_key)?;
            }
        }

        let head = ObjectHeader::fetch_node(Arc::clone(&self.client), parent, &inner.spec)?;
        for (key, from) in self.node.def().head_from {
            if *from == parent {
                inner.values.insert(key.to_string(), head.get(key)?);
            }
        }
        inner.spec.adopt_fields(&head.spec());
        Ok(())
    }

    /// Make the descriptor carry the parent field value so the parent can be
    /// headed.
    fn update_spec_parent_ref(&self, inner: &mut Inner, parent_key: &'static str) -> Result<()> {
        match self.node {
            // Archives name their reference: "v1.0.tar.gz" → ref "v1.0"
            NodeKind::Archive => {
                let name = inner
                    .spec
                    .field("archive")
                    .ok_or_else(|| Error::NotFound(inner.spec.full_path.clone()))?;
                let reference = strip_archive_extension(name).to_string();
                inner.spec.set_field("ref", reference);
                Ok(())
            }
            // Release archives and assets may sit under the latest release,
            // whose tag is only known to the API
            NodeKind::ReleaseArchive => ensure_release_archive_tag(&self.client, &mut inner.spec),
            NodeKind::ReleaseAsset => ensure_release_tag(&self.client, &mut inner.spec),
            _ => {
                self.update_self(inner)?;
                match inner.values.get(parent_key).cloned() {
                    Some(Value::String(value)) => {
                        inner.spec.set_field(parent_key, value);
                        Ok(())
                    }
                    Some(value) => {
                        inner.spec.set_field(parent_key, value.to_string());
                        Ok(())
                    }
                    None => Err(Error::NotFound(inner.spec.full_path.clone())),
                }
            }
        }
    }

    /// Tree entries take their commit fields from the most recent commit
    /// touching the path, found by listing commits filtered on the path
    /// starting at the parent reference's commit.
    fn update_from_latest_commit(&self, inner: &mut Inner) -> Result<()> {
        let parent_kind = inner
            .spec
            .parent
            .ok_or_else(|| Error::NotFound(inner.spec.full_path.clone()))?;
        let parent = ObjectHeader::fetch_node(Arc::clone(&self.client), parent_kind, &inner.spec)?;
        let sha = parent.get_str("sha")?;
        inner.spec.adopt_fields(&parent.spec());

        let path = inner
            .spec
            .field("path")
            .ok_or_else(|| Error::NotFound(inner.spec.full_path.clone()))?
            .to_string();

        let list_path = inner.spec.render("/repos/{owner}/{repo}/commits")?;
        let params = vec![
            ("path".to_string(), path),
            ("sha".to_string(), sha),
        ];
        let (result, _) = self.client.get(&list_path, &params, false)?;
        let latest = result
            .as_array()
            .and_then(|commits| commits.first())
            .ok_or_else(|| Error::NotFound(inner.spec.full_path.clone()))?;

        let commit_header = set_header(NodeKind::Commit, latest);
        for key in ["sha", "pushed_at"] {
            if let Some(value) = commit_header.get(key) {
                inner.values.insert(key.to_string(), value.clone());
            }
        }
        Ok(())
    }
}

impl Headers for ObjectHeader {
    fn get(&self, key: &str) -> Result<Value> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(value) = inner.values.get(key) {
            return Ok(value.clone());
        }

        let borrowed_from = self
            .node
            .def()
            .head_from
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, parent)| *parent);

        if self.node == NodeKind::Tree && borrowed_from.is_some() {
            self.update_from_latest_commit(&mut inner)?;
        } else if let Some(parent) = borrowed_from {
            self.update_from_parent(&mut inner, parent)?;
        } else {
            self.update_self(&mut inner)?;
        }

        inner.values.get(key).cloned().ok_or_else(|| {
            debug!(path = %inner.spec.full_path, key = key, "header field absent for object");
            Error::NotFound(format!("{}#{}", inner.spec.full_path, key))
        })
    }

    fn keys(&self) -> Vec<String> {
        let def = self.node.def();
        let mut keys: Vec<String> = def.head_keys.iter().map(|k| k.to_string()).collect();
        keys.extend(def.head_extra.iter().map(|(k, _)| k.to_string()));
        keys.extend(def.head_from.iter().map(|(k, _)| k.to_string()));
        keys.sort_unstable();
        keys.dedup();

        // Directories have no size
        if self.node == NodeKind::Tree {
            let inner = self.inner.lock().unwrap();
            if let Some(Value::String(mode)) = inner.values.get("mode") {
                if mode.starts_with("040") {
                    keys.retain(|k| k != "size");
                }
            }
        }
        keys
    }
}

/// Resolve dynamic node kinds before heading: the `HEAD` marker becomes the
/// default branch, and an ambiguous reference is probed into a concrete
/// branch, tag or commit.
fn resolve_dynamic(
    client: &Arc<RestClient>,
    spec: &mut Descriptor,
    node: NodeKind,
) -> Result<(NodeKind, Option<BTreeMap<String, Value>>)> {
    match node {
        NodeKind::DefaultBranch => {
            ensure_default_branch(client, spec)?;
            Ok((NodeKind::Branch, None))
        }
        NodeKind::Reference => {
            let Some(reference) = spec.field("ref").map(str::to_string) else {
                // Already detected on an earlier call through this descriptor
                return Ok((spec.object, None));
            };
            if reference == "HEAD" {
                spec.clear_field("ref");
                ensure_default_branch(client, spec)?;
                spec.object = NodeKind::Branch;
                return Ok((NodeKind::Branch, None));
            }
            detect_reference(client, spec, &reference)
        }
        _ => Ok((node, None)),
    }
}

/// Probe candidate kinds for an ambiguous reference segment, in an order
/// decided by its shape: an exact 40-character hex string is most likely a
/// commit hash. One head call per candidate, first success wins.
fn detect_reference(
    client: &Arc<RestClient>,
    spec: &mut Descriptor,
    reference: &str,
) -> Result<(NodeKind, Option<BTreeMap<String, Value>>)> {
    let is_full_sha = reference.len() == 40 && reference.chars().all(|c| c.is_ascii_hexdigit());
    let candidates: [NodeKind; 3] = if is_full_sha {
        [NodeKind::Commit, NodeKind::Branch, NodeKind::Tag]
    } else {
        [NodeKind::Branch, NodeKind::Tag, NodeKind::Commit]
    };

    for candidate in candidates {
        let def = candidate.def();
        let key = def.key.expect("reference candidates are keyed");
        let mut probe = spec.clone();
        probe.clear_field("ref");
        probe.set_field(key, reference.to_string());

        let head_path = probe.render(def.head.expect("reference candidates have a head path"))?;
        match client.get(&head_path, &[], false) {
            Ok((result, _)) => {
                debug!(reference = reference, kind = ?candidate, "reference detected");
                spec.clear_field("ref");
                spec.set_field(key, reference.to_string());
                spec.object = candidate;
                return Ok((candidate, Some(set_header(candidate, &result))));
            }
            Err(Error::NotFound(_)) => continue,
            Err(e) => return Err(e),
        }
    }

    Err(Error::NotFound(spec.full_path.clone()))
}

/// Fill the `branch` field with the repository's default branch.
pub(crate) fn ensure_default_branch(client: &Arc<RestClient>, spec: &mut Descriptor) -> Result<()> {
    if spec.field("branch").is_some() {
        return Ok(());
    }
    let repo_path = spec.render("/repos/{owner}/{repo}")?;
    let (result, _) = client.get(&repo_path, &[], false)?;
    let branch = result["default_branch"]
        .as_str()
        .ok_or_else(|| Error::NotFound(spec.full_path.clone()))?
        .to_string();
    spec.set_field("branch", branch);
    Ok(())
}

/// Raw release document for the resolved release: by tag when known, else the
/// latest release.
pub(crate) fn release_raw(client: &Arc<RestClient>, spec: &Descriptor) -> Result<Value> {
    let path = if spec.field("tag").is_some() {
        spec.render("/repos/{owner}/{repo}/releases/tags/{tag}")?
    } else {
        spec.render("/repos/{owner}/{repo}/releases/latest")?
    };
    Ok(client.get(&path, &[], false)?.0)
}

/// Fill the `tag` field from the release the descriptor points at.
pub(crate) fn ensure_release_tag(client: &Arc<RestClient>, spec: &mut Descriptor) -> Result<()> {
    if spec.field("tag").is_some() {
        return Ok(());
    }
    let release = release_raw(client, spec)?;
    let tag = release["tag_name"]
        .as_str()
        .ok_or_else(|| Error::NotFound(spec.full_path.clone()))?
        .to_string();
    spec.set_field("tag", tag);
    Ok(())
}

/// Fill the release tag and rewrite the generic `source_code.*` archive
/// alias into the tag-versioned archive name.
pub(crate) fn ensure_release_archive_tag(
    client: &Arc<RestClient>,
    spec: &mut Descriptor,
) -> Result<()> {
    ensure_release_tag(client, spec)?;
    if let (Some(archive), Some(tag)) = (spec.field("archive"), spec.field("tag")) {
        if archive.starts_with("source_code") {
            let renamed = archive.replacen("source_code", tag, 1);
            spec.clear_field("archive");
            spec.set_field("archive", renamed);
        }
    }
    Ok(())
}

/// Strip the `.tar.gz` / `.zip` archive extension off a name.
pub(crate) fn strip_archive_extension(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".tar.gz") {
        &name[..name.len() - ".tar.gz".len()]
    } else if let Some(dot) = name.rfind('.') {
        &name[..dot]
    } else {
        name
    }
}

/// The node's own head call ("self head"), dispatched per kind: most kinds
/// have a dedicated head endpoint, tree entries are found by listing their
/// parent tree, assets live inside their release document, and archives are
/// probed with an HTTP `HEAD` on the download URL.
pub(crate) fn head_obj(
    client: &Arc<RestClient>,
    node: NodeKind,
    spec: &mut Descriptor,
) -> Result<BTreeMap<String, Value>> {
    match node {
        NodeKind::Root => Ok(BTreeMap::new()),

        NodeKind::Tree => {
            let path = spec
                .field("path")
                .ok_or_else(|| Error::NotFound(spec.full_path.clone()))?
                .to_string();

            // There is no way to head a tree entry directly; list the parent
            // tree and match the path. Root-level entries allow the lighter
            // non-recursive listing.
            let mut parent_spec = spec.clone();
            parent_spec.clear_field("path");
            if let Some((dir, _)) = path.rsplit_once('/') {
                parent_spec.set_field("path", dir.to_string());
            }
            let first_level = !path.contains('/');

            for entry in list_tree_raw(client, &mut parent_spec, first_level)? {
                if entry.abspath == path {
                    spec.adopt_fields(&parent_spec);
                    return Ok(set_header(NodeKind::Tree, &entry.raw));
                }
            }
            Err(Error::NotFound(spec.full_path.clone()))
        }

        NodeKind::ReleaseAsset => {
            let name = spec
                .field("asset")
                .ok_or_else(|| Error::NotFound(spec.full_path.clone()))?
                .to_string();
            let release = release_raw(client, spec)?;
            let assets = release["assets"].as_array().cloned().unwrap_or_default();
            assets
                .iter()
                .find(|asset| asset["name"] == Value::from(name.clone()))
                .map(|asset| set_header(NodeKind::ReleaseAsset, asset))
                .ok_or_else(|| Error::NotFound(spec.full_path.clone()))
        }

        NodeKind::Archive => archive_head(client, node, spec),

        NodeKind::ReleaseArchive => {
            ensure_release_archive_tag(client, spec)?;
            archive_head(client, node, spec)
        }

        // A commit never changes under its SHA; its head result can be
        // cached forever
        NodeKind::Commit => {
            let path = spec.render(node.def().head.expect("commit has a head path"))?;
            let (result, _) = client.get(&path, &[], true)?;
            Ok(set_header(node, &result))
        }

        _ => {
            let template = node
                .def()
                .head
                .ok_or_else(|| Error::IsADirectory(spec.full_path.clone()))?;
            let path = spec.render(template)?;
            let (result, _) = client.get(&path, &[], false)?;
            Ok(set_header(node, &result))
        }
    }
}

/// Head an archive's download URL for its content type and length. The
/// download host occasionally omits `Content-Length`; retry a couple of
/// times before settling for what we got.
fn archive_head(
    client: &Arc<RestClient>,
    node: NodeKind,
    spec: &mut Descriptor,
) -> Result<BTreeMap<String, Value>> {
    let template = node.def().get.expect("archives have a download template");
    let url = spec.render(template)?;

    let mut response = check(client.request(&url, Method::Head)?, &spec.full_path)?;
    for _ in 0..2 {
        if response.header("content-length").is_some() {
            break;
        }
        response = check(client.request(&url, Method::Head)?, &spec.full_path)?;
    }

    let mut header = BTreeMap::new();
    if let Some(content_type) = response.header("content-type") {
        header.insert("Content-Type".to_string(), Value::from(content_type));
    }
    if let Some(length) = response.header("content-length") {
        let value = length
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(length));
        header.insert("Content-Length".to_string(), value);
    }
    Ok(header)
}

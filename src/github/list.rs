//! Directory listings
//!
//! Listing dispatches on the resolved descriptor's content: literal virtual
//! directories yield their fixed segment names, uniform directories page
//! through the node's list endpoint, and git trees use the recursive
//! git-trees API with a non-recursive per-tree fallback for entries beyond
//! the truncation point.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::github::header::{release_raw, ObjectHeader};
use crate::github::nodes::{set_header, NodeKind};
use crate::github::resolve::{Content, Descriptor};
use crate::github::GithubHeaders;
use crate::rest::RestClient;
use crate::system::{Entry, Headers, StaticHeaders};

/// Header fields a virtual directory borrows from its nearest real parent
const VIRTUAL_KEYS: &[&str] = &["created_at", "pushed_at", "updated_at", "published_at"];

/// Archive flavors synthesized for every git reference
const ARCHIVE_EXTENSIONS: &[&str] = &[".tar.gz", ".zip"];

/// One raw entry from a git tree listing.
pub(crate) struct RawTreeEntry {
    /// Path relative to the listed directory
    pub relpath: String,
    /// Path relative to the repository root
    pub abspath: String,
    pub raw: Value,
    pub is_dir: bool,
}

/// List the immediate children of a resolved directory path.
pub(crate) fn list_content(
    client: &Arc<RestClient>,
    spec: &Descriptor,
) -> Result<Vec<Entry<GithubHeaders>>> {
    match spec.content {
        Content::Map(entries) => list_virtual(client, spec, entries),
        Content::Node(kind) => list_node(client, spec, kind),
    }
}

/// A literal virtual directory: fixed child names, time fields borrowed from
/// the node holding the map.
fn list_virtual(
    client: &Arc<RestClient>,
    spec: &Descriptor,
    entries: &'static [(&'static str, crate::github::nodes::Child)],
) -> Result<Vec<Entry<GithubHeaders>>> {
    let parent = ObjectHeader::fetch(Arc::clone(client), spec)?;
    let mut borrowed = BTreeMap::new();
    for key in VIRTUAL_KEYS {
        if let Ok(value) = parent.get(key) {
            borrowed.insert(key.to_string(), value);
        }
    }

    Ok(entries
        .iter()
        .map(|(name, _)| Entry {
            name: name.to_string(),
            headers: GithubHeaders::Virtual(StaticHeaders(borrowed.clone())),
            is_dir: true,
        })
        .collect())
}

fn list_node(
    client: &Arc<RestClient>,
    spec: &Descriptor,
    kind: NodeKind,
) -> Result<Vec<Entry<GithubHeaders>>> {
    match kind {
        // The API has no owner enumeration
        NodeKind::Owner => Err(Error::Unsupported("listing owners")),
        // A bare blob/tree route carries no reference to enumerate
        NodeKind::Reference | NodeKind::DefaultBranch => {
            Err(Error::Unsupported("listing references"))
        }
        NodeKind::Tree => list_tree(client, spec),
        NodeKind::ReleaseAsset => list_assets(client, spec),
        NodeKind::Archive => list_archives(client, spec),
        NodeKind::ReleaseArchive => list_release_archives(client, spec),
        _ => list_paged(client, spec, kind),
    }
}

/// Uniform directory of keyed objects, paged through the node's list
/// endpoint.
fn list_paged(
    client: &Arc<RestClient>,
    spec: &Descriptor,
    kind: NodeKind,
) -> Result<Vec<Entry<GithubHeaders>>> {
    let def = kind.def();
    let template = def
        .list
        .ok_or_else(|| Error::NotADirectory(spec.full_path.clone()))?;
    let path = spec.render(template)?;

    let mut entries = Vec::new();
    for item in client.get_paged(&path, &[]) {
        let item = item?;
        let Some(name) = item[def.list_key].as_str().map(str::to_string) else {
            continue;
        };

        let mut child_spec = spec.clone();
        if let Some(key) = def.key {
            child_spec.set_field(key, name.clone());
        }
        entries.push(Entry {
            name,
            headers: GithubHeaders::Object(ObjectHeader::with_known(
                Arc::clone(client),
                kind,
                child_spec,
                set_header(kind, &item),
            )),
            is_dir: kind.is_structural_dir(),
        });
    }
    Ok(entries)
}

/// Immediate children of a git tree path.
fn list_tree(client: &Arc<RestClient>, spec: &Descriptor) -> Result<Vec<Entry<GithubHeaders>>> {
    let mut tree_spec = spec.clone();
    let raw_entries = list_tree_raw(client, &mut tree_spec, true)?;

    // Children borrow commit fields through the reference that was walked
    // to reach this directory
    let parent = if spec.object == NodeKind::Tree {
        spec.parent
    } else {
        Some(spec.object)
    };

    Ok(raw_entries
        .into_iter()
        .filter(|entry| !entry.relpath.contains('/'))
        .map(|entry| {
            let mut child_spec = tree_spec.clone();
            child_spec.clear_field("path");
            child_spec.set_field("path", entry.abspath.clone());
            child_spec.object = NodeKind::Tree;
            child_spec.parent = parent;
            Entry {
                name: entry.relpath,
                headers: GithubHeaders::Object(ObjectHeader::with_known(
                    Arc::clone(client),
                    NodeKind::Tree,
                    child_spec,
                    set_header(NodeKind::Tree, &entry.raw),
                )),
                is_dir: entry.is_dir,
            }
        })
        .collect())
}

/// Assets of one release.
fn list_assets(client: &Arc<RestClient>, spec: &Descriptor) -> Result<Vec<Entry<GithubHeaders>>> {
    if spec.field("asset").is_some() {
        return Err(Error::NotADirectory(spec.full_path.clone()));
    }

    let release = release_raw(client, spec)?;
    let assets = release["assets"].as_array().cloned().unwrap_or_default();

    Ok(assets
        .iter()
        .filter_map(|asset| {
            let name = asset["name"].as_str()?.to_string();
            let mut child_spec = spec.clone();
            child_spec.set_field("asset", name.clone());
            Some(Entry {
                name,
                headers: GithubHeaders::Object(ObjectHeader::with_known(
                    Arc::clone(client),
                    NodeKind::ReleaseAsset,
                    child_spec,
                    set_header(NodeKind::ReleaseAsset, asset),
                )),
                is_dir: false,
            })
        })
        .collect())
}

/// Archives synthesized for every tag and branch of the repository.
fn list_archives(client: &Arc<RestClient>, spec: &Descriptor) -> Result<Vec<Entry<GithubHeaders>>> {
    if spec.field("archive").is_some() {
        return Err(Error::NotADirectory(spec.full_path.clone()));
    }

    let mut entries = Vec::new();
    for parent in [NodeKind::Tag, NodeKind::Branch] {
        let def = parent.def();
        let path = spec.render(def.list.expect("tags and branches are listable"))?;
        let (result, _) = client.get(&path, &[], false)?;

        for reference in result.as_array().cloned().unwrap_or_default() {
            let Some(ref_name) = reference[def.list_key].as_str() else {
                continue;
            };
            let ref_header = set_header(parent, &reference);
            for ext in ARCHIVE_EXTENSIONS {
                let name = format!("{}{}", ref_name, ext);
                let mut child_spec = spec.clone();
                child_spec.set_field("archive", name.clone());
                child_spec.set_field(def.key.expect("tags and branches are keyed"), ref_name.to_string());
                entries.push(Entry {
                    name,
                    headers: GithubHeaders::Object(ObjectHeader::with_known(
                        Arc::clone(client),
                        NodeKind::Archive,
                        child_spec,
                        ref_header.clone(),
                    )),
                    is_dir: false,
                });
            }
        }
    }
    Ok(entries)
}

/// Release archives under their version-independent aliases, so the latest
/// release's archive can be addressed without knowing its tag.
fn list_release_archives(
    client: &Arc<RestClient>,
    spec: &Descriptor,
) -> Result<Vec<Entry<GithubHeaders>>> {
    if spec.field("archive").is_some() {
        return Err(Error::NotADirectory(spec.full_path.clone()));
    }

    let mut entries = Vec::new();
    for ext in ARCHIVE_EXTENSIONS {
        let name = format!("source_code{}", ext);
        let mut child_spec = spec.clone();
        child_spec.set_field("archive", name.clone());
        child_spec.object = NodeKind::ReleaseArchive;
        entries.push(Entry {
            name,
            headers: GithubHeaders::Object(ObjectHeader::fetch_node(
                Arc::clone(client),
                NodeKind::ReleaseArchive,
                &child_spec,
            )?),
            is_dir: false,
        });
    }
    Ok(entries)
}

/// Make the descriptor carry the SHA of the tree to list, heading the parent
/// reference when needed.
fn ensure_tree_sha(client: &Arc<RestClient>, spec: &mut Descriptor) -> Result<()> {
    if spec.field("tree_sha").is_some() {
        return Ok(());
    }
    let parent_kind = if spec.object == NodeKind::Tree {
        spec.parent
            .ok_or_else(|| Error::NotFound(spec.full_path.clone()))?
    } else {
        spec.object
    };
    let parent = ObjectHeader::fetch_node(Arc::clone(client), parent_kind, spec)?;
    let tree_sha = parent.get_str("tree_sha")?;
    spec.adopt_fields(&parent.spec());
    spec.set_field("tree_sha", tree_sha);
    Ok(())
}

/// How a tree entry's absolute path relates to the listed directory.
enum Relation {
    /// Under the directory, with the path relative to it ("" = the
    /// directory itself)
    Inside(String),
    /// An ancestor directory of the listed one
    Ancestor,
    Outside,
}

fn relate(abspath: &str, cwd: &str) -> Relation {
    if cwd.is_empty() {
        return Relation::Inside(abspath.to_string());
    }
    if abspath == cwd {
        return Relation::Inside(String::new());
    }
    if let Some(rel) = abspath.strip_prefix(cwd).and_then(|r| r.strip_prefix('/')) {
        return Relation::Inside(rel.to_string());
    }
    if cwd.strip_prefix(abspath).is_some_and(|r| r.starts_with('/')) {
        return Relation::Ancestor;
    }
    Relation::Outside
}

/// Raw git tree listing rooted at the descriptor path.
///
/// Uses the recursive trees API first (cached forever, a tree SHA is
/// immutable). When the response is truncated, the remainder is recovered by
/// walking child trees with the non-recursive API, skipping entries already
/// seen and re-entering the trees on the truncation boundary.
pub(crate) fn list_tree_raw(
    client: &Arc<RestClient>,
    spec: &mut Descriptor,
    first_level: bool,
) -> Result<Vec<RawTreeEntry>> {
    ensure_tree_sha(client, spec)?;

    let cwd = spec
        .field("path")
        .unwrap_or("")
        .trim_end_matches('/')
        .to_string();

    let list_path = spec.render("/repos/{owner}/{repo}/git/trees/{tree_sha}")?;
    let recursive = !cwd.is_empty() || !first_level;
    let params: Vec<(String, String)> = if recursive {
        vec![("recursive".to_string(), "1".to_string())]
    } else {
        Vec::new()
    };
    let (result, _) = client.get(&list_path, &params, true)?;

    let truncated = result["truncated"].as_bool().unwrap_or(false);
    let mut seen = HashSet::new();
    let mut last_tree = String::new();
    let mut entries = Vec::new();

    for raw in result["tree"].as_array().cloned().unwrap_or_default() {
        let abspath = raw["path"].as_str().unwrap_or("").to_string();
        let relpath = match relate(&abspath, &cwd) {
            Relation::Inside(rel) => rel,
            _ => continue,
        };
        let is_dir = raw["type"] == "tree";

        if relpath.is_empty() {
            // The listed path itself: a file here cannot be listed
            if !is_dir {
                return Err(Error::NotADirectory(spec.full_path.clone()));
            }
            continue;
        }

        if truncated {
            seen.insert(abspath.clone());
            if is_dir {
                last_tree = abspath.clone();
            }
        }

        entries.push(RawTreeEntry {
            relpath,
            abspath,
            raw,
            is_dir,
        });
    }

    if truncated {
        debug!(path = %spec.full_path, "tree listing truncated, walking child trees");

        // Trees on the truncation boundary may have been cut mid-way; the
        // last tree seen and each of its ancestors must be re-entered
        let mut partial_trees: HashSet<String> = HashSet::new();
        let parts: Vec<&str> = last_tree.split('/').collect();
        for index in 0..=parts.len() {
            partial_trees.insert(parts[..index].join("/"));
        }

        let tree_sha = spec
            .field("tree_sha")
            .expect("tree sha ensured above")
            .to_string();
        list_tree_fallback(
            client,
            spec,
            &mut entries,
            &seen,
            &partial_trees,
            &cwd,
            &tree_sha,
            "",
            first_level,
        )?;
    }

    Ok(entries)
}

/// Non-recursive per-tree walk completing a truncated recursive listing.
#[allow(clippy::too_many_arguments)]
fn list_tree_fallback(
    client: &Arc<RestClient>,
    spec: &Descriptor,
    entries: &mut Vec<RawTreeEntry>,
    seen: &HashSet<String>,
    partial_trees: &HashSet<String>,
    cwd: &str,
    tree_sha: &str,
    tree_path: &str,
    first_level: bool,
) -> Result<()> {
    let mut tree_spec = spec.clone();
    tree_spec.clear_field("tree_sha");
    tree_spec.set_field("tree_sha", tree_sha.to_string());
    let list_path = tree_spec.render("/repos/{owner}/{repo}/git/trees/{tree_sha}")?;
    let (result, _) = client.get(&list_path, &[], true)?;

    for raw in result["tree"].as_array().cloned().unwrap_or_default() {
        let name = raw["path"].as_str().unwrap_or("");
        let abspath = if tree_path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", tree_path, name)
        };

        let (in_cwd, relpath) = match relate(&abspath, cwd) {
            Relation::Inside(rel) => (true, rel),
            Relation::Ancestor => (false, String::new()),
            Relation::Outside => continue,
        };
        let is_dir = raw["type"] == "tree";

        if in_cwd && relpath.is_empty() && !is_dir {
            return Err(Error::NotADirectory(spec.full_path.clone()));
        }

        let not_seen = !seen.contains(&abspath);
        if in_cwd && !relpath.is_empty() && not_seen {
            entries.push(RawTreeEntry {
                relpath,
                abspath: abspath.clone(),
                raw: raw.clone(),
                is_dir,
            });
        }

        if is_dir
            && (!in_cwd || !first_level)
            && (not_seen || partial_trees.contains(&abspath))
        {
            let child_sha = raw["sha"].as_str().unwrap_or("").to_string();
            list_tree_fallback(
                client,
                spec,
                entries,
                seen,
                partial_trees,
                cwd,
                &child_sha,
                &abspath,
                first_level,
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relate() {
        assert!(matches!(relate("a/b", ""), Relation::Inside(r) if r == "a/b"));
        assert!(matches!(relate("a/b", "a/b"), Relation::Inside(r) if r.is_empty()));
        assert!(matches!(relate("a/b/c", "a/b"), Relation::Inside(r) if r == "c"));
        assert!(matches!(relate("a", "a/b"), Relation::Ancestor));
        assert!(matches!(relate("ax/b", "a"), Relation::Outside));
        assert!(matches!(relate("z", "a/b"), Relation::Outside));
    }
}

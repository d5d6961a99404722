//! The virtual tree node registry
//!
//! Every kind of virtual filesystem entry (owner, repository, branch, tree
//! entry, release, ...) is described by a static [`NodeDef`]: which path
//! segment it consumes, the REST paths to head and list it, which header
//! fields it owns, which it borrows from a parent kind, and what its
//! children look like. The path resolver walks this table; nothing here
//! carries runtime state.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{Error, Result};

/// Base URL of the REST API
pub const GITHUB_API: &str = "https://api.github.com";

/// Git mode of a directory tree entry
pub const GIT_MODE_DIR: &str = "040";

/// Git mode of a regular file tree entry
pub const GIT_MODE_FILE: &str = "100";

/// Git mode of a symlink tree entry
pub const GIT_MODE_SYMLINK: &str = "120000";

/// Kinds of virtual tree nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Root,
    Owner,
    Repo,
    Branch,
    Commit,
    Tag,
    Tree,
    /// Ambiguous git reference: resolved to a branch, tag or commit by
    /// probing head calls in segment-shape order
    Reference,
    /// The repository's default branch (the `HEAD` path segment)
    DefaultBranch,
    Release,
    LatestRelease,
    /// `releases/download/<tag>/<asset>` subtree
    ReleaseDownload,
    ReleaseAsset,
    /// Tarball/zipball of any git reference
    Archive,
    /// Tarball/zipball of a release, with `source_code.*` aliases
    ReleaseArchive,
}

/// A child slot in a heterogeneous structure
#[derive(Debug, Clone, Copy)]
pub enum Child {
    Node(NodeKind),
    Map(&'static [(&'static str, Child)]),
}

/// Child structure of a node kind. Exactly one shape holds per kind.
#[derive(Debug, Clone, Copy)]
pub enum Structure {
    /// No children: the node consumes the remaining path as its field value
    Leaf,
    /// Uniform children of one kind
    Uniform(NodeKind),
    /// Literal path segments mapping to child kinds
    Map(&'static [(&'static str, Child)]),
}

/// Static description of one node kind
pub struct NodeDef {
    /// Descriptor field this node's path segment is stored under
    pub key: Option<&'static str>,
    /// REST path template heading one object of this kind
    pub head: Option<&'static str>,
    /// REST path template listing objects of this kind
    pub list: Option<&'static str>,
    /// Response key carrying the object name in list results
    pub list_key: &'static str,
    /// Response keys kept as header fields
    pub head_keys: &'static [&'static str],
    /// Header fields extracted from nested response paths
    pub head_extra: &'static [(&'static str, &'static [&'static str])],
    /// Header fields borrowed from a parent kind's head call
    pub head_from: &'static [(&'static str, NodeKind)],
    /// Download URL template for the object content
    pub get: Option<&'static str>,
    /// Symlink target template, when the node is symlink-like
    pub symlink: Option<&'static str>,
    pub structure: Structure,
}

const EMPTY: NodeDef = NodeDef {
    key: None,
    head: None,
    list: None,
    list_key: "name",
    head_keys: &[],
    head_extra: &[],
    head_from: &[],
    get: None,
    symlink: None,
    structure: Structure::Leaf,
};

static REPO_STRUCT: &[(&str, Child)] = &[
    ("HEAD", Child::Node(NodeKind::DefaultBranch)),
    ("archive", Child::Node(NodeKind::Archive)),
    ("blob", Child::Node(NodeKind::Reference)),
    ("branches", Child::Node(NodeKind::Branch)),
    ("commits", Child::Node(NodeKind::Commit)),
    (
        "refs",
        Child::Map(&[
            ("heads", Child::Node(NodeKind::Branch)),
            ("tags", Child::Node(NodeKind::Tag)),
        ]),
    ),
    (
        "releases",
        Child::Map(&[
            ("download", Child::Node(NodeKind::ReleaseDownload)),
            ("latest", Child::Node(NodeKind::LatestRelease)),
            ("tag", Child::Node(NodeKind::Release)),
        ]),
    ),
    ("tags", Child::Node(NodeKind::Tag)),
    ("tree", Child::Node(NodeKind::Reference)),
];

static RELEASE_STRUCT: &[(&str, Child)] = &[
    ("archive", Child::Node(NodeKind::ReleaseArchive)),
    ("assets", Child::Node(NodeKind::ReleaseAsset)),
    ("tree", Child::Node(NodeKind::Tree)),
];

static ROOT: NodeDef = NodeDef {
    structure: Structure::Uniform(NodeKind::Owner),
    ..EMPTY
};

static OWNER: NodeDef = NodeDef {
    key: Some("owner"),
    head: Some("/users/{owner}"),
    head_keys: &[
        "created_at",
        "updated_at",
        "type",
        "public_repos",
        "public_gists",
        "followers",
        "following",
    ],
    structure: Structure::Uniform(NodeKind::Repo),
    ..EMPTY
};

static REPO: NodeDef = NodeDef {
    key: Some("repo"),
    head: Some("/repos/{owner}/{repo}"),
    list: Some("/users/{owner}/repos"),
    head_keys: &[
        "created_at",
        "updated_at",
        "pushed_at",
        "private",
        "forks_count",
        "open_issues_count",
        "stargazers_count",
        "subscribers_count",
        "watchers_count",
        "default_branch",
    ],
    structure: Structure::Map(REPO_STRUCT),
    ..EMPTY
};

static BRANCH: NodeDef = NodeDef {
    key: Some("branch"),
    head: Some("/repos/{owner}/{repo}/branches/{branch}"),
    list: Some("/repos/{owner}/{repo}/branches"),
    head_extra: &[
        ("pushed_at", &["commit", "commit", "committer", "date"]),
        ("sha", &["commit", "sha"]),
        ("tree_sha", &["commit", "commit", "tree", "sha"]),
    ],
    symlink: Some("github://{owner}/{repo}/commits/{sha}"),
    structure: Structure::Uniform(NodeKind::Tree),
    ..EMPTY
};

static COMMIT: NodeDef = NodeDef {
    key: Some("sha"),
    head: Some("/repos/{owner}/{repo}/commits/{sha}"),
    list: Some("/repos/{owner}/{repo}/commits"),
    list_key: "sha",
    head_keys: &["sha"],
    head_extra: &[
        ("pushed_at", &["commit", "committer", "date"]),
        ("tree_sha", &["commit", "tree", "sha"]),
    ],
    structure: Structure::Uniform(NodeKind::Tree),
    ..EMPTY
};

static TAG: NodeDef = NodeDef {
    key: Some("tag"),
    head: Some("/repos/{owner}/{repo}/git/ref/tags/{tag}"),
    list: Some("/repos/{owner}/{repo}/tags"),
    // Annotated and lightweight tags disclose the commit SHA differently
    head_extra: &[
        ("sha", &["object", "sha"]),
        ("sha", &["commit", "sha"]),
    ],
    head_from: &[
        ("pushed_at", NodeKind::Commit),
        ("tree_sha", NodeKind::Commit),
    ],
    symlink: Some("github://{owner}/{repo}/commits/{sha}"),
    structure: Structure::Uniform(NodeKind::Tree),
    ..EMPTY
};

static TREE: NodeDef = NodeDef {
    key: Some("path"),
    list: Some("/repos/{owner}/{repo}/git/trees/{tree_sha}"),
    head_keys: &["mode", "size"],
    // sha/pushed_at come from the most recent commit touching the path;
    // the borrowing parent depends on the route walked (branch, tag, ...)
    head_from: &[
        ("sha", NodeKind::Commit),
        ("pushed_at", NodeKind::Commit),
    ],
    get: Some("https://raw.githubusercontent.com/{owner}/{repo}/{ref}/{path}"),
    structure: Structure::Leaf,
    ..EMPTY
};

static REFERENCE: NodeDef = NodeDef {
    key: Some("ref"),
    // Symlink-like: the target is the detected concrete reference
    symlink: Some(""),
    structure: Structure::Uniform(NodeKind::Tree),
    ..EMPTY
};

static DEFAULT_BRANCH: NodeDef = NodeDef {
    symlink: Some("github://{owner}/{repo}/branches/{branch}"),
    structure: Structure::Uniform(NodeKind::Tree),
    ..EMPTY
};

static RELEASE: NodeDef = NodeDef {
    key: Some("tag"),
    head: Some("/repos/{owner}/{repo}/releases/tags/{tag}"),
    list: Some("/repos/{owner}/{repo}/releases"),
    list_key: "tag_name",
    head_keys: &["prerelease", "created_at", "published_at", "name"],
    head_extra: &[("tag", &["tag_name"])],
    head_from: &[("sha", NodeKind::Tag), ("tree_sha", NodeKind::Commit)],
    structure: Structure::Map(RELEASE_STRUCT),
    ..EMPTY
};

static LATEST_RELEASE: NodeDef = NodeDef {
    key: None,
    head: Some("/repos/{owner}/{repo}/releases/latest"),
    head_keys: &["prerelease", "created_at", "published_at", "name"],
    head_extra: &[("tag", &["tag_name"])],
    head_from: &[("sha", NodeKind::Tag), ("tree_sha", NodeKind::Commit)],
    symlink: Some("https://github.com/{owner}/{repo}/releases/tag/{tag}"),
    structure: Structure::Map(RELEASE_STRUCT),
    ..EMPTY
};

static RELEASE_DOWNLOAD: NodeDef = NodeDef {
    key: Some("tag"),
    head: Some("/repos/{owner}/{repo}/releases/tags/{tag}"),
    list: Some("/repos/{owner}/{repo}/releases"),
    list_key: "tag_name",
    head_keys: &["prerelease", "created_at", "published_at", "name"],
    head_from: &[("sha", NodeKind::Tag), ("tree_sha", NodeKind::Commit)],
    structure: Structure::Uniform(NodeKind::ReleaseAsset),
    ..EMPTY
};

static RELEASE_ASSET: NodeDef = NodeDef {
    key: Some("asset"),
    head_keys: &[
        "size",
        "download_count",
        "created_at",
        "updated_at",
        "content_type",
    ],
    head_from: &[("sha", NodeKind::Tag)],
    get: Some("https://github.com/{owner}/{repo}/releases/download/{tag}/{asset}"),
    structure: Structure::Leaf,
    ..EMPTY
};

static ARCHIVE: NodeDef = NodeDef {
    key: Some("archive"),
    head_keys: &["Content-Type", "Content-Length"],
    head_from: &[
        ("pushed_at", NodeKind::Reference),
        ("sha", NodeKind::Reference),
    ],
    get: Some("https://github.com/{owner}/{repo}/archive/{archive}"),
    structure: Structure::Leaf,
    ..EMPTY
};

static RELEASE_ARCHIVE: NodeDef = NodeDef {
    key: Some("archive"),
    head_keys: &["Content-Type", "Content-Length"],
    head_from: &[("pushed_at", NodeKind::Tag), ("sha", NodeKind::Tag)],
    get: Some("https://github.com/{owner}/{repo}/archive/{archive}"),
    structure: Structure::Leaf,
    ..EMPTY
};

impl NodeKind {
    /// Static definition of this kind
    pub fn def(self) -> &'static NodeDef {
        match self {
            NodeKind::Root => &ROOT,
            NodeKind::Owner => &OWNER,
            NodeKind::Repo => &REPO,
            NodeKind::Branch => &BRANCH,
            NodeKind::Commit => &COMMIT,
            NodeKind::Tag => &TAG,
            NodeKind::Tree => &TREE,
            NodeKind::Reference => &REFERENCE,
            NodeKind::DefaultBranch => &DEFAULT_BRANCH,
            NodeKind::Release => &RELEASE,
            NodeKind::LatestRelease => &LATEST_RELEASE,
            NodeKind::ReleaseDownload => &RELEASE_DOWNLOAD,
            NodeKind::ReleaseAsset => &RELEASE_ASSET,
            NodeKind::Archive => &ARCHIVE,
            NodeKind::ReleaseArchive => &RELEASE_ARCHIVE,
        }
    }

    /// Whether paths of this kind denote virtual directories by structure
    /// alone (real file-vs-directory detection for tree entries needs the
    /// git mode bits).
    pub fn is_structural_dir(self) -> bool {
        !matches!(self.def().structure, Structure::Leaf)
    }
}

/// Project the header fields a node kind owns out of a raw API response.
pub fn set_header(node: NodeKind, response: &Value) -> BTreeMap<String, Value> {
    let def = node.def();
    let mut header = BTreeMap::new();

    for key in def.head_keys {
        if let Some(value) = response.get(key) {
            header.insert(key.to_string(), value.clone());
        }
    }

    for (name, path) in def.head_extra {
        let mut value = response;
        let mut found = true;
        for step in *path {
            match value.get(step) {
                Some(next) => value = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            header.insert(name.to_string(), value.clone());
        }
    }

    header
}

/// Look up a segment in a heterogeneous child map.
pub fn map_lookup(
    entries: &'static [(&'static str, Child)],
    segment: &str,
) -> Option<Child> {
    entries
        .iter()
        .find(|(name, _)| *name == segment)
        .map(|(_, child)| *child)
}

/// Render a `{field}`-placeholder template from descriptor fields.
///
/// The `ref` placeholder falls back through the concrete reference fields
/// (`ref`, `branch`, `tag`, `sha`) so one download template serves every
/// route into a tree.
pub fn render_template(
    template: &str,
    full_path: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            // Unbalanced brace in a template is literal text
            out.push('{');
            rest = after;
            continue;
        };
        let name = &after[..close];

        let value = if name == "ref" {
            ["ref", "branch", "tag", "sha"]
                .iter()
                .find_map(|candidate| lookup(candidate))
        } else {
            lookup(name)
        };
        match value {
            Some(value) => out.push_str(&value),
            None => return Err(Error::NotFound(full_path.to_string())),
        }

        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_exactly_one_structure_shape() {
        let kinds = [
            NodeKind::Root,
            NodeKind::Owner,
            NodeKind::Repo,
            NodeKind::Branch,
            NodeKind::Commit,
            NodeKind::Tag,
            NodeKind::Tree,
            NodeKind::Reference,
            NodeKind::DefaultBranch,
            NodeKind::Release,
            NodeKind::LatestRelease,
            NodeKind::ReleaseDownload,
            NodeKind::ReleaseAsset,
            NodeKind::Archive,
            NodeKind::ReleaseArchive,
        ];
        for kind in kinds {
            // Leaf kinds must consume the path remainder into a field
            if let Structure::Leaf = kind.def().structure {
                assert!(
                    kind.def().key.is_some(),
                    "leaf kind {:?} without a field key",
                    kind
                );
            }
        }
    }

    #[test]
    fn test_repo_struct_holds_the_route_segments() {
        for segment in ["HEAD", "archive", "blob", "branches", "commits", "refs", "releases", "tags", "tree"] {
            assert!(
                map_lookup(REPO_STRUCT, segment).is_some(),
                "missing {}",
                segment
            );
        }
        assert!(map_lookup(REPO_STRUCT, "pulls").is_none());
    }

    #[test]
    fn test_set_header_filters_and_extracts() {
        let response = serde_json::json!({
            "name": "main",
            "protected": true,
            "commit": {
                "sha": "abc123",
                "commit": {
                    "committer": {"date": "2024-01-01T00:00:00Z"},
                    "tree": {"sha": "def456"}
                }
            }
        });

        let header = set_header(NodeKind::Branch, &response);
        assert_eq!(header["sha"], "abc123");
        assert_eq!(header["tree_sha"], "def456");
        assert_eq!(header["pushed_at"], "2024-01-01T00:00:00Z");
        // Keys the node does not declare are dropped
        assert!(!header.contains_key("protected"));
    }

    #[test]
    fn test_set_header_tag_sha_variants() {
        // Annotated tag: SHA under object.sha
        let annotated = serde_json::json!({"object": {"sha": "aaa"}});
        assert_eq!(set_header(NodeKind::Tag, &annotated)["sha"], "aaa");

        // Listing result shape: SHA under commit.sha
        let listed = serde_json::json!({"commit": {"sha": "bbb"}});
        assert_eq!(set_header(NodeKind::Tag, &listed)["sha"], "bbb");
    }

    #[test]
    fn test_render_template() {
        let lookup = |name: &str| match name {
            "owner" => Some("octo".to_string()),
            "repo" => Some("hello".to_string()),
            "branch" => Some("main".to_string()),
            "path" => Some("src/lib.rs".to_string()),
            _ => None,
        };

        let url = render_template(
            "https://raw.githubusercontent.com/{owner}/{repo}/{ref}/{path}",
            "p",
            lookup,
        )
        .unwrap();
        // {ref} fell back to the branch field
        assert_eq!(url, "https://raw.githubusercontent.com/octo/hello/main/src/lib.rs");

        assert!(render_template("/users/{owner}/{missing}", "p", lookup).is_err());
    }
}

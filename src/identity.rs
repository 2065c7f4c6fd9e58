use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

/// 128-bit identifier for a node participating in the mesh.
pub type NodeId = Uuid;

const MAX_NODE_NAME_LEN: usize = 29;

/// Owns the NodeId for the lifetime of a process.
///
/// Identity is constructed explicitly by whoever starts a node; there is no
/// global singleton, so multiple instances can coexist in one process (tests,
/// multi-node simulations) without fighting over shared state.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    node_id: NodeId,
    name: String,
}

impl NodeIdentity {
    /// Build an identity with a fresh random NodeId. Never touches disk.
    pub fn new_ephemeral() -> Self {
        let node_id = Uuid::new_v4();
        let name = derive_name(&node_id);
        Self { node_id, name }
    }

    /// Load the NodeId from `config_dir/node-id`, creating and persisting a
    /// fresh one if the file is absent, unreadable, or holds the nil id.
    ///
    /// Persistence failures are logged and swallowed: identity always
    /// succeeds, falling back to an ephemeral id rather than failing the
    /// caller's startup.
    pub fn new_persistent(config_dir: &Path) -> Self {
        let path = node_id_path(config_dir);
        if let Some(existing) = read_node_id(&path) {
            let name = derive_name(&existing);
            return Self { node_id: existing, name };
        }

        let identity = Self::new_ephemeral();
        if let Err(err) = persist_node_id(&path, &identity.node_id) {
            warn!(error = %err, path = %path.display(), "failed to persist node id, continuing ephemeral");
        }
        identity
    }

    /// Produce and persist a fresh NodeId, replacing whatever was recorded.
    /// Used for collision recovery and for tests that need two identities
    /// with deterministic provenance.
    pub fn regenerate(&mut self, config_dir: Option<&Path>) {
        self.node_id = Uuid::new_v4();
        self.name = derive_name(&self.node_id);
        if let Some(dir) = config_dir {
            let path = node_id_path(dir);
            if let Err(err) = persist_node_id(&path, &self.node_id) {
                warn!(error = %err, path = %path.display(), "failed to persist regenerated node id");
            }
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn node_id_path(config_dir: &Path) -> PathBuf {
    config_dir.join("node-id")
}

fn read_node_id(path: &Path) -> Option<NodeId> {
    let contents = fs::read_to_string(path).ok()?;
    let id = Uuid::parse_str(contents.trim()).ok()?;
    if id.is_nil() {
        return None;
    }
    Some(id)
}

fn persist_node_id(path: &Path, id: &NodeId) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, id.to_string())
}

/// `sanitize(hostname) + "-" + first 8 hex chars of the node id`, truncated
/// so the whole name stays short enough for display in logs and on-wire
/// diagnostics.
fn derive_name(node_id: &NodeId) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "node".to_string());
    let sanitized = sanitize_hostname(&host);
    let suffix = &node_id.simple().to_string()[..8];
    let mut name = format!("{sanitized}-{suffix}");
    name.truncate(MAX_NODE_NAME_LEN);
    name
}

fn sanitize_hostname(host: &str) -> String {
    let lowered = host.to_lowercase();
    let replaced: String = lowered
        .chars()
        .map(|c| if c == ' ' || c == '_' { '-' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    let mut truncated = replaced;
    truncated.truncate(20);
    if truncated.is_empty() {
        "node".to_string()
    } else {
        truncated
    }
}

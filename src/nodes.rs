//! Proxy node records and the persisted node store
//!
//! A node is an ordered JSON object keyed by `name`. Only the name is
//! interpreted; every other field, known or not, is carried through merges
//! byte-for-byte in the order it arrived.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{XstreamError, XstreamResult};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// One proxy node definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct VpnNode {
    fields: Map<String, Value>,
}

impl VpnNode {
    pub fn new(name: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("name".to_string(), Value::String(name.into()));
        Self { fields }
    }

    /// Set a field, keeping its position if it already exists
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != "name" {
            self.fields.insert(key, value.into());
        }
        self
    }

    pub fn name(&self) -> &str {
        self.fields
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn host(&self) -> Option<&str> {
        self.fields.get("host").and_then(Value::as_str)
    }

    pub fn port(&self) -> Option<u16> {
        self.fields
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
    }

    pub fn protocol_params(&self) -> Option<&Value> {
        self.fields.get("protocolParams")
    }

    pub fn enabled(&self) -> Option<bool> {
        self.fields.get("enabled").and_then(Value::as_bool)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl TryFrom<Map<String, Value>> for VpnNode {
    type Error = XstreamError;

    fn try_from(fields: Map<String, Value>) -> Result<Self, Self::Error> {
        match fields.get("name") {
            Some(Value::String(name)) if !name.is_empty() => Ok(Self { fields }),
            Some(Value::String(_)) => Err(XstreamError::InvalidArgument(
                "node name cannot be empty".to_string(),
            )),
            _ => Err(XstreamError::InvalidArgument(
                "node record is missing a string `name`".to_string(),
            )),
        }
    }
}

impl From<VpnNode> for Map<String, Value> {
    fn from(node: VpnNode) -> Self {
        node.fields
    }
}

impl From<VpnNode> for Value {
    fn from(node: VpnNode) -> Self {
        Value::Object(node.fields)
    }
}

/// Upsert `incoming` into `existing` by name
///
/// Matches are replaced in place, misses are appended in arrival order and
/// untouched records keep their position.
pub fn merge(mut existing: Vec<VpnNode>, incoming: Vec<VpnNode>) -> Vec<VpnNode> {
    for node in incoming {
        match existing.iter().position(|n| n.name() == node.name()) {
            Some(index) => {
                debug!("Replacing node {}", node.name());
                existing[index] = node;
            }
            None => {
                debug!("Appending node {}", node.name());
                existing.push(node);
            }
        }
    }
    existing
}

/// Parse caller-supplied node records, rejecting the batch on the first bad one
pub fn parse_incoming(value: Value) -> XstreamResult<Vec<VpnNode>> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(XstreamError::InvalidArgument(format!(
                "node records must be a JSON array, got {}",
                json_type(&other)
            )))
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(fields) => VpnNode::try_from(fields).map_err(|e| {
                XstreamError::InvalidArgument(format!("node record {}: {}", i, e))
            }),
            other => Err(XstreamError::InvalidArgument(format!(
                "node record {} must be an object, got {}",
                i,
                json_type(&other)
            ))),
        })
        .collect()
}

/// Parse a persisted store; `None` when it is not a valid node list
///
/// Repeated names collapse the way an incoming batch does: the first
/// position is kept and the last record wins.
fn parse_store(bytes: &[u8]) -> Option<Vec<VpnNode>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Some(Vec::new());
    }
    let value: Value = serde_json::from_slice(bytes).ok()?;
    let stored = parse_incoming(value).ok()?;
    let len = stored.len();
    let nodes = merge(Vec::with_capacity(len), stored);
    if nodes.len() != len {
        warn!("Node store held {} duplicate name(s), collapsed", len - nodes.len());
    }
    Some(nodes)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Result of one read-merge-write cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeOutcome {
    pub nodes: Vec<VpnNode>,
    /// The previous store was unreadable and has been set aside
    pub recovered: bool,
}

impl MergeOutcome {
    pub fn count(&self) -> usize {
        self.nodes.len()
    }
}

/// Exclusive advisory lock on a sidecar file, released on drop
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        #[cfg(unix)]
        {
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        }
    }
}

/// JSON-array node store on disk
pub struct NodeStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl NodeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Current node list; an unreadable store reads as empty
    pub async fn load(&self) -> XstreamResult<Vec<VpnNode>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(parse_store(&bytes).unwrap_or_else(|| {
                warn!("Node store {:?} is malformed, treating as empty", self.path);
                Vec::new()
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Merge `incoming` into the store as one atomic read-merge-write
    pub async fn merge(&self, incoming: Vec<VpnNode>) -> XstreamResult<MergeOutcome> {
        let _guard = self.lock.lock().await;

        let path = self.path.clone();
        let lock_path = self.lock_path();
        let incoming_len = incoming.len();

        let outcome = tokio::task::spawn_blocking(move || merge_locked(&path, &lock_path, incoming))
            .await
            .map_err(|e| XstreamError::Io(io::Error::other(format!("node store task failed: {}", e))))??;

        info!(
            "Merged {} node(s) into {:?}, store now holds {}",
            incoming_len,
            self.path,
            outcome.count()
        );
        Ok(outcome)
    }
}

fn merge_locked(path: &Path, lock_path: &Path, incoming: Vec<VpnNode>) -> XstreamResult<MergeOutcome> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _flock = FileLock::acquire(lock_path)?;

    let mut recovered = false;
    let existing = match std::fs::read(path) {
        Ok(bytes) => match parse_store(&bytes) {
            Some(nodes) => nodes,
            None => {
                let backup = backup_path(path);
                warn!("Node store {:?} is malformed, moving it to {:?} and starting empty", path, backup);
                std::fs::rename(path, &backup)?;
                recovered = true;
                Vec::new()
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let nodes = merge(existing, incoming);
    write_atomically(path, &nodes)?;

    Ok(MergeOutcome { nodes, recovered })
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".corrupt-{}", chrono::Local::now().format("%Y%m%d%H%M%S")));
    PathBuf::from(name)
}

fn write_atomically(path: &Path, nodes: &[VpnNode]) -> XstreamResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "vpn_nodes.json".to_string());
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let mut content = serde_json::to_vec_pretty(nodes)?;
    content.push(b'\n');

    let result = (|| -> io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(&content)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nodes(value: Value) -> Vec<VpnNode> {
        parse_incoming(value).unwrap()
    }

    #[test]
    fn test_merge_with_empty_incoming_is_identity() {
        let existing = nodes(json!([{"name": "a", "x": 1}, {"name": "b"}]));
        assert_eq!(merge(existing.clone(), Vec::new()), existing);
    }

    #[test]
    fn test_merge_replaces_by_name() {
        let merged = merge(nodes(json!([{"name": "a", "x": 1}])), nodes(json!([{"name": "a", "x": 2}])));
        assert_eq!(serde_json::to_value(&merged).unwrap(), json!([{"name": "a", "x": 2}]));
    }

    #[test]
    fn test_merge_appends_misses() {
        let merged = merge(nodes(json!([{"name": "a"}])), nodes(json!([{"name": "b"}])));
        assert_eq!(serde_json::to_value(&merged).unwrap(), json!([{"name": "a"}, {"name": "b"}]));
    }

    #[test]
    fn test_merge_keeps_positions() {
        let existing = nodes(json!([{"name": "a"}, {"name": "b"}, {"name": "c"}]));
        let merged = merge(existing, nodes(json!([{"name": "d"}, {"name": "b", "host": "h"}])));
        let names: Vec<&str> = merged.iter().map(VpnNode::name).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
        assert_eq!(merged[1].host(), Some("h"));
    }

    #[test]
    fn test_duplicate_incoming_names_last_wins() {
        let merged = merge(
            Vec::new(),
            nodes(json!([{"name": "jp", "v": 1}, {"name": "us"}, {"name": "jp", "v": 2}])),
        );
        assert_eq!(
            serde_json::to_value(&merged).unwrap(),
            json!([{"name": "jp", "v": 2}, {"name": "us"}])
        );
    }

    #[test]
    fn test_unknown_fields_round_trip_in_order() {
        let raw = r#"{"zeta":true,"name":"jp","protocolParams":{"uuid":"abc","flow":"xtls"},"port":443,"alpha":[1,2]}"#;
        let node: VpnNode = serde_json::from_str(raw).unwrap();
        assert_eq!(serde_json::to_string(&node).unwrap(), raw);
        assert_eq!(node.port(), Some(443));
        assert_eq!(node.protocol_params().unwrap()["flow"], "xtls");
        assert_eq!(node.enabled(), None);
    }

    #[test]
    fn test_incoming_validation() {
        assert!(parse_incoming(json!({"name": "a"})).is_err());
        assert!(parse_incoming(json!([{"host": "1.2.3.4"}])).is_err());
        assert!(parse_incoming(json!([{"name": 5}])).is_err());
        assert!(parse_incoming(json!([{"name": ""}])).is_err());
        assert!(parse_incoming(json!(["jp"])).is_err());
        assert_eq!(parse_incoming(json!([])).unwrap().len(), 0);
    }

    #[test]
    fn test_builder_keeps_name_fixed() {
        let node = VpnNode::new("jp").with("host", "1.2.3.4").with("name", "other").with("enabled", true);
        assert_eq!(node.name(), "jp");
        assert_eq!(node.host(), Some("1.2.3.4"));
        assert_eq!(node.enabled(), Some(true));
    }

    #[test]
    fn test_parse_store_variants() {
        assert_eq!(parse_store(b"").unwrap().len(), 0);
        assert_eq!(parse_store(b"  \n").unwrap().len(), 0);
        assert!(parse_store(b"{not json").is_none());
        assert!(parse_store(b"{\"name\":\"a\"}").is_none());
        assert_eq!(parse_store(b"[{\"name\":\"a\"}]").unwrap().len(), 1);
    }

    #[test]
    fn test_stored_duplicates_collapse() {
        let nodes = parse_store(br#"[{"name":"jp","v":1},{"name":"us"},{"name":"jp","v":2}]"#).unwrap();
        assert_eq!(
            serde_json::to_value(&nodes).unwrap(),
            json!([{"name": "jp", "v": 2}, {"name": "us"}])
        );
    }

    #[tokio::test]
    async fn test_store_merge_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpn_nodes.json");
        std::fs::write(&path, r#"[{"name":"jp"}]"#).unwrap();

        let store = NodeStore::new(&path);
        let outcome = store
            .merge(nodes(json!([
                {"name": "jp", "host": "1.2.3.4"},
                {"name": "us", "host": "5.6.7.8"}
            ])))
            .await
            .unwrap();

        assert!(!outcome.recovered);
        assert_eq!(outcome.count(), 2);

        let on_disk: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(
            on_disk,
            json!([{"name": "jp", "host": "1.2.3.4"}, {"name": "us", "host": "5.6.7.8"}])
        );
        assert_eq!(store.load().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_store_recovers_from_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpn_nodes.json");
        std::fs::write(&path, "{{ definitely not json").unwrap();

        let store = NodeStore::new(&path);
        assert!(store.load().await.unwrap().is_empty());

        let outcome = store.merge(vec![VpnNode::new("us")]).await.unwrap();
        assert!(outcome.recovered);
        assert_eq!(outcome.count(), 1);

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(
            std::fs::read_to_string(backups[0].path()).unwrap(),
            "{{ definitely not json"
        );
    }

    #[tokio::test]
    async fn test_store_created_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vpn_nodes.json");
        let store = NodeStore::new(&path);
        assert!(store.load().await.unwrap().is_empty());

        store.merge(vec![VpnNode::new("ca")]).await.unwrap();
        assert!(path.exists());
        // no stray temp files next to the store
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}

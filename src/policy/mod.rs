//! Mapping policy: snapshot store, loading, and background refresh
//!
//! The grant set lives in YAML files - locally on disk, in a remote git
//! repository, or both. Each refresh rebuilds the whole set and publishes it
//! atomically; readers always observe a complete snapshot. A refresh failure
//! after startup is fatal to the process (there is no stale-serve mode), so
//! the previously published snapshot only serves until the loop notices.

pub mod git;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::identity::IdentityMapping;

/// Policy loading errors
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// A configured path could not be walked or read
    #[error("reading {path}: {source}")]
    Io {
        /// The offending path
        path: PathBuf,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// A policy file did not parse as a sequence of mapping records
    #[error("parsing {path}: {source}")]
    Parse {
        /// The offending file
        path: PathBuf,
        /// The underlying YAML error
        #[source]
        source: serde_yaml::Error,
    },

    /// The remote repository could not be synced
    #[error("syncing remote policy repository: {0}")]
    Git(#[from] git2::Error),

    /// The blocking load task was cancelled or panicked
    #[error("policy load task failed: {0}")]
    Task(String),
}

/// Where policy mappings are loaded from
#[derive(Debug, Clone, Default)]
pub struct LoaderConfig {
    /// Filesystem roots walked recursively for policy files
    pub config_paths: Vec<PathBuf>,
    /// Optional remote repository synced before each local load
    pub remote: Option<git::RemoteRepo>,
}

/// Process-global view of the currently permitted mappings
///
/// One writer (the refresh loop), many readers (the request pipeline). A
/// publish swaps the snapshot pointer; readers clone the `Arc` under a brief
/// read lock and keep whatever snapshot was current when they looked.
#[derive(Debug, Default)]
pub struct MappingStore {
    snapshot: RwLock<Arc<Vec<IdentityMapping>>>,
}

impl MappingStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently published snapshot
    pub fn snapshot(&self) -> Arc<Vec<IdentityMapping>> {
        self.snapshot.read().clone()
    }

    /// Atomically replace the published snapshot
    pub fn publish(&self, mappings: Vec<IdentityMapping>) {
        *self.snapshot.write() = Arc::new(mappings);
    }

    /// Find the grant matching a request's (source, target) pair
    ///
    /// Returns a clone of the stored mapping: its target carries the
    /// authoritative credential locator for the mint step.
    pub fn find(&self, request: &IdentityMapping) -> Option<IdentityMapping> {
        self.snapshot()
            .iter()
            .find(|grant| grant.permits(request))
            .cloned()
    }

    /// Number of mappings in the current snapshot
    pub fn len(&self) -> usize {
        self.snapshot.read().len()
    }

    /// Whether the current snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Load the full mapping set from every configured source
///
/// Synchronous (file walking and git are blocking); callers in async context
/// should go through [`load_async`]. Any single failure aborts the whole
/// pass - a half-loaded grant set is never returned.
pub fn load(config: &LoaderConfig) -> Result<Vec<IdentityMapping>, PolicyError> {
    if let Some(remote) = &config.remote {
        git::sync(remote)?;
    }

    let mut files = Vec::new();
    for root in &config.config_paths {
        collect_files(root, &mut files)?;
    }

    let mut mappings = Vec::new();
    for file in files {
        let text = std::fs::read_to_string(&file).map_err(|source| PolicyError::Io {
            path: file.clone(),
            source,
        })?;
        let records: Option<Vec<IdentityMapping>> =
            serde_yaml::from_str(&text).map_err(|source| PolicyError::Parse {
                path: file.clone(),
                source,
            })?;
        let records = records.unwrap_or_default();
        debug!(file = %file.display(), count = records.len(), "loaded policy file");
        mappings.extend(records);
    }

    Ok(mappings)
}

/// Run [`load`] on the blocking pool
pub async fn load_async(config: LoaderConfig) -> Result<Vec<IdentityMapping>, PolicyError> {
    tokio::task::spawn_blocking(move || load(&config))
        .await
        .map_err(|e| PolicyError::Task(e.to_string()))?
}

/// Collect every regular file under `path` (which may itself be a file)
fn collect_files(path: &Path, files: &mut Vec<PathBuf>) -> Result<(), PolicyError> {
    let io_err = |source| PolicyError::Io {
        path: path.to_path_buf(),
        source,
    };

    let metadata = std::fs::metadata(path).map_err(io_err)?;
    if metadata.is_file() {
        files.push(path.to_path_buf());
        return Ok(());
    }

    for entry in std::fs::read_dir(path).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        collect_files(&entry.path(), files)?;
    }
    Ok(())
}

/// Background policy refresh loop
///
/// Loops `sleep(interval) -> load -> publish` forever. The initial load is
/// the caller's job (so startup can fail before the server binds); any
/// refresh failure afterwards exits the process with the cause logged.
/// Production never cancels the loop; the token exists so tests can.
pub struct Refresher {
    store: Arc<MappingStore>,
    config: LoaderConfig,
    interval: Duration,
}

impl Refresher {
    /// Create a refresher publishing into `store`
    pub fn new(store: Arc<MappingStore>, config: LoaderConfig, interval: Duration) -> Self {
        Self {
            store,
            config,
            interval,
        }
    }

    /// Spawn the refresh loop
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("policy refresh loop stopped");
                        return;
                    }
                    _ = tokio::time::sleep(self.interval) => {}
                }

                match load_async(self.config.clone()).await {
                    Ok(mappings) => {
                        info!(count = mappings.len(), "policy snapshot refreshed");
                        self.store.publish(mappings);
                    }
                    Err(e) => {
                        error!(error = %e, "policy refresh failed, exiting");
                        std::process::exit(1);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{CloudProvider, Identity};
    use std::io::Write;

    fn mapping(source: &str, target: &str) -> IdentityMapping {
        IdentityMapping {
            source: Identity {
                id: source.to_string(),
                provider: CloudProvider::Aws,
                ..Default::default()
            },
            target: Identity {
                id: target.to_string(),
                provider: CloudProvider::Aws,
                ..Default::default()
            },
            request_id: String::new(),
        }
    }

    fn write_file(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    const ALICE_GRANT: &str = r#"
- source:
    id: arn:aws:iam::111:user/alice
    provider: aws
  target:
    id: arn:aws:iam::222:role/read
    provider: aws
"#;

    #[test]
    fn store_starts_empty() {
        let store = MappingStore::new();
        assert!(store.is_empty());
        assert!(store.find(&mapping("a", "b")).is_none());
    }

    #[test]
    fn publish_replaces_the_snapshot() {
        let store = MappingStore::new();
        store.publish(vec![mapping("a", "b")]);
        assert_eq!(store.len(), 1);
        assert!(store.find(&mapping("a", "b")).is_some());

        store.publish(vec![mapping("c", "d")]);
        assert_eq!(store.len(), 1);
        assert!(store.find(&mapping("a", "b")).is_none());
        assert!(store.find(&mapping("c", "d")).is_some());
    }

    #[test]
    fn readers_keep_the_snapshot_they_observed() {
        let store = MappingStore::new();
        store.publish(vec![mapping("a", "b")]);

        let before = store.snapshot();
        store.publish(vec![mapping("c", "d"), mapping("e", "f")]);

        // The old Arc is untouched by the swap.
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].source.id, "a");
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn load_walks_directories_recursively_and_concatenates() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "grants.yaml", ALICE_GRANT);
        write_file(
            dir.path(),
            "teams/data/extra.yaml",
            r#"
- source:
    id: svc@proj.iam.gserviceaccount.com
    provider: gcp
  target:
    id: reader@proj.iam.gserviceaccount.com
    provider: gcp
"#,
        );

        let config = LoaderConfig {
            config_paths: vec![dir.path().to_path_buf()],
            remote: None,
        };
        let mappings = load(&config).unwrap();
        assert_eq!(mappings.len(), 2);
    }

    #[test]
    fn a_config_path_may_be_a_single_file() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "grants.yaml", ALICE_GRANT);

        let config = LoaderConfig {
            config_paths: vec![dir.path().join("grants.yaml")],
            remote: None,
        };
        assert_eq!(load(&config).unwrap().len(), 1);
    }

    #[test]
    fn any_unparseable_file_aborts_the_whole_pass() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "good.yaml", ALICE_GRANT);
        write_file(dir.path(), "bad.yaml", "source: [unclosed");

        let config = LoaderConfig {
            config_paths: vec![dir.path().to_path_buf()],
            remote: None,
        };
        assert!(matches!(
            load(&config).unwrap_err(),
            PolicyError::Parse { .. }
        ));
    }

    #[test]
    fn empty_files_contribute_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "empty.yaml", "");
        write_file(dir.path(), "grants.yaml", ALICE_GRANT);

        let config = LoaderConfig {
            config_paths: vec![dir.path().to_path_buf()],
            remote: None,
        };
        assert_eq!(load(&config).unwrap().len(), 1);
    }

    #[test]
    fn request_ids_in_policy_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "grants.yaml",
            r#"
- requestId: stale-audit-token
  source:
    id: arn:aws:iam::111:user/alice
    provider: aws
  target:
    id: arn:aws:iam::222:role/read
    provider: aws
"#,
        );

        let config = LoaderConfig {
            config_paths: vec![dir.path().to_path_buf()],
            remote: None,
        };
        let mappings = load(&config).unwrap();
        assert!(mappings[0].request_id.is_empty());
    }

    #[test]
    fn file_round_trip_is_observable_through_find() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "grants.yaml", ALICE_GRANT);

        let config = LoaderConfig {
            config_paths: vec![dir.path().to_path_buf()],
            remote: None,
        };
        let store = MappingStore::new();
        store.publish(load(&config).unwrap());

        let request = mapping("arn:aws:iam::111:user/alice", "arn:aws:iam::222:role/read");
        let grant = store.find(&request).unwrap();
        assert_eq!(grant.target.id, "arn:aws:iam::222:role/read");
    }

    #[tokio::test]
    async fn refresher_stops_on_cancellation() {
        let store = Arc::new(MappingStore::new());
        let refresher = Refresher::new(
            store,
            LoaderConfig::default(),
            Duration::from_secs(3600),
        );

        let cancel = CancellationToken::new();
        let handle = refresher.start(cancel.clone());
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("refresher should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn refresher_publishes_after_each_interval() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "grants.yaml", ALICE_GRANT);

        let store = Arc::new(MappingStore::new());
        let refresher = Refresher::new(
            store.clone(),
            LoaderConfig {
                config_paths: vec![dir.path().to_path_buf()],
                remote: None,
            },
            Duration::from_millis(10),
        );

        let cancel = CancellationToken::new();
        let handle = refresher.start(cancel.clone());

        // Wait for at least one refresh to land.
        for _ in 0..100 {
            if !store.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.len(), 1);

        cancel.cancel();
        let _ = handle.await;
    }
}

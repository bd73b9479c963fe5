//! Update discovery.
//!
//! A check fetches the server list, keeps a copy of it on disk and feeds the
//! compatible builds into the controller. The cached copy is replayed at
//! startup so known updates show up before the first network round trip.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::controller::UpdaterController;
use crate::error::Result;
use crate::manifest::{has_new_updates, Manifest};
use crate::traits::ManifestSource;
use crate::types::{BuildInfo, UpdateInfo};

/// Fetches the update list over HTTP(S).
pub struct HttpManifestSource {
    client: reqwest::Client,
    url: String,
}

impl HttpManifestSource {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ManifestSource for HttpManifestSource {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<Vec<u8>> {
        info!("Fetching update list");
        let response = self.client.get(&self.url).send().await?.error_for_status()?;
        let body = response.bytes().await?;
        debug!(bytes = body.len(), "Update list fetched");
        Ok(body.to_vec())
    }
}

/// Result of a successful check.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    /// Compatible updates the server lists, as registered in the controller
    pub updates: Vec<UpdateInfo>,
    /// The list names a compatible build the previous list did not
    pub new_updates: bool,
}

/// Runs update checks against a [`ManifestSource`].
#[derive(Clone)]
pub struct UpdateChecker {
    controller: UpdaterController,
    source: Arc<dyn ManifestSource>,
    cache: PathBuf,
}

impl UpdateChecker {
    pub fn new(
        controller: UpdaterController,
        source: Arc<dyn ManifestSource>,
        cache: impl Into<PathBuf>,
    ) -> Self {
        Self {
            controller,
            source,
            cache: cache.into(),
        }
    }

    /// Fetch the list, replace the cached copy and register compatible
    /// updates. Unlisted updates nobody is working on are purged.
    ///
    /// On failure the controller and the cache are left as they were.
    #[instrument(skip(self))]
    pub async fn check(&self) -> Result<CheckOutcome> {
        let bytes = self.source.fetch().await?;
        let fresh = Manifest::parse(&bytes)?;

        let build = self.controller.build();
        let new_updates = match self.read_cache().await {
            Some(previous) => has_new_updates(
                &compatible_only(&previous, build),
                &compatible_only(&fresh, build),
            ),
            None => fresh.response.iter().any(|e| e.is_compatible(build)),
        };

        self.write_cache(&bytes).await?;
        let updates = self.apply(&fresh, true);
        self.controller.record_check(Utc::now())?;

        info!(
            listed = fresh.response.len(),
            compatible = updates.len(),
            new_updates = new_updates,
            "Update check finished"
        );
        Ok(CheckOutcome {
            updates,
            new_updates,
        })
    }

    /// Register the updates of the cached list without going to the network.
    /// Restored updates the list no longer names are purged as after a live
    /// check. Returns the number of compatible entries.
    pub async fn load_cached(&self) -> usize {
        match self.read_cache().await {
            Some(manifest) => self.apply(&manifest, true).len(),
            None => 0,
        }
    }

    fn apply(&self, manifest: &Manifest, purge: bool) -> Vec<UpdateInfo> {
        let compatible = manifest.compatible_updates(self.controller.build());
        let ids: Vec<String> = compatible.iter().map(|u| u.download_id.clone()).collect();

        for update in compatible {
            self.controller.add_update(update);
        }
        self.controller.set_updates_available_online(&ids, purge);

        ids.iter()
            .filter_map(|id| self.controller.get_update(id))
            .collect()
    }

    async fn read_cache(&self) -> Option<Manifest> {
        let bytes = match fs::read(&self.cache).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.cache.display(), error = %e, "Failed to read cached update list");
                return None;
            }
        };
        match Manifest::parse(&bytes) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(path = %self.cache.display(), error = %e, "Ignoring corrupt cached update list");
                None
            }
        }
    }

    async fn write_cache(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.cache.parent() {
            fs::create_dir_all(parent).await?;
        }
        let staged = staged_path(&self.cache);
        fs::write(&staged, bytes).await?;
        fs::rename(&staged, &self.cache).await?;
        Ok(())
    }
}

fn staged_path(cache: &Path) -> PathBuf {
    let mut name = cache.as_os_str().to_os_string();
    name.push(".new");
    PathBuf::from(name)
}

fn compatible_only(manifest: &Manifest, build: &BuildInfo) -> Manifest {
    Manifest {
        response: manifest
            .response
            .iter()
            .filter(|e| e.is_compatible(build))
            .cloned()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerOptions;
    use crate::mock::{
        MockDeviceConditions, MockDownloader, MockInstaller, MockManifestSource, MockVerifier,
    };
    use crate::store::MemoryStore;
    use crate::traits::Collaborators;
    use tempfile::TempDir;

    fn entry(id: &str, datetime: i64) -> String {
        format!(
            r#"{{"datetime": {datetime}, "filename": "{id}.zip", "id": "{id}",
                "romtype": "nightly", "size": 1000, "url": "https://example.org/{id}.zip",
                "version": "1.0"}}"#
        )
    }

    fn list(entries: &[String]) -> Vec<u8> {
        format!(r#"{{"response": [{}]}}"#, entries.join(",")).into_bytes()
    }

    fn setup() -> (UpdateChecker, UpdaterController, Arc<MockManifestSource>, TempDir) {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(MockManifestSource::new());
        let collaborators = Collaborators {
            downloader: Arc::new(MockDownloader::new()),
            verifier: Arc::new(MockVerifier::new()),
            installer: Arc::new(MockInstaller::new()),
            store: Arc::new(MemoryStore::new()),
            manifest_source: source.clone(),
            device: Arc::new(MockDeviceConditions::new()),
        };
        let options = ControllerOptions {
            download_dir: dir.path().join("updates"),
            build: BuildInfo {
                timestamp: 100,
                ..BuildInfo::default()
            },
            ..Default::default()
        };
        let controller = UpdaterController::new(options, &collaborators);
        let checker = UpdateChecker::new(
            controller.clone(),
            source.clone(),
            dir.path().join("updates.json"),
        );
        (checker, controller, source, dir)
    }

    #[tokio::test]
    async fn test_check_registers_compatible_updates() {
        let (checker, controller, source, dir) = setup();
        source.set_body(list(&[entry("a", 200), entry("stale", 50)]));

        let outcome = checker.check().await.unwrap();
        assert!(outcome.new_updates);
        assert_eq!(outcome.updates.len(), 1);
        assert!(outcome.updates[0].available_online);
        assert!(controller.get_update("stale").is_none());
        assert!(controller.last_check().is_some());
        assert!(dir.path().join("updates.json").exists());
        assert!(!dir.path().join("updates.json.new").exists());

        let again = checker.check().await.unwrap();
        assert!(!again.new_updates);
    }

    #[tokio::test]
    async fn test_check_purges_unlisted_updates() {
        let (checker, controller, source, _dir) = setup();
        source.set_body(list(&[entry("a", 200), entry("b", 300)]));
        checker.check().await.unwrap();

        source.set_body(list(&[entry("b", 300)]));
        checker.check().await.unwrap();

        assert!(controller.get_update("a").is_none());
        assert!(controller.get_update("b").is_some());
    }

    #[tokio::test]
    async fn test_failed_check_keeps_state() {
        let (checker, controller, source, dir) = setup();
        source.set_body(list(&[entry("a", 200)]));
        checker.check().await.unwrap();

        source.set_body(b"not json".to_vec());
        assert!(checker.check().await.is_err());
        source.set_failing(true);
        assert!(checker.check().await.is_err());

        assert!(controller.get_update("a").is_some());
        let cached = std::fs::read(dir.path().join("updates.json")).unwrap();
        assert_eq!(Manifest::parse(&cached).unwrap().response.len(), 1);
    }

    #[tokio::test]
    async fn test_load_cached_does_not_fetch() {
        let (checker, _controller, source, dir) = setup();
        std::fs::write(dir.path().join("updates.json"), list(&[entry("a", 200)])).unwrap();

        assert_eq!(checker.load_cached().await, 1);
        assert_eq!(source.fetches(), 0);
    }

    #[tokio::test]
    async fn test_load_cached_purges_updates_missing_from_list() {
        let (checker, controller, _source, dir) = setup();
        controller.add_update(UpdateInfo::new("withdrawn", "withdrawn.zip", "1.0", 200, 1000));
        std::fs::write(dir.path().join("updates.json"), list(&[entry("a", 200)])).unwrap();

        assert_eq!(checker.load_cached().await, 1);
        assert!(controller.get_update("withdrawn").is_none());
        assert!(controller.get_update("a").unwrap().available_online);
    }
}

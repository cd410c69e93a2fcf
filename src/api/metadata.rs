//! Disk-backed metadata cache with background, single-flight refresh.
//!
//! Each profile owns at most one refresh at a time: a second request while one
//! is outstanding receives the same shared handle. Refreshes run detached on
//! the runtime, so dropping the handle never cancels the work or the
//! write-back. The on-disk file is gzip-compressed JSON, replaced atomically
//! so it always holds a complete snapshot.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::constants::{FAULT_VERSION_STAMP_EXPIRED, MIN_METADATA_MAJOR_VERSION};
use crate::api::models::{ConnectionProfile, ProfileRuntime};
use crate::api::session::{AuthMechanism, Session};
use crate::error::ConnectionError;

/// Current encoding of the on-disk snapshot. Bump when the query shape or the
/// serialized layout changes so older files are refetched instead of reused.
pub const METADATA_FORMAT_VERSION: u32 = 2;

/// Schema attribute descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub logical_name: String,
    pub attribute_type: Option<String>,
    pub is_required: bool,
    pub is_custom: bool,
}

/// Schema descriptor for one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub logical_name: String,
    pub schema_name: Option<String>,
    pub entity_set_name: Option<String>,
    pub display_name: Option<String>,
    pub is_custom: bool,
    #[serde(default)]
    pub attributes: Vec<AttributeDescriptor>,
}

/// Cached copy of the organization schema plus its server version stamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub entities: Vec<EntityDescriptor>,
    /// Opaque server token used to request only changes since this point.
    pub client_version_stamp: String,
    pub format_version: u32,
}

/// Shared handle to an in-flight or completed refresh.
pub type MetadataRefresh = Shared<BoxFuture<'static, Result<Arc<MetadataSnapshot>, ConnectionError>>>;

/// Keeps per-profile metadata snapshots current.
#[derive(Debug, Clone)]
pub struct MetadataCacheManager {
    cache_dir: PathBuf,
}

impl MetadataCacheManager {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    /// On-disk cache file for one profile identity.
    pub fn cache_path(&self, profile_id: Uuid) -> PathBuf {
        self.cache_dir.join(format!("{profile_id}.json.gz"))
    }

    /// Starts (or joins) a background refresh of the profile's metadata.
    ///
    /// With `flush` the existing cache is ignored and a full copy fetched.
    /// When a refresh is already in flight the pending handle is returned
    /// unchanged and the `flush` intent is dropped; callers who need a
    /// guaranteed flush should await the pending handle first.
    pub fn refresh(
        &self,
        profile: &ConnectionProfile,
        flush: bool,
    ) -> Result<MetadataRefresh, ConnectionError> {
        match profile.organization_major_version() {
            Some(major) if major >= MIN_METADATA_MAJOR_VERSION => {}
            Some(major) => {
                return Err(ConnectionError::configuration(format!(
                    "metadata sync requires organization version {MIN_METADATA_MAJOR_VERSION}.0 \
                     or later, connected organization is version {major}"
                )));
            }
            None => {
                return Err(ConnectionError::configuration(
                    "organization version is unknown; connect before refreshing metadata",
                ));
            }
        }

        let runtime = profile.runtime_handle();
        let mut slot = runtime.refresh.lock().unwrap();
        if let Some(pending) = slot.as_ref() {
            if pending.peek().is_none() {
                if flush {
                    debug!(
                        "flush requested for profile {} while a refresh is pending; \
                         joining the pending operation",
                        profile.id
                    );
                }
                return Ok(pending.clone());
            }
        }

        let session = profile.session().ok_or_else(|| {
            ConnectionError::session("profile has no live session; connect before refreshing metadata")
        })?;

        let cache_path = self.cache_path(profile.id);
        let operation = run_refresh(Arc::clone(&runtime), session, cache_path, flush)
            .boxed()
            .shared();

        // Detached: the refresh and its write-back complete even if every
        // caller drops its handle.
        tokio::spawn(operation.clone());
        *slot = Some(operation.clone());
        Ok(operation)
    }
}

async fn run_refresh(
    runtime: Arc<ProfileRuntime>,
    session: Arc<dyn Session>,
    cache_path: PathBuf,
    mut flush: bool,
) -> Result<Arc<MetadataSnapshot>, ConnectionError> {
    let mut baseline = runtime.snapshot.read().unwrap().clone();

    if baseline.is_none() && !flush {
        baseline = load_snapshot(&cache_path).await.map(Arc::new);
    }

    if let Some(snapshot) = &baseline {
        if snapshot.format_version != METADATA_FORMAT_VERSION {
            info!(
                "discarding metadata cache written with format {} (current {})",
                snapshot.format_version, METADATA_FORMAT_VERSION
            );
            baseline = None;
            flush = true;
        }
    }

    let mut version_stamp = if flush {
        None
    } else {
        baseline
            .as_ref()
            .map(|snapshot| snapshot.client_version_stamp.clone())
    };

    // A cloned session keeps the background fetch from blocking interactive
    // use of the profile's primary OAuth session.
    let session = if session.auth_mechanism() == AuthMechanism::OAuth {
        session.clone_session().await?
    } else {
        session
    };

    let mut update = match session
        .retrieve_metadata_changes(version_stamp.as_deref())
        .await
    {
        Ok(update) => update,
        Err(fault)
            if fault.code == FAULT_VERSION_STAMP_EXPIRED && version_stamp.is_some() =>
        {
            info!("cached metadata version stamp is too old; fetching a full copy");
            version_stamp = None;
            session.retrieve_metadata_changes(None).await?
        }
        Err(fault) => return Err(fault.into()),
    };

    if let Some(sent) = version_stamp.as_deref() {
        if update.server_version_stamp != sent {
            // The schema moved while we held the stamp. Entity identifiers are
            // not stable across server-side maintenance, so take a full copy
            // instead of reconciling deltas.
            info!("metadata changed on the server; fetching a full copy");
            version_stamp = None;
            update = session.retrieve_metadata_changes(None).await?;
        }
    }

    if version_stamp.is_some() {
        // Incremental fetch confirmed no drift: the copy we hold is current.
        return baseline.ok_or_else(|| {
            ConnectionError::session("incremental metadata fetch without a baseline snapshot")
        });
    }

    let fresh = Arc::new(MetadataSnapshot {
        entities: update.entities,
        client_version_stamp: update.server_version_stamp,
        format_version: METADATA_FORMAT_VERSION,
    });
    *runtime.snapshot.write().unwrap() = Some(Arc::clone(&fresh));

    debug!(
        "metadata refreshed: {} entities, stamp {}",
        fresh.entities.len(),
        fresh.client_version_stamp
    );

    // Write-back is fire-and-forget: failures are logged, never surfaced, and
    // the in-memory snapshot stays valid either way.
    let to_persist = Arc::clone(&fresh);
    tokio::spawn(async move {
        if let Err(error) = store_snapshot(&cache_path, &to_persist).await {
            warn!(
                "failed to persist metadata cache to {}: {error:#}",
                cache_path.display()
            );
        }
    });

    Ok(fresh)
}

/// Loads the on-disk snapshot. Any failure is treated as a cache miss.
pub(crate) async fn load_snapshot(path: &Path) -> Option<MetadataSnapshot> {
    let path = path.to_owned();
    let loaded = tokio::task::spawn_blocking(move || read_snapshot(&path)).await;
    match loaded {
        Ok(Ok(snapshot)) => Some(snapshot),
        Ok(Err(error)) => {
            debug!("ignoring unreadable metadata cache: {error:#}");
            None
        }
        Err(error) => {
            debug!("metadata cache load task failed: {error}");
            None
        }
    }
}

fn read_snapshot(path: &Path) -> anyhow::Result<MetadataSnapshot> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let decoder = GzDecoder::new(file);
    serde_json::from_reader(decoder)
        .with_context(|| format!("failed to decode {}", path.display()))
}

/// Persists the snapshot beside `path` and atomically swaps it into place, so
/// the file on disk is always either the previous or the new complete snapshot.
pub(crate) async fn store_snapshot(
    path: &Path,
    snapshot: &Arc<MetadataSnapshot>,
) -> anyhow::Result<()> {
    let path = path.to_owned();
    let snapshot = Arc::clone(snapshot);
    tokio::task::spawn_blocking(move || write_snapshot(&path, &snapshot))
        .await
        .context("metadata cache store task failed")?
}

fn write_snapshot(path: &Path, snapshot: &MetadataSnapshot) -> anyhow::Result<()> {
    let directory = path
        .parent()
        .context("metadata cache path has no parent directory")?;
    std::fs::create_dir_all(directory)
        .with_context(|| format!("failed to create {}", directory.display()))?;

    let temp = tempfile::NamedTempFile::new_in(directory)
        .context("failed to create temporary cache file")?;
    let mut encoder = GzEncoder::new(temp, Compression::default());
    serde_json::to_writer(&mut encoder, snapshot).context("failed to encode snapshot")?;
    encoder.flush().context("failed to flush snapshot")?;
    let temp = encoder.finish().context("failed to finish gzip stream")?;

    temp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

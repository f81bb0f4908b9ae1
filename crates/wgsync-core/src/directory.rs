//! The user directory: the authoritative list of who may connect.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;
use wgsync_wireguard::{PresharedKey, PublicKey};

use crate::error::{Result, SyncError};
use crate::peer::{PeerRecord, RouteRule};

/// Source of authorized peer records.
#[allow(async_fn_in_trait)]
pub trait Directory {
    /// Returns every record in the directory.
    ///
    /// The result is either complete or an error; partial reads are never
    /// returned.
    async fn list_authorized_peers(&self) -> Result<Vec<PeerRecord>>;
}

/// Directory exported as a JSON array of records in a file.
#[derive(Debug, Clone)]
pub struct FileDirectory {
    path: PathBuf,
}

impl FileDirectory {
    /// Reads records from `path` on every call.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file being read.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Directory for FileDirectory {
    async fn list_authorized_peers(&self) -> Result<Vec<PeerRecord>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SyncError::DirectoryUnavailable(format!(
                "failed to read '{}': {e}",
                self.path.display()
            ))
        })?;

        let records: Vec<PeerRecord> = serde_json::from_str(&content).map_err(|e| {
            SyncError::DirectoryUnavailable(format!(
                "invalid directory file '{}': {e}",
                self.path.display()
            ))
        })?;

        debug!(path = %self.path.display(), records = records.len(), "directory read");
        Ok(records)
    }
}

#[derive(Debug)]
struct MemoryDirectoryData {
    pool_start: Ipv4Addr,
    records: Vec<PeerRecord>,
}

/// In-memory directory.
///
/// Clones share the same records. Besides serving reads it can provision,
/// update and revoke users the way the directory's management tooling does,
/// so tests can drive the gateway through realistic directory changes.
#[derive(Debug, Clone)]
pub struct MemoryDirectory {
    data: Arc<Mutex<MemoryDirectoryData>>,
    fail_reads: Arc<AtomicBool>,
}

impl MemoryDirectory {
    /// Creates an empty directory whose first user gets `pool_start`.
    #[must_use]
    pub fn new(pool_start: Ipv4Addr) -> Self {
        Self {
            data: Arc::new(Mutex::new(MemoryDirectoryData {
                pool_start,
                records: Vec::new(),
            })),
            fail_reads: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stores a record as-is.
    pub fn insert(&self, record: PeerRecord) {
        self.data.lock().records.push(record);
    }

    /// All stored records, inactive ones included.
    #[must_use]
    pub fn records(&self) -> Vec<PeerRecord> {
        self.data.lock().records.clone()
    }

    /// Looks up a record by profile name.
    #[must_use]
    pub fn get(&self, profile_name: &str) -> Option<PeerRecord> {
        self.data
            .lock()
            .records
            .iter()
            .find(|r| r.profile_name == profile_name)
            .cloned()
    }

    /// Makes subsequent reads fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Adds a user with the next free client address and serial 0.
    ///
    /// The first user gets the pool start; later users get one past the
    /// highest address in use.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::DirectoryInconsistent`] if the profile name or
    /// public key is taken, or no address is left above the highest one.
    pub fn provision(
        &self,
        public_key: PublicKey,
        profile_name: &str,
        preshared_key: PresharedKey,
        routes: Vec<RouteRule>,
        split_tunnel: bool,
    ) -> Result<PeerRecord> {
        let mut data = self.data.lock();

        if let Some(existing) = data
            .records
            .iter()
            .find(|r| r.profile_name == profile_name || r.public_key == public_key)
        {
            return Err(SyncError::DirectoryInconsistent(format!(
                "profile '{profile_name}' conflicts with existing profile '{}'",
                existing.profile_name
            )));
        }

        let client_address = match data.records.iter().map(|r| u32::from(r.client_address)).max() {
            None => data.pool_start,
            Some(highest) => highest.checked_add(1).map(Ipv4Addr::from).ok_or_else(|| {
                SyncError::DirectoryInconsistent("client address pool exhausted".to_string())
            })?,
        };

        let mut record = PeerRecord::new(public_key, profile_name, preshared_key, client_address)
            .with_split_tunnel(split_tunnel);
        record.routes = routes;
        data.records.push(record.clone());

        debug!(profile = profile_name, address = %client_address, "user provisioned");
        Ok(record)
    }

    /// Replaces a user's routes and bumps its serial.
    ///
    /// Returns the updated record, or `None` if no such profile exists.
    pub fn update_routes(&self, profile_name: &str, routes: Vec<RouteRule>) -> Option<PeerRecord> {
        let mut data = self.data.lock();
        let record = data
            .records
            .iter_mut()
            .find(|r| r.profile_name == profile_name)?;
        record.routes = routes;
        record.serial += 1;
        Some(record.clone())
    }

    /// Deletes a user, returning the removed record.
    pub fn revoke(&self, profile_name: &str) -> Option<PeerRecord> {
        let mut data = self.data.lock();
        let index = data
            .records
            .iter()
            .position(|r| r.profile_name == profile_name)?;
        Some(data.records.remove(index))
    }
}

impl Directory for MemoryDirectory {
    async fn list_authorized_peers(&self) -> Result<Vec<PeerRecord>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SyncError::DirectoryUnavailable(
                "injected read failure".to_string(),
            ));
        }
        Ok(self.records())
    }
}

//! In-memory store implementations for testing

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::models::{
    BackendProfile, FileMetadata, FilePolicy, JobState, PendingUploadJob, ProfileKey, StoredFile,
};
use crate::repository::{
    BackendProfileStore, MetadataStore, PolicyStore, StoreError, StoreResult,
};

#[derive(Debug, Clone)]
pub struct StoredRow {
    pub file: FileMetadata,
    pub profile_id: Option<i32>,
    pub removed: bool,
}

/// Backend profiles keyed by id, plus each tenant's default profile.
#[derive(Clone, Default)]
pub struct MemoryBackendProfileStore {
    profiles: Arc<Mutex<HashMap<i32, BackendProfile>>>,
    defaults: Arc<Mutex<HashMap<i64, i32>>>,
    get_profile_calls: Arc<AtomicUsize>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl MemoryBackendProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: BackendProfile) {
        self.profiles.lock().unwrap().insert(profile.id, profile);
    }

    pub fn set_default(&self, tenant_id: i64, profile_id: i32) {
        self.defaults.lock().unwrap().insert(tenant_id, profile_id);
    }

    /// Bump a profile's version tag as an edit would.
    pub fn touch(&self, id: i32) {
        if let Some(profile) = self.profiles.lock().unwrap().get_mut(&id) {
            profile.updated_at += 1;
        }
    }

    pub fn get_profile_calls(&self) -> usize {
        self.get_profile_calls.load(Ordering::SeqCst)
    }

    /// Delay every profile load, to widen race windows in tests.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl BackendProfileStore for MemoryBackendProfileStore {
    async fn get_profile(&self, id: i32) -> StoreResult<BackendProfile> {
        self.get_profile_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.profiles
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("backend profile {}", id)))
    }

    async fn default_profile(&self, tenant_id: i64) -> StoreResult<Option<ProfileKey>> {
        let Some(id) = self.defaults.lock().unwrap().get(&tenant_id).copied() else {
            return Ok(None);
        };
        Ok(self
            .profiles
            .lock()
            .unwrap()
            .get(&id)
            .filter(|p| !p.disabled)
            .map(BackendProfile::key))
    }

    async fn profile_key(&self, tenant_id: i64, id: i32) -> StoreResult<ProfileKey> {
        self.profiles
            .lock()
            .unwrap()
            .get(&id)
            .filter(|p| p.tenant_id == tenant_id && !p.disabled)
            .map(BackendProfile::key)
            .ok_or_else(|| StoreError::NotFound(format!("backend profile {}", id)))
    }
}

/// Policies per tenant in insertion order.
#[derive(Clone, Default)]
pub struct MemoryPolicyStore {
    policies: Arc<Mutex<HashMap<i64, Vec<FilePolicy>>>>,
    list_calls: Arc<AtomicUsize>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, policy: FilePolicy) {
        self.policies
            .lock()
            .unwrap()
            .entry(policy.tenant_id)
            .or_default()
            .push(policy);
    }

    pub fn clear(&self, tenant_id: i64) {
        self.policies.lock().unwrap().remove(&tenant_id);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn list_enabled_policies(&self, tenant_id: i64) -> StoreResult<Vec<FilePolicy>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .policies
            .lock()
            .unwrap()
            .get(&tenant_id)
            .map(|list| list.iter().filter(|p| p.enabled).cloned().collect())
            .unwrap_or_default())
    }
}

/// File table and pending-job table.
#[derive(Clone)]
pub struct MemoryMetadataStore {
    profiles: MemoryBackendProfileStore,
    files: Arc<Mutex<HashMap<i64, StoredRow>>>,
    jobs: Arc<Mutex<BTreeMap<i64, PendingUploadJob>>>,
    next_id: Arc<AtomicI64>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryMetadataStore {
    /// `profiles` resolves the version tag returned by `get_file_with_backend`.
    pub fn new(profiles: MemoryBackendProfileStore) -> Self {
        Self {
            profiles,
            files: Arc::new(Mutex::new(HashMap::new())),
            jobs: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: Arc::new(AtomicI64::new(1)),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn file(&self, id: i64) -> Option<StoredRow> {
        self.files.lock().unwrap().get(&id).cloned()
    }

    pub fn files(&self) -> Vec<StoredRow> {
        let mut rows: Vec<_> = self.files.lock().unwrap().values().cloned().collect();
        rows.sort_by_key(|row| row.file.id);
        rows
    }

    pub fn job(&self, id: i64) -> Option<PendingUploadJob> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    pub fn jobs(&self) -> Vec<PendingUploadJob> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    /// Backdate a job's last update, as if it had been left alone for `age`.
    pub fn age_job(&self, id: i64, age: Duration) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&id) {
            job.updated_at -= chrono::Duration::from_std(age).unwrap();
        }
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn insert_file(&self, file: &FileMetadata, profile_id: Option<i32>) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut file = file.clone();
        file.id = Some(id);
        file.created_at.get_or_insert_with(Utc::now);
        self.files.lock().unwrap().insert(
            id,
            StoredRow {
                file,
                profile_id,
                removed: false,
            },
        );
        id
    }
}

fn untouched_for(job: &PendingUploadJob, window: Duration) -> bool {
    let age = Utc::now() - job.updated_at;
    age.to_std().map(|age| age >= window).unwrap_or(window.is_zero())
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create_file(&self, file: &FileMetadata, profile_id: Option<i32>) -> StoreResult<i64> {
        self.check()?;
        Ok(self.insert_file(file, profile_id))
    }

    async fn get_file_with_backend(&self, tenant_id: i64, id: i64) -> StoreResult<StoredFile> {
        self.check()?;
        let row = self
            .files
            .lock()
            .unwrap()
            .get(&id)
            .filter(|row| row.file.tenant_id == tenant_id && !row.removed)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("file {}", id)))?;
        let profile = match row.profile_id {
            Some(profile_id) => Some(self.profiles.profile_key(tenant_id, profile_id).await?),
            None => None,
        };
        Ok(StoredFile {
            file: row.file,
            profile,
        })
    }

    async fn mark_removed(&self, tenant_id: i64, ids: &[i64]) -> StoreResult<()> {
        self.check()?;
        let mut files = self.files.lock().unwrap();
        for id in ids {
            if let Some(row) = files.get_mut(id).filter(|r| r.file.tenant_id == tenant_id) {
                row.removed = true;
            }
        }
        Ok(())
    }

    async fn create_pending_job(
        &self,
        file: &FileMetadata,
        profile_id: Option<i32>,
    ) -> StoreResult<PendingUploadJob> {
        self.check()?;
        let now = Utc::now();
        let job = PendingUploadJob {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            file: file.clone(),
            profile_id,
            state: JobState::Idle,
            attempts: 0,
            node_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs.lock().unwrap().insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_pending_jobs(
        &self,
        limit: usize,
        node_id: &str,
        stale_after: Duration,
    ) -> StoreResult<Vec<PendingUploadJob>> {
        self.check()?;
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();
        let mut claimed = Vec::new();
        for job in jobs.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            let eligible = match job.state {
                JobState::Idle => true,
                JobState::Active | JobState::Errored => untouched_for(job, stale_after),
            };
            if !eligible {
                continue;
            }
            job.state = JobState::Active;
            job.attempts += 1;
            job.node_id = Some(node_id.to_string());
            job.updated_at = now;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn complete_pending_job(
        &self,
        job_id: i64,
        file: &FileMetadata,
        profile_id: Option<i32>,
    ) -> StoreResult<i64> {
        self.check()?;
        self.jobs
            .lock()
            .unwrap()
            .remove(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("pending job {}", job_id)))?;
        Ok(self.insert_file(file, profile_id))
    }

    async fn delete_pending_job(&self, id: i64) -> StoreResult<()> {
        self.check()?;
        self.jobs.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn mark_pending_job_errored(&self, id: i64, reason: &str) -> StoreResult<()> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("pending job {}", id)))?;
        job.state = JobState::Errored;
        job.error = Some(reason.to_string());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn sweep_errored_jobs(&self, older_than: Duration) -> StoreResult<Vec<PendingUploadJob>> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        let expired: Vec<i64> = jobs
            .values()
            .filter(|job| job.state == JobState::Errored && untouched_for(job, older_than))
            .map(|job| job.id)
            .collect();
        Ok(expired
            .into_iter()
            .filter_map(|id| jobs.remove(&id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(tenant_id: i64) -> FileMetadata {
        FileMetadata::new(tenant_id, "req", "a.txt", "text/plain")
    }

    #[tokio::test]
    async fn test_claim_skips_recently_touched_jobs() {
        let store = MemoryMetadataStore::new(MemoryBackendProfileStore::new());
        let job = store.create_pending_job(&file(1), None).await.unwrap();

        let claimed = store
            .claim_pending_jobs(10, "node-a", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 1);

        // Active and fresh: not claimable by anyone.
        let again = store
            .claim_pending_jobs(10, "node-b", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(again.is_empty());

        store.age_job(job.id, Duration::from_secs(61));
        let stolen = store
            .claim_pending_jobs(10, "node-b", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(stolen[0].node_id.as_deref(), Some("node-b"));
        assert_eq!(stolen[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_complete_moves_job_into_files() {
        let store = MemoryMetadataStore::new(MemoryBackendProfileStore::new());
        let job = store.create_pending_job(&file(1), None).await.unwrap();
        let id = store.complete_pending_job(job.id, &job.file, None).await.unwrap();
        assert!(store.job(job.id).is_none());
        assert_eq!(store.file(id).unwrap().file.id, Some(id));
        assert!(store.complete_pending_job(job.id, &job.file, None).await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_only_removes_old_errored_jobs() {
        let store = MemoryMetadataStore::new(MemoryBackendProfileStore::new());
        let old = store.create_pending_job(&file(1), None).await.unwrap();
        let fresh = store.create_pending_job(&file(1), None).await.unwrap();
        let idle = store.create_pending_job(&file(1), None).await.unwrap();
        store.mark_pending_job_errored(old.id, "boom").await.unwrap();
        store.mark_pending_job_errored(fresh.id, "boom").await.unwrap();
        store.age_job(old.id, Duration::from_secs(3600));
        store.age_job(idle.id, Duration::from_secs(3600));

        let swept = store.sweep_errored_jobs(Duration::from_secs(600)).await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, old.id);
        assert!(store.job(fresh.id).is_some());
        assert!(store.job(idle.id).is_some());
    }

    #[tokio::test]
    async fn test_removed_files_are_not_found() {
        let store = MemoryMetadataStore::new(MemoryBackendProfileStore::new());
        let id = store.create_file(&file(5), None).await.unwrap();
        assert!(store.get_file_with_backend(5, id).await.is_ok());
        assert!(store.get_file_with_backend(6, id).await.is_err());
        store.mark_removed(5, &[id]).await.unwrap();
        assert!(matches!(
            store.get_file_with_backend(5, id).await,
            Err(StoreError::NotFound(_))
        ));
    }
}

//! S3-based state storage backend.
//!
//! Stores state at `s3://<bucket>/<prefix><project>/<environment>/state.json`
//! for teams sharing one state. The lock is a sibling `state.lock` object.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};

use crate::error::{Result, StackError, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, holder_or_generated};
use super::store::StateStore;
use super::types::DeploymentState;

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, ending in `/` unless empty.
    prefix: String,
}

/// Builds the key prefix for a project environment.
fn project_prefix(prefix: Option<&str>, project: &str, environment: &str) -> String {
    let base = prefix.map(|p| p.trim_matches('/')).unwrap_or_default();
    if base.is_empty() {
        format!("{project}/{environment}/")
    } else {
        format!("{base}/{project}/{environment}/")
    }
}

impl S3StateStore {
    /// Creates a new S3 state store for `project/environment`.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(
        bucket: &str,
        prefix: Option<&str>,
        region: Option<&str>,
        project: &str,
        environment: &str,
    ) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(
            Client::new(&config),
            bucket,
            prefix,
            project,
            environment,
        ))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(
        client: Client,
        bucket: &str,
        prefix: Option<&str>,
        project: &str,
        environment: &str,
    ) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: project_prefix(prefix, project, environment),
        }
    }

    /// Gets the full S3 key for a file.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    StackError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    StackError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StackError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StackError::State(StateError::s3(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StackError::State(StateError::s3(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StackError::State(StateError::s3(format!(
                        "S3 head error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        let Some(content) = self.get_object(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&content).map(Some).map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to parse lock: {e}"),
            })
        })
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<DeploymentState>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        match self.get_object(&key).await? {
            Some(json) => {
                let state = DeploymentState::from_json(&json)?;
                debug!("Loaded state for {}", state.qualified_name());
                Ok(Some(state))
            }
            None => {
                debug!("No state found in S3");
                Ok(None)
            }
        }
    }

    async fn save(&self, state: &DeploymentState) -> Result<()> {
        let key = self.key(STATE_KEY);
        debug!("Saving state to s3://{}/{key}", self.bucket);

        self.put_object(&key, &state.to_json()?).await?;

        debug!("State saved to S3 (serial {})", state.serial);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.key(STATE_KEY);
        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn exists(&self) -> Result<bool> {
        self.object_exists(&self.key(STATE_KEY)).await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock().await? {
            if !existing.is_expired() {
                return Err(StackError::State(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            warn!("Taking over expired lock held by {}", existing.holder);
        }

        let lock_info = LockInfo::new(&holder_or_generated(holder), operation);
        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            StackError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;

        self.put_object(&self.key(LOCK_KEY), &content).await?;

        // Read back to detect a concurrent writer winning the race.
        match self.read_lock().await? {
            Some(current) if current.lock_id == lock_info.lock_id => {}
            Some(current) => {
                return Err(StackError::State(StateError::LockedByOther {
                    holder: current.holder,
                    since: current.acquired_at.to_rfc3339(),
                }));
            }
            None => {
                return Err(StackError::State(StateError::LockFailed {
                    message: String::from("Lock object disappeared after write"),
                }));
            }
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }

        Ok(())
    }

    async fn force_unlock(&self) -> Result<Option<LockInfo>> {
        let existing = self.read_lock().await?;
        if let Some(lock) = &existing {
            self.delete_object(&self.key(LOCK_KEY)).await?;
            warn!("Force-removed state lock {} held by {}", lock.lock_id, lock.holder);
        }
        Ok(existing)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key(STATE_KEY))
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

use crate::error::{BotError, BotResult};
use crate::models::user::{UserFile, UserProfile, UserRecord};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Known users, mirrored to a JSON file. One writer at a time.
#[derive(Clone)]
pub struct UserStore {
    path: Option<PathBuf>,
    users: Arc<Mutex<BTreeMap<i64, UserRecord>>>,
}

impl UserStore {
    /// Reads the whole file. A missing file starts an empty store. A file that
    /// cannot be parsed is renamed aside first, so the next write never
    /// replaces it.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let users = match read_file(&path).await {
            Ok(records) => {
                info!("Loaded {} users from {}", records.len(), path.display());
                records
            }
            Err(LoadError::Unreadable(e)) => {
                error!("Failed to read user data from {}: {}", path.display(), e);
                BTreeMap::new()
            }
            Err(LoadError::Corrupt(e)) => {
                let aside = corrupt_path(&path, Utc::now());
                match tokio::fs::rename(&path, &aside).await {
                    Ok(()) => error!(
                        "User data in {} is unreadable ({}), moved to {}",
                        path.display(),
                        e,
                        aside.display()
                    ),
                    Err(re) => error!(
                        "User data in {} is unreadable ({}) and could not be moved aside: {}",
                        path.display(),
                        e,
                        re
                    ),
                }
                BTreeMap::new()
            }
        };
        Self {
            path: Some(path),
            users: Arc::new(Mutex::new(users)),
        }
    }

    /// Never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            users: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Inserts or refreshes the user; returns `true` for a first-time user.
    /// A failed write keeps the in-memory update and is logged.
    pub async fn record_interaction(&self, profile: &UserProfile) -> bool {
        self.record_interaction_at(profile, Utc::now()).await
    }

    pub async fn record_interaction_at(&self, profile: &UserProfile, now: DateTime<Utc>) -> bool {
        let mut users = self.users.lock().await;
        let is_new = match users.get_mut(&profile.id) {
            Some(record) => {
                record.touch(profile, now);
                false
            }
            None => {
                users.insert(profile.id, UserRecord::new(profile, now));
                true
            }
        };

        if is_new {
            info!("Registered new user {}", profile.id);
        }

        // Written while the lock is held so snapshots land in order.
        if let Err(e) = self.persist(&users).await {
            warn!("User store degraded to memory-only: {}", e);
        }
        is_new
    }

    pub async fn all_user_ids(&self) -> Vec<i64> {
        self.users.lock().await.keys().copied().collect()
    }

    pub async fn count(&self) -> usize {
        self.users.lock().await.len()
    }

    pub async fn active_since(&self, since: DateTime<Utc>) -> usize {
        self.users
            .lock()
            .await
            .values()
            .filter(|u| u.last_active.is_some_and(|t| t >= since))
            .count()
    }

    pub async fn get(&self, id: i64) -> Option<UserRecord> {
        self.users.lock().await.get(&id).cloned()
    }

    async fn persist(&self, users: &BTreeMap<i64, UserRecord>) -> BotResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let file = UserFile {
            users: users.values().cloned().collect(),
        };
        let body = serde_json::to_vec_pretty(&file)
            .map_err(|e| BotError::StorageUnavailable(e.to_string()))?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| BotError::StorageUnavailable(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| BotError::StorageUnavailable(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum LoadError {
    #[error(transparent)]
    Unreadable(#[from] std::io::Error),
    #[error(transparent)]
    Corrupt(#[from] serde_json::Error),
}

async fn read_file(path: &Path) -> Result<BTreeMap<i64, UserRecord>, LoadError> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    let file: UserFile = serde_json::from_slice(&raw)?;
    Ok(file.users.into_iter().map(|u| (u.id, u)).collect())
}

/// `user_data.json` becomes `user_data.json.corrupt-20240501100000`.
fn corrupt_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".corrupt-{}", now.format("%Y%m%d%H%M%S")));
    path.with_file_name(name)
}

/// Client identity and its on-disk profile
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Who the local user is for the lifetime of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    pub id: String,
    pub display_name: String,
}

impl ClientIdentity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ProfileFileV1 {
    version: u8,
    client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
}

fn profile_path(data_dir: &Path) -> PathBuf {
    data_dir.join("profile.json")
}

/// Stable per-device id plus the last chosen display name
#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
    client_id: String,
    display_name: Option<String>,
}

impl ProfileStore {
    /// Read `profile.json`, generating and persisting a fresh id on first use
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir).map_err(ChatError::Io)?;
        let path = profile_path(data_dir);

        if path.exists() {
            let raw = fs::read_to_string(&path).map_err(ChatError::Io)?;
            let parsed: ProfileFileV1 = serde_json::from_str(&raw).map_err(ChatError::Serialization)?;
            if parsed.version != 1 {
                return Err(ChatError::Config(format!(
                    "Unsupported profile file version: {}",
                    parsed.version
                )));
            }
            debug!("Loaded profile {} from {}", parsed.client_id, path.display());
            return Ok(Self {
                path,
                client_id: parsed.client_id,
                display_name: parsed.display_name,
            });
        }

        let store = Self {
            path,
            client_id: Uuid::new_v4().to_string(),
            display_name: None,
        };
        store.save()?;
        info!("Created new profile {}", store.client_id);
        Ok(store)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Identity for a session, if a name has been chosen
    pub fn identity(&self) -> Option<ClientIdentity> {
        self.display_name
            .as_ref()
            .map(|name| ClientIdentity::new(self.client_id.clone(), name.clone()))
    }

    pub fn set_display_name(&mut self, name: &str) -> Result<()> {
        self.display_name = Some(name.to_string());
        self.save()
    }

    /// Forget both id and name; the next load starts over
    pub fn clear(self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ChatError::Io(e)),
        }
    }

    fn save(&self) -> Result<()> {
        let file = ProfileFileV1 {
            version: 1,
            client_id: self.client_id.clone(),
            display_name: self.display_name.clone(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(ChatError::Serialization)?;
        fs::write(&self.path, json).map_err(ChatError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_id_is_stable_across_loads() {
        let dir = TempDir::new().unwrap();
        let first = ProfileStore::load_or_create(dir.path()).unwrap();
        let second = ProfileStore::load_or_create(dir.path()).unwrap();
        assert_eq!(first.client_id(), second.client_id());
        assert!(first.identity().is_none());
    }

    #[test]
    fn test_display_name_persists() {
        let dir = TempDir::new().unwrap();
        let mut store = ProfileStore::load_or_create(dir.path()).unwrap();
        store.set_display_name("Alice").unwrap();

        let reloaded = ProfileStore::load_or_create(dir.path()).unwrap();
        let identity = reloaded.identity().unwrap();
        assert_eq!(identity.display_name, "Alice");
        assert_eq!(identity.id, store.client_id());
    }

    #[test]
    fn test_clear_starts_over() {
        let dir = TempDir::new().unwrap();
        let store = ProfileStore::load_or_create(dir.path()).unwrap();
        let old_id = store.client_id().to_string();
        store.clear().unwrap();

        let fresh = ProfileStore::load_or_create(dir.path()).unwrap();
        assert_ne!(fresh.client_id(), old_id);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(
            profile_path(dir.path()),
            r#"{"version":2,"client_id":"x"}"#,
        )
        .unwrap();
        assert!(matches!(
            ProfileStore::load_or_create(dir.path()),
            Err(ChatError::Config(_))
        ));
    }
}

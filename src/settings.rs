use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};
use tracing::{info, warn};

/// Key under which the isolation directory is persisted. An empty or absent
/// value means the scan host picks its own default directory.
pub const ISOLATION_PATH_KEY: &str = "WARDEN_ISOLATION_PATH";

#[async_trait::async_trait]
#[typetag::serde]
pub trait SettingsStoreType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn SettingsStoreType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct Settings(pub Box<dyn SettingsStoreType>);

impl Settings {
    pub fn into_inner(self) -> Box<dyn SettingsStoreType> {
        self.0
    }

    /// Current isolation directory, empty if the user never picked one.
    pub async fn isolation_path(&self) -> String {
        self.0.get(ISOLATION_PATH_KEY).await.unwrap_or_default()
    }

    /// Persist a new isolation directory. Callers must only do this after
    /// the scan host has confirmed the move.
    pub async fn set_isolation_path(&self, path: &str) -> Result<(), String> {
        self.0.set(ISOLATION_PATH_KEY, path).await
    }
}

impl Clone for Settings {
    fn clone(&self) -> Self {
        Settings(self.0.clone_box())
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Settings backed by a `.env`-style file plus the process environment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvSettingsStore {
    env_file: PathBuf,
}

impl EnvSettingsStore {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(env_file.clone()).ok();
            info!("Loaded settings from {}", env_file.display());
        } else {
            info!("No settings file at {} yet", env_file.display());
        }

        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl SettingsStoreType for EnvSettingsStore {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        unsafe {
            env::set_var(key, value);
        };
        let env_path = &self.env_file;
        if let Some(parent) = env_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            }
        }

        // Rewrite the file line-wise so unrelated keys and comments survive.
        let content = fs::read_to_string(env_path).unwrap_or_default();
        let mut lines: Vec<String> = Vec::new();
        let mut found = false;

        for line in content.lines() {
            if let Some((k, _)) = line.split_once('=') {
                if k.trim() == key {
                    lines.push(format!("{key}={value}"));
                    found = true;
                } else {
                    lines.push(line.to_string());
                }
            } else {
                lines.push(line.to_string());
            }
        }

        if !found {
            lines.push(format!("{key}={value}"));
        }

        fs::write(env_path, lines.join("\n")).map_err(|e| e.to_string())?;

        Ok(())
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        let env_path = &self.env_file;
        if let Ok(content) = fs::read_to_string(env_path) {
            let lines: Vec<String> = content
                .lines()
                .filter(|line| {
                    if let Some((k, _)) = line.split_once('=') {
                        k.trim() != key
                    } else {
                        true
                    }
                })
                .map(|l| l.to_string())
                .collect();

            if let Err(e) = fs::write(env_path, lines.join("\n")) {
                warn!("could not rewrite {}: {e}", env_path.display());
            }
        }
    }

    fn clone_box(&self) -> Box<dyn SettingsStoreType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "EnvSettingsStore".to_string()
    }
}

/// In-memory settings, used by tests and one-shot commands that must not
/// touch the user's files.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MapSettingsStore {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapSettingsStore {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            map: DashMap::new(),
        })
    }
}

#[typetag::serde]
#[async_trait]
impl SettingsStoreType for MapSettingsStore {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn SettingsStoreType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapSettingsStore({} entries)", self.map.len())
    }
}

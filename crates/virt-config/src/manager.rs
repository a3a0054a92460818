//! System configuration: RW-locked cache over a YAML ↔ database three-way
//! merge
//!
//! The on-disk marker file arbitrates on startup:
//! * marker present — the database is authoritative and is written back to
//!   the YAML document;
//! * no marker but database rows exist — an upgrade: the database wins and
//!   the marker is recreated;
//! * neither — the shipped YAML seeds the database.
//!
//! Keys are kebab-case everywhere; other casings are rejected at the edge.
//! Change callbacks fire *after* the write lock is released so a slow
//! subscriber cannot stall readers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use serde_yaml::Value as Yaml;
use tokio::sync::RwLock;
use tracing::{debug, info};

use virt_db::{ConfigRepo, DbManager};
use virt_types::validate_config_key;

use crate::error::{ConfigError, Result};

pub type ConfigKey = (String, String);

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigValue {
    pub value: String,
    pub value_type: String,
    pub is_public: bool,
}

type ChangeCallback = Arc<dyn Fn(&ConfigKey, &ConfigValue) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// Marker present: database-of-record wins, YAML is rewritten
    DbWins,
    /// Rows without a marker: upgrade — database wins, marker recreated
    Upgrade,
    /// Fresh install: YAML seeds the database
    YamlWins,
}

pub fn decide_merge(marker_exists: bool, db_rows: i64) -> MergeDecision {
    if marker_exists {
        MergeDecision::DbWins
    } else if db_rows > 0 {
        MergeDecision::Upgrade
    } else {
        MergeDecision::YamlWins
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub yaml_path: PathBuf,
    pub marker_path: PathBuf,
}

impl ConfigPaths {
    pub fn new(yaml_path: impl Into<PathBuf>) -> Self {
        Self {
            yaml_path: yaml_path.into(),
            marker_path: PathBuf::from("./storage/.config_modified"),
        }
    }

    pub fn with_marker(mut self, marker_path: impl Into<PathBuf>) -> Self {
        self.marker_path = marker_path.into();
        self
    }
}

/// Flatten the two-level YAML document (category → key → scalar) into
/// typed entries. Non-kebab keys are rejected here, at the edge.
pub fn parse_yaml_entries(text: &str) -> Result<Vec<(ConfigKey, ConfigValue)>> {
    let document: Yaml = serde_yaml::from_str(text)?;
    let mut entries = Vec::new();
    let Yaml::Mapping(categories) = document else {
        return Ok(entries);
    };
    for (category, keys) in &categories {
        let (Some(category), Yaml::Mapping(keys)) = (category.as_str(), keys) else {
            continue;
        };
        validate_config_key(category)?;
        for (key, value) in keys {
            let Some(key) = key.as_str() else { continue };
            validate_config_key(key)?;
            let (text, value_type) = scalar_to_text(value)?;
            entries.push((
                (category.to_string(), key.to_string()),
                ConfigValue {
                    value: text,
                    value_type,
                    is_public: false,
                },
            ));
        }
    }
    Ok(entries)
}

fn scalar_to_text(value: &Yaml) -> Result<(String, String)> {
    Ok(match value {
        Yaml::Bool(b) => (b.to_string(), "bool".to_string()),
        Yaml::Number(n) if n.is_i64() || n.is_u64() => (n.to_string(), "int".to_string()),
        Yaml::Number(n) => (n.to_string(), "float".to_string()),
        Yaml::String(s) => (s.clone(), "string".to_string()),
        other => (serde_yaml::to_string(other)?.trim_end().to_string(), "json".to_string()),
    })
}

fn text_to_scalar(value: &ConfigValue) -> Yaml {
    match value.value_type.as_str() {
        "bool" => value
            .value
            .parse::<bool>()
            .map(Yaml::Bool)
            .unwrap_or_else(|_| Yaml::String(value.value.clone())),
        "int" => value
            .value
            .parse::<i64>()
            .map(|n| Yaml::Number(n.into()))
            .unwrap_or_else(|_| Yaml::String(value.value.clone())),
        "float" => value
            .value
            .parse::<f64>()
            .map(|n| Yaml::Number(serde_yaml::Number::from(n)))
            .unwrap_or_else(|_| Yaml::String(value.value.clone())),
        _ => Yaml::String(value.value.clone()),
    }
}

/// Update the original document in place so comments-free structure and
/// category order survive a DB-wins rewrite.
pub fn merge_into_yaml(
    original: &str,
    entries: &HashMap<ConfigKey, ConfigValue>,
) -> Result<String> {
    let mut document: Yaml = if original.trim().is_empty() {
        Yaml::Mapping(Default::default())
    } else {
        serde_yaml::from_str(original)?
    };
    if !matches!(document, Yaml::Mapping(_)) {
        document = Yaml::Mapping(Default::default());
    }
    let Yaml::Mapping(categories) = &mut document else {
        unreachable!()
    };

    for ((category, key), value) in entries {
        let category_key = Yaml::String(category.clone());
        let entry = categories
            .entry(category_key)
            .or_insert_with(|| Yaml::Mapping(Default::default()));
        if let Yaml::Mapping(keys) = entry {
            keys.insert(Yaml::String(key.clone()), text_to_scalar(value));
        }
    }
    Ok(serde_yaml::to_string(&document)?)
}

pub struct ConfigManager {
    db: Arc<DbManager>,
    paths: ConfigPaths,
    cache: RwLock<HashMap<ConfigKey, ConfigValue>>,
    callbacks: StdMutex<Vec<ChangeCallback>>,
}

impl ConfigManager {
    /// Load the configuration, running the three-way merge.
    pub async fn load(db: Arc<DbManager>, paths: ConfigPaths) -> Result<Arc<Self>> {
        let manager = Arc::new(Self {
            db,
            paths,
            cache: RwLock::new(HashMap::new()),
            callbacks: StdMutex::new(Vec::new()),
        });
        manager.reconcile().await?;
        Ok(manager)
    }

    async fn reconcile(&self) -> Result<()> {
        let pool = self.db.pool().await;
        let db_rows = ConfigRepo::count(&pool).await?;
        let marker_exists = self.paths.marker_path.exists();
        let decision = decide_merge(marker_exists, db_rows);
        info!(?decision, db_rows, marker_exists, "reconciling configuration");

        match decision {
            MergeDecision::DbWins | MergeDecision::Upgrade => {
                let mut cache = HashMap::new();
                for row in ConfigRepo::all(&pool).await? {
                    validate_config_key(&row.config_key)?;
                    cache.insert(
                        (row.category.clone(), row.config_key.clone()),
                        ConfigValue {
                            value: row.config_value,
                            value_type: row.value_type,
                            is_public: row.is_public,
                        },
                    );
                }
                self.write_yaml(&cache)?;
                if decision == MergeDecision::Upgrade {
                    self.touch_marker()?;
                }
                *self.cache.write().await = cache;
            }
            MergeDecision::YamlWins => {
                let text = read_file_or_empty(&self.paths.yaml_path)?;
                let entries = parse_yaml_entries(&text)?;
                let mut cache = HashMap::new();
                for ((category, key), value) in entries {
                    ConfigRepo::upsert(
                        &pool,
                        &category,
                        &key,
                        &value.value,
                        &value.value_type,
                        value.is_public,
                    )
                    .await?;
                    cache.insert((category, key), value);
                }
                *self.cache.write().await = cache;
            }
        }
        Ok(())
    }

    fn write_yaml(&self, cache: &HashMap<ConfigKey, ConfigValue>) -> Result<()> {
        let original = read_file_or_empty(&self.paths.yaml_path)?;
        let merged = merge_into_yaml(&original, cache)?;
        if let Some(parent) = self.paths.yaml_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error(&self.paths.yaml_path, e))?;
        }
        std::fs::write(&self.paths.yaml_path, merged)
            .map_err(|e| io_error(&self.paths.yaml_path, e))?;
        Ok(())
    }

    fn touch_marker(&self) -> Result<()> {
        if let Some(parent) = self.paths.marker_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error(&self.paths.marker_path, e))?;
        }
        std::fs::write(&self.paths.marker_path, b"")
            .map_err(|e| io_error(&self.paths.marker_path, e))?;
        Ok(())
    }

    pub async fn get(&self, category: &str, key: &str) -> Option<ConfigValue> {
        self.cache
            .read()
            .await
            .get(&(category.to_string(), key.to_string()))
            .cloned()
    }

    pub async fn get_i64(&self, category: &str, key: &str) -> Option<i64> {
        self.get(category, key).await?.value.parse().ok()
    }

    pub async fn get_bool(&self, category: &str, key: &str) -> Option<bool> {
        self.get(category, key).await?.value.parse().ok()
    }

    /// Write one value through to the database, the cache, the YAML file,
    /// and the marker. Callbacks run after the lock is dropped.
    pub async fn set(
        &self,
        category: &str,
        key: &str,
        value: &str,
        value_type: &str,
        is_public: bool,
    ) -> Result<()> {
        validate_config_key(category)?;
        validate_config_key(key)?;

        let pool = self.db.pool().await;
        ConfigRepo::upsert(&pool, category, key, value, value_type, is_public).await?;

        let config_key = (category.to_string(), key.to_string());
        let config_value = ConfigValue {
            value: value.to_string(),
            value_type: value_type.to_string(),
            is_public,
        };

        let snapshot = {
            let mut cache = self.cache.write().await;
            cache.insert(config_key.clone(), config_value.clone());
            cache.clone()
        };
        // The database has diverged from the shipped defaults
        self.touch_marker()?;
        self.write_yaml(&snapshot)?;

        let callbacks: Vec<ChangeCallback> = self.callbacks.lock().unwrap().clone();
        for callback in callbacks {
            callback(&config_key, &config_value);
        }
        debug!(category, key, "configuration value updated");
        Ok(())
    }

    pub async fn delete(&self, category: &str, key: &str) -> Result<bool> {
        let pool = self.db.pool().await;
        let removed = ConfigRepo::delete(&pool, category, key).await?;
        if removed {
            let mut cache = self.cache.write().await;
            cache.remove(&(category.to_string(), key.to_string()));
            self.touch_marker()?;
        }
        Ok(removed)
    }

    pub fn on_change(&self, callback: ChangeCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    /// Deep copy of the cache for rollback.
    pub async fn snapshot(&self) -> HashMap<ConfigKey, ConfigValue> {
        self.cache.read().await.clone()
    }

    pub async fn restore(&self, snapshot: HashMap<ConfigKey, ConfigValue>) -> Result<()> {
        let pool = self.db.pool().await;
        for ((category, key), value) in &snapshot {
            ConfigRepo::upsert(&pool, category, key, &value.value, &value.value_type, value.is_public)
                .await?;
        }
        self.write_yaml(&snapshot)?;
        *self.cache.write().await = snapshot;
        Ok(())
    }
}

fn read_file_or_empty(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(io_error(path, e)),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_decision_table() {
        assert_eq!(decide_merge(true, 0), MergeDecision::DbWins);
        assert_eq!(decide_merge(true, 5), MergeDecision::DbWins);
        assert_eq!(decide_merge(false, 5), MergeDecision::Upgrade);
        assert_eq!(decide_merge(false, 0), MergeDecision::YamlWins);
    }

    #[test]
    fn yaml_entries_parse_with_types() {
        let text = "\
scheduler:
  expiry-check-interval: 60
  enable-instance-sync: true
database:
  heartbeat-interval: 30
";
        let entries = parse_yaml_entries(text).unwrap();
        assert_eq!(entries.len(), 3);
        let interval = entries
            .iter()
            .find(|((_, key), _)| key == "expiry-check-interval")
            .unwrap();
        assert_eq!(interval.1.value, "60");
        assert_eq!(interval.1.value_type, "int");
        let sync = entries
            .iter()
            .find(|((_, key), _)| key == "enable-instance-sync")
            .unwrap();
        assert_eq!(sync.1.value_type, "bool");
    }

    #[test]
    fn camel_case_keys_are_rejected() {
        let text = "scheduler:\n  expiryCheckInterval: 60\n";
        assert!(parse_yaml_entries(text).is_err());
    }

    #[test]
    fn merge_preserves_existing_structure_and_updates_values() {
        let original = "\
scheduler:
  expiry-check-interval: 60
database:
  heartbeat-interval: 30
";
        let mut entries = HashMap::new();
        entries.insert(
            ("scheduler".to_string(), "expiry-check-interval".to_string()),
            ConfigValue {
                value: "120".to_string(),
                value_type: "int".to_string(),
                is_public: false,
            },
        );
        let merged = merge_into_yaml(original, &entries).unwrap();
        let reparsed = parse_yaml_entries(&merged).unwrap();
        assert!(reparsed
            .iter()
            .any(|((_, key), v)| key == "expiry-check-interval" && v.value == "120"));
        // Untouched keys survive
        assert!(reparsed
            .iter()
            .any(|((_, key), v)| key == "heartbeat-interval" && v.value == "30"));
    }

    #[test]
    fn scalar_round_trip_types() {
        for (value, value_type) in [("true", "bool"), ("42", "int"), ("1.5", "float"), ("x", "string")] {
            let config_value = ConfigValue {
                value: value.to_string(),
                value_type: value_type.to_string(),
                is_public: false,
            };
            let scalar = text_to_scalar(&config_value);
            let (back, back_type) = scalar_to_text(&scalar).unwrap();
            assert_eq!(back, value);
            assert_eq!(back_type, value_type);
        }
    }
}

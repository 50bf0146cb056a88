use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Mutex,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Durable-write capability invoked by the engine when a value is saved.
///
/// The engine treats this as opaque: one call per `(registration, key)` pair,
/// success collapses the in-memory source value, failure leaves the key
/// dirty. The engine never retries on its own; implementations must be safe
/// to retry manually.
#[async_trait]
pub trait Persist: Send + Sync {
    async fn persist(
        &self,
        locator: &str,
        registration_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<()>;
}

/// File-backed implementation. The locator is a path to a TOML document with
/// one table per registration id; each save rewrites a single `key = value`
/// entry in place and leaves the rest of the document untouched.
pub struct TomlFilePersist;

#[async_trait]
impl Persist for TomlFilePersist {
    async fn persist(
        &self,
        locator: &str,
        registration_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<()> {
        let path = Path::new(locator);
        let mut document = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw
                .parse::<toml::Table>()
                .with_context(|| format!("'{locator}' is not valid TOML"))?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => toml::Table::new(),
            Err(error) => {
                return Err(error).with_context(|| format!("failed to read '{locator}'"))
            }
        };

        let table = document
            .entry(registration_id.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        let table = table
            .as_table_mut()
            .with_context(|| format!("entry '{registration_id}' in '{locator}' is not a table"))?;
        table.insert(key.to_string(), json_to_toml(value)?);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create parent of '{locator}'"))?;
            }
        }
        let rendered = toml::to_string_pretty(&document).context("failed to render TOML")?;
        tokio::fs::write(path, rendered)
            .await
            .with_context(|| format!("failed to write '{locator}'"))?;
        debug!(%locator, %registration_id, %key, "persisted tunable value");
        Ok(())
    }
}

fn json_to_toml(value: &Value) -> Result<toml::Value> {
    let toml_value = match value {
        Value::Bool(flag) => toml::Value::Boolean(*flag),
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                toml::Value::Integer(integer)
            } else if let Some(float) = number.as_f64() {
                toml::Value::Float(float)
            } else {
                anyhow::bail!("number {number} does not fit a TOML value");
            }
        }
        Value::String(text) => toml::Value::String(text.clone()),
        Value::Array(items) => {
            toml::Value::Array(items.iter().map(json_to_toml).collect::<Result<_>>()?)
        }
        Value::Object(map) => {
            let mut table = toml::Table::new();
            for (key, item) in map {
                table.insert(key.clone(), json_to_toml(item)?);
            }
            toml::Value::Table(table)
        }
        Value::Null => anyhow::bail!("null cannot be persisted"),
    };
    Ok(toml_value)
}

/// In-memory double for tests. Keys listed in the failure set reject every
/// persist call, which is how partial save-all behavior gets exercised.
#[derive(Default)]
pub struct MemoryPersist {
    saved: Mutex<HashMap<(String, String), Value>>,
    failing: Mutex<HashSet<(String, String)>>,
}

impl MemoryPersist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_key(&self, registration_id: &str, key: &str) {
        self.failing
            .lock()
            .expect("persist failure set poisoned")
            .insert((registration_id.to_string(), key.to_string()));
    }

    pub fn saved_value(&self, registration_id: &str, key: &str) -> Option<Value> {
        self.saved
            .lock()
            .expect("persist store poisoned")
            .get(&(registration_id.to_string(), key.to_string()))
            .cloned()
    }

    pub fn saved_len(&self) -> usize {
        self.saved.lock().expect("persist store poisoned").len()
    }
}

#[async_trait]
impl Persist for MemoryPersist {
    async fn persist(
        &self,
        _locator: &str,
        registration_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<()> {
        let pair = (registration_id.to_string(), key.to_string());
        if self
            .failing
            .lock()
            .expect("persist failure set poisoned")
            .contains(&pair)
        {
            anyhow::bail!("simulated persist failure for '{registration_id}.{key}'");
        }
        self.saved
            .lock()
            .expect("persist store poisoned")
            .insert(pair, value.clone());
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

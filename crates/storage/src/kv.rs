use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Account-settings storage: string keys, JSON values.
pub trait KeyValueStore: Send + Sync {
    fn get_raw(&self, key: &str) -> Result<Option<Value>>;
    fn put_raw(&self, key: &str, value: Value) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

pub trait KeyValueExt: KeyValueStore {
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_raw(key)?
            .map(|value| {
                serde_json::from_value(value)
                    .with_context(|| format!("malformed value stored under '{key}'"))
            })
            .transpose()
    }

    fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("failed to encode value for '{key}'"))?;
        self.put_raw(key, value)
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueExt for S {}

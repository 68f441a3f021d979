//! Durable key→string storage shared by the widget components.
//!
//! The embedding host decides where values actually live (browser local
//! storage, app preferences, a file on disk). The widget only requires the
//! [`KeyValueStore`] contract: string keys, string values, absence is
//! `None` and never an error.
//!
//! Two implementations ship with the crate: [`MemoryKv`] for hosts that
//! persist elsewhere (and for tests), and [`FileKv`], a JSON file under a
//! root directory so values survive host restarts.

use crate::error::{Result, WidgetError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Durable key→string store. Values survive widget re-instantiation; with a
/// persistent implementation they survive host restarts too.
pub trait KeyValueStore: Send + Sync {
    /// Read a value. Absence is `Ok(None)`, never an error.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value if present.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Canonical store keys.
///
/// Gate state is keyed by `(chatbot_id, session_id)` so two widgets for
/// different bots on the same page never share counters or flags. All key
/// construction goes through these functions.
pub mod keys {
    use crate::auth::AuthMethod;

    /// Key holding the stable per-host session identifier.
    #[must_use]
    pub fn session_id() -> String {
        "colloquy_session_id".to_owned()
    }

    /// Key holding the verified identifier for an auth method.
    #[must_use]
    pub fn identity(method: AuthMethod) -> String {
        format!("colloquy_identity:{}", method.as_str())
    }

    /// Key holding the persisted auth-gate flag.
    #[must_use]
    pub fn gate_flag(chatbot_id: &str, session_id: &str) -> String {
        format!("auth_gate:{chatbot_id}:{session_id}")
    }

    /// Key holding the unauthenticated message counter.
    #[must_use]
    pub fn message_count(chatbot_id: &str, session_id: &str) -> String {
        format!("message_count:{chatbot_id}:{session_id}")
    }

    /// Key holding the OTP resend-window start timestamp (unix seconds).
    #[must_use]
    pub fn otp_resend_started(chatbot_id: &str, session_id: &str) -> String {
        format!("otp_resend:{chatbot_id}:{session_id}")
    }
}

/// Return the persisted session id, creating and storing one on first use.
///
/// The id is a UUID v4, generated once per host and shared by every widget
/// instance as a correlation key. It is never destroyed programmatically.
///
/// # Errors
///
/// Returns an error if the store cannot be read or written.
pub fn ensure_session_id(store: &dyn KeyValueStore) -> Result<String> {
    let key = keys::session_id();
    if let Some(existing) = store.get(&key)? {
        if !existing.trim().is_empty() {
            return Ok(existing);
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    store.set(&key, &id)?;
    Ok(id)
}

/// In-process store backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryKv {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|e| WidgetError::Store(format!("store lock poisoned: {e}")))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|e| WidgetError::Store(format!("store lock poisoned: {e}")))?;
        values.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|e| WidgetError::Store(format!("store lock poisoned: {e}")))?;
        values.remove(key);
        Ok(())
    }
}

/// File-backed store: one JSON object per widget host, written atomically
/// on every mutation so a crash never leaves a half-written file.
#[derive(Debug)]
pub struct FileKv {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileKv {
    /// Open (or create) the store file under `root_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn open(root_dir: &Path) -> Result<Self> {
        let path = root_dir.join("widget_store.json");
        let values = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)
                .map_err(|e| WidgetError::Store(format!("invalid store file: {e}")))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Open the store in the platform data directory (`~/.local/share/colloquy`).
    ///
    /// # Errors
    ///
    /// Returns an error if no data directory can be resolved or the file is
    /// unreadable.
    pub fn open_default() -> Result<Self> {
        let root = dirs::data_dir()
            .map(|d| d.join("colloquy"))
            .ok_or_else(|| WidgetError::Store("no data directory available".to_owned()))?;
        std::fs::create_dir_all(&root)?;
        Self::open(&root)
    }

    fn flush(&self, values: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(values)
            .map_err(|e| WidgetError::Store(format!("failed to serialize store: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|e| WidgetError::Store(format!("store lock poisoned: {e}")))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|e| WidgetError::Store(format!("store lock poisoned: {e}")))?;
        values.insert(key.to_owned(), value.to_owned());
        self.flush(&values)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|e| WidgetError::Store(format!("store lock poisoned: {e}")))?;
        values.remove(key);
        self.flush(&values)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::auth::AuthMethod;

    #[test]
    fn memory_kv_round_trip() {
        let store = MemoryKv::new();
        assert_eq!(store.get("missing").unwrap(), None);

        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));

        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn composite_keys_are_canonical() {
        assert_eq!(keys::gate_flag("bot1", "sess1"), "auth_gate:bot1:sess1");
        assert_eq!(
            keys::message_count("bot1", "sess1"),
            "message_count:bot1:sess1"
        );
        assert_ne!(
            keys::gate_flag("bot1", "sess1"),
            keys::gate_flag("bot2", "sess1")
        );
        assert_eq!(keys::identity(AuthMethod::Email), "colloquy_identity:email");
        assert_eq!(keys::identity(AuthMethod::Phone), "colloquy_identity:phone");
    }

    #[test]
    fn session_id_is_created_once_and_stable() {
        let store = MemoryKv::new();
        let first = ensure_session_id(&store).unwrap();
        let second = ensure_session_id(&store).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn file_kv_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = FileKv::open(dir.path()).unwrap();
            store.set("message_count:bot:sess", "2").unwrap();
            store.set("auth_gate:bot:sess", "1").unwrap();
        }

        let reopened = FileKv::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get("message_count:bot:sess").unwrap().as_deref(),
            Some("2")
        );
        assert_eq!(
            reopened.get("auth_gate:bot:sess").unwrap().as_deref(),
            Some("1")
        );
    }

    #[test]
    fn file_kv_remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileKv::open(dir.path()).unwrap();
            store.set("k", "v").unwrap();
            store.remove("k").unwrap();
        }
        let reopened = FileKv::open(dir.path()).unwrap();
        assert_eq!(reopened.get("k").unwrap(), None);
    }
}

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Mutex;

/// Storage key for the one persisted declaration
const CONFIG_KEY: &str = "config";

/// Key/value blob store backing the persisted declaration. Only the
/// raw declaration is kept, as `{"raw": <declaration>}` under the
/// `config` key; secrets stay cipher-text.
pub struct DeclarationStore {
    conn: Mutex<Connection>,
}

impl DeclarationStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open store: {}", db_path.display()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().expect("store lock poisoned").execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub fn save_declaration(&self, raw: &Value) -> Result<()> {
        let blob = serde_json::to_string(&json!({ "raw": raw }))?;
        self.conn.lock().expect("store lock poisoned").execute(
            "INSERT INTO kv_store (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![CONFIG_KEY, blob],
        )?;
        Ok(())
    }

    pub fn load_declaration(&self) -> Result<Option<Value>> {
        let blob: Option<String> = self
            .conn
            .lock()
            .expect("store lock poisoned")
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![CONFIG_KEY],
                |row| row.get(0),
            )
            .optional()?;

        match blob {
            None => Ok(None),
            Some(blob) => {
                let parsed: Value =
                    serde_json::from_str(&blob).context("stored declaration is not valid JSON")?;
                Ok(parsed.get("raw").cloned())
            }
        }
    }

    pub fn remove_declaration(&self) -> Result<()> {
        self.conn.lock().expect("store lock poisoned").execute(
            "DELETE FROM kv_store WHERE key = ?1",
            params![CONFIG_KEY],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_round_trip() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = DeclarationStore::open(&temp_dir.path().join("state.db"))?;

        assert!(store.load_declaration()?.is_none());

        let decl = json!({"class": "Telemetry", "L": {"class": "Telemetry_Listener"}});
        store.save_declaration(&decl)?;
        assert_eq!(store.load_declaration()?, Some(decl.clone()));

        // Overwrite keeps a single entry
        let updated = json!({"class": "Telemetry"});
        store.save_declaration(&updated)?;
        assert_eq!(store.load_declaration()?, Some(updated));

        store.remove_declaration()?;
        assert!(store.load_declaration()?.is_none());
        Ok(())
    }

    #[test]
    fn test_secrets_persist_as_cipher_text() -> Result<()> {
        let store = DeclarationStore::open_in_memory()?;
        let decl = json!({
            "class": "Telemetry",
            "S": {"class": "Telemetry_System", "passphrase": {"cipherText": "AAAA"}}
        });
        store.save_declaration(&decl)?;
        let loaded = store.load_declaration()?.unwrap();
        assert_eq!(loaded["S"]["passphrase"]["cipherText"], "AAAA");
        Ok(())
    }
}

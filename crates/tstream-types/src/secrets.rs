use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Replacement written over any secret-keyed field in logs and traces
pub const SECRET_MASK: &str = "*********";

/// Field names treated as secrets at any depth
pub const SECRET_KEYS: &[&str] = &["passphrase", "cipherText"];

/// Sentinel emitted when traversal exceeds the depth cap
pub const CIRCULAR_REF_SENTINEL: &str = "circularRefFound";

const MAX_MASK_DEPTH: usize = 64;

/// A declaration secret. The stored declaration only ever carries
/// cipher-text; plaintext exists in memory after the vault decrypts it
/// for an active consumer or poller.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Secret {
    /// `{"cipherText": "..."}` object form
    CipherText {
        #[serde(rename = "cipherText")]
        cipher_text: String,
    },
    /// Bare string form, treated as cipher-text
    Inline(String),
}

impl Secret {
    pub fn cipher_text(&self) -> &str {
        match self {
            Secret::CipherText { cipher_text } => cipher_text,
            Secret::Inline(text) => text,
        }
    }
}

// Debug never exposes the cipher-text either; masked output is safe to
// embed in error messages.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", SECRET_MASK)
    }
}

/// Decrypts cipher-text fields on demand. Only active consumers and
/// pollers ever hold the decrypted form.
pub trait SecretVault: Send + Sync {
    fn decrypt(&self, secret: &Secret) -> crate::error::Result<String>;
}

/// Produce a copy of `value` with every secret-keyed field replaced by
/// the mask. Traversal is depth-tracked; anything deeper than the cap is
/// replaced by the `circularRefFound` sentinel.
pub fn mask_secrets(value: &Value) -> Value {
    mask_at_depth(value, 0)
}

fn mask_at_depth(value: &Value, depth: usize) -> Value {
    if depth > MAX_MASK_DEPTH {
        return Value::String(CIRCULAR_REF_SENTINEL.to_string());
    }
    match value {
        Value::Object(map) => {
            let mut masked = Map::with_capacity(map.len());
            for (key, inner) in map {
                if SECRET_KEYS.contains(&key.as_str()) {
                    masked.insert(key.clone(), Value::String(SECRET_MASK.to_string()));
                } else {
                    masked.insert(key.clone(), mask_at_depth(inner, depth + 1));
                }
            }
            Value::Object(masked)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| mask_at_depth(v, depth + 1)).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mask_secrets_at_any_depth() {
        let input = json!({
            "credentials": {
                "username": "admin",
                "passphrase": "hunter2"
            },
            "consumers": [
                {"config": {"apiKey": {"cipherText": "deadbeef"}}}
            ]
        });

        let masked = mask_secrets(&input);
        assert_eq!(masked["credentials"]["passphrase"], SECRET_MASK);
        assert_eq!(masked["credentials"]["username"], "admin");
        assert_eq!(masked["consumers"][0]["config"]["apiKey"]["cipherText"], SECRET_MASK);
    }

    #[test]
    fn test_mask_replaces_whole_secret_value() {
        let input = json!({"passphrase": {"cipherText": "abc", "protected": "plain"}});
        let masked = mask_secrets(&input);
        assert_eq!(masked["passphrase"], SECRET_MASK);
    }

    #[test]
    fn test_depth_cap_yields_sentinel() {
        let mut value = json!("leaf");
        for _ in 0..80 {
            value = json!({ "next": value });
        }
        let masked = mask_secrets(&value);
        assert!(serde_json::to_string(&masked).unwrap().contains(CIRCULAR_REF_SENTINEL));
    }

    #[test]
    fn test_secret_debug_is_masked() {
        let secret = Secret::Inline("topsecret".to_string());
        assert!(!format!("{:?}", secret).contains("topsecret"));
    }
}

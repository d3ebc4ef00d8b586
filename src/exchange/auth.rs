//! Bitget WebSocket login signing
//!
//! Signs `timestamp + "GET" + "/user/verify"` with HMAC-SHA256 keyed by the
//! account secret, base64-encoded. The timestamp is whole seconds.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;

use crate::config::{Credentials, mask_key};
use crate::error::{BotError, BotResult};

type HmacSha256 = Hmac<Sha256>;

const VERIFY_METHOD: &str = "GET";
const VERIFY_PATH: &str = "/user/verify";

/// Bitget authentication handler
#[derive(Clone)]
pub struct BitgetAuth {
    api_key: String,
    secret_key: String,
    passphrase: String,
}

impl BitgetAuth {
    pub fn new(api_key: String, secret_key: String, passphrase: String) -> Self {
        Self {
            api_key,
            secret_key,
            passphrase,
        }
    }

    pub fn from_credentials(creds: &Credentials) -> Self {
        Self::new(
            creds.api_key.clone(),
            creds.secret_key.clone(),
            creds.passphrase.clone(),
        )
    }

    /// Login signature for a given timestamp (seconds)
    pub fn sign_login(&self, timestamp: u64) -> BotResult<String> {
        let message = format!("{}{}{}", timestamp, VERIFY_METHOD, VERIFY_PATH);
        self.hmac_sign(&message)
    }

    /// Build the `op: login` frame for the given timestamp
    pub fn login_message(&self, timestamp: u64) -> BotResult<String> {
        let sign = self.sign_login(timestamp)?;
        let msg = json!({
            "op": "login",
            "args": [{
                "apiKey": self.api_key,
                "passphrase": self.passphrase,
                "timestamp": timestamp.to_string(),
                "sign": sign,
            }]
        });
        Ok(msg.to_string())
    }

    /// Build a login frame stamped with the current time
    pub fn login_message_now(&self) -> BotResult<String> {
        self.login_message(Self::timestamp_secs())
    }

    /// Create HMAC-SHA256 signature with base64 encoding
    fn hmac_sign(&self, message: &str) -> BotResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| BotError::Auth(format!("HMAC initialization failed: {}", e)))?;
        mac.update(message.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// Current timestamp in whole seconds
    fn timestamp_secs() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

impl std::fmt::Debug for BitgetAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitgetAuth")
            .field("api_key", &mask_key(&self.api_key, 8))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> BitgetAuth {
        BitgetAuth::new(
            "test_key".to_string(),
            "test_secret".to_string(),
            "test_pass".to_string(),
        )
    }

    #[test]
    fn test_sign_login_known_vector() {
        let sig = auth().sign_login(1_700_000_000).unwrap();
        assert_eq!(sig, "tFs52ld4UvCPXyGNtieq3A1f33ocGrPqSRXdfdMhuHg=");
    }

    #[test]
    fn test_login_message_shape() {
        let text = auth().login_message(1_700_000_000).unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(v["op"], "login");
        let arg = &v["args"][0];
        assert_eq!(arg["apiKey"], "test_key");
        assert_eq!(arg["passphrase"], "test_pass");
        assert_eq!(arg["timestamp"], "1700000000");
        assert_eq!(arg["sign"], "tFs52ld4UvCPXyGNtieq3A1f33ocGrPqSRXdfdMhuHg=");
    }

    #[test]
    fn test_debug_hides_secret() {
        let dbg = format!("{:?}", auth());
        assert!(!dbg.contains("test_secret"));
        assert!(!dbg.contains("test_pass"));

        let wide = BitgetAuth::new("éééééééééé".into(), "s".into(), "p".into());
        assert!(format!("{:?}", wide).contains("éééééééé..."));
    }
}

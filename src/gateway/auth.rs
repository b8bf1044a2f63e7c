//! API-key verification.

use crate::config::CredentialConfig;
use crate::error::GatewayError;
use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::HashMap;

/// Every accepted key carries this prefix.
pub const KEY_PREFIX: &str = "cw_";

/// The application a request was authenticated as.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppIdentity {
    pub app_id: String,
    pub app_name: String,
    pub events_per_minute: u32,
}

/// Accepts either `Bearer <key>` or the bare key.
pub fn strip_scheme(value: &str) -> &str {
    let value = value.trim();
    match value.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ => value,
    }
}

/// Known API keys.
#[derive(Debug, Default)]
pub struct CredentialStore {
    by_key: HashMap<String, AppIdentity>,
}

impl CredentialStore {
    /// Resolve every configured credential. Fails on unresolvable or badly
    /// formatted keys so that a typo never silently locks an app out.
    pub fn from_config(credentials: &[CredentialConfig]) -> Result<Self> {
        let mut by_key = HashMap::new();
        for cred in credentials {
            let key = cred.resolve_key()?;
            if !key.starts_with(KEY_PREFIX) {
                bail!("API key for app {} must start with '{}'", cred.app_id, KEY_PREFIX);
            }
            let identity = AppIdentity {
                app_id: cred.app_id.clone(),
                app_name: cred.app_name.clone().unwrap_or_else(|| cred.app_id.clone()),
                events_per_minute: cred.events_per_minute,
            };
            if by_key.insert(key, identity).is_some() {
                bail!("API key for app {} is configured twice", cred.app_id);
            }
        }
        Ok(Self { by_key })
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// `(app_id, events_per_minute)` for every known application.
    pub fn limits(&self) -> impl Iterator<Item = (&str, u32)> {
        self.by_key
            .values()
            .map(|id| (id.app_id.as_str(), id.events_per_minute))
    }

    pub fn authenticate(&self, credential: Option<&str>) -> Result<AppIdentity, GatewayError> {
        let raw = credential.ok_or_else(|| GatewayError::unauthorized("missing API key"))?;
        let key = strip_scheme(raw);

        if !key.starts_with(KEY_PREFIX) {
            return Err(GatewayError::unauthorized("invalid API key format"));
        }

        self.by_key
            .get(key)
            .cloned()
            .ok_or_else(|| GatewayError::unauthorized("invalid API key"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(app_id: &str, key: &str) -> CredentialConfig {
        CredentialConfig {
            app_id: app_id.to_string(),
            app_name: None,
            api_key: Some(key.to_string()),
            api_key_env: None,
            events_per_minute: 60,
        }
    }

    #[test]
    fn test_strip_scheme() {
        assert_eq!(strip_scheme("Bearer cw_live_abc"), "cw_live_abc");
        assert_eq!(strip_scheme("bearer  cw_live_abc "), "cw_live_abc");
        assert_eq!(strip_scheme("cw_live_abc"), "cw_live_abc");
    }

    #[test]
    fn test_authenticate() {
        let store = CredentialStore::from_config(&[credential("shop", "cw_live_shop123")]).unwrap();

        let id = store.authenticate(Some("Bearer cw_live_shop123")).unwrap();
        assert_eq!(id.app_id, "shop");
        assert_eq!(id.app_name, "shop");

        for bad in [None, Some("sk_live_nope"), Some("cw_live_unknown")] {
            assert!(matches!(
                store.authenticate(bad),
                Err(GatewayError::Unauthorized(_))
            ));
        }
    }

    #[test]
    fn test_config_rejects_bad_prefix_and_duplicates() {
        assert!(CredentialStore::from_config(&[credential("shop", "abc")]).is_err());
        assert!(CredentialStore::from_config(&[
            credential("shop", "cw_test_1"),
            credential("blog", "cw_test_1"),
        ])
        .is_err());
    }
}

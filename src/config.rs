// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Host configuration for a server or client context. Loaded via `serde`
// from whatever format the embedding application prefers (TOML/JSON/env) —
// this is configuration for this process, not wire encoding; TagStruct's
// own format (tagstruct.rs) remains hand-rolled.

use crate::shm::BackingKind;

/// Server-side pool and transport configuration.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ServerConfig {
    pub shm_kind: BackingKind,
    pub shm_size: usize,
    pub per_client: bool,
    pub slot_size: usize,
    pub permission_mode: u32,
    pub inflight_per_client: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shm_kind: BackingKind::Private,
            shm_size: 4 * 1024 * 1024,
            per_client: false,
            slot_size: 64 * 1024,
            permission_mode: 0o600,
            inflight_per_client: 3,
        }
    }
}

/// Client-side reconnect and auth configuration.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ContextConfig {
    pub auto_reconnect: bool,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub auth_token: Option<Vec<u8>>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval_ms: 500,
            max_reconnect_attempts: 5,
            auth_token: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults_are_conservative() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.shm_kind, BackingKind::Private);
        assert!(cfg.inflight_per_client > 0);
    }

    #[test]
    fn context_config_round_trips_through_json() {
        let cfg = ContextConfig::default();
        let json = serde_json::to_string(&cfg).unwrap_or_default();
        if !json.is_empty() {
            let back: ContextConfig = serde_json::from_str(&json).unwrap();
            assert_eq!(back.reconnect_interval_ms, cfg.reconnect_interval_ms);
        }
    }
}

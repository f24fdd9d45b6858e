// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::identity::Identity;
use crate::models::{CanonicalParam, ModelSchema};

use super::defaults::default_models;
use super::error::ConfigError;
use super::interpolation::resolve_variables;
use super::raw;
use super::source::ConfigSource;
use super::types::*;

/// Load and validate a gateway config from the given source.
///
/// Steps:
/// 1. Read raw YAML from source
/// 2. Compute SHA256 config hash
/// 3. Parse YAML into raw deserialization types
/// 4. Validate version and required sections
/// 5. Resolve `${VAR}` interpolation in URLs and identity secrets
/// 6. Merge the model catalog over the embedded defaults
/// 7. Build typed Config struct
pub fn load_config(source: &dyn ConfigSource) -> Result<Config, ConfigError> {
    let raw_yaml = source.load()?;
    let config_hash = compute_hash(&raw_yaml);

    let raw: raw::RawConfig = serde_yaml::from_str(&raw_yaml)?;

    if raw.busgate != "v1" {
        return Err(ConfigError::Validation(format!(
            "unsupported config version \"{}\", expected \"v1\"",
            raw.busgate
        )));
    }

    let upstream = build_upstream_config(raw.upstream)?;
    let pool = build_pool_config(raw.pool)?;
    let retry = build_retry_config(raw.retry)?;

    let request = match raw.request.and_then(|r| r.deadline_secs) {
        Some(0) => {
            return Err(ConfigError::Validation(
                "request deadline_secs must be > 0".into(),
            ))
        }
        Some(secs) => RequestConfig {
            deadline: Duration::from_secs(secs),
        },
        None => RequestConfig::default(),
    };

    let server = ServerConfig {
        port: raw
            .server
            .and_then(|s| s.port)
            .unwrap_or(ServerConfig::default().port),
    };

    let mut identities = HashMap::with_capacity(raw.identities.len());
    for (api_key, raw_identity) in raw.identities {
        let api_key = resolve_variables(&api_key)?;
        identities.insert(api_key, build_identity(raw_identity)?);
    }

    let mut models = if raw.use_default_models != Some(false) {
        default_models()
    } else {
        Vec::new()
    };
    for raw_model in raw.models {
        let model = build_model(raw_model)?;
        models.retain(|m| m.name != model.name);
        models.push(model);
    }
    if models.is_empty() {
        return Err(ConfigError::Validation(
            "model catalog is empty; add `models` or enable use_default_models".into(),
        ));
    }

    Ok(Config {
        version: raw.busgate,
        server,
        upstream,
        pool,
        retry,
        request,
        identities,
        models,
        environment: raw.environment.unwrap_or_default(),
        config_hash,
    })
}

pub fn compute_hash(raw_yaml: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_yaml.as_bytes());
    let hash = hasher.finalize();
    format!("sha256:{:x}", hash)
}

fn build_upstream_config(
    raw: Option<raw::RawUpstreamConfig>,
) -> Result<UpstreamConfig, ConfigError> {
    let raw = raw.ok_or_else(|| {
        ConfigError::Validation("missing `upstream` section (control_plane_url, bus_url)".into())
    })?;

    let control_plane_url = match raw.control_plane_url {
        Some(url) => resolve_variables(&url)?,
        None => {
            return Err(ConfigError::Validation(
                "upstream.control_plane_url is required".into(),
            ))
        }
    };
    if !control_plane_url.starts_with("http://") && !control_plane_url.starts_with("https://") {
        return Err(ConfigError::Validation(format!(
            "upstream.control_plane_url must be http(s), got \"{control_plane_url}\""
        )));
    }

    let bus_url = match raw.bus_url {
        Some(url) => resolve_variables(&url)?,
        None => return Err(ConfigError::Validation("upstream.bus_url is required".into())),
    };
    if !bus_url.starts_with("ws://") && !bus_url.starts_with("wss://") {
        return Err(ConfigError::Validation(format!(
            "upstream.bus_url must be ws(s), got \"{bus_url}\""
        )));
    }

    Ok(UpstreamConfig {
        control_plane_url: control_plane_url.trim_end_matches('/').to_string(),
        bus_url,
    })
}

fn build_pool_config(raw: Option<raw::RawPoolConfig>) -> Result<PoolConfig, ConfigError> {
    let defaults = PoolConfig::default();
    let raw = match raw {
        Some(r) => r,
        None => return Ok(defaults),
    };

    fn positive(name: &str, v: u64) -> Result<u64, ConfigError> {
        if v == 0 {
            return Err(ConfigError::Validation(format!("pool {name} must be > 0")));
        }
        Ok(v)
    }

    let max_connections_per_identity = raw
        .max_connections_per_identity
        .unwrap_or(defaults.max_connections_per_identity);
    if max_connections_per_identity < 1 {
        return Err(ConfigError::Validation(
            "pool max_connections_per_identity must be >= 1".into(),
        ));
    }
    let frame_buffer = raw.frame_buffer.unwrap_or(defaults.frame_buffer);
    if frame_buffer < 1 {
        return Err(ConfigError::Validation("pool frame_buffer must be >= 1".into()));
    }

    Ok(PoolConfig {
        max_connections_per_identity,
        idle_timeout: match raw.idle_timeout_secs {
            Some(v) => Duration::from_secs(positive("idle_timeout_secs", v)?),
            None => defaults.idle_timeout,
        },
        max_requests_per_connection: match raw.max_requests_per_connection {
            Some(v) => positive("max_requests_per_connection", v)?,
            None => defaults.max_requests_per_connection,
        },
        sweep_interval: match raw.sweep_interval_secs {
            Some(v) => Duration::from_secs(positive("sweep_interval_secs", v)?),
            None => defaults.sweep_interval,
        },
        connect_timeout: match raw.connect_timeout_ms {
            Some(v) => Duration::from_millis(positive("connect_timeout_ms", v)?),
            None => defaults.connect_timeout,
        },
        queue_timeout: match raw.queue_timeout_ms {
            Some(v) => Duration::from_millis(positive("queue_timeout_ms", v)?),
            None => defaults.queue_timeout,
        },
        frame_buffer,
    })
}

fn build_retry_config(raw: Option<raw::RawRetryConfig>) -> Result<RetryConfig, ConfigError> {
    let defaults = RetryConfig::default();
    let raw = match raw {
        Some(r) => r,
        None => return Ok(defaults),
    };

    let max_attempts = raw.max_attempts.unwrap_or(defaults.max_attempts);
    if max_attempts < 1 {
        return Err(ConfigError::Validation(
            "retry max_attempts must be >= 1".into(),
        ));
    }
    if raw.attempt_timeout_ms == Some(0) {
        return Err(ConfigError::Validation(
            "retry attempt_timeout_ms must be > 0".into(),
        ));
    }

    Ok(RetryConfig {
        max_attempts,
        base_delay: raw
            .base_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.base_delay),
        attempt_timeout: raw
            .attempt_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.attempt_timeout),
    })
}

fn build_identity(raw: raw::RawIdentity) -> Result<Identity, ConfigError> {
    let identity = Identity {
        account_id: resolve_variables(&raw.account_id)?,
        bus_credential: resolve_variables(&raw.bus_credential)?,
        bus_client_id: resolve_variables(&raw.bus_client_id)?,
        control_plane_token: resolve_variables(&raw.control_plane_token)?,
    };
    if identity.account_id.is_empty() {
        return Err(ConfigError::Validation(
            "identity account_id must not be empty".into(),
        ));
    }
    Ok(identity)
}

pub(super) fn build_model(raw: raw::RawModel) -> Result<ModelSchema, ConfigError> {
    if raw.name.trim().is_empty() {
        return Err(ConfigError::Validation("model name must not be empty".into()));
    }

    let mut parameters = BTreeMap::new();
    for (canonical, upstream_key) in raw.parameters {
        let param = CanonicalParam::parse(&canonical).ok_or_else(|| {
            ConfigError::Validation(format!(
                "model \"{}\": unknown parameter \"{canonical}\", expected one of: temperature, top_p, max_tokens, reasoning_budget",
                raw.name
            ))
        })?;
        parameters.insert(param, upstream_key);
    }

    Ok(ModelSchema {
        upstream_model: raw.upstream_model.unwrap_or_else(|| raw.name.clone()),
        name: raw.name,
        parameters,
    })
}

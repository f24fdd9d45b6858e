// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

use crate::models::ModelSchema;

use super::error::ConfigError;
use super::raw::RawModelCatalog;

/// The default model catalog YAML, embedded at compile time.
const DEFAULT_MODELS_YAML: &str = include_str!("default_models.yaml");

/// Parse the embedded default model catalog.
/// Panics on invalid YAML (this is our own file).
pub fn default_models() -> Vec<ModelSchema> {
    let raw: RawModelCatalog =
        serde_yaml::from_str(DEFAULT_MODELS_YAML).expect("default model catalog YAML is invalid");

    raw.models
        .into_iter()
        .map(|m| {
            super::loader::build_model(m)
                .unwrap_or_else(|e: ConfigError| panic!("default model entry is invalid: {e}"))
        })
        .collect()
}

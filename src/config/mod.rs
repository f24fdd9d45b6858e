// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Config loader and validator.
//
// Loads busgate.yaml, validates structure, resolves variable interpolation,
// merges the model catalog, and computes a deterministic config hash.

mod defaults;
mod error;
mod interpolation;
mod loader;
mod raw;
mod source;
mod types;

pub use defaults::default_models;
pub use error::ConfigError;
pub use interpolation::resolve_variables;
pub use loader::{compute_hash, load_config};
pub use source::{ConfigSource, FileSource, StringSource};
pub use types::*;

// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Model catalog: caller-facing model name -> upstream parameter schema.

use std::collections::{BTreeMap, HashMap};

/// Parameters the gateway knows how to normalise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CanonicalParam {
    Temperature,
    TopP,
    MaxTokens,
    ReasoningBudget,
}

impl CanonicalParam {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "temperature" => Some(Self::Temperature),
            "top_p" => Some(Self::TopP),
            "max_tokens" => Some(Self::MaxTokens),
            "reasoning_budget" => Some(Self::ReasoningBudget),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::TopP => "top_p",
            Self::MaxTokens => "max_tokens",
            Self::ReasoningBudget => "reasoning_budget",
        }
    }
}

/// Upstream parameter schema for one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSchema {
    /// Name callers use in `model`.
    pub name: String,
    /// Identifier the control plane expects.
    pub upstream_model: String,
    /// Supported parameters and the key each is sent under.
    pub parameters: BTreeMap<CanonicalParam, String>,
}

impl ModelSchema {
    /// Upstream key for a parameter, or `None` if the model does not take it.
    pub fn upstream_key(&self, param: CanonicalParam) -> Option<&str> {
        self.parameters.get(&param).map(String::as_str)
    }
}

/// Looks up model schemas by caller-facing name.
pub trait ModelCatalog: Send + Sync {
    fn schema_for(&self, model: &str) -> Option<ModelSchema>;

    /// All models, in catalog order.
    fn list(&self) -> Vec<ModelSchema>;
}

/// Catalog built once from config.
pub struct StaticModelCatalog {
    models: Vec<ModelSchema>,
    index: HashMap<String, usize>,
}

impl StaticModelCatalog {
    pub fn new(models: Vec<ModelSchema>) -> Self {
        let index = models
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name.clone(), i))
            .collect();
        Self { models, index }
    }
}

impl ModelCatalog for StaticModelCatalog {
    fn schema_for(&self, model: &str) -> Option<ModelSchema> {
        self.index.get(model).map(|&i| self.models[i].clone())
    }

    fn list(&self) -> Vec<ModelSchema> {
        self.models.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(name: &str) -> ModelSchema {
        let mut parameters = BTreeMap::new();
        parameters.insert(CanonicalParam::MaxTokens, "maxOutputTokens".to_string());
        ModelSchema {
            name: name.to_string(),
            upstream_model: name.to_uppercase(),
            parameters,
        }
    }

    #[test]
    fn canonical_names_round_trip() {
        for p in [
            CanonicalParam::Temperature,
            CanonicalParam::TopP,
            CanonicalParam::MaxTokens,
            CanonicalParam::ReasoningBudget,
        ] {
            assert_eq!(CanonicalParam::parse(p.as_str()), Some(p));
        }
        assert_eq!(CanonicalParam::parse("presence_penalty"), None);
    }

    #[test]
    fn lookup_by_name() {
        let catalog = StaticModelCatalog::new(vec![schema("a"), schema("b")]);
        assert_eq!(catalog.schema_for("b").unwrap().upstream_model, "B");
        assert!(catalog.schema_for("c").is_none());
    }

    #[test]
    fn list_preserves_order() {
        let catalog = StaticModelCatalog::new(vec![schema("z"), schema("a")]);
        let names: Vec<_> = catalog.list().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["z", "a"]);
    }

    #[test]
    fn upstream_key_absent_for_unsupported_param() {
        let s = schema("a");
        assert_eq!(s.upstream_key(CanonicalParam::MaxTokens), Some("maxOutputTokens"));
        assert_eq!(s.upstream_key(CanonicalParam::Temperature), None);
    }
}

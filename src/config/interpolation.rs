// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

use super::error::ConfigError;

/// Expands `${VAR_NAME}` references from the process environment.
///
/// Identity tokens and upstream URLs go through here so secrets can live in
/// the environment instead of the YAML file. A reference to an unset
/// variable is an error; an unterminated `${` is kept literally.
pub fn resolve_variables(input: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                let value = std::env::var(name).map_err(|_| ConfigError::UndefinedVariable {
                    name: name.to_string(),
                })?;
                out.push_str(&value);
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_strings_pass_through() {
        assert_eq!(resolve_variables("https://bus.example").unwrap(), "https://bus.example");
    }

    #[test]
    fn set_variable_is_substituted() {
        std::env::set_var("BUSGATE_TEST_INTERP_TOKEN", "tok-123");
        let out = resolve_variables("Bearer ${BUSGATE_TEST_INTERP_TOKEN}!").unwrap();
        assert_eq!(out, "Bearer tok-123!");
    }

    #[test]
    fn unset_variable_is_an_error() {
        let err = resolve_variables("${BUSGATE_TEST_DEFINITELY_UNSET}").unwrap_err();
        assert!(matches!(err, ConfigError::UndefinedVariable { ref name } if name == "BUSGATE_TEST_DEFINITELY_UNSET"));
    }

    #[test]
    fn unterminated_reference_is_literal() {
        assert_eq!(resolve_variables("abc ${oops").unwrap(), "abc ${oops");
        assert_eq!(resolve_variables("empty ${}").unwrap(), "empty ${}");
    }
}

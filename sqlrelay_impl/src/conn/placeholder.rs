//! Whitelist-validated substitution of `${…}` tokens in back-end URLs.
//!
//! A token is only accepted when its name starts with one of the allowed
//! prefixes and its remainder sticks to a conservative character set; every
//! violation is rejected before any connection is opened.

use crate::{RelayError, RelayResult};
use std::collections::HashMap;

/// Prefix for placeholders whose values the server operator provides.
pub const SERVER_PREFIX: &str = "relay.server.";

/// Prefix for placeholders whose values the connecting client provides.
pub const CLIENT_PREFIX: &str = "relay.client.";

/// Longest accepted name: prefix (up to 13) plus suffix (up to 200), capped
/// at 211 in total, with `${` and `}` not counted.
pub const MAX_NAME_LENGTH: usize = 211;

const MAX_SUFFIX_LENGTH: usize = 200;

/// Validates a single placeholder name against the whitelist.
pub fn validate_name(name: &str) -> RelayResult<()> {
    let suffix = name
        .strip_prefix(SERVER_PREFIX)
        .or_else(|| name.strip_prefix(CLIENT_PREFIX))
        .ok_or_else(|| {
            RelayError::SecurityDenied(format!(
                "Placeholder \"{name}\" does not start with an allowed prefix"
            ))
        })?;
    if name.len() > MAX_NAME_LENGTH {
        return Err(RelayError::SecurityDenied(format!(
            "Placeholder \"{name}\" exceeds {MAX_NAME_LENGTH} characters"
        )));
    }
    if suffix.is_empty() || suffix.len() > MAX_SUFFIX_LENGTH {
        return Err(RelayError::SecurityDenied(format!(
            "Placeholder \"{name}\" has an invalid length"
        )));
    }
    if !suffix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err(RelayError::SecurityDenied(format!(
            "Placeholder \"{name}\" contains characters outside [A-Za-z0-9._-]"
        )));
    }
    Ok(())
}

/// The environment variable a placeholder name maps to: uppercased, with
/// dots replaced by underscores.
pub fn env_name(name: &str) -> String {
    name.to_uppercase().replace('.', "_")
}

/// Replaces every `${name}` token in `url`.
///
/// Values are taken from `overrides` first (process-level properties), then
/// from the environment. Unknown names fail with a configuration error,
/// whitelist violations with a security error; in both cases no connection
/// has been opened yet.
pub fn resolve(url: &str, overrides: &HashMap<String, String>) -> RelayResult<String> {
    let mut resolved = String::with_capacity(url.len());
    let mut rest = url;
    while let Some(start) = rest.find("${") {
        resolved.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            RelayError::SecurityDenied("Unterminated \"${\" in back-end URL".to_string())
        })?;
        let name = &after[..end];
        validate_name(name)?;
        let value = overrides
            .get(name)
            .cloned()
            .or_else(|| std::env::var(env_name(name)).ok())
            .ok_or_else(|| {
                RelayError::ConfigInvalid(format!("Placeholder \"{name}\" cannot be resolved"))
            })?;
        trace!("Resolved placeholder \"{}\"", name);
        resolved.push_str(&value);
        rest = &after[end + 1..];
    }
    resolved.push_str(rest);
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::{env_name, resolve, validate_name};
    use crate::{ErrorKind, RelayError};
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn valid_names_pass() {
        validate_name("relay.server.dbhost").unwrap();
        validate_name("relay.client.env-1_a.b").unwrap();
    }

    #[test]
    fn foreign_prefixes_are_rejected() {
        for name in ["dbhost", "java.home", "relay.dbhost", "RELAY.SERVER.X"] {
            let e = validate_name(name).unwrap_err();
            assert_eq!(e.kind(), ErrorKind::SecurityDenied, "{name}");
        }
    }

    #[test]
    fn bad_suffixes_are_rejected() {
        assert!(validate_name("relay.server.").is_err());
        assert!(validate_name("relay.server.a b").is_err());
        assert!(validate_name("relay.server.a/b").is_err());
        assert!(validate_name(&format!("relay.server.{}", "x".repeat(201))).is_err());
    }

    #[test]
    fn env_name_mapping() {
        assert_eq!("RELAY_SERVER_DBHOST", env_name("relay.server.dbhost"));
    }

    #[test]
    fn resolution_prefers_overrides() {
        std::env::set_var("RELAY_SERVER_PREFTEST", "from-env");
        let url = "pg://${relay.server.preftest}/app";
        assert_eq!(
            "pg://from-override/app",
            resolve(url, &overrides(&[("relay.server.preftest", "from-override")])).unwrap()
        );
        assert_eq!("pg://from-env/app", resolve(url, &HashMap::new()).unwrap());
        std::env::remove_var("RELAY_SERVER_PREFTEST");
    }

    #[test]
    fn unknown_placeholder_is_config_invalid() {
        let e = resolve("pg://${relay.server.missing-thing}/x", &HashMap::new()).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn invalid_placeholder_is_security_denied() {
        let e = resolve("pg://${HOME}/x", &HashMap::new()).unwrap_err();
        assert!(matches!(e, RelayError::SecurityDenied(_)));
    }
}

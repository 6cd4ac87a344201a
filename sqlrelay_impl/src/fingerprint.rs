//! Deterministic fingerprints for connection configurations and SQL texts.
//!
//! Both hashes key long-lived maps (the datasource registry, the latency
//! store), so they must be stable across processes and restarts.

use sha2::{Digest, Sha256};

/// Hash identifying a datasource configuration.
///
/// Derived from the back-end URL, the user, and the logical datasource name;
/// equal inputs yield equal hashes in every process.
pub fn connection_hash(url: &str, user: &str, datasource: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update([0_u8]);
    hasher.update(user.as_bytes());
    hasher.update([0_u8]);
    hasher.update(datasource.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Hash identifying a SQL text for the purpose of latency tracking.
///
/// The parameter count is mixed in so that textually equal statements with
/// different bind shapes are tracked separately.
pub fn sql_fingerprint(sql: &str, param_count: usize) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    #[allow(clippy::cast_possible_truncation)]
    hasher.update((param_count as u32).to_le_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::{connection_hash, sql_fingerprint};

    #[test]
    fn connection_hash_is_deterministic() {
        let a = connection_hash("relay://h:1/jdbc:pg://db", "scott", "default");
        let b = connection_hash("relay://h:1/jdbc:pg://db", "scott", "default");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn connection_hash_distinguishes_components() {
        let a = connection_hash("relay://h:1/x", "scott", "default");
        assert_ne!(a, connection_hash("relay://h:1/x", "tiger", "default"));
        assert_ne!(a, connection_hash("relay://h:1/x", "scott", "analytics"));
        assert_ne!(a, connection_hash("relay://h:1/y", "scott", "default"));
    }

    #[test]
    fn sql_fingerprint_considers_param_count() {
        let sql = "select * from t where a = ?";
        assert_eq!(sql_fingerprint(sql, 1), sql_fingerprint(sql, 1));
        assert_ne!(sql_fingerprint(sql, 1), sql_fingerprint(sql, 2));
    }
}

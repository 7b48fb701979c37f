//! Store identity and store-list loading.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Port assumed when a store-list line carries no explicit port.
pub const DEFAULT_STORE_PORT: u16 = 3050;

/// One store database reachable through exactly one endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreConfig {
    pub ip: String,
    pub port: u16,
    pub store_name: String,
}

impl StoreConfig {
    pub fn new(ip: impl Into<String>, port: u16, store_name: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port,
            store_name: store_name.into(),
        }
    }

    /// Admission-control partition this store belongs to.
    pub fn endpoint(&self) -> EndpointKey {
        EndpointKey::new(&self.ip, self.port)
    }

    /// `ip:port/store` form used in log lines.
    pub fn connection_string(&self) -> String {
        format!("{}:{}/{}", self.ip, self.port, self.store_name)
    }
}

impl fmt::Display for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.ip, self.port, self.store_name)
    }
}

/// `ip:port` pair hosting one or more stores.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointKey(String);

impl EndpointKey {
    pub fn new(ip: &str, port: u16) -> Self {
        Self(format!("{}:{}", ip, port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreListError {
    #[error("line {line}: expected ip:port:database or ip:database, got {content:?}")]
    Malformed { line: usize, content: String },
    #[error("line {line}: empty {field}")]
    EmptyField { line: usize, field: &'static str },
    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Parse a store list. Blank lines and `#`/`;` comments are skipped.
///
/// The second field is taken as a port only when it parses as one, so
/// database paths containing `:` survive when the port is present.
pub fn parse_store_list(text: &str, default_port: u16) -> Result<Vec<StoreConfig>, StoreListError> {
    let mut stores = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let Some((ip, rest)) = line.split_once(':') else {
            return Err(StoreListError::Malformed {
                line: line_no,
                content: line.to_string(),
            });
        };
        let (port, database) = match rest.split_once(':') {
            Some((maybe_port, db)) => match maybe_port.trim().parse::<u16>() {
                Ok(p) => (p, db),
                Err(_) => (default_port, rest),
            },
            None => (default_port, rest),
        };
        let ip = ip.trim();
        let database = database.trim();
        if ip.is_empty() {
            return Err(StoreListError::EmptyField { line: line_no, field: "ip" });
        }
        if database.is_empty() {
            return Err(StoreListError::EmptyField {
                line: line_no,
                field: "database",
            });
        }
        stores.push(StoreConfig::new(ip, port, database));
    }
    Ok(stores)
}

pub async fn load_store_list(
    path: impl AsRef<Path>,
    default_port: u16,
) -> Result<Vec<StoreConfig>, StoreListError> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| StoreListError::Io {
            path: path.display().to_string(),
            source,
        })?;
    parse_store_list(&text, default_port)
}

/// Group stores by endpoint, keeping first-seen endpoint order.
pub fn partition_by_endpoint(stores: &[StoreConfig]) -> Vec<(EndpointKey, Vec<StoreConfig>)> {
    let mut groups: Vec<(EndpointKey, Vec<StoreConfig>)> = Vec::new();
    for store in stores {
        let key = store.endpoint();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, list)) => list.push(store.clone()),
            None => groups.push((key, vec![store.clone()])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_and_short_forms() {
        let text = "\n# comment\n10.0.0.1:3051:loja01\n10.0.0.1:loja02\n; other\n10.0.0.2:5432:C:\\dados\\loja03.fdb\n";
        let stores = parse_store_list(text, DEFAULT_STORE_PORT).unwrap();
        assert_eq!(stores.len(), 3);
        assert_eq!(stores[0], StoreConfig::new("10.0.0.1", 3051, "loja01"));
        assert_eq!(stores[1], StoreConfig::new("10.0.0.1", 3050, "loja02"));
        assert_eq!(stores[2].port, 5432);
        assert_eq!(stores[2].store_name, "C:\\dados\\loja03.fdb");
    }

    #[test]
    fn short_form_with_colon_in_database_keeps_default_port() {
        let stores = parse_store_list("db1:C:\\x.fdb", 3050).unwrap();
        assert_eq!(stores[0].ip, "db1");
        assert_eq!(stores[0].port, 3050);
        assert_eq!(stores[0].store_name, "C:\\x.fdb");
    }

    #[test]
    fn malformed_lines_report_line_number() {
        let err = parse_store_list("10.0.0.1:1:a\nno-colon-here\n", 3050).unwrap_err();
        match err {
            StoreListError::Malformed { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            parse_store_list("10.0.0.1:3050:", 3050),
            Err(StoreListError::EmptyField { field: "database", .. })
        ));
    }

    #[test]
    fn partition_keeps_first_seen_order() {
        let stores = vec![
            StoreConfig::new("b", 1, "s1"),
            StoreConfig::new("a", 1, "s2"),
            StoreConfig::new("b", 1, "s3"),
        ];
        let parts = partition_by_endpoint(&stores);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0.as_str(), "b:1");
        assert_eq!(parts[0].1.len(), 2);
        assert_eq!(parts[1].0.as_str(), "a:1");
    }
}

use super::{ConnectOptions, DriverKind};

pub fn parse_driver(s: &str) -> Option<DriverKind> {
    match s.to_lowercase().as_str() {
        "postgres" | "postgresql" | "pg" => Some(DriverKind::Postgres),
        #[cfg(any(test, feature = "driver-mock"))]
        "mock" => Some(DriverKind::Mock),
        _ => None,
    }
}

pub fn parse_connect_kv(pairs: &[String]) -> ConnectOptions {
    let mut opts = ConnectOptions::default();
    for p in pairs {
        if let Some((k, v)) = p.split_once('=') {
            opts.params.insert(k.trim().to_string(), v.to_string());
        }
    }
    opts
}

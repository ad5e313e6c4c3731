//! Canonical immutable address+parameter object (spec §3).
//!
//! A [`Url`] is the cache key used everywhere a node, a channel, or a
//! subscription needs identity: two `Url`s are equal iff every field
//! matches, including the parameter map, so it doubles as the on-wire
//! service identifier.

use std::collections::BTreeMap;
use std::fmt;

/// Canonical address + parameter bag.
///
/// Parameters are stored in a `BTreeMap` rather than a `HashMap` so that
/// `Display`/equality/hashing are deterministic regardless of insertion
/// order — important since `Url` is used as a map key in `ChannelManager`
/// and `Cluster`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Url {
    scheme: String,
    host: String,
    port: u16,
    interface: String,
    params: BTreeMap<String, String>,
}

impl Url {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16, interface: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
            interface: interface.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn param_or(&self, key: &str, default: &str) -> String {
        self.params.get(key).cloned().unwrap_or_else(|| default.to_string())
    }

    pub fn param_i64(&self, key: &str, default: i64) -> i64 {
        self.params.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn param_bool(&self, key: &str, default: bool) -> bool {
        self.params.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn param_f64(&self, key: &str, default: f64) -> f64 {
        self.params.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn alias(&self) -> String {
        self.param_or("alias", "default")
    }

    pub fn weight(&self) -> u32 {
        self.params
            .get("weight")
            .and_then(|v| v.parse().ok())
            .unwrap_or(100)
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Key identifying a shared transport endpoint: scheme + address, the
    /// granularity `ChannelManager` pools on (spec §4.2).
    pub fn endpoint_key(&self) -> String {
        format!("{}://{}", self.scheme, self.address())
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.address(), self.interface)?;
        if !self.params.is_empty() {
            write!(f, "?")?;
            for (i, (k, v)) in self.params.iter().enumerate() {
                if i > 0 {
                    write!(f, "&")?;
                }
                write!(f, "{}={}", k, v)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_requires_all_fields_including_params() {
        let a = Url::new("jsf", "10.0.0.1", 8080, "Echo").with_param("weight", "50");
        let b = Url::new("jsf", "10.0.0.1", 8080, "Echo").with_param("weight", "50");
        let c = Url::new("jsf", "10.0.0.1", 8080, "Echo").with_param("weight", "60");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn typed_getters_fall_back_to_default() {
        let url = Url::new("jsf", "h", 1, "I");
        assert_eq!(url.param_i64("timeout", 3000), 3000);
        assert!(!url.param_bool("ssl.enable", false));
        assert_eq!(url.weight(), 100);
    }

    #[test]
    fn endpoint_key_ignores_interface_and_params() {
        let a = Url::new("jsf", "h", 1, "I1").with_param("x", "1");
        let b = Url::new("jsf", "h", 1, "I2").with_param("x", "2");
        assert_eq!(a.endpoint_key(), b.endpoint_key());
    }

    #[test]
    fn display_is_deterministic_regardless_of_insertion_order() {
        let a = Url::new("jsf", "h", 1, "I").with_param("b", "2").with_param("a", "1");
        let b = Url::new("jsf", "h", 1, "I").with_param("a", "1").with_param("b", "2");
        assert_eq!(a.to_string(), b.to_string());
    }
}

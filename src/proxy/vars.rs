//! Header value variables
//!
//! HTTP header rules may reference connection details with `$name` variables,
//! e.g. `"X-Real-IP": "$remote_ip"`.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use log::warn;

use crate::common::split_host_port;
use crate::config::HeaderRules;

/// Values substituted into header rules
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    pub remote_addr: String,
    pub remote_ip: String,
    pub remote_port: String,
    pub server_addr: String,
    pub server_ip: String,
    pub server_port: String,
    pub target_addr: String,
    pub target_ip: String,
    pub target_port: String,
    pub protocol: String,
    pub instance: String,
}

impl Variables {
    /// Collect the variables of one connection
    ///
    /// # Parameters
    ///
    /// * `remote` - Client address
    /// * `server` - Local address the client connected to
    /// * `target` - Forwarding target
    /// * `protocol` - Protocol name (`tlcp`, `tls`, `auto`)
    /// * `instance` - Instance name
    pub fn new(remote: &str, server: &str, target: &str, protocol: &str, instance: &str) -> Self {
        let (remote_ip, remote_port) = split_host_port(remote);
        let (server_ip, server_port) = split_host_port(server);
        let (target_ip, target_port) = split_host_port(target);
        Self {
            remote_addr: remote.to_string(),
            remote_ip,
            remote_port,
            server_addr: server.to_string(),
            server_ip,
            server_port,
            target_addr: target.to_string(),
            target_ip,
            target_port,
            protocol: protocol.to_string(),
            instance: instance.to_string(),
        }
    }

    /// Substitute every known variable in `value`
    ///
    /// Longer names are replaced first so `$remote_addr` is never read as
    /// `$remote` followed by text.
    pub fn replace(&self, value: &str) -> String {
        if !value.contains('$') {
            return value.to_string();
        }
        [
            ("$remote_addr", &self.remote_addr),
            ("$remote_port", &self.remote_port),
            ("$remote_ip", &self.remote_ip),
            ("$server_addr", &self.server_addr),
            ("$server_port", &self.server_port),
            ("$server_ip", &self.server_ip),
            ("$target_addr", &self.target_addr),
            ("$target_port", &self.target_port),
            ("$target_ip", &self.target_ip),
            ("$protocol", &self.protocol),
            ("$instance", &self.instance),
        ]
        .iter()
        .fold(value.to_string(), |acc, (name, replacement)| acc.replace(name, replacement))
    }

    /// Apply `rules` to `headers`: add, then remove, then set
    ///
    /// Rules with an invalid header name or value are skipped with a warning.
    pub fn apply(&self, rules: &HeaderRules, headers: &mut HeaderMap) {
        for (name, value) in &rules.add {
            if let Some((name, value)) = self.header(name, value) {
                headers.append(name, value);
            }
        }
        for name in &rules.remove {
            headers.remove(name.as_str());
        }
        for (name, value) in &rules.set {
            if let Some((name, value)) = self.header(name, value) {
                headers.insert(name, value);
            }
        }
    }

    fn header(&self, name: &str, value: &str) -> Option<(HeaderName, HeaderValue)> {
        let parsed_name = HeaderName::from_bytes(name.as_bytes());
        let parsed_value = HeaderValue::from_str(&self.replace(value));
        match (parsed_name, parsed_value) {
            (Ok(name), Ok(value)) => Some((name, value)),
            _ => {
                warn!("Skipping invalid header rule {}: {}", name, value);
                None
            }
        }
    }
}

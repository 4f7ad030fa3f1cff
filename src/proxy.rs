//! Proxy header rewrites.
//!
//! An upstream balancer conveys the original client identity in forwarding
//! headers. When enabled, the configured address header rewrites the scope's
//! `client`, the port header rewrites its port, and the proto header
//! rewrites `scheme`.
use bytes::Bytes;

/// Which entry of a comma separated forwarding header identifies the client.
///
/// `X-Forwarded-For` accumulates one entry per hop, client first. The
/// default [`Leftmost`](ProxyPolicy::Leftmost) picks the furthest downstream
/// entry; deployments that only trust their own balancer's appended entry
/// use [`Rightmost`](ProxyPolicy::Rightmost).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProxyPolicy {
    #[default]
    Leftmost,
    Rightmost,
}

/// Forwarding header configuration.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Header carrying the client address, lowercase.
    pub address_header: String,
    /// Header carrying the client port, lowercase. Only consulted when the
    /// address header matched.
    pub port_header: Option<String>,
    /// Header carrying the original scheme, lowercase.
    pub proto_header: Option<String>,
    /// Entry selection for comma separated values.
    pub policy: ProxyPolicy,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            address_header: "x-forwarded-for".to_owned(),
            port_header: Some("x-forwarded-port".to_owned()),
            proto_header: Some("x-forwarded-proto".to_owned()),
            policy: ProxyPolicy::Leftmost,
        }
    }
}

impl ProxyConfig {
    /// Builds a config with custom header names as given on the CLI.
    pub fn with_headers(address: &str, port: Option<&str>, proto: Option<&str>) -> Self {
        Self {
            address_header: address.to_ascii_lowercase(),
            port_header: port.map(str::to_ascii_lowercase),
            proto_header: proto.map(str::to_ascii_lowercase),
            policy: ProxyPolicy::Leftmost,
        }
    }

    /// Rewrites `client` and `scheme` from the forwarding headers, if
    /// present. Headers are the scope form: lowercase names, raw values.
    pub fn rewrite(
        &self,
        headers: &[(Bytes, Bytes)],
        client: &mut Option<(String, u16)>,
        scheme: &mut String,
    ) {
        let Some(value) = find(headers, &self.address_header) else {
            return;
        };
        let Some(address) = self.pick(value) else {
            return;
        };

        let mut port = 0;
        if let Some(port_header) = &self.port_header {
            // the port header is a single value, read verbatim with no
            // entry selection
            if let Some(value) = find(headers, port_header) {
                if let Some(parsed) = std::str::from_utf8(value)
                    .ok()
                    .and_then(|value| value.trim().parse().ok())
                {
                    port = parsed;
                }
            }
        }
        *client = Some((address, port));

        if let Some(proto_header) = &self.proto_header {
            if let Some(value) = find(headers, proto_header) {
                if let Some(picked) = self.pick(value) {
                    *scheme = picked;
                }
            }
        }
    }

    /// Picks one entry of a comma separated value per the policy and trims
    /// it. Bracketed IPv6 literals lose their brackets.
    fn pick(&self, value: &[u8]) -> Option<String> {
        let value = std::str::from_utf8(value).ok()?;
        let entry = match self.policy {
            ProxyPolicy::Leftmost => value.split(',').next(),
            ProxyPolicy::Rightmost => value.split(',').next_back(),
        }?;
        let entry = entry.trim();
        if entry.is_empty() {
            return None;
        }
        let entry = entry.strip_prefix('[').and_then(|e| e.strip_suffix(']')).unwrap_or(entry);
        Some(entry.to_owned())
    }
}

fn find<'a>(headers: &'a [(Bytes, Bytes)], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|(n, _)| n.as_ref() == name.as_bytes())
        .map(|(_, v)| v.as_ref())
}

// ===== Test =====

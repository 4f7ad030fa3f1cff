//! Endpoint descriptors.
//!
//! A descriptor declares what to listen on and how. Descriptors come from
//! dedicated CLI flags (`--port`, `--unix-socket`, `--fd`) or from
//! Twisted-style descriptor strings passed to `--endpoint`, e.g.
//! `tcp:port=8000:interface=127.0.0.1` or
//! `ssl:port=443:privateKey=key.pem:certKey=cert.pem`.
use std::fmt;
use std::path::PathBuf;

/// A single listening endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP socket on `host:port`.
    Tcp { host: String, port: u16 },
    /// UNIX domain socket at `path`.
    Unix { path: PathBuf },
    /// Listening socket inherited as a file descriptor.
    Fd { fd: i32 },
    /// Any of the above, wrapped in TLS.
    Tls {
        inner: Box<Endpoint>,
        tls: TlsSettings,
    },
}

/// Certificate material for a TLS endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsSettings {
    /// PEM certificate chain.
    pub certificate: PathBuf,
    /// PEM private key.
    pub private_key: PathBuf,
}

impl Endpoint {
    /// Creates a plain TCP endpoint.
    #[inline]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp { host: host.into(), port }
    }

    /// Creates a UNIX socket endpoint.
    #[inline]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Creates an inherited file descriptor endpoint.
    #[inline]
    pub fn fd(fd: i32) -> Self {
        Self::Fd { fd }
    }

    /// Wraps this endpoint in TLS.
    pub fn with_tls(self, tls: TlsSettings) -> Self {
        Self::Tls { inner: Box::new(self), tls }
    }

    /// Whether this endpoint terminates TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }

    /// Parses a Twisted-style descriptor string.
    ///
    /// Colons inside values are escaped as `\:`, which is how bracketless
    /// IPv6 interfaces are written.
    pub fn parse(descriptor: &str) -> Result<Endpoint, EndpointError> {
        let mut parts = split_unescape(descriptor);
        let kind = parts.next().ok_or(EndpointError::Empty)?;

        match kind.as_str() {
            "tcp" => {
                let (port, host) = tcp_args(parts)?;
                Ok(Endpoint::Tcp {
                    host: host.unwrap_or_else(|| "0.0.0.0".to_owned()),
                    port: port.ok_or(EndpointError::MissingPort)?,
                })
            }
            "ssl" | "tls" => {
                let mut port = None;
                let mut host = None;
                let mut key = None;
                let mut cert = None;
                for part in parts {
                    match keyvalue(&part) {
                        ("port", Some(v)) => port = Some(parse_port(v)?),
                        ("interface", Some(v)) => host = Some(v.to_owned()),
                        ("privateKey", Some(v)) => key = Some(PathBuf::from(v)),
                        ("certKey", Some(v)) => cert = Some(PathBuf::from(v)),
                        (v, None) if port.is_none() => port = Some(parse_port(v)?),
                        _ => return Err(EndpointError::UnknownArgument),
                    }
                }
                let inner = Endpoint::Tcp {
                    host: host.unwrap_or_else(|| "0.0.0.0".to_owned()),
                    port: port.ok_or(EndpointError::MissingPort)?,
                };
                Ok(inner.with_tls(TlsSettings {
                    certificate: cert.ok_or(EndpointError::MissingCertificate)?,
                    private_key: key.ok_or(EndpointError::MissingCertificate)?,
                }))
            }
            "unix" => {
                let mut path = None;
                for part in parts {
                    match keyvalue(&part) {
                        ("address", Some(v)) | ("path", Some(v)) => path = Some(v.to_owned()),
                        (v, None) if path.is_none() => path = Some(v.to_owned()),
                        _ => return Err(EndpointError::UnknownArgument),
                    }
                }
                Ok(Endpoint::Unix {
                    path: PathBuf::from(path.ok_or(EndpointError::MissingPath)?),
                })
            }
            "fd" => {
                let mut fd = None;
                for part in parts {
                    match keyvalue(&part) {
                        ("fileno", Some(v)) => {
                            fd = Some(v.parse().map_err(|_| EndpointError::InvalidFd)?)
                        }
                        (v, None) if fd.is_none() => {
                            fd = Some(v.parse().map_err(|_| EndpointError::InvalidFd)?)
                        }
                        _ => return Err(EndpointError::UnknownArgument),
                    }
                }
                Ok(Endpoint::Fd { fd: fd.ok_or(EndpointError::InvalidFd)? })
            }
            _ => Err(EndpointError::UnknownKind),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => {
                write!(f, "tcp:port={port}:interface={}", escape(host))
            }
            Endpoint::Unix { path } => write!(f, "unix:{}", path.display()),
            Endpoint::Fd { fd } => write!(f, "fd:fileno={fd}"),
            Endpoint::Tls { inner, tls } => match &**inner {
                Endpoint::Tcp { host, port } => write!(
                    f,
                    "ssl:port={port}:interface={}:privateKey={}:certKey={}",
                    escape(host),
                    tls.private_key.display(),
                    tls.certificate.display(),
                ),
                other => write!(f, "ssl:{other}"),
            },
        }
    }
}

fn tcp_args(parts: impl Iterator<Item = String>) -> Result<(Option<u16>, Option<String>), EndpointError> {
    let mut port = None;
    let mut host = None;
    for part in parts {
        match keyvalue(&part) {
            ("port", Some(v)) => port = Some(parse_port(v)?),
            ("interface", Some(v)) => host = Some(v.to_owned()),
            (v, None) if port.is_none() => port = Some(parse_port(v)?),
            _ => return Err(EndpointError::UnknownArgument),
        }
    }
    Ok((port, host))
}

fn parse_port(value: &str) -> Result<u16, EndpointError> {
    value.parse().map_err(|_| EndpointError::InvalidPort)
}

fn keyvalue(part: &str) -> (&str, Option<&str>) {
    match part.split_once('=') {
        Some((key, value)) => (key, Some(value)),
        None => (part, None),
    }
}

/// Splits on `:`, honoring `\:` escapes inside values.
fn split_unescape(descriptor: &str) -> impl Iterator<Item = String> + '_ {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for ch in descriptor.chars() {
        match ch {
            '\\' if !escaped => escaped = true,
            ':' if !escaped => parts.push(std::mem::take(&mut current)),
            _ => {
                if escaped && ch != ':' {
                    current.push('\\');
                }
                escaped = false;
                current.push(ch);
            }
        }
    }
    parts.push(current);
    parts.into_iter()
}

fn escape(host: &str) -> String {
    host.replace(':', "\\:")
}

// ===== Error =====

/// An error from parsing an endpoint descriptor string.
#[derive(Debug, PartialEq, Eq)]
pub enum EndpointError {
    /// Empty descriptor string.
    Empty,
    /// Descriptor kind is not `tcp`, `ssl`, `unix` or `fd`.
    UnknownKind,
    /// Descriptor argument not understood for its kind.
    UnknownArgument,
    /// TCP descriptor without a port.
    MissingPort,
    /// Port value not an integer in range.
    InvalidPort,
    /// UNIX descriptor without a path.
    MissingPath,
    /// File descriptor value not an integer.
    InvalidFd,
    /// TLS descriptor without certificate or key.
    MissingCertificate,
}

impl EndpointError {
    fn message(&self) -> &'static str {
        match self {
            EndpointError::Empty => "empty endpoint descriptor",
            EndpointError::UnknownKind => "unknown endpoint kind",
            EndpointError::UnknownArgument => "unknown endpoint argument",
            EndpointError::MissingPort => "tcp endpoint requires a port",
            EndpointError::InvalidPort => "invalid port number",
            EndpointError::MissingPath => "unix endpoint requires a path",
            EndpointError::InvalidFd => "invalid file descriptor",
            EndpointError::MissingCertificate => "ssl endpoint requires privateKey and certKey",
        }
    }
}

impl std::error::Error for EndpointError {}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

// ===== Test =====

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tcp_descriptor() {
        assert_eq!(
            Endpoint::parse("tcp:port=8000:interface=127.0.0.1").unwrap(),
            Endpoint::tcp("127.0.0.1", 8000),
        );
        assert_eq!(
            Endpoint::parse("tcp:8000").unwrap(),
            Endpoint::tcp("0.0.0.0", 8000),
        );
    }

    #[test]
    fn test_ipv6_interface_escape() {
        let parsed = Endpoint::parse("tcp:port=8000:interface=2001\\:db8\\:\\:1").unwrap();
        assert_eq!(parsed, Endpoint::tcp("2001:db8::1", 8000));
    }

    #[test]
    fn test_unix_and_fd() {
        assert_eq!(
            Endpoint::parse("unix:/tmp/daphne.sock").unwrap(),
            Endpoint::unix("/tmp/daphne.sock"),
        );
        assert_eq!(Endpoint::parse("fd:fileno=5").unwrap(), Endpoint::fd(5));
    }

    #[test]
    fn test_ssl_descriptor() {
        let parsed =
            Endpoint::parse("ssl:port=443:privateKey=key.pem:certKey=cert.pem").unwrap();
        assert_eq!(
            parsed,
            Endpoint::tcp("0.0.0.0", 443).with_tls(TlsSettings {
                certificate: "cert.pem".into(),
                private_key: "key.pem".into(),
            }),
        );
        assert!(parsed.is_tls());
    }

    #[test]
    fn test_roundtrip_display() {
        for descriptor in [
            "tcp:port=8000:interface=127.0.0.1",
            "unix:/tmp/daphne.sock",
            "fd:fileno=3",
            "ssl:port=443:interface=0.0.0.0:privateKey=key.pem:certKey=cert.pem",
        ] {
            let parsed = Endpoint::parse(descriptor).unwrap();
            assert_eq!(Endpoint::parse(&parsed.to_string()).unwrap(), parsed);
        }
    }

    #[test]
    fn test_rejects() {
        assert_eq!(Endpoint::parse("tcp"), Err(EndpointError::MissingPort));
        assert_eq!(Endpoint::parse("tcp:notaport"), Err(EndpointError::InvalidPort));
        assert_eq!(Endpoint::parse("carrier:pigeon"), Err(EndpointError::UnknownKind));
        assert_eq!(Endpoint::parse("ssl:port=443"), Err(EndpointError::MissingCertificate));
    }
}

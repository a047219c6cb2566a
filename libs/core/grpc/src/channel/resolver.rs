//! Target parsing and DNS resolution
//!
//! A target is parsed once into a [`ResolvedTarget`] when the connection is
//! built. The addresses behind it are looked up through a [`Resolver`]; the
//! connector calls it again periodically so topology changes are picked up
//! without the caller doing anything.

use std::io;
use std::net::{Ipv6Addr, SocketAddr};

use async_trait::async_trait;

use crate::error::{GrpcError, GrpcResult};

/// Port used when the target omits one
pub const DEFAULT_PORT: u16 = 443;

/// Name resolution scheme. DNS is the only one supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionScheme {
  Dns,
}

/// How calls are spread over resolved addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancingPolicy {
  RoundRobin,
}

impl LoadBalancingPolicy {
  pub fn name(&self) -> &'static str {
    match self {
      Self::RoundRobin => "round_robin",
    }
  }
}

/// Transport scheme spelled out in a tonic-style `http://` / `https://` target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriScheme {
  Http,
  Https,
}

/// A parsed target: symbolic host and port plus the fixed resolution and
/// balancing policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
  /// The target exactly as the caller passed it
  pub target: String,
  pub host: String,
  pub port: u16,
  pub scheme: ResolutionScheme,
  pub policy: LoadBalancingPolicy,
  /// Set when the target carried an explicit `http://` or `https://` prefix
  pub uri_scheme: Option<UriScheme>,
}

impl ResolvedTarget {
  /// Parse a target string
  ///
  /// Accepted forms: `host:port`, `[v6]:port`, `host` (port 443),
  /// `dns:///host:port`, `dns://authority/host:port`, `dns:host:port`,
  /// `http://host:port` and `https://host:port`.
  pub fn parse(target: &str) -> GrpcResult<Self> {
    let invalid = |reason: &str| GrpcError::InvalidTarget {
      target: target.to_string(),
      reason: reason.to_string(),
    };

    let trimmed = target.trim();
    if trimmed.is_empty() {
      return Err(invalid("target is empty"));
    }

    let (rest, uri_scheme) = strip_scheme(trimmed)?;
    let rest = match uri_scheme {
      Some(_) => rest.strip_suffix('/').unwrap_or(rest),
      None => rest,
    };

    if rest.contains('/') {
      return Err(invalid("unexpected path after host"));
    }

    let (host, port) = split_host_port(rest).map_err(|reason| invalid(reason))?;
    if host.is_empty() {
      return Err(invalid("missing host"));
    }

    Ok(Self {
      target: target.to_string(),
      host,
      port,
      scheme: ResolutionScheme::Dns,
      policy: LoadBalancingPolicy::RoundRobin,
      uri_scheme,
    })
  }

  /// `host:port` with IPv6 literals bracketed
  pub fn authority(&self) -> String {
    if self.host.contains(':') {
      format!("[{}]:{}", self.host, self.port)
    } else {
      format!("{}:{}", self.host, self.port)
    }
  }
}

fn strip_scheme(target: &str) -> GrpcResult<(&str, Option<UriScheme>)> {
  if let Some(rest) = target.strip_prefix("dns:///") {
    return Ok((rest, None));
  }
  if let Some(rest) = target.strip_prefix("dns://") {
    // The authority names a DNS server; the system resolver is used regardless
    return match rest.split_once('/') {
      Some((_, name)) => Ok((name, None)),
      None => Err(GrpcError::InvalidTarget {
        target: target.to_string(),
        reason: "dns target is missing the endpoint name".to_string(),
      }),
    };
  }
  if let Some(rest) = target.strip_prefix("dns:") {
    return Ok((rest, None));
  }
  if let Some(rest) = target.strip_prefix("http://") {
    return Ok((rest, Some(UriScheme::Http)));
  }
  if let Some(rest) = target.strip_prefix("https://") {
    return Ok((rest, Some(UriScheme::Https)));
  }
  if let Some((scheme, _)) = target.split_once("://") {
    return Err(GrpcError::UnsupportedScheme(scheme.to_string()));
  }
  for scheme in ["unix", "unix-abstract", "vsock", "xds", "passthrough"] {
    if target
      .strip_prefix(scheme)
      .is_some_and(|rest| rest.starts_with(':'))
    {
      return Err(GrpcError::UnsupportedScheme(scheme.to_string()));
    }
  }
  Ok((target, None))
}

fn split_host_port(rest: &str) -> Result<(String, u16), &'static str> {
  if let Some(bracketed) = rest.strip_prefix('[') {
    let (host, after) = bracketed
      .split_once(']')
      .ok_or("unterminated IPv6 literal")?;
    let port = match after {
      "" => DEFAULT_PORT,
      _ => parse_port(after.strip_prefix(':').ok_or("expected ':' after IPv6 literal")?)?,
    };
    return Ok((host.to_string(), port));
  }

  // Bare IPv6 literal without a port
  if rest.parse::<Ipv6Addr>().is_ok() {
    return Ok((rest.to_string(), DEFAULT_PORT));
  }

  match rest.rsplit_once(':') {
    Some((host, port)) => {
      if host.contains(':') {
        return Err("IPv6 literals with a port must be bracketed");
      }
      Ok((host.to_string(), parse_port(port)?))
    }
    None => Ok((rest.to_string(), DEFAULT_PORT)),
  }
}

fn parse_port(port: &str) -> Result<u16, &'static str> {
  match port.parse::<u16>() {
    Ok(0) | Err(_) => Err("port must be a number between 1 and 65535"),
    Ok(port) => Ok(port),
  }
}

/// Maps a parsed target to the socket addresses currently behind it
///
/// # Example
/// ```ignore
/// struct Fixed(Vec<SocketAddr>);
///
/// #[async_trait]
/// impl Resolver for Fixed {
///     async fn resolve(&self, _target: &ResolvedTarget) -> io::Result<Vec<SocketAddr>> {
///         Ok(self.0.clone())
///     }
/// }
/// ```
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
  async fn resolve(&self, target: &ResolvedTarget) -> io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the system's DNS configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

#[async_trait]
impl Resolver for DnsResolver {
  async fn resolve(&self, target: &ResolvedTarget) -> io::Result<Vec<SocketAddr>> {
    let mut addrs: Vec<SocketAddr> =
      tokio::net::lookup_host((target.host.as_str(), target.port))
        .await?
        .collect();
    addrs.sort();
    addrs.dedup();

    tracing::trace!(
      target: "grpc_client",
      host = %target.host,
      count = addrs.len(),
      "Resolved target"
    );

    Ok(addrs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(target: &str) -> ResolvedTarget {
    ResolvedTarget::parse(target).unwrap()
  }

  #[test]
  fn test_host_and_port() {
    let target = parse("localhost:50051");
    assert_eq!(target.host, "localhost");
    assert_eq!(target.port, 50051);
    assert_eq!(target.scheme, ResolutionScheme::Dns);
    assert_eq!(target.policy, LoadBalancingPolicy::RoundRobin);
    assert_eq!(target.uri_scheme, None);
  }

  #[test]
  fn test_default_port() {
    assert_eq!(parse("calculator.internal").port, DEFAULT_PORT);
  }

  #[test]
  fn test_dns_forms() {
    assert_eq!(parse("dns:///calc:7000").authority(), "calc:7000");
    assert_eq!(parse("dns://8.8.8.8/calc:7000").authority(), "calc:7000");
    assert_eq!(parse("dns:calc:7000").authority(), "calc:7000");
  }

  #[test]
  fn test_ipv6() {
    let target = parse("[::1]:50051");
    assert_eq!(target.host, "::1");
    assert_eq!(target.port, 50051);
    assert_eq!(target.authority(), "[::1]:50051");

    let bare = parse("::1");
    assert_eq!(bare.host, "::1");
    assert_eq!(bare.port, DEFAULT_PORT);
  }

  #[test]
  fn test_uri_style_targets() {
    let target = parse("http://localhost:50051/");
    assert_eq!(target.uri_scheme, Some(UriScheme::Http));
    assert_eq!(target.authority(), "localhost:50051");

    assert_eq!(parse("https://calc:443").uri_scheme, Some(UriScheme::Https));
  }

  #[test]
  fn test_malformed_targets() {
    for target in ["", "   ", ":50051", "calc:notaport", "calc:0", "calc:70000", "calc:1/path", "[::1"] {
      assert!(
        matches!(ResolvedTarget::parse(target), Err(GrpcError::InvalidTarget { .. })),
        "{target:?} should be rejected"
      );
    }
  }

  #[test]
  fn test_unsupported_schemes() {
    for target in ["unix:///tmp/calc.sock", "unix:/tmp/calc.sock", "xds:///calc", "ftp://calc"] {
      assert!(
        matches!(ResolvedTarget::parse(target), Err(GrpcError::UnsupportedScheme(_))),
        "{target:?} should be rejected"
      );
    }
  }

  #[tokio::test]
  async fn test_dns_resolver_localhost() {
    let target = parse("127.0.0.1:50051");
    let addrs = DnsResolver.resolve(&target).await.unwrap();
    assert_eq!(addrs, vec!["127.0.0.1:50051".parse().unwrap()]);
  }
}

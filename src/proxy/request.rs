use anyhow::{Context, Result, anyhow, bail};
use http::{Method, Uri};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// A request after parsing the start line, normalized for keying and
/// forwarding. `port` is `Some` only when the client spelled it out, so the
/// cache key distinguishes `host` from `host:8080` exactly as received.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: Method,
    pub scheme: Scheme,
    pub host: String,
    pub port: Option<u16>,
    /// Path plus query, exactly as sent.
    pub path: String,
}

/// Parse an HTTP/1.1 request target. Absolute-form targets (the classic
/// proxy style) carry their own scheme and authority; origin-form targets
/// fall back to the Host header and the connection's scheme.
pub fn parse_request_target(
    method: Method,
    target: &str,
    host_header: Option<&str>,
    fallback_scheme: Scheme,
) -> Result<ParsedRequest> {
    let uri: Uri = target
        .parse()
        .with_context(|| format!("invalid request target '{target}'"))?;

    if let Some(scheme) = uri.scheme_str() {
        let scheme = parse_scheme(scheme)?;
        let authority = uri
            .authority()
            .ok_or_else(|| anyhow!("request target missing authority"))?;
        let (host, port) = parse_host_header(authority.as_str())?;
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        return Ok(ParsedRequest {
            method,
            scheme,
            host,
            port,
            path,
        });
    }

    if !target.starts_with('/') {
        bail!("request target must be absolute-form or origin-form");
    }

    let host_header =
        host_header.ok_or_else(|| anyhow!("origin-form request missing Host header"))?;
    let (host, port) = parse_host_header(host_header)?;
    Ok(ParsedRequest {
        method,
        scheme: fallback_scheme,
        host,
        port,
        path: target.to_string(),
    })
}

pub fn parse_scheme(value: &str) -> Result<Scheme> {
    match value {
        "http" | "HTTP" => Ok(Scheme::Http),
        "https" | "HTTPS" => Ok(Scheme::Https),
        other => bail!("unsupported scheme '{other}'"),
    }
}

/// Parse a Host header or CONNECT authority into host and optional port.
pub fn parse_host_header(value: &str) -> Result<(String, Option<u16>)> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("empty authority");
    }
    if trimmed.chars().any(|c| c.is_whitespace()) {
        bail!("authority must not contain whitespace");
    }
    if trimmed.contains('@') {
        bail!("authority must not contain userinfo");
    }
    if trimmed.contains('/')
        || trimmed.contains('?')
        || trimmed.contains('#')
        || trimmed.contains('\\')
    {
        bail!("authority must not contain path or query");
    }
    let uri: Uri = format!("http://{trimmed}")
        .parse()
        .with_context(|| format!("invalid authority '{trimmed}'"))?;
    let host = uri
        .host()
        .ok_or_else(|| anyhow!("authority missing hostname"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    Ok((host, uri.port_u16()))
}

impl ParsedRequest {
    /// Authority exactly as the client expressed it (no default-port
    /// normalization), used for the Host header and cache keys.
    pub fn authority(&self) -> String {
        let mut authority = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if let Some(port) = self.port {
            authority.push(':');
            authority.push_str(&port.to_string());
        }
        authority
    }

    /// Host and concrete port to dial for forwarding.
    pub fn upstream_addr(&self) -> (String, u16) {
        (
            self.host.clone(),
            self.port.unwrap_or(self.scheme.default_port()),
        )
    }

    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme.as_str(), self.authority(), self.path)
    }
}

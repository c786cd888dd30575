use std::collections::HashSet;

use anyhow::{Result, anyhow, bail};
use http::header::HeaderName;

/// One header exactly as it appeared on the wire, with a cached lowercase
/// name for matching.
#[derive(Debug, Clone)]
pub struct HeaderLine {
    pub name: String,
    pub value: String,
    lower_name: String,
}

impl HeaderLine {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let lower_name = name.to_ascii_lowercase();
        Self {
            name,
            value: value.into(),
            lower_name,
        }
    }

    pub fn lower_name(&self) -> &str {
        &self.lower_name
    }
}

/// Collects request header lines, preserving order and duplicates, while
/// tracking the handful of fields the proxy itself interprets.
#[derive(Debug)]
pub struct HeaderAccumulator {
    lines: Vec<HeaderLine>,
    connection_tokens: HashSet<String>,
    host: Option<String>,
    content_length: Option<u64>,
    chunked: bool,
    expect_continue: bool,
    total_bytes: usize,
    max_bytes: usize,
}

impl HeaderAccumulator {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            lines: Vec::new(),
            connection_tokens: HashSet::new(),
            host: None,
            content_length: None,
            chunked: false,
            expect_continue: false,
            total_bytes: 0,
            max_bytes,
        }
    }

    /// Feed one raw header line (including its terminator). Returns false
    /// when the blank end-of-headers line was consumed.
    pub fn push_line(&mut self, line: &str) -> Result<bool> {
        self.total_bytes = self
            .total_bytes
            .checked_add(line.len())
            .ok_or_else(|| anyhow!("header size overflow"))?;
        if self.total_bytes > self.max_bytes {
            bail!("request headers exceed configured limit of {} bytes", self.max_bytes);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(false);
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            bail!("header name must not be empty");
        }
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}'"))?;

        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "host" => {
                if self.host.is_none() {
                    self.host = Some(value.to_string());
                }
            }
            "content-length" => {
                let parsed: u64 = value
                    .parse()
                    .map_err(|_| anyhow!("invalid Content-Length value '{value}'"))?;
                if let Some(existing) = self.content_length
                    && existing != parsed
                {
                    bail!("conflicting Content-Length headers");
                }
                self.content_length = Some(parsed);
            }
            "transfer-encoding" => {
                if value.to_ascii_lowercase().contains("chunked") {
                    self.chunked = true;
                }
            }
            "connection" => {
                for token in value.split(',') {
                    let token = token.trim();
                    if !token.is_empty() {
                        self.connection_tokens.insert(token.to_ascii_lowercase());
                    }
                }
            }
            "expect" => {
                if value.eq_ignore_ascii_case("100-continue") {
                    self.expect_continue = true;
                }
            }
            _ => {}
        }

        self.lines.push(HeaderLine::new(name, value));
        Ok(true)
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn wants_close(&self) -> bool {
        self.connection_tokens.contains("close")
    }

    pub fn expect_continue(&self) -> bool {
        self.expect_continue
    }

    /// Headers safe to pass to the origin: hop-by-hop fields, the proxy
    /// control headers, and anything named in Connection are dropped.
    pub fn forward_lines(&self) -> impl Iterator<Item = &HeaderLine> {
        self.lines.iter().filter(move |line| {
            let name = line.lower_name();
            !matches!(
                name,
                "proxy-connection"
                    | "proxy-authorization"
                    | "proxy-authenticate"
                    | "connection"
                    | "keep-alive"
                    | "upgrade"
                    | "te"
                    | "expect"
                    | "transfer-encoding"
                    | "content-length"
                    | "host"
            ) && !self.connection_tokens.contains(name)
        })
    }
}

//! Proxy Dialer
//!
//! Opens TCP streams to a target, either directly or tunnelled through
//! the upstream proxy of the active rule.
//!
//! # Protocols
//!
//! ```text
//! HTTP proxy:   CONNECT host:port ──▶ 407? ──▶ CONNECT + Proxy-Authorization ──▶ 200
//! SOCKS5 proxy: greeting ──▶ [username/password] ──▶ CONNECT ──▶ reply
//! ```
//!
//! Authentication is challenge driven: credentials are only requested
//! from the [`AuthHandler`] once the proxy asks for them.

use crate::route::{ProxyScheme, ProxyServer};
use base64::Engine;
use std::net::IpAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication methods
const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_USER_PASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

/// Username/password sub-negotiation version (RFC 1929)
const USER_PASS_VERSION: u8 = 0x01;

/// SOCKS5 commands
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 address types
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

/// SOCKS5 reply codes
const REPLY_SUCCESS: u8 = 0x00;

/// Upper bound for a proxy response head
const MAX_HEAD: usize = 8 * 1024;

/// Proxy credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `Proxy-Authorization` header value
    pub fn basic_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(raw))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A proxy asking for authentication
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    /// Proxy that issued the challenge
    pub proxy: ProxyServer,
    /// Realm from `Proxy-Authenticate`, when the proxy sent one
    pub realm: Option<String>,
}

/// Answers proxy authentication challenges
pub trait AuthHandler: Send + Sync {
    /// Credentials for the challenge, or `None` to continue without
    fn credentials(&self, challenge: &AuthChallenge) -> Option<Credentials>;
}

/// Dialer errors
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Proxy refused tunnel (HTTP {0})")]
    TunnelRefused(u16),

    #[error("Proxy authentication required")]
    AuthRequired,

    #[error("Proxy rejected credentials")]
    AuthRejected,

    #[error("SOCKS5 protocol error: {0}")]
    Protocol(String),

    #[error("SOCKS5 connect failed (reply {0:#04x})")]
    Socks5Reply(u8),

    #[error("Malformed proxy response")]
    MalformedResponse,
}

/// Strip the brackets URL parsers keep around IPv6 literals
fn bare_host(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

fn authority(host: &str, port: u16) -> String {
    let host = bare_host(host);
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Connect straight to `host:port`
pub async fn connect_direct(host: &str, port: u16) -> Result<TcpStream, DialError> {
    let stream = TcpStream::connect((bare_host(host), port)).await?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Open a tunnel to `host:port` through `proxy`
pub async fn connect_tunnel(
    proxy: &ProxyServer,
    host: &str,
    port: u16,
    auth: Option<&dyn AuthHandler>,
) -> Result<TcpStream, DialError> {
    debug!("Tunnelling to {} via {}", authority(host, port), proxy);
    match proxy.scheme {
        ProxyScheme::Http => http_connect(proxy, host, port, auth).await,
        ProxyScheme::Socks5 => socks5_connect(proxy, host, port, auth).await,
    }
}

// ===== HTTP CONNECT =====

#[derive(Debug, PartialEq, Eq)]
enum ConnectReply {
    Established,
    Status { code: u16, realm: Option<String> },
}

async fn http_connect(
    proxy: &ProxyServer,
    host: &str,
    port: u16,
    auth: Option<&dyn AuthHandler>,
) -> Result<TcpStream, DialError> {
    let mut stream = connect_direct(&proxy.host, proxy.port).await?;
    match http_connect_once(&mut stream, host, port, None).await? {
        ConnectReply::Established => Ok(stream),
        ConnectReply::Status { code: 407, realm } => {
            let challenge = AuthChallenge {
                proxy: proxy.clone(),
                realm,
            };
            let Some(creds) = auth.and_then(|handler| handler.credentials(&challenge)) else {
                return Err(DialError::AuthRequired);
            };

            // Proxies commonly close after a 407, so retry on a fresh connection
            let mut stream = connect_direct(&proxy.host, proxy.port).await?;
            match http_connect_once(&mut stream, host, port, Some(&creds)).await? {
                ConnectReply::Established => Ok(stream),
                ConnectReply::Status { code: 407, .. } => {
                    warn!("Proxy {} rejected credentials for {}", proxy, creds.username);
                    Err(DialError::AuthRejected)
                }
                ConnectReply::Status { code, .. } => Err(DialError::TunnelRefused(code)),
            }
        }
        ConnectReply::Status { code, .. } => Err(DialError::TunnelRefused(code)),
    }
}

async fn http_connect_once(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    creds: Option<&Credentials>,
) -> Result<ConnectReply, DialError> {
    let target = authority(host, port);
    let mut head = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(creds) = creds {
        head.push_str(&format!("Proxy-Authorization: {}\r\n", creds.basic_header()));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await?;

    let response = read_head(stream).await?;
    parse_connect_reply(&response)
}

/// Read a response head byte by byte so no tunnel data is consumed
async fn read_head(stream: &mut TcpStream) -> Result<String, DialError> {
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if buf.len() >= MAX_HEAD {
            return Err(DialError::MalformedResponse);
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(DialError::MalformedResponse);
        }
        buf.push(byte[0]);
    }
    String::from_utf8(buf).map_err(|_| DialError::MalformedResponse)
}

fn parse_connect_reply(head: &str) -> Result<ConnectReply, DialError> {
    let mut lines = head.split("\r\n");
    let status_line = lines.next().ok_or(DialError::MalformedResponse)?;
    let code: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse().ok())
        .ok_or(DialError::MalformedResponse)?;

    if (200..300).contains(&code) {
        return Ok(ConnectReply::Established);
    }

    let realm = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("proxy-authenticate"))
        .and_then(|(_, value)| parse_realm(value));

    Ok(ConnectReply::Status { code, realm })
}

fn parse_realm(challenge: &str) -> Option<String> {
    let start = challenge.find("realm=")? + "realm=".len();
    let rest = &challenge[start..];
    let realm = match rest.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next()?,
        None => rest.split(',').next()?.trim(),
    };
    Some(realm.to_string())
}

// ===== SOCKS5 =====

async fn socks5_connect(
    proxy: &ProxyServer,
    host: &str,
    port: u16,
    auth: Option<&dyn AuthHandler>,
) -> Result<TcpStream, DialError> {
    let mut stream = connect_direct(&proxy.host, proxy.port).await?;

    stream
        .write_all(&[SOCKS5_VERSION, 2, AUTH_NO_AUTH, AUTH_USER_PASS])
        .await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION {
        return Err(DialError::Protocol(format!("unexpected version {}", choice[0])));
    }

    match choice[1] {
        AUTH_NO_AUTH => {}
        AUTH_USER_PASS => {
            let challenge = AuthChallenge {
                proxy: proxy.clone(),
                realm: None,
            };
            let creds = auth
                .and_then(|handler| handler.credentials(&challenge))
                .ok_or(DialError::AuthRequired)?;
            stream.write_all(&encode_user_pass(&creds)?).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                warn!("SOCKS5 proxy {} rejected credentials for {}", proxy, creds.username);
                return Err(DialError::AuthRejected);
            }
        }
        AUTH_NO_ACCEPTABLE => {
            return Err(DialError::Protocol("no acceptable authentication method".into()));
        }
        other => {
            return Err(DialError::Protocol(format!("unsupported method {:#04x}", other)));
        }
    }

    stream.write_all(&encode_connect(host, port)?).await?;
    read_connect_reply(&mut stream).await?;
    Ok(stream)
}

fn encode_user_pass(creds: &Credentials) -> Result<Vec<u8>, DialError> {
    let user = creds.username.as_bytes();
    let pass = creds.password.as_bytes();
    if user.is_empty() || user.len() > 255 || pass.len() > 255 {
        return Err(DialError::Protocol("credential length out of range".into()));
    }

    let mut out = Vec::with_capacity(3 + user.len() + pass.len());
    out.push(USER_PASS_VERSION);
    out.push(user.len() as u8);
    out.extend_from_slice(user);
    out.push(pass.len() as u8);
    out.extend_from_slice(pass);
    Ok(out)
}

fn encode_connect(host: &str, port: u16) -> Result<Vec<u8>, DialError> {
    let host = bare_host(host);
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ADDR_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ADDR_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.is_empty() || host.len() > 255 {
                return Err(DialError::Protocol(format!("invalid host name length {}", host.len())));
            }
            request.push(ADDR_DOMAIN);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }

    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

async fn read_connect_reply(stream: &mut TcpStream) -> Result<(), DialError> {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(DialError::Protocol(format!("unexpected version {}", head[0])));
    }
    if head[1] != REPLY_SUCCESS {
        return Err(DialError::Socks5Reply(head[1]));
    }

    let addr_len = match head[3] {
        ADDR_IPV4 => 4,
        ADDR_IPV6 => 16,
        ADDR_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => return Err(DialError::Protocol(format!("unknown address type {}", other))),
    };

    // Bound address and port are not needed
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await?;
    Ok(())
}

//! Proxy tunnels for the SSH transport.
//!
//! Each handshake runs over an already-connected stream and leaves it
//! positioned at the first byte from the target, ready for the SSH banner.

use std::net::{IpAddr, Ipv4Addr};

use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::{ProxyConfig, ProxyKind};
use crate::error::{Result, SessionError};

/// Upper bound on an HTTP CONNECT response header.
const MAX_HTTP_RESPONSE: usize = 8 * 1024;

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS4_GRANTED: u8 = 0x5a;
const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_NO_AUTH: u8 = 0x00;
const SOCKS5_USER_PASS: u8 = 0x02;
const SOCKS5_NO_ACCEPTABLE: u8 = 0xff;
const SOCKS_CONNECT: u8 = 0x01;

fn proxy_err(message: impl Into<String>) -> SessionError {
    SessionError::Proxy(message.into())
}

/// Connect to the proxy and ask it for a tunnel to `host:port`.
pub async fn open_tunnel(proxy: &ProxyConfig, host: &str, port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .map_err(|e| {
            proxy_err(format!(
                "Failed to reach proxy {}:{}: {}",
                proxy.host, proxy.port, e
            ))
        })?;

    let username = proxy.username.as_deref();
    let password = proxy.password.as_deref();
    match proxy.kind {
        ProxyKind::Http => http_connect(&mut stream, host, port, username, password).await?,
        ProxyKind::Socks4 => socks4_connect(&mut stream, host, port, username).await?,
        ProxyKind::Socks5 => socks5_connect(&mut stream, host, port, username, password).await?,
    }

    tracing::debug!(
        "{:?} proxy {}:{} tunnelled to {}:{}",
        proxy.kind,
        proxy.host,
        proxy.port,
        host,
        port
    );
    Ok(stream)
}

/// HTTP `CONNECT`, with Basic credentials when a username is set.
pub async fn http_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = format!("{}:{}", host, port);
    let mut request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n", authority);
    if let Some(user) = username {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", user, password.unwrap_or("")));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // Byte at a time so nothing past the header is consumed.
    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= MAX_HTTP_RESPONSE {
            return Err(proxy_err("HTTP proxy response header too large"));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(proxy_err("HTTP proxy closed the connection during CONNECT"));
        }
        response.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&response);
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok());

    match status {
        Some(200) => Ok(()),
        Some(407) => Err(SessionError::Authentication(format!(
            "HTTP proxy rejected credentials: {}",
            status_line
        ))),
        _ => Err(proxy_err(format!("HTTP proxy refused CONNECT: {}", status_line))),
    }
}

/// SOCKS4 `CONNECT`; hostnames that are not IPv4 literals use the 4a extension.
pub async fn socks4_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    user_id: Option<&str>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ipv4 = host.parse::<Ipv4Addr>().ok();

    let mut request = vec![SOCKS4_VERSION, SOCKS_CONNECT];
    request.extend_from_slice(&port.to_be_bytes());
    match ipv4 {
        Some(ip) => request.extend_from_slice(&ip.octets()),
        None => request.extend_from_slice(&[0, 0, 0, 1]),
    }
    request.extend_from_slice(user_id.unwrap_or("").as_bytes());
    request.push(0);
    if ipv4.is_none() {
        request.extend_from_slice(host.as_bytes());
        request.push(0);
    }

    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[1] != SOCKS4_GRANTED {
        return Err(proxy_err(format!(
            "SOCKS4 proxy rejected request (code 0x{:02x})",
            reply[1]
        )));
    }
    Ok(())
}

fn socks5_reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// SOCKS5 `CONNECT`, negotiating username/password auth when credentials are set.
pub async fn socks5_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if username.is_some() {
        &[SOCKS5_VERSION, 2, SOCKS5_NO_AUTH, SOCKS5_USER_PASS]
    } else {
        &[SOCKS5_VERSION, 1, SOCKS5_NO_AUTH]
    };
    stream.write_all(greeting).await?;
    stream.flush().await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION {
        return Err(proxy_err(format!(
            "unexpected SOCKS version {} in reply",
            choice[0]
        )));
    }

    match choice[1] {
        SOCKS5_NO_AUTH => {}
        SOCKS5_USER_PASS => {
            let user = username.unwrap_or("");
            let pass = password.unwrap_or("");
            if user.len() > 255 || pass.len() > 255 {
                return Err(proxy_err("SOCKS5 credentials longer than 255 bytes"));
            }
            let mut auth = vec![0x01, user.len() as u8];
            auth.extend_from_slice(user.as_bytes());
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass.as_bytes());
            stream.write_all(&auth).await?;
            stream.flush().await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(SessionError::Authentication(
                    "SOCKS5 proxy rejected credentials".to_string(),
                ));
            }
        }
        SOCKS5_NO_ACCEPTABLE => {
            return Err(proxy_err("SOCKS5 proxy accepted none of the offered auth methods"));
        }
        other => {
            return Err(proxy_err(format!(
                "SOCKS5 proxy selected unsupported auth method 0x{:02x}",
                other
            )));
        }
    }

    let mut request = vec![SOCKS5_VERSION, SOCKS_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(0x04);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(proxy_err("target hostname longer than 255 bytes"));
            }
            request.push(0x03);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(proxy_err(format!(
            "SOCKS5 connect failed: {}",
            socks5_reply_message(head[1])
        )));
    }

    // Bound address plus port; not needed, but must be consumed.
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(proxy_err(format!(
                "SOCKS5 reply with unknown address type 0x{:02x}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

//! Proxy handshakes over an already-connected stream.
//!
//! Both handshakes pass the destination hostname to the proxy unresolved so
//! name resolution happens on the far side.

use std::io::{self, Error, ErrorKind};
use std::net::IpAddr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::proxy::Credentials;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_USER_PASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const MAX_CONNECT_RESPONSE: usize = 8192;

fn socks_reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS reply",
    }
}

/// SOCKS5 CONNECT (RFC 1928), with RFC 1929 username/password when
/// credentials are given.
pub async fn socks5_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<&Credentials>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method = if credentials.is_some() { AUTH_USER_PASS } else { AUTH_NONE };
    stream.write_all(&[SOCKS_VERSION, 1, method]).await?;
    stream.flush().await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(Error::new(ErrorKind::InvalidData, "proxy is not speaking SOCKS5"));
    }
    match (choice[1], credentials) {
        (AUTH_NONE, _) => {}
        (AUTH_USER_PASS, Some(creds)) => authenticate(stream, creds).await?,
        (AUTH_NO_ACCEPTABLE, _) => {
            return Err(Error::new(ErrorKind::PermissionDenied, "no acceptable SOCKS5 auth method"))
        }
        (other, _) => {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("unexpected SOCKS5 auth method {other:#04x}"),
            ))
        }
    }

    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len())
                .map_err(|_| Error::new(ErrorKind::InvalidInput, "hostname too long for SOCKS5"))?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(Error::new(ErrorKind::ConnectionRefused, socks_reply_message(reply[1])));
    }
    // Bound address is not used; drain it.
    let bound_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => usize::from(stream.read_u8().await?),
        other => {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("unknown SOCKS5 address type {other:#04x}"),
            ))
        }
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

async fn authenticate<S>(stream: &mut S, creds: &Credentials) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = u8::try_from(creds.username.len())
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "SOCKS5 username too long"))?;
    let pass = u8::try_from(creds.password.len())
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "SOCKS5 password too long"))?;
    let mut msg = vec![0x01, user];
    msg.extend_from_slice(creds.username.as_bytes());
    msg.push(pass);
    msg.extend_from_slice(creds.password.as_bytes());
    stream.write_all(&msg).await?;
    stream.flush().await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        return Err(Error::new(ErrorKind::PermissionDenied, "SOCKS5 authentication rejected"));
    }
    Ok(())
}

/// HTTP CONNECT tunnel with optional Basic proxy authentication.
pub async fn http_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<&Credentials>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{ip}]:{port}"),
        _ => format!("{host}:{port}"),
    };
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(creds) = credentials {
        let token = STANDARD.encode(format!("{}:{}", creds.username, creds.password));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // Byte at a time so no tunnelled bytes are consumed.
    let mut response = Vec::with_capacity(256);
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= MAX_CONNECT_RESPONSE {
            return Err(Error::new(ErrorKind::InvalidData, "CONNECT response too large"));
        }
        let byte = stream.read_u8().await.map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => Error::new(ErrorKind::UnexpectedEof, "proxy closed connection"),
            _ => e,
        })?;
        response.push(byte);
    }

    let text = String::from_utf8_lossy(&response);
    let status_line = text.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(Error::new(ErrorKind::InvalidData, "malformed CONNECT response"));
    }
    match code {
        "200" => Ok(()),
        "407" => Err(Error::new(ErrorKind::PermissionDenied, "proxy authentication required")),
        _ => Err(Error::new(
            ErrorKind::ConnectionRefused,
            format!("proxy CONNECT failed: {status_line}"),
        )),
    }
}

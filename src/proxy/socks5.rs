//! SOCKS5 front end
//!
//! Implements the no-authentication CONNECT subset of RFC 1928. Decoding is
//! incremental: each decoder inspects whatever bytes have arrived so far and
//! either asks for more or reports how many bytes the frame consumed.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::config::TimeoutConfig;
use crate::error::HandshakeError;
use crate::models::{CloseReason, SessionState};
use crate::proxy::dialer::{Dialer, TargetHost, UpstreamTarget};
use crate::proxy::relay::relay;
use crate::proxy::session::SessionInfo;
use crate::proxy::shutdown::ShutdownSignal;

pub const VERSION: u8 = 0x05;

pub mod method {
    pub const NO_AUTH: u8 = 0x00;
    pub const GSSAPI: u8 = 0x01;
    pub const USERNAME_PASSWORD: u8 = 0x02;
    pub const NO_ACCEPTABLE: u8 = 0xFF;
}

pub mod command {
    pub const CONNECT: u8 = 0x01;
    pub const BIND: u8 = 0x02;
    pub const UDP_ASSOCIATE: u8 = 0x03;
}

pub mod atyp {
    pub const IPV4: u8 = 0x01;
    pub const DOMAIN: u8 = 0x03;
    pub const IPV6: u8 = 0x04;
}

pub mod reply {
    pub const SUCCEEDED: u8 = 0x00;
    pub const GENERAL_FAILURE: u8 = 0x01;
    pub const NOT_ALLOWED: u8 = 0x02;
    pub const NETWORK_UNREACHABLE: u8 = 0x03;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const CONNECTION_REFUSED: u8 = 0x05;
    pub const TTL_EXPIRED: u8 = 0x06;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

type DecodeResult<T> = std::result::Result<Decoded<T>, HandshakeError>;

/// Outcome of feeding buffered bytes to a decoder
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<T> {
    /// More bytes are needed; nothing was consumed
    Incomplete,
    /// A full frame and the number of bytes it occupied
    Complete(T, usize),
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let byte = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let bytes = self.buf.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(bytes)
    }
}

macro_rules! need {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => return Ok(Decoded::Incomplete),
        }
    };
}

/// Client method-selection message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

impl Greeting {
    pub fn offers(&self, method: u8) -> bool {
        self.methods.contains(&method)
    }
}

/// `VER NMETHODS METHODS...`
pub fn decode_greeting(src: &[u8]) -> DecodeResult<Greeting> {
    let mut cur = Cursor::new(src);

    let version = need!(cur.u8());
    if version != VERSION {
        return Err(HandshakeError::UnsupportedVersion(version));
    }
    let count = need!(cur.u8()) as usize;
    if count == 0 {
        return Err(HandshakeError::Malformed("empty method list"));
    }
    let methods = need!(cur.take(count)).to_vec();

    Ok(Decoded::Complete(Greeting { methods }, cur.pos))
}

/// A CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub target: UpstreamTarget,
}

/// `VER CMD RSV ATYP DST.ADDR DST.PORT`
pub fn decode_request(src: &[u8]) -> DecodeResult<ConnectRequest> {
    let mut cur = Cursor::new(src);

    let version = need!(cur.u8());
    if version != VERSION {
        return Err(HandshakeError::UnsupportedVersion(version));
    }
    let cmd = need!(cur.u8());
    if cmd != command::CONNECT {
        return Err(HandshakeError::UnsupportedCommand(cmd));
    }
    if need!(cur.u8()) != 0x00 {
        return Err(HandshakeError::Malformed("reserved byte must be zero"));
    }

    let host = match need!(cur.u8()) {
        atyp::IPV4 => {
            let b = need!(cur.take(4));
            TargetHost::Ip(IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3])))
        }
        atyp::IPV6 => {
            let b = need!(cur.take(16));
            let mut octets = [0u8; 16];
            octets.copy_from_slice(b);
            TargetHost::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        atyp::DOMAIN => {
            let len = need!(cur.u8()) as usize;
            if len == 0 {
                return Err(HandshakeError::Malformed("empty domain name"));
            }
            let name = need!(cur.take(len));
            let name = std::str::from_utf8(name)
                .map_err(|_| HandshakeError::Malformed("domain name is not valid UTF-8"))?;
            TargetHost::Domain(name.to_string())
        }
        other => return Err(HandshakeError::UnsupportedAddressType(other)),
    };
    let port = need!(cur.u16());

    Ok(Decoded::Complete(
        ConnectRequest {
            target: UpstreamTarget::new(host, port),
        },
        cur.pos,
    ))
}

pub fn encode_method_selection(method: u8) -> [u8; 2] {
    [VERSION, method]
}

/// `VER REP RSV ATYP BND.ADDR BND.PORT`; an unknown bound address is `0.0.0.0:0`
pub fn encode_reply(code: u8, bound: Option<SocketAddr>) -> Bytes {
    let bound = bound.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let mut buf = BytesMut::with_capacity(22);

    buf.put_u8(VERSION);
    buf.put_u8(code);
    buf.put_u8(0x00);
    match bound.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(atyp::IPV4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(atyp::IPV6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(bound.port());

    buf.freeze()
}

/// Result of a successful negotiation
#[derive(Debug)]
struct Negotiated {
    target: UpstreamTarget,
    /// Bytes the client pipelined after the CONNECT request
    early_data: Bytes,
}

async fn read_frame<S, T>(
    stream: &mut S,
    buf: &mut BytesMut,
    decode: fn(&[u8]) -> DecodeResult<T>,
) -> std::result::Result<T, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Decoded::Complete(frame, consumed) = decode(&buf[..])? {
            buf.advance(consumed);
            return Ok(frame);
        }
        match stream.read_buf(buf).await {
            Ok(0) | Err(_) => return Err(HandshakeError::UnexpectedEof),
            Ok(_) => {}
        }
    }
}

async fn negotiate<S>(stream: &mut S) -> std::result::Result<Negotiated, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(512);

    let greeting = read_frame(stream, &mut buf, decode_greeting).await?;
    if !greeting.offers(method::NO_AUTH) {
        let _ = stream
            .write_all(&encode_method_selection(method::NO_ACCEPTABLE))
            .await;
        return Err(HandshakeError::NoAcceptableMethod);
    }
    stream
        .write_all(&encode_method_selection(method::NO_AUTH))
        .await
        .map_err(|_| HandshakeError::UnexpectedEof)?;

    let request = match read_frame(stream, &mut buf, decode_request).await {
        Ok(request) => request,
        Err(e) => {
            if let Some(code) = e.reply_code() {
                let _ = stream.write_all(&encode_reply(code, None)).await;
            }
            return Err(e);
        }
    };

    Ok(Negotiated {
        target: request.target,
        early_data: buf.freeze(),
    })
}

/// Drive one SOCKS5 session from greeting to the end of its relay
pub async fn serve<S>(
    mut stream: S,
    session: &SessionInfo,
    dialer: &dyn Dialer,
    timeouts: &TimeoutConfig,
    signal: &ShutdownSignal,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    session.advance(SessionState::Handshaking);

    let negotiated = tokio::select! {
        result = tokio::time::timeout(timeouts.handshake, negotiate(&mut stream)) => {
            match result.unwrap_or(Err(HandshakeError::Timeout)) {
                Ok(negotiated) => negotiated,
                Err(e) => {
                    debug!("Handshake failed: {}", e);
                    return CloseReason::HandshakeFailed;
                }
            }
        }
        _ = signal.forced() => return CloseReason::ForcedShutdown,
    };

    let Negotiated { target, early_data } = negotiated;
    session.set_target(target.clone());
    session.advance(SessionState::Dialing);

    let dialed = tokio::select! {
        result = dialer.dial(&target, timeouts.connect) => result,
        _ = signal.forced() => return CloseReason::ForcedShutdown,
    };
    let mut upstream = match dialed {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(target = %target, "Dial failed: {}", e);
            let _ = stream.write_all(&encode_reply(e.reply_code(), None)).await;
            return CloseReason::DialFailed;
        }
    };

    if let Err(e) = stream
        .write_all(&encode_reply(reply::SUCCEEDED, upstream.local_addr))
        .await
    {
        debug!("Writing success reply failed: {}", e);
        return CloseReason::ClientError;
    }
    if !early_data.is_empty() {
        if let Err(e) = upstream.stream.write_all(&early_data).await {
            debug!("Forwarding early data failed: {}", e);
            return CloseReason::UpstreamError;
        }
        session.add_bytes_in(early_data.len() as u64);
    }

    session.advance(SessionState::Relaying);
    let outcome = relay(stream, upstream.stream, timeouts.idle, signal.forced()).await;
    session.add_bytes_in(outcome.client_to_upstream);
    session.add_bytes_out(outcome.upstream_to_client);

    outcome.reason.into()
}

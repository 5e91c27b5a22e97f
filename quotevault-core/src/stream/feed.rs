//! Push price feeds.
//!
//! A `FeedConnector` opens one subscription per symbol; the resulting
//! `PriceFeed` yields raw text frames. `WsFeedConnector` speaks WebSocket over
//! a plain `TcpStream` (TLS for `wss://`), subscribing with
//! `{"subscribe": [SYMBOL]}`.

use std::io::ErrorKind;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;
use tungstenite::http::Uri;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::domain::normalize_symbol;
use crate::error::{ParseError, StreamError};
use crate::worker::{CancelHook, CancelToken};

/// An open subscription.
pub trait PriceFeed: Send {
    /// Wait up to `timeout` for the next frame. `Ok(None)` means nothing
    /// arrived in time.
    fn next_message(&mut self, timeout: Duration) -> Result<Option<String>, StreamError>;

    fn close(&mut self);
}

pub trait FeedConnector: Send + Sync {
    /// Connect and subscribe to `symbol`. Implementations register a hook on
    /// `token` that unblocks any pending read when the token is cancelled, and
    /// release it when the feed is dropped.
    fn connect(&self, symbol: &str, token: &CancelToken) -> Result<Box<dyn PriceFeed>, StreamError>;
}

pub struct WsFeedConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsFeedConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }

    fn open_tcp(&self, uri: &Uri) -> Result<TcpStream, StreamError> {
        let host = uri
            .host()
            .ok_or_else(|| StreamError::InvalidUrl(self.url.clone()))?;
        let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
            Some("wss") => 443,
            _ => 80,
        });

        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| StreamError::Connect(format!("resolve {host}: {e}")))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(StreamError::Connect(match last_err {
            Some(e) => format!("{host}:{port}: {e}"),
            None => format!("{host}:{port}: no addresses"),
        }))
    }
}

impl FeedConnector for WsFeedConnector {
    fn connect(&self, symbol: &str, token: &CancelToken) -> Result<Box<dyn PriceFeed>, StreamError> {
        let uri: Uri = self
            .url
            .parse()
            .map_err(|_| StreamError::InvalidUrl(self.url.clone()))?;

        let tcp = self.open_tcp(&uri)?;
        let setup = |e: std::io::Error| StreamError::Connect(e.to_string());
        tcp.set_nodelay(true).map_err(setup)?;
        tcp.set_read_timeout(Some(self.connect_timeout)).map_err(setup)?;

        let control = tcp.try_clone().map_err(setup)?;
        let unblock = tcp.try_clone().map_err(setup)?;
        // Dropped with the feed, or on any early return below.
        let cancel_hook = token.on_cancel(move || {
            let _ = unblock.shutdown(Shutdown::Both);
        });

        let (mut socket, _response) = tungstenite::client_tls(self.url.as_str(), tcp)
            .map_err(|e| StreamError::Handshake(e.to_string()))?;

        let frame = serde_json::json!({ "subscribe": [symbol] }).to_string();
        socket
            .send(Message::text(frame))
            .map_err(|e| StreamError::Protocol(e.to_string()))?;
        debug!(symbol, url = %self.url, "subscribed to price feed");

        Ok(Box::new(WsFeed {
            socket,
            control,
            _cancel_hook: cancel_hook,
        }))
    }
}

struct WsFeed {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
    /// Clone of the underlying socket, used to adjust read timeouts.
    control: TcpStream,
    _cancel_hook: CancelHook,
}

impl PriceFeed for WsFeed {
    fn next_message(&mut self, timeout: Duration) -> Result<Option<String>, StreamError> {
        let timeout = timeout.max(Duration::from_millis(1));
        self.control
            .set_read_timeout(Some(timeout))
            .map_err(|e| StreamError::Protocol(e.to_string()))?;

        match self.socket.read() {
            Ok(Message::Text(text)) => Ok(Some(text.as_str().to_owned())),
            Ok(Message::Binary(bytes)) => Ok(String::from_utf8(bytes.to_vec()).ok()),
            Ok(Message::Close(_)) => Err(StreamError::ClosedByPeer),
            Ok(_) => Ok(None),
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                Ok(None)
            }
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Err(StreamError::ClosedByPeer)
            }
            Err(e) => Err(StreamError::Protocol(e.to_string())),
        }
    }

    fn close(&mut self) {
        let _ = self.socket.close(None);
        let _ = self.socket.flush();
    }
}

/// Extract a price for `symbol` from one frame.
///
/// `Ok(None)` for well-formed frames that aren't ticks for this symbol
/// (heartbeats, other symbols, acks). Frames that aren't JSON, or carry a
/// price that isn't a positive finite number, are errors.
pub fn parse_tick(symbol: &str, text: &str) -> Result<Option<f64>, ParseError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ParseError::MalformedMessage(e.to_string()))?;

    let Some(obj) = value.as_object() else {
        return Ok(None);
    };
    let Some(id) = obj.get("id").and_then(Value::as_str) else {
        return Ok(None);
    };
    if normalize_symbol(id) != normalize_symbol(symbol) {
        return Ok(None);
    }

    let Some(raw) = obj.get("price").or_else(|| obj.get("regularMarketPrice")) else {
        return Ok(None);
    };
    let price = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| ParseError::InvalidPrice(raw.to_string()))?;

    if !price.is_finite() || price <= 0.0 {
        return Err(ParseError::InvalidPrice(raw.to_string()));
    }
    Ok(Some(price))
}

/*!
 * Byte-stream transport over raw TCP.
 *
 * Two sub-protocols share one endpoint host:
 *
 * - AT commands on the AT port, framed by `+ok`, `+ERR` or bare `OK`/`ERROR`
 *   lines, with the hard timeout doubling as the completion signal.
 * - A transparent serial bridge whose responses are framed purely by
 *   inactivity.
 *
 * Every call opens its own socket.
 */
use std::time::Duration;

use bytes::BytesMut;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use fleetlink_core::config::TransportConfig;
use fleetlink_core::utils::{with_timeout, Deadline, Expiry};

use crate::error::{ConnectorError, Result};

/// Default AT command port
pub const DEFAULT_AT_PORT: u16 = 49000;

/// Default transparent serial bridge port
pub const DEFAULT_SERIAL_PORT: u16 = 8899;

const READ_CHUNK: usize = 1024;

/// Compiled AT response patterns
#[derive(Debug, Clone)]
struct AtFramer {
    terminator: Regex,
    ok_value: Regex,
    ok_bare: Regex,
    err: Regex,
    error_line: Regex,
}

impl AtFramer {
    fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| ConnectorError::protocol(format!("Bad AT pattern: {}", e)))
        };
        Ok(Self {
            terminator: compile(r"(?im)^(?:OK|ERROR)\r?\n|\+ok(?:=[^\r\n]*)?\r?\n|\+ERR(?:=[^\r\n]*)?\r?\n")?,
            ok_value: compile(r"(?i)\+ok=([^\r\n]*)")?,
            ok_bare: compile(r"(?im)^\+ok\s*$")?,
            err: compile(r"(?i)\+ERR(?:=([^\r\n]*))?")?,
            error_line: compile(r"(?m)^ERROR\s*$")?,
        })
    }

    fn is_complete(&self, text: &str) -> bool {
        self.terminator.is_match(text)
    }

    /// Interpret an accumulated response
    fn parse(&self, raw: &str) -> Result<String> {
        let trimmed = raw.trim();
        if let Some(value) = self.ok_value.captures(trimmed).and_then(|c| c.get(1)) {
            return Ok(value.as_str().trim().to_string());
        }
        if self.ok_bare.is_match(trimmed) {
            return Ok("OK".to_string());
        }
        if let Some(captures) = self.err.captures(trimmed) {
            let message = captures
                .get(1)
                .map(|m| m.as_str().trim())
                .filter(|m| !m.is_empty())
                .unwrap_or("ERR");
            return Err(ConnectorError::api(None, format!("AT error: {}", message)));
        }
        if self.error_line.is_match(trimmed) {
            return Err(ConnectorError::api(None, format!("AT error: {}", trimmed)));
        }
        Ok(trimmed.to_string())
    }
}

/// Decode a space-separated hex string, or take the input literally
pub fn decode_payload(input: &str) -> Result<Vec<u8>> {
    let looks_hex = input.contains(' ')
        && !input.trim().is_empty()
        && input.chars().all(|c| c.is_ascii_hexdigit() || c.is_whitespace());
    if !looks_hex {
        return Ok(input.as_bytes().to_vec());
    }
    let compact: String = input.split_whitespace().collect();
    hex::decode(&compact).map_err(|e| ConnectorError::config(format!("Invalid hex payload '{}': {}", input, e)))
}

/// Hex encode with byte pairs separated by spaces
pub fn hex_pairs(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Raw TCP transport for AT-command radios and serial bridges
#[derive(Debug, Clone)]
pub struct FramedTransport {
    host: String,
    at_port: u16,
    serial_port: u16,
    connect_timeout: Duration,
    at_timeout: Duration,
    serial_timeout: Duration,
    serial_idle: Duration,
    framer: AtFramer,
}

impl FramedTransport {
    /// Create a transport for `host` with the configured timeouts
    pub fn new<S: Into<String>>(host: S, config: &TransportConfig) -> Result<Self> {
        Ok(Self {
            host: host.into(),
            at_port: DEFAULT_AT_PORT,
            serial_port: DEFAULT_SERIAL_PORT,
            connect_timeout: config.at_timeout(),
            at_timeout: config.at_timeout(),
            serial_timeout: config.serial_timeout(),
            serial_idle: config.serial_idle(),
            framer: AtFramer::new()?,
        })
    }

    /// Override the AT port
    pub fn with_at_port(mut self, port: u16) -> Self {
        self.at_port = port;
        self
    }

    /// Override the serial bridge port
    pub fn with_serial_port(mut self, port: u16) -> Self {
        self.serial_port = port;
        self
    }

    /// Host name or address
    pub fn host(&self) -> &str {
        &self.host
    }

    /// AT port in use
    pub fn at_port(&self) -> u16 {
        self.at_port
    }

    /// Serial bridge port in use
    pub fn serial_port(&self) -> u16 {
        self.serial_port
    }

    async fn dial(&self, port: u16) -> Result<TcpStream> {
        let what = format!("Connecting to {}:{}", self.host, port);
        with_timeout(self.connect_timeout, &what, async {
            TcpStream::connect((self.host.as_str(), port))
                .await
                .map_err(|e| ConnectorError::transport(format!("{}:{}: {}", self.host, port, e)))
        })
        .await
    }

    /// Send `command` to the AT port and wait for a framed response.
    ///
    /// When no terminator arrives the timeout completes the call: whatever
    /// accumulated is parsed, and silence fails with `Timeout`.
    pub async fn send_at(&self, command: &str, timeout: Option<Duration>) -> Result<String> {
        let bound = timeout.unwrap_or(self.at_timeout);
        let deadline = Deadline::new(bound);
        let mut stream = self.dial(self.at_port).await?;
        stream.write_all(format!("{}\r\n", command).as_bytes()).await?;
        debug!("AT -> {}:{} {}", self.host, self.at_port, command);

        let mut received = BytesMut::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            tokio::select! {
                read = stream.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        break;
                    }
                    received.extend_from_slice(&chunk[..n]);
                    if self.framer.is_complete(&String::from_utf8_lossy(&received)) {
                        break;
                    }
                }
                _ = deadline.wait() => {
                    debug!("AT {} reached its {} ms bound", command, bound.as_millis());
                    break;
                }
            }
        }

        if received.is_empty() {
            return Err(ConnectorError::timeout(format!(
                "AT command timed out after {} ms: {}",
                bound.as_millis(),
                command
            )));
        }
        let text = String::from_utf8_lossy(&received);
        debug!("AT <- {}", text.trim());
        self.framer.parse(&text)
    }

    /// Send bytes through the serial bridge and collect the reply.
    ///
    /// The reply ends after an inactivity window that every chunk restarts,
    /// capped by the overall timeout.
    pub async fn send_bytes(&self, payload: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>> {
        let bound = timeout.unwrap_or(self.serial_timeout);
        let mut deadline = Deadline::with_idle(bound, self.serial_idle);
        let mut stream = self.dial(self.serial_port).await?;
        stream.write_all(payload).await?;
        debug!("serial -> {}:{} {} bytes", self.host, self.serial_port, payload.len());

        let mut received = BytesMut::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            tokio::select! {
                read = stream.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        break;
                    }
                    received.extend_from_slice(&chunk[..n]);
                    deadline.touch();
                }
                expiry = deadline.wait() => {
                    if expiry == Expiry::Idle {
                        debug!("serial reply settled after {} bytes", received.len());
                    }
                    break;
                }
            }
        }

        if received.is_empty() {
            return Err(ConnectorError::timeout(format!(
                "No serial response from {}:{} within {} ms",
                self.host,
                self.serial_port,
                bound.as_millis()
            )));
        }
        Ok(received.to_vec())
    }

    /// Send text or a space-separated hex string; the reply is hex pairs
    pub async fn send_raw(&self, data: &str, timeout: Option<Duration>) -> Result<String> {
        let payload = decode_payload(data)?;
        let reply = self.send_bytes(&payload, timeout).await?;
        Ok(hex_pairs(&reply))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! One-shot TCP peers.
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Accept one connection, read the request, write `chunks` with a short
    /// gap, then hold the socket open for `hold`. Resolves to the request bytes.
    pub async fn peer(chunks: Vec<Vec<u8>>, hold: Duration) -> (u16, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 256];
            let n = socket.read(&mut request).await.unwrap();
            request.truncate(n);
            for chunk in chunks {
                socket.write_all(&chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            tokio::time::sleep(hold).await;
            request
        });
        (port, handle)
    }

    /// A peer that answers every connection with the reply mapped to its
    /// first request line
    pub async fn at_responder(replies: Vec<(&'static str, &'static str)>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let replies = replies.clone();
                tokio::spawn(async move {
                    let mut request = vec![0u8; 256];
                    let n = socket.read(&mut request).await.unwrap_or(0);
                    let command = String::from_utf8_lossy(&request[..n]).trim().to_string();
                    if let Some((_, reply)) = replies.iter().find(|(cmd, _)| *cmd == command) {
                        let _ = socket.write_all(reply.as_bytes()).await;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                });
            }
        });
        port
    }
}

#[cfg(test)]
mod tests {
    use super::testing::peer;
    use super::*;
    use crate::error::ErrorKind;

    fn transport(port: u16) -> FramedTransport {
        let config = TransportConfig {
            at_timeout_ms: 300,
            serial_timeout_ms: 600,
            serial_idle_ms: 100,
            ..TransportConfig::default()
        };
        FramedTransport::new("127.0.0.1", &config)
            .unwrap()
            .with_at_port(port)
            .with_serial_port(port)
    }

    #[tokio::test]
    async fn test_at_bare_ok() {
        let (port, request) = peer(vec![b"OK\r\n".to_vec()], Duration::from_secs(2)).await;
        assert_eq!(transport(port).send_at("AT", None).await.unwrap(), "OK");
        assert_eq!(request.await.unwrap(), b"AT\r\n");
    }

    #[tokio::test]
    async fn test_at_value_across_chunks() {
        let (port, _) = peer(vec![b"+o".to_vec(), b"k=1.0.4b\r\n".to_vec()], Duration::from_secs(2)).await;
        assert_eq!(transport(port).send_at("AT+VER", None).await.unwrap(), "1.0.4b");
    }

    #[tokio::test]
    async fn test_at_err_is_error() {
        let (port, _) = peer(vec![b"+ERR=timeout\r\n".to_vec()], Duration::from_secs(2)).await;
        let err = transport(port).send_at("AT+WANN", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Api);
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn test_at_error_line_is_error() {
        let (port, _) = peer(vec![b"\r\nERROR\r\n".to_vec()], Duration::from_secs(2)).await;
        let err = transport(port).send_at("AT+BOGUS", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Api);
    }

    #[tokio::test]
    async fn test_at_silence_is_timeout() {
        let (port, _) = peer(Vec::new(), Duration::from_secs(2)).await;
        let err = transport(port).send_at("AT+MID", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("AT+MID"));
    }

    #[tokio::test]
    async fn test_at_unterminated_returns_accumulated() {
        let (port, _) = peer(vec![b"HF-LPB100".to_vec()], Duration::from_secs(2)).await;
        assert_eq!(transport(port).send_at("AT+MID", None).await.unwrap(), "HF-LPB100");
    }

    #[tokio::test]
    async fn test_raw_hex_roundtrip() {
        let (port, request) = peer(
            vec![vec![0x01, 0x03, 0x02], vec![0x00, 0x17]],
            Duration::from_secs(2),
        )
        .await;
        let reply = transport(port).send_raw("01 03 00 00 00 01 84 0A", None).await.unwrap();
        assert_eq!(reply, "01 03 02 00 17");
        assert_eq!(request.await.unwrap(), vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0a]);
    }

    #[tokio::test]
    async fn test_raw_literal_text() {
        let (port, request) = peer(vec![b"pong".to_vec()], Duration::from_secs(2)).await;
        let reply = transport(port).send_raw("ping", None).await.unwrap();
        assert_eq!(reply, "70 6f 6e 67");
        assert_eq!(request.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_raw_silence_is_timeout() {
        let (port, _) = peer(Vec::new(), Duration::from_secs(2)).await;
        let err = transport(port).send_raw("01 02", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_refused_connection_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = transport(port).send_at("AT", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_decode_payload() {
        assert_eq!(decode_payload("01 ff").unwrap(), vec![0x01, 0xff]);
        assert_eq!(decode_payload("0a0b").unwrap(), b"0a0b".to_vec());
        assert_eq!(decode_payload("hello world").unwrap(), b"hello world".to_vec());
        assert_eq!(decode_payload("0 1 2").unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_parse_rules() {
        let framer = AtFramer::new().unwrap();
        assert_eq!(framer.parse("+ok\r\n").unwrap(), "OK");
        assert_eq!(framer.parse("+ok=HF-A11\r\n").unwrap(), "HF-A11");
        assert!(framer.parse("+ERR=-2\r\n").unwrap_err().to_string().contains("-2"));
        assert!(framer.parse("+ERR\r\n").is_err());
        assert!(framer.is_complete("+ok\r\n"));
        assert!(framer.is_complete("line\r\nOK\r\n"));
        assert!(!framer.is_complete("+o"));
    }
}

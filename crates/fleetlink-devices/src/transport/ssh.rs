/*!
 * `russh` implementation of the shell seam.
 *
 * Preference lists extend down to SHA-1 key exchange, CBC ciphers and
 * HMAC-SHA1 for older network OS firmware.
 */
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{cipher, kex, mac, Channel, ChannelMsg, Disconnect, Preferred};
use russh_keys::key;
use tracing::{debug, warn};

use crate::error::{ConnectorError, Result};
use crate::transport::shell::{ChannelEvent, ShellChannel, ShellDialer, ShellSession, ShellTarget};

const KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::DH_G14_SHA256,
    kex::DH_G14_SHA1,
    kex::DH_G1_SHA1,
];

const CIPHER_ORDER: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
    cipher::AES_256_CBC,
    cipher::AES_128_CBC,
];

const MAC_ORDER: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA1,
];

const HOST_KEY_ORDER: &[key::Name] = &[
    key::ED25519,
    key::ECDSA_SHA2_NISTP256,
    key::ECDSA_SHA2_NISTP521,
    key::RSA_SHA2_512,
    key::RSA_SHA2_256,
    key::SSH_RSA,
];

/// Host keys are not pinned; every key is accepted.
struct ClientHandler {
    host: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!("Accepting host key from {}", self.host);
        Ok(true)
    }
}

/// Dials SSH sessions with password authentication
#[derive(Debug, Clone)]
pub struct RusshDialer {
    inactivity_timeout: Option<Duration>,
}

impl RusshDialer {
    /// A dialer with no inactivity timeout
    pub fn new() -> Self {
        Self {
            inactivity_timeout: None,
        }
    }

    /// Close idle sessions after `timeout`
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    fn client_config(&self) -> client::Config {
        client::Config {
            inactivity_timeout: self.inactivity_timeout,
            preferred: Preferred {
                kex: Cow::Borrowed(KEX_ORDER),
                key: Cow::Borrowed(HOST_KEY_ORDER),
                cipher: Cow::Borrowed(CIPHER_ORDER),
                mac: Cow::Borrowed(MAC_ORDER),
                ..Preferred::default()
            },
            ..Default::default()
        }
    }
}

impl Default for RusshDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShellDialer for RusshDialer {
    async fn dial(&self, target: &ShellTarget) -> Result<Arc<dyn ShellSession>> {
        let handler = ClientHandler {
            host: target.host.clone(),
        };
        let config = Arc::new(self.client_config());

        let mut handle = client::connect(config, (target.host.as_str(), target.port), handler)
            .await
            .map_err(|e| ConnectorError::transport(format!("SSH connection to {} failed: {}", target.host, e)))?;

        let authenticated = handle
            .authenticate_password(target.username.clone(), target.password.clone())
            .await?;
        if !authenticated {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
            return Err(ConnectorError::auth(format!(
                "SSH password rejected for {}@{}",
                target.username, target.host
            )));
        }

        Ok(Arc::new(RusshSession {
            host: target.host.clone(),
            handle,
        }))
    }
}

/// An authenticated `russh` session
pub struct RusshSession {
    host: String,
    handle: Handle<ClientHandler>,
}

impl std::fmt::Debug for RusshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshSession")
            .field("host", &self.host)
            .field("closed", &self.handle.is_closed())
            .finish()
    }
}

#[async_trait]
impl ShellSession for RusshSession {
    async fn open_exec(&self, command: &str) -> Result<Box<dyn ShellChannel>> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;
        Ok(Box::new(RusshChannel { channel }))
    }

    async fn open_shell(&self) -> Result<Box<dyn ShellChannel>> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.request_pty(false, "vt100", 200, 24, 0, 0, &[]).await?;
        channel.request_shell(true).await?;
        Ok(Box::new(RusshChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

struct RusshChannel {
    channel: Channel<Msg>,
}

#[async_trait]
impl ShellChannel for RusshChannel {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.channel.data(data).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { data } => return Some(ChannelEvent::Stdout(data.to_vec())),
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    return Some(ChannelEvent::Stderr(data.to_vec()))
                }
                ChannelMsg::Close => return Some(ChannelEvent::Closed),
                ChannelMsg::ExitStatus { exit_status } if exit_status != 0 => {
                    debug!("Remote command exited with status {}", exit_status);
                }
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.channel.close().await {
            warn!("Closing SSH channel failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferences_reach_legacy_algorithms() {
        let config = RusshDialer::new().client_config();
        assert!(config.preferred.kex.contains(&kex::DH_G1_SHA1));
        assert!(config.preferred.cipher.contains(&cipher::AES_128_CBC));
        assert!(config.preferred.mac.contains(&mac::HMAC_SHA1));
        assert!(config.preferred.key.contains(&key::SSH_RSA));
        assert_eq!(config.preferred.kex[0], kex::CURVE25519);
    }

    #[tokio::test]
    async fn test_dial_unreachable_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = ShellTarget {
            host: "127.0.0.1".to_string(),
            port,
            username: "admin".to_string(),
            password: "secret".to_string(),
        };
        let err = RusshDialer::new().dial(&target).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
    }
}

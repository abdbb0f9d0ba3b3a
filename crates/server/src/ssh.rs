//! SSH server: jump host and roaming backend publisher.
//!
//! Authentication is public-key only, resolved through the stored
//! fingerprint index. Known-but-unconfirmed keys are accepted into a
//! degraded session that refuses forwarding, so the user sees the renewal
//! instructions instead of a silent auth failure.

use crate::backends::RoamingBackend;
use crate::server::App;
use chrono::Utc;
use russh::server::{Auth, Config, Handler, Msg, Server as _, Session};
use russh::{Channel, ChannelId, CryptoVec, SshId};
use russh_keys::PublicKeyBase64;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const BANNER: &str = concat!(
    "       __                                       \n",
    ".--.--|  |--.-----.----.-----.---.-.-----.-----.\n",
    "|  |  |  _  |  -__|   _|  _  |  _  |     |  _  |\n",
    "|_____|_____|_____|__| |___  |___._|__|__|___  |\n",
    "                       |_____|           |_____|\n",
    "                                                \n",
);

const RENEW_MESSAGE: &str = "\nYou will need to run \"ugcert\" to revalidate your SSH key.\n\n";

pub async fn serve(app: Arc<App>, key_pem: Vec<u8>, port: u16) -> anyhow::Result<()> {
    let pem = std::str::from_utf8(&key_pem)?;
    let key = russh_keys::decode_secret_key(pem, None)?;
    let config = Arc::new(Config {
        server_id: SshId::Standard("SSH-2.0-Ubergang1".to_string()),
        keys: vec![key],
        auth_rejection_time: Duration::from_secs(1),
        ..Default::default()
    });

    info!("SSH server started on :{port}");
    let mut server = SshServer { app };
    server.run_on_address(config, ("0.0.0.0", port)).await?;
    Ok(())
}

struct SshServer {
    app: Arc<App>,
}

impl russh::server::Server for SshServer {
    type Handler = SshHandler;

    fn new_client(&mut self, peer: Option<std::net::SocketAddr>) -> SshHandler {
        SshHandler {
            app: self.app.clone(),
            peer,
            key_valid: false,
            roaming: Vec::new(),
        }
    }
}

struct SshHandler {
    app: Arc<App>,
    peer: Option<std::net::SocketAddr>,
    key_valid: bool,
    /// (host, registration id) pairs published by this connection.
    roaming: Vec<(String, u64)>,
}

impl Drop for SshHandler {
    fn drop(&mut self) {
        for (host, id) in &self.roaming {
            self.app.backends.remove_ephemeral(host, *id);
        }
    }
}

#[derive(Serialize)]
struct TunnelBindInfo {
    #[serde(skip_serializing_if = "String::is_empty")]
    error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    bind_addr: String,
}

impl SshHandler {
    fn send_text(&self, session: &mut Session, channel: ChannelId, text: &str) {
        let _ = session.data(channel, CryptoVec::from(text.to_string()));
    }

    fn serve_banner(&self, session: &mut Session, channel: ChannelId) {
        self.send_text(session, channel, BANNER);

        if !self.key_valid {
            self.send_text(session, channel, RENEW_MESSAGE);
            let _ = session.close(channel);
            return;
        }
        if self.roaming.is_empty() {
            self.send_text(
                session,
                channel,
                "\nYou have successfully connected, but there were no valid port forwardings or SSH hosts to jump to. Good bye!\n\n",
            );
            let _ = session.close(channel);
            return;
        }
        for (host, _) in &self.roaming {
            self.send_text(
                session,
                channel,
                &format!("Forwarding https://{host} -> your computer\n"),
            );
        }
        self.send_text(session, channel, "\n");
        // Leave the channel open; roaming backends live until disconnect.
    }
}

#[async_trait::async_trait]
impl Handler for SshHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh_keys::key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!("Public key auth attempt for {user} from {:?}", self.peer);
        let fingerprint = Sha256::digest(public_key.public_key_bytes());
        let key = match self.app.db.get_ssh_key_by_fingerprint(&fingerprint) {
            Ok(key) => key,
            Err(_) => {
                warn!("Failed to find ssh key");
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                });
            }
        };
        let owner = match self.app.db.get_user_by_id(&key.user_id) {
            Ok(owner) => owner,
            Err(_) => {
                warn!("Failed to find user: {}", key.user_id);
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                });
            }
        };
        self.key_valid = key.is_valid(Utc::now());
        if self.key_valid {
            info!("Accepting valid key {} for user {}", key.name, owner.email);
        } else {
            info!("Accepting expired key {} for user {}", key.name, owner.email);
        }
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        self.serve_banner(session, channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        if data == b"tunnel" {
            let info = if self.key_valid {
                TunnelBindInfo {
                    error: String::new(),
                    bind_addr: ":1902".to_string(),
                }
            } else {
                TunnelBindInfo {
                    error: "You will need to run \"ugcert\" to revalidate your SSH key."
                        .to_string(),
                    bind_addr: String::new(),
                }
            };
            let mut body = serde_json::to_string(&info).unwrap_or_default();
            body.push('\n');
            self.send_text(session, channel, &body);
            let _ = session.close(channel);
            return Ok(());
        }
        self.serve_banner(session, channel);
        Ok(())
    }

    /// Reverse forward: only bind-port 80, published as a roaming backend at
    /// `<bind-addr>-roam.<site>`.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("tcpip-forward: {address}:{port}");
        if !self.key_valid {
            warn!("Refusing reverse forward for unconfirmed key");
            return Ok(false);
        }
        if *port != 80 {
            warn!("Requested to forward port {port} - not 80 as expected - denying");
            return Ok(false);
        }

        let host = format!("{address}-roam.{}", self.app.config.site_fqdn);
        let id = self.app.backends.next_roaming_id();
        let backend = RoamingBackend::new(id, host.clone(), address.to_string(), session.handle());
        self.app.backends.add_ephemeral(backend);
        self.roaming.push((host, id));
        Ok(true)
    }

    /// Jump host: destinations resolve against the backend registry; anything
    /// else is refused.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!(
            "direct-tcpip: {originator_address}:{originator_port} -> {host_to_connect}:{port_to_connect}"
        );
        if !self.key_valid {
            warn!("Refusing jump for unconfirmed key - run ugcert to renew");
            return Ok(false);
        }
        let backend = match self.app.backends.lookup(host_to_connect) {
            Ok(backend) => backend,
            Err(e) => {
                warn!("Jump target {host_to_connect} not registered: {e}");
                return Ok(false);
            }
        };

        tokio::spawn(async move {
            let upstream = match backend.dial().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Jump dial failed: {e}");
                    return;
                }
            };
            info!("SSH jumping to {}", backend.url());
            let mut channel_stream = channel.into_stream();
            let mut upstream = upstream;
            let _ = tokio::io::copy_bidirectional(&mut channel_stream, &mut upstream).await;
        });
        Ok(true)
    }
}

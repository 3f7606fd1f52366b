//! Binds the SMTP listeners and wires a fresh [`SmtpSession`] into
//! [`connection::handle`] for each accepted connection. Grounded on the
//! teacher's `smtp/server.rs` (`load_tls_config`/`build_tls_acceptor`, the
//! jittered certificate reload timer, the `ConnectionError::Accept`
//! EOF/reset downgrade in the connection task); generalized from the
//! teacher's single implicit-TLS listener to the three ports this system
//! exposes, and from its `BusClient`/`SmtpCredentialRepository` wiring to
//! the repository set [`SmtpSession::new`] now takes.

use std::{fs::File, io, net::SocketAddr, sync::Arc, time::Duration};

use rand::random_range;
use sqlx::PgPool;
use thiserror::Error;
use tokio::{net::TcpListener, select, sync::RwLock};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        self,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::Config,
    dns::DnsResolver,
    models::{
        AuthenticationLogRepository, BlacklistEntryType, BlacklistRepository, DomainRepository,
        GreylistRepository, MessageRepository, UserRepository,
    },
    queue::MessageQueue,
    ratelimit::RateLimiter,
    smtp::{
        connection::{self, ConnectionError},
        session::SmtpSession,
    },
};

#[derive(Debug, Error)]
pub enum SmtpServerError {
    #[error("failed to load private key: {0}")]
    PrivateKey(io::Error),
    #[error("no private key found in the key file")]
    PrivateKeyNotFound,
    #[error("failed to load certificate: {0}")]
    Certificate(io::Error),
    #[error("failed to listen on address: {0}")]
    Listen(io::Error),
    #[error("failed to configure TLS: {0}")]
    Tls(rustls::Error),
}

#[derive(Clone)]
pub struct SmtpServer {
    config: Arc<Config>,
    users: UserRepository,
    domains: DomainRepository,
    queue: MessageQueue,
    rate_limiter: Arc<RateLimiter>,
    resolver: DnsResolver,
    greylist: GreylistRepository,
    auth_log: AuthenticationLogRepository,
    blacklist: BlacklistRepository,
    shutdown: CancellationToken,
}

impl SmtpServer {
    pub fn new(
        pool: PgPool,
        config: Arc<Config>,
        resolver: DnsResolver,
        rate_limiter: Arc<RateLimiter>,
        shutdown: CancellationToken,
    ) -> SmtpServer {
        SmtpServer {
            users: UserRepository::new(pool.clone()),
            domains: DomainRepository::new(pool.clone()),
            queue: MessageQueue::new(MessageRepository::new(pool.clone())),
            greylist: GreylistRepository::new(pool.clone()),
            auth_log: AuthenticationLogRepository::new(pool.clone()),
            blacklist: BlacklistRepository::new(pool),
            rate_limiter,
            resolver,
            config,
            shutdown,
        }
    }

    async fn load_tls_config(
        &self,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), SmtpServerError> {
        let mut cert_reader = io::BufReader::new(
            File::open(&self.config.tls_cert_path).map_err(SmtpServerError::Certificate)?,
        );
        let mut key_reader = io::BufReader::new(
            File::open(&self.config.tls_key_path).map_err(SmtpServerError::PrivateKey)?,
        );

        let certs = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, io::Error>>()
            .map_err(SmtpServerError::Certificate)?;
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(SmtpServerError::PrivateKey)?
            .ok_or(SmtpServerError::PrivateKeyNotFound)?;

        Ok((certs, key))
    }

    async fn build_tls_acceptor(&self) -> Result<TlsAcceptor, SmtpServerError> {
        let (certs, key) = self.load_tls_config().await?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(SmtpServerError::Tls)?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Runs the accept loop for one listener until shutdown. `implicit_tls`
    /// selects port-465-style behavior: the TLS handshake happens before
    /// the greeting rather than after a STARTTLS command.
    async fn accept_loop(self, listener: TcpListener, acceptor: Arc<RwLock<TlsAcceptor>>, implicit_tls: bool) {
        let local_addr = listener.local_addr().ok();

        loop {
            select! {
                _ = self.shutdown.cancelled() => {
                    info!(?local_addr, "shutting down smtp listener");
                    return;
                }
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        if !self.rate_limiter.allow_connection(peer_addr.ip(), self.config.max_connection_rate) {
                            trace!(%peer_addr, "connection rate exceeded, dropping");
                            continue;
                        }

                        if self.config.enable_blacklist_check {
                            match self.blacklist.is_listed(BlacklistEntryType::Ip, &peer_addr.ip().to_string()).await {
                                Ok(true) => {
                                    debug!(%peer_addr, "rejecting connection from blacklisted ip");
                                    continue;
                                }
                                Ok(false) => {}
                                Err(e) => warn!("blacklist lookup failed: {e}"),
                            }

                            if let (std::net::IpAddr::V4(v4), false) =
                                (peer_addr.ip(), self.config.blacklist_servers.is_empty())
                            {
                                let hits = self.resolver.blacklists(v4, &self.config.blacklist_servers).await;
                                if let Some((server, _)) = hits.iter().find(|(_, listed)| **listed) {
                                    debug!(%peer_addr, %server, "rejecting connection listed on DNSBL");
                                    continue;
                                }
                            }
                        }

                        trace!(%peer_addr, "new TCP connection");

                        let tls_acceptor = acceptor.read().await.clone();
                        let server_name = self.config.server_hostname.clone();
                        let connection_timeout = self.config.connection_timeout;
                        let data_timeout = self.config.data_timeout;
                        let session = SmtpSession::new(
                            self.config.clone(),
                            self.users.clone(),
                            self.domains.clone(),
                            self.queue.clone(),
                            self.rate_limiter.clone(),
                            self.resolver.clone(),
                            self.greylist.clone(),
                            self.auth_log.clone(),
                            peer_addr,
                        );

                        tokio::spawn(async move {
                            if let Err(err) = connection::handle(
                                stream,
                                peer_addr,
                                &server_name,
                                tls_acceptor,
                                implicit_tls,
                                session,
                                connection_timeout,
                                data_timeout,
                            )
                            .await
                            {
                                match &err {
                                    ConnectionError::Timeout => {
                                        trace!(%peer_addr, "connection timed out");
                                    }
                                    ConnectionError::Accept(e)
                                    | ConnectionError::Read(e)
                                    | ConnectionError::Write(e)
                                        if e.kind() == io::ErrorKind::UnexpectedEof
                                            || e.kind() == io::ErrorKind::ConnectionReset =>
                                    {
                                        trace!("connection ended: {err}");
                                    }
                                    _ => error!("failed to handle connection: {err}"),
                                }
                            }
                        });
                    }
                    Err(err) => {
                        error!("failed to accept connection: {err}");
                    }
                },
            }
        }
    }

    pub async fn serve(self) -> Result<(), SmtpServerError> {
        if rustls::crypto::CryptoProvider::get_default().is_none() {
            rustls::crypto::aws_lc_rs::default_provider()
                .install_default()
                .expect("failed to install default crypto provider");
        }

        let acceptor = Arc::new(RwLock::new(self.build_tls_acceptor().await?));

        let plaintext_addr = SocketAddr::new(self.config.server_ip, self.config.smtp_port);
        let submission_addr = SocketAddr::new(self.config.server_ip, self.config.smtp_tls_port);
        let implicit_tls_addr = SocketAddr::new(self.config.server_ip, self.config.smtp_ssl_port);

        let plaintext_listener = TcpListener::bind(plaintext_addr)
            .await
            .map_err(SmtpServerError::Listen)?;
        let submission_listener = TcpListener::bind(submission_addr)
            .await
            .map_err(SmtpServerError::Listen)?;
        let implicit_tls_listener = TcpListener::bind(implicit_tls_addr)
            .await
            .map_err(SmtpServerError::Listen)?;

        info!(
            %plaintext_addr, %submission_addr, %implicit_tls_addr,
            "smtp server listening"
        );

        let certificate_reload_interval =
            Duration::from_secs(60 * 60 * 23 + random_range(0..(60 * 60)));
        debug!(
            "automatically reloading the SMTP certificate every {:?}",
            certificate_reload_interval
        );

        let reload_server = self.clone();
        let reload_acceptor = acceptor.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(certificate_reload_interval);
            loop {
                interval.tick().await;
                match reload_server.build_tls_acceptor().await {
                    Ok(new_acceptor) => {
                        info!("reloading the SMTP TLS certificate");
                        *reload_acceptor.write().await = new_acceptor;
                    }
                    Err(e) => error!("failed to reload the SMTP TLS certificate: {e}"),
                }
            }
        });

        let plaintext = tokio::spawn(self.clone().accept_loop(plaintext_listener, acceptor.clone(), false));
        let submission = tokio::spawn(self.clone().accept_loop(submission_listener, acceptor.clone(), false));
        let implicit = tokio::spawn(self.clone().accept_loop(implicit_tls_listener, acceptor, true));

        let _ = tokio::join!(plaintext, submission, implicit);

        info!("smtp server stopped");
        Ok(())
    }

    pub fn spawn(self) {
        tokio::spawn(async {
            if let Err(e) = self.serve().await {
                error!("smtp server error: {:?}", e);
            }
        });
    }
}

mod connection;
pub mod server;
mod session;

#[cfg(test)]
mod test {
    use crate::{
        config::{AuthMethod, Config, SpfFailurePolicy},
        dns::DnsResolver,
        models::{DmarcPolicy, DomainRepository, UserRepository},
        queue::MessageQueue,
        ratelimit::RateLimiter,
        smtp::server::SmtpServer,
    };
    use mail_send::{SmtpClientBuilder, mail_builder::MessageBuilder};
    use sqlx::PgPool;
    use std::{net::IpAddr, sync::Arc, time::Duration};
    use tokio::task::JoinHandle;
    use tokio_rustls::rustls::crypto;
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;

    /// Built directly rather than through [`Config::from_env`], so that
    /// tests running concurrently under `#[sqlx::test]` don't race on
    /// process-wide environment variables.
    fn test_config(smtp_port: u16) -> Arc<Config> {
        Arc::new(Config {
            server_hostname: "mail.example.com".to_owned(),
            server_domain: "mail.example.com".to_owned(),
            server_ip: IpAddr::from([127, 0, 0, 1]),
            smtp_port,
            smtp_tls_port: smtp_port + 1,
            smtp_ssl_port: smtp_port + 2,
            enable_auth: true,
            auth_methods: vec![AuthMethod::Plain, AuthMethod::Login],
            enable_starttls: true,
            require_tls: false,
            tls_cert_path: "cert.pem".into(),
            tls_key_path: "key.pem".into(),
            max_recipients_per_message: 100,
            max_messages_per_hour: 100,
            max_messages_per_day: 1000,
            max_connection_rate: 100,
            max_auth_attempts: 5,
            retry_attempts: 7,
            retry_delay_seconds: 300,
            message_retention_days: 30,
            enable_dkim_signing: true,
            dkim_selector: "default".to_owned(),
            spf_checking: false,
            spf_failure_policy: SpfFailurePolicy::SoftFail,
            dmarc_checking: false,
            dmarc_failure_policy: DmarcPolicy::None,
            enable_greylisting: false,
            greylist_delay_minutes: 5,
            enable_blacklist_check: false,
            blacklist_servers: Vec::new(),
            max_message_size: 25 * 1024 * 1024,
            connection_timeout: Duration::from_secs(30),
            data_timeout: Duration::from_secs(300),
            max_delivery_threads: 10,
            stale_reap_interval: Duration::from_secs(3600),
        })
    }

    async fn setup_server(pool: PgPool, smtp_port: u16) -> (CancellationToken, JoinHandle<()>) {
        let config = test_config(smtp_port);
        let shutdown = CancellationToken::new();
        let server = SmtpServer::new(
            pool,
            config,
            DnsResolver::new(),
            Arc::new(RateLimiter::new()),
            shutdown.clone(),
        );

        let server_handle = tokio::spawn(async move {
            server.serve().await.unwrap();
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        (shutdown, server_handle)
    }

    #[sqlx::test(fixtures(path = "../../fixtures", scripts("users", "domains")))]
    #[traced_test]
    async fn rejects_relay_for_unauthenticated_sender(pool: PgPool) {
        if crypto::CryptoProvider::get_default().is_none() {
            crypto::aws_lc_rs::default_provider()
                .install_default()
                .expect("failed to install crypto provider");
        }

        let (shutdown, server_handle) = setup_server(pool, 42525).await;

        let message = MessageBuilder::new()
            .from(("Alice", "alice@example.com"))
            .to(vec![("Not Local", "nobody@elsewhere.example")])
            .subject("Hi!")
            .text_body("Hello world!");

        let result = SmtpClientBuilder::new("localhost", 42525)
            .implicit_tls(false)
            .helo_host("client.example.com")
            .connect_plain()
            .await
            .unwrap()
            .send(message)
            .await;

        assert!(result.is_err());

        shutdown.cancel();
        server_handle.await.unwrap();
    }

    #[sqlx::test(fixtures(path = "../../fixtures", scripts("users", "domains")))]
    #[traced_test]
    async fn delivers_to_local_recipient(pool: PgPool) {
        if crypto::CryptoProvider::get_default().is_none() {
            crypto::aws_lc_rs::default_provider()
                .install_default()
                .expect("failed to install crypto provider");
        }

        let (shutdown, server_handle) = setup_server(pool.clone(), 42535).await;

        let message = MessageBuilder::new()
            .from(("Alice", "alice@example.com"))
            .to(vec![("Alice", "alice@example.com")])
            .subject("Hi!")
            .text_body("Hello world!");

        SmtpClientBuilder::new("localhost", 42535)
            .implicit_tls(false)
            .helo_host("client.example.com")
            .connect_plain()
            .await
            .unwrap()
            .send(message)
            .await
            .unwrap();

        let repo = UserRepository::new(pool.clone());
        let domains = DomainRepository::new(pool.clone());
        assert!(domains.is_local_domain("example.com").await.unwrap());
        assert!(repo.find_by_identifier("alice").await.unwrap().is_some());

        let queue = MessageQueue::new(crate::models::MessageRepository::new(pool));
        let dequeued = queue.dequeue(10).await.unwrap();
        assert_eq!(dequeued.len(), 1);
        assert_eq!(dequeued[0].mail_from, "alice@example.com");

        shutdown.cancel();
        server_handle.await.unwrap();
    }
}

use std::{env, sync::Arc, time::Duration};

use derive_more::FromStr;
use serde::Serialize;
use sqlx::PgPool;
use tokio::{signal, sync::Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod auth;
pub mod config;
mod delivery;
mod dkim;
pub mod dns;
mod models;
pub mod queue;
pub mod ratelimit;
mod smtp;
mod spamfilter;

pub use config::Config;
pub use smtp::server::{SmtpServer, SmtpServerError};

use delivery::{DeliveryAgent, Outcome, SigningKey};
use dns::DnsResolver;
use models::{DeliveryAttemptRepository, DomainRepository, MessageRepository};
use queue::MessageQueue;
use ratelimit::RateLimiter;

#[derive(Debug, Default, Clone, Copy, FromStr, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub enum Environment {
    Staging,
    Production,
    #[default]
    Development,
}

impl Environment {
    pub fn from_env() -> Self {
        env::var("ENVIRONMENT")
            .map(|s| s.parse())
            .inspect_err(|_| warn!("Did not find ENVIRONMENT env var, defaulting to development"))
            .unwrap_or(Ok(Environment::Development))
            .expect(
                "Invalid ENVIRONMENT env var, must be one of: development, production, or staging",
            )
    }
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=trace,info", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wires the SMTP server, the outbound delivery worker pool, and the
/// stale-message reaper, and spawns all three. Returns once every task has
/// been spawned; the caller drives `shutdown` and the process lifetime.
pub async fn run_mta(pool: PgPool, config: Arc<Config>, shutdown: CancellationToken) {
    let resolver = DnsResolver::new();
    let rate_limiter = Arc::new(RateLimiter::new());

    let smtp_server = SmtpServer::new(
        pool.clone(),
        config.clone(),
        resolver.clone(),
        rate_limiter.clone(),
        shutdown.clone(),
    );
    smtp_server.spawn();

    spawn_delivery_workers(pool.clone(), config.clone(), resolver, rate_limiter, shutdown.clone());
    spawn_stale_reaper(pool.clone(), config.clone(), shutdown.clone());
    spawn_retention_reaper(pool, config, shutdown);
}

/// Pulls ready messages off the queue and hands each to a bounded pool of
/// concurrent delivery attempts, sized by `config.max_delivery_threads`.
fn spawn_delivery_workers(
    pool: PgPool,
    config: Arc<Config>,
    resolver: DnsResolver,
    rate_limiter: Arc<RateLimiter>,
    shutdown: CancellationToken,
) {
    let queue = MessageQueue::new(MessageRepository::new(pool.clone()));
    let domains = DomainRepository::new(pool.clone());
    let attempts = DeliveryAttemptRepository::new(pool);
    let agent = Arc::new(DeliveryAgent::new(
        resolver,
        attempts,
        config.server_hostname.clone(),
        !config.require_tls,
    ));
    let semaphore = Arc::new(Semaphore::new(config.max_delivery_threads));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutting down delivery worker pool");
                    return;
                }
                _ = interval.tick() => {}
            }

            let available = semaphore.available_permits();
            if available == 0 {
                continue;
            }

            let batch = match queue.dequeue(available as i64).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("failed to dequeue messages for delivery: {e}");
                    continue;
                }
            };

            for message in batch {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("delivery semaphore is never closed");
                let agent = agent.clone();
                let domains = domains.clone();
                let queue = queue.clone();
                let config = config.clone();
                let rate_limiter = rate_limiter.clone();

                tokio::spawn(async move {
                    let _permit = permit;

                    let signing_key = if config.enable_dkim_signing {
                        signing_key_for(&domains, &message.mail_from).await
                    } else {
                        None
                    };

                    match agent.deliver(&message, signing_key.as_ref()).await {
                        Outcome::Delivered => {
                            if let Err(e) = queue.mark_completed(message.id).await {
                                warn!(message_id = %message.id, "failed to mark message delivered: {e}");
                            }
                        }
                        Outcome::Permanent => {
                            let identifier = message
                                .user_id
                                .map(|id| id.to_string())
                                .unwrap_or_else(|| message.mail_from.clone());
                            rate_limiter.record_bounce(&identifier);
                            if let Err(e) = queue.mark_failed(message.id).await {
                                warn!(message_id = %message.id, "failed to mark message failed: {e}");
                            }
                        }
                        Outcome::Transient => {
                            if let Err(e) = queue.requeue_failed(&message).await {
                                warn!(message_id = %message.id, "failed to requeue message: {e}");
                            }
                        }
                    }
                });
            }
        }
    });
}

async fn signing_key_for(domains: &DomainRepository, mail_from: &str) -> Option<SigningKey> {
    let sender_domain = mail_from.rsplit('@').next()?;
    match domains.find_by_name(sender_domain).await {
        Ok(Some(domain)) if domain.active => Some(SigningKey {
            domain: domain.name,
            selector: domain.dkim_selector,
            private_key_pem: domain.dkim_private_key,
        }),
        Ok(_) => None,
        Err(e) => {
            warn!(%sender_domain, "domain lookup failed during delivery signing: {e}");
            None
        }
    }
}

/// Requeues messages stuck `processing` longer than `config.stale_reap_interval`
/// — their worker presumably died mid-delivery.
fn spawn_stale_reaper(pool: PgPool, config: Arc<Config>, shutdown: CancellationToken) {
    let queue = MessageQueue::new(MessageRepository::new(pool));
    let timeout = chrono::Duration::from_std(config.stale_reap_interval)
        .unwrap_or_else(|_| chrono::Duration::hours(1));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.stale_reap_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutting down stale message reaper");
                    return;
                }
                _ = interval.tick() => {}
            }

            match queue.reap_stale(timeout).await {
                Ok(ids) if !ids.is_empty() => {
                    info!(count = ids.len(), "requeued stale in-flight messages");
                }
                Ok(_) => {}
                Err(e) => warn!("failed to reap stale messages: {e}"),
            }
        }
    });
}

/// Purges terminal messages older than `config.message_retention_days`,
/// once a day.
fn spawn_retention_reaper(pool: PgPool, config: Arc<Config>, shutdown: CancellationToken) {
    let queue = MessageQueue::new(MessageRepository::new(pool));
    let retention = chrono::Duration::days(config.message_retention_days as i64);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(24 * 3600));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutting down message retention reaper");
                    return;
                }
                _ = interval.tick() => {}
            }

            match queue.purge_expired(retention).await {
                Ok(removed) if removed > 0 => {
                    info!(removed, "purged expired messages past the retention window");
                }
                Ok(_) => {}
                Err(e) => warn!("failed to purge expired messages: {e}"),
            }
        }
    });
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

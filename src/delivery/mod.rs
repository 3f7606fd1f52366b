//! Outbound delivery: groups recipients by domain, resolves MX hosts, signs
//! with DKIM, and attempts delivery per-MX-per-IP with opportunistic
//! STARTTLS.
//!
//! Grounded on the teacher's `handler/mod.rs` (`send_single_upstream`,
//! `Protection::{Tls,Plaintext}`, `mail_send::SmtpClientBuilder`, the
//! severity-based transient/permanent classification of `mail_send::Error`).
//! Generalized from the teacher's single-recipient-per-call shape to the
//! domain-grouping loop this spec requires, and from its ephemeral
//! in-memory delivery log to [`DeliveryAttempt`] rows persisted one per
//! (message, host) try.

use std::{collections::BTreeMap, time::Instant};

use mail_send::{SmtpClientBuilder, smtp};
use tracing::{debug, info, warn};

use crate::{
    dkim,
    dns::DnsResolver,
    models::{DeliveryAttemptRepository, Message, NewDeliveryAttempt},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Protection {
    Tls,
    Plaintext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    Permanent,
    Transient,
}

/// Per-domain signing material the delivery agent needs; supplied by the
/// caller (looked up from [`DomainRepository`](crate::models::DomainRepository)).
pub struct SigningKey {
    pub domain: String,
    pub selector: String,
    pub private_key_pem: String,
}

pub struct DeliveryAgent {
    resolver: DnsResolver,
    attempts: DeliveryAttemptRepository,
    helo_domain: String,
    allow_plaintext: bool,
}

impl DeliveryAgent {
    pub fn new(
        resolver: DnsResolver,
        attempts: DeliveryAttemptRepository,
        helo_domain: String,
        allow_plaintext: bool,
    ) -> Self {
        Self {
            resolver,
            attempts,
            helo_domain,
            allow_plaintext,
        }
    }

    fn recipient_domain(address: &str) -> Option<&str> {
        address.rsplit_once('@').map(|(_, domain)| domain)
    }

    /// Signs the message (if signing key material is available) and
    /// attempts delivery to every recipient, grouped by domain. Returns the
    /// worst outcome across all recipients: `Delivered` only if every
    /// recipient succeeded, `Transient` if any recipient needs a retry,
    /// else `Permanent`.
    pub async fn deliver(&self, message: &Message, signing_key: Option<&SigningKey>) -> Outcome {
        let raw_message = match signing_key {
            Some(key) => {
                match dkim::sign(&message.raw_message, &key.domain, &key.selector, &key.private_key_pem) {
                    Ok(signed) => signed,
                    Err(e) => {
                        warn!(message_id = %message.id, "DKIM signing failed: {e}");
                        message.raw_message.clone()
                    }
                }
            }
            None => message.raw_message.clone(),
        };

        let mut by_domain: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for rcpt in &message.rcpt_to {
            if let Some(domain) = Self::recipient_domain(rcpt) {
                by_domain.entry(domain).or_default().push(rcpt.as_str());
            }
        }

        let mut any_transient = false;
        let mut any_permanent = false;

        for (domain, recipients) in by_domain {
            match self
                .deliver_to_domain(message, domain, &recipients, &raw_message)
                .await
            {
                Outcome::Delivered => {}
                Outcome::Transient => any_transient = true,
                Outcome::Permanent => any_permanent = true,
            }
        }

        if !any_transient && !any_permanent {
            Outcome::Delivered
        } else if any_transient {
            Outcome::Transient
        } else {
            Outcome::Permanent
        }
    }

    async fn deliver_to_domain(
        &self,
        message: &Message,
        domain: &str,
        recipients: &[&str],
        raw_message: &[u8],
    ) -> Outcome {
        let hosts = match self.resolver.mx(domain).await {
            Ok(hosts) if !hosts.is_empty() => hosts,
            Ok(_) => {
                info!(domain, "no deliverable MX hosts");
                return Outcome::Transient;
            }
            Err(e) => {
                warn!(domain, "MX lookup failed: {e}");
                return Outcome::Transient;
            }
        };

        let order: &[Protection] = if self.allow_plaintext {
            &[Protection::Tls, Protection::Plaintext]
        } else {
            &[Protection::Tls]
        };

        let mut saw_transient = false;

        for host in &hosts {
            for ip in &host.ips {
                for &protection in order {
                    let smtp_message = smtp::message::Message {
                        mail_from: message.mail_from.as_str().into(),
                        rcpt_to: recipients.iter().map(|r| (*r).into()).collect(),
                        body: raw_message.into(),
                    };

                    match self
                        .attempt_upstream(message, &host.hostname, *ip, 25, protection, smtp_message)
                        .await
                    {
                        Ok(()) => return Outcome::Delivered,
                        // A 5xx means this recipient is permanently rejected;
                        // trying the next IP/MX would just repeat the same
                        // policy decision at the remote end.
                        Err(Outcome::Permanent) => return Outcome::Permanent,
                        Err(Outcome::Transient) => saw_transient = true,
                        Err(Outcome::Delivered) => unreachable!(),
                    }
                }
            }
        }

        if saw_transient {
            Outcome::Transient
        } else {
            Outcome::Permanent
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_upstream(
        &self,
        message: &Message,
        hostname: &str,
        ip: std::net::IpAddr,
        port: u16,
        protection: Protection,
        smtp_message: smtp::message::Message<'_>,
    ) -> Result<(), Outcome> {
        let started = Instant::now();

        let builder = SmtpClientBuilder::new(hostname, port)
            .implicit_tls(false)
            .say_ehlo(true)
            .helo_host(&self.helo_domain)
            .timeout(std::time::Duration::from_secs(60));

        let result = match protection {
            Protection::Tls => match builder.connect().await {
                Ok(mut client) => {
                    let r = client.send(smtp_message).await;
                    let _ = client.quit().await;
                    r
                }
                Err(e) => Err(e),
            },
            Protection::Plaintext => match builder.connect_plain().await {
                Ok(mut client) => {
                    let r = client.send(smtp_message).await;
                    let _ = client.quit().await;
                    r
                }
                Err(e) => Err(e),
            },
        };

        let connection_time_ms = started.elapsed().as_millis() as i32;

        let mut record = NewDeliveryAttempt {
            message_id: message.id,
            attempt_number: message.attempts + 1,
            mx_hostname: hostname.to_owned(),
            remote_ip: Some(ip.to_string()),
            connection_time_ms: Some(connection_time_ms),
            ..Default::default()
        };

        match result {
            Ok(_) => {
                debug!(hostname, %ip, "delivered successfully");
                record.success = true;
                record.response = Some("250 OK".to_owned());
                let _ = self.attempts.record(&record).await;
                Ok(())
            }
            Err(err) => {
                let outcome = classify(&err);
                record.error_message = Some(err.to_string());
                record.response = Some(format!("{err}"));
                let _ = self.attempts.record(&record).await;
                Err(outcome)
            }
        }
    }
}

/// Classifies a `mail_send::Error` as transient (worth retrying) or
/// permanent, mirroring the teacher's `send_single_upstream` mapping.
fn classify(err: &mail_send::Error) -> Outcome {
    match err {
        mail_send::Error::Io(_) => Outcome::Transient,
        mail_send::Error::Tls(_) => Outcome::Transient,
        mail_send::Error::Base64(_) => Outcome::Transient,
        mail_send::Error::Auth(_) => Outcome::Transient,
        mail_send::Error::UnparseableReply => Outcome::Transient,
        mail_send::Error::UnexpectedReply(response)
        | mail_send::Error::AuthenticationFailed(response) => {
            if response.severity() == smtp_proto::Severity::TransientNegativeCompletion {
                Outcome::Transient
            } else {
                Outcome::Permanent
            }
        }
        mail_send::Error::InvalidTLSName => Outcome::Transient,
        mail_send::Error::MissingCredentials => Outcome::Permanent,
        mail_send::Error::MissingMailFrom => Outcome::Permanent,
        mail_send::Error::MissingRcptTo => Outcome::Permanent,
        mail_send::Error::UnsupportedAuthMechanism => Outcome::Permanent,
        mail_send::Error::Timeout => Outcome::Transient,
        mail_send::Error::MissingStartTls => Outcome::Permanent,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recipient_domain_splits_on_last_at() {
        assert_eq!(DeliveryAgent::recipient_domain("a@b@example.com"), Some("example.com"));
        assert_eq!(DeliveryAgent::recipient_domain("jane@example.com"), Some("example.com"));
        assert_eq!(DeliveryAgent::recipient_domain("not-an-email"), None);
    }
}

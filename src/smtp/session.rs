//! The per-connection protocol state machine: EHLO/AUTH/MAIL/RCPT/DATA
//! handling and the policy gate chain. Grounded on the teacher's
//! `smtp/session.rs` (the `Request` dispatch shape, the `RESPONSE_*`
//! constant style, `decode_plain_auth`), generalized from its single
//! AUTH PLAIN/unconditional-auth design to the full STARTTLS + LOGIN +
//! CRAM-MD5 + policy-gated RCPT/DATA flow this system needs.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use base64ct::{Base64, Encoding};
use chrono::Utc;
use email_address::EmailAddress;
use mail_parser::MimeHeaders;
use rand::{RngCore, rngs::OsRng};
use smtp_proto::{
    AUTH_CRAM_MD5, AUTH_LOGIN, AUTH_PLAIN, EXT_8BIT_MIME, EXT_AUTH, EXT_ENHANCED_STATUS_CODES,
    EXT_SIZE, EXT_SMTP_UTF8, EXT_STARTTLS, EhloResponse, Request,
};
use tracing::{debug, trace, warn};

use crate::{
    auth::{self, AuthError},
    config::{AuthMethod, Config, SpfFailurePolicy},
    dkim,
    dns::{DnsResolver, SpfResult},
    models::{
        AuthenticationLogRepository, DmarcPolicy, DomainRepository, GreylistRepository, NewMessage, User,
        UserRepository,
    },
    queue::MessageQueue,
    ratelimit::RateLimiter,
    spamfilter::{self, MessageContext},
};

pub struct SmtpSession {
    config: Arc<Config>,
    users: UserRepository,
    domains: DomainRepository,
    queue: MessageQueue,
    rate_limiter: Arc<RateLimiter>,
    resolver: DnsResolver,
    greylist: GreylistRepository,
    auth_log: AuthenticationLogRepository,

    peer_addr: SocketAddr,
    peer_ip: IpAddr,
    ehlo_host: Option<String>,
    tls_active: bool,
    authenticated_user: Option<User>,
    auth_failures: u32,
    tx: Option<Transaction>,
}

struct Transaction {
    mail_from: String,
    rcpt_to: Vec<String>,
    raw_data: Vec<u8>,
}

pub enum SessionReply {
    ReplyAndContinue(u16, String),
    ReplyAndStop(u16, String),
    RawReply(Vec<u8>),
    StartTls(u16, String),
    IngestData(u16, String),
    IngestAuth(u16, String, AuthContinuation),
}

pub enum DataReply {
    ReplyAndContinue(u16, String),
    ContinueIngest,
}

/// Which AUTH mechanism continuation is pending after the next line the
/// client sends. `LoginUsername` handles the two-prompt `AUTH LOGIN` form
/// (no initial response): the client is prompted for a username, then
/// `LoginPassword` prompts for the password in turn. Clients that send the
/// username as the initial response go straight to `LoginPassword`.
pub enum AuthContinuation {
    Plain,
    LoginUsername,
    LoginPassword { username: String },
    CramMd5 { challenge: String },
}

struct AttemptedAuth<'a> {
    username: &'a str,
    password: &'a str,
}

enum AttemptedAuthError {
    SyntaxError,
    Utf8Error,
}

impl SmtpSession {
    const RESPONSE_OK: &str = "2.0.0 Ok";
    const RESPONSE_FROM_OK: &str = "2.1.0 Originator <[email]> ok";
    const RESPONSE_TO_OK: &str = "2.1.5 Recipient <[email]> ok";
    const RESPONSE_SYNTAX_ERROR: &str = "5.5.2 Syntax error";
    const RESPONSE_AUTH_SUCCCESS: &str = "2.7.0 Authentication succeeded.";
    const RESPONSE_START_DATA: &str = "3.5.4 Start mail input; end with <CRLF>.<CRLF>";
    const RESPONSE_BYE: &str = "2.0.0 Goodbye";
    const RESPONSE_MESSAGE_ACCEPTED: &str = "2.6.0 Message queued for delivery";
    const RESPONSE_BAD_SEQUENCE: &str = "5.5.1 Bad sequence of commands";
    const RESPONSE_MAIL_FIRST: &str = "5.5.1 Use MAIL first";
    const RESPONSE_HELLO_FIRST: &str = "5.5.1 Be nice and say EHLO first";
    const RESPONSE_NOVALID_RECIPIENTS: &str = "5.5.1 No valid recipients";
    const RESPONSE_INVALID_SENDER: &str = "5.1.7 This sender address is not valid";
    const RESPONSE_INVALID_EMAIL: &str = "5.1.3 This email address is not valid";
    const RESPONSE_NESTED_MAIL: &str = "5.5.1 Error: nested MAIL command";
    const RESPONSE_ALREADY_AUTHENTICATED: &str = "5.5.1 Already authenticated";
    const RESPONSE_AUTH_ERROR: &str = "5.7.8 Authentication credentials invalid";
    const RESPONSE_ALREADY_TLS: &str = "5.7.4 Already in TLS mode";
    const RESPONSE_COMMAND_NOT_IMPLEMENTED: &str = "5.5.1 Command not implemented";
    const RESPONSE_MUST_USE_ESMTP: &str = "5.5.1 Must use EHLO";
    const RESPONSE_NO_VRFY: &str = "5.5.1 VRFY command is disabled";

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        users: UserRepository,
        domains: DomainRepository,
        queue: MessageQueue,
        rate_limiter: Arc<RateLimiter>,
        resolver: DnsResolver,
        greylist: GreylistRepository,
        auth_log: AuthenticationLogRepository,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            config,
            users,
            domains,
            queue,
            rate_limiter,
            resolver,
            greylist,
            auth_log,
            peer_addr,
            peer_ip: peer_addr.ip(),
            ehlo_host: None,
            tls_active: false,
            authenticated_user: None,
            auth_failures: 0,
            tx: None,
        }
    }

    pub fn peer(&self) -> &SocketAddr {
        &self.peer_addr
    }

    /// Called once a STARTTLS upgrade completes. Per RFC 3207, discards
    /// any prior EHLO/AUTH state: the client must re-identify over TLS.
    pub fn mark_tls(&mut self) {
        self.tls_active = true;
        self.ehlo_host = None;
        self.authenticated_user = None;
    }

    fn rate_identifier(&self) -> String {
        match &self.authenticated_user {
            Some(u) => u.id.to_string(),
            None => self.peer_ip.to_string(),
        }
    }

    pub async fn handle(&mut self, request: Result<Request<String>, smtp_proto::Error>) -> SessionReply {
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                debug!("failed to parse request: {e}");
                return SessionReply::ReplyAndContinue(554, e.to_string());
            }
        };

        if let Request::Auth { mechanism, .. } = request {
            trace!("received AUTH with mechanism {mechanism} from {}", self.peer_addr);
        } else {
            trace!("received request: {request:?} from {}", self.peer_addr);
        }

        match request {
            Request::Ehlo { host } => {
                let mut response = EhloResponse::new(&host);
                let mut capabilities = EXT_ENHANCED_STATUS_CODES | EXT_8BIT_MIME | EXT_SMTP_UTF8;

                capabilities |= EXT_SIZE;
                response.size = self.config.max_message_size as usize;

                if self.config.enable_starttls && !self.tls_active {
                    capabilities |= EXT_STARTTLS;
                }

                if self.config.enable_auth {
                    capabilities |= EXT_AUTH;
                    response.auth_mechanisms = self.config.auth_methods.iter().fold(0, |acc, m| {
                        acc | match m {
                            AuthMethod::Plain => AUTH_PLAIN,
                            AuthMethod::Login => AUTH_LOGIN,
                            AuthMethod::CramMd5 => AUTH_CRAM_MD5,
                        }
                    });
                }

                response.capabilities = capabilities;

                let mut buf = Vec::with_capacity(128);
                response.write(&mut buf).ok();

                self.ehlo_host = Some(host);
                SessionReply::RawReply(buf)
            }
            Request::Lhlo { host: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Helo { host: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_MUST_USE_ESMTP.into())
            }
            Request::Quit => SessionReply::ReplyAndStop(221, Self::RESPONSE_BYE.into()),
            _ignored_command if self.ehlo_host.is_none() => {
                SessionReply::ReplyAndContinue(503, Self::RESPONSE_HELLO_FIRST.into())
            }
            Request::Auth { mechanism, initial_response } => self.handle_auth_command(mechanism, initial_response).await,
            Request::StartTls => {
                if self.tls_active {
                    SessionReply::ReplyAndContinue(503, Self::RESPONSE_ALREADY_TLS.into())
                } else if !self.config.enable_starttls {
                    SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
                } else {
                    SessionReply::StartTls(220, "2.0.0 Ready to start TLS".into())
                }
            }
            Request::Mail { from } => {
                if self.config.require_tls && !self.tls_active {
                    return SessionReply::ReplyAndContinue(530, "5.7.0 Must issue STARTTLS first".into());
                }

                let Ok(from_address) = from.address.parse::<EmailAddress>() else {
                    return SessionReply::ReplyAndContinue(553, Self::RESPONSE_INVALID_SENDER.into());
                };

                if self.tx.is_some() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_NESTED_MAIL.into());
                }

                self.tx = Some(Transaction {
                    mail_from: from_address.to_string(),
                    rcpt_to: Vec::new(),
                    raw_data: Vec::new(),
                });

                let response_message = Self::RESPONSE_FROM_OK.replace("[email]", &from.address);
                SessionReply::ReplyAndContinue(250, response_message)
            }
            Request::Rcpt { to } => self.handle_rcpt(&to.address).await,
            Request::Bdat { chunk_size: _, is_last: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Noop { value: _ } => SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into()),
            Request::Data => {
                let Some(tx) = self.tx.as_ref() else {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
                };

                if tx.rcpt_to.is_empty() {
                    return SessionReply::ReplyAndContinue(554, Self::RESPONSE_NOVALID_RECIPIENTS.into());
                }

                SessionReply::IngestData(354, Self::RESPONSE_START_DATA.into())
            }
            Request::Rset => {
                // Clears the in-progress transaction only; AUTH and EHLO
                // state survive a RSET.
                self.tx = None;
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::Vrfy { value: _ } => SessionReply::ReplyAndContinue(502, Self::RESPONSE_NO_VRFY.into()),
            Request::Expn { value: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Help { value: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Etrn { .. } | Request::Atrn { .. } | Request::Burl { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
        }
    }

    async fn handle_auth_command(&mut self, mechanism: u64, initial_response: String) -> SessionReply {
        if self.authenticated_user.is_some() {
            return SessionReply::ReplyAndContinue(503, Self::RESPONSE_ALREADY_AUTHENTICATED.into());
        }

        if !self.config.enable_auth {
            return SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into());
        }

        if self.auth_failures >= self.config.max_auth_attempts {
            return SessionReply::ReplyAndStop(421, "4.7.0 Too many authentication failures".into());
        }

        if !self.rate_limiter.allow_auth_attempt(self.peer_ip, self.config.max_auth_attempts) {
            return SessionReply::ReplyAndStop(421, "4.7.0 Too many authentication attempts".into());
        }

        if mechanism == AUTH_PLAIN {
            if initial_response.is_empty() {
                return SessionReply::IngestAuth(334, String::new(), AuthContinuation::Plain);
            }
            let (code, message) = self.handle_plain_auth(&mut initial_response.into_bytes()).await;
            SessionReply::ReplyAndContinue(code, message)
        } else if mechanism == AUTH_LOGIN {
            if initial_response.is_empty() {
                let prompt = Base64::encode_string(b"Username:");
                SessionReply::IngestAuth(334, prompt, AuthContinuation::LoginUsername)
            } else {
                match decode_base64_utf8(initial_response.as_bytes()) {
                    Some(username) => {
                        let prompt = Base64::encode_string(b"Password:");
                        SessionReply::IngestAuth(334, prompt, AuthContinuation::LoginPassword { username })
                    }
                    None => SessionReply::ReplyAndContinue(501, Self::RESPONSE_SYNTAX_ERROR.into()),
                }
            }
        } else if mechanism == AUTH_CRAM_MD5 {
            let mut nonce = [0u8; 8];
            OsRng.fill_bytes(&mut nonce);
            let challenge = format!(
                "<{}.{}@{}>",
                hex::encode(nonce),
                Utc::now().timestamp(),
                self.config.server_hostname
            );
            let prompt = Base64::encode_string(challenge.as_bytes());
            SessionReply::IngestAuth(334, prompt, AuthContinuation::CramMd5 { challenge })
        } else {
            SessionReply::ReplyAndContinue(504, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
        }
    }

    async fn handle_rcpt(&mut self, address: &str) -> SessionReply {
        let Ok(to_address) = address.parse::<EmailAddress>() else {
            return SessionReply::ReplyAndContinue(553, Self::RESPONSE_INVALID_EMAIL.into());
        };

        if self.tx.is_none() {
            return SessionReply::ReplyAndContinue(503, Self::RESPONSE_MAIL_FIRST.into());
        }

        let recipient_domain = to_address.domain();
        let is_local = match self.domains.is_local_domain(recipient_domain).await {
            Ok(v) => v,
            Err(e) => {
                warn!("domain lookup failed: {e}");
                return SessionReply::ReplyAndContinue(451, "4.3.0 Temporary lookup failure".into());
            }
        };

        if self.config.enable_auth && !is_local && self.authenticated_user.is_none() {
            return SessionReply::ReplyAndContinue(530, "5.7.0 Authentication required".into());
        }

        if is_local {
            match self.users.find_by_identifier(to_address.as_str()).await {
                Ok(Some(_)) => {}
                Ok(None) => return SessionReply::ReplyAndContinue(550, "5.1.1 No such recipient".into()),
                Err(e) => {
                    warn!("recipient lookup failed: {e}");
                    return SessionReply::ReplyAndContinue(451, "4.3.0 Temporary lookup failure".into());
                }
            }
        }

        let identifier = self.rate_identifier();

        if self.rate_limiter.is_blocked(&identifier) {
            return SessionReply::ReplyAndContinue(550, "5.7.1 Sender blocked".into());
        }

        if !self.rate_limiter.allow_message_hourly(&identifier, self.config.max_messages_per_hour)
            || !self.rate_limiter.allow_message_daily(&identifier, self.config.max_messages_per_day)
        {
            return SessionReply::ReplyAndContinue(452, "4.5.3 Too many messages, try again later".into());
        }

        if self.config.enable_greylisting {
            let mail_from = self.tx.as_ref().expect("checked above").mail_from.clone();
            let delay = chrono::Duration::minutes(self.config.greylist_delay_minutes as i64);
            match self
                .greylist
                .check_and_record(&self.peer_ip.to_string(), &mail_from, to_address.as_str(), delay)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    return SessionReply::ReplyAndContinue(451, "4.7.1 Greylisted, please try again later".into());
                }
                Err(e) => warn!("greylist check failed: {e}"),
            }
        }

        let tx = self.tx.as_mut().expect("checked above");
        if tx.rcpt_to.len() >= self.config.max_recipients_per_message {
            return SessionReply::ReplyAndContinue(452, "4.5.3 Too many recipients".into());
        }
        tx.rcpt_to.push(to_address.to_string());

        let response_message = Self::RESPONSE_TO_OK.replace("[email]", address);
        SessionReply::ReplyAndContinue(250, response_message)
    }

    fn decode_plain_auth(data: &mut [u8]) -> Result<AttemptedAuth, AttemptedAuthError> {
        let ascii_len = data.trim_ascii_end().len();
        let data = &mut data[..ascii_len];

        let Ok(decoded) = base64ct::Base64::decode_in_place(data) else {
            return Err(AttemptedAuthError::SyntaxError);
        };

        let mut parts = decoded.split(|&b| b == 0);

        let Some(authcid) = parts.next() else {
            return Err(AttemptedAuthError::SyntaxError);
        };
        if authcid != b"" {
            trace!(
                "ignoring authentication identity (authcid): {}",
                String::from_utf8_lossy(authcid)
            );
        }
        let username = parts.next().ok_or(AttemptedAuthError::SyntaxError)?;
        let password = parts.next().ok_or(AttemptedAuthError::SyntaxError)?;
        if parts.count() != 0 {
            return Err(AttemptedAuthError::SyntaxError);
        }

        let username = std::str::from_utf8(username).map_err(|_| AttemptedAuthError::Utf8Error)?;
        let password = std::str::from_utf8(password).map_err(|_| AttemptedAuthError::Utf8Error)?;

        Ok(AttemptedAuth { username, password })
    }

    pub(super) async fn handle_plain_auth(&mut self, data: &mut [u8]) -> (u16, String) {
        let Ok(AttemptedAuth { username, password }) = Self::decode_plain_auth(data) else {
            return (501, Self::RESPONSE_SYNTAX_ERROR.into());
        };
        self.finish_password_auth(username.to_owned(), password.to_owned(), "PLAIN").await
    }

    pub(super) async fn handle_login_username(&mut self, data: &[u8]) -> SessionReply {
        match decode_base64_utf8(data) {
            Some(username) => {
                let prompt = Base64::encode_string(b"Password:");
                SessionReply::IngestAuth(334, prompt, AuthContinuation::LoginPassword { username })
            }
            None => SessionReply::ReplyAndContinue(501, Self::RESPONSE_SYNTAX_ERROR.into()),
        }
    }

    pub(super) async fn handle_login_password(&mut self, username: &str, data: &[u8]) -> (u16, String) {
        match decode_base64_utf8(data) {
            Some(password) => self.finish_password_auth(username.to_owned(), password, "LOGIN").await,
            None => (501, Self::RESPONSE_SYNTAX_ERROR.into()),
        }
    }

    pub(super) async fn handle_cram_md5_response(&mut self, challenge: &str, data: &[u8]) -> (u16, String) {
        let response = String::from_utf8_lossy(data).into_owned();
        match auth::authenticate_cram_md5(&self.users, challenge, &response).await {
            Ok(user) => {
                let username = user.username.clone();
                self.record_auth(Some(&user), &username, "CRAM-MD5", true, None).await;
                self.authenticated_user = Some(user);
                (235, Self::RESPONSE_AUTH_SUCCCESS.into())
            }
            Err(e) => {
                self.auth_failures += 1;
                let identifier = response.split_whitespace().next().unwrap_or("").to_owned();
                let reply = Self::auth_failure_reply(&e);
                self.record_auth(None, &identifier, "CRAM-MD5", false, Some(&e.to_string())).await;
                reply
            }
        }
    }

    async fn finish_password_auth(&mut self, username: String, password: String, method: &str) -> (u16, String) {
        match auth::authenticate_password(&self.users, &username, &password).await {
            Ok(user) => {
                self.record_auth(Some(&user), &username, method, true, None).await;
                self.authenticated_user = Some(user);
                (235, Self::RESPONSE_AUTH_SUCCCESS.into())
            }
            Err(e) => {
                self.auth_failures += 1;
                let reply = Self::auth_failure_reply(&e);
                self.record_auth(None, &username, method, false, Some(&e.to_string())).await;
                reply
            }
        }
    }

    fn auth_failure_reply(err: &AuthError) -> (u16, String) {
        match err {
            AuthError::Locked => (535, "5.7.8 Account locked".into()),
            _ => (535, Self::RESPONSE_AUTH_ERROR.into()),
        }
    }

    async fn record_auth(&self, user: Option<&User>, identifier: &str, method: &str, success: bool, reason: Option<&str>) {
        let user_id = user.map(|u| u.id);
        if let Err(e) = self
            .auth_log
            .record(user_id, identifier, &self.peer_ip.to_string(), method, success, reason)
            .await
        {
            warn!("failed to record authentication attempt: {e}");
        }
    }

    pub async fn handle_data(&mut self, data: &[u8]) -> DataReply {
        let Some(tx) = self.tx.as_mut() else {
            return DataReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
        };

        tx.raw_data.extend_from_slice(data);

        if tx.raw_data.len() as u64 > self.config.max_message_size {
            self.tx = None;
            return DataReply::ReplyAndContinue(552, "5.3.4 Message size exceeds fixed maximum message size".into());
        }

        const DATA_END: &[u8] = b"\r\n.\r\n";
        if !(tx.raw_data.ends_with(DATA_END) || tx.raw_data.as_slice() == &DATA_END[2..]) {
            return DataReply::ContinueIngest;
        }

        let mut tx = self.tx.take().expect("checked above");
        tx.raw_data.truncate(tx.raw_data.len() - DATA_END.len());

        match self.finish_message(tx).await {
            Ok(()) => DataReply::ReplyAndContinue(250, Self::RESPONSE_MESSAGE_ACCEPTED.into()),
            Err((code, message)) => DataReply::ReplyAndContinue(code, message),
        }
    }

    async fn finish_message(&mut self, tx: Transaction) -> Result<(), (u16, String)> {
        let parsed = mail_parser::MessageParser::default().parse(&tx.raw_data);

        let subject = parsed.as_ref().and_then(|m| m.subject()).unwrap_or("").to_owned();
        let has_message_id = parsed.as_ref().and_then(|m| m.message_id()).is_some();
        let from_header_count = parsed
            .as_ref()
            .and_then(|m| m.from())
            .map(|addr| addr.iter().count())
            .unwrap_or(0);
        let body_text = parsed
            .as_ref()
            .and_then(|m| m.body_text(0))
            .map(|c| c.into_owned())
            .unwrap_or_default();
        let body_html = parsed
            .as_ref()
            .and_then(|m| m.body_html(0))
            .map(|c| c.into_owned())
            .unwrap_or_default();

        let date_header = raw_header_value(&tx.raw_data, "Date");
        let received_headers = raw_header_values(&tx.raw_data, "Received");
        let text_part_is_base64 = parsed.as_ref().is_some_and(has_base64_text_part);

        let ctx = MessageContext {
            subject: &subject,
            has_message_id,
            date_header: date_header.as_deref(),
            from_header_count,
            received_headers: &received_headers,
            body_text: &body_text,
            body_html: &body_html,
            text_part_is_base64,
        };

        let (spam_score, triggered) = spamfilter::score(&ctx, self.peer_ip);
        if spam_score > 10.0 {
            debug!(?triggered, spam_score, "message rejected as spam");
            return Err((550, "5.7.1 Message rejected as spam".into()));
        }

        let sender_domain = tx.mail_from.rsplit('@').next().unwrap_or_default();

        let spf_outcome = if self.config.spf_checking {
            Some(
                self.resolver
                    .spf(self.peer_ip, &tx.mail_from, self.ehlo_host.as_deref().unwrap_or(""))
                    .await,
            )
        } else {
            None
        };

        if let Some(outcome) = &spf_outcome {
            let reject = matches!(
                (self.config.spf_failure_policy, outcome.result),
                (SpfFailurePolicy::Fail, SpfResult::Fail)
                    | (SpfFailurePolicy::SoftFail, SpfResult::Fail | SpfResult::SoftFail)
            );
            if reject {
                return Err((550, "5.7.1 SPF check failed".into()));
            }
        }

        let dkim_result = match self.resolver.dkim_public_key(&self.config.dkim_selector, sender_domain).await {
            Some(p) => match base64ct::Base64::decode_vec(&p) {
                Ok(der) => match dkim::verify(&tx.raw_data, &der) {
                    Ok(()) => Some("pass".to_owned()),
                    Err(_) => Some("fail".to_owned()),
                },
                Err(_) => Some("fail".to_owned()),
            },
            None => None,
        };

        let dmarc_record = if self.config.dmarc_checking {
            self.resolver.dmarc(sender_domain).await
        } else {
            None
        };

        if dmarc_record.is_some() {
            let spf_aligned = matches!(spf_outcome.as_ref().map(|o| o.result), Some(SpfResult::Pass));
            let dkim_aligned = dkim_result.as_deref() == Some("pass");
            let failed_alignment = !spf_aligned && !dkim_aligned;
            if failed_alignment && self.config.dmarc_failure_policy == DmarcPolicy::Reject {
                return Err((550, "5.7.1 Message failed DMARC policy".into()));
            }
        }

        let dmarc_result = dmarc_record.map(|r| r.policy);

        let message_id = raw_header_value(&tx.raw_data, "Message-ID")
            .unwrap_or_else(|| format!("<{}@{}>", uuid::Uuid::new_v4(), self.config.server_domain));

        let new_message = NewMessage {
            message_id,
            user_id: self.authenticated_user.as_ref().map(|u| u.id),
            mail_from: tx.mail_from.clone(),
            rcpt_to: tx.rcpt_to.clone(),
            headers: all_headers(&tx.raw_data),
            body_text: Some(body_text).filter(|s| !s.is_empty()),
            body_html: Some(body_html).filter(|s| !s.is_empty()),
            raw_message: tx.raw_data,
            remote_ip: Some(self.peer_ip.to_string()),
            spf_result: spf_outcome.map(|o| format!("{:?}", o.result).to_lowercase()),
            dkim_result,
            dmarc_result,
            spam_score: Some(spam_score),
        };

        match self.queue.enqueue(&new_message).await {
            Ok(_) => {
                if let Some(user) = &self.authenticated_user {
                    if let Err(e) = self.users.increment_message_count(user.id).await {
                        warn!("failed to increment message count: {e}");
                    }
                }
                Ok(())
            }
            Err(e) => {
                warn!("failed to enqueue message: {e}");
                Err((451, "4.3.0 Temporary failure, please try again later".into()))
            }
        }
    }
}

fn decode_base64_utf8(data: &[u8]) -> Option<String> {
    let decoded = Base64::decode_vec(&String::from_utf8_lossy(data)).ok()?;
    String::from_utf8(decoded).ok()
}

/// Base64-encoded `text/plain` content is never necessary and is a common
/// spam-filter evasion trick. Mirrors a MIME walk over every part looking
/// for `Content-Type: text/plain` paired with a base64 transfer encoding.
fn has_base64_text_part(message: &mail_parser::Message) -> bool {
    message.parts.iter().any(|part| {
        let is_text_plain = part
            .content_type()
            .is_some_and(|ct| ct.ctype().eq_ignore_ascii_case("text") && ct.subtype().is_some_and(|s| s.eq_ignore_ascii_case("plain")));
        is_text_plain
            && part
                .content_transfer_encoding()
                .is_some_and(|enc| enc.eq_ignore_ascii_case("base64"))
    })
}

fn header_block(raw: &[u8]) -> &[u8] {
    match raw.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => &raw[..pos],
        None => raw,
    }
}

/// Every occurrence of `name` in the header block, continuation lines
/// folded in, in header order.
fn raw_header_values(raw: &[u8], name: &str) -> Vec<String> {
    let text = String::from_utf8_lossy(header_block(raw));
    let mut values = Vec::new();
    let mut current: Option<String> = None;

    for line in text.split("\r\n") {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(c) = current.as_mut() {
                c.push(' ');
                c.push_str(line.trim());
            }
            continue;
        }
        if let Some(c) = current.take() {
            values.push(c);
        }
        if let Some((n, v)) = line.split_once(':') {
            if n.trim().eq_ignore_ascii_case(name) {
                current = Some(v.trim().to_owned());
            }
        }
    }
    if let Some(c) = current {
        values.push(c);
    }
    values
}

fn raw_header_value(raw: &[u8], name: &str) -> Option<String> {
    raw_header_values(raw, name).into_iter().next()
}

fn all_headers(raw: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(header_block(raw));
    let mut map = HashMap::new();
    for line in text.split("\r\n") {
        if line.is_empty() || line.starts_with(' ') || line.starts_with('\t') {
            continue;
        }
        if let Some((n, v)) = line.split_once(':') {
            map.insert(n.trim().to_owned(), v.trim().to_owned());
        }
    }
    map
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn raw_header_value_folds_continuations() {
        let raw = b"Subject: hello\r\n world\r\nFrom: a@b.com\r\n\r\nbody";
        assert_eq!(raw_header_value(raw, "subject").as_deref(), Some("hello world"));
        assert_eq!(raw_header_value(raw, "from").as_deref(), Some("a@b.com"));
        assert_eq!(raw_header_value(raw, "missing"), None);
    }

    #[test]
    fn raw_header_values_collects_all_occurrences() {
        let raw = b"Received: one\r\nReceived: two\r\n\r\nbody";
        assert_eq!(raw_header_values(raw, "Received"), vec!["one", "two"]);
    }

    #[test]
    fn all_headers_ignores_continuation_lines() {
        let raw = b"Subject: hi\r\n there\r\nTo: a@b.com\r\n\r\nbody";
        let headers = all_headers(raw);
        assert_eq!(headers.get("To").map(String::as_str), Some("a@b.com"));
        assert!(headers.contains_key("Subject"));
    }

    #[test]
    fn auth_failure_reply_surfaces_lockout() {
        let (code, reason) = SmtpSession::auth_failure_reply(&AuthError::Locked);
        assert_eq!(code, 535);
        assert!(reason.contains("Account locked"));
        let (code, _) = SmtpSession::auth_failure_reply(&AuthError::InvalidCredentials);
        assert_eq!(code, 535);
    }
}

//! DKIM signing, verification, and key generation.
//!
//! Signing keeps the teacher's shape (`mail_auth::dkim::DkimSigner` over an
//! `RsaKey<Sha256>`). Verification and key generation are net-new: the
//! teacher's `verify_dkim` only compares the DNS-published key against the
//! one on file, it never checks the signature cryptographically, which isn't
//! enough here, so verification is hand-rolled against `rsa`/`sha2` using
//! RFC 6376 relaxed/relaxed canonicalization.

use base64ct::{Base64, Encoding};
use mail_auth::common::{
    crypto::{RsaKey, Sha256 as MailAuthSha256},
    headers::HeaderWriter,
};
use rsa::{
    Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Headers covered by every signature, per the minimum list a signer must
/// cover.
const SIGNED_HEADERS: [&str; 6] = ["from", "to", "subject", "date", "message-id", "content-type"];

#[derive(Debug, Error)]
pub enum DkimError {
    #[error("signing failed: {0}")]
    Sign(String),
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    #[error("message has no DKIM-Signature header")]
    NoSignature,
    #[error("malformed DKIM-Signature header")]
    Malformed,
    #[error("body hash mismatch")]
    BodyHashMismatch,
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

pub struct DkimKeyPair {
    pub private_key_pem: String,
    /// DNS-ready public key, e.g. `v=DKIM1; k=rsa; p=<base64>`.
    pub public_key_dns: String,
}

/// Generates an RSA-2048 keypair: a PKCS#8 PEM private key, and a DNS TXT
/// record value carrying the SPKI public key.
pub fn generate_keypair() -> Result<DkimKeyPair, DkimError> {
    let mut rng = rand::rngs::OsRng;
    let private_key =
        RsaPrivateKey::new(&mut rng, 2048).map_err(|e| DkimError::Sign(e.to_string()))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| DkimError::Sign(e.to_string()))?
        .to_string();

    let spki_der = public_key
        .to_public_key_der()
        .map_err(|e| DkimError::Sign(e.to_string()))?;
    let p = Base64::encode_string(spki_der.as_bytes());

    Ok(DkimKeyPair {
        private_key_pem,
        public_key_dns: format!("v=DKIM1; k=rsa; p={p}"),
    })
}

/// Signs `raw_message` and returns the `DKIM-Signature` header prepended to
/// the original bytes (CRLF preserved), ready to hand to the delivery agent.
pub fn sign(
    raw_message: &[u8],
    domain: &str,
    selector: &str,
    private_key_pem: &str,
) -> Result<Vec<u8>, DkimError> {
    let sign_key = RsaKey::<MailAuthSha256>::from_pkcs8_pem(private_key_pem)
        .map_err(|e| DkimError::InvalidKey(e.to_string()))?;

    let parsed = mail_parser::MessageParser::default()
        .parse(raw_message)
        .ok_or_else(|| DkimError::Sign("failed to parse message for signing".into()))?;

    let signer = mail_auth::dkim::DkimSigner::from_key(sign_key)
        .domain(domain)
        .selector(selector)
        .headers(SIGNED_HEADERS);

    let signature = signer
        .sign(&parsed.raw_message)
        .map_err(|e| DkimError::Sign(e.to_string()))?;

    let mut signed = signature.to_header().into_bytes();
    signed.extend_from_slice(raw_message);
    Ok(signed)
}

struct ParsedHeader {
    name: String,
    raw_value: String,
}

fn split_message(raw: &[u8]) -> (&[u8], &[u8]) {
    match raw.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => (&raw[..pos], &raw[pos + 4..]),
        None => (raw, &[]),
    }
}

fn parse_headers(header_block: &[u8]) -> Vec<ParsedHeader> {
    let text = String::from_utf8_lossy(header_block);
    let mut headers: Vec<ParsedHeader> = Vec::new();

    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = headers.last_mut() {
                last.raw_value.push(' ');
                last.raw_value.push_str(line.trim_start());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push(ParsedHeader {
                name: name.trim().to_owned(),
                raw_value: value.to_owned(),
            });
        }
    }

    headers
}

fn collapse_wsp(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = false;
    for c in s.chars() {
        if c == ' ' || c == '\t' {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

fn canon_header_relaxed(name: &str, raw_value: &str) -> String {
    format!(
        "{}:{}\r\n",
        name.to_ascii_lowercase(),
        collapse_wsp(raw_value.trim())
    )
}

fn canon_body_relaxed(body: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(body);
    let mut lines: Vec<String> = text
        .split("\r\n")
        .map(|l| collapse_wsp(l).trim_end_matches(' ').to_owned())
        .collect();

    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    if lines.is_empty() {
        return Vec::new();
    }

    let mut out = lines.join("\r\n");
    out.push_str("\r\n");
    out.into_bytes()
}

struct DkimTags {
    algorithm: String,
    signed_headers: Vec<String>,
    body_hash: String,
    signature: String,
    raw_value: String,
}

fn parse_dkim_signature(raw_value: &str) -> Result<DkimTags, DkimError> {
    let mut algorithm = None;
    let mut signed_headers = None;
    let mut body_hash = None;
    let mut signature = None;

    for tag in raw_value.split(';') {
        let Some((key, value)) = tag.trim().split_once('=') else {
            continue;
        };
        match key.trim() {
            "a" => algorithm = Some(value.trim().to_owned()),
            "h" => {
                signed_headers = Some(
                    value
                        .split(':')
                        .map(|h| h.trim().to_ascii_lowercase())
                        .collect(),
                )
            }
            "bh" => body_hash = Some(collapse_wsp(value.trim()).replace(' ', "")),
            "b" => signature = Some(collapse_wsp(value.trim()).replace(' ', "")),
            _ => {}
        }
    }

    Ok(DkimTags {
        algorithm: algorithm.ok_or(DkimError::Malformed)?,
        signed_headers: signed_headers.ok_or(DkimError::Malformed)?,
        body_hash: body_hash.ok_or(DkimError::Malformed)?,
        signature: signature.ok_or(DkimError::Malformed)?,
        raw_value: raw_value.to_owned(),
    })
}

/// Strips the `b=` tag's value, leaving `b=` itself, as required before
/// canonicalizing the `DKIM-Signature` header for its own hash input.
fn strip_b_tag(raw_value: &str) -> String {
    raw_value
        .split(';')
        .map(|tag| {
            let trimmed = tag.trim_start();
            if trimmed.to_ascii_lowercase().starts_with("b=") {
                let prefix_len = tag.len() - trimmed.len();
                format!("{}b=", &tag[..prefix_len])
            } else {
                tag.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Verifies `raw_message`'s `DKIM-Signature` header against `public_key_der`
/// (the SPKI DER bytes extracted from a DNS `p=` tag), per RFC 6376
/// relaxed/relaxed canonicalization and `rsa-sha256`.
pub fn verify(raw_message: &[u8], public_key_der: &[u8]) -> Result<(), DkimError> {
    let (header_block, body) = split_message(raw_message);
    let headers = parse_headers(header_block);

    let dkim_header = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("DKIM-Signature"))
        .ok_or(DkimError::NoSignature)?;

    let tags = parse_dkim_signature(&dkim_header.raw_value)?;
    if tags.algorithm != "rsa-sha256" {
        return Err(DkimError::UnsupportedAlgorithm(tags.algorithm));
    }

    let canonical_body = canon_body_relaxed(body);
    let body_hash = Base64::encode_string(&Sha256::digest(&canonical_body));
    if body_hash != tags.body_hash {
        return Err(DkimError::BodyHashMismatch);
    }

    let mut signed_data = String::new();
    for name in &tags.signed_headers {
        if let Some(header) = headers.iter().find(|h| h.name.eq_ignore_ascii_case(name)) {
            signed_data.push_str(&canon_header_relaxed(&header.name, &header.raw_value));
        }
    }
    // The DKIM-Signature header itself is included last, with its `b=`
    // value emptied, and without a trailing CRLF.
    let stripped_value = strip_b_tag(&tags.raw_value);
    let canon_self = canon_header_relaxed(&dkim_header.name, &stripped_value);
    signed_data.push_str(canon_self.trim_end_matches("\r\n"));

    let signature = Base64::decode_vec(&tags.signature).map_err(|_| DkimError::Malformed)?;

    let public_key =
        RsaPublicKey::from_public_key_der(public_key_der).map_err(|_| DkimError::Malformed)?;

    let digest = Sha256::digest(signed_data.as_bytes());
    public_key
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
        .map_err(|_| DkimError::SignatureInvalid)
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_message() -> Vec<u8> {
        b"From: alice@example.com\r\n\
To: bob@example.net\r\n\
Subject: hello\r\n\
Date: Tue, 01 Jan 2030 00:00:00 +0000\r\n\
Message-ID: <abc@example.com>\r\n\
Content-Type: text/plain\r\n\
\r\n\
Hello, world!\r\n"
            .to_vec()
    }

    fn der_from_dns(public_key_dns: &str) -> Vec<u8> {
        let p = public_key_dns
            .split(';')
            .find_map(|tag| tag.trim().strip_prefix("p="))
            .unwrap();
        Base64::decode_vec(p).unwrap()
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let keypair = generate_keypair().unwrap();
        let signed = sign(
            &sample_message(),
            "example.com",
            "selector1",
            &keypair.private_key_pem,
        )
        .unwrap();

        verify(&signed, &der_from_dns(&keypair.public_key_dns)).expect("signature should verify");
    }

    #[test]
    fn tampered_body_fails_verification() {
        let keypair = generate_keypair().unwrap();
        let mut signed = sign(
            &sample_message(),
            "example.com",
            "selector1",
            &keypair.private_key_pem,
        )
        .unwrap();

        let idx = signed.windows(5).rposition(|w| w == b"World").or_else(|| {
            signed.windows(5).rposition(|w| w == b"world")
        }).unwrap();
        signed[idx] = b'W';

        assert!(verify(&signed, &der_from_dns(&keypair.public_key_dns)).is_err());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let keypair = generate_keypair().unwrap();
        let other = generate_keypair().unwrap();
        let signed = sign(
            &sample_message(),
            "example.com",
            "selector1",
            &keypair.private_key_pem,
        )
        .unwrap();

        assert!(verify(&signed, &der_from_dns(&other.public_key_dns)).is_err());
    }
}

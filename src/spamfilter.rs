//! Deterministic additive spam scoring.
//!
//! No teacher equivalent exists; this is a straight port of the fourteen
//! scoring rules (and their weights) from the original `spam_filter.py`,
//! which this system's distillation requires without reproducing. The
//! spam-word list below is taken verbatim from that source. Two of the
//! original's rules (`no_reverse_dns`, `dynamic_ip`) always returned `False`
//! there regardless of input, so they contribute nothing and are omitted
//! here rather than ported as permanent no-ops.

use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;

pub const SPAM_WORDS: &[&str] = &[
    "viagra",
    "cialis",
    "pharmacy",
    "pills",
    "medication",
    "casino",
    "poker",
    "slots",
    "betting",
    "lottery",
    "weight loss",
    "lose weight",
    "diet pills",
    "make money",
    "work from home",
    "million dollars",
    "nigerian prince",
    "inheritance",
    "tax refund",
    "click here",
    "act now",
    "limited time",
    "urgent",
    "winner",
    "congratulations",
    "you won",
    "prize",
    "free",
    "guarantee",
    "no obligation",
    "risk free",
    "increase sales",
    "double your",
    "cheap",
    "bargain",
    "order now",
    "call now",
    "apply now",
    "subscribe",
    "unsubscribe",
    "remove",
    "opt out",
    "dear friend",
    "dear sir/madam",
];

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"{}|\\^`\[\]]+"#).unwrap());
static IMG_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<img\s+[^>]*>").unwrap());
static TAG_STRIP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static PRIVATE_IP_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(10\.|172\.1[6-9]\.|172\.2[0-9]\.|172\.3[01]\.|192\.168\.)").unwrap()
});

static HIDING_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)color:\s*#?ffffff",
        r"(?i)font-size:\s*[01]px",
        r"(?i)display:\s*none",
        r"(?i)visibility:\s*hidden",
        r"(?i)text-indent:\s*-\d+px",
    ]
    .into_iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// The header and body material a spam check needs, extracted by the
/// caller from a parsed message so this module stays independent of any
/// particular MIME parser's API.
#[derive(Debug, Default)]
pub struct MessageContext<'a> {
    pub subject: &'a str,
    pub has_message_id: bool,
    pub date_header: Option<&'a str>,
    pub from_header_count: usize,
    pub received_headers: &'a [String],
    pub body_text: &'a str,
    pub body_html: &'a str,
    pub text_part_is_base64: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub name: &'static str,
    pub weight: f64,
}

pub const RULES: &[Rule] = &[
    Rule { name: "subject_all_caps", weight: 3.0 },
    Rule { name: "subject_excessive_punctuation", weight: 2.0 },
    Rule { name: "subject_spam_words", weight: 2.5 },
    Rule { name: "body_spam_words", weight: 2.0 },
    Rule { name: "excessive_links", weight: 1.5 },
    Rule { name: "hidden_text", weight: 3.0 },
    Rule { name: "excessive_images", weight: 1.0 },
    Rule { name: "missing_message_id", weight: 1.0 },
    Rule { name: "invalid_date", weight: 2.0 },
    Rule { name: "multiple_from", weight: 3.0 },
    Rule { name: "forged_received", weight: 4.0 },
    Rule { name: "base64_encoded_text", weight: 1.5 },
    Rule { name: "no_text", weight: 1.0 },
    Rule { name: "mostly_html", weight: 0.5 },
];

pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

fn check_all_caps_subject(ctx: &MessageContext) -> bool {
    if ctx.subject.chars().count() <= 10 {
        return false;
    }
    let letters: Vec<char> = ctx.subject.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.is_empty() {
        return false;
    }
    let upper = letters.iter().filter(|c| c.is_uppercase()).count();
    (upper as f64 / letters.len() as f64) > 0.8
}

fn check_excessive_punctuation(ctx: &MessageContext) -> bool {
    let count = ctx.subject.matches('!').count()
        + ctx.subject.matches('?').count()
        + ctx.subject.matches('$').count();
    count > 3
}

fn check_spam_words_subject(ctx: &MessageContext) -> bool {
    let subject = ctx.subject.to_lowercase();
    let count = SPAM_WORDS.iter().filter(|w| subject.contains(*w)).count();
    count >= 2
}

fn check_spam_words_body(ctx: &MessageContext) -> bool {
    let body = ctx.body_text.to_lowercase();
    if body.len() < 50 {
        return false;
    }
    let spam_count = SPAM_WORDS.iter().filter(|w| body.contains(*w)).count();
    let word_count = body.split_whitespace().count();
    if word_count == 0 {
        return false;
    }
    (spam_count as f64 / word_count as f64) > 0.05
}

fn check_excessive_links(ctx: &MessageContext) -> bool {
    let word_count = ctx.body_text.split_whitespace().count();
    if word_count == 0 {
        return false;
    }
    let urls = URL_RE.find_iter(ctx.body_text).count();
    (urls as f64 / word_count as f64) > 0.1
}

fn check_hidden_text(ctx: &MessageContext) -> bool {
    if ctx.body_html.is_empty() {
        return false;
    }
    HIDING_PATTERNS.iter().any(|re| re.is_match(ctx.body_html))
}

fn check_excessive_images(ctx: &MessageContext) -> bool {
    if ctx.body_html.is_empty() {
        return false;
    }
    let img_count = IMG_TAG_RE.find_iter(ctx.body_html).count();
    let text_length = TAG_STRIP_RE.replace_all(ctx.body_html, " ").len();
    if text_length < 100 && img_count > 2 {
        return true;
    }
    img_count > 10
}

fn check_missing_message_id(ctx: &MessageContext) -> bool {
    !ctx.has_message_id
}

fn check_invalid_date(ctx: &MessageContext) -> bool {
    match ctx.date_header {
        None => true,
        Some(date) => !(date.contains("GMT") || date.contains("UTC") || date.contains('+')),
    }
}

fn check_multiple_from(ctx: &MessageContext) -> bool {
    ctx.from_header_count > 1
}

fn check_forged_received(ctx: &MessageContext, sender_ip: IpAddr) -> bool {
    if is_private_ip(sender_ip) {
        return false;
    }
    ctx.received_headers
        .iter()
        .any(|h| PRIVATE_IP_HEADER_RE.is_match(h))
}

fn check_base64_text(ctx: &MessageContext) -> bool {
    ctx.text_part_is_base64
}

fn check_no_text(ctx: &MessageContext) -> bool {
    ctx.body_text.trim().chars().count() < 10
}

fn check_mostly_html(ctx: &MessageContext) -> bool {
    !ctx.body_html.is_empty() && ctx.body_text.is_empty()
}

/// Scores a message against every rule, returning the total weighted score
/// and the names of rules that fired.
pub fn score(ctx: &MessageContext, sender_ip: IpAddr) -> (f64, Vec<&'static str>) {
    let checks: [(&'static str, bool); 14] = [
        ("subject_all_caps", check_all_caps_subject(ctx)),
        ("subject_excessive_punctuation", check_excessive_punctuation(ctx)),
        ("subject_spam_words", check_spam_words_subject(ctx)),
        ("body_spam_words", check_spam_words_body(ctx)),
        ("excessive_links", check_excessive_links(ctx)),
        ("hidden_text", check_hidden_text(ctx)),
        ("excessive_images", check_excessive_images(ctx)),
        ("missing_message_id", check_missing_message_id(ctx)),
        ("invalid_date", check_invalid_date(ctx)),
        ("multiple_from", check_multiple_from(ctx)),
        ("forged_received", check_forged_received(ctx, sender_ip)),
        ("base64_encoded_text", check_base64_text(ctx)),
        ("no_text", check_no_text(ctx)),
        ("mostly_html", check_mostly_html(ctx)),
    ];

    let mut total = 0.0;
    let mut triggered = Vec::new();
    for (name, fired) in checks {
        if fired {
            let rule = RULES.iter().find(|r| r.name == name).expect("rule table is exhaustive");
            total += rule.weight;
            triggered.push(name);
        }
    }

    (total, triggered)
}

#[cfg(test)]
mod test {
    use super::*;

    fn ctx<'a>() -> MessageContext<'a> {
        MessageContext {
            subject: "hello there",
            has_message_id: true,
            date_header: Some("Tue, 01 Jan 2030 00:00:00 GMT"),
            from_header_count: 1,
            received_headers: &[],
            body_text: "a perfectly ordinary message body with enough words in it to pass checks",
            body_html: "",
            text_part_is_base64: false,
        }
    }

    #[test]
    fn clean_message_scores_zero() {
        let (total, triggered) = score(&ctx(), "203.0.113.10".parse().unwrap());
        assert_eq!(total, 0.0);
        assert!(triggered.is_empty());
    }

    #[test]
    fn all_caps_subject_triggers() {
        let mut c = ctx();
        c.subject = "BUY NOW LIMITED OFFER";
        let (total, triggered) = score(&c, "203.0.113.10".parse().unwrap());
        assert!(triggered.contains(&"subject_all_caps"));
        assert!(total >= 3.0);
    }

    #[test]
    fn spam_words_in_subject_require_two_hits() {
        let mut c = ctx();
        c.subject = "free lottery winner announcement";
        let (_, triggered) = score(&c, "203.0.113.10".parse().unwrap());
        assert!(triggered.contains(&"subject_spam_words"));
    }

    #[test]
    fn missing_message_id_triggers() {
        let mut c = ctx();
        c.has_message_id = false;
        let (_, triggered) = score(&c, "203.0.113.10".parse().unwrap());
        assert!(triggered.contains(&"missing_message_id"));
    }

    #[test]
    fn hidden_text_patterns_are_detected() {
        let mut c = ctx();
        c.body_html = "<div style=\"display: none\">hidden</div>";
        let (_, triggered) = score(&c, "203.0.113.10".parse().unwrap());
        assert!(triggered.contains(&"hidden_text"));
    }

    #[test]
    fn forged_received_ignored_for_private_sender() {
        let mut c = ctx();
        c.received_headers = &["from internal (192.168.1.5) by mail".to_string()];
        let (_, triggered) = score(&c, "192.168.1.5".parse().unwrap());
        assert!(!triggered.contains(&"forged_received"));
    }

    #[test]
    fn forged_received_flagged_for_external_sender() {
        let mut c = ctx();
        c.received_headers = &["from spoofed (192.168.1.5) by mail".to_string()];
        let (_, triggered) = score(&c, "203.0.113.10".parse().unwrap());
        assert!(triggered.contains(&"forged_received"));
    }

    #[test]
    fn mostly_html_without_text_triggers() {
        let mut c = ctx();
        c.body_text = "";
        c.body_html = "<p>all html</p>";
        let (_, triggered) = score(&c, "203.0.113.10".parse().unwrap());
        assert!(triggered.contains(&"mostly_html"));
        assert!(triggered.contains(&"no_text"));
    }
}

//! Mailbox address validation and local domain/mailbox policy checks.

use std::fmt;

use crate::command::clean_line;

/// A validated, lower-cased mail address split into its two halves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAddress {
    pub mailbox: String,
    pub domain: String,
}

impl fmt::Display for MailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.mailbox, self.domain)
    }
}

/// Validates a raw address token, which may be wrapped in angle brackets.
/// Returns the normalized mailbox/domain pair, or `None` when any syntax
/// rule fails.
pub fn validate(raw: &str) -> Option<MailAddress> {
    let mut email = clean_line(raw).to_lowercase();

    if email.is_empty() || !email.contains('@') || !email.contains('.') {
        return None;
    }

    // angle brackets must balance and leave something inside
    if email.starts_with('<') {
        if !email.ends_with('>') {
            return None;
        }
        email = clean_line(&email.replace(['<', '>'], " "));
        if email.is_empty() {
            return None;
        }
    }

    if email.contains(' ') {
        return None;
    }

    let (mailbox, domain) = email.split_once('@')?;
    if mailbox.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }

    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return None;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return None;
    }
    for label in &labels {
        if label.is_empty() || label.starts_with('-') {
            return None;
        }
    }
    if labels[labels.len() - 1].len() < 2 {
        return None;
    }

    Some(MailAddress {
        mailbox: mailbox.to_string(),
        domain: domain.to_string(),
    })
}

/// Checks a domain against the configured local domains. An empty
/// configuration means every domain is accepted.
pub fn is_local_domain(domain: &str, local_domains: &[String]) -> bool {
    if local_domains.is_empty() {
        return true;
    }
    local_domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
}

/// Checks a mailbox against the configured local mailboxes. An empty
/// configuration means every mailbox is accepted.
pub fn is_local_mailbox(addr: &MailAddress, local_mailboxes: &[String]) -> bool {
    if local_mailboxes.is_empty() {
        return true;
    }
    let full = addr.to_string();
    local_mailboxes.iter().any(|b| b.eq_ignore_ascii_case(&full))
}

//! Persists captured messages: synthesized envelope headers followed by
//! the raw body, one plain-text file per message.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::reputation::DnsListHit;

const DATE_FMT: &str = "%Y-%m-%d %H:%M:%SZ";

/// Envelope data written as `X-FakeSMTP-*` headers ahead of the body.
pub struct Envelope<'a> {
    pub host_name: &'a str,
    pub session_ordinal: i64,
    pub session_id: &'a str,
    pub msg_count: u64,
    pub start_time: DateTime<Utc>,
    pub client_ip: &'a str,
    pub dns_hit: Option<&'a DnsListHit>,
    pub helo: Option<&'a str>,
    pub mail_from: Option<&'a str>,
    pub rcpt_to: &'a [String],
    pub noop_count: u32,
    pub vrfy_count: u32,
    pub error_count: u32,
}

pub struct MailStore {
    store_path: PathBuf,
}

impl MailStore {
    pub fn new(store_path: PathBuf) -> Self {
        Self { store_path }
    }

    /// Renders the complete artifact text.
    pub fn render(envelope: &Envelope<'_>, body: &str) -> String {
        let mut out = String::with_capacity(body.len() + 512);
        out.push_str(&format!("X-FakeSMTP-HostName: {}\r\n", envelope.host_name));
        out.push_str(&format!(
            "X-FakeSMTP-Sessions: count={}, id={}\r\n",
            envelope.session_ordinal, envelope.session_id
        ));
        out.push_str(&format!("X-FakeSMTP-MsgCount: {}\r\n", envelope.msg_count));
        out.push_str(&format!(
            "X-FakeSMTP-SessDate: {}\r\n",
            envelope.start_time.format(DATE_FMT)
        ));
        out.push_str(&format!("X-FakeSMTP-ClientIP: {}\r\n", envelope.client_ip));
        match envelope.dns_hit {
            Some(hit) => out.push_str(&format!(
                "X-FakeSMTP-DnsList: type={}, list={}, result={}\r\n",
                hit.list_type, hit.list_name, hit.value
            )),
            None => out.push_str(
                "X-FakeSMTP-DnsList: type=notlisted, list=none, result=0.0.0.0\r\n",
            ),
        }
        out.push_str(&format!(
            "X-FakeSMTP-Helo: {}\r\n",
            envelope.helo.unwrap_or_default()
        ));
        out.push_str(&format!(
            "X-FakeSMTP-MailFrom: {}\r\n",
            envelope.mail_from.unwrap_or_default()
        ));
        out.push_str(&format!(
            "X-FakeSMTP-RcptCount: {}\r\n",
            envelope.rcpt_to.len()
        ));
        for (i, rcpt) in envelope.rcpt_to.iter().enumerate() {
            out.push_str(&format!("X-FakeSMTP-RcptTo-{}: {}\r\n", i + 1, rcpt));
        }
        out.push_str(&format!(
            "X-FakeSMTP-Counters: noop={}, vrfy={}, err={}\r\n",
            envelope.noop_count, envelope.vrfy_count, envelope.error_count
        ));
        out.push_str(body);
        out
    }

    /// Writes the artifact and returns its file name.
    pub async fn store(&self, envelope: &Envelope<'_>, body: &str) -> Result<String> {
        let file_name = format!(
            "mailmsg-{}-{}.txt",
            envelope.session_id, envelope.msg_count
        );
        let path = self.store_path.join(&file_name);
        tokio::fs::write(&path, Self::render(envelope, body))
            .await
            .with_context(|| format!("Failed to write message file: {:?}", path))?;
        Ok(file_name)
    }
}

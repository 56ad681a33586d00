//! Command line options covering the whole configuration surface.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use structopt::StructOpt;

use crate::limits::Limits;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "fakesmtp",
    about = "Fakes a full blown SMTP server, useful to test mail sending apps or as a nolisting MX"
)]
pub struct Opt {
    /// Listening address
    #[structopt(short = "a", long = "address", default_value = "127.0.0.1")]
    pub address: String,

    /// Listening port
    #[structopt(short = "p", long = "port", default_value = "25")]
    pub port: u16,

    /// Receive timeout in milliseconds, 0 disables the timeout
    #[structopt(long = "timeout", default_value = "30000")]
    pub timeout_ms: u64,

    /// Host name used in the banner
    #[structopt(long = "hostname", default_value = "localhost")]
    pub hostname: String,

    /// Terminate mail transactions with a 421 tempfail
    #[structopt(long = "tempfail")]
    pub tempfail: bool,

    /// Store received messages to files
    #[structopt(long = "store-data")]
    pub store_data: bool,

    /// Max size in bytes for a stored message
    #[structopt(long = "max-data-size", default_value = "2097152")]
    pub max_data_size: usize,

    /// Max messages accepted in a single session
    #[structopt(long = "max-messages", default_value = "10")]
    pub max_messages: u64,

    /// Directory for stored messages
    #[structopt(long = "store-path", parse(from_os_str), default_value = "/tmp")]
    pub store_path: PathBuf,

    /// Max parallel sessions, further connections get a 421
    #[structopt(long = "max-sessions", default_value = "16")]
    pub max_sessions: i64,

    /// Log file for operational messages
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Log file for per-transaction session records
    #[structopt(long = "session-log", parse(from_os_str))]
    pub session_log: Option<PathBuf>,

    /// Verbose logging, traces every command and response
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Enable early talker detection
    #[structopt(long = "early-talkers")]
    pub early_talkers: bool,

    /// DNS whitelist provider (can be specified multiple times)
    #[structopt(long = "whitelist", number_of_values = 1)]
    pub whitelists: Vec<String>,

    /// DNS blacklist provider (can be specified multiple times)
    #[structopt(long = "blacklist", number_of_values = 1)]
    pub blacklists: Vec<String>,

    /// Max SMTP errors for a session
    #[structopt(long = "max-errors", default_value = "5")]
    pub max_errors: u32,

    /// Max NOOP commands for a session
    #[structopt(long = "max-noop", default_value = "7")]
    pub max_noop: u32,

    /// Max VRFY/EXPN commands for a session
    #[structopt(long = "max-vrfy", default_value = "10")]
    pub max_vrfy: u32,

    /// Max recipients for a single message
    #[structopt(long = "max-rcpt", default_value = "100")]
    pub max_rcpt: usize,

    /// Delay in milliseconds before emitting the banner
    #[structopt(long = "banner-delay", default_value = "0")]
    pub banner_delay: u64,

    /// Per-error delay in milliseconds for tarpitting bad clients
    #[structopt(long = "error-delay", default_value = "0")]
    pub error_delay: u64,

    /// Locally handled domain (can be specified multiple times, empty accepts any)
    #[structopt(long = "local-domain", number_of_values = 1)]
    pub local_domains: Vec<String>,

    /// Locally handled mailbox (can be specified multiple times, empty accepts any)
    #[structopt(long = "local-mailbox", number_of_values = 1)]
    pub local_mailboxes: Vec<String>,

    /// File with locally handled domains, one per line
    #[structopt(long = "local-domains-file", parse(from_os_str))]
    pub local_domains_file: Option<PathBuf>,

    /// File with locally handled mailboxes, one per line
    #[structopt(long = "local-mailboxes-file", parse(from_os_str))]
    pub local_mailboxes_file: Option<PathBuf>,
}

impl Opt {
    pub fn limits(&self) -> Limits {
        Limits {
            max_messages: self.max_messages,
            max_errors: self.max_errors,
            max_vrfy: self.max_vrfy,
            max_noop: self.max_noop,
            max_rcpt: self.max_rcpt,
        }
    }

    /// Extends the domain/mailbox lists from the optional list files.
    pub fn load_list_files(&mut self) -> Result<()> {
        if let Some(path) = self.local_domains_file.clone() {
            self.local_domains.extend(load_list(&path)?);
        }
        if let Some(path) = self.local_mailboxes_file.clone() {
            self.local_mailboxes.extend(load_list(&path)?);
        }
        Ok(())
    }
}

/// Loads a plain-text list file, skipping blank lines and `#` comments.
pub fn load_list(path: &Path) -> Result<Vec<String>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open list file: {:?}", path))?;
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("Failed to read list file: {:?}", path))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        lines.push(line.to_string());
    }
    Ok(lines)
}

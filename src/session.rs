//! Per-connection SMTP session engine: command state machine, policy
//! enforcement, tarpitting and DATA capture. One session owns its socket
//! for its whole lifetime and shares nothing with other sessions except
//! the registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time;

use crate::address;
use crate::command::{self, Command};
use crate::config::Opt;
use crate::limits::{SessionCounters, ETALKER_MSG};
use crate::logger::Logger;
use crate::registry::{Admission, SessionRegistry};
use crate::reputation::{DnsListHit, ReputationChecker};
use crate::store::{Envelope, MailStore};

pub const TEMPFAIL_MSG: &str =
    "421 Service temporarily unavailable, closing transmission channel.";
const TIMEOUT_MSG: &str = "442 Connection timed out.";

const DIR_TX: &str = "SND";
const DIR_RX: &str = "RCV";

// short pause before any reply that is not tarpitted
const RESPONSE_DELAY_MS: u64 = 25;

const DATE_FMT: &str = "%Y-%m-%d %H:%M:%SZ";

/// Result of one DATA capture.
enum CaptureOutcome {
    Complete(String),
    Oversized,
    TimedOut,
}

pub struct Session {
    opt: Arc<Opt>,
    reputation: Arc<ReputationChecker>,
    store: Arc<MailStore>,
    logger: Logger,
    admission: Admission,

    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,

    client_ip: String,
    start_time: DateTime<Utc>,

    helo: Option<String>,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
    msg_count: u64,
    last_logged_count: Option<u64>,
    msg_file: Option<String>,
    counters: SessionCounters,
    last_cmd: Command,
    dns_hit: Option<DnsListHit>,
    early_talker: bool,
}

impl Session {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        opt: Arc<Opt>,
        registry: &Arc<SessionRegistry>,
        reputation: Arc<ReputationChecker>,
        store: Arc<MailStore>,
        logger: Logger,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            opt,
            reputation,
            store,
            logger,
            admission: registry.admit(),
            reader: BufReader::new(read_half),
            writer: write_half,
            client_ip: peer.ip().to_string(),
            start_time: Utc::now(),
            helo: None,
            mail_from: None,
            rcpt_to: Vec::new(),
            msg_count: 0,
            last_logged_count: None,
            msg_file: None,
            counters: SessionCounters::default(),
            last_cmd: Command::Unknown,
            dns_hit: None,
            early_talker: false,
        }
    }

    /// Runs the session to completion and closes it. The admission slot
    /// is released exactly once when `self` drops.
    pub async fn run(mut self) {
        self.logger
            .log(&format!(
                "client {} connected, sess={}, ID={}.",
                self.client_ip, self.admission.ordinal, self.admission.id
            ))
            .await;
        self.handle().await;
        self.close().await;
    }

    async fn handle(&mut self) {
        // admission control
        if self.admission.ordinal > self.opt.max_sessions {
            self.send_line(TEMPFAIL_MSG).await;
            return;
        }

        // reputation: whitelist hits are recorded but never rejected; a
        // blacklist hit closes the session unless we are capturing data
        if let Some(hit) = self.reputation.check(&self.client_ip).await {
            let reject = hit.list_type == "black" && !self.opt.store_data;
            let list_name = hit.list_name.clone();
            self.dns_hit = Some(hit);
            if reject {
                let msg = format!(
                    "442 Connection from {} temporarily refused, host listed by {}",
                    self.client_ip, list_name
                );
                self.send_line(&msg).await;
                return;
            }
        }

        // banner delay, then check whether the client spoke too soon
        sleep_ms(self.opt.banner_delay).await;
        self.early_talker = self.is_early_talker().await;
        if self.early_talker {
            self.send_line(ETALKER_MSG).await;
            return;
        }

        let banner = self.banner();
        let mut conn_ok = self.send_line(&banner).await;
        let mut open = true;

        while open && conn_ok {
            let response: String;
            let mut curr;

            if self.last_cmd == Command::Data {
                curr = Command::Data;
                self.last_cmd = Command::Noop;
                match self.recv_data().await {
                    CaptureOutcome::TimedOut => {
                        self.send_line(TIMEOUT_MSG).await;
                        return;
                    }
                    CaptureOutcome::Oversized => {
                        response = "422 Recipient mailbox exceeded quota limit.".to_string();
                        self.reset_transaction().await;
                    }
                    CaptureOutcome::Complete(body) => {
                        self.store_message(&body).await;
                        if self.opt.tempfail {
                            // tempfail only after the mail data was captured
                            self.send_line(TEMPFAIL_MSG).await;
                            return;
                        }
                        response = "250 Queued mail for delivery".to_string();
                        self.reset_transaction().await;
                    }
                }
            } else {
                match self.recv_line().await {
                    Some(line) => {
                        self.logger
                            .log_proto(&self.client_ip, &self.admission.id, DIR_RX, &line)
                            .await;
                        curr = Command::from_line(&line);
                        if curr == Command::Data && self.opt.tempfail && !self.opt.store_data {
                            // not capturing: tempfail the DATA command itself
                            response = TEMPFAIL_MSG.to_string();
                            self.last_cmd = Command::Quit;
                            curr = Command::Quit;
                        } else {
                            response = self.dispatch(curr, &line).await;
                        }
                    }
                    None => {
                        response = TIMEOUT_MSG.to_string();
                        curr = Command::Quit;
                    }
                }
            }

            // tarpit a bad client, time increases with the error count
            if self.counters.errors > 0 && curr != Command::Quit {
                sleep_ms(
                    self.opt
                        .error_delay
                        .saturating_mul(self.counters.errors as u64),
                )
                .await;
            } else {
                sleep_ms(RESPONSE_DELAY_MS).await;
            }

            self.early_talker = self.is_early_talker().await;

            conn_ok = self.send_line(&response).await;

            // enforce hard limits after every response
            if curr != Command::Quit && conn_ok {
                let verdict = self.opt.limits().check(
                    &self.counters,
                    self.msg_count,
                    self.rcpt_to.len(),
                    self.early_talker,
                );
                if let Some(err_msg) = verdict {
                    conn_ok = self.send_line(err_msg).await;
                    open = false;
                }
            }

            if curr == Command::Quit {
                open = false;
            }
        }
    }

    async fn dispatch(&mut self, cmd: Command, line: &str) -> String {
        match cmd {
            Command::Helo | Command::Ehlo => self.cmd_helo(cmd, line),
            Command::MailFrom => self.cmd_mail(line),
            Command::RcptTo => self.cmd_rcpt(line),
            Command::Data => self.cmd_data(),
            Command::Rset => self.cmd_rset().await,
            Command::Quit => self.cmd_quit(),
            Command::Vrfy | Command::Expn => self.cmd_vrfy(cmd, line),
            Command::Help => self.cmd_help(),
            Command::Noop => self.cmd_noop(line),
            Command::Unknown => self.cmd_unknown(line),
        }
    }

    fn banner(&self) -> String {
        format!(
            "220 {} {} {}; {}",
            self.opt.hostname,
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT")
        )
    }

    fn cmd_helo(&mut self, cmd: Command, line: &str) -> String {
        let parsed = command::parse_line(cmd, line);
        let Some(arg) = parsed.arg else {
            self.counters.errors += 1;
            return format!("501 {} needs argument", parsed.verb);
        };
        if self.helo.is_some() {
            self.counters.errors += 1;
            return format!("503 you already sent {} ...", parsed.verb);
        }
        self.helo = Some(arg.clone());
        self.last_cmd = cmd;
        if cmd == Command::Helo {
            format!("250 Hello {} ([{}]), nice to meet you.", arg, self.client_ip)
        } else {
            format!(
                "250 Hello {} ([{}]), nice to meet you.\r\n250-HELP\r\n250-VRFY\r\n250-EXPN\r\n250 NOOP",
                arg, self.client_ip
            )
        }
    }

    fn cmd_mail(&mut self, line: &str) -> String {
        if self.helo.is_none() {
            self.counters.errors += 1;
            return "503 HELO/EHLO Command not issued".to_string();
        }
        if self.mail_from.is_some() {
            self.counters.errors += 1;
            return "503 Nested MAIL command".to_string();
        }
        let parsed = command::parse_line(Command::MailFrom, line);
        let Some(arg) = parsed.arg else {
            self.counters.errors += 1;
            return format!("501 {} needs argument", parsed.verb);
        };
        let Some(addr) = address::validate(&arg) else {
            self.counters.errors += 1;
            return format!("553 Invalid address {}", arg);
        };
        let addr = addr.to_string();
        self.mail_from = Some(addr.clone());
        self.last_cmd = Command::MailFrom;
        format!("250 {}... Sender ok", addr)
    }

    fn cmd_rcpt(&mut self, line: &str) -> String {
        if self.mail_from.is_none() {
            self.counters.errors += 1;
            return "503 Need MAIL before RCPT".to_string();
        }
        let parsed = command::parse_line(Command::RcptTo, line);
        let Some(arg) = parsed.arg else {
            self.counters.errors += 1;
            return format!("501 {} needs argument", parsed.verb);
        };
        let Some(addr) = address::validate(&arg) else {
            self.counters.errors += 1;
            return format!("553 Invalid address {}", arg);
        };
        if !address::is_local_domain(&addr.domain, &self.opt.local_domains) {
            self.counters.errors += 1;
            return "530 Relaying not allowed for policy reasons".to_string();
        }
        if !address::is_local_mailbox(&addr, &self.opt.local_mailboxes) {
            self.counters.errors += 1;
            return format!("553 Unknown email address {}", addr);
        }
        let addr = addr.to_string();
        self.rcpt_to.push(addr.clone());
        self.last_cmd = Command::RcptTo;
        format!("250 {}... Recipient ok", addr)
    }

    fn cmd_data(&mut self) -> String {
        if self.rcpt_to.is_empty() {
            self.counters.errors += 1;
            return "471 Bad or missing RCPT command".to_string();
        }
        self.last_cmd = Command::Data;
        "354 Start mail input; end with <CRLF>.<CRLF>".to_string()
    }

    async fn cmd_rset(&mut self) -> String {
        self.reset_transaction().await;
        self.last_cmd = Command::Rset;
        "250 Reset Ok".to_string()
    }

    fn cmd_quit(&mut self) -> String {
        self.last_cmd = Command::Quit;
        "221 Closing connection.".to_string()
    }

    fn cmd_vrfy(&mut self, cmd: Command, line: &str) -> String {
        self.counters.vrfy += 1;
        let parsed = command::parse_line(cmd, line);
        let Some(arg) = parsed.arg else {
            self.counters.errors += 1;
            return format!("501 {} needs argument", parsed.verb);
        };
        let Some(addr) = address::validate(&arg) else {
            self.counters.errors += 1;
            return format!("553 Invalid address {}", arg);
        };
        self.last_cmd = cmd;
        if cmd == Command::Vrfy {
            // never confirm nor deny an address
            "252 Cannot VRFY user; try RCPT to attempt delivery (or try finger)".to_string()
        } else {
            format!("250 {}", addr)
        }
    }

    fn cmd_noop(&mut self, line: &str) -> String {
        self.counters.noop += 1;
        let parsed = command::parse_line(Command::Noop, line);
        match parsed.arg {
            Some(arg) => format!("250 ({}) OK", arg),
            None => "250 OK".to_string(),
        }
    }

    fn cmd_help(&mut self) -> String {
        format!("211 {}", command::help_verbs())
    }

    fn cmd_unknown(&mut self, line: &str) -> String {
        self.counters.errors += 1;
        self.last_cmd = Command::Unknown;
        let cleaned = command::clean_line(line);
        if cleaned.is_empty() {
            "500 Command unrecognized".to_string()
        } else {
            format!("500 Command unrecognized ({})", cleaned)
        }
    }

    /// Reads body lines until a lone `.`. When storing, lines accumulate
    /// up to the configured cap; past it they are discarded but reading
    /// continues until the terminator.
    async fn recv_data(&mut self) -> CaptureOutcome {
        let mut buff = String::new();
        let mut above_max = false;
        let mut terminated = false;
        loop {
            let Some(line) = self.recv_line().await else {
                break;
            };
            if self.opt.store_data && !above_max {
                if buff.len() < self.opt.max_data_size {
                    buff.push_str(&line);
                    buff.push_str("\r\n");
                } else {
                    above_max = true;
                }
            }
            if line == "." {
                terminated = true;
                break;
            }
        }
        // a capture that never saw the terminator (timeout or peer gone)
        // must not pass for a complete message
        if !terminated {
            return CaptureOutcome::TimedOut;
        }
        if above_max {
            return CaptureOutcome::Oversized;
        }
        CaptureOutcome::Complete(buff)
    }

    /// Bumps the message counter and, when storage is enabled, writes the
    /// artifact. Write failures stay local: the artifact id becomes
    /// `write_error` and the client is not told.
    async fn store_message(&mut self, body: &str) {
        self.msg_count += 1;
        if !self.opt.store_data {
            return;
        }
        let result = {
            let envelope = Envelope {
                host_name: &self.opt.hostname,
                session_ordinal: self.admission.ordinal,
                session_id: &self.admission.id,
                msg_count: self.msg_count,
                start_time: self.start_time,
                client_ip: &self.client_ip,
                dns_hit: self.dns_hit.as_ref(),
                helo: self.helo.as_deref(),
                mail_from: self.mail_from.as_deref(),
                rcpt_to: &self.rcpt_to,
                noop_count: self.counters.noop,
                vrfy_count: self.counters.vrfy,
                error_count: self.counters.errors,
            };
            self.store.store(&envelope, body).await
        };
        match result {
            Ok(file_name) => self.msg_file = Some(file_name),
            Err(e) => {
                self.msg_file = Some("write_error".to_string());
                self.logger
                    .log(&format!("session {}: {}", self.admission.id, e))
                    .await;
            }
        }
    }

    /// Logs the transaction (at most once per message count) and clears
    /// the per-transaction state. The HELO string and the message count
    /// survive until the connection closes.
    async fn reset_transaction(&mut self) {
        self.log_transaction().await;
        self.mail_from = None;
        self.rcpt_to.clear();
        self.msg_file = None;
        self.counters.reset();
    }

    async fn log_transaction(&mut self) {
        if self.last_logged_count == Some(self.msg_count) {
            return;
        }
        self.last_logged_count = Some(self.msg_count);

        let (rcpt_count, rcpt_list) = if self.rcpt_to.is_empty() {
            (0, "-no-rcpt-".to_string())
        } else {
            (self.rcpt_to.len(), self.rcpt_to.join(","))
        };
        let (list_type, list_name, list_value) = match &self.dns_hit {
            Some(hit) => (hit.list_type, hit.list_name.as_str(), hit.value.as_str()),
            None => ("-not-listed-", "-none-", "0.0.0.0"),
        };
        let record = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            Utc::now().format(DATE_FMT),
            self.start_time.format(DATE_FMT),
            self.admission.id,
            self.client_ip,
            self.helo.as_deref().unwrap_or("-no-helo-"),
            self.mail_from.as_deref().unwrap_or("-no-from-"),
            rcpt_count,
            rcpt_list,
            self.msg_count,
            self.msg_file.as_deref().unwrap_or("-no-file-"),
            list_type,
            list_name,
            list_value,
            if self.early_talker { "1" } else { "0" },
            self.counters.noop,
            self.counters.vrfy,
            self.counters.errors,
        );
        self.logger.log_session_record(&record).await;
    }

    async fn close(&mut self) {
        sleep_ms(RESPONSE_DELAY_MS).await;
        self.logger
            .log(&format!(
                "client {} disconnected, sess={}, ID={}.",
                self.client_ip, self.admission.ordinal, self.admission.id
            ))
            .await;
        self.log_transaction().await;
    }

    /// Sends a CRLF-terminated reply. Send failures are swallowed and
    /// reported through the return value.
    async fn send_line(&mut self, line: &str) -> bool {
        self.logger
            .log_proto(&self.client_ip, &self.admission.id, DIR_TX, line)
            .await;
        let mut buf = Vec::with_capacity(line.len() + 2);
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(b"\r\n");
        self.writer.write_all(&buf).await.is_ok()
    }

    /// Receives one line, bounded by the configured receive timeout.
    /// Returns `None` on timeout, transport error or peer close; timeouts
    /// and errors bump the error counter.
    async fn recv_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let read = if self.opt.timeout_ms > 0 {
            match time::timeout(
                Duration::from_millis(self.opt.timeout_ms),
                self.reader.read_line(&mut line),
            )
            .await
            {
                Ok(read) => read,
                Err(_) => {
                    self.counters.errors += 1;
                    return None;
                }
            }
        } else {
            self.reader.read_line(&mut line).await
        };
        match read {
            Ok(0) => None,
            Ok(_) => {
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                Some(line)
            }
            Err(_) => {
                self.counters.errors += 1;
                None
            }
        }
    }

    /// True when the client has already sent bytes we have not read yet.
    /// Checked before the banner and before every response when the
    /// detection is enabled.
    async fn is_early_talker(&mut self) -> bool {
        if !self.opt.early_talkers {
            return false;
        }
        if !self.reader.buffer().is_empty() {
            self.counters.errors += 1;
            return true;
        }
        match time::timeout(Duration::from_millis(1), self.reader.fill_buf()).await {
            Ok(Ok(buf)) if !buf.is_empty() => {
                self.counters.errors += 1;
                true
            }
            _ => false,
        }
    }
}

async fn sleep_ms(ms: u64) {
    if ms > 0 {
        time::sleep(Duration::from_millis(ms)).await;
    }
}

//! Operational and session-record logging.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Mutex;

/// Escapes non-printable characters so hostile input can't mangle the log.
pub fn sanitize(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\x01'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii_graphic() || c == ' ' || c == '\t' => result.push(c),
            _ => result.push_str(&format!("\\u{{{:x}}}", c as u32)),
        }
    }
    result
}

type SharedWriter = Arc<Mutex<BufWriter<File>>>;

fn open_writer(path: Option<PathBuf>) -> Result<Option<SharedWriter>> {
    let Some(path) = path else {
        return Ok(None);
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory: {:?}", parent))?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file: {:?}", path))?;
    Ok(Some(Arc::new(Mutex::new(BufWriter::new(file)))))
}

/// Two output channels: free-form operational lines (console plus an
/// optional app log file) and the per-transaction session records.
#[derive(Clone)]
pub struct Logger {
    app: Option<SharedWriter>,
    session: Option<SharedWriter>,
    verbose: bool,
}

impl Logger {
    pub fn new(
        log_file: Option<PathBuf>,
        session_log: Option<PathBuf>,
        verbose: bool,
    ) -> Result<Self> {
        Ok(Self {
            app: open_writer(log_file)?,
            session: open_writer(session_log)?,
            verbose,
        })
    }

    /// Operational line: timestamped, sanitized, console + app log.
    pub async fn log(&self, message: &str) {
        let line = format!(
            "{} {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            sanitize(message)
        );
        print!("{}", line);
        if let Some(writer) = &self.app {
            let mut writer = writer.lock().await;
            let _ = writer.write_all(line.as_bytes());
            let _ = writer.flush();
        }
    }

    /// Per-command/response trace, only in verbose mode.
    pub async fn log_proto(&self, client_ip: &str, session_id: &str, direction: &str, line: &str) {
        if self.verbose {
            self.log(&format!("{}:{} {}: {}", client_ip, session_id, direction, line))
                .await;
        }
    }

    /// One structured record per completed transaction. Falls back to the
    /// operational channel when no session log file is configured.
    pub async fn log_session_record(&self, record: &str) {
        match &self.session {
            Some(writer) => {
                let mut writer = writer.lock().await;
                let _ = writer.write_all(sanitize(record).as_bytes());
                let _ = writer.write_all(b"\n");
                let _ = writer.flush();
            }
            None => self.log(record).await,
        }
    }
}

//! Listener and accept loop. Every accepted connection runs as its own
//! tokio task holding a `Session`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::config::Opt;
use crate::logger::Logger;
use crate::registry::SessionRegistry;
use crate::reputation::{Lookup, ReputationChecker};
use crate::session::Session;
use crate::store::MailStore;

pub struct SmtpServer {
    opt: Arc<Opt>,
    listener: TcpListener,
    logger: Logger,
    registry: Arc<SessionRegistry>,
    reputation: Arc<ReputationChecker>,
    store: Arc<MailStore>,
}

impl SmtpServer {
    pub async fn bind(opt: Opt, lookup: Arc<dyn Lookup>) -> Result<Self> {
        let logger = Logger::new(opt.log_file.clone(), opt.session_log.clone(), opt.verbose)?;
        let addr = format!("{}:{}", opt.address, opt.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        let reputation = Arc::new(ReputationChecker::new(
            lookup,
            opt.whitelists.clone(),
            opt.blacklists.clone(),
        ));
        let store = Arc::new(MailStore::new(opt.store_path.clone()));
        Ok(Self {
            opt: Arc::new(opt),
            listener,
            logger,
            registry: Arc::new(SessionRegistry::new()),
            reputation,
            store,
        })
    }

    /// The bound address, useful when listening on an ephemeral port.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read the listener address")
    }

    pub async fn run(self) -> Result<()> {
        self.logger
            .log(&format!(
                "Listening for connections on {}",
                self.local_addr()?
            ))
            .await;
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .context("Failed to accept a connection")?;
            let session = Session::new(
                stream,
                peer,
                Arc::clone(&self.opt),
                &self.registry,
                Arc::clone(&self.reputation),
                Arc::clone(&self.store),
                self.logger.clone(),
            );
            tokio::spawn(session.run());
        }
    }
}

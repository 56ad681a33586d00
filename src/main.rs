use std::sync::Arc;

use anyhow::Result;
use structopt::StructOpt;

use fakesmtp::config::Opt;
use fakesmtp::reputation::{Lookup, SystemResolver};
use fakesmtp::server::SmtpServer;

fn dump_settings(opt: &Opt) {
    println!("  listen address......: {}:{}", opt.address, opt.port);
    println!("  host name...........: {}", opt.hostname);
    println!("  receive timeout.....: {} ms", opt.timeout_ms);
    println!("  max sessions........: {}", opt.max_sessions);
    println!("  max messages........: {}", opt.max_messages);
    println!("  max errors..........: {}", opt.max_errors);
    println!("  max noop............: {}", opt.max_noop);
    println!("  max vrfy............: {}", opt.max_vrfy);
    println!("  max rcpt............: {}", opt.max_rcpt);
    println!("  banner delay........: {} ms", opt.banner_delay);
    println!("  error delay.........: {} ms", opt.error_delay);
    println!("  early talkers.......: {}", opt.early_talkers);
    println!("  tempfail............: {}", opt.tempfail);
    println!("  store data..........: {}", opt.store_data);
    println!("  max data size.......: {} bytes", opt.max_data_size);
    println!("  store path..........: {:?}", opt.store_path);
    println!("  whitelists..........: {:?}", opt.whitelists);
    println!("  blacklists..........: {:?}", opt.blacklists);
    println!("  local domains.......: {}", opt.local_domains.len());
    println!("  local mailboxes.....: {}", opt.local_mailboxes.len());
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut opt = Opt::from_args();
    opt.load_list_files()?;

    println!(
        "{} {} starting up",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    if opt.verbose {
        dump_settings(&opt);
    }

    let resolver: Arc<dyn Lookup> = Arc::new(SystemResolver::from_system_conf()?);
    let server = SmtpServer::bind(opt, resolver).await?;
    server.run().await
}

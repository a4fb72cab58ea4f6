use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use leakless::{socks, Cli, Config, DirectTransport};
use slog::Drain;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.listen.is_none() {
        Cli::command().print_help()?;
        return Ok(());
    }
    let config = Config::from_cli(&cli)?;

    let logger = setup_logger(config.log_level);
    let proxy = config.build_proxy(Arc::new(DirectTransport), &logger);
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let server = socks::Server {
        logger: logger.clone(),
        proxy: Arc::new(proxy),
    };
    server.serve(listener).await
}

fn setup_logger(level: slog::Level) -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    slog::Logger::root(drain, slog::o!())
}

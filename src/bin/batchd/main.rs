mod args;

use std::process::ExitCode;

use anyhow::{Context, Result};
use batchd::config::ServerConfig;
use batchd::server::Server;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::runtime;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::args::Args;

fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(error) => {
            error!(error = format!("{error:#}"), "unusable configuration");
            return ExitCode::from(2);
        },
    };

    let rt = match runtime::Builder::new_multi_thread()
        .worker_threads(args.workers.max(1))
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(error) => {
            error!(%error, "failed to start runtime");
            return ExitCode::FAILURE;
        },
    };

    rt.block_on(run(args, config))
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServerConfig::default(),
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(dir) = &args.spool_dir {
        config.spool_dir = dir.clone();
    }
    if let Some(name) = &args.server_name {
        config.server_name = name.clone();
    }
    config.validate().context("checking overrides")?;

    Ok(config)
}

async fn run(args: Args, config: ServerConfig) -> ExitCode {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    if let Err(error) = begin(args, config, cancel).await {
        error!(error = format!("{error:#}"), "encountered runtime error");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn begin(
    args: Args,
    config: ServerConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let port = config.port;
    let server = Server::new(config, cancel.clone()).context("opening spool")?;
    server.recover().context("recovering jobs")?;
    let background = server.start_background();

    let listener = TcpListener::bind((args.listen, port))
        .await
        .with_context(|| format!("binding {}:{port}", args.listen))?;
    let served = server.serve(listener).await.context("serving");

    // Shutdown requests stop the listener through the same token.
    cancel.cancel();
    if let Err(error) = background.await {
        warn!(%error, "task runner ended abnormally");
    }
    let dropped = server.services().tasks.shutdown();
    info!(dropped, "shut down");

    served
}

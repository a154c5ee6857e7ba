//! Process entrypoint (C13): CLI flags, configuration, logging, host
//! key parsing, PID file management, and signal-driven shutdown wired
//! around the [`webtun::orchestrator`].

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use webtun::cancel::CancelToken;
use webtun::config::Config;
use webtun::orchestrator::{self, ServeParams};

#[derive(Parser, Debug)]
#[command(name = "webtund", about = "Public-endpoint SSH reverse tunnel server")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short = 'c', long = "config", default_value = "config.json")]
    config: PathBuf,

    /// Optional path to write this process's PID to.
    #[arg(long = "pid")]
    pid: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {}", e);
            std::process::exit(1);
        }
    };

    webtun::logging::init(&config);

    if let Some(pid_path) = &cli.pid {
        if let Err(e) = fs::write(pid_path, std::process::id().to_string()) {
            log::error!("failed to write pid file {}: {}", pid_path.display(), e);
            std::process::exit(1);
        }
    }

    let host_key = match thrussh_keys::decode_secret_key(&config.private_key, None) {
        Ok(key) => key,
        Err(e) => {
            log::error!("failed to parse privateKey: {}", e);
            cleanup_pid_file(&cli.pid);
            std::process::exit(1);
        }
    };

    let mut runtime = match tokio::runtime::Builder::new()
        .threaded_scheduler()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to start runtime: {}", e);
            cleanup_pid_file(&cli.pid);
            std::process::exit(1);
        }
    };

    let root_cancel = CancelToken::new();
    let shutdown_cancel = root_cancel.clone();
    runtime.spawn(async move {
        wait_for_shutdown_signal().await;
        log::info!("shutdown signal received");
        shutdown_cancel.cancel();
    });

    let params = ServeParams {
        ssh_addr: config.ssh_addr.clone(),
        http_addr: config.http_addr.clone(),
        host_key,
    };

    log::info!(
        "webtund starting: ssh={} http={} domain={}",
        params.ssh_addr, params.http_addr, config.domain
    );

    let result = runtime.block_on(orchestrator::serve(params, root_cancel));
    runtime.shutdown_background();
    cleanup_pid_file(&cli.pid);

    match result {
        Ok(()) => {
            log::info!("webtund exited cleanly");
        }
        Err(e) => {
            log::error!("fatal: {}", e);
            std::process::exit(1);
        }
    }
}

fn cleanup_pid_file(pid: &Option<PathBuf>) {
    if let Some(path) = pid {
        let _ = fs::remove_file(path);
    }
}

/// Waits for Ctrl-C, and on Unix also SIGTERM, whichever comes first.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("failed to install SIGTERM handler: {}, falling back to ctrl-c only", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

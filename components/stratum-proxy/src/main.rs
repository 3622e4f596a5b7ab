use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use stratum_proxy::config::{parse_endpoint, Args};
use stratum_proxy::constants::PROXY_VERSION;
use stratum_proxy::control_file::ControlFile;
use stratum_proxy::{
    ClientHandler, EventBridge, GetworkState, JobRegistry, PoolApi, PoolOptions, RegistryFlags,
    ShareStats, StratumServer, WorkerRegistry,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.quiet {
        "warn"
    } else if args.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // The guard must outlive main so buffered log lines reach the file.
    let _file_guard = match &args.log_file {
        Some(path) => {
            let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path.file_name().context("--log-file needs a file name")?;
            let appender = tracing_appender::rolling::never(
                directory.unwrap_or_else(|| std::path::Path::new(".")),
                file_name,
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    };

    if let Some(pid_file) = &args.pid_file {
        std::fs::write(pid_file, std::process::id().to_string())
            .with_context(|| format!("cannot write pid file {}", pid_file.display()))?;
    }

    let backup = args.backup.as_deref().map(parse_endpoint).transpose()?;
    let socks = args.socks.as_deref().map(parse_endpoint).transpose()?;

    info!("{PROXY_VERSION}");
    info!("----------------------------------");
    info!("\tpool:        {}:{}", args.host, args.port);
    if let Some(backup) = &backup {
        info!("\tbackup:      {backup}");
    }
    info!("\tstratum:     {}:{} (0 = disabled)", args.stratum_host, args.stratum_port);
    info!("\tgetwork:     {}:{} (0 = disabled)", args.getwork_host, args.getwork_port);
    info!("\tmidstate:    {}", !args.no_midstate);
    info!("\tscrypt mode: {}", args.scrypt_target);
    if let Some(user) = &args.custom_user {
        info!("\tcustom user: {user}");
    }
    info!("----------------------------------");

    let (shutdown_trigger, shutdown) = triggered::trigger();

    let registry = Arc::new(JobRegistry::new(RegistryFlags {
        scrypt_target: args.scrypt_target,
        no_midstate: args.no_midstate,
        real_target: args.real_target,
        use_old_target: args.old_target,
        blocknotify_cmd: args.blocknotify.clone(),
    }));
    let clients = ClientHandler::new();
    let workers = Arc::new(WorkerRegistry::new(args.custom_user.is_some()));
    let stats = ShareStats::new(args.sharenotify.clone());
    Arc::clone(&stats).start_print_thread();

    let pool = PoolApi::new(
        PoolOptions {
            main: stratum_proxy::PoolEndpoint { host: args.host.clone(), port: args.port },
            backup,
            socks,
            custom_user: args.custom_user.clone(),
            custom_password: args.custom_password.clone(),
            subscribe_extranonce: args.set_extranonce,
            idle: args.idle,
            control_file: args
                .control_file
                .clone()
                .map(|path| ControlFile::new(path, args.cf_interval)),
        },
        shutdown.clone(),
    );

    let bridge = EventBridge::new(Arc::clone(&registry), Arc::clone(&clients), Arc::clone(&workers));
    tokio::spawn(Arc::clone(&pool).run(bridge));

    if args.stratum_port > 0 {
        let server = StratumServer::new(
            Arc::clone(&pool),
            Arc::clone(&registry),
            Arc::clone(&clients),
            Arc::clone(&workers),
            Arc::clone(&stats),
            shutdown.clone(),
        );
        let host = args.stratum_host.clone();
        let port = args.stratum_port;
        tokio::spawn(async move {
            if let Err(err) = server.listen(&host, port).await {
                warn!("stratum listener failed: {err}");
            }
        });
    }

    if args.getwork_port > 0 {
        let getwork = GetworkState::new(
            Arc::clone(&pool),
            Arc::clone(&registry),
            Arc::clone(&workers),
            Arc::clone(&stats),
            args.stratum_port,
            args.custom_stratum.clone(),
            args.custom_lp.clone(),
            args.custom_user.clone().map(|user| (user, args.custom_password.clone())),
            shutdown.clone(),
        );
        let host = args.getwork_host.clone();
        let port = args.getwork_port;
        tokio::spawn(async move {
            if let Err(err) = getwork.listen(&host, port).await {
                warn!("getwork listener failed: {err}");
            }
        });
    }

    if let Some(prom_port) = args.prom_port {
        tokio::spawn(async move {
            if let Err(err) = stratum_proxy::prom::start_prom_server(prom_port).await {
                warn!("prometheus listener failed: {err}");
            }
        });
    }

    tokio::signal::ctrl_c().await.context("cannot listen for shutdown signal")?;
    info!("shutting down proxy...");
    shutdown_trigger.trigger();
    // Wake parked long polls so their handlers drain before the listeners
    // stop serving.
    registry.wake_long_polls();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    Ok(())
}

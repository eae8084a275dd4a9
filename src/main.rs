use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vastnfs_k8s::cli::{
    build_request, env_file_arg, format_deploy_failure, format_deploy_report, format_plan,
    format_session_report, format_status, format_uninstall_report, format_unload_reports,
    plan_deploy, run_deploy, run_logs, run_status, run_uninstall, run_unload, Cli, CommandError,
    Commands,
};
use vastnfs_k8s::config::{load_settings, load_settings_from, Settings};
use vastnfs_k8s::deploy::StdoutSink;
use vastnfs_k8s::kube::{ClusterApi, Kubectl};

#[tokio::main]
async fn main() {
    // Before parsing, so env-backed arguments see the file's values
    let env_loaded = env_file_arg(std::env::args())
        .map(|path| dotenvy::from_path(&path).map_err(|e| (path, e)));

    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Some(Err((env_file, e))) = env_loaded {
        error!("Failed to load env file {}: {}", env_file.display(), e);
        process::exit(1);
    }

    let settings = match &cli.config {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    let settings = match settings {
        Ok(s) => s.with_context(cli.context.clone()),
        Err(e) => {
            error!("Failed to load config: {}", e);
            process::exit(1);
        }
    };

    let api: Arc<dyn ClusterApi> = Arc::new(Kubectl::new(settings.kubectl_config()));

    // Ctrl-C only interrupts waiting and log streaming
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping log streams");
            interrupt.cancel();
        }
    });

    let code = match run(cli.command, api, &settings, cancel).await {
        Ok(code) => code,
        Err(CommandError::Deploy(e)) => {
            eprint!("{}", format_deploy_failure(&e));
            1
        }
        Err(e) => {
            error!("{}", e);
            1
        }
    };
    process::exit(code);
}

async fn run(
    command: Commands,
    api: Arc<dyn ClusterApi>,
    settings: &Settings,
    cancel: CancellationToken,
) -> Result<i32, CommandError> {
    match command {
        Commands::Deploy(args) => {
            if args.dry_run {
                let request = build_request(&args);
                let plan = plan_deploy(api, settings, &request, args.fast_path).await?;
                print!("{}", format_plan(&plan, &request.target_version));
                return Ok(0);
            }
            let report = run_deploy(api, settings, &args, Arc::new(StdoutSink), cancel).await?;
            print!("{}", format_deploy_report(&report));
            Ok(0)
        }
        Commands::Status(args) => {
            let summary = run_status(api, settings, &args).await?;
            print!("{}", format_status(&summary));
            let matches = summary.expectation.map(|(_, m)| m).unwrap_or(true);
            Ok(if matches { 0 } else { 2 })
        }
        Commands::Unload(args) => {
            let reports = run_unload(api, settings, &args.nodes).await?;
            print!("{}", format_unload_reports(&reports));
            Ok(0)
        }
        Commands::Uninstall(args) => {
            let report = run_uninstall(api, settings, &args).await?;
            print!("{}", format_uninstall_report(&report));
            Ok(0)
        }
        Commands::Logs(args) => {
            let report =
                run_logs(api, settings, &args.namespace, Arc::new(StdoutSink), cancel).await?;
            print!("{}", format_session_report(&report));
            Ok(0)
        }
    }
}

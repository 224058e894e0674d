use anyhow::{anyhow, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use sftp_backup_lib::backup_executor::BackupExecutor;
use sftp_backup_lib::config_manager::{ConfigManager, LoggingConfig};
use sftp_backup_lib::logging::init_logging;
use sftp_backup_lib::schedule::Schedule;
use sftp_backup_lib::scheduler::Scheduler;
use sftp_backup_lib::ssh_client::{SftpConnector, TransferClient};
use sftp_backup_lib::sync_engine::format_size;
use sftp_backup_lib::AppState;

#[derive(Parser)]
#[command(name = "sftp-backup", version, about = "Scheduled SFTP backups")]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run,
    /// Back up one task now
    Backup { task: String },
    /// Validate the configuration and show upcoming runs
    Check,
    /// Show recent backup runs
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show aggregate backup statistics
    Stats,
    /// Connect to a configured server and log out again
    TestConnection { server: String },
    /// Encrypt a password for use in the configuration file
    EncryptPassword { password: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => match ConfigManager::new() {
            Ok(manager) => manager,
            Err(e) => {
                eprintln!("error: {:#}", e);
                return ExitCode::FAILURE;
            }
        },
    };

    if let Commands::EncryptPassword { password } = &cli.command {
        return match config_manager.encrypt_secret(password) {
            Ok(encrypted) => {
                println!("{}", encrypted);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {:#}", e);
                ExitCode::FAILURE
            }
        };
    }

    let state = match AppState::load(config_manager) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            let _ = init_logging(&LoggingConfig::default());
            error!("failed to load configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let logging = state.config().logging.clone();
    let _log_guard = match init_logging(&logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match execute(cli.command, state).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Commands, state: Arc<AppState>) -> Result<bool> {
    match command {
        Commands::Run => run_scheduler(state).await,
        Commands::Backup { task } => run_backup(state, task).await,
        Commands::Check => Ok(check(&state)),
        Commands::History { limit } => {
            for record in state.history.recent(limit) {
                println!(
                    "{}  {:<7}  {}  {}",
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    if record.success { "OK" } else { "FAILED" },
                    record.task_name,
                    record.details
                );
            }
            Ok(true)
        }
        Commands::Stats => {
            let stats = state.history.statistics();
            println!("Total runs:   {}", stats.total_backups);
            println!("Successful:   {}", stats.successful_backups);
            println!("Failed:       {}", stats.failed_backups);
            println!("Success rate: {:.1}%", stats.success_rate);
            if let Some(last) = stats.last_backup {
                println!("Last run:     {}", last.format("%Y-%m-%d %H:%M:%S"));
            }
            for (task, counts) in &stats.per_task {
                println!(
                    "  {}: {} ok, {} failed",
                    task, counts.successful_backups, counts.failed_backups
                );
            }
            Ok(true)
        }
        Commands::TestConnection { server } => test_connection(state, server).await,
        Commands::EncryptPassword { .. } => Err(anyhow!("handled before configuration is loaded")),
    }
}

async fn run_scheduler(state: Arc<AppState>) -> Result<bool> {
    let executor = Arc::new(BackupExecutor::new(
        Arc::clone(&state),
        Arc::new(SftpConnector::default()),
    ));
    let mut scheduler = Scheduler::new(executor).watch_config(true);

    let tasks = {
        let config = state.config();
        for warning in config.validate() {
            warn!("{}", warning);
        }
        config.backup_tasks.clone()
    };
    let scheduled = scheduler.setup_schedules(&tasks);
    info!(
        config = %state.config_manager().config_path().display(),
        "{} of {} task(s) scheduled",
        scheduled,
        tasks.len()
    );

    tokio::select! {
        _ = scheduler.run() => {}
        result = signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            info!("shutdown requested");
        }
    }

    if scheduler.is_backup_running() {
        info!(
            "waiting for running backups to finish: {}",
            state.running.names().join(", ")
        );
    }
    scheduler.wait_for_running().await;
    info!("scheduler stopped");
    Ok(true)
}

async fn run_backup(state: Arc<AppState>, task: String) -> Result<bool> {
    let executor = BackupExecutor::new(state, Arc::new(SftpConnector::default()));
    let report = tokio::task::spawn_blocking(move || executor.run_now(&task))
        .await
        .context("backup worker terminated abnormally")??;

    println!(
        "{}: {} after {} attempt(s), {} file(s), {} uploaded, {} skipped, {} failed, {}",
        report.task_name,
        if report.success { "succeeded" } else { "failed" },
        report.attempts,
        report.stats.total_files,
        report.stats.success_files,
        report.stats.skipped_files,
        report.stats.failed_files,
        format_size(report.stats.total_bytes)
    );
    if let Some(error) = &report.error {
        println!("last error: {}", error);
    }
    Ok(report.success)
}

fn check(state: &AppState) -> bool {
    let config = state.config();
    let warnings = config.validate();
    for warning in &warnings {
        println!("warning: {}", warning);
    }

    let now = Local::now().naive_local();
    for (name, task) in &config.backup_tasks {
        match Schedule::parse(&task.schedule) {
            Ok(schedule) => println!(
                "{}: {} -> {}:{} (next run {})",
                name,
                schedule,
                task.target_server,
                task.target_path,
                schedule.next_fire(now).format("%Y-%m-%d %H:%M")
            ),
            Err(e) => println!("{}: not scheduled ({})", name, e),
        }
    }
    warnings.is_empty()
}

async fn test_connection(state: Arc<AppState>, server_name: String) -> Result<bool> {
    let server = {
        let config = state.config();
        let server = config
            .servers
            .get(&server_name)
            .ok_or_else(|| anyhow!("unknown server: {}", server_name))?;
        state.config_manager().resolve_server(server)?
    };

    let address = server.address();
    let result = tokio::task::spawn_blocking(move || {
        TransferClient::new(Arc::new(SftpConnector::default()), server).test_connection()
    })
    .await
    .context("connection test terminated abnormally")?;

    match result {
        Ok(()) => {
            println!("connected to {} ({})", server_name, address);
            Ok(true)
        }
        Err(e) => {
            println!("connection to {} ({}) failed: {}", server_name, address, e);
            Ok(false)
        }
    }
}

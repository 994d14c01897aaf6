use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};

use launchkit::util::{format_size, format_speed, progress_percent};
use launchkit::{
    Error, InstallOptions, JobKind, JobState, LauncherConfig, LauncherEngine, StatusEvent,
};

#[derive(Parser, Debug)]
#[command(
    name = "launchkit",
    author,
    version,
    about = "Login session and download manager for the game store"
)]
struct Cli {
    /// Store API base URL, overriding config.json and LAUNCHKIT_API_URL.
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in with a refresh token or an authorization code from the web login.
    Login {
        #[arg(long, conflicts_with = "code", required_unless_present = "code")]
        refresh_token: Option<String>,
        /// Authorization code, or the JSON page the web login shows.
        #[arg(long)]
        code: Option<String>,
    },
    /// Show the current session, refreshing it if needed.
    Status,
    /// Forget stored credentials.
    Logout,
    /// Install a title.
    Install(JobArgs),
    /// Update an installed title.
    Update(JobArgs),
    /// Verify an installed title and re-download damaged files.
    Repair(JobArgs),
    /// Delete an installed title from disk.
    Uninstall {
        app_name: String,
        /// Install directory (defaults to <install_dir>/<app_name>).
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct JobArgs {
    app_name: String,
    /// Install directory (defaults to <install_dir>/<app_name>).
    #[arg(long)]
    path: Option<PathBuf>,
    /// Number of files fetched concurrently.
    #[arg(long)]
    workers: Option<usize>,
    /// Only install files under these path prefixes.
    #[arg(long = "include")]
    include: Vec<String>,
    /// Skip files under these path prefixes.
    #[arg(long = "exclude")]
    exclude: Vec<String>,
    #[arg(long = "install-tag")]
    install_tags: Vec<String>,
    /// Bandwidth limit in bytes per second.
    #[arg(long)]
    bandwidth: Option<u64>,
    /// Re-download files even if they look intact.
    #[arg(long)]
    force: bool,
    #[arg(long)]
    no_delta: bool,
    #[arg(long)]
    no_patching: bool,
}

impl JobArgs {
    fn options(&self) -> InstallOptions {
        InstallOptions {
            destination: self.path.clone(),
            max_workers: self.workers,
            include_prefixes: self.include.clone(),
            exclude_prefixes: self.exclude.clone(),
            install_tags: self.install_tags.clone(),
            bandwidth_limit: self.bandwidth,
            force: self.force,
            disable_patching: self.no_patching,
            disable_delta: self.no_delta,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = match LauncherConfig::load().await {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(url) = cli.api_url {
        config.api_base_url = url;
    }
    if let Err(err) = launchkit::env::ensure_base_dirs() {
        warn!("could not create launcher directories: {err}");
    }

    let engine = LauncherEngine::new(config);
    let result = match cli.command {
        Command::Login {
            refresh_token,
            code,
        } => {
            let login = match (refresh_token, code) {
                (_, Some(code)) => engine.login_with_code(&code).await,
                (Some(token), None) => engine.login(&token).await,
                (None, None) => Err(Error::InvalidParameters(
                    "pass --refresh-token or --code".into(),
                )),
            };
            login.map(|session| {
                println!(
                    "Logged in as {}",
                    session.display_name().unwrap_or("<unknown>")
                );
            })
        }
        Command::Status => engine.sessions().authenticate().await.map(|session| {
            println!(
                "Logged in as {} until {}",
                session.display_name().unwrap_or("<unknown>"),
                session.expires_at().to_rfc3339()
            );
        }),
        Command::Logout => engine.sessions().logout().await.map(|()| {
            println!("Logged out");
        }),
        Command::Install(args) => run_job(&engine, JobKind::Install, &args).await,
        Command::Update(args) => run_job(&engine, JobKind::Update, &args).await,
        Command::Repair(args) => run_job(&engine, JobKind::Repair, &args).await,
        Command::Uninstall { app_name, path } => engine
            .uninstall(&app_name, path.as_deref())
            .await
            .map(|()| println!("Uninstalled {app_name}")),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

async fn run_job(engine: &LauncherEngine, kind: JobKind, args: &JobArgs) -> launchkit::Result<()> {
    let params = engine.params_for(kind, &args.app_name, &args.options());
    let mut job = engine.prepare(params).await?;
    if let Some(summary) = job.summary() {
        println!(
            "{} {}: {} to download, {} installed size, {} files up to date",
            summary.app_name,
            summary.build_version,
            format_size(summary.download_size),
            format_size(summary.install_size),
            summary.up_to_date
        );
    }

    let mut status = job.start()?;
    let control = job.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            let _ = control.cancel();
        }
    });

    let bar = ProgressBar::new(job.summary().map_or(0, |s| s.download_size));
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner} [{bar:40}] {bytes}/{total_bytes} {bytes_per_sec} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let started = Instant::now();
    let mut transferred = 0;
    let mut failure = None;
    while let Some(event) = status.recv().await {
        match event {
            StatusEvent::Progress {
                bytes_done,
                bytes_total,
                files_done,
                files_total,
            } => {
                transferred = bytes_done;
                bar.set_length(bytes_total);
                bar.set_position(bytes_done);
                bar.set_message(format!(
                    "{files_done}/{files_total} files ({:.0}%)",
                    progress_percent(bytes_done, bytes_total)
                ));
            }
            StatusEvent::Paused => bar.set_message("paused"),
            StatusEvent::Resumed => bar.set_message("resumed"),
            StatusEvent::Completed => {
                bar.finish_with_message("done");
                let secs = started.elapsed().as_secs_f32().max(f32::EPSILON);
                info!(
                    "downloaded {} at {}",
                    format_size(transferred),
                    format_speed(transferred as f32 / secs)
                );
            }
            StatusEvent::Cancelled => bar.abandon_with_message("cancelled"),
            StatusEvent::Failed { error } => {
                bar.abandon_with_message("failed");
                failure = Some(error);
            }
        }
    }

    match (job.wait().await, failure) {
        (JobState::Completed, _) => Ok(()),
        (_, Some(error)) => Err(error),
        _ => Err(Error::Cancelled),
    }
}

fn report(err: &Error) {
    error!("{err}");
    match err {
        Error::NoCredentials | Error::InvalidCredentials => {
            eprintln!("Please log in again with `launchkit login --code <code>`.");
        }
        err if err.is_retryable() => eprintln!("The store could not be reached, try again later."),
        Error::Cancelled => eprintln!("Cancelled. Run the same command again to resume."),
        Error::PathBusy(path) => {
            eprintln!("{} is in use by a running job.", path.display());
        }
        _ => {}
    }
}

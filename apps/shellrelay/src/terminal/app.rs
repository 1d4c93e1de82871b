use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::client::TerminalSession;
use crate::client::widget::{ConsoleSurface, ConsoleWidget};
use crate::config::{Config, FileConfig};
use crate::session::tty::RawModeGuard;
use crate::session::{HandshakeResult, LoginForm, SessionDescriptor, SessionManager};
use crate::telemetry::logging;
use crate::terminal::cli::{Cli, Command, ConnectArgs, DownloadArgs, UploadArgs};
use crate::terminal::console::{self, ConsoleObserver};
use crate::terminal::error::CliError;
use crate::transfer::controller::FileSource;
use crate::transfer::download::{Downloader, default_destination, download_url};
use crate::transfer::{ReqwestUploadBackend, TransferController, UploadTarget, callback};
use crate::transport::websocket::WebSocketConnector;

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let file = match cli.config.as_deref() {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::load_default()?,
    };
    let mut config = Config::resolve(cli.overrides(), file)?;
    // The interactive shell owns the screen; only a log file may receive logs.
    config.log.console = !matches!(cli.command, Command::Connect(_));
    logging::init(&config.log)?;

    match cli.command {
        Command::Connect(args) => connect(&config, args).await,
        Command::Upload(args) => upload(&config, args).await,
        Command::Download(args) => download(&config, args).await,
        Command::Clients => list_clients(&config, false).await,
        Command::Clean => list_clients(&config, true).await,
    }
}

async fn connect(config: &Config, args: ConnectArgs) -> Result<(), CliError> {
    let password = match args.password {
        Some(password) => password,
        None => prompt_password(&args.username)?,
    };
    let form = LoginForm {
        hostname: args.hostname,
        port: args.port,
        username: args.username,
        password,
    };
    form.validate()?;

    let session_config = config.session_config()?;
    let manager = SessionManager::new(session_config.clone())?;
    let observer = Arc::new(ConsoleObserver::new());

    let descriptor = match manager.handshake(&form, observer.as_ref()).await? {
        HandshakeResult::Success(descriptor) => descriptor,
        HandshakeResult::Failure { reason } => {
            if observer.take_refresh() {
                match manager.clients().await {
                    Ok(clients) => console::print_clients(&clients),
                    Err(err) => {
                        warn!(target: "shellrelay::cli", error = %err, "client list refresh failed")
                    }
                }
            }
            return Err(CliError::Handshake(reason));
        }
    };
    eprintln!(
        "Connected: session {} (detach with Ctrl-])",
        descriptor.id()
    );

    let mut session = TerminalSession::new(
        descriptor,
        ConsoleWidget::stdout(),
        ConsoleSurface,
        observer.clone(),
    )
    .with_title(form.title());

    let raw_mode = RawModeGuard::new(true);
    if let Err(err) = session
        .connect(&WebSocketConnector, session_config.base_url())
        .await
    {
        drop(raw_mode);
        return Err(err.into());
    }

    let (tx, rx) = mpsc::unbounded_channel();
    console::spawn_stdin_pump(tx.clone());
    let resize_task = console::spawn_resize_watcher(tx);

    let outcome = session.run(rx).await;
    if let Some(task) = resize_task {
        task.abort();
    }
    drop(raw_mode);

    let reason = outcome?;
    info!(target: "shellrelay::cli", reason = %reason, local = reason.local, "session ended");
    Ok(())
}

fn prompt_password(username: &str) -> Result<String, CliError> {
    let password = rpassword::prompt_password(format!("Password for {username}: "))?;
    Ok(password)
}

async fn upload(config: &Config, args: UploadArgs) -> Result<(), CliError> {
    let session_config = config.session_config()?;
    let descriptor = SessionDescriptor::new(args.session, None);
    let name = match args.name {
        Some(name) => name,
        None => file_name(&args.file)?,
    };
    let target = UploadTarget::new(session_config.base_url(), &descriptor, &name)?;
    let mut source = FileSource::open(&args.file).await?;

    let backend = Arc::new(ReqwestUploadBackend::new(
        config.payload,
        config.retryable_statuses.clone(),
    )?);
    let mut controller = TransferController::new(backend, config.transfer_config())
        .with_progress(callback(console::print_progress));
    let report = controller.upload(&target, &mut source).await?;

    println!(
        "Upload completed: {}",
        config.remote_upload_path(&report.file_name)
    );
    Ok(())
}

fn file_name(path: &Path) -> Result<String, CliError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            CliError::InvalidArgument(format!("{} has no usable file name", path.display()))
        })
}

async fn download(config: &Config, args: DownloadArgs) -> Result<(), CliError> {
    let session_config = config.session_config()?;
    let descriptor = SessionDescriptor::new(args.session, None);
    let url = download_url(session_config.base_url(), &descriptor, &args.remote_path)?;
    let dest = match args.output {
        Some(path) => path,
        None => default_destination(&args.remote_path)?,
    };

    let bytes = Downloader::new()?
        .fetch(&url, &args.remote_path, &dest)
        .await?;
    println!("Saved {} ({bytes} bytes)", dest.display());
    Ok(())
}

async fn list_clients(config: &Config, clean: bool) -> Result<(), CliError> {
    let manager = SessionManager::new(config.session_config()?)?;
    let clients = if clean {
        manager.clean().await?
    } else {
        manager.clients().await?
    };
    console::print_clients(&clients);
    Ok(())
}

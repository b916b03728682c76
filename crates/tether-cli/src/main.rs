//! Tether CLI
//!
//! Remote commands and SFTP transfers over libssh2

mod config;
mod progress;
mod remote;
mod transfer;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use std::path::{Path, PathBuf};
use tether_native::{FilePermissions, Session, SessionConfig};

use config::{Config, HostTarget};
use progress::{TransferProgress, format_bytes, format_duration, format_mode};

/// Tether - remote commands and file transfer over SSH
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Private key for public key authentication (overrides the host profile)
    #[arg(short, long, global = true)]
    identity: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the server banner and host key fingerprint
    Info {
        /// Host profile or [user@]host[:port]
        host: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List a remote directory
    Ls {
        /// Host profile or [user@]host[:port]
        host: String,

        /// Remote directory
        #[arg(default_value = ".")]
        path: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Download a remote file
    Get {
        /// Host profile or [user@]host[:port]
        host: String,

        /// Remote file
        remote: String,

        /// Local destination (defaults to the remote file name)
        local: Option<PathBuf>,
    },

    /// Upload a local file
    Put {
        /// Host profile or [user@]host[:port]
        host: String,

        /// Local file
        local: PathBuf,

        /// Remote destination
        remote: String,
    },

    /// Run a command on the remote host
    Exec {
        /// Host profile or [user@]host[:port]
        host: String,

        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Create a remote directory
    Mkdir {
        /// Host profile or [user@]host[:port]
        host: String,

        /// Remote directory
        path: String,

        /// Create missing parents
        #[arg(short, long)]
        parents: bool,
    },

    /// Remove a remote file or empty directory
    Rm {
        /// Host profile or [user@]host[:port]
        host: String,

        /// Remote path
        path: String,
    },

    /// List configured host profiles
    Hosts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::load_or_default()?,
    };

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .init();

    // Validate configuration
    config.validate()?;

    let resolve = |host: &str| -> anyhow::Result<HostTarget> {
        let mut target = config.resolve_host(host)?;
        if let Some(identity) = &cli.identity {
            target.identity_file = Some(identity.clone());
        }
        Ok(target)
    };

    match cli.command {
        Commands::Info { host, json } => {
            show_info(resolve(&host)?, &config, json).await?;
        }
        Commands::Ls { host, path, json } => {
            list_directory(resolve(&host)?, path, json, &config).await?;
        }
        Commands::Get {
            host,
            remote,
            local,
        } => {
            get_file(resolve(&host)?, remote, local, &config).await?;
        }
        Commands::Put {
            host,
            local,
            remote,
        } => {
            put_file(resolve(&host)?, local, remote, &config).await?;
        }
        Commands::Exec { host, command } => {
            let status = run_command(resolve(&host)?, command.join(" "), &config).await?;
            if status != 0 {
                std::process::exit(status);
            }
        }
        Commands::Mkdir {
            host,
            path,
            parents,
        } => {
            make_directory(resolve(&host)?, path, parents, &config).await?;
        }
        Commands::Rm { host, path } => {
            remove_path(resolve(&host)?, path, &config).await?;
        }
        Commands::Hosts => {
            list_hosts(&config);
        }
    }

    Ok(())
}

/// Run `work` against a connected session on a blocking thread.
///
/// Handles are bound to the thread that created them, so the whole session
/// lives and dies inside one closure.
async fn with_session<T, F>(
    target: HostTarget,
    session_config: SessionConfig,
    authenticate: bool,
    work: F,
) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Session) -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut session = connect(&target, &session_config, authenticate)?;
        let result = work(&session);
        session.close();
        result
    })
    .await?
}

fn connect(
    target: &HostTarget,
    session_config: &SessionConfig,
    authenticate: bool,
) -> anyhow::Result<Session> {
    let address = target.address();
    tracing::info!("Connecting to {}", address);

    let session = Session::connect(address.as_str(), session_config)
        .with_context(|| format!("Failed to connect to {address}"))?;
    if !authenticate {
        return Ok(session);
    }

    let user = match &target.user {
        Some(user) => user.clone(),
        None => local_user()?,
    };

    let result = match &target.identity_file {
        Some(key) => {
            let passphrase = std::env::var("TETHER_KEY_PASSPHRASE").ok();
            session.authenticate_public_key(&user, key, None, passphrase.as_deref())
        }
        None => {
            let password = match std::env::var("TETHER_PASSWORD") {
                Ok(password) => password,
                Err(_) => {
                    rpassword::prompt_password(format!("{user}@{}'s password: ", target.hostname))?
                }
            };
            session.authenticate_password(&user, &password)
        }
    };
    result.with_context(|| format!("Authentication failed for {user}@{}", target.hostname))?;

    tracing::debug!("Authenticated as {}", user);
    Ok(session)
}

fn local_user() -> anyhow::Result<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .map_err(|_| anyhow::anyhow!("No user given and none found in the environment"))
}

/// Show the server identity
async fn show_info(target: HostTarget, config: &Config, json: bool) -> anyhow::Result<()> {
    let address = target.address();
    let info = with_session(target, config.session.clone(), false, move |session| {
        Ok(remote::host_info(session, &address))
    })
    .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("Host: {}", info.address);
    println!("Banner: {}", info.banner.as_deref().unwrap_or("(none)"));
    match (&info.fingerprint, &info.fingerprint_hex) {
        (Some(fingerprint), Some(hex)) => {
            println!("Host key: {fingerprint}");
            println!("Host key (hex): {hex}");
        }
        _ => println!("Host key: (unavailable)"),
    }
    Ok(())
}

/// List a remote directory
async fn list_directory(
    target: HostTarget,
    path: String,
    json: bool,
    config: &Config,
) -> anyhow::Result<()> {
    let entries = with_session(target, config.session.clone(), true, move |session| {
        let sftp = session.open_channel()?.open_file_transfer()?;
        remote::list(&sftp, &path)
    })
    .await?;

    if json {
        let rows = entries
            .iter()
            .map(remote::ListingEntry::from)
            .collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    for entry in &entries {
        let mode = entry
            .attributes
            .permissions
            .map_or_else(|| "?".repeat(10), format_mode);
        let size = entry.attributes.size.map_or_else(String::new, format_bytes);
        if entry.attributes.is_directory() {
            println!("{mode} {size:>12} {}", style(&entry.name).blue().bold());
        } else {
            println!("{mode} {size:>12} {}", entry.name);
        }
    }
    Ok(())
}

/// Download a remote file
async fn get_file(
    target: HostTarget,
    remote: String,
    local: Option<PathBuf>,
    config: &Config,
) -> anyhow::Result<()> {
    let local = match local {
        Some(local) => local,
        None => PathBuf::from(
            Path::new(&remote)
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Cannot derive a local name from '{}'", remote))?,
        ),
    };
    let chunk_size = config.session.read_chunk_size;
    let visible = config.transfer.show_progress;

    tracing::info!("Downloading {} to {}", remote, local.display());
    let (bytes, elapsed) = with_session(target, config.session.clone(), true, move |session| {
        let sftp = session.open_channel()?.open_file_transfer()?;
        let total = sftp.stat(&remote)?.size.unwrap_or(0);
        let progress = TransferProgress::new(total, &remote, visible);
        match transfer::download(&sftp, &remote, &local, chunk_size, &mut |n| {
            progress.update(n);
        }) {
            Ok(bytes) => {
                progress.finish_with_message(format!("Downloaded {remote}"));
                Ok((bytes, progress.elapsed()))
            }
            Err(err) => {
                progress.abandon();
                Err(err)
            }
        }
    })
    .await?;

    println!(
        "Transferred {} in {}",
        format_bytes(bytes),
        format_duration(elapsed)
    );
    Ok(())
}

/// Upload a local file
async fn put_file(
    target: HostTarget,
    local: PathBuf,
    remote: String,
    config: &Config,
) -> anyhow::Result<()> {
    if !local.exists() {
        anyhow::bail!("File not found: {}", local.display());
    }
    let total = std::fs::metadata(&local)?.len();
    let mode = FilePermissions::from_mode(config.transfer.file_mode);
    let chunk_size = config.session.read_chunk_size;
    let visible = config.transfer.show_progress;

    tracing::info!("Uploading {} to {}", local.display(), remote);
    let (bytes, elapsed) = with_session(target, config.session.clone(), true, move |session| {
        let sftp = session.open_channel()?.open_file_transfer()?;
        let progress = TransferProgress::new(total, &remote, visible);
        match transfer::upload(&sftp, &local, &remote, mode, chunk_size, &mut |n| {
            progress.update(n);
        }) {
            Ok(bytes) => {
                progress.finish_with_message(format!("Uploaded {remote}"));
                Ok((bytes, progress.elapsed()))
            }
            Err(err) => {
                progress.abandon();
                Err(err)
            }
        }
    })
    .await?;

    println!(
        "Transferred {} in {}",
        format_bytes(bytes),
        format_duration(elapsed)
    );
    Ok(())
}

/// Run a remote command, returning its exit status
async fn run_command(target: HostTarget, command: String, config: &Config) -> anyhow::Result<i32> {
    let chunk_size = config.session.read_chunk_size;
    with_session(target, config.session.clone(), true, move |session| {
        let mut stdout = std::io::stdout().lock();
        let mut stderr = std::io::stderr().lock();
        remote::exec(session, &command, &mut stdout, &mut stderr, chunk_size)
    })
    .await
}

/// Create a remote directory
async fn make_directory(
    target: HostTarget,
    path: String,
    parents: bool,
    config: &Config,
) -> anyhow::Result<()> {
    let mode = FilePermissions::from_mode(config.transfer.directory_mode);
    with_session(target, config.session.clone(), true, move |session| {
        let sftp = session.open_channel()?.open_file_transfer()?;
        remote::make_directory(&sftp, &path, mode, parents)
    })
    .await
}

/// Remove a remote file or directory
async fn remove_path(target: HostTarget, path: String, config: &Config) -> anyhow::Result<()> {
    with_session(target, config.session.clone(), true, move |session| {
        let sftp = session.open_channel()?.open_file_transfer()?;
        remote::remove(&sftp, &path)
    })
    .await
}

/// Print configured host profiles
fn list_hosts(config: &Config) {
    if config.hosts.is_empty() {
        println!("No host profiles configured ({})", Config::default_path().display());
        return;
    }
    for host in &config.hosts {
        let user = host
            .user
            .as_deref()
            .map(|user| format!("{user}@"))
            .unwrap_or_default();
        println!(
            "{:<16} {user}{}:{}",
            style(&host.name).bold(),
            host.hostname,
            host.port
        );
        if let Some(identity) = &host.identity_file {
            println!("{:<16} identity {}", "", identity.display());
        }
    }
}

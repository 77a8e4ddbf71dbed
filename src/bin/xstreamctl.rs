//! xstreamctl - command-line front end for xstream-native
//!
//! Every command is translated into a bridge request; the JSON response is
//! printed on stdout and logs go to stderr.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use libxstream::bridge::{NativeBridge, Request, Response};
use libxstream::installer::HttpFetcher;
use libxstream::privilege::{
    is_root, CredentialProvider, DryRunExecutor, PrivilegeCredential, PrivilegedExecutor,
    StaticCredential, SudoExecutor,
};
use libxstream::{Platform, ServiceDescriptor, XstreamConfig};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::{fmt, EnvFilter};
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "xstreamctl")]
#[command(about = "Control the XStream tunnel, system proxy, node store and proxy core", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults apply when it does not exist)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print privileged commands instead of running them
    #[arg(long)]
    dry_run: bool,

    /// Read the sudo password from the first line of stdin
    #[arg(long)]
    password_stdin: bool,

    /// Override the command dialect
    #[arg(long, value_enum)]
    platform: Option<PlatformArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum PlatformArg {
    Linux,
    Macos,
}

impl From<PlatformArg> for Platform {
    fn from(arg: PlatformArg) -> Self {
        match arg {
            PlatformArg::Linux => Platform::Linux,
            PlatformArg::Macos => Platform::MacOs,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the tunnel up
    Start,
    /// Tear the tunnel down
    Stop,
    /// Show the tunnel state
    Status,

    /// System SOCKS proxy
    #[command(subcommand)]
    Proxy(ProxyCommands),

    /// Install the relay service descriptor and its scripts
    Install {
        /// Service descriptor as JSON
        descriptor: PathBuf,
        /// Script files installed next to the descriptor
        #[arg(short, long = "script")]
        scripts: Vec<PathBuf>,
    },

    /// Write files with elevated privilege (DEST=LOCAL_SOURCE)
    WriteConfig {
        #[arg(required = true)]
        files: Vec<String>,
    },

    /// Persisted proxy nodes
    #[command(subcommand)]
    Nodes(NodeCommands),

    /// Per-node proxy-core services
    #[command(subcommand)]
    Service(ServiceCommands),

    /// Proxy-core binary
    #[command(subcommand)]
    Core(CoreCommands),

    /// Remove node services, the proxy core and node configs
    Reset,

    /// Effective configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ProxyCommands {
    On,
    Off,
}

#[derive(Subcommand)]
enum NodeCommands {
    /// Merge node records from a JSON array file ("-" for stdin)
    Merge {
        file: PathBuf,
        /// Node store path
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Print the stored nodes
    List {
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ServiceCommands {
    Start { label: String },
    Stop { label: String },
    Status { label: String },
}

#[derive(Subcommand)]
enum CoreCommands {
    /// Download the core unless installed
    Init {
        /// Return as soon as the download has started
        #[arg(long)]
        no_wait: bool,
    },
    /// Download the core again
    Update {
        #[arg(long)]
        no_wait: bool,
    },
    /// Whether a download is running
    Status,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.verbose { "debug" } else { &cli.log_level };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("xstreamctl={},libxstream={}", log_level, log_level))
    });

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

fn default_config_path() -> PathBuf {
    XstreamConfig::default().paths.config_dir.join("xstream.toml")
}

fn read_password_stdin() -> anyhow::Result<PrivilegeCredential> {
    let mut line = Zeroizing::new(String::new());
    std::io::stdin()
        .read_line(&mut line)
        .context("failed to read password from stdin")?;
    Ok(PrivilegeCredential::new(line.trim_end_matches(['\r', '\n'])))
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let content = if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("failed to read stdin")?
    } else {
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?
    };
    serde_json::from_str(&content).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn script_payloads(paths: &[PathBuf]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut scripts = BTreeMap::new();
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("{} has no file name", path.display()))?;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        scripts.insert(name, content);
    }
    Ok(scripts)
}

fn config_files(entries: &[String]) -> anyhow::Result<BTreeMap<PathBuf, String>> {
    let mut files = BTreeMap::new();
    for entry in entries {
        let Some((dest, source)) = entry.split_once('=') else {
            bail!("expected DEST=LOCAL_SOURCE, got '{}'", entry);
        };
        let content = std::fs::read_to_string(source)
            .with_context(|| format!("failed to read {}", source))?;
        files.insert(PathBuf::from(dest), content);
    }
    Ok(files)
}

/// Bridge request for a command, or `None` when the command is answered locally
fn build_request(command: &Commands) -> anyhow::Result<Option<Request>> {
    Ok(Some(match command {
        Commands::Start => Request::StartTunnel,
        Commands::Stop => Request::StopTunnel,
        Commands::Status => Request::TunnelStatus,
        Commands::Proxy(ProxyCommands::On) => Request::SetSystemProxy { enable: true, password: None },
        Commands::Proxy(ProxyCommands::Off) => Request::SetSystemProxy { enable: false, password: None },
        Commands::Install { descriptor, scripts } => {
            let descriptor: ServiceDescriptor = serde_json::from_value(read_json(descriptor)?)
                .context("invalid service descriptor")?;
            Request::InstallTunnelService {
                descriptor,
                scripts: script_payloads(scripts)?,
                password: None,
            }
        }
        Commands::WriteConfig { files } => Request::WriteConfigFiles {
            files: config_files(files)?,
            password: None,
        },
        Commands::Nodes(NodeCommands::Merge { file, .. }) => Request::MergeNodeConfig {
            nodes: read_json(file)?,
        },
        Commands::Nodes(NodeCommands::List { .. }) => return Ok(None),
        Commands::Service(ServiceCommands::Start { label }) => Request::StartNodeService {
            label: label.clone(),
            password: None,
        },
        Commands::Service(ServiceCommands::Stop { label }) => Request::StopNodeService {
            label: label.clone(),
            password: None,
        },
        Commands::Service(ServiceCommands::Status { label }) => Request::CheckNodeStatus {
            label: label.clone(),
            password: None,
        },
        Commands::Core(CoreCommands::Init { no_wait }) => Request::InitCore { wait: !no_wait },
        Commands::Core(CoreCommands::Update { no_wait }) => Request::UpdateCore { wait: !no_wait },
        Commands::Core(CoreCommands::Status) => Request::IsCoreDownloading,
        Commands::Reset => Request::ResetCoreAndConfig { password: None },
        Commands::Config(ConfigCommands::Show) => return Ok(None),
    }))
}

fn needs_privilege(command: &Commands) -> bool {
    !matches!(
        command,
        Commands::Status
            | Commands::Nodes(_)
            | Commands::Config(_)
            | Commands::Core(CoreCommands::Status)
    )
}

fn print_response(response: &Response) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = XstreamConfig::load_or_default(&config_path)?;
    if let Some(platform) = cli.platform {
        config.platform = platform.into();
    }
    if let Commands::Nodes(NodeCommands::Merge { store: Some(store), .. } | NodeCommands::List { store: Some(store) }) =
        &cli.command
    {
        config.paths.node_store = store.clone();
    }
    config.validate()?;
    debug!("Using configuration from {}", config_path.display());

    if let Commands::Config(ConfigCommands::Show) = &cli.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(true);
    }

    let credential = if cli.password_stdin {
        read_password_stdin()?
    } else {
        if !cli.dry_run && !is_root() && needs_privilege(&cli.command) {
            warn!("No password supplied; privileged steps need passwordless sudo");
        }
        PrivilegeCredential::empty()
    };
    let credentials: Arc<dyn CredentialProvider> = Arc::new(StaticCredential::new(credential));
    let executor: Arc<dyn PrivilegedExecutor> = if cli.dry_run {
        Arc::new(DryRunExecutor::new())
    } else {
        Arc::new(SudoExecutor::new())
    };

    let bridge = Arc::new(NativeBridge::from_config(
        config,
        executor,
        credentials,
        Arc::new(HttpFetcher::new()?),
    ));

    let response = match build_request(&cli.command)? {
        Some(request) => bridge
            .dispatch(request)
            .await
            .context("request task ended without a response")?,
        None => match bridge.store().load().await {
            Ok(nodes) => Response::Ok { data: json!(nodes) },
            Err(e) => e.into(),
        },
    };

    print_response(&response)?;
    Ok(response.is_ok())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(2);
        }
    }
}

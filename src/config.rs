//! Configuration and CLI argument parsing for ssh-utils

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::error::{Result, SshError};
use crate::ssh::config::Credentials;

/// Connection timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// How long an elevation command is watched for a password prompt
pub const DEFAULT_CHALLENGE_TIMEOUT_MS: u64 = 10_000;

/// How long a scripted shell may stay silent before its batch is abandoned
pub const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 60;

/// How long interrupted channels get to close before their session is closed
pub const DEFAULT_INTERRUPT_GRACE_MS: u64 = 2_000;

/// Tasks in flight at once during a tree synchronization
pub const DEFAULT_SYNC_CONCURRENCY: usize = 4;

/// Remote directory elevated transfers are staged under
pub const DEFAULT_STAGING_ROOT: &str = "/tmp/ssh-utils";

/// Default max characters for a command (None = unlimited)
pub const DEFAULT_MAX_CHARS: Option<usize> = None;

/// Engine tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub connect_timeout: Duration,
    pub challenge_timeout: Duration,
    /// Silence allowed between outputs of a scripted shell command
    pub response_timeout: Duration,
    pub interrupt_grace: Duration,
    pub sync_concurrency: usize,
    pub staging_root: String,
    /// Longest accepted command (None = unlimited)
    pub max_chars: Option<usize>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            challenge_timeout: Duration::from_millis(DEFAULT_CHALLENGE_TIMEOUT_MS),
            response_timeout: Duration::from_secs(DEFAULT_RESPONSE_TIMEOUT_SECS),
            interrupt_grace: Duration::from_millis(DEFAULT_INTERRUPT_GRACE_MS),
            sync_concurrency: DEFAULT_SYNC_CONCURRENCY,
            staging_root: DEFAULT_STAGING_ROOT.to_string(),
            max_chars: DEFAULT_MAX_CHARS,
        }
    }
}

/// ssh-utils CLI Arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "ssh-utils")]
#[command(version)]
#[command(about = "Run commands and move files on remote hosts over SSH")]
pub struct Args {
    /// SSH host to connect to
    #[arg(long, global = true, env = "SSH_UTILS_HOST")]
    pub host: Option<String>,

    /// SSH port
    #[arg(long, global = true, env = "SSH_UTILS_PORT")]
    pub port: Option<u16>,

    /// SSH username
    #[arg(long, global = true, env = "SSH_UTILS_USER")]
    pub user: Option<String>,

    /// SSH password (alternative to key)
    #[arg(long, global = true, env = "SSH_UTILS_PASSWORD")]
    pub password: Option<String>,

    /// Path to SSH private key file (alternative to password)
    #[arg(long, global = true, env = "SSH_UTILS_KEY")]
    pub key: Option<PathBuf>,

    /// Passphrase for the private key
    #[arg(long, global = true, env = "SSH_UTILS_PASSPHRASE")]
    pub passphrase: Option<String>,

    /// Password for `sudo` prompts (if different from password)
    #[arg(long, global = true, env = "SSH_UTILS_SUDO_PASSWORD")]
    pub sudo_password: Option<String>,

    /// JSON credentials file (host, port, username/userName/user, password, privateKey)
    #[arg(long, global = true, env = "SSH_UTILS_CREDENTIALS")]
    pub credentials: Option<PathBuf>,

    /// Connection timeout in seconds
    #[arg(long, global = true, default_value = "30", env = "SSH_UTILS_TIMEOUT")]
    pub timeout: u64,

    /// Seconds a run-multiple command may stay silent
    #[arg(
        long,
        global = true,
        default_value = "60",
        env = "SSH_UTILS_RESPONSE_TIMEOUT"
    )]
    pub response_timeout: u64,

    /// Concurrent transfers during directory synchronization
    #[arg(long, global = true, default_value = "4", env = "SSH_UTILS_CONCURRENCY")]
    pub concurrency: usize,

    /// Maximum characters for command length.
    /// Use "none", "0", or negative value to disable limit.
    #[arg(long = "maxChars", global = true, env = "SSH_UTILS_MAX_CHARS")]
    pub max_chars: Option<String>,

    /// Use the elevated variant of file operations
    #[arg(long, global = true, default_value = "false")]
    pub sudo: bool,

    /// Debug logging
    #[arg(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// One public operation
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run commands one after another and print their output
    Exec {
        #[arg(required = true)]
        commands: Vec<String>,
    },
    /// Run commands, streaming their output as it arrives
    Run {
        #[arg(required = true)]
        commands: Vec<String>,
    },
    /// Run commands in one shell and print the transcript
    RunMultiple {
        #[arg(required = true)]
        commands: Vec<String>,
    },
    /// Download a remote file
    ReadFile { remote: String, local: PathBuf },
    /// Print a remote file
    GetFile { remote: String },
    /// Upload a local file
    PutFile { local: PathBuf, remote: String },
    /// Write text to a remote file
    WriteFile { remote: String, content: String },
    /// Replace a remote directory with a local tree
    PutDir { local: PathBuf, remote: String },
    /// Download a remote tree
    GetDir { remote: String, local: PathBuf },
    /// Create a remote directory and its parents
    Mkdir { path: String },
    /// Remove a remote file or directory recursively
    Rmdir { path: String },
    /// Tell whether a remote path exists
    Exists { path: String },
    /// Remove and recreate a remote directory
    EnsureEmptyDir { path: String },
    /// Append a line to a remote file unless it is already there
    EnsureFileContains { path: String, text: String },
    /// Give a remote tree to the connecting user
    EnsureOwnership { path: String },
}

/// Parsed and validated configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SSH host from the command line
    pub host: Option<String>,

    /// SSH port from the command line
    pub port: Option<u16>,

    /// SSH username from the command line
    pub user: Option<String>,

    /// SSH password
    pub password: Option<String>,

    /// Path to SSH private key
    pub key: Option<PathBuf>,

    /// Private key passphrase
    pub passphrase: Option<String>,

    /// Password for sudo prompts
    pub sudo_password: Option<String>,

    /// JSON credentials file
    pub credentials: Option<PathBuf>,

    /// Engine settings
    pub settings: EngineSettings,

    /// Whether elevated file operations were requested
    pub sudo: bool,

    /// Whether debug logging was requested
    pub verbose: bool,

    /// Operation to perform
    pub command: Command,
}

impl Config {
    /// Create Config from CLI Args
    pub fn from_args(args: Args) -> Result<Self> {
        validate_args(&args)?;

        let settings = EngineSettings {
            connect_timeout: Duration::from_secs(args.timeout),
            response_timeout: Duration::from_secs(args.response_timeout),
            sync_concurrency: args.concurrency,
            max_chars: parse_max_chars(args.max_chars.as_deref()),
            ..EngineSettings::default()
        };

        Ok(Config {
            host: args.host.filter(|h| !h.is_empty()),
            port: args.port,
            user: args.user.filter(|u| !u.is_empty()),
            password: sanitize_password(args.password),
            key: args.key,
            passphrase: sanitize_password(args.passphrase),
            sudo_password: sanitize_password(args.sudo_password),
            credentials: args.credentials,
            settings,
            sudo: args.sudo,
            verbose: args.verbose,
            command: args.command,
        })
    }

    /// Build the credentials to connect with
    ///
    /// The credentials file, when given, is read first; command-line values
    /// override its fields.
    pub async fn load_credentials(&self) -> Result<Credentials> {
        let mut credentials = match self.credentials {
            Some(ref path) => {
                let json = tokio::fs::read_to_string(path).await.map_err(|e| {
                    SshError::config(format!(
                        "Failed to read credentials file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Credentials::from_json(&json)?
            }
            None => Credentials::new("localhost", ""),
        };

        if let Some(ref host) = self.host {
            credentials.host = host.clone();
        }
        if let Some(port) = self.port {
            credentials.port = port;
        }
        if let Some(ref user) = self.user {
            credentials.username = user.clone();
        }
        if let Some(ref password) = self.password {
            credentials.password = Some(password.clone());
        }
        if let Some(ref key_path) = self.key {
            let key = tokio::fs::read_to_string(key_path).await.map_err(|e| {
                SshError::config(format!(
                    "Failed to read SSH key file {}: {}",
                    key_path.display(),
                    e
                ))
            })?;
            credentials.private_key = Some(key);
        }
        if let Some(ref passphrase) = self.passphrase {
            credentials.passphrase = Some(passphrase.clone());
        }
        if let Some(ref sudo_password) = self.sudo_password {
            credentials.sudo_password = Some(sudo_password.clone());
        }

        credentials.validate()?;
        Ok(credentials)
    }
}

/// Validate CLI arguments
fn validate_args(args: &Args) -> Result<()> {
    let mut errors = Vec::new();
    let from_file = args.credentials.is_some();

    if !from_file && args.host.as_deref().is_none_or(str::is_empty) {
        errors.push("Missing required --host (or --credentials)".to_string());
    }

    if !from_file && args.user.as_deref().is_none_or(str::is_empty) {
        errors.push("Missing required --user (or --credentials)".to_string());
    }

    // Must have either password or key
    if !from_file && args.password.is_none() && args.key.is_none() {
        errors.push("Must provide either --password or --key".to_string());
    }

    // If key is provided, check if file exists
    if let Some(ref key_path) = args.key {
        if !key_path.exists() {
            errors.push(format!("SSH key file not found: {}", key_path.display()));
        }
    }

    if let Some(ref path) = args.credentials {
        if !path.exists() {
            errors.push(format!("Credentials file not found: {}", path.display()));
        }
    }

    if args.concurrency == 0 {
        errors.push("--concurrency must be at least 1".to_string());
    }

    if args.response_timeout == 0 {
        errors.push("--response-timeout must be at least 1".to_string());
    }

    if !errors.is_empty() {
        return Err(SshError::Config(format!(
            "Configuration error:\n{}",
            errors.join("\n")
        )));
    }

    Ok(())
}

/// Parse max_chars argument
///
/// - "none" (case-insensitive) → None (unlimited)
/// - "0" or negative → None (unlimited)
/// - positive integer → Some(value)
/// - None (not provided) → DEFAULT_MAX_CHARS
pub fn parse_max_chars(value: Option<&str>) -> Option<usize> {
    match value {
        None => DEFAULT_MAX_CHARS,
        Some(s) => {
            if s.eq_ignore_ascii_case("none") {
                return None;
            }

            match s.parse::<i64>() {
                Ok(n) if n <= 0 => None,
                Ok(n) => Some(n as usize),
                Err(_) => DEFAULT_MAX_CHARS,
            }
        }
    }
}

/// Sanitize password: return None if empty
fn sanitize_password(password: Option<String>) -> Option<String> {
    password.filter(|p| !p.is_empty())
}

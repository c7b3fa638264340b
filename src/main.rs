//! ssh-utils - Entry point
//!
//! Parses CLI arguments, builds the credentials, runs one operation and
//! prints its result. Logs go to stderr so stdout carries only remote output.

use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ssh_utils::config::{Args, Command, Config};
use ssh_utils::error::Result;
use ssh_utils::ssh::{Credentials, StreamEvent, StreamKind};
use ssh_utils::{SshUtils, SyncReport};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_args(args)?;
    let credentials = config.load_credentials().await?;

    info!("ssh-utils v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Target: {}:{}", credentials.label(), credentials.port);
    info!(
        "Timeout: {}s, Concurrency: {}, Max chars: {}",
        config.settings.connect_timeout.as_secs(),
        config.settings.sync_concurrency,
        config
            .settings
            .max_chars
            .map_or("unlimited".to_string(), |n| n.to_string())
    );

    let utils = SshUtils::builder().settings(config.settings.clone()).build();
    let interrupts = utils.forward_interrupts();

    let result = dispatch(&utils, credentials, &config).await;

    interrupts.abort();
    if let Err(ref e) = result {
        error!("{}", e);
    }
    result
}

async fn dispatch(utils: &SshUtils, creds: Credentials, config: &Config) -> Result<()> {
    let sudo = config.sudo;

    match config.command.clone() {
        Command::Exec { commands } => {
            let output = utils
                .exec_each(creds, commands, |report| {
                    debug!("command {} finished: {}", report.index + 1, report.command);
                })
                .await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            output.into_result().map(|_| ())
        }
        Command::Run { commands } => {
            let mut stream = utils.run(creds, commands).await?;
            let mut stdout = tokio::io::stdout();
            let mut stderr = tokio::io::stderr();
            while let Some(event) = stream.next().await {
                match event {
                    StreamEvent::Started { index, command, .. } => {
                        debug!("command {} started: {}", index + 1, command);
                    }
                    StreamEvent::Chunk {
                        kind: StreamKind::Stdout,
                        data,
                        ..
                    } => {
                        stdout.write_all(&data).await?;
                        stdout.flush().await?;
                    }
                    StreamEvent::Chunk {
                        kind: StreamKind::Stderr,
                        data,
                        ..
                    } => {
                        stderr.write_all(&data).await?;
                        stderr.flush().await?;
                    }
                    StreamEvent::Finished { index, error } => {
                        if let Some(e) = error {
                            warn!("command {} failed: {}", index + 1, e);
                        }
                    }
                }
            }
            stream.finish().await?.into_result().map(|_| ())
        }
        Command::RunMultiple { commands } => {
            let transcript = utils
                .run_multiple(creds, commands, |entry| {
                    debug!("{} -> {:?}", entry.command, entry.exit_status);
                })
                .await?;
            print!("{}", transcript.text);
            Ok(())
        }
        Command::ReadFile { remote, local } => {
            let received = if sudo {
                utils.read_file_sudo(creds, &remote, &local).await?
            } else {
                utils.read_file(creds, &remote, &local).await?
            };
            info!("{} -> {} ({} bytes)", remote, local.display(), received);
            Ok(())
        }
        Command::GetFile { remote } => {
            let mut reader = if sudo {
                utils.get_file_sudo(creds, &remote).await?
            } else {
                utils.get_file(creds, &remote).await?
            };
            let mut stdout = tokio::io::stdout();
            let copied = tokio::io::copy(&mut reader, &mut stdout).await;
            reader.close().await;
            copied?;
            stdout.flush().await?;
            Ok(())
        }
        Command::PutFile { local, remote } => {
            let sent = if sudo {
                utils.put_file_sudo(creds, &local, &remote).await?
            } else {
                utils.put_file(creds, &local, &remote).await?
            };
            info!("{} -> {} ({} bytes)", local.display(), remote, sent);
            Ok(())
        }
        Command::WriteFile { remote, content } => {
            if sudo {
                utils.write_file_sudo(creds, &remote, content).await
            } else {
                utils.write_file(creds, &remote, content).await
            }
        }
        Command::PutDir { local, remote } => {
            let report = if sudo {
                utils.put_dir_sudo(creds, &local, &remote).await?
            } else {
                utils.put_dir(creds, &local, &remote).await?
            };
            summarize(&report);
            report.into_result().map(|_| ())
        }
        Command::GetDir { remote, local } => {
            let report = if sudo {
                utils.get_dir_sudo(creds, &remote, &local).await?
            } else {
                utils.get_dir(creds, &remote, &local).await?
            };
            summarize(&report);
            report.into_result().map(|_| ())
        }
        Command::Mkdir { path } => {
            if sudo {
                utils.mkdir_sudo(creds, &path).await
            } else {
                utils.mkdir(creds, &path).await
            }
        }
        Command::Rmdir { path } => {
            if sudo {
                utils.rmdir_sudo(creds, &path).await
            } else {
                utils.rmdir(creds, &path).await
            }
        }
        Command::Exists { path } => {
            let exists = if sudo {
                utils.file_exists_sudo(creds, &path).await?
            } else {
                utils.file_exists(creds, &path).await?
            };
            println!("{}", exists);
            Ok(())
        }
        Command::EnsureEmptyDir { path } => {
            if sudo {
                utils.ensure_empty_dir_sudo(creds, &path).await
            } else {
                utils.ensure_empty_dir(creds, &path).await
            }
        }
        Command::EnsureFileContains { path, text } => {
            let done = if sudo {
                utils.ensure_file_contains_sudo(creds, &path, &text).await?
            } else {
                utils.ensure_file_contains(creds, &path, &text).await?
            };
            info!("{}: {:?}", path, done);
            Ok(())
        }
        Command::EnsureOwnership { path } => utils.ensure_ownership(creds, &path).await,
    }
}

fn summarize(report: &SyncReport) {
    info!(
        "{} directories, {} files, {} failed",
        report.directories,
        report.files,
        report.failures.len()
    );
    for failure in &report.failures {
        warn!("{}: {}", failure.task, failure.error);
    }
}

//! The public operation surface
//!
//! Every operation takes a [`Target`]: credentials to connect with for the
//! duration of the call, or a [`Session`] the caller keeps. The target is
//! resolved once, at the start of the call, and an engine-opened session is
//! closed when the call returns.

mod elevated;
mod files;

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::EngineSettings;
use crate::error::Result;
use crate::ssh::cancel::CancellationBridge;
use crate::ssh::channel::ChannelExecutor;
use crate::ssh::classify::{OutputClassifier, PatternClassifier};
use crate::ssh::command::{CommandList, CommandReport, CommandSequencer, RunStream, SequenceOutput};
use crate::ssh::config::Credentials;
use crate::ssh::connection::{ConnectionManager, Session, Target};
use crate::ssh::remote::RusshConnector;
use crate::ssh::shell::{ScriptedShell, Transcript, TranscriptEntry};
use crate::ssh::transport::Connector;
use crate::sync::{SyncOptions, TreeSyncEngine};

pub use files::{Containment, RemoteReader};

/// Remote-session orchestration over SSH
pub struct SshUtils {
    manager: ConnectionManager,
    sequencer: CommandSequencer,
    shell: ScriptedShell,
    sync: TreeSyncEngine,
    bridge: Arc<CancellationBridge>,
    settings: EngineSettings,
}

/// Builds an [`SshUtils`]
#[derive(Default)]
pub struct SshUtilsBuilder {
    connector: Option<Arc<dyn Connector>>,
    classifier: Option<Arc<dyn OutputClassifier>>,
    settings: EngineSettings,
}

impl SshUtilsBuilder {
    /// Use another transport (the default is russh)
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use another output classifier (the default matches English sudo)
    pub fn classifier(mut self, classifier: Arc<dyn OutputClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> SshUtils {
        let settings = self.settings;
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(RusshConnector::new(settings.connect_timeout)));
        let classifier = self
            .classifier
            .unwrap_or_else(|| Arc::new(PatternClassifier::default()));

        let bridge = Arc::new(CancellationBridge::new(settings.interrupt_grace));
        let executor = ChannelExecutor::new(classifier, settings.challenge_timeout);
        let sequencer = CommandSequencer::new(executor.clone());
        let sync = TreeSyncEngine::new(
            sequencer.clone(),
            SyncOptions {
                concurrency: settings.sync_concurrency,
            },
        );

        SshUtils {
            manager: ConnectionManager::new(connector, Arc::clone(&bridge)),
            sequencer,
            shell: ScriptedShell::new(executor, settings.response_timeout),
            sync,
            bridge,
            settings,
        }
    }
}

impl Default for SshUtils {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SshUtils {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> SshUtilsBuilder {
        SshUtilsBuilder::default()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Bridge every session opened through this instance is tracked by
    pub fn bridge(&self) -> &Arc<CancellationBridge> {
        &self.bridge
    }

    fn classifier(&self) -> &Arc<dyn OutputClassifier> {
        self.sequencer.executor().classifier()
    }

    /// Open a session the caller owns and must close
    pub async fn connect(&self, credentials: &Credentials) -> Result<Session> {
        self.manager.open(credentials).await
    }

    /// Resolve `target`, run `op` on the session, then release it
    async fn with_session<T, F, Fut>(&self, target: Target, op: F) -> Result<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.manager.connect(target).await?;
        let result = op(lease.session().clone()).await;
        lease.release().await;
        result
    }

    /// Run one command or a list, one after another
    ///
    /// Command failures are reported in the returned output, not as `Err`:
    /// `Err` means the commands could not be attempted at all.
    pub async fn exec(
        &self,
        target: impl Into<Target>,
        commands: impl Into<CommandList>,
    ) -> Result<SequenceOutput> {
        self.exec_each(target, commands, |_| {}).await
    }

    /// [`SshUtils::exec`] with an observer called as each command finishes
    pub async fn exec_each<F>(
        &self,
        target: impl Into<Target>,
        commands: impl Into<CommandList>,
        observer: F,
    ) -> Result<SequenceOutput>
    where
        F: FnMut(&CommandReport),
    {
        let commands = commands.into().sanitized(self.settings.max_chars)?;
        self.with_session(target.into(), |session| async move {
            Ok(self.sequencer.run(&session, &commands, observer).await)
        })
        .await
    }

    /// Run commands in the background, streaming their output
    pub async fn run(
        &self,
        target: impl Into<Target>,
        commands: impl Into<CommandList>,
    ) -> Result<RunStream> {
        let commands = commands.into().sanitized(self.settings.max_chars)?;
        let lease = self.manager.connect(target.into()).await?;
        Ok(self.sequencer.stream(lease, commands))
    }

    /// Run commands through one shell, producing a transcript
    pub async fn run_multiple<F>(
        &self,
        target: impl Into<Target>,
        commands: impl Into<CommandList>,
        on_complete: F,
    ) -> Result<Transcript>
    where
        F: FnMut(&TranscriptEntry),
    {
        let commands = commands.into().sanitized(self.settings.max_chars)?;
        self.with_session(target.into(), |session| async move {
            self.shell.run(&session, &commands, on_complete).await
        })
        .await
    }

    /// Interrupt every channel on every open session
    pub async fn interrupt(&self) {
        self.bridge.interrupt_all().await;
    }

    /// Forward Ctrl+C into open channels until the returned task is aborted
    pub fn forward_interrupts(&self) -> JoinHandle<()> {
        Arc::clone(&self.bridge).listen()
    }
}

impl std::fmt::Debug for SshUtils {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshUtils")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

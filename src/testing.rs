//! In-memory transport for tests
//!
//! [`FakeTransport`] interprets the handful of shell commands the engine
//! issues against a [`FakeFiles`] tree, including a `sudo` that prompts for a
//! password on a pseudo-terminal. [`FakeFiles`] doubles as the file-transfer
//! subsystem, so files written over either path are visible to both.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};

use crate::error::{Result, SshError};
use crate::ssh::config::Credentials;
use crate::ssh::transport::{
    ChannelControl, ChannelEvent, Connector, EntryKind, FileTransfer, RawChannel, RemoteEntry,
    RemoteRead, Transport,
};

const ETX: u8 = 0x03;

const TERMINAL_REQUIRED: &str = "sudo: a terminal is required to read the password; \
either use the -S option to read from standard input or configure an askpass helper\n";

const PROMPT: &str = "[sudo] password for user: ";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Something the fake file tree was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    Mkdir(String),
    Upload(String),
    Download(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Missing,
    Denied,
    IsDir,
    NotDir,
    Exists,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Fault::Missing => "No such file or directory",
            Fault::Denied => "Permission denied",
            Fault::IsDir => "Is a directory",
            Fault::NotDir => "Not a directory",
            Fault::Exists => "File exists",
        })
    }
}

type Outcome<T> = std::result::Result<T, Fault>;

#[derive(Debug, Clone)]
enum Node {
    Dir { root: bool },
    File { data: Vec<u8>, root: bool },
}

impl Node {
    fn owned_by_root(&self) -> bool {
        match self {
            Node::Dir { root } | Node::File { root, .. } => *root,
        }
    }
}

fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(i) => Some(path[..i].to_string()),
        None => None,
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn child_of(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

fn is_under(path: &str, root: &str) -> bool {
    root == "/" || path == root || path.starts_with(&format!("{}/", root))
}

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    denied: Vec<String>,
    unlistable: Vec<String>,
    log: Vec<FileOp>,
    in_flight: usize,
    max_in_flight: usize,
}

impl Tree {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn is_dir(&self, path: &str) -> bool {
        path == "/" || matches!(self.nodes.get(path), Some(Node::Dir { .. }))
    }

    /// Whether the connecting user may create or remove `path`
    fn writable(&self, path: &str) -> bool {
        if self.denied.iter().any(|prefix| is_under(path, prefix)) {
            return false;
        }
        !parent_of(path)
            .and_then(|parent| self.nodes.get(&parent))
            .is_some_and(Node::owned_by_root)
    }

    fn seed_dirs(&mut self, path: &str) {
        let mut current = String::from("/");
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = child_of(&current, part);
            self.nodes
                .entry(current.clone())
                .or_insert(Node::Dir { root: false });
        }
    }

    fn mkdir_p(&mut self, path: &str, root: bool) -> Outcome<()> {
        let mut current = String::from("/");
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let next = child_of(&current, part);
            match self.nodes.get(&next) {
                Some(Node::Dir { .. }) => {}
                Some(Node::File { .. }) => return Err(Fault::Exists),
                None => {
                    if !root && !self.writable(&next) {
                        return Err(Fault::Denied);
                    }
                    self.nodes.insert(next.clone(), Node::Dir { root });
                    self.log.push(FileOp::Mkdir(next.clone()));
                }
            }
            current = next;
        }
        Ok(())
    }

    fn mkdir_one(&mut self, path: &str, root: bool) -> Outcome<()> {
        if self.is_dir(path) {
            return Ok(());
        }
        if self.exists(path) {
            return Err(Fault::Exists);
        }
        if !root && !self.writable(path) {
            return Err(Fault::Denied);
        }
        if !parent_of(path).is_some_and(|parent| self.is_dir(&parent)) {
            return Err(Fault::Missing);
        }
        self.nodes.insert(path.to_string(), Node::Dir { root });
        self.log.push(FileOp::Mkdir(path.to_string()));
        Ok(())
    }

    fn remove(&mut self, path: &str, root: bool) -> Outcome<()> {
        if !self.exists(path) {
            return Ok(());
        }
        if !root && !self.writable(path) {
            return Err(Fault::Denied);
        }
        self.nodes.retain(|key, _| !is_under(key, path));
        Ok(())
    }

    fn write(&mut self, path: &str, data: Vec<u8>, root: bool, append: bool) -> Outcome<()> {
        let parent = parent_of(path).ok_or(Fault::IsDir)?;
        let existing = self.nodes.get(path).cloned();
        if let Some(Node::Dir { .. }) = existing {
            return Err(Fault::IsDir);
        }
        if !root {
            let file_locked = existing.as_ref().is_some_and(Node::owned_by_root);
            if file_locked || !self.writable(path) {
                return Err(Fault::Denied);
            }
        }
        if !self.is_dir(&parent) {
            return Err(if self.exists(&parent) {
                Fault::NotDir
            } else {
                Fault::Missing
            });
        }
        let node = match existing {
            Some(Node::File {
                data: mut old,
                root: owner,
            }) if append => {
                old.extend(data);
                Node::File {
                    data: old,
                    root: owner,
                }
            }
            Some(Node::File { root: owner, .. }) => Node::File { data, root: owner },
            _ => Node::File { data, root },
        };
        self.nodes.insert(path.to_string(), node);
        Ok(())
    }

    fn read(&self, path: &str) -> Outcome<Vec<u8>> {
        match self.nodes.get(path) {
            Some(Node::File { data, .. }) => Ok(data.clone()),
            Some(Node::Dir { .. }) => Err(Fault::IsDir),
            None if path == "/" => Err(Fault::IsDir),
            None => Err(Fault::Missing),
        }
    }

    fn list(&self, path: &str) -> Outcome<Vec<RemoteEntry>> {
        if !self.exists(path) {
            return Err(Fault::Missing);
        }
        if !self.is_dir(path) {
            return Err(Fault::NotDir);
        }
        Ok(self
            .nodes
            .iter()
            .filter(|(key, _)| key.as_str() != "/" && parent_of(key).as_deref() == Some(path))
            .map(|(key, node)| RemoteEntry {
                name: name_of(key).to_string(),
                kind: match node {
                    Node::Dir { .. } => EntryKind::Directory,
                    Node::File { .. } => EntryKind::File,
                },
            })
            .collect())
    }

    /// `cp [-R] source target`; a source ending in `/.` copies its contents
    fn copy(&mut self, source: &str, target: &str, recursive: bool, root: bool) -> std::result::Result<(), String> {
        let contents = source.ends_with("/.");
        let from = normalize(source);
        let to = normalize(target);

        match self.nodes.get(&from).cloned() {
            None => Err(format!("cp: cannot stat '{}': {}", source, Fault::Missing)),
            Some(Node::File { data, .. }) => {
                let dest = if self.is_dir(&to) {
                    child_of(&to, name_of(&from))
                } else {
                    to
                };
                self.write(&dest, data, root, false)
                    .map_err(|fault| format!("cp: cannot create regular file '{}': {}", target, fault))
            }
            Some(Node::Dir { .. }) => {
                if !recursive {
                    return Err(format!("cp: -r not specified; omitting directory '{}'", source));
                }
                let dest = if contents || !self.is_dir(&to) {
                    to
                } else {
                    child_of(&to, name_of(&from))
                };
                self.mkdir_one(&dest, root)
                    .map_err(|fault| format!("cp: cannot create directory '{}': {}", target, fault))?;

                let entries: Vec<(String, Node)> = self
                    .nodes
                    .iter()
                    .filter(|(key, _)| key.as_str() != from && is_under(key, &from))
                    .map(|(key, node)| (key.clone(), node.clone()))
                    .collect();
                for (path, node) in entries {
                    let rel = &path[from.len()..];
                    let copied = if dest == "/" {
                        rel.to_string()
                    } else {
                        format!("{}{}", dest, rel)
                    };
                    let result = match node {
                        Node::Dir { .. } => self.mkdir_one(&copied, root),
                        Node::File { data, .. } => self.write(&copied, data, root, false),
                    };
                    result.map_err(|fault| format!("cp: cannot create '{}': {}", copied, fault))?;
                }
                Ok(())
            }
        }
    }

    fn chown(&mut self, path: &str, root: bool) -> std::result::Result<(), String> {
        if !self.exists(path) {
            return Err(format!("chown: cannot access '{}': {}", path, Fault::Missing));
        }
        if !root {
            return Err(format!(
                "chown: changing ownership of '{}': Operation not permitted",
                path
            ));
        }
        for (key, node) in self.nodes.iter_mut() {
            if is_under(key, path) {
                match node {
                    Node::Dir { root } | Node::File { root, .. } => *root = false,
                }
            }
        }
        Ok(())
    }
}

/// In-memory remote file tree
///
/// Paths added with [`FakeFiles::add_file`] and [`FakeFiles::add_dir`] belong
/// to the connecting user. Directories created through an elevated command
/// belong to root until `chown` hands them back. A denied prefix is never
/// writable by the connecting user.
#[derive(Clone, Default)]
pub struct FakeFiles {
    tree: Arc<Mutex<Tree>>,
}

impl FakeFiles {
    fn lock(&self) -> MutexGuard<'_, Tree> {
        lock(&self.tree)
    }

    pub fn add_file(&self, path: &str, content: impl AsRef<[u8]>) {
        let path = normalize(path);
        let mut tree = self.lock();
        if let Some(parent) = parent_of(&path) {
            tree.seed_dirs(&parent);
        }
        tree.nodes.insert(
            path,
            Node::File {
                data: content.as_ref().to_vec(),
                root: false,
            },
        );
    }

    pub fn add_dir(&self, path: &str) {
        self.lock().seed_dirs(&normalize(path));
    }

    /// Make `prefix` and everything below it read-only for the connecting user
    pub fn deny(&self, prefix: &str) {
        self.lock().denied.push(normalize(prefix));
    }

    /// Fail every directory listing of `path` with permission denied
    pub fn forbid_listing(&self, path: &str) {
        self.lock().unlistable.push(normalize(path));
    }

    pub fn read(&self, path: &str) -> Option<String> {
        self.lock()
            .read(&normalize(path))
            .ok()
            .map(|data| String::from_utf8_lossy(&data).into_owned())
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.lock().is_dir(&normalize(path))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().exists(&normalize(path))
    }

    pub fn log(&self) -> Vec<FileOp> {
        self.lock().log.clone()
    }

    /// Most transfers that were ever running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    fn begin(&self, op: FileOp) {
        let mut tree = self.lock();
        tree.log.push(op);
        tree.in_flight += 1;
        tree.max_in_flight = tree.max_in_flight.max(tree.in_flight);
    }

    fn end(&self) {
        self.lock().in_flight -= 1;
    }

    async fn upload_inner(&self, local: &Path, remote: &str) -> Result<u64> {
        let data = tokio::fs::read(local)
            .await
            .map_err(|e| SshError::transfer(local.display().to_string(), e.to_string(), None))?;
        tokio::task::yield_now().await;
        let sent = data.len() as u64;
        self.lock()
            .write(&normalize(remote), data, false, false)
            .map_err(|fault| fault_error(remote, fault))?;
        Ok(sent)
    }

    async fn download_inner(&self, remote: &str, local: &Path) -> Result<u64> {
        let data = self
            .lock()
            .read(&normalize(remote))
            .map_err(|fault| fault_error(remote, fault))?;
        tokio::task::yield_now().await;
        let received = data.len() as u64;
        tokio::fs::write(local, data)
            .await
            .map_err(|e| SshError::transfer(local.display().to_string(), e.to_string(), None))?;
        Ok(received)
    }
}

fn fault_error(path: &str, fault: Fault) -> SshError {
    let message = match fault {
        Fault::Missing => "No such file".to_string(),
        other => other.to_string(),
    };
    SshError::transfer(path, message, None)
}

#[async_trait]
impl FileTransfer for FakeFiles {
    async fn upload(&self, local: &Path, remote: &str) -> Result<u64> {
        self.begin(FileOp::Upload(normalize(remote)));
        let result = self.upload_inner(local, remote).await;
        self.end();
        result
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<u64> {
        self.begin(FileOp::Download(normalize(remote)));
        let result = self.download_inner(remote, local).await;
        self.end();
        result
    }

    async fn write(&self, remote: &str, content: &[u8]) -> Result<()> {
        self.lock()
            .write(&normalize(remote), content.to_vec(), false, false)
            .map_err(|fault| fault_error(remote, fault))
    }

    async fn open_read(&self, remote: &str) -> Result<RemoteRead> {
        let data = self
            .lock()
            .read(&normalize(remote))
            .map_err(|fault| fault_error(remote, fault))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn exists(&self, remote: &str) -> Result<bool> {
        Ok(self.lock().exists(&normalize(remote)))
    }

    async fn list_dir(&self, remote: &str) -> Result<Vec<RemoteEntry>> {
        let tree = self.lock();
        let path = normalize(remote);
        if tree.unlistable.contains(&path) {
            return Err(fault_error(remote, Fault::Denied));
        }
        tree.list(&path).map_err(|fault| fault_error(remote, fault))
    }
}

#[derive(Debug, Default)]
struct Shared {
    opened: Vec<(String, bool)>,
    inputs: Vec<Vec<u8>>,
    signals: usize,
    open_channels: usize,
    max_open_channels: usize,
    disconnected: bool,
    refusal: Option<String>,
    sudo_secret: Option<String>,
    delays: HashMap<String, Duration>,
    drop_exit_status: bool,
}

/// In-memory transport
#[derive(Clone, Default)]
pub struct FakeTransport {
    shared: Arc<Mutex<Shared>>,
    files: FakeFiles,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every channel open with `message`
    pub fn refuse_channels(self, message: &str) -> Self {
        self.lock().refusal = Some(message.to_string());
        self
    }

    /// Make `sudo` prompt for `secret`
    ///
    /// Without a secret `sudo` runs commands right away, as with `NOPASSWD`.
    pub fn with_sudo_secret(self, secret: &str) -> Self {
        self.lock().sudo_secret = Some(secret.to_string());
        self
    }

    /// Make `program` run for `delay` before doing its work, silently
    pub fn with_delay(self, program: &str, delay: Duration) -> Self {
        self.lock().delays.insert(program.to_string(), delay);
        self
    }

    /// Close channels without reporting an exit status
    pub fn without_exit_status(self) -> Self {
        self.lock().drop_exit_status = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    /// Commands opened so far, with whether each got a pseudo-terminal
    pub fn opened(&self) -> Vec<(String, bool)> {
        self.lock().opened.clone()
    }

    /// Every write to any channel's input, in order
    pub fn inputs(&self) -> Vec<Vec<u8>> {
        self.lock().inputs.clone()
    }

    /// Interrupt signals delivered through the protocol
    pub fn signals(&self) -> usize {
        self.lock().signals
    }

    pub fn max_open_channels(&self) -> usize {
        self.lock().max_open_channels
    }

    pub fn is_disconnected(&self) -> bool {
        self.lock().disconnected
    }

    pub fn files(&self) -> FakeFiles {
        self.files.clone()
    }

    fn sudo_secret(&self) -> Option<String> {
        self.lock().sudo_secret.clone()
    }

    fn delay(&self, program: &str) -> Option<Duration> {
        self.lock().delays.get(program).copied()
    }

    fn record(&self, control: &ChannelControl) {
        let mut shared = self.lock();
        match control {
            ChannelControl::Write(data) => shared.inputs.push(data.clone()),
            ChannelControl::Interrupt => shared.signals += 1,
            ChannelControl::Eof | ChannelControl::Close => {}
        }
    }

    fn channel_closed(&self) {
        let mut shared = self.lock();
        shared.open_channels = shared.open_channels.saturating_sub(1);
    }

    /// Run one command line to completion against the file tree
    fn interpret(&self, line: &str, elevated: bool, last_status: u32) -> Output {
        let tokens = match tokenize(line, last_status) {
            Ok(tokens) => tokens,
            Err(e) => return Output::fail(format!("sh: 1: {}\n", e), 2),
        };

        let mut words = Vec::new();
        let mut redirect = None;
        let mut tokens = tokens.into_iter();
        while let Some(token) = tokens.next() {
            match token {
                Token::Word(word) => words.push(word),
                Token::Redirect { append } => match tokens.next() {
                    Some(Token::Word(target)) => redirect = Some((target, append)),
                    _ => return Output::fail("sh: 1: Syntax error: newline unexpected\n", 2),
                },
            }
        }

        let mut output = self.command(&words, elevated);
        if let Some((target, append)) = redirect {
            let data = std::mem::take(&mut output.stdout);
            if target != "/dev/null" {
                let written = lock(&self.files.tree).write(
                    &normalize(&target),
                    data.into_bytes(),
                    elevated,
                    append,
                );
                if let Err(fault) = written {
                    output.stderr.push_str(&format!("sh: 1: cannot create {}: {}\n", target, fault));
                    output.status = Some(2);
                }
            }
        }
        output
    }

    fn command(&self, words: &[String], elevated: bool) -> Output {
        let Some((name, args)) = words.split_first() else {
            return Output::ok(String::new());
        };
        let (flags, operands) = split_flags(args);
        let mut tree = lock(&self.files.tree);

        match name.as_str() {
            "sudo" if !elevated && self.sudo_secret().is_some() => Output::fail(TERMINAL_REQUIRED, 1),
            "sudo" => {
                drop(tree);
                self.command(args, true)
            }
            "sh" => match args {
                [flag, script] if flag == "-c" => {
                    drop(tree);
                    self.interpret(script, elevated, 0)
                }
                _ => Output::fail("sh: 1: unsupported invocation\n", 2),
            },
            "stty" => Output::ok(String::new()),
            assignment if assignment.contains('=') => Output::ok(String::new()),
            "echo" => Output::ok(format!("{}\n", args.join(" "))),
            "warn" => Output {
                stdout: String::new(),
                stderr: format!("{}\n", args.join(" ")),
                status: None,
            },
            "printf" => match args.split_first() {
                Some((format, rest)) => Output::ok(printf(format, rest)),
                None => Output::fail("printf: usage: printf format [arguments]\n", 2),
            },
            "mkdir" => {
                let mut output = Output::ok(String::new());
                for path in operands {
                    let path = normalize(path);
                    let created = if flags.contains('p') {
                        tree.mkdir_p(&path, elevated)
                    } else {
                        tree.mkdir_one(&path, elevated)
                    };
                    if let Err(fault) = created {
                        output.error(format!("mkdir: cannot create directory '{}': {}", path, fault), 1);
                    }
                }
                output
            }
            "rm" => {
                let mut output = Output::ok(String::new());
                for path in operands {
                    let path = normalize(path);
                    if let Err(fault) = tree.remove(&path, elevated) {
                        output.error(format!("rm: cannot remove '{}': {}", path, fault), 1);
                    }
                }
                output
            }
            "cat" => {
                let mut output = Output::ok(String::new());
                for path in operands {
                    match tree.read(&normalize(path)) {
                        Ok(data) => output.stdout.push_str(&String::from_utf8_lossy(&data)),
                        Err(fault) => output.error(format!("cat: {}: {}", path, fault), 1),
                    }
                }
                output
            }
            "grep" => {
                let Some((pattern, paths)) = operands.split_first() else {
                    return Output::fail("Usage: grep [OPTION]... PATTERNS [FILE]...\n", 2);
                };
                let mut output = Output::ok(String::new());
                let mut matched = false;
                for path in paths {
                    match tree.read(&normalize(path)) {
                        Ok(data) => {
                            for line in String::from_utf8_lossy(&data).lines() {
                                if line.contains(pattern.as_str()) {
                                    matched = true;
                                    if !flags.contains('q') {
                                        output.stdout.push_str(line);
                                        output.stdout.push('\n');
                                    }
                                }
                            }
                        }
                        Err(fault) => output.error(format!("grep: {}: {}", path, fault), 2),
                    }
                }
                if output.status == Some(0) && !matched {
                    output.status = Some(1);
                }
                output
            }
            "ls" => {
                let mut output = Output::ok(String::new());
                for path in operands {
                    let dir = normalize(path);
                    match tree.list(&dir) {
                        Ok(entries) => {
                            let mut names: Vec<String> =
                                entries.into_iter().map(|entry| entry.name).collect();
                            if flags.contains('a') {
                                names.extend([".".to_string(), "..".to_string()]);
                            }
                            names.sort();
                            for name in names {
                                output.stdout.push_str(&name);
                                output.stdout.push('\n');
                            }
                        }
                        Err(Fault::NotDir) => {
                            output.stdout.push_str(path);
                            output.stdout.push('\n');
                        }
                        Err(fault) => {
                            output.error(format!("ls: cannot access '{}': {}", path, fault), 2)
                        }
                    }
                }
                output
            }
            "cp" => match operands.as_slice() {
                [source, target] => {
                    let recursive = flags.contains('R') || flags.contains('r');
                    match tree.copy(source, target, recursive, elevated) {
                        Ok(()) => Output::ok(String::new()),
                        Err(message) => Output::fail(format!("{}\n", message), 1),
                    }
                }
                _ => Output::fail("cp: missing destination file operand\n", 1),
            },
            "chown" => {
                let Some((_owner, paths)) = operands.split_first() else {
                    return Output::fail("chown: missing operand\n", 1);
                };
                let mut output = Output::ok(String::new());
                for path in paths {
                    if let Err(message) = tree.chown(&normalize(path), elevated) {
                        output.error(message, 1);
                    }
                }
                output
            }
            other => Output::fail(format!("sh: 1: {}: not found\n", other), 127),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_exec(&self, command: &str, pty: bool) -> Result<RawChannel> {
        {
            let mut shared = self.lock();
            if let Some(message) = &shared.refusal {
                return Err(SshError::exec(message.clone()));
            }
            shared.opened.push((command.to_string(), pty));
            shared.open_channels += 1;
            shared.max_open_channels = shared.max_open_channels.max(shared.open_channels);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let process = Process {
            transport: self.clone(),
            events: events_tx,
            control: control_rx,
            pty,
            buffered: Vec::new(),
        };
        tokio::spawn(process.run(command.to_string()));

        Ok(RawChannel {
            events: events_rx,
            control: control_tx,
        })
    }

    async fn open_file_transfer(&self) -> Result<Arc<dyn FileTransfer>> {
        Ok(Arc::new(self.files.clone()))
    }

    async fn disconnect(&self) {
        self.lock().disconnected = true;
    }
}

/// Hands out clones of one [`FakeTransport`]
#[derive(Clone)]
pub struct FakeConnector {
    transport: FakeTransport,
    failure: Option<String>,
    connects: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn new(transport: FakeTransport) -> Self {
        Self {
            transport,
            failure: None,
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail every connection attempt with `message`
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::new(FakeTransport::new())
        }
    }

    /// Connection attempts so far
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _credentials: &Credentials) -> Result<Arc<dyn Transport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            return Err(SshError::connect(message.clone()));
        }
        self.transport.lock().disconnected = false;
        Ok(Arc::new(self.transport.clone()))
    }
}

#[derive(Debug)]
struct Output {
    stdout: String,
    stderr: String,
    status: Option<u32>,
}

impl Output {
    fn ok(stdout: String) -> Self {
        Self {
            stdout,
            stderr: String::new(),
            status: Some(0),
        }
    }

    fn fail(stderr: impl Into<String>, status: u32) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            status: Some(status),
        }
    }

    fn error(&mut self, line: String, status: u32) {
        self.stderr.push_str(&line);
        self.stderr.push('\n');
        self.status = Some(status);
    }
}

enum Input {
    Data(Vec<u8>),
    Etx,
    Interrupt,
    Eof,
    Closed,
}

enum Line {
    Text(String),
    Etx,
    Interrupt,
    End,
}

/// One remote process
struct Process {
    transport: FakeTransport,
    events: mpsc::UnboundedSender<ChannelEvent>,
    control: mpsc::UnboundedReceiver<ChannelControl>,
    pty: bool,
    buffered: Vec<u8>,
}

impl Process {
    async fn run(mut self, command: String) {
        let status = match command.trim_start().strip_prefix("sudo ") {
            Some(rest) => self.sudo(rest.trim_start()).await,
            None => self.program(&command, false).await,
        };
        self.transport.channel_closed();
        let report_status = !self.transport.lock().drop_exit_status;
        if let Some(status) = status.filter(|_| report_status) {
            let _ = self.events.send(ChannelEvent::ExitStatus(status));
        }
        let _ = self.events.send(ChannelEvent::Closed);
        while let Ok(control) = self.control.try_recv() {
            self.transport.record(&control);
        }
    }

    fn send(&self, text: &str) {
        if !text.is_empty() {
            let _ = self.events.send(ChannelEvent::Stdout(text.as_bytes().to_vec()));
        }
    }

    fn emit(&self, output: &Output) {
        if self.pty {
            self.send(&output.stdout.replace('\n', "\r\n"));
            self.send(&output.stderr.replace('\n', "\r\n"));
        } else {
            self.send(&output.stdout);
            if !output.stderr.is_empty() {
                let _ = self
                    .events
                    .send(ChannelEvent::Stderr(output.stderr.as_bytes().to_vec()));
            }
        }
    }

    async fn next_input(&mut self) -> Input {
        let Some(control) = self.control.recv().await else {
            return Input::Closed;
        };
        self.transport.record(&control);
        match control {
            ChannelControl::Write(data) if data.contains(&ETX) => Input::Etx,
            ChannelControl::Write(data) => Input::Data(data),
            ChannelControl::Interrupt => Input::Interrupt,
            ChannelControl::Eof => Input::Eof,
            ChannelControl::Close => Input::Closed,
        }
    }

    async fn read_line(&mut self) -> Line {
        loop {
            if let Some(end) = self.buffered.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffered.drain(..=end).collect();
                let text = String::from_utf8_lossy(&line[..end]).into_owned();
                return Line::Text(text.trim_end_matches('\r').to_string());
            }
            match self.next_input().await {
                Input::Data(data) => self.buffered.extend(data),
                Input::Etx => return Line::Etx,
                Input::Interrupt => return Line::Interrupt,
                Input::Eof if !self.buffered.is_empty() => {
                    let line = std::mem::take(&mut self.buffered);
                    return Line::Text(String::from_utf8_lossy(&line).into_owned());
                }
                Input::Eof | Input::Closed => return Line::End,
            }
        }
    }

    async fn sudo(&mut self, rest: &str) -> Option<u32> {
        let Some(secret) = self.transport.sudo_secret() else {
            return self.program(rest, true).await;
        };
        if !self.pty {
            let _ = self
                .events
                .send(ChannelEvent::Stderr(TERMINAL_REQUIRED.as_bytes().to_vec()));
            return Some(1);
        }

        if self.authenticate(&secret).await? {
            self.program(rest, true).await
        } else {
            Some(1)
        }
    }

    /// Prompt until `secret` is typed; `None` once input has ended
    async fn authenticate(&mut self, secret: &str) -> Option<bool> {
        self.send(PROMPT);
        let mut attempts = 0;
        loop {
            match self.read_line().await {
                Line::Text(line) if line == secret => {
                    self.send("\r\n");
                    return Some(true);
                }
                Line::Text(_) => {
                    attempts += 1;
                    if attempts == 3 {
                        self.send("\r\nsudo: 3 incorrect password attempts\r\n");
                        return Some(false);
                    }
                    self.send(&format!("\r\nSorry, try again.\r\n{}", PROMPT));
                }
                Line::Etx | Line::Interrupt => {
                    self.send("^C\r\nsudo: a password is required\r\n");
                    return Some(false);
                }
                Line::End => return None,
            }
        }
    }

    async fn program(&mut self, command: &str, elevated: bool) -> Option<u32> {
        let words: Vec<String> = match tokenize(command, 0) {
            Ok(tokens) => tokens
                .into_iter()
                .filter_map(|token| match token {
                    Token::Word(word) => Some(word),
                    Token::Redirect { .. } => None,
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        let words: Vec<&str> = words.iter().map(String::as_str).collect();

        match words.as_slice() {
            ["sleep", seconds, ..] => {
                let limit = seconds.parse().ok().map(Duration::from_secs);
                self.hang(true, limit).await
            }
            ["sleep"] => self.hang(true, None).await,
            ["nohup", ..] => self.hang(false, None).await,
            ["cat"] => self.echo_input().await,
            ["sh"] => self.shell(elevated).await,
            [name, ..] => {
                if let Some(delay) = self.transport.delay(name) {
                    sleep(delay).await;
                }
                let output = self.transport.interpret(command, elevated, 0);
                self.emit(&output);
                output.status
            }
            [] => Some(0),
        }
    }

    /// Block until interrupted or `limit` has passed
    ///
    /// Only closing the channel ends it when `interruptible` is false.
    async fn hang(&mut self, interruptible: bool, limit: Option<Duration>) -> Option<u32> {
        let deadline = limit.map(|limit| Instant::now() + limit);
        loop {
            let input = match deadline {
                Some(deadline) => tokio::select! {
                    input = self.next_input() => input,
                    _ = sleep_until(deadline) => return Some(0),
                },
                None => self.next_input().await,
            };
            match input {
                Input::Interrupt if interruptible && !self.pty => return Some(130),
                Input::Etx if interruptible && self.pty => return Some(130),
                Input::Closed => return None,
                _ => {}
            }
        }
    }

    async fn echo_input(&mut self) -> Option<u32> {
        loop {
            match self.next_input().await {
                Input::Data(data) => {
                    let _ = self.events.send(ChannelEvent::Stdout(data));
                }
                Input::Eof => return Some(0),
                Input::Interrupt | Input::Etx => return Some(130),
                Input::Closed => return None,
            }
        }
    }

    async fn shell(&mut self, elevated: bool) -> Option<u32> {
        let mut last = 0;
        loop {
            match self.read_line().await {
                Line::Text(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if line == "exit" {
                        return Some(last);
                    }
                    let line = line.to_string();
                    for part in line.split(" ; ") {
                        last = self.shell_command(part.trim(), elevated, last).await?;
                    }
                }
                Line::Etx | Line::Interrupt => return Some(130),
                Line::End => return Some(last),
            }
        }
    }

    /// One command of an interactive shell; `None` once input has ended
    async fn shell_command(&mut self, command: &str, elevated: bool, last: u32) -> Option<u32> {
        let prompted = self.transport.sudo_secret().filter(|_| self.pty);
        match (command.strip_prefix("sudo "), prompted) {
            (Some(rest), Some(secret)) => {
                if self.authenticate(&secret).await? {
                    Some(self.shell_line(rest.trim_start(), true, last).await)
                } else {
                    Some(1)
                }
            }
            _ => Some(self.shell_line(command, elevated, last).await),
        }
    }

    /// One command of an interactive shell; `sleep N` blocks like the real one
    async fn shell_line(&mut self, line: &str, elevated: bool, last: u32) -> u32 {
        if let Some(seconds) = line.strip_prefix("sleep ") {
            let limit = seconds.trim().parse().ok().map(Duration::from_secs);
            return self.hang(true, limit).await.unwrap_or(130);
        }
        let output = self.transport.interpret(line, elevated, last);
        self.emit(&output);
        output.status.unwrap_or(0)
    }
}

enum Token {
    Word(String),
    Redirect { append: bool },
}

fn tokenize(line: &str, last_status: u32) -> std::result::Result<Vec<Token>, String> {
    fn flush(tokens: &mut Vec<Token>, word: &mut String, in_word: &mut bool) {
        if *in_word {
            tokens.push(Token::Word(std::mem::take(word)));
            *in_word = false;
        }
    }
    const UNTERMINATED: &str = "Syntax error: Unterminated quoted string";

    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => word.push(ch),
                        None => return Err(UNTERMINATED.to_string()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$')) => word.push(ch),
                            Some(ch) => {
                                word.push('\\');
                                word.push(ch);
                            }
                            None => return Err(UNTERMINATED.to_string()),
                        },
                        Some('$') if chars.peek() == Some(&'?') => {
                            chars.next();
                            word.push_str(&last_status.to_string());
                        }
                        Some(ch) => word.push(ch),
                        None => return Err(UNTERMINATED.to_string()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(ch) = chars.next() {
                    word.push(ch);
                }
            }
            '$' if chars.peek() == Some(&'?') => {
                chars.next();
                in_word = true;
                word.push_str(&last_status.to_string());
            }
            '>' => {
                flush(&mut tokens, &mut word, &mut in_word);
                let append = chars.peek() == Some(&'>');
                if append {
                    chars.next();
                }
                tokens.push(Token::Redirect { append });
            }
            c if c.is_whitespace() => flush(&mut tokens, &mut word, &mut in_word),
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    flush(&mut tokens, &mut word, &mut in_word);
    Ok(tokens)
}

/// Option letters and operands; everything after `--` is an operand
fn split_flags(args: &[String]) -> (String, Vec<&String>) {
    let mut flags = String::new();
    let mut operands = Vec::new();
    let mut options_done = false;
    for arg in args {
        if options_done {
            operands.push(arg);
        } else if arg == "--" {
            options_done = true;
        } else if arg.len() > 1 && arg.starts_with('-') {
            flags.push_str(&arg[1..]);
        } else {
            operands.push(arg);
        }
    }
    (flags, operands)
}

fn printf(format: &str, args: &[String]) -> String {
    let mut out = String::new();
    let mut args = args.iter();
    loop {
        let mut consumed = false;
        let mut chars = format.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('\\') => out.push('\\'),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => out.push('\\'),
                },
                '%' => match chars.next() {
                    Some('s') | Some('d') => {
                        consumed = true;
                        if let Some(arg) = args.next() {
                            out.push_str(arg);
                        }
                    }
                    Some('%') => out.push('%'),
                    Some(other) => {
                        out.push('%');
                        out.push(other);
                    }
                    None => out.push('%'),
                },
                c => out.push(c),
            }
        }
        if !consumed || args.len() == 0 {
            return out;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(line: &str) -> Vec<String> {
        tokenize(line, 7)
            .unwrap()
            .into_iter()
            .filter_map(|token| match token {
                Token::Word(word) => Some(word),
                Token::Redirect { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(
            words(r#"sh -c 'printf '"'"'%s\n'"'"' x'"#),
            vec!["sh", "-c", "printf '%s\\n' x"]
        );
        assert_eq!(words(r#"printf '%s' "$?""#), vec!["printf", "%s", "7"]);
    }

    #[test]
    fn test_printf_repeats_format() {
        let args = vec!["a".to_string(), "b".to_string()];
        assert_eq!(printf("%s\\n", &args), "a\nb\n");
        assert_eq!(printf("plain\\n", &[]), "plain\n");
    }

    #[test]
    fn test_copy_contents_includes_hidden_entries() {
        let files = FakeFiles::default();
        files.add_file("/stage/.env", "X=1");
        files.add_file("/stage/conf.d/a.conf", "a");
        files.add_dir("/live");

        lock(&files.tree)
            .copy("/stage/.", "/live/", true, true)
            .unwrap();

        assert_eq!(files.read("/live/.env").as_deref(), Some("X=1"));
        assert_eq!(files.read("/live/conf.d/a.conf").as_deref(), Some("a"));
    }
}

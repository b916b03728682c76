//! In-process [`Engine`] with an in-memory remote filesystem.
//!
//! `MemoryEngine` behaves like a libssh2 session talking to a cooperative
//! OpenSSH server: the same return conventions, the same `-31` sentinel with
//! an SFTP status behind it, and a last-error message per failure. On top of
//! that it counts native calls and releases, lets a test cap how many bytes a
//! single write accepts, and injects failures into the next call of a given
//! primitive.
//!
//! Clones share state, so a test can keep one clone for inspection after
//! handing another to [`crate::Session::handshake`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::CStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::engine::{Engine, OpenKind, StreamId};
use crate::error::{ErrorCode, SFTP_PROTOCOL_ERROR, SftpStatus};
use crate::types::{FileAttributes, FilePermissions, OpenFlags};

const BANNER: &str = "SSH-2.0-OpenSSH_9.6 tether-memory";
const HOST_KEY_SHA256: [u8; 32] = [
    0x3a, 0x91, 0x0c, 0x5e, 0x7d, 0x22, 0xb4, 0x68, 0x0f, 0xe1, 0x93, 0x4c, 0x2a, 0x77, 0xd0, 0x15,
    0x8b, 0x36, 0xc9, 0x04, 0x5f, 0xaa, 0x12, 0xee, 0x60, 0x9d, 0x48, 0x7b, 0x31, 0xc2, 0x0a, 0xf4,
];
const MODE_FILE: u32 = 0o100644;
const MODE_DIRECTORY: u32 = 0o040755;

/// Primitives that accept injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `session_handshake`
    Handshake,
    /// Both authentication primitives
    Authenticate,
    /// `session_keepalive_send`
    Keepalive,
    /// `channel_open_session`
    OpenChannel,
    /// `channel_process_startup`
    ProcessStartup,
    /// `channel_read`
    ChannelRead,
    /// `channel_write`
    ChannelWrite,
    /// `sftp_init`
    SftpInit,
    /// `sftp_open`
    Open,
    /// `sftp_read`
    Read,
    /// `sftp_write`
    Write,
    /// `sftp_readdir`
    Readdir,
    /// `sftp_stat` and `sftp_fstat`
    Stat,
    /// `sftp_mkdir`
    Mkdir,
    /// `sftp_rmdir`
    Rmdir,
    /// `sftp_unlink`
    Unlink,
}

/// A native release, in the order the engine saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Released {
    /// File or directory handle, with its path
    File(String),
    /// SFTP subsystem
    Sftp,
    /// Channel
    Channel,
    /// Session
    Session,
}

/// Snapshot of the engine's call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Calls to `sftp_read`
    pub native_reads: usize,
    /// Calls to `sftp_write`
    pub native_writes: usize,
    /// Successful `sftp_open` calls
    pub handles_opened: usize,
    /// Calls to `sftp_close_handle`
    pub handles_closed: usize,
    /// Calls to `sftp_shutdown`
    pub sftp_shutdowns: usize,
    /// Calls to `channel_close`
    pub channel_closes: usize,
    /// Calls to `channel_free`
    pub channels_freed: usize,
    /// Calls to `session_disconnect`
    pub disconnects: usize,
    /// Calls to `session_free`
    pub sessions_freed: usize,
    /// Calls to `session_keepalive_send`
    pub keepalives: usize,
}

/// Canned output for an `exec` request.
#[derive(Debug, Clone, Default)]
struct CommandOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: i32,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    code: i32,
    sftp_status: Option<u32>,
}

#[derive(Debug, Default)]
struct ChannelState {
    stdout: Vec<u8>,
    stdout_pos: usize,
    stderr: Vec<u8>,
    stderr_pos: usize,
    input: Vec<u8>,
    exit_status: i32,
    started: bool,
    interactive: bool,
    eof_received: bool,
    remote_closed: bool,
    pty: Option<(String, u32, u32)>,
}

#[derive(Debug)]
enum HandleState {
    File {
        flags: OpenFlags,
        pos: usize,
    },
    Directory {
        entries: Vec<(String, FileAttributes)>,
        next: usize,
    },
}

#[derive(Debug)]
struct OpenHandle {
    path: String,
    state: HandleState,
}

#[derive(Debug)]
struct MemoryState {
    next_id: u64,
    files: BTreeMap<String, Vec<u8>>,
    directories: BTreeSet<String>,
    passwords: HashMap<String, String>,
    key_files: HashMap<String, String>,
    authenticated: bool,
    commands: HashMap<String, CommandOutput>,
    channels: HashMap<u64, ChannelState>,
    handles: HashMap<u64, OpenHandle>,
    faults: HashMap<Operation, Fault>,
    write_limit: Option<usize>,
    keepalive_interval: u32,
    timeout_ms: u32,
    last_error: (i32, String),
    sftp_status: u32,
    stats: MemoryStats,
    released: Vec<Released>,
}

impl Default for MemoryState {
    fn default() -> Self {
        let mut directories = BTreeSet::new();
        directories.insert("/".to_string());
        Self {
            next_id: 1,
            files: BTreeMap::new(),
            directories,
            passwords: HashMap::new(),
            key_files: HashMap::new(),
            authenticated: false,
            commands: HashMap::new(),
            channels: HashMap::new(),
            handles: HashMap::new(),
            faults: HashMap::new(),
            write_limit: None,
            keepalive_interval: 0,
            timeout_ms: 0,
            last_error: (0, String::new()),
            sftp_status: 0,
            stats: MemoryStats::default(),
            released: Vec::new(),
        }
    }
}

impl MemoryState {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn fail(&mut self, code: i32, message: &str) -> i32 {
        self.last_error = (code, message.to_string());
        code
    }

    fn fail_sftp(&mut self, status: SftpStatus) -> i32 {
        self.sftp_status = status.raw();
        self.fail(SFTP_PROTOCOL_ERROR, "SFTP Protocol Error")
    }

    /// Consume an injected fault for `op`, recording it as the last error.
    fn take_fault(&mut self, op: Operation) -> Option<i32> {
        let fault = self.faults.remove(&op)?;
        if let Some(status) = fault.sftp_status {
            self.sftp_status = status;
        }
        let message = ErrorCode::from_raw(fault.code).description();
        Some(self.fail(fault.code, message))
    }

    fn is_directory(&self, path: &str) -> bool {
        self.directories.contains(path)
    }

    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path) || self.is_directory(path)
    }

    fn attributes(&self, path: &str) -> Option<FileAttributes> {
        if let Some(data) = self.files.get(path) {
            Some(file_attributes(data.len(), MODE_FILE))
        } else if self.is_directory(path) {
            Some(file_attributes(0, MODE_DIRECTORY))
        } else {
            None
        }
    }

    fn children(&self, dir: &str) -> Vec<(String, FileAttributes)> {
        let names = self
            .files
            .keys()
            .chain(self.directories.iter())
            .filter(|path| path.as_str() != dir && parent_of(path) == dir)
            .map(|path| file_name(path).to_string())
            .collect::<BTreeSet<_>>();

        let mut entries = vec![
            (".".to_string(), file_attributes(0, MODE_DIRECTORY)),
            ("..".to_string(), file_attributes(0, MODE_DIRECTORY)),
        ];
        for name in names {
            let path = join(dir, &name);
            if let Some(attrs) = self.attributes(&path) {
                entries.push((name, attrs));
            }
        }
        entries
    }
}

fn file_attributes(size: usize, mode: u32) -> FileAttributes {
    FileAttributes {
        size: Some(size as u64),
        uid: Some(1000),
        gid: Some(1000),
        permissions: Some(mode),
        atime: Some(1_700_000_000),
        mtime: Some(1_700_000_000),
    }
}

fn parent_of(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn path_str(path: &CStr) -> String {
    path.to_string_lossy().into_owned()
}

/// Engine backed by process memory. See the module docs.
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<MemoryState>>,
}

/// Transport accepted by [`MemoryEngine`]'s handshake.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryTransport;

/// Raw session id.
#[derive(Debug)]
pub struct MemorySession {
    id: u64,
}

/// Raw channel id.
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
}

/// Raw SFTP subsystem id.
#[derive(Debug)]
pub struct MemorySftp {
    id: u64,
}

/// Raw file handle id.
#[derive(Debug)]
pub struct MemoryFile {
    id: u64,
}

impl MemorySession {
    /// Engine-assigned id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl MemorySftp {
    /// Engine-assigned id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl MemoryEngine {
    /// Empty filesystem containing only `/`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a regular file, creating missing parent directories.
    #[must_use]
    pub fn with_file(self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        {
            let mut state = self.lock();
            let mut dir = parent_of(path).to_string();
            while dir != "/" {
                state.directories.insert(dir.clone());
                dir = parent_of(&dir).to_string();
            }
            state.files.insert(path.to_string(), contents.into());
        }
        self
    }

    /// Add a directory, creating missing parents.
    #[must_use]
    pub fn with_directory(self, path: &str) -> Self {
        {
            let mut state = self.lock();
            let mut dir = path.trim_end_matches('/').to_string();
            while !dir.is_empty() && dir != "/" {
                state.directories.insert(dir.clone());
                dir = parent_of(&dir).to_string();
            }
        }
        self
    }

    /// Accept password authentication for `user`.
    #[must_use]
    pub fn with_password(self, user: &str, password: &str) -> Self {
        self.lock()
            .passwords
            .insert(user.to_string(), password.to_string());
        self
    }

    /// Accept public key authentication for `user` with this private key file.
    #[must_use]
    pub fn with_key_file(self, user: &str, private_key: &str) -> Self {
        self.lock()
            .key_files
            .insert(user.to_string(), private_key.to_string());
        self
    }

    /// Canned result for `exec` of `command`.
    #[must_use]
    pub fn with_command(
        self,
        command: &str,
        stdout: impl Into<Vec<u8>>,
        stderr: impl Into<Vec<u8>>,
        exit_status: i32,
    ) -> Self {
        self.lock().commands.insert(
            command.to_string(),
            CommandOutput {
                stdout: stdout.into(),
                stderr: stderr.into(),
                exit_status,
            },
        );
        self
    }

    /// Cap the bytes a single `sftp_write` accepts; `None` accepts everything.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.lock().write_limit = limit;
    }

    /// Make the next call of `op` fail with native `code`.
    pub fn fail_next(&self, op: Operation, code: i32) {
        self.lock().faults.insert(
            op,
            Fault {
                code,
                sftp_status: None,
            },
        );
    }

    /// Make the next call of `op` fail with the SFTP sentinel and `status`.
    pub fn fail_next_sftp(&self, op: Operation, status: SftpStatus) {
        self.lock().faults.insert(
            op,
            Fault {
                code: SFTP_PROTOCOL_ERROR,
                sftp_status: Some(status.raw()),
            },
        );
    }

    /// Current contents of a remote file.
    #[must_use]
    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    /// Whether a remote directory exists.
    #[must_use]
    pub fn has_directory(&self, path: &str) -> bool {
        self.lock().is_directory(path)
    }

    /// Bytes written to the data stream of a channel by the client, across
    /// all channels, in order.
    #[must_use]
    pub fn channel_input(&self) -> Vec<u8> {
        let state = self.lock();
        let mut ids = state.channels.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids.iter()
            .flat_map(|id| state.channels[id].input.iter().copied())
            .collect()
    }

    /// Last pty size requested on any channel.
    #[must_use]
    pub fn pty_size(&self) -> Option<(u32, u32)> {
        self.lock()
            .channels
            .values()
            .filter_map(|c| c.pty.as_ref().map(|(_, cols, rows)| (*cols, *rows)))
            .next()
    }

    /// Native session timeout last configured.
    #[must_use]
    pub fn session_timeout_ms(&self) -> u32 {
        self.lock().timeout_ms
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        self.lock().stats
    }

    /// Native releases so far, oldest first.
    #[must_use]
    pub fn released(&self) -> Vec<Released> {
        self.lock().released.clone()
    }

    /// Number of file and directory handles still open.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.lock().handles.len()
    }
}

impl Engine for MemoryEngine {
    type Transport = MemoryTransport;
    type Session = MemorySession;
    type Channel = MemoryChannel;
    type Sftp = MemorySftp;
    type File = MemoryFile;

    fn session_init(&self) -> Option<MemorySession> {
        let mut state = self.lock();
        let id = state.next_id();
        Some(MemorySession { id })
    }

    fn session_set_timeout(&self, _session: &MemorySession, timeout_ms: u32) {
        self.lock().timeout_ms = timeout_ms;
    }

    fn session_handshake(&self, _session: &mut MemorySession, _transport: MemoryTransport) -> i32 {
        self.lock().take_fault(Operation::Handshake).unwrap_or(0)
    }

    fn session_banner(&self, _session: &MemorySession) -> Option<String> {
        Some(BANNER.to_string())
    }

    fn session_host_key_sha256(&self, _session: &MemorySession) -> Option<[u8; 32]> {
        Some(HOST_KEY_SHA256)
    }

    fn session_userauth_password(
        &self,
        _session: &MemorySession,
        username: &CStr,
        password: &CStr,
    ) -> i32 {
        let mut state = self.lock();
        if let Some(code) = state.take_fault(Operation::Authenticate) {
            return code;
        }
        let user = path_str(username);
        if state.passwords.get(&user).map(String::as_bytes) == Some(password.to_bytes()) {
            state.authenticated = true;
            0
        } else {
            state.fail(
                ErrorCode::AuthenticationFailed.raw(),
                "Authentication failed (username/password)",
            )
        }
    }

    fn session_userauth_publickey_file(
        &self,
        _session: &MemorySession,
        username: &CStr,
        _public_key: Option<&CStr>,
        private_key: &CStr,
        _passphrase: Option<&CStr>,
    ) -> i32 {
        let mut state = self.lock();
        if let Some(code) = state.take_fault(Operation::Authenticate) {
            return code;
        }
        let user = path_str(username);
        if state.key_files.get(&user).map(String::as_bytes) == Some(private_key.to_bytes()) {
            state.authenticated = true;
            0
        } else {
            state.fail(
                ErrorCode::AuthenticationFailed.raw(),
                "Authentication failed (publickey)",
            )
        }
    }

    fn session_authenticated(&self, _session: &MemorySession) -> bool {
        self.lock().authenticated
    }

    fn session_keepalive_config(&self, _session: &MemorySession, _want_reply: bool, interval_secs: u32) {
        self.lock().keepalive_interval = interval_secs;
    }

    fn session_keepalive_send(&self, _session: &MemorySession, seconds_to_next: &mut i32) -> i32 {
        let mut state = self.lock();
        state.stats.keepalives += 1;
        if let Some(code) = state.take_fault(Operation::Keepalive) {
            return code;
        }
        *seconds_to_next = i32::try_from(state.keepalive_interval).unwrap_or(i32::MAX);
        0
    }

    fn session_last_errno(&self, _session: &MemorySession) -> i32 {
        self.lock().last_error.0
    }

    fn session_last_error(&self, _session: &MemorySession) -> (i32, String) {
        self.lock().last_error.clone()
    }

    fn session_disconnect(&self, _session: &MemorySession, _description: &CStr) -> i32 {
        let mut state = self.lock();
        state.stats.disconnects += 1;
        state.authenticated = false;
        0
    }

    fn session_free(&self, _session: &mut MemorySession) -> i32 {
        let mut state = self.lock();
        state.stats.sessions_freed += 1;
        state.released.push(Released::Session);
        0
    }

    fn channel_open_session(&self, _session: &MemorySession) -> Option<MemoryChannel> {
        let mut state = self.lock();
        if state.take_fault(Operation::OpenChannel).is_some() {
            return None;
        }
        let id = state.next_id();
        state.channels.insert(id, ChannelState::default());
        Some(MemoryChannel { id })
    }

    fn channel_process_startup(
        &self,
        channel: &MemoryChannel,
        request: &str,
        message: Option<&[u8]>,
    ) -> i32 {
        let mut state = self.lock();
        if let Some(code) = state.take_fault(Operation::ProcessStartup) {
            return code;
        }
        let output = match request {
            "exec" => {
                let command = String::from_utf8_lossy(message.unwrap_or_default()).into_owned();
                Some(state.commands.get(&command).cloned().unwrap_or_else(|| {
                    CommandOutput {
                        stdout: Vec::new(),
                        stderr: format!("sh: {command}: command not found\n").into_bytes(),
                        exit_status: 127,
                    }
                }))
            }
            "shell" | "subsystem" => None,
            _ => {
                return state.fail(
                    ErrorCode::ChannelRequestDenied.raw(),
                    "Unable to complete request for channel-process-startup",
                );
            }
        };
        let Some(ch) = state.channels.get_mut(&channel.id) else {
            return state.fail(ErrorCode::ChannelUnknown.raw(), "Channel not found");
        };
        ch.started = true;
        match output {
            Some(output) => {
                ch.stdout = output.stdout;
                ch.stderr = output.stderr;
                ch.exit_status = output.exit_status;
            }
            None => ch.interactive = true,
        }
        0
    }

    fn channel_request_pty(&self, channel: &MemoryChannel, term: &str, cols: u32, rows: u32) -> i32 {
        let mut state = self.lock();
        match state.channels.get_mut(&channel.id) {
            Some(ch) => {
                ch.pty = Some((term.to_string(), cols, rows));
                0
            }
            None => state.fail(ErrorCode::ChannelUnknown.raw(), "Channel not found"),
        }
    }

    fn channel_request_pty_size(&self, channel: &MemoryChannel, cols: u32, rows: u32) -> i32 {
        let mut state = self.lock();
        match state.channels.get_mut(&channel.id).and_then(|ch| ch.pty.as_mut()) {
            Some(pty) => {
                pty.1 = cols;
                pty.2 = rows;
                0
            }
            None => state.fail(
                ErrorCode::ChannelRequestDenied.raw(),
                "Unable to complete request for channel request-pty-size",
            ),
        }
    }

    fn channel_read(&self, channel: &MemoryChannel, stream: StreamId, buf: &mut [u8]) -> isize {
        let mut state = self.lock();
        if let Some(code) = state.take_fault(Operation::ChannelRead) {
            return code as isize;
        }
        let Some(ch) = state.channels.get_mut(&channel.id) else {
            return state.fail(ErrorCode::ChannelUnknown.raw(), "Channel not found") as isize;
        };
        let (data, pos) = match stream {
            StreamId::Data => (&ch.stdout, &mut ch.stdout_pos),
            StreamId::Stderr => (&ch.stderr, &mut ch.stderr_pos),
        };
        let n = buf.len().min(data.len() - *pos);
        buf[..n].copy_from_slice(&data[*pos..*pos + n]);
        *pos += n;
        if stream == StreamId::Data && !ch.interactive && ch.stdout_pos == ch.stdout.len() {
            ch.eof_received = true;
        }
        n as isize
    }

    fn channel_write(&self, channel: &MemoryChannel, stream: StreamId, buf: &[u8]) -> isize {
        let mut state = self.lock();
        if let Some(code) = state.take_fault(Operation::ChannelWrite) {
            return code as isize;
        }
        let Some(ch) = state.channels.get_mut(&channel.id) else {
            return state.fail(ErrorCode::ChannelUnknown.raw(), "Channel not found") as isize;
        };
        if stream == StreamId::Data {
            ch.input.extend_from_slice(buf);
            if ch.interactive {
                ch.stdout.extend_from_slice(buf);
            }
        }
        buf.len() as isize
    }

    fn channel_send_eof(&self, channel: &MemoryChannel) -> i32 {
        let mut state = self.lock();
        if let Some(ch) = state.channels.get_mut(&channel.id) {
            if ch.interactive {
                // The remote shell exits once its input ends.
                ch.interactive = false;
            }
        }
        0
    }

    fn channel_eof(&self, channel: &MemoryChannel) -> bool {
        let state = self.lock();
        state.channels.get(&channel.id).is_some_and(|ch| {
            ch.eof_received || (ch.started && !ch.interactive && ch.stdout_pos == ch.stdout.len())
        })
    }

    fn channel_wait_closed(&self, channel: &MemoryChannel) -> i32 {
        if !self.channel_eof(channel) {
            return self.lock().fail(
                ErrorCode::Inval.raw(),
                "libssh2_channel_wait_closed() invoked when channel is not in EOF state",
            );
        }
        let mut state = self.lock();
        match state.channels.get_mut(&channel.id) {
            Some(ch) => {
                ch.remote_closed = true;
                0
            }
            None => state.fail(ErrorCode::ChannelUnknown.raw(), "Channel not found"),
        }
    }

    fn channel_exit_status(&self, channel: &MemoryChannel) -> i32 {
        // The exit-status message is only seen once the remote close is processed.
        self.lock()
            .channels
            .get(&channel.id)
            .filter(|ch| ch.remote_closed)
            .map_or(0, |ch| ch.exit_status)
    }

    fn channel_close(&self, _channel: &MemoryChannel) -> i32 {
        self.lock().stats.channel_closes += 1;
        0
    }

    fn channel_free(&self, channel: &mut MemoryChannel) -> i32 {
        let mut state = self.lock();
        state.stats.channels_freed += 1;
        state.released.push(Released::Channel);
        // Keep the channel's recorded input for inspection.
        if let Some(ch) = state.channels.get_mut(&channel.id) {
            ch.started = false;
        }
        0
    }

    fn sftp_init(&self, _session: &MemorySession, _channel: &MemoryChannel) -> Option<MemorySftp> {
        let mut state = self.lock();
        if state.take_fault(Operation::SftpInit).is_some() {
            return None;
        }
        let id = state.next_id();
        Some(MemorySftp { id })
    }

    fn sftp_last_error(&self, _sftp: &MemorySftp) -> u32 {
        self.lock().sftp_status
    }

    fn sftp_shutdown(&self, _sftp: &mut MemorySftp) -> i32 {
        let mut state = self.lock();
        state.stats.sftp_shutdowns += 1;
        state.released.push(Released::Sftp);
        0
    }

    fn sftp_open(
        &self,
        _sftp: &MemorySftp,
        path: &CStr,
        flags: OpenFlags,
        _mode: FilePermissions,
        kind: OpenKind,
    ) -> Option<MemoryFile> {
        let mut state = self.lock();
        if state.take_fault(Operation::Open).is_some() {
            return None;
        }
        let path = path_str(path);

        let handle_state = match kind {
            OpenKind::Directory => {
                if !state.is_directory(&path) {
                    let status = if state.files.contains_key(&path) {
                        SftpStatus::NotADirectory
                    } else {
                        SftpStatus::NoSuchFile
                    };
                    state.fail_sftp(status);
                    return None;
                }
                HandleState::Directory {
                    entries: state.children(&path),
                    next: 0,
                }
            }
            OpenKind::File => {
                if state.is_directory(&path) {
                    state.fail_sftp(SftpStatus::Failure);
                    return None;
                }
                let exists = state.files.contains_key(&path);
                if exists && flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
                    state.fail_sftp(SftpStatus::FileAlreadyExists);
                    return None;
                }
                if !exists {
                    if !flags.contains(OpenFlags::CREATE) {
                        state.fail_sftp(SftpStatus::NoSuchFile);
                        return None;
                    }
                    if !state.is_directory(parent_of(&path)) {
                        state.fail_sftp(SftpStatus::NoSuchFile);
                        return None;
                    }
                    state.files.insert(path.clone(), Vec::new());
                }
                let data = state.files.entry(path.clone()).or_default();
                if flags.contains(OpenFlags::TRUNCATE) {
                    data.clear();
                }
                let pos = if flags.contains(OpenFlags::APPEND) {
                    data.len()
                } else {
                    0
                };
                HandleState::File { flags, pos }
            }
        };

        let id = state.next_id();
        state.handles.insert(
            id,
            OpenHandle {
                path,
                state: handle_state,
            },
        );
        state.stats.handles_opened += 1;
        Some(MemoryFile { id })
    }

    fn sftp_read(&self, file: &MemoryFile, buf: &mut [u8]) -> isize {
        let mut state = self.lock();
        state.stats.native_reads += 1;
        if let Some(code) = state.take_fault(Operation::Read) {
            return code as isize;
        }
        let MemoryState { handles, files, .. } = &mut *state;
        let (path, flags, pos) = match handles.get_mut(&file.id) {
            Some(OpenHandle {
                path,
                state: HandleState::File { flags, pos },
            }) => (path.as_str(), *flags, pos),
            _ => return state.fail_sftp(SftpStatus::InvalidHandle) as isize,
        };
        if !flags.contains(OpenFlags::READ) {
            return state.fail_sftp(SftpStatus::PermissionDenied) as isize;
        }
        let data = files.get(path).map(Vec::as_slice).unwrap_or_default();
        let start = (*pos).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        *pos = start + n;
        n as isize
    }

    fn sftp_write(&self, file: &MemoryFile, buf: &[u8]) -> isize {
        let mut state = self.lock();
        state.stats.native_writes += 1;
        if let Some(code) = state.take_fault(Operation::Write) {
            return code as isize;
        }
        let limit = state.write_limit.unwrap_or(usize::MAX);
        let MemoryState { handles, files, .. } = &mut *state;
        let (path, flags, pos) = match handles.get_mut(&file.id) {
            Some(OpenHandle {
                path,
                state: HandleState::File { flags, pos },
            }) => (path.as_str(), *flags, pos),
            _ => return state.fail_sftp(SftpStatus::InvalidHandle) as isize,
        };
        if !flags.contains(OpenFlags::WRITE) {
            return state.fail_sftp(SftpStatus::PermissionDenied) as isize;
        }
        let data = files.entry(path.to_string()).or_default();
        let n = buf.len().min(limit);
        let end = *pos + n;
        if data.len() < end {
            data.resize(end, 0);
        }
        data[*pos..end].copy_from_slice(&buf[..n]);
        *pos = end;
        n as isize
    }

    fn sftp_readdir(&self, dir: &MemoryFile, name: &mut [u8], attrs: &mut FileAttributes) -> isize {
        let mut state = self.lock();
        if let Some(code) = state.take_fault(Operation::Readdir) {
            return code as isize;
        }
        let (entry_name, entry_attrs) = match state.handles.get_mut(&dir.id) {
            Some(OpenHandle {
                state: HandleState::Directory { entries, next },
                ..
            }) => match entries.get(*next) {
                Some(entry) => {
                    *next += 1;
                    entry.clone()
                }
                None => return 0,
            },
            _ => return state.fail_sftp(SftpStatus::InvalidHandle) as isize,
        };
        let bytes = entry_name.as_bytes();
        if bytes.len() > name.len() {
            return state.fail(ErrorCode::BufferTooSmall.raw(), "Buffer too small") as isize;
        }
        name[..bytes.len()].copy_from_slice(bytes);
        *attrs = entry_attrs;
        bytes.len() as isize
    }

    fn sftp_fstat(&self, file: &MemoryFile, attrs: &mut FileAttributes) -> i32 {
        let mut state = self.lock();
        if let Some(code) = state.take_fault(Operation::Stat) {
            return code;
        }
        let found = state
            .handles
            .get(&file.id)
            .and_then(|handle| state.attributes(&handle.path));
        match found {
            Some(found) => {
                *attrs = found;
                0
            }
            None => state.fail_sftp(SftpStatus::InvalidHandle),
        }
    }

    fn sftp_stat(&self, _sftp: &MemorySftp, path: &CStr, attrs: &mut FileAttributes) -> i32 {
        let mut state = self.lock();
        if let Some(code) = state.take_fault(Operation::Stat) {
            return code;
        }
        match state.attributes(&path_str(path)) {
            Some(found) => {
                *attrs = found;
                0
            }
            None => state.fail_sftp(SftpStatus::NoSuchFile),
        }
    }

    fn sftp_mkdir(&self, _sftp: &MemorySftp, path: &CStr, _mode: FilePermissions) -> i32 {
        let mut state = self.lock();
        if let Some(code) = state.take_fault(Operation::Mkdir) {
            return code;
        }
        let path = path_str(path);
        let path = path.trim_end_matches('/');
        if state.exists(path) {
            return state.fail_sftp(SftpStatus::FileAlreadyExists);
        }
        if !state.is_directory(parent_of(path)) {
            return state.fail_sftp(SftpStatus::NoSuchFile);
        }
        state.directories.insert(path.to_string());
        0
    }

    fn sftp_rmdir(&self, _sftp: &MemorySftp, path: &CStr) -> i32 {
        let mut state = self.lock();
        if let Some(code) = state.take_fault(Operation::Rmdir) {
            return code;
        }
        let path = path_str(path);
        let path = path.trim_end_matches('/');
        if !state.is_directory(path) {
            return state.fail_sftp(SftpStatus::NoSuchFile);
        }
        // "." and ".." are always present
        if state.children(path).len() > 2 {
            return state.fail_sftp(SftpStatus::DirNotEmpty);
        }
        state.directories.remove(path);
        0
    }

    fn sftp_unlink(&self, _sftp: &MemorySftp, path: &CStr) -> i32 {
        let mut state = self.lock();
        if let Some(code) = state.take_fault(Operation::Unlink) {
            return code;
        }
        let path = path_str(path);
        if state.is_directory(&path) {
            return state.fail_sftp(SftpStatus::Failure);
        }
        if state.files.remove(&path).is_none() {
            return state.fail_sftp(SftpStatus::NoSuchFile);
        }
        0
    }

    fn sftp_close_handle(&self, file: &mut MemoryFile) -> i32 {
        let mut state = self.lock();
        state.stats.handles_closed += 1;
        match state.handles.remove(&file.id) {
            Some(handle) => {
                state.released.push(Released::File(handle.path));
                0
            }
            None => state.fail_sftp(SftpStatus::InvalidHandle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(engine: &MemoryEngine, sftp: &MemorySftp, path: &CStr, flags: OpenFlags) -> Option<MemoryFile> {
        engine.sftp_open(sftp, path, flags, FilePermissions::DEFAULT_FILE, OpenKind::File)
    }

    fn subsystem(engine: &MemoryEngine) -> (MemorySession, MemoryChannel, MemorySftp) {
        let session = engine.session_init().unwrap();
        let channel = engine.channel_open_session(&session).unwrap();
        let sftp = engine.sftp_init(&session, &channel).unwrap();
        (session, channel, sftp)
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(parent_of("/etc/hostname"), "/etc");
        assert_eq!(parent_of("/etc"), "/");
        assert_eq!(parent_of("relative"), "/");
        assert_eq!(file_name("/etc/hostname"), "hostname");
        assert_eq!(join("/", "etc"), "/etc");
        assert_eq!(join("/etc", "hostname"), "/etc/hostname");
    }

    #[test]
    fn test_with_file_creates_parents() {
        let engine = MemoryEngine::new().with_file("/a/b/c.txt", "x");
        assert!(engine.has_directory("/a"));
        assert!(engine.has_directory("/a/b"));
        assert_eq!(engine.file_contents("/a/b/c.txt").unwrap(), b"x");
    }

    #[test]
    fn test_read_sequence() {
        let engine = MemoryEngine::new().with_file("/etc/hostname", "abc");
        let (_s, _c, sftp) = subsystem(&engine);
        let file = open(&engine, &sftp, c"/etc/hostname", OpenFlags::READ).unwrap();

        let mut buf = [0u8; 2];
        assert_eq!(engine.sftp_read(&file, &mut buf), 2);
        assert_eq!(engine.sftp_read(&file, &mut buf), 1);
        assert_eq!(buf[0], b'c');
        assert_eq!(engine.sftp_read(&file, &mut buf), 0);
        assert_eq!(engine.stats().native_reads, 3);
    }

    #[test]
    fn test_open_missing_sets_sftp_status() {
        let engine = MemoryEngine::new();
        let (session, _c, sftp) = subsystem(&engine);
        assert!(open(&engine, &sftp, c"/nope", OpenFlags::READ).is_none());
        assert_eq!(engine.session_last_errno(&session), SFTP_PROTOCOL_ERROR);
        assert_eq!(engine.sftp_last_error(&sftp), SftpStatus::NoSuchFile.raw());
    }

    #[test]
    fn test_write_limit_caps_accepted_bytes() {
        let engine = MemoryEngine::new();
        let (_s, _c, sftp) = subsystem(&engine);
        let file = open(&engine, &sftp, c"/out", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();

        engine.set_write_limit(Some(5));
        assert_eq!(engine.sftp_write(&file, b"0123456789"), 5);
        assert_eq!(engine.file_contents("/out").unwrap(), b"01234");

        engine.set_write_limit(None);
        assert_eq!(engine.sftp_write(&file, b"56789"), 5);
        assert_eq!(engine.file_contents("/out").unwrap(), b"0123456789");
    }

    #[test]
    fn test_injected_fault_is_consumed_once() {
        let engine = MemoryEngine::new().with_file("/f", "data");
        let (session, _c, sftp) = subsystem(&engine);
        let file = open(&engine, &sftp, c"/f", OpenFlags::READ).unwrap();

        engine.fail_next(Operation::Read, ErrorCode::Timeout.raw());
        let mut buf = [0u8; 4];
        assert_eq!(engine.sftp_read(&file, &mut buf), -9);
        assert_eq!(engine.session_last_error(&session).0, -9);
        assert_eq!(engine.sftp_read(&file, &mut buf), 4);
    }

    #[test]
    fn test_readdir_lists_dot_entries_first() {
        let engine = MemoryEngine::new()
            .with_file("/home/user/a.txt", "a")
            .with_directory("/home/user/sub");
        let (_s, _c, sftp) = subsystem(&engine);
        let dir = engine
            .sftp_open(
                &sftp,
                c"/home/user",
                OpenFlags::READ,
                FilePermissions::DEFAULT_DIRECTORY,
                OpenKind::Directory,
            )
            .unwrap();

        let mut names = Vec::new();
        let mut buf = [0u8; 256];
        let mut attrs = FileAttributes::default();
        loop {
            let n = engine.sftp_readdir(&dir, &mut buf, &mut attrs);
            if n <= 0 {
                break;
            }
            names.push(String::from_utf8_lossy(&buf[..n as usize]).into_owned());
        }
        assert_eq!(names, [".", "..", "a.txt", "sub"]);
    }

    #[test]
    fn test_rmdir_rejects_non_empty() {
        let engine = MemoryEngine::new().with_file("/d/f", "x");
        let (_s, _c, sftp) = subsystem(&engine);
        assert_eq!(engine.sftp_rmdir(&sftp, c"/d"), SFTP_PROTOCOL_ERROR);
        assert_eq!(engine.sftp_last_error(&sftp), SftpStatus::DirNotEmpty.raw());
        assert_eq!(engine.sftp_unlink(&sftp, c"/d/f"), 0);
        assert_eq!(engine.sftp_rmdir(&sftp, c"/d"), 0);
        assert!(!engine.has_directory("/d"));
    }

    #[test]
    fn test_exec_unknown_command() {
        let engine = MemoryEngine::new();
        let session = engine.session_init().unwrap();
        let channel = engine.channel_open_session(&session).unwrap();
        assert_eq!(engine.channel_process_startup(&channel, "exec", Some(b"nope")), 0);

        let mut buf = [0u8; 64];
        let n = engine.channel_read(&channel, StreamId::Stderr, &mut buf);
        assert!(String::from_utf8_lossy(&buf[..n as usize]).contains("command not found"));
        assert_eq!(engine.channel_read(&channel, StreamId::Data, &mut buf), 0);
        assert!(engine.channel_eof(&channel));
        assert_eq!(engine.channel_exit_status(&channel), 0);
        assert_eq!(engine.channel_wait_closed(&channel), 0);
        assert_eq!(engine.channel_exit_status(&channel), 127);
    }

    #[test]
    fn test_release_log_order() {
        let engine = MemoryEngine::new().with_file("/f", "x");
        let (mut session, mut channel, mut sftp) = subsystem(&engine);
        let mut file = open(&engine, &sftp, c"/f", OpenFlags::READ).unwrap();

        engine.sftp_close_handle(&mut file);
        engine.sftp_shutdown(&mut sftp);
        engine.channel_free(&mut channel);
        engine.session_free(&mut session);

        assert_eq!(
            engine.released(),
            [
                Released::File("/f".to_string()),
                Released::Sftp,
                Released::Channel,
                Released::Session,
            ]
        );
    }
}

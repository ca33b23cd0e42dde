//! Test doubles for guestctl.
//!
//! [`MockGuest`] plays the in-guest service on top of a host directory:
//! guest paths map below its root, guest tools run as small Rust functions
//! and every answer is delivered back through [`Guest::dispatch`] from a
//! single task, in order.

mod iso;

pub use iso::IsoBuilder;

use async_trait::async_trait;
use guestctl::fs::FsObjData;
use guestctl::process::stream::StreamBlock;
use guestctl::{Guest, GuestOsType, GuestctlOptions, Session, SessionCredentials};
use guestctl_shared::constants::properties;
use guestctl_shared::errors::{GuestRc, GuestctlResult};
use guestctl_shared::flags::{
    DirectoryRemoveFlags, GuestFeatures, PathRenameFlags, ProcessCreateFlags, ProcessInputFlags,
};
use guestctl_shared::protocol::{
    ContextId, DirEvent, ExecCommand, ExecStatus, FileAccessMode, FileEvent, FileOpenAction,
    FileSeekOrigin, FsObjRecord, GuestCallback, HostMessage, InputStatus, SessionNotifyType,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Guest result code for a host I/O error.
pub fn io_error_rc(err: &io::Error) -> GuestRc {
    match err.kind() {
        io::ErrorKind::NotFound => GuestRc::FILE_NOT_FOUND,
        io::ErrorKind::AlreadyExists => GuestRc::ALREADY_EXISTS,
        io::ErrorKind::PermissionDenied => GuestRc::ACCESS_DENIED,
        io::ErrorKind::IsADirectory => GuestRc::IS_A_DIRECTORY,
        io::ErrorKind::NotADirectory => GuestRc::NOT_A_DIRECTORY,
        io::ErrorKind::DirectoryNotEmpty => GuestRc::ACCESS_DENIED,
        _ => GuestRc::GENERAL_FAILURE,
    }
}

fn read_chunk(file: &mut File, offset: Option<u64>, size: u32) -> io::Result<Vec<u8>> {
    if let Some(offset) = offset {
        file.seek(SeekFrom::Start(offset))?;
    }
    let mut data = vec![0u8; size as usize];
    let n = file.read(&mut data)?;
    data.truncate(n);
    Ok(data)
}

fn write_chunk(file: &mut File, offset: Option<u64>, data: &[u8]) -> io::Result<u32> {
    if let Some(offset) = offset {
        file.seek(SeekFrom::Start(offset))?;
    }
    file.write_all(data)?;
    Ok(data.len() as u32)
}

// ============================================================================
// Mock state
// ============================================================================

struct MockProcess {
    cid: ContextId,
    executable: String,
    stdout: VecDeque<u8>,
    stderr: VecDeque<u8>,
    stdin: Vec<u8>,
    /// Exit code to report once output is drained; `None` while running.
    exit_code: Option<i32>,
    /// Output of a `mock_cat` is its input, available after end of input.
    echo_input: bool,
    /// Never exits and has a fresh line on every read.
    chatty: bool,
}

struct MockDirectory {
    entries: VecDeque<FsObjRecord>,
}

#[derive(Default)]
struct MockState {
    sent: Vec<HostMessage>,
    dropped: HashSet<&'static str>,
    exit_codes: HashMap<String, i32>,
    chatty: HashSet<String>,
    executed: Vec<ExecCommand>,
    shutdowns: Vec<u32>,
    user: String,
    next_handle: u32,
    next_pid: u32,
    files: HashMap<u32, File>,
    directories: HashMap<u32, MockDirectory>,
    processes: BTreeMap<u32, MockProcess>,
}

/// In-memory stand-in for the in-guest service.
pub struct MockGuest {
    root: PathBuf,
    state: Mutex<MockState>,
    outbox: mpsc::UnboundedSender<GuestCallback>,
    guest: Arc<Mutex<Option<Guest>>>,
}

impl MockGuest {
    /// Serve the guest filesystem from `root`. Must be called inside a
    /// Tokio runtime.
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        let (outbox, mut inbox) = mpsc::unbounded_channel::<GuestCallback>();
        let guest: Arc<Mutex<Option<Guest>>> = Arc::new(Mutex::new(None));

        let target = guest.clone();
        tokio::spawn(async move {
            while let Some(callback) = inbox.recv().await {
                let guest = target.lock().clone();
                let Some(guest) = guest else { continue };
                if let Err(e) = guest.dispatch(callback) {
                    tracing::debug!(error = %e, "Mock callback not routed");
                }
            }
        });

        Arc::new(Self {
            root: root.into(),
            state: Mutex::new(MockState {
                next_handle: 1,
                next_pid: 1000,
                ..Default::default()
            }),
            outbox,
            guest,
        })
    }

    /// Start delivering callbacks to `guest`.
    pub fn attach(&self, guest: &Guest) {
        *self.guest.lock() = Some(guest.clone());
    }

    /// Stop delivering callbacks and drop the guest reference.
    pub fn detach(&self) {
        self.guest.lock().take();
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path a guest path maps to. `C:\x` lands in `<root>/C/x`.
    pub fn host_path(&self, guest_path: &str) -> PathBuf {
        let unified = guest_path.replace('\\', "/");
        let relative = match unified.as_bytes() {
            [drive, b':', ..] if drive.is_ascii_alphabetic() => {
                format!("{}/{}", *drive as char, &unified[2..])
            }
            _ => unified,
        };
        let mut path = self.root.clone();
        for component in relative.split('/').filter(|c| !c.is_empty() && *c != ".") {
            path.push(component);
        }
        path
    }

    /// Swallow every message of this kind from now on.
    pub fn drop_messages(&self, name: &'static str) {
        self.state.lock().dropped.insert(name);
    }

    pub fn deliver_messages(&self, name: &'static str) {
        self.state.lock().dropped.remove(name);
    }

    /// Exit code reported for `executable` when it is not a built-in tool.
    pub fn set_exit_code(&self, executable: &str, code: i32) {
        self.state.lock().exit_codes.insert(executable.to_string(), code);
    }

    /// Make `executable` run forever, printing a line whenever asked.
    pub fn keep_talking(&self, executable: &str) {
        self.state.lock().chatty.insert(executable.to_string());
    }

    /// Names of all messages received, in order.
    pub fn sent(&self) -> Vec<&'static str> {
        self.state.lock().sent.iter().map(|m| m.name()).collect()
    }

    pub fn count_sent(&self, name: &str) -> usize {
        self.state.lock().sent.iter().filter(|m| m.name() == name).count()
    }

    /// Every process start request received.
    pub fn executed(&self) -> Vec<ExecCommand> {
        self.state.lock().executed.clone()
    }

    pub fn shutdowns(&self) -> Vec<u32> {
        self.state.lock().shutdowns.clone()
    }

    pub fn running_processes(&self) -> usize {
        self.state
            .lock()
            .processes
            .values()
            .filter(|p| p.exit_code.is_none())
            .count()
    }

    /// Push an unsolicited callback to the host.
    pub fn inject(&self, callback: GuestCallback) {
        let _ = self.outbox.send(callback);
    }

    fn reply(&self, cid: ContextId, rc: GuestRc, payload: Option<String>) {
        self.inject(GuestCallback::Reply { cid, rc: rc.0, payload });
    }

    fn file_notify(&self, cid: ContextId, rc: GuestRc, event: FileEvent) {
        self.inject(GuestCallback::FileNotify { cid, rc: rc.0, event });
    }

    fn dir_notify(&self, cid: ContextId, rc: GuestRc, event: DirEvent) {
        self.inject(GuestCallback::DirNotify { cid, rc: rc.0, event });
    }

    // ------------------------------------------------------------------------
    // Message handling
    // ------------------------------------------------------------------------

    fn handle(&self, message: HostMessage) {
        match message {
            HostMessage::SessionCreate { cid, user, .. } => {
                if user == "baduser" {
                    self.inject(GuestCallback::SessionNotify {
                        cid,
                        kind: SessionNotifyType::Error,
                        result: GuestRc::AUTHENTICATION_FAILURE.0,
                    });
                } else {
                    self.state.lock().user = user;
                    self.inject(GuestCallback::SessionNotify {
                        cid,
                        kind: SessionNotifyType::Started,
                        result: 0,
                    });
                }
            }
            HostMessage::SessionClose { cid, .. } => {
                {
                    let mut state = self.state.lock();
                    state.files.clear();
                    state.directories.clear();
                    state.processes.clear();
                }
                self.inject(GuestCallback::SessionNotify {
                    cid,
                    kind: SessionNotifyType::TerminatedNormally,
                    result: 0,
                });
            }
            HostMessage::PathRename {
                cid,
                source,
                dest,
                flags,
            } => {
                let rc = self.rename(&source, &dest, flags);
                self.reply(cid, rc, None);
            }
            HostMessage::PathUserHome { cid } => {
                let user = self.state.lock().user.clone();
                self.reply(cid, GuestRc::SUCCESS, Some(format!("/home/{}", user)));
            }
            HostMessage::PathUserDocuments { cid } => {
                let user = self.state.lock().user.clone();
                self.reply(cid, GuestRc::SUCCESS, Some(format!("/home/{}/Documents", user)));
            }
            HostMessage::Shutdown { cid, flags } => {
                self.state.lock().shutdowns.push(flags.bits());
                self.reply(cid, GuestRc::SUCCESS, None);
            }
            HostMessage::DirRemove { cid, path, flags } => {
                let host = self.host_path(&path);
                let result = if flags.contains(DirectoryRemoveFlags::RECURSIVE) {
                    fs::remove_dir_all(&host)
                } else {
                    fs::remove_dir(&host)
                };
                let rc = result.map(|_| GuestRc::SUCCESS).unwrap_or_else(|e| match e.kind() {
                    io::ErrorKind::NotFound => GuestRc::PATH_NOT_FOUND,
                    _ => io_error_rc(&e),
                });
                self.reply(cid, rc, None);
            }
            HostMessage::DirOpen { cid, path, .. } => self.dir_open(cid, &path),
            HostMessage::DirRead { cid, handle } => {
                let entry = self
                    .state
                    .lock()
                    .directories
                    .get_mut(&handle)
                    .map(|d| d.entries.pop_front());
                match entry {
                    Some(Some(entry)) => self.dir_notify(cid, GuestRc::SUCCESS, DirEvent::Read { entry }),
                    Some(None) => self.dir_notify(
                        cid,
                        GuestRc::NO_MORE_FILES,
                        DirEvent::Read {
                            entry: FsObjRecord::default(),
                        },
                    ),
                    None => self.dir_notify(cid, GuestRc::NOT_FOUND, DirEvent::Error),
                }
            }
            HostMessage::DirClose { cid, handle } => {
                self.state.lock().directories.remove(&handle);
                self.dir_notify(cid, GuestRc::SUCCESS, DirEvent::Closed);
            }
            HostMessage::FileOpen {
                cid,
                path,
                access,
                action,
                offset,
                ..
            } => self.file_open(cid, &path, access, action, offset),
            HostMessage::FileClose { cid, handle } => {
                self.state.lock().files.remove(&handle);
                self.file_notify(cid, GuestRc::SUCCESS, FileEvent::Closed);
            }
            HostMessage::FileRead { cid, handle, size } => self.file_read(cid, handle, None, size),
            HostMessage::FileReadAt {
                cid,
                handle,
                offset,
                size,
            } => self.file_read(cid, handle, Some(offset), size),
            HostMessage::FileWrite { cid, handle, data } => self.file_write(cid, handle, None, &data),
            HostMessage::FileWriteAt {
                cid,
                handle,
                offset,
                data,
            } => self.file_write(cid, handle, Some(offset), &data),
            HostMessage::FileSeek {
                cid,
                handle,
                origin,
                offset,
            } => {
                let position = match origin {
                    FileSeekOrigin::Begin => SeekFrom::Start(offset.max(0) as u64),
                    FileSeekOrigin::Current => SeekFrom::Current(offset),
                    FileSeekOrigin::End => SeekFrom::End(offset),
                };
                let result = match self.state.lock().files.get_mut(&handle) {
                    Some(file) => file.seek(position).map_err(|e| io_error_rc(&e)),
                    None => Err(GuestRc::NOT_FOUND),
                };
                match result {
                    Ok(offset) => self.file_notify(cid, GuestRc::SUCCESS, FileEvent::Seeked { offset }),
                    Err(rc) => self.file_notify(cid, rc, FileEvent::Seeked { offset: 0 }),
                }
            }
            HostMessage::ExecCmd(command) => self.exec(command),
            HostMessage::ExecTerminate { pid, .. } => {
                let cid = {
                    let mut state = self.state.lock();
                    state.processes.remove(&pid).map(|p| p.cid)
                };
                if let Some(cid) = cid {
                    self.inject(GuestCallback::ExecStatus {
                        cid,
                        pid,
                        status: ExecStatus::TerminatedSignal,
                        flags: 15,
                    });
                }
            }
            HostMessage::ExecGetOutput {
                cid, pid, handle, size, ..
            } => self.get_output(cid, pid, handle, size),
            HostMessage::ExecSetInput { cid, pid, flags, data } => self.set_input(cid, pid, flags, data),
        }
    }

    fn rename(&self, source: &str, dest: &str, flags: PathRenameFlags) -> GuestRc {
        let from = self.host_path(source);
        let to = self.host_path(dest);
        if fs::symlink_metadata(&from).is_err() {
            return GuestRc::PATH_NOT_FOUND;
        }
        if fs::symlink_metadata(&to).is_ok() && !flags.contains(PathRenameFlags::REPLACE) {
            return GuestRc::ALREADY_EXISTS;
        }
        match fs::rename(&from, &to) {
            Ok(()) => GuestRc::SUCCESS,
            Err(e) => io_error_rc(&e),
        }
    }

    fn dir_open(&self, cid: ContextId, path: &str) {
        let host = self.host_path(path);
        let listing = fs::read_dir(&host).and_then(|entries| {
            let mut records = Vec::new();
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let meta = fs::symlink_metadata(entry.path())?;
                records.push(FsObjData::from_metadata(name, &meta).to_record());
            }
            Ok(records)
        });
        match listing {
            Ok(mut records) => {
                records.sort_by(|a, b| a.name.cmp(&b.name));
                let mut entries: VecDeque<FsObjRecord> = records.into();
                for dot in ["..", "."] {
                    if let Ok(meta) = fs::metadata(&host) {
                        entries.push_front(FsObjData::from_metadata(dot, &meta).to_record());
                    }
                }
                let handle = {
                    let mut state = self.state.lock();
                    let handle = state.next_handle;
                    state.next_handle += 1;
                    state.directories.insert(handle, MockDirectory { entries });
                    handle
                };
                self.dir_notify(cid, GuestRc::SUCCESS, DirEvent::Opened { handle });
            }
            Err(e) => {
                let rc = match e.kind() {
                    io::ErrorKind::NotFound => GuestRc::PATH_NOT_FOUND,
                    _ => io_error_rc(&e),
                };
                self.dir_notify(cid, rc, DirEvent::Error);
            }
        }
    }

    fn file_open(&self, cid: ContextId, path: &str, access: FileAccessMode, action: FileOpenAction, offset: u64) {
        let host = self.host_path(path);
        let mut options = OpenOptions::new();
        options.read(access.can_read()).write(access.can_write());
        match action {
            FileOpenAction::OpenExisting => {}
            FileOpenAction::OpenOrCreate => {
                options.create(true);
            }
            FileOpenAction::CreateNew => {
                options.create_new(true);
            }
            FileOpenAction::CreateOrReplace => {
                options.create(true).truncate(true);
            }
            FileOpenAction::OpenExistingTruncated => {
                options.truncate(true);
            }
            FileOpenAction::AppendOrCreate => {
                options.create(true).append(true);
            }
        }

        let opened = if host.is_dir() {
            Err(GuestRc::IS_A_DIRECTORY)
        } else {
            options
                .open(&host)
                .and_then(|mut file| {
                    if offset > 0 {
                        file.seek(SeekFrom::Start(offset))?;
                    }
                    Ok(file)
                })
                .map_err(|e| match e.kind() {
                    io::ErrorKind::NotFound if !host.parent().is_some_and(Path::exists) => GuestRc::PATH_NOT_FOUND,
                    _ => io_error_rc(&e),
                })
        };

        match opened {
            Ok(file) => {
                let handle = {
                    let mut state = self.state.lock();
                    let handle = state.next_handle;
                    state.next_handle += 1;
                    state.files.insert(handle, file);
                    handle
                };
                self.file_notify(cid, GuestRc::SUCCESS, FileEvent::Opened { handle });
            }
            Err(rc) => self.file_notify(cid, rc, FileEvent::Error),
        }
    }

    fn file_read(&self, cid: ContextId, handle: u32, offset: Option<u64>, size: u32) {
        let result = match self.state.lock().files.get_mut(&handle) {
            Some(file) => read_chunk(file, offset, size).map_err(|e| io_error_rc(&e)),
            None => Err(GuestRc::NOT_FOUND),
        };
        match result {
            Ok(data) if data.is_empty() => self.file_notify(cid, GuestRc::EOF, FileEvent::Read { data }),
            Ok(data) => self.file_notify(cid, GuestRc::SUCCESS, FileEvent::Read { data }),
            Err(rc) => self.file_notify(cid, rc, FileEvent::Read { data: Vec::new() }),
        }
    }

    fn file_write(&self, cid: ContextId, handle: u32, offset: Option<u64>, data: &[u8]) {
        let result = match self.state.lock().files.get_mut(&handle) {
            Some(file) => write_chunk(file, offset, data).map_err(|e| io_error_rc(&e)),
            None => Err(GuestRc::NOT_FOUND),
        };
        match result {
            Ok(written) => self.file_notify(cid, GuestRc::SUCCESS, FileEvent::Written { written }),
            Err(rc) => self.file_notify(cid, rc, FileEvent::Written { written: 0 }),
        }
    }

    // ------------------------------------------------------------------------
    // Processes
    // ------------------------------------------------------------------------

    fn exec(&self, command: ExecCommand) {
        let cid = command.cid;
        let args: Vec<String> = command.arguments.iter().skip(1).cloned().collect();
        let (exit_code, stdout, echo_input) = match command.executable.as_str() {
            "vbox_stat" => self.tool_stat(&args),
            "vbox_mkdir" => self.tool_mkdir(&args),
            "vbox_rm" => self.tool_rm(&args),
            "vbox_mktemp" => self.tool_mktemp(&args),
            "mock_echo" => (Some(0), format!("{}\n", args.join(" ")).into_bytes(), false),
            "mock_cat" => (None, Vec::new(), true),
            "mock_sleep" => (None, Vec::new(), false),
            other => {
                let code = self.state.lock().exit_codes.get(other).copied().unwrap_or(0);
                (Some(code), Vec::new(), false)
            }
        };

        let wants_stdout = command.flags.contains(ProcessCreateFlags::WAIT_FOR_STDOUT);
        let pid = {
            let mut state = self.state.lock();
            let chatty = state.chatty.contains(&command.executable);
            let exit_code = if chatty { None } else { exit_code };
            state.executed.push(command.clone());
            let pid = state.next_pid;
            state.next_pid += 1;
            state.processes.insert(
                pid,
                MockProcess {
                    cid,
                    executable: command.executable.clone(),
                    stdout: if wants_stdout { stdout.into() } else { VecDeque::new() },
                    stderr: VecDeque::new(),
                    stdin: Vec::new(),
                    exit_code,
                    echo_input,
                    chatty,
                },
            );
            pid
        };

        self.inject(GuestCallback::ExecStatus {
            cid,
            pid,
            status: ExecStatus::Started,
            flags: 0,
        });
        self.finish_if_drained(pid);
    }

    /// Report the exit once a finished process has no output left.
    fn finish_if_drained(&self, pid: u32) {
        let finished = {
            let mut state = self.state.lock();
            let drained = matches!(
                state.processes.get(&pid),
                Some(p) if p.exit_code.is_some() && p.stdout.is_empty() && p.stderr.is_empty()
            );
            if drained {
                state
                    .processes
                    .remove(&pid)
                    .map(|p| (p.cid, p.exit_code.unwrap_or(0), p.executable))
            } else {
                None
            }
        };
        if let Some((cid, exit_code, executable)) = finished {
            tracing::trace!(pid, executable, exit_code, "Mock process exited");
            self.inject(GuestCallback::ExecStatus {
                cid,
                pid,
                status: ExecStatus::TerminatedNormally,
                flags: exit_code as u32,
            });
        }
    }

    fn get_output(&self, cid: ContextId, pid: u32, handle: u32, size: u32) {
        let data = {
            let mut state = self.state.lock();
            let Some(process) = state.processes.get_mut(&pid) else {
                return;
            };
            if process.chatty && handle != 2 && process.stdout.is_empty() {
                process.stdout.extend(b"still busy\n");
            }
            let buffer = if handle == 2 {
                &mut process.stderr
            } else {
                &mut process.stdout
            };
            let n = buffer.len().min(size as usize);
            buffer.drain(..n).collect::<Vec<u8>>()
        };
        self.inject(GuestCallback::ExecOutput {
            cid,
            pid,
            handle,
            flags: 0,
            data,
        });
        self.finish_if_drained(pid);
    }

    fn set_input(&self, cid: ContextId, pid: u32, flags: ProcessInputFlags, data: Vec<u8>) {
        let processed = data.len() as u32;
        let status = {
            let mut state = self.state.lock();
            match state.processes.get_mut(&pid) {
                Some(process) => {
                    process.stdin.extend_from_slice(&data);
                    if flags.contains(ProcessInputFlags::END_OF_FILE) && process.echo_input {
                        let input = std::mem::take(&mut process.stdin);
                        process.stdout.extend(input);
                        process.exit_code = Some(0);
                    }
                    InputStatus::Written
                }
                None => InputStatus::Broken,
            }
        };
        self.inject(GuestCallback::ExecInputStatus {
            cid,
            pid,
            status,
            flags: 0,
            processed: if status == InputStatus::Written { processed } else { 0 },
        });
    }

    // ------------------------------------------------------------------------
    // Guest tools
    // ------------------------------------------------------------------------

    /// Split `[options...] -- operand` into options and the operand.
    fn split_operand(args: &[String]) -> (Vec<&str>, Option<&str>) {
        match args.iter().position(|a| a == "--") {
            Some(i) => (
                args[..i].iter().map(String::as_str).collect(),
                args.get(i + 1).map(String::as_str),
            ),
            None => (
                args[..args.len().saturating_sub(1)].iter().map(String::as_str).collect(),
                args.last().map(String::as_str),
            ),
        }
    }

    fn option_value<'a>(options: &[&'a str], name: &str) -> Option<&'a str> {
        options
            .iter()
            .position(|o| *o == name)
            .and_then(|i| options.get(i + 1).copied())
    }

    fn tool_stat(&self, args: &[String]) -> (Option<i32>, Vec<u8>, bool) {
        let (options, operand) = Self::split_operand(args);
        let Some(path) = operand else {
            return (Some(2), Vec::new(), false);
        };
        let host = self.host_path(path);
        let meta = if options.contains(&"-L") {
            fs::metadata(&host)
        } else {
            fs::symlink_metadata(&host)
        };
        match meta {
            Ok(meta) => {
                let mut block = FsObjData::from_metadata(path, &meta).to_stat_block();
                block.insert("rc", "0");
                (Some(0), block.to_bytes(), false)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let parent_exists = host.parent().is_some_and(Path::exists);
                (Some(if parent_exists { 4 } else { 5 }), Vec::new(), false)
            }
            Err(_) => (Some(3), Vec::new(), false),
        }
    }

    fn tool_mkdir(&self, args: &[String]) -> (Option<i32>, Vec<u8>, bool) {
        let (options, operand) = Self::split_operand(args);
        let Some(path) = operand else {
            return (Some(2), Vec::new(), false);
        };
        let host = self.host_path(path);
        let result = if options.contains(&"--parents") {
            fs::create_dir_all(&host)
        } else {
            fs::create_dir(&host)
        };
        (Some(if result.is_ok() { 0 } else { 1 }), Vec::new(), false)
    }

    fn tool_rm(&self, args: &[String]) -> (Option<i32>, Vec<u8>, bool) {
        let (_, operand) = Self::split_operand(args);
        let Some(path) = operand else {
            return (Some(2), Vec::new(), false);
        };
        match fs::remove_file(self.host_path(path)) {
            Ok(()) => {
                let mut block = StreamBlock::default();
                block.insert("fname", path);
                block.insert("rc", "0");
                (Some(0), block.to_bytes(), false)
            }
            Err(_) => (Some(1), Vec::new(), false),
        }
    }

    fn tool_mktemp(&self, args: &[String]) -> (Option<i32>, Vec<u8>, bool) {
        let (options, operand) = Self::split_operand(args);
        let Some(template) = operand else {
            return (Some(2), Vec::new(), false);
        };
        let directory = options.contains(&"-d");
        let base = Self::option_value(&options, "-t").unwrap_or("/tmp");

        let stem = template.trim_end_matches('X');
        let random_len = template.len() - stem.len();
        if random_len < 3 {
            return (Some(1), Vec::new(), false);
        }
        for attempt in 0..100u32 {
            let suffix = format!("{:0width$}", attempt, width = random_len);
            let name = if template.starts_with('/') {
                format!("{}{}", stem, suffix)
            } else {
                format!("{}/{}{}", base.trim_end_matches('/'), stem, suffix)
            };
            let host = self.host_path(&name);
            if host.exists() {
                continue;
            }
            let created = if directory {
                fs::create_dir(&host)
            } else {
                File::create(&host).map(|_| ())
            };
            return match created {
                Ok(()) => {
                    let mut block = StreamBlock::default();
                    block.insert("name", name);
                    block.insert("rc", "0");
                    (Some(0), block.to_bytes(), false)
                }
                Err(_) => (Some(1), Vec::new(), false),
            };
        }
        (Some(1), Vec::new(), false)
    }
}

#[async_trait]
impl guestctl::GuestChannel for MockGuest {
    async fn send(&self, message: HostMessage) -> GuestctlResult<()> {
        let name = message.name();
        {
            let mut state = self.state.lock();
            state.sent.push(message.clone());
            if state.dropped.contains(name) {
                tracing::trace!(message = name, "Mock dropping message");
                return Ok(());
            }
        }
        self.handle(message);
        Ok(())
    }
}

// ============================================================================
// Test guest
// ============================================================================

/// A [`Guest`] wired to a [`MockGuest`] over a temporary directory.
pub struct TestGuest {
    pub guest: Guest,
    pub mock: Arc<MockGuest>,
    root: TempDir,
}

impl TestGuest {
    /// Linux guest with current Additions and shutdown support.
    pub fn new() -> Self {
        Self::with_guest(GuestOsType::Linux, "7.0.10r161000", GuestctlOptions::default())
    }

    pub fn with_guest(os_type: GuestOsType, version: &str, options: GuestctlOptions) -> Self {
        let root = tempfile::tempdir().expect("create guest root");
        let mock = MockGuest::new(root.path());
        let guest = Guest::new(mock.clone(), options).expect("create guest");
        mock.attach(&guest);

        let product = match os_type {
            GuestOsType::Windows => "Windows 10",
            GuestOsType::Linux => "Linux",
            GuestOsType::Solaris => "SunOS",
            GuestOsType::Other => "FreeBSD",
            GuestOsType::Unknown => "",
        };
        guest
            .set_property(properties::ADDITIONS_VERSION, version)
            .expect("set additions version");
        guest
            .set_property(properties::OS_PRODUCT, product)
            .expect("set OS product");
        guest.set_features(GuestFeatures::SHUTDOWN | GuestFeatures::PROCESS_ARGV0);

        Self { guest, mock, root }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn host_path(&self, guest_path: &str) -> PathBuf {
        self.mock.host_path(guest_path)
    }

    /// Write a file into the guest filesystem, creating parents.
    pub fn write_guest_file(&self, guest_path: &str, data: &[u8]) -> PathBuf {
        let host = self.host_path(guest_path);
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent).expect("create guest parent");
        }
        fs::write(&host, data).expect("write guest file");
        host
    }

    /// Create and start a session for `user`.
    pub async fn session(&self, user: &str) -> Session {
        let session = self
            .guest
            .create_session(SessionCredentials::new(user, "secret"), &format!("{} session", user))
            .expect("create session");
        session.start().await.expect("start session");
        session
    }
}

impl Default for TestGuest {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestGuest {
    fn drop(&mut self) {
        self.mock.detach();
    }
}

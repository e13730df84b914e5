use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::time::Duration;

use itertools::Itertools;
use libc::pid_t;
use log::{debug, trace};
use nix::errno::Errno;

use crate::context::Context;
use crate::core::{EmptyResult, Error, ErrorKind, ErrorSource, OpResult};
use crate::data::{self, Data};
use crate::sys::{self, Direction, FdEntry, InheritedFd, Multiplexer, PollMultiplexer};

use super::status::{self, LineBuffer, StatusCode};

pub type StatusHandler = fn(&mut Context, StatusCode, &str) -> EmptyResult;
pub type ColonHandler = fn(&mut Context, Option<&str>) -> EmptyResult;
pub type CommandHandler = fn(&mut Context, StatusCode, &str) -> OpResult<String>;

const TERMINATION_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Building,
    Spawned,
    Running,
    Finishing,
    Done,
}

pub struct DriverConfig {
    /// Pass `--batch` when no command channel is configured.
    pub batch_arg: bool,
    /// Suppress the engine's comment header with `--comment ""`.
    pub comment_arg: bool,
    /// The engine understands `-&N` fd arguments.
    pub special_filenames: bool,
}

enum ArgItem {
    Str(String),
    Data(usize),
}

struct DataSlot<'a> {
    data: &'a mut Data,
    inbound: bool,
    dup_to: Option<RawFd>,
    fd: Option<OwnedFd>,
    child_fd: Option<OwnedFd>,
    buf: Vec<u8>,
    pending: usize,
}

struct StatusChannel {
    read: Option<OwnedFd>,
    child: Option<OwnedFd>,
    buffer: LineBuffer,
    eof: bool,
}

struct ColonChannel {
    read: Option<OwnedFd>,
    child: Option<OwnedFd>,
    buffer: LineBuffer,
    handler: ColonHandler,
}

struct CommandChannel {
    write: Option<OwnedFd>,
    child_read: Option<OwnedFd>,
    handler: CommandHandler,
    linked_slot: Option<usize>,
    // Set while an inquiry waits for its reply to be flushed; the write fd
    // stays frozen in the multiplexer otherwise.
    pending: Option<StatusCode>,
    reply: Vec<u8>,
    written: usize,
}

#[derive(Clone, Copy)]
enum Role {
    Status,
    Colon,
    Command,
    Slot(usize),
}

/// One in-flight engine operation: owns the argument vector, the fd plan and
/// all channel state, and sequences launch, pumping and reaping.
pub struct Driver<'a> {
    name: &'static str,
    path: PathBuf,
    config: DriverConfig,

    argv: Vec<ArgItem>,
    slots: Vec<DataSlot<'a>>,
    status: StatusChannel,
    status_handler: Option<StatusHandler>,
    colon: Option<ColonChannel>,
    command: Option<CommandChannel>,

    state: State,
    child: Option<Child>,
    cancelled: bool,
    error: Option<Error>,
}

impl<'a> Driver<'a> {
    pub fn new(name: &'static str, path: &Path, config: DriverConfig) -> OpResult<Driver<'a>> {
        let pipe = sys::pipe()?;
        let status_child_fd = pipe.write.as_raw_fd();

        let mut driver = Driver {
            name, config,
            path: path.to_path_buf(),

            argv: Vec::new(),
            slots: Vec::new(),
            status: StatusChannel {
                read: Some(pipe.read),
                child: Some(pipe.write),
                buffer: LineBuffer::new(),
                eof: false,
            },
            status_handler: None,
            colon: None,
            command: None,

            state: State::Building,
            child: None,
            cancelled: false,
            error: None,
        };

        driver.add_arg("--status-fd");
        driver.add_arg(status_child_fd.to_string());
        Ok(driver)
    }

    pub fn add_arg<S: Into<String>>(&mut self, arg: S) {
        self.argv.push(ArgItem::Str(arg.into()));
    }

    /// Attaches a data object. With a dup target the child sees the pipe as
    /// one of its standard streams; without one the pipe fd is passed inside
    /// the argument vector as a `-&N` special filename.
    pub fn add_data(&mut self, data: &'a mut Data, dup_to: Option<RawFd>, inbound: bool) -> usize {
        let index = self.slots.len();

        self.slots.push(DataSlot {
            data, inbound, dup_to,
            fd: None,
            child_fd: None,
            buf: Vec::new(),
            pending: 0,
        });

        if dup_to.is_none() {
            assert!(self.config.special_filenames);
            self.argv.push(ArgItem::Data(index));
        }

        index
    }

    pub fn set_status_handler(&mut self, handler: StatusHandler) {
        self.status_handler = Some(handler);
    }

    /// Requests machine-readable stdout: the child's stdout is redirected
    /// into a dedicated pipe whose complete lines go to the handler.
    pub fn set_colon_handler(&mut self, handler: ColonHandler) -> EmptyResult {
        let pipe = sys::pipe()?;
        self.colon = Some(ColonChannel {
            read: Some(pipe.read),
            child: Some(pipe.write),
            buffer: LineBuffer::new(),
            handler,
        });
        Ok(())
    }

    /// Enables the interactive command channel. The handler is invoked for
    /// every `GET_*` inquiry and its reply is written to the child's
    /// command fd.
    pub fn set_command_handler(&mut self, handler: CommandHandler) -> EmptyResult {
        let pipe = sys::pipe()?;

        self.add_arg("--command-fd");
        self.add_arg(pipe.read.as_raw_fd().to_string());

        self.command = Some(CommandChannel {
            write: Some(pipe.write),
            child_read: Some(pipe.read),
            handler,
            linked_slot: None,
            pending: None,
            reply: Vec::new(),
            written: 0,
        });
        Ok(())
    }

    /// Couples the command channel with a data slot. Before a reply is
    /// written, everything the child has buffered on that slot is drained,
    /// so command replies can't overtake the output they refer to.
    pub fn link_command_data(&mut self, slot: usize) {
        if let Some(ref mut command) = self.command {
            command.linked_slot = Some(slot);
        }
    }

    pub fn spawn(&mut self) -> EmptyResult {
        assert_eq!(self.state, State::Building);
        assert!(self.status_handler.is_some());

        for slot in &mut self.slots {
            let pipe = sys::pipe()?;
            if slot.inbound {
                slot.fd = Some(pipe.read);
                slot.child_fd = Some(pipe.write);
            } else {
                slot.fd = Some(pipe.write);
                slot.child_fd = Some(pipe.read);
            }
        }

        let args = self.render_args();
        debug!("Executing {} {}...", self.path.display(), args.iter().join(" "));

        let mut inherited = Vec::new();
        inherited.push(InheritedFd {
            fd: self.status.child.take().unwrap(),
            target: None,
        });
        if let Some(ref mut colon) = self.colon {
            inherited.push(InheritedFd {
                fd: colon.child.take().unwrap(),
                target: Some(1),
            });
        }
        if let Some(ref mut command) = self.command {
            inherited.push(InheritedFd {
                fd: command.child_read.take().unwrap(),
                target: None,
            });
        }
        for slot in &mut self.slots {
            inherited.push(InheritedFd {
                fd: slot.child_fd.take().unwrap(),
                target: slot.dup_to,
            });
        }

        self.child = Some(sys::spawn(&self.path, &args, &inherited)?);
        drop(inherited);

        sys::set_nonblocking(self.status.read.as_ref().unwrap())?;
        if let Some(ref colon) = self.colon {
            sys::set_nonblocking(colon.read.as_ref().unwrap())?;
        }
        if let Some(ref command) = self.command {
            sys::set_nonblocking(command.write.as_ref().unwrap())?;
        }
        for slot in &self.slots {
            sys::set_nonblocking(slot.fd.as_ref().unwrap())?;
        }

        self.state = State::Spawned;
        Ok(())
    }

    fn render_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        let need_special = self.slots.iter().any(|slot| slot.dup_to.is_none());
        if need_special {
            args.push("--enable-special-filenames".to_owned());
        }
        if self.config.batch_arg && self.command.is_none() {
            args.push("--batch".to_owned());
        }
        if self.config.comment_arg {
            args.push("--comment".to_owned());
            args.push(String::new());
        }

        for item in &self.argv {
            match *item {
                ArgItem::Str(ref arg) => args.push(arg.clone()),
                ArgItem::Data(index) => {
                    let slot = &self.slots[index];
                    args.push(format!("-&{}", slot.child_fd.as_ref().unwrap().as_raw_fd()));
                },
            }
        }

        args
    }

    /// Drives the operation to completion and returns the terminal error.
    pub fn run(&mut self, ctx: &mut Context) -> Option<Error> {
        assert_eq!(self.state, State::Spawned);
        self.state = State::Running;
        ctx.emit_start();

        let mut mux = ctx.take_multiplexer();
        self.run_loop(ctx, mux.as_mut());
        ctx.restore_multiplexer(mux);

        self.finish();
        self.state = State::Done;

        ctx.emit_done(self.error.as_ref());
        self.error.clone()
    }

    fn run_loop(&mut self, ctx: &mut Context, mux: &mut dyn Multiplexer) {
        loop {
            if ctx.cancel_requested() && !self.cancelled {
                debug!("Operation cancellation requested. Closing all {} fds...", self.name);
                self.cancelled = true;
                self.close_all_fds();
                self.latch(Error::user(ErrorKind::Canceled));
            }

            if self.status.eof && self.state == State::Running {
                self.state = State::Finishing;
            }

            let (roles, mut entries) = self.collect_entries();
            if entries.iter().all(|entry| entry.frozen) {
                break;
            }

            match mux.select(&mut entries, false) {
                Ok(0) => continue,
                Ok(_) => {},
                Err(err) => {
                    self.latch(err);
                    self.close_all_fds();
                    break;
                },
            }

            for (role, entry) in roles.iter().zip(&entries) {
                if !entry.signalled {
                    continue;
                }

                let result = match *role {
                    Role::Status => self.handle_status(ctx),
                    Role::Colon => self.handle_colon(ctx),
                    Role::Command => self.handle_command_write(),
                    Role::Slot(index) => self.handle_slot(index),
                };

                if let Err(err) = result {
                    self.latch(err);
                }
            }
        }
    }

    fn collect_entries(&self) -> (Vec<Role>, Vec<FdEntry>) {
        let mut roles = Vec::new();
        let mut entries = Vec::new();

        if let Some(ref fd) = self.status.read {
            roles.push(Role::Status);
            entries.push(FdEntry::new(fd.as_raw_fd(), Direction::Read));
        }

        if let Some(ref colon) = self.colon {
            if let Some(ref fd) = colon.read {
                roles.push(Role::Colon);
                entries.push(FdEntry::new(fd.as_raw_fd(), Direction::Read));
            }
        }

        if let Some(ref command) = self.command {
            if let Some(ref fd) = command.write {
                let mut entry = FdEntry::new(fd.as_raw_fd(), Direction::Write);
                entry.frozen = command.pending.is_none();
                roles.push(Role::Command);
                entries.push(entry);
            }
        }

        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(ref fd) = slot.fd {
                roles.push(Role::Slot(index));
                entries.push(FdEntry::new(fd.as_raw_fd(), match slot.inbound {
                    true => Direction::Read,
                    false => Direction::Write,
                }));
            }
        }

        (roles, entries)
    }

    fn handle_status(&mut self, ctx: &mut Context) -> EmptyResult {
        let fd = match self.status.read {
            Some(ref fd) => fd,
            None => return Ok(()),
        };

        let size = match self.status.buffer.fill(fd) {
            Err(Errno::EAGAIN) => return Ok(()),
            Err(err) => {
                self.status.read = None;
                self.status.eof = true;
                return Err(Error::with_message(ErrorKind::PipeError, ErrorSource::System, format!(
                    "Error while reading {} status channel: {}", self.name, err)));
            },
            Ok(size) => size,
        };

        if size == 0 {
            trace!("[{}] status channel EOF.", self.name);
            self.status.read = None;
            self.status.eof = true;

            let handler = self.status_handler.unwrap();
            if let Err(err) = handler(ctx, StatusCode::Eof, "") {
                self.latch_terminal(err);
            }
            return Ok(());
        }

        let mut lines = Vec::new();
        self.status.buffer.drain_lines(|line| {
            if let Some((code, args)) = status::parse_line(line) {
                lines.push((code, args.to_owned()));
            }
            Ok(())
        })?;

        let mut first_error = None;
        for (code, args) in lines {
            trace!("[{}] status: {:?} {}", self.name, code, args);
            if let Err(err) = self.dispatch_status(ctx, code, &args) {
                first_error.get_or_insert(err);
            }
        }

        // The terminal error is latched, but we keep reading to collect
        // FAILURE and further diagnostics until the pipe closes
        first_error.map_or(Ok(()), Err)
    }

    fn dispatch_status(&mut self, ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
        let interactive = self.command.is_some() && matches!(
            code, StatusCode::GetBool | StatusCode::GetLine | StatusCode::GetHidden);

        if interactive {
            self.inquiry(ctx, code, args)
        } else {
            (self.status_handler.unwrap())(ctx, code, args)
        }
    }

    fn inquiry(&mut self, ctx: &mut Context, code: StatusCode, keyword: &str) -> EmptyResult {
        // The child produces prompts on the command channel and operation
        // output on the linked data pipe. Both have to be drained to
        // quiescence before we may answer, or the reply races the output it
        // refers to.
        if let Some(slot) = self.command.as_ref().and_then(|command| command.linked_slot) {
            self.drain_linked_data(slot)?;
        }

        let handler = self.command.as_ref().unwrap().handler;
        let reply = match handler(ctx, code, keyword) {
            Ok(reply) => reply,
            Err(err) => {
                // Closing the channel is the only way to tell the child that
                // no reply will come; it aborts the operation on EOF
                let command = self.command.as_mut().unwrap();
                command.write = None;
                command.pending = None;
                return Err(err);
            },
        };

        let command = self.command.as_mut().unwrap();
        command.reply.clear();
        command.reply.extend_from_slice(reply.as_bytes());
        if !reply.ends_with('\n') {
            command.reply.push(b'\n');
        }
        command.written = 0;
        command.pending = Some(code);
        Ok(())
    }

    fn drain_linked_data(&mut self, index: usize) -> EmptyResult {
        loop {
            let fd = match self.slots[index].fd {
                Some(ref fd) => fd.as_raw_fd(),
                None => return Ok(()),
            };

            let mut entries = [FdEntry::new(fd, Direction::Read)];
            if PollMultiplexer.select(&mut entries, true)? == 0 {
                return Ok(());
            }

            self.pump_inbound(index)?;
        }
    }

    fn handle_command_write(&mut self) -> EmptyResult {
        let name = self.name;
        let command = match self.command {
            Some(ref mut command) => command,
            None => return Ok(()),
        };
        if command.pending.is_none() {
            return Ok(());
        }
        let fd = match command.write {
            Some(ref fd) => fd,
            None => return Ok(()),
        };

        match sys::write_retry(fd, &command.reply[command.written..]) {
            Err(Errno::EAGAIN) => Ok(()),
            Err(Errno::EPIPE) => {
                // The child died instead of reading the reply; the status
                // channel tells why
                command.write = None;
                command.pending = None;
                Ok(())
            },
            Err(err) => {
                command.write = None;
                command.pending = None;
                Err!("Error while replying to {} inquiry: {}", name, err)
            },
            Ok(size) => {
                command.written += size;
                if command.written == command.reply.len() {
                    // Replies may carry passphrases
                    data::wipe(&mut command.reply);
                    command.reply.clear();
                    command.written = 0;
                    command.pending = None;
                }
                Ok(())
            },
        }
    }

    fn handle_colon(&mut self, ctx: &mut Context) -> EmptyResult {
        let colon = self.colon.as_mut().unwrap();
        let fd = match colon.read {
            Some(ref fd) => fd,
            None => return Ok(()),
        };

        let size = match colon.buffer.fill(fd) {
            Err(Errno::EAGAIN) => return Ok(()),
            Err(err) => {
                colon.read = None;
                return Err!("Error while reading {} listing output: {}", self.name, err);
            },
            Ok(size) => size,
        };

        if size == 0 {
            colon.read = None;
            return (colon.handler)(ctx, None);
        }

        let mut lines = Vec::new();
        colon.buffer.drain_lines(|line| {
            // Skip diagnostics the engine may print in between: a record
            // always contains at least one colon
            if line.contains(&b':') {
                lines.push(String::from_utf8_lossy(line).into_owned());
            }
            Ok(())
        })?;

        let handler = colon.handler;
        let mut first_error = None;
        for line in lines {
            if let Err(err) = handler(ctx, Some(&line)) {
                first_error.get_or_insert(err);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn handle_slot(&mut self, index: usize) -> EmptyResult {
        if self.slots[index].inbound {
            self.pump_inbound(index)
        } else {
            self.pump_outbound(index)
        }
    }

    fn pump_inbound(&mut self, index: usize) -> EmptyResult {
        let name = self.name;
        let slot = &mut self.slots[index];
        let fd = match slot.fd {
            Some(ref fd) => fd,
            None => return Ok(()),
        };

        if slot.buf.is_empty() {
            slot.buf = vec![0; slot.data.transfer_buffer_size()];
        }

        let size = match sys::read_retry(fd, &mut slot.buf) {
            Err(Errno::EAGAIN) => return Ok(()),
            Err(err) => {
                slot.fd = None;
                return Err!("Error while reading {} output: {}", name, err);
            },
            Ok(0) => {
                slot.fd = None;
                return Ok(());
            },
            Ok(size) => size,
        };

        let result = slot.data.write_all(&slot.buf[..size]);
        if slot.data.sensitive() {
            data::wipe(&mut slot.buf[..size]);
        }

        if result.is_err() {
            slot.fd = None;
        }
        result
    }

    fn pump_outbound(&mut self, index: usize) -> EmptyResult {
        let name = self.name;
        let slot = &mut self.slots[index];
        let fd = match slot.fd {
            Some(ref fd) => fd,
            None => return Ok(()),
        };

        if slot.buf.is_empty() {
            slot.buf = vec![0; slot.data.transfer_buffer_size()];
        }

        if slot.pending == 0 {
            let size = match slot.data.read(&mut slot.buf) {
                Ok(size) => size,
                Err(err) => {
                    slot.fd = None;
                    return Err(err);
                },
            };

            if size == 0 {
                if slot.data.sensitive() {
                    data::wipe(&mut slot.buf);
                }
                slot.fd = None;
                return Ok(());
            }
            slot.pending = size;
        }

        match sys::write_retry(fd, &slot.buf[..slot.pending]) {
            Err(Errno::EAGAIN) => Ok(()),
            Err(Errno::EPIPE) => {
                // The child stopped reading, usually to report an error on
                // the status channel. Silently close our end.
                slot.fd = None;
                Ok(())
            },
            Err(err) => {
                slot.fd = None;
                Err!("Error while passing data to {}: {}", name, err)
            },
            Ok(written) => {
                slot.buf.copy_within(written..slot.pending, 0);
                slot.pending -= written;
                Ok(())
            },
        }
    }

    fn close_all_fds(&mut self) {
        self.status.read = None;
        self.status.eof = true;

        if let Some(ref mut colon) = self.colon {
            colon.read = None;
        }

        if let Some(ref mut command) = self.command {
            command.write = None;
            command.pending = None;
        }

        for slot in &mut self.slots {
            slot.fd = None;
        }
    }

    fn finish(&mut self) {
        // Close leftovers first: a child blocked on one of our pipes would
        // never exit
        self.close_all_fds();

        let mut child = match self.child.take() {
            Some(child) => child,
            None => return,
        };

        if self.cancelled {
            let name = format!("a child {} process", self.name);
            let _ = sys::terminate_process(&name, child.id() as pid_t, TERMINATION_TIMEOUT);
            let _ = child.wait();
            return;
        }

        // The exit code is not relied upon: engines exit nonzero for verdicts
        // the caller reads from the result (a bad signature, say), and the
        // status stream already carried everything authoritative. The child
        // is reaped unconditionally though.
        if let Err(err) = sys::reap(self.name, &mut child) {
            self.latch(err);
        }
    }

    fn latch(&mut self, err: Error) {
        if self.error.is_none() {
            debug!("Operation error: {}.", err);
            self.error = Some(err);
        }
    }

    // Errors computed at status EOF may be more specific than what has been
    // latched from a generic failure before
    fn latch_terminal(&mut self, err: Error) {
        match self.error {
            None => self.latch(err),
            Some(ref current) if current.kind() == ErrorKind::General => {
                debug!("Operation error: {}.", err);
                self.error = Some(err);
            },
            Some(_) => {},
        }
    }

    #[cfg(test)]
    pub(crate) fn test_render_args(&mut self) -> OpResult<Vec<String>> {
        for slot in &mut self.slots {
            if slot.child_fd.is_none() {
                let pipe = sys::pipe()?;
                if slot.inbound {
                    slot.fd = Some(pipe.read);
                    slot.child_fd = Some(pipe.write);
                } else {
                    slot.fd = Some(pipe.write);
                    slot.child_fd = Some(pipe.read);
                }
            }
        }
        Ok(self.render_args())
    }
}

impl Drop for Driver<'_> {
    fn drop(&mut self) {
        self.close_all_fds();

        if let Some(mut child) = self.child.take() {
            let name = format!("a child {} process", self.name);
            let _ = sys::terminate_process(&name, child.id() as pid_t, TERMINATION_TIMEOUT);
            let _ = child.wait();
        }
    }
}

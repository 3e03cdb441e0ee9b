//! Action execution: files, pipes, child processes.
//!
//! File actions write through a bounded LRU pool of open descriptors so a
//! table with thousands of destinations cannot exhaust the process's fd
//! budget. Pipe actions keep one child per expanded command line and write
//! the product to its stdin under a timeout; a timed-out or broken child is
//! a permanent failure (which removes TRANSIENT rules). Exec actions fork
//! and optionally wait.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, WriteBytesExt};
use hashlink::LruCache;
use thiserror::Error;

use crate::product::ProductInfo;

/// Descriptors reserved away from the pool: stdio, queue, config, log,
/// sockets, and slack.
const RESERVED_FDS: usize = 16;

/// What a rule does with a matched product.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    File,
    StdioFile,
    Pipe,
    SPipe,
    XPipe,
    Exec,
    DbFile,
    Noop,
}

impl ActionKind {
    pub fn parse(token: &str) -> Option<ActionKind> {
        match token {
            "file" => Some(ActionKind::File),
            "stdiofile" => Some(ActionKind::StdioFile),
            "pipe" => Some(ActionKind::Pipe),
            "spipe" => Some(ActionKind::SPipe),
            "xpipe" => Some(ActionKind::XPipe),
            "exec" => Some(ActionKind::Exec),
            "dbfile" => Some(ActionKind::DbFile),
            "noop" => Some(ActionKind::Noop),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ActionError {
    /// Transient contention; the product should be retried later.
    #[error("resource busy: {0}")]
    Busy(String),

    /// The action cannot succeed for this destination.
    #[error("permanent action failure: {0}")]
    Permanent(String),

    #[error("empty action arguments after expansion")]
    NoArguments,
}

struct PipeChild {
    child: Child,
}

/// Shared action state: the fd pool and the child maps.
pub struct ActionContext {
    files: LruCache<PathBuf, File>,
    pipes: HashMap<Vec<String>, PipeChild>,
    /// Fire-and-forget exec children awaiting reaping.
    detached: Vec<Child>,
    pipe_timeout: Duration,
}

impl ActionContext {
    pub fn new(pipe_timeout: Duration) -> ActionContext {
        // SAFETY: sysconf is async-signal-safe and always callable.
        let open_max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
        let budget = if open_max > 0 {
            (open_max as usize).saturating_sub(RESERVED_FDS).max(8)
        } else {
            256
        };
        log::debug!("action fd budget: {}", budget);
        ActionContext {
            files: LruCache::new(budget),
            pipes: HashMap::new(),
            detached: Vec::new(),
            pipe_timeout,
        }
    }

    /// Runs one expanded action. `argv` is the tokenized template.
    pub fn run(
        &mut self,
        kind: ActionKind,
        argv: &[String],
        info: &ProductInfo,
        data: &[u8],
    ) -> Result<(), ActionError> {
        match kind {
            ActionKind::Noop => Ok(()),
            ActionKind::File | ActionKind::StdioFile => self.file_action(argv, data),
            ActionKind::Pipe => self.pipe_action(argv, |w, _| w.write_all(data), info),
            ActionKind::SPipe => self.pipe_action(
                argv,
                |w, info| {
                    // Length-framed stream variant.
                    w.write_u32::<BigEndian>(info.ident.len() as u32)?;
                    w.write_all(info.ident.as_bytes())?;
                    w.write_u32::<BigEndian>(data.len() as u32)?;
                    w.write_all(data)
                },
                info,
            ),
            ActionKind::XPipe => self.pipe_action(
                argv,
                |w, info| {
                    // Metadata-framed variant.
                    w.write_all(info.signature.as_bytes())?;
                    w.write_u64::<BigEndian>(info.arrival.sec)?;
                    w.write_u32::<BigEndian>(info.arrival.usec)?;
                    w.write_u32::<BigEndian>(info.feedtype.0)?;
                    w.write_u32::<BigEndian>(info.seqno)?;
                    w.write_u32::<BigEndian>(info.ident.len() as u32)?;
                    w.write_all(info.ident.as_bytes())?;
                    w.write_u32::<BigEndian>(data.len() as u32)?;
                    w.write_all(data)
                },
                info,
            ),
            ActionKind::Exec => self.exec_action(argv),
            ActionKind::DbFile => {
                log::warn!("dbfile action not built into this node; ignoring");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // file / stdiofile

    fn file_action(&mut self, argv: &[String], data: &[u8]) -> Result<(), ActionError> {
        let (options, path) = split_options(argv)?;
        let overwrite = options.contains(&"-overwrite");
        let close = options.contains(&"-close");
        let flush = options.contains(&"-flush");
        let strip = options.contains(&"-strip");

        let stripped;
        let payload = if strip {
            stripped = data
                .iter()
                .copied()
                .filter(|b| b.is_ascii() && (*b == b'\n' || !b.is_ascii_control()))
                .collect::<Vec<u8>>();
            &stripped[..]
        } else {
            data
        };

        let path = PathBuf::from(path);
        let result = self.write_file(&path, payload, overwrite, flush);
        if close {
            self.files.remove(&path);
        }
        result
    }

    fn write_file(
        &mut self,
        path: &Path,
        data: &[u8],
        overwrite: bool,
        flush: bool,
    ) -> Result<(), ActionError> {
        if !self.files.contains_key(path) {
            let file = self.open_pooled(path, overwrite)?;
            self.files.insert(path.to_path_buf(), file);
        } else if overwrite {
            // Rewind and truncate the pooled descriptor.
            if let Some(file) = self.files.get_mut(path) {
                let _unused = file.set_len(0);
                let _unused = file.seek_start();
            }
        }
        let file = self.files.get_mut(path).expect("just inserted");
        match file.write_all(data) {
            Ok(()) => {
                if flush {
                    let _unused = file.sync_data();
                }
                Ok(())
            }
            Err(err) if is_contention(&err) => {
                // Shed the coldest descriptor and retry on the next poll.
                self.files.remove(path);
                if let Some((cold, _)) = self.files.remove_lru() {
                    log::debug!("released cold descriptor {}", cold.display());
                }
                Err(ActionError::Busy(path.display().to_string()))
            }
            Err(err) => {
                self.files.remove(path);
                Err(ActionError::Permanent(format!(
                    "{}: {}",
                    path.display(),
                    err
                )))
            }
        }
    }

    fn open_pooled(&mut self, path: &Path, overwrite: bool) -> Result<File, ActionError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                let _unused = std::fs::create_dir_all(dir);
            }
        }
        loop {
            let attempt = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(overwrite)
                .append(!overwrite)
                .open(path);
            match attempt {
                Ok(file) => return Ok(file),
                Err(err)
                    if err.raw_os_error() == Some(libc::EMFILE)
                        || err.raw_os_error() == Some(libc::ENFILE) =>
                {
                    // Out of descriptors: shed the coldest and try again.
                    match self.files.remove_lru() {
                        Some((cold, _)) => {
                            log::debug!("fd budget: releasing {}", cold.display())
                        }
                        None => {
                            return Err(ActionError::Busy(path.display().to_string()));
                        }
                    }
                }
                Err(err) if is_contention(&err) => {
                    return Err(ActionError::Busy(path.display().to_string()));
                }
                Err(err) => {
                    return Err(ActionError::Permanent(format!(
                        "{}: {}",
                        path.display(),
                        err
                    )))
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // pipe / spipe / xpipe

    fn pipe_action<F>(
        &mut self,
        argv: &[String],
        write: F,
        info: &ProductInfo,
    ) -> Result<(), ActionError>
    where
        F: FnOnce(&mut dyn Write, &ProductInfo) -> io::Result<()>,
    {
        if argv.is_empty() {
            return Err(ActionError::NoArguments);
        }
        let key: Vec<String> = argv.to_vec();
        if !self.pipes.contains_key(&key) {
            let child = Command::new(&argv[0])
                .args(&argv[1..])
                .stdin(Stdio::piped())
                .spawn()
                .map_err(|err| {
                    ActionError::Permanent(format!("spawn {:?}: {}", argv, err))
                })?;
            log::info!("pipe child {:?} (pid {})", argv, child.id());
            self.pipes.insert(key.clone(), PipeChild { child });
        }

        let result = {
            let pipe = self.pipes.get_mut(&key).expect("just inserted");
            let stdin = pipe
                .child
                .stdin
                .as_mut()
                .ok_or_else(|| ActionError::Permanent("pipe stdin gone".to_string()))?;
            let mut timed = TimedWriter::new(stdin, self.pipe_timeout);
            write(&mut timed, info).and_then(|()| timed.flush())
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                // A dead or wedged decoder: reap and report permanent.
                let mut pipe = self.pipes.remove(&key).expect("present");
                let _unused = pipe.child.kill();
                let _unused = pipe.child.wait();
                Err(ActionError::Permanent(format!("pipe {:?}: {}", argv, err)))
            }
        }
    }

    // ------------------------------------------------------------------
    // exec

    fn exec_action(&mut self, argv: &[String]) -> Result<(), ActionError> {
        let wait = argv.first().map(|first| first == "-wait").unwrap_or(false);
        let argv = if wait { &argv[1..] } else { argv };
        if argv.is_empty() {
            return Err(ActionError::NoArguments);
        }
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .spawn()
            .map_err(|err| ActionError::Permanent(format!("exec {:?}: {}", argv, err)))?;
        if wait {
            match child.wait() {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(ActionError::Permanent(format!(
                    "exec {:?} exited {}",
                    argv, status
                ))),
                Err(err) => Err(ActionError::Permanent(format!("wait {:?}: {}", argv, err))),
            }
        } else {
            log::debug!("exec child {:?} (pid {})", argv, child.id());
            self.detached.push(child);
            Ok(())
        }
    }

    /// Reaps finished children: detached execs and exited pipe decoders.
    pub fn reap(&mut self) {
        self.detached
            .retain_mut(|child| !matches!(child.try_wait(), Ok(Some(_)) | Err(_)));
        self.pipes.retain(|argv, pipe| match pipe.child.try_wait() {
            Ok(Some(status)) => {
                log::warn!("pipe child {:?} exited: {}", argv, status);
                false
            }
            Ok(None) => true,
            Err(_) => false,
        });
    }

    /// Closes everything; pipe children get EOF on stdin and are reaped.
    pub fn shutdown(&mut self) {
        self.files.clear();
        for (argv, mut pipe) in self.pipes.drain() {
            drop(pipe.child.stdin.take());
            match pipe.child.wait() {
                Ok(status) => log::debug!("pipe child {:?} exited: {}", argv, status),
                Err(err) => log::warn!("cannot reap {:?}: {}", argv, err),
            }
        }
        for mut child in self.detached.drain(..) {
            let _unused = child.wait();
        }
    }

    #[cfg(test)]
    pub(crate) fn open_files(&self) -> usize {
        self.files.len()
    }
}

/// Splits leading `-flag` tokens from the final pathname.
fn split_options(argv: &[String]) -> Result<(Vec<&str>, &str), ActionError> {
    let path = argv.last().ok_or(ActionError::NoArguments)?;
    let options = argv[..argv.len() - 1]
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>();
    Ok((options, path))
}

fn is_contention(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EACCES)
    )
}

/// Write adapter that enforces a deadline on a nonblocking pipe.
struct TimedWriter<'a> {
    inner: &'a mut std::process::ChildStdin,
    deadline: Instant,
}

impl<'a> TimedWriter<'a> {
    fn new(inner: &'a mut std::process::ChildStdin, timeout: Duration) -> TimedWriter<'a> {
        let fd = inner.as_raw_fd();
        // SAFETY: fd is the child's live stdin descriptor.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags >= 0 {
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        TimedWriter {
            inner,
            deadline: Instant::now() + timeout,
        }
    }
}

impl Write for TimedWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.inner.write(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= self.deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "pipe write timed out",
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Seek-to-start helper kept off the `Write` path for clarity.
trait SeekStart {
    fn seek_start(&mut self) -> io::Result<()>;
}

impl SeekStart for File {
    fn seek_start(&mut self) -> io::Result<()> {
        use std::io::Seek;
        self.seek(io::SeekFrom::Start(0)).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedtype::Feedtype;
    use crate::product::Product;

    fn info() -> ProductInfo {
        Product::new(Feedtype(1), 7, "TEST01 KWBC", "t", vec![1]).info
    }

    fn ctx() -> ActionContext {
        ActionContext::new(Duration::from_secs(2))
    }

    #[test]
    fn actions_kind_parse() {
        assert_eq!(ActionKind::parse("file"), Some(ActionKind::File));
        assert_eq!(ActionKind::parse("spipe"), Some(ActionKind::SPipe));
        assert_eq!(ActionKind::parse("noop"), Some(ActionKind::Noop));
        assert_eq!(ActionKind::parse("nope"), None);
    }

    #[test]
    fn actions_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/sa.txt");
        let argv = vec![path.display().to_string()];
        let mut ctx = ctx();
        ctx.run(ActionKind::File, &argv, &info(), b"one\n").unwrap();
        ctx.run(ActionKind::File, &argv, &info(), b"two\n").unwrap();
        ctx.shutdown();
        assert_eq!(std::fs::read(&path).unwrap(), b"one\ntwo\n");
    }

    #[test]
    fn actions_file_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latest.bin");
        let argv = vec!["-overwrite".to_string(), path.display().to_string()];
        let mut ctx = ctx();
        ctx.run(ActionKind::File, &argv, &info(), b"longer first").unwrap();
        ctx.run(ActionKind::File, &argv, &info(), b"second").unwrap();
        ctx.shutdown();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn actions_file_close_releases_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.txt");
        let argv = vec!["-close".to_string(), path.display().to_string()];
        let mut ctx = ctx();
        ctx.run(ActionKind::File, &argv, &info(), b"x").unwrap();
        assert_eq!(ctx.open_files(), 0);
    }

    #[test]
    fn actions_file_strip_filters_control_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.txt");
        let argv = vec!["-strip".to_string(), path.display().to_string()];
        let mut ctx = ctx();
        ctx.run(ActionKind::File, &argv, &info(), b"a\x01b\r\nc\x7f")
            .unwrap();
        ctx.shutdown();
        assert_eq!(std::fs::read(&path).unwrap(), b"ab\nc");
    }

    #[test]
    fn actions_pipe_feeds_child_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("piped.txt");
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("cat > {}", out.display()),
        ];
        let mut ctx = ctx();
        ctx.run(ActionKind::Pipe, &argv, &info(), b"payload bytes")
            .unwrap();
        ctx.shutdown();
        assert_eq!(std::fs::read(&out).unwrap(), b"payload bytes");
    }

    #[test]
    fn actions_pipe_to_missing_program_is_permanent() {
        let mut ctx = ctx();
        let argv = vec!["/no/such/decoder".to_string()];
        let err = ctx
            .run(ActionKind::Pipe, &argv, &info(), b"x")
            .unwrap_err();
        assert!(matches!(err, ActionError::Permanent(_)));
    }

    #[test]
    fn actions_exec_wait_success_and_failure() {
        let mut ctx = ctx();
        ctx.run(
            ActionKind::Exec,
            &["-wait".to_string(), "/bin/true".to_string()],
            &info(),
            b"",
        )
        .unwrap();
        let err = ctx
            .run(
                ActionKind::Exec,
                &["-wait".to_string(), "/bin/false".to_string()],
                &info(),
                b"",
            )
            .unwrap_err();
        assert!(matches!(err, ActionError::Permanent(_)));
    }

    #[test]
    fn actions_spipe_frames_ident_and_payload() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("framed.bin");
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("cat > {}", out.display()),
        ];
        let mut ctx = ctx();
        let info = info();
        ctx.run(ActionKind::SPipe, &argv, &info, b"DATA").unwrap();
        ctx.shutdown();
        let framed = std::fs::read(&out).unwrap();
        let ident = info.ident.as_bytes();
        assert_eq!(&framed[0..4], (ident.len() as u32).to_be_bytes().as_slice());
        assert_eq!(&framed[4..4 + ident.len()], ident);
        assert_eq!(
            &framed[4 + ident.len()..8 + ident.len()],
            4u32.to_be_bytes().as_slice()
        );
        assert_eq!(&framed[8 + ident.len()..], b"DATA");
    }
}

//! Turn-taking over a pair of named pipes
//!
//! Each direction has its own FIFO. A signal is one byte written through a
//! fresh write-open; a wait is a fresh read-open that returns once one byte
//! arrives. Nothing persists between opens, so a signal is consumed by
//! exactly one wait and stale bytes never satisfy a later one.
//!
//! Every blocking step is bounded by a deadline and checks the optional
//! cancel flag at least once per poll interval.

use crate::error::{BridgeError, Result};
use rustix::fd::OwnedFd;
use rustix::event::{PollFd, PollFlags};
use rustix::fs::{FileType, Mode, OFlags, CWD};
use rustix::io::Errno;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Byte sent by the module when opening the session
pub const PROBE_BYTE: u8 = 0;

/// Byte sent for every later turn change
pub const READY_BYTE: u8 = b'a';

/// Pause between attempts to open a pipe that has no reader yet
const OPEN_RETRY: Duration = Duration::from_millis(1);

/// Which FIFO to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipe {
    /// Module to engine: "a request is in the arena"
    EngineSignal,
    /// Engine to module: "a reply is in the arena"
    ModuleSignal,
}

/// Deadlines for the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Bound on the initial connect / accept exchange
    pub connect: Duration,
    /// Bound on each signal and wait within a cycle
    pub signal: Duration,
    /// Longest stretch between cancel-flag checks
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            signal: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// The two FIFOs shared by a module and an engine
pub struct HandshakeChannel {
    engine_path: PathBuf,
    module_path: PathBuf,
    timeouts: Timeouts,
    cancel: Option<Arc<AtomicBool>>,
    is_owner: bool,
}

impl HandshakeChannel {
    /// Create both FIFOs, replacing stale ones (module side)
    ///
    /// The returned channel owns the pipes and removes them on drop.
    pub fn create(engine_path: PathBuf, module_path: PathBuf, timeouts: Timeouts) -> Result<Self> {
        for path in [&engine_path, &module_path] {
            make_fifo(path)?;
        }
        log::debug!(
            "Created pipes {} and {}",
            engine_path.display(),
            module_path.display()
        );

        Ok(Self {
            engine_path,
            module_path,
            timeouts,
            cancel: None,
            is_owner: true,
        })
    }

    /// Use FIFOs created by the peer (engine side)
    pub fn open(engine_path: PathBuf, module_path: PathBuf, timeouts: Timeouts) -> Result<Self> {
        for path in [&engine_path, &module_path] {
            let stat = rustix::fs::stat(path).map_err(|e| BridgeError::PipeOpen {
                path: path.clone(),
                source: e.into(),
            })?;
            if FileType::from_raw_mode(stat.st_mode) != FileType::Fifo {
                return Err(BridgeError::PipeOpen {
                    path: path.clone(),
                    source: io::Error::new(io::ErrorKind::InvalidInput, "not a FIFO"),
                });
            }
        }

        Ok(Self {
            engine_path,
            module_path,
            timeouts,
            cancel: None,
            is_owner: false,
        })
    }

    /// Abort pending waits once `flag` becomes true
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.set_cancel(Some(flag));
        self
    }

    pub fn set_cancel(&mut self, flag: Option<Arc<AtomicBool>>) {
        self.cancel = flag;
    }

    /// Whether the cancel flag has been raised
    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::SeqCst))
    }

    pub fn path(&self, pipe: Pipe) -> &Path {
        match pipe {
            Pipe::EngineSignal => &self.engine_path,
            Pipe::ModuleSignal => &self.module_path,
        }
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    #[inline]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Module role: probe the engine, then wait for its acknowledgement
    pub fn connect(&self) -> Result<()> {
        self.signal_within(Pipe::EngineSignal, PROBE_BYTE, self.timeouts.connect)?;
        self.wait_within(Pipe::ModuleSignal, self.timeouts.connect)?;
        log::info!("Connected to engine via {}", self.engine_path.display());
        Ok(())
    }

    /// Engine role: wait for the probe, then acknowledge it
    pub fn accept(&self) -> Result<()> {
        self.wait_within(Pipe::EngineSignal, self.timeouts.connect)?;
        self.signal_within(Pipe::ModuleSignal, READY_BYTE, self.timeouts.connect)?;
        log::info!("Accepted module via {}", self.module_path.display());
        Ok(())
    }

    /// Send one turn-change byte, waiting for the peer to be listening
    pub fn signal(&self, pipe: Pipe) -> Result<()> {
        self.signal_within(pipe, READY_BYTE, self.timeouts.signal)
    }

    /// Wait for one turn-change byte
    pub fn wait(&self, pipe: Pipe) -> Result<u8> {
        self.wait_within(pipe, self.timeouts.signal)
    }

    /// Write `byte` to `pipe`, giving up after `timeout`
    pub fn signal_within(&self, pipe: Pipe, byte: u8, timeout: Duration) -> Result<()> {
        let path = self.path(pipe);
        let deadline = Instant::now() + timeout;

        // Opening a FIFO for writing without blocking fails with ENXIO until
        // a reader has it open
        let fd = loop {
            match rustix::fs::open(path, OFlags::WRONLY | OFlags::NONBLOCK | OFlags::CLOEXEC, Mode::empty()) {
                Ok(fd) => break fd,
                Err(Errno::NXIO) => self.pause(path, deadline, timeout)?,
                Err(Errno::INTR) => continue,
                Err(e) => {
                    return Err(BridgeError::PipeOpen {
                        path: path.to_path_buf(),
                        source: e.into(),
                    })
                }
            }
        };

        loop {
            match rustix::io::write(&fd, &[byte]) {
                Ok(1) => break,
                Ok(_) | Err(Errno::AGAIN) => self.pause(path, deadline, timeout)?,
                Err(Errno::INTR) => continue,
                Err(e) => {
                    return Err(BridgeError::PipeIo {
                        path: path.to_path_buf(),
                        source: e.into(),
                    })
                }
            }
        }

        log::trace!("Signalled {}", path.display());
        Ok(())
    }

    /// Read one byte from `pipe`, giving up after `timeout`
    pub fn wait_within(&self, pipe: Pipe, timeout: Duration) -> Result<u8> {
        let path = self.path(pipe);
        let deadline = Instant::now() + timeout;
        let mut fd = open_reader(path)?;

        loop {
            self.check_cancel(path)?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BridgeError::TimedOut {
                    path: path.to_path_buf(),
                    timeout,
                });
            }
            let slice = remaining.min(self.timeouts.poll_interval);
            let slice_ms = slice.as_millis().clamp(1, i32::MAX as u128) as i32;

            let ready = {
                let mut fds = [PollFd::new(&fd, PollFlags::IN)];
                rustix::event::poll(&mut fds, slice_ms)
            };
            match ready {
                Ok(0) | Err(Errno::INTR) => continue,
                Ok(_) => {}
                Err(e) => {
                    return Err(BridgeError::PipeIo {
                        path: path.to_path_buf(),
                        source: e.into(),
                    })
                }
            }

            let mut buf = [0u8; 1];
            match rustix::io::read(&fd, &mut buf) {
                Ok(1) => {
                    log::trace!("Received signal on {}", path.display());
                    return Ok(buf[0]);
                }
                // A writer came and went without writing; start over so the
                // hangup does not keep waking the poll
                Ok(_) => fd = open_reader(path)?,
                Err(Errno::AGAIN) | Err(Errno::INTR) => continue,
                Err(e) => {
                    return Err(BridgeError::PipeIo {
                        path: path.to_path_buf(),
                        source: e.into(),
                    })
                }
            }
        }
    }

    /// Unlink both FIFOs (owner only)
    pub fn remove(mut self) -> Result<()> {
        self.remove_pipes()
    }

    fn remove_pipes(&mut self) -> Result<()> {
        if !self.is_owner {
            return Ok(());
        }
        self.is_owner = false;

        let mut result = Ok(());
        for path in [&self.engine_path, &self.module_path] {
            match rustix::fs::unlink(path) {
                Ok(()) | Err(Errno::NOENT) => {}
                Err(e) => {
                    if result.is_ok() {
                        result = Err(BridgeError::Cleanup {
                            resource: format!("pipe {}", path.display()),
                            source: e.into(),
                        });
                    }
                }
            }
        }
        result
    }

    fn check_cancel(&self, path: &Path) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::SeqCst) => Err(BridgeError::Interrupted {
                path: path.to_path_buf(),
            }),
            _ => Ok(()),
        }
    }

    fn pause(&self, path: &Path, deadline: Instant, timeout: Duration) -> Result<()> {
        self.check_cancel(path)?;
        if Instant::now() >= deadline {
            return Err(BridgeError::TimedOut {
                path: path.to_path_buf(),
                timeout,
            });
        }
        std::thread::sleep(OPEN_RETRY);
        Ok(())
    }
}

impl Drop for HandshakeChannel {
    fn drop(&mut self) {
        if let Err(e) = self.remove_pipes() {
            log::warn!("{}", e);
        }
    }
}

fn make_fifo(path: &Path) -> Result<()> {
    match rustix::fs::unlink(path) {
        Ok(()) => log::debug!("Removed stale pipe {}", path.display()),
        Err(Errno::NOENT) => {}
        Err(e) => {
            return Err(BridgeError::PipeCreate {
                path: path.to_path_buf(),
                source: e.into(),
            })
        }
    }

    let mode = Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH | Mode::WOTH;
    rustix::fs::mknodat(CWD, path, FileType::Fifo, mode, 0).map_err(|e| BridgeError::PipeCreate {
        path: path.to_path_buf(),
        source: e.into(),
    })
}

fn open_reader(path: &Path) -> Result<OwnedFd> {
    rustix::fs::open(path, OFlags::RDONLY | OFlags::NONBLOCK | OFlags::CLOEXEC, Mode::empty()).map_err(|e| {
        BridgeError::PipeOpen {
            path: path.to_path_buf(),
            source: e.into(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::OpenOptionsExt;
    use std::thread;

    fn fast_timeouts() -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(5),
            signal: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn channel_pair(dir: &Path) -> (HandshakeChannel, HandshakeChannel) {
        let engine = dir.join("engine_pipe");
        let module = dir.join("module_pipe");
        let owner = HandshakeChannel::create(engine.clone(), module.clone(), fast_timeouts()).unwrap();
        let peer = HandshakeChannel::open(engine, module, fast_timeouts()).unwrap();
        (owner, peer)
    }

    #[test]
    fn test_connect_and_accept() {
        let dir = tempfile::tempdir().unwrap();
        let (module, engine) = channel_pair(dir.path());

        let handle = thread::spawn(move || {
            engine.accept().unwrap();
            engine.wait(Pipe::EngineSignal).unwrap()
        });

        module.connect().unwrap();
        module.signal(Pipe::EngineSignal).unwrap();
        assert_eq!(handle.join().unwrap(), READY_BYTE);
    }

    #[test]
    fn test_probe_byte_arrives_first() {
        let dir = tempfile::tempdir().unwrap();
        let (module, engine) = channel_pair(dir.path());

        let handle = thread::spawn(move || engine.wait(Pipe::EngineSignal).unwrap());
        module
            .signal_within(Pipe::EngineSignal, PROBE_BYTE, Duration::from_secs(5))
            .unwrap();
        assert_eq!(handle.join().unwrap(), PROBE_BYTE);
    }

    #[test]
    fn test_signal_without_reader_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (module, _engine) = channel_pair(dir.path());

        let start = Instant::now();
        let err = module
            .signal_within(Pipe::EngineSignal, READY_BYTE, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, BridgeError::TimedOut { .. }));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_without_writer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (module, _engine) = channel_pair(dir.path());

        let err = module
            .wait_within(Pipe::ModuleSignal, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, BridgeError::TimedOut { .. }));
    }

    #[test]
    fn test_wait_is_interrupted_by_cancel_flag() {
        let dir = tempfile::tempdir().unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let (module, _engine) = channel_pair(dir.path());
        let module = module.with_cancel(flag.clone());

        let handle = thread::spawn(move || module.wait_within(Pipe::ModuleSignal, Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(30));
        flag.store(true, Ordering::SeqCst);

        let err = handle.join().unwrap().unwrap_err();
        assert!(err.is_interrupted());
    }

    #[test]
    fn test_empty_open_does_not_satisfy_wait() {
        let dir = tempfile::tempdir().unwrap();
        let (module, engine) = channel_pair(dir.path());
        let path = module.path(Pipe::ModuleSignal).to_path_buf();

        let handle = thread::spawn(move || module.wait_within(Pipe::ModuleSignal, Duration::from_secs(5)));

        // Writer that connects and leaves without writing
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&path)
            {
                Ok(f) => {
                    drop(f);
                    break;
                }
                Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(1)),
                Err(e) => panic!("reader never opened: {}", e),
            }
        }
        thread::sleep(Duration::from_millis(30));
        engine.signal(Pipe::ModuleSignal).unwrap();

        assert_eq!(handle.join().unwrap().unwrap(), READY_BYTE);
    }

    #[test]
    fn test_each_signal_satisfies_one_wait() {
        let dir = tempfile::tempdir().unwrap();
        let (module, engine) = channel_pair(dir.path());

        let handle = thread::spawn(move || {
            for _ in 0..3 {
                engine.wait(Pipe::EngineSignal).unwrap();
                engine.signal(Pipe::ModuleSignal).unwrap();
            }
            engine
        });

        for _ in 0..3 {
            module.signal(Pipe::EngineSignal).unwrap();
            module.wait(Pipe::ModuleSignal).unwrap();
        }
        let engine = handle.join().unwrap();

        // No leftover byte from the exchange above
        assert!(matches!(
            engine.wait_within(Pipe::EngineSignal, Duration::from_millis(30)),
            Err(BridgeError::TimedOut { .. })
        ));
    }

    #[test]
    fn test_create_replaces_stale_file_and_remove_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let engine = dir.path().join("engine_pipe");
        let module = dir.path().join("module_pipe");
        std::fs::write(&engine, b"stale").unwrap();

        let channel = HandshakeChannel::create(engine.clone(), module.clone(), fast_timeouts()).unwrap();
        let stat = rustix::fs::stat(&engine).unwrap();
        assert_eq!(FileType::from_raw_mode(stat.st_mode), FileType::Fifo);

        channel.remove().unwrap();
        assert!(!engine.exists());
        assert!(!module.exists());
    }

    #[test]
    fn test_open_requires_fifos() {
        let dir = tempfile::tempdir().unwrap();
        let engine = dir.path().join("engine_pipe");
        let module = dir.path().join("module_pipe");
        assert!(matches!(
            HandshakeChannel::open(engine.clone(), module.clone(), fast_timeouts()),
            Err(BridgeError::PipeOpen { .. })
        ));

        std::fs::write(&engine, b"").unwrap();
        std::fs::write(&module, b"").unwrap();
        let err = HandshakeChannel::open(engine, module, fast_timeouts()).err().unwrap();
        match err {
            BridgeError::PipeOpen { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::InvalidInput)
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_peer_drop_keeps_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let (owner, peer) = channel_pair(dir.path());
        let path = owner.path(Pipe::EngineSignal).to_path_buf();
        drop(peer);
        assert!(path.exists());
        drop(owner);
        assert!(!path.exists());
    }
}

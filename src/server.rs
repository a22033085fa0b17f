// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The server runtime: adopt or bind the local socket, hold the
//! pidfile singleton, detach unless told otherwise, and run one
//! detached thread per accepted connection.

use std::env;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn, LevelFilter};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::socket::{getsockname, getsockopt, sockopt, SockType, UnixAddr};
use nix::sys::stat::{fstat, umask, Mode, SFlag};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, close, fork, getppid, setsid, ForkResult};

use crate::cache::Reply;
use crate::flock::Flock;
use crate::parser::{buf_to_textmap, LvmTextMap, TextMapBuilder, TextMapOps};
use crate::wire;
use crate::Result;

/// The pidfile lock is held by another daemon instance.
pub const EXIT_ALREADYRUNNING: i32 = 13;

const SD_ACTIVATION_ENV: &str = "SD_ACTIVATION";
const SD_LISTEN_PID_ENV: &str = "LISTEN_PID";
const SD_LISTEN_FDS_ENV: &str = "LISTEN_FDS";
const SD_FD_SOCKET_SERVER: RawFd = 3;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn exit_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

pub type Handler = Arc<dyn Fn(&LvmTextMap) -> Reply + Send + Sync>;

pub struct DaemonConfig {
    pub name: String,
    pub protocol: String,
    pub protocol_version: i64,
    pub socket_path: PathBuf,
    pub pidfile: Option<PathBuf>,
    pub foreground: bool,
    pub idle_timeout: Option<Duration>,
    pub avoid_oom: bool,
}

/// Translate the daemon's `-l` option into a log level plus whether
/// wire tracing was asked for. Unknown words are ignored with a note
/// on stderr, like any other bad option value.
pub fn log_levels(levels: &str) -> (LevelFilter, bool) {
    let mut level = LevelFilter::Error;
    let mut wire = false;

    for part in levels.split(',').filter(|p| !p.is_empty()) {
        let part_level = match part {
            "all" => {
                wire = true;
                Some(LevelFilter::Debug)
            }
            "fatal" | "error" => Some(LevelFilter::Error),
            "warn" => Some(LevelFilter::Warn),
            "info" => Some(LevelFilter::Info),
            "debug" => Some(LevelFilter::Debug),
            "wire" => {
                wire = true;
                None
            }
            other => {
                eprintln!("ignoring unknown log level {:?}", other);
                None
            }
        };
        if let Some(l) = part_level {
            if l > level {
                level = l;
            }
        }
    }

    (level, wire)
}

fn handle_preloaded_socket(fd: RawFd, path: &Path) -> bool {
    let st = match fstat(fd) {
        Ok(st) => st,
        Err(_) => return false,
    };
    if st.st_mode & SFlag::S_IFMT.bits() != SFlag::S_IFSOCK.bits() {
        return false;
    }

    match getsockopt(fd, sockopt::SockType) {
        Ok(SockType::Stream) => {}
        _ => return false,
    }

    match getsockname::<UnixAddr>(fd) {
        Ok(addr) => addr.path() == Some(path),
        Err(_) => false,
    }
}

/// If the init system handed us a pre-opened socket, validate and
/// adopt it. The handshake env vars are consumed either way.
fn systemd_handover(socket_path: &Path) -> Option<UnixListener> {
    let adopted = (|| {
        if env::var(SD_ACTIVATION_ENV).ok()? != "1" {
            return None;
        }
        let pid: u32 = env::var(SD_LISTEN_PID_ENV).ok()?.parse().ok()?;
        if pid != std::process::id() {
            return None;
        }
        let fds: u32 = env::var(SD_LISTEN_FDS_ENV).ok()?.parse().ok()?;
        if fds != 1 {
            return None;
        }
        if !handle_preloaded_socket(SD_FD_SOCKET_SERVER, socket_path) {
            return None;
        }
        Some(unsafe { UnixListener::from_raw_fd(SD_FD_SOCKET_SERVER) })
    })();

    env::remove_var(SD_ACTIVATION_ENV);
    env::remove_var(SD_LISTEN_PID_ENV);
    env::remove_var(SD_LISTEN_FDS_ENV);

    adopted
}

/// Bind the local stream socket with mode 0600.
fn open_socket(path: &Path) -> Result<UnixListener> {
    let old_mask = umask(Mode::from_bits_truncate(0o077));
    debug!("creating {}", path.display());
    let listener = UnixListener::bind(path);
    umask(old_mask);
    Ok(listener?)
}

fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(exit_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in &[
        Signal::SIGINT,
        Signal::SIGHUP,
        Signal::SIGQUIT,
        Signal::SIGTERM,
        Signal::SIGALRM,
    ] {
        unsafe {
            signal::sigaction(*sig, &action)?;
        }
    }
    unsafe {
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
    }
    Ok(())
}

fn protect_against_oom_killer() {
    if let Err(e) = fs::write("/proc/self/oom_score_adj", "-1000") {
        warn!("failed to adjust OOM score: {}", e);
    }
}

fn daemonise(keep_preloaded: bool) -> Result<()> {
    let mask = SigSet::empty();
    signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&mask), None)?;

    // the child signals readiness with SIGTERM
    let action = SigAction::new(
        SigHandler::Handler(exit_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        signal::sigaction(Signal::SIGTERM, &action)?;
    }

    match unsafe { fork() }? {
        ForkResult::Parent { child } => loop {
            match waitpid(child, Some(WaitPidFlag::WNOHANG))? {
                WaitStatus::StillAlive => {
                    if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
                        // child signalled it is ready
                        std::process::exit(0);
                    }
                    thread::sleep(Duration::from_millis(250));
                }
                WaitStatus::Exited(_, code) => {
                    if code == EXIT_ALREADYRUNNING {
                        eprintln!("Failed to acquire lock. Already running?");
                    } else {
                        eprintln!("Child exited with code {}", code);
                    }
                    std::process::exit(code);
                }
                _ => {}
            }
        },
        ForkResult::Child => {}
    }

    chdir("/")?;

    let max_fd = match nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE)
    {
        Ok((soft, _)) => soft as RawFd,
        Err(_) => 256,
    };
    for fd in (0..max_fd).rev() {
        if keep_preloaded && fd == SD_FD_SOCKET_SERVER {
            continue;
        }
        let _ = close(fd);
    }

    // stdin, stdout, stderr all land on /dev/null
    std::mem::forget(fs::File::open("/dev/null")?);
    std::mem::forget(fs::OpenOptions::new().write(true).open("/dev/null")?);
    std::mem::forget(fs::OpenOptions::new().write(true).open("/dev/null")?);

    setsid()?;

    Ok(())
}

struct ClientGuard {
    active: Arc<AtomicUsize>,
    last_activity: Arc<Mutex<Instant>>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }
}

fn client_thread(
    stream: UnixStream,
    protocol: String,
    protocol_version: i64,
    handler: Handler,
    _guard: ClientGuard,
) {
    let mut reader = wire::MessageReader::new(stream);

    loop {
        let buf = match reader.read_message() {
            Ok(b) => b,
            Err(_) => return,
        };

        debug!(target: "wire", "<- {}", String::from_utf8_lossy(&buf));

        let reply = match buf_to_textmap(&buf) {
            Err(e) => {
                error!("error parsing request: {}", e);
                Reply::Map(
                    TextMapBuilder::new()
                        .string("response", "failed")
                        .string("reason", "request parse error")
                        .build(),
                )
            }
            Ok(req) => {
                // hello is answered before custom dispatch
                if req.string_from_textmap("request") == Some("hello") {
                    Reply::Map(
                        TextMapBuilder::new()
                            .string("response", "OK")
                            .string("protocol", &protocol)
                            .number("version", protocol_version)
                            .build(),
                    )
                } else {
                    handler(&req)
                }
            }
        };

        let out = reply.to_bytes();
        debug!(target: "wire", "-> {}", String::from_utf8_lossy(&out));

        if wire::write_message(reader.get_mut(), &out).is_err() {
            return;
        }
    }
}

fn accept_loop(config: &DaemonConfig, listener: UnixListener, handler: Handler) {
    let active = Arc::new(AtomicUsize::new(0));
    let last_activity = Arc::new(Mutex::new(Instant::now()));
    let listen_fd = listener.as_raw_fd();

    while !SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
        let mut fds = [PollFd::new(listen_fd, PollFlags::POLLIN)];
        match poll(&mut fds, 1000) {
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                error!("poll error: {}", e);
                break;
            }
            Ok(0) => {
                if let Some(idle) = config.idle_timeout {
                    let quiet = {
                        let last = last_activity.lock().unwrap_or_else(|e| e.into_inner());
                        last.elapsed() >= idle
                    };
                    if active.load(Ordering::SeqCst) == 0 && quiet {
                        info!("no activity for {}s, exiting", idle.as_secs());
                        break;
                    }
                }
                continue;
            }
            Ok(_) => {}
        }

        match listener.accept() {
            Ok((stream, _)) => {
                *last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                active.fetch_add(1, Ordering::SeqCst);
                let guard = ClientGuard {
                    active: Arc::clone(&active),
                    last_activity: Arc::clone(&last_activity),
                };
                let handler = Arc::clone(&handler);
                let protocol = config.protocol.clone();
                let version = config.protocol_version;
                thread::spawn(move || {
                    client_thread(stream, protocol, version, handler, guard);
                });
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => error!("Failed to handle a client connection: {}", e),
        }
    }
}

/// Bring the daemon up and serve until a shutdown signal, a fatal
/// error, or the idle timer.
pub fn daemon_start(config: DaemonConfig, handler: Handler) -> Result<()> {
    let preloaded = systemd_handover(&config.socket_path);
    let activated = preloaded.is_some();

    if !config.foreground {
        daemonise(activated)?;
    }

    // NB. take care not to leave stale locks around: no early exits
    // between here and the cleanup at the bottom.
    let _pidlock = match &config.pidfile {
        Some(path) => match Flock::lock_pidfile(path) {
            Ok(lock) => Some(lock),
            Err(_) => std::process::exit(EXIT_ALREADYRUNNING),
        },
        None => None,
    };

    install_signal_handlers()?;

    if config.avoid_oom && !activated {
        protect_against_oom_killer();
    }

    let listener = match preloaded {
        Some(l) => l,
        None => open_socket(&config.socket_path)?,
    };

    // let the waiting parent go
    if !config.foreground {
        let _ = signal::kill(getppid(), Signal::SIGTERM);
    }

    info!(
        "{} serving on {}",
        config.name,
        config.socket_path.display()
    );

    accept_loop(&config, listener, handler);

    // under socket activation the socket belongs to the init system
    if !activated {
        let _ = fs::remove_file(&config.socket_path);
    }
    if let Some(path) = &config.pidfile {
        let _ = fs::remove_file(path);
    }

    info!("{} shutting down", config.name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_parsing() {
        assert_eq!(log_levels("error"), (LevelFilter::Error, false));
        assert_eq!(log_levels("warn,info"), (LevelFilter::Info, false));
        assert_eq!(log_levels("fatal,wire"), (LevelFilter::Error, true));
        assert_eq!(log_levels("all"), (LevelFilter::Debug, true));
        assert_eq!(log_levels("debug"), (LevelFilter::Debug, false));
    }

    #[test]
    fn no_handover_without_env() {
        env::remove_var(SD_ACTIVATION_ENV);
        env::remove_var(SD_LISTEN_PID_ENV);
        env::remove_var(SD_LISTEN_FDS_ENV);
        assert!(systemd_handover(Path::new("/run/lvm/lvmetad.socket")).is_none());
    }

    #[test]
    fn handover_rejects_foreign_pid() {
        env::set_var(SD_ACTIVATION_ENV, "1");
        env::set_var(SD_LISTEN_PID_ENV, "1");
        env::set_var(SD_LISTEN_FDS_ENV, "1");
        assert!(systemd_handover(Path::new("/run/lvm/lvmetad.socket")).is_none());
        // the handshake variables are consumed
        assert!(env::var(SD_ACTIVATION_ENV).is_err());
    }
}

//! openpty backend for Unix
//!
//! The master side of the pseudo terminal stands in for the console; two
//! duplicates of it act as the caller's input and output pipe ends. The child
//! runs in its own session with the slave as controlling terminal.

use std::ffi::{CString, OsStr};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};

use super::{NativeCapabilities, OsResourceError, PtySize, ReadOutcome, ReleaseStep, SpawnSpec};

/// `TERM` handed to children when the host environment has none.
const FALLBACK_TERM: &str = "xterm-256color";

/// Exit status of a child whose exec failed (mirrors shells).
const EXEC_FAILED_STATUS: libc::c_int = 127;

/// Stages reported through the exec status pipe.
const STAGES: [&str; 5] = ["setsid", "ioctl(TIOCSCTTY)", "dup2", "chdir", "execve"];

fn winsize(size: PtySize) -> libc::winsize {
    let size = size.clamped();
    libc::winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn cstring(operation: &'static str, value: &OsStr) -> Result<CString, OsResourceError> {
    CString::new(value.as_bytes()).map_err(|_| OsResourceError::new(operation, libc::EINVAL))
}

/// Mark a descriptor close-on-exec so it never leaks into another child.
fn set_cloexec(fd: RawFd) -> Result<(), OsResourceError> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(OsResourceError::last("fcntl(FD_CLOEXEC)"));
        }
    }
    Ok(())
}

fn close_fd(fd: &mut RawFd) {
    if *fd >= 0 {
        unsafe {
            let _ = libc::close(*fd);
        }
        *fd = -1;
    }
}

/// Allocate a master/slave pair. Both descriptors are close-on-exec from
/// the moment they exist, so a fork on another thread cannot inherit them.
#[cfg(target_os = "linux")]
fn open_pty(ws: &libc::winsize) -> Result<(RawFd, RawFd), OsResourceError> {
    let flags = libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC;
    let mut master = unsafe { libc::posix_openpt(flags) };
    if master < 0 {
        return Err(OsResourceError::last("posix_openpt"));
    }
    let fail = |master: &mut RawFd, err: OsResourceError| {
        close_fd(master);
        Err(err)
    };

    unsafe {
        if libc::grantpt(master) != 0 {
            return fail(&mut master, OsResourceError::last("grantpt"));
        }
        if libc::unlockpt(master) != 0 {
            return fail(&mut master, OsResourceError::last("unlockpt"));
        }
        let mut name = [0 as libc::c_char; 128];
        let rc = libc::ptsname_r(master, name.as_mut_ptr(), name.len());
        if rc != 0 {
            return fail(&mut master, OsResourceError::new("ptsname_r", rc));
        }
        let mut slave = libc::open(name.as_ptr(), flags);
        if slave < 0 {
            return fail(&mut master, OsResourceError::last("open(slave)"));
        }
        if libc::ioctl(master, libc::TIOCSWINSZ, ws) != 0 {
            let err = OsResourceError::last("ioctl(TIOCSWINSZ)");
            close_fd(&mut slave);
            return fail(&mut master, err);
        }
        Ok((master, slave))
    }
}

/// `openpty` has no close-on-exec flag; the flag is set right after.
#[cfg(not(target_os = "linux"))]
fn open_pty(ws: &libc::winsize) -> Result<(RawFd, RawFd), OsResourceError> {
    let mut master: RawFd = -1;
    let mut slave: RawFd = -1;
    let mut ws = *ws;
    let rc = unsafe {
        libc::openpty(&mut master, &mut slave, ptr::null_mut(), ptr::null_mut(), &mut ws)
    };
    if rc != 0 {
        return Err(OsResourceError::last("openpty"));
    }
    if let Err(e) = set_cloexec(master).and_then(|()| set_cloexec(slave)) {
        close_fd(&mut master);
        close_fd(&mut slave);
        return Err(e);
    }
    Ok((master, slave))
}

/// Pipe used by the child to report a failed exec stage.
#[cfg(target_os = "linux")]
fn status_pipe() -> Result<(RawFd, RawFd), OsResourceError> {
    let mut fds: [RawFd; 2] = [-1, -1];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(OsResourceError::last("pipe2"));
    }
    Ok((fds[0], fds[1]))
}

#[cfg(not(target_os = "linux"))]
fn status_pipe() -> Result<(RawFd, RawFd), OsResourceError> {
    let mut fds: [RawFd; 2] = [-1, -1];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(OsResourceError::last("pipe"));
    }
    let [mut read, mut write] = fds;
    if let Err(e) = set_cloexec(read).and_then(|()| set_cloexec(write)) {
        close_fd(&mut read);
        close_fd(&mut write);
        return Err(e);
    }
    Ok((read, write))
}

fn dup_fd(fd: RawFd) -> Result<RawFd, OsResourceError> {
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        return Err(OsResourceError::last("fcntl(F_DUPFD_CLOEXEC)"));
    }
    Ok(dup)
}

/// Build the child environment up front; nothing may allocate after fork.
fn child_environment() -> Vec<CString> {
    let mut env: Vec<CString> = std::env::vars_os()
        .filter(|(key, _)| key != "TERM")
        .filter_map(|(key, value)| {
            let mut entry = key.as_bytes().to_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            CString::new(entry).ok()
        })
        .collect();
    let term = std::env::var("TERM")
        .ok()
        .filter(|t| !t.is_empty() && t != "dumb")
        .unwrap_or_else(|| FALLBACK_TERM.to_string());
    if let Ok(entry) = CString::new(format!("TERM={term}")) {
        env.push(entry);
    }
    env
}

/// Decode a wait status the way shells report it.
fn exit_code_from_status(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        -1
    }
}

/// Pseudo terminal handle set for one child process
pub struct NativePty {
    console_fd: RawFd,
    input_fd: RawFd,
    output_fd: RawFd,
    pid: libc::pid_t,
    /// Exit code once the child has been reaped. Guards every signal so a
    /// recycled pid is never targeted.
    reaped: Mutex<Option<i32>>,
}

impl NativePty {
    /// Open the pseudo terminal and exec the child on its slave side.
    pub fn spawn(spec: &SpawnSpec<'_>) -> Result<Self, OsResourceError> {
        let program = cstring("execve", spec.program.as_os_str())?;
        let mut argv = Vec::with_capacity(spec.args.len() + 1);
        argv.push(program.clone());
        for arg in spec.args {
            argv.push(cstring("execve", OsStr::new(arg))?);
        }
        let cwd = spec
            .working_directory
            .map(|dir| cstring("chdir", dir.as_os_str()))
            .transpose()?;
        let env = child_environment();

        let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|s| s.as_ptr()).collect();
        argv_ptrs.push(ptr::null());
        let mut env_ptrs: Vec<*const libc::c_char> = env.iter().map(|s| s.as_ptr()).collect();
        env_ptrs.push(ptr::null());

        let mut pty = NativePty {
            console_fd: -1,
            input_fd: -1,
            output_fd: -1,
            pid: -1,
            reaped: Mutex::new(None),
        };
        let (console_fd, mut slave_fd) = open_pty(&winsize(spec.size))?;
        pty.console_fd = console_fd;
        let result = pty.attach_child(
            &mut slave_fd,
            &program,
            &argv_ptrs,
            &env_ptrs,
            cwd.as_ref(),
        );
        close_fd(&mut slave_fd);
        result?;

        debug!(pid = pty.pid, size = %spec.size, "pty child started");
        Ok(pty)
    }

    fn attach_child(
        &mut self,
        slave_fd: &mut RawFd,
        program: &CString,
        argv: &[*const libc::c_char],
        env: &[*const libc::c_char],
        cwd: Option<&CString>,
    ) -> Result<(), OsResourceError> {
        self.input_fd = dup_fd(self.console_fd)?;
        self.output_fd = dup_fd(self.console_fd)?;
        let (mut status_read, mut status_write) = status_pipe()?;

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            let err = OsResourceError::last("fork");
            close_fd(&mut status_read);
            close_fd(&mut status_write);
            return Err(err);
        }
        if pid == 0 {
            unsafe { exec_child(*slave_fd, status_write, program, argv, env, cwd) }
        }

        self.pid = pid;
        close_fd(&mut status_write);
        let report = read_exec_status(status_read);
        close_fd(&mut status_read);

        if let Some((stage, errno)) = report {
            // The child already exited with 127; reap it so no zombie is left.
            let mut status = 0;
            unsafe {
                libc::waitpid(pid, &mut status, 0);
            }
            *self.reaped.get_mut().unwrap_or_else(|e| e.into_inner()) =
                Some(exit_code_from_status(status));
            return Err(OsResourceError::new(stage, errno));
        }
        Ok(())
    }

    pub fn pid(&self) -> u32 {
        self.pid.max(0) as u32
    }

    /// Read output, waiting at most `wait` for the master to become readable.
    pub fn read(&self, buffer: &mut [u8], wait: Duration) -> io::Result<ReadOutcome> {
        let mut pollfd = libc::pollfd {
            fd: self.output_fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = wait.as_millis().min(i32::MAX as u128) as libc::c_int;
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::Interrupted {
                Ok(ReadOutcome::Pending)
            } else {
                Err(err)
            };
        }
        if ready == 0 {
            return Ok(ReadOutcome::Pending);
        }

        let n = unsafe {
            libc::read(
                self.output_fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
            )
        };
        if n > 0 {
            return Ok(ReadOutcome::Data(n as usize));
        }
        if n == 0 {
            return Ok(ReadOutcome::Eof);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // Linux reports a hung-up slave as EIO on the master.
            Some(libc::EIO) => Ok(ReadOutcome::Eof),
            Some(libc::EINTR) | Some(libc::EAGAIN) => Ok(ReadOutcome::Pending),
            _ => Err(err),
        }
    }

    /// Write bytes to the terminal input.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::write(
                    self.input_fd,
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Exit code if the child has terminated; reaps it on first observation.
    pub fn try_wait(&self) -> io::Result<Option<i32>> {
        let mut reaped = self.reaped.lock().unwrap_or_else(|e| e.into_inner());
        if reaped.is_some() || self.pid <= 0 {
            return Ok(*reaped);
        }
        let mut status = 0;
        let ret = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if ret == 0 {
            return Ok(None);
        }
        *reaped = Some(exit_code_from_status(status));
        Ok(*reaped)
    }

    /// SIGKILL the child's process group if it has not been reaped yet.
    pub fn terminate(&self) -> io::Result<()> {
        let reaped = self.reaped.lock().unwrap_or_else(|e| e.into_inner());
        if reaped.is_some() || self.pid <= 0 {
            return Ok(());
        }
        unsafe {
            // The child called setsid, so its pid is also its group id.
            if libc::kill(-self.pid, libc::SIGKILL) == 0 {
                return Ok(());
            }
            if libc::kill(self.pid, libc::SIGKILL) == 0 {
                return Ok(());
            }
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // Already gone, only waiting to be reaped.
            return Ok(());
        }
        Err(err)
    }

    /// Update the window size; the kernel delivers SIGWINCH to the foreground group.
    pub fn resize(&self, size: PtySize) -> io::Result<()> {
        if self.console_fd < 0 {
            return Ok(());
        }
        let ws = winsize(size);
        let result = unsafe { libc::ioctl(self.console_fd, libc::TIOCSWINSZ, &ws) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn capabilities(&self) -> NativeCapabilities {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let (character_device, device_detail) =
            if unsafe { libc::fstat(self.output_fd, &mut stat) } != 0 {
                (false, format!("fstat failed: {}", io::Error::last_os_error()))
            } else if stat.st_mode & libc::S_IFMT == libc::S_IFCHR {
                (true, "pseudo terminal master".to_string())
            } else {
                (false, format!("mode {:o}", stat.st_mode & libc::S_IFMT))
            };

        let mut termios: libc::termios = unsafe { std::mem::zeroed() };
        let mode_query = if unsafe { libc::tcgetattr(self.console_fd, &mut termios) } != 0 {
            Err(format!("tcgetattr: {}", io::Error::last_os_error()))
        } else {
            let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
            if unsafe { libc::ioctl(self.console_fd, libc::TIOCGWINSZ, &mut ws) } != 0 {
                Err(format!("TIOCGWINSZ: {}", io::Error::last_os_error()))
            } else {
                Ok(PtySize::new(ws.ws_col, ws.ws_row))
            }
        };

        NativeCapabilities {
            character_device,
            device_detail,
            mode_query,
        }
    }

    /// Free every native resource in the fixed release order.
    ///
    /// Descriptors are reset to -1 and the pid is cleared, so a second call is
    /// a no-op. There is no attribute block on Unix.
    pub fn release(&mut self, on_step: &mut dyn FnMut(ReleaseStep)) {
        let reaped = self.reaped.get_mut().unwrap_or_else(|e| e.into_inner());
        if self.pid > 0 {
            if reaped.is_none() {
                unsafe {
                    if libc::kill(-self.pid, libc::SIGKILL) != 0 {
                        let _ = libc::kill(self.pid, libc::SIGKILL);
                    }
                }
                on_step(ReleaseStep::TerminateProcess);

                let mut status = 0;
                let ret = unsafe { libc::waitpid(self.pid, &mut status, 0) };
                if ret < 0 {
                    warn!(
                        "waitpid({}) during teardown failed: {}",
                        self.pid,
                        io::Error::last_os_error()
                    );
                    *reaped = Some(-1);
                } else {
                    *reaped = Some(exit_code_from_status(status));
                }
            }
            self.pid = -1;
            on_step(ReleaseStep::CloseProcessHandles);
        }

        if self.console_fd >= 0 {
            close_fd(&mut self.console_fd);
            on_step(ReleaseStep::CloseConsole);
        }

        if self.input_fd >= 0 || self.output_fd >= 0 {
            close_fd(&mut self.input_fd);
            close_fd(&mut self.output_fd);
            on_step(ReleaseStep::ClosePipes);
        }
    }

    /// Exit code recorded by `try_wait` or `release`.
    pub fn final_exit_code(&self) -> Option<i32> {
        *self.reaped.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        self.release(&mut |_| {});
    }
}

/// Wait for the child to exec (pipe closes) or report a failed stage.
fn read_exec_status(fd: RawFd) -> Option<(&'static str, i32)> {
    let mut report = [0u8; 5];
    let mut filled = 0;
    while filled < report.len() {
        let n = unsafe {
            libc::read(
                fd,
                report[filled..].as_mut_ptr() as *mut libc::c_void,
                report.len() - filled,
            )
        };
        if n > 0 {
            filled += n as usize;
            continue;
        }
        if n < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        break;
    }
    if filled < report.len() {
        return None;
    }
    let stage = STAGES
        .get(report[0] as usize)
        .copied()
        .unwrap_or("execve");
    let errno = i32::from_le_bytes([report[1], report[2], report[3], report[4]]);
    Some((stage, errno))
}

/// Child side of the fork. Only async-signal-safe calls from here on.
unsafe fn exec_child(
    slave_fd: RawFd,
    status_fd: RawFd,
    program: &CString,
    argv: &[*const libc::c_char],
    env: &[*const libc::c_char],
    cwd: Option<&CString>,
) -> ! {
    if libc::setsid() == -1 {
        report_failure(status_fd, 0);
    }
    if libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) == -1 {
        report_failure(status_fd, 1);
    }
    if libc::dup2(slave_fd, libc::STDIN_FILENO) < 0
        || libc::dup2(slave_fd, libc::STDOUT_FILENO) < 0
        || libc::dup2(slave_fd, libc::STDERR_FILENO) < 0
    {
        report_failure(status_fd, 2);
    }
    if slave_fd > libc::STDERR_FILENO {
        libc::close(slave_fd);
    }
    close_inherited_fds(status_fd);
    if let Some(dir) = cwd {
        if libc::chdir(dir.as_ptr()) != 0 {
            report_failure(status_fd, 3);
        }
    }

    libc::execve(program.as_ptr(), argv.as_ptr(), env.as_ptr());
    report_failure(status_fd, 4);
}

/// Send `[stage, errno (LE)]` to the parent and exit.
unsafe fn report_failure(status_fd: RawFd, stage: u8) -> ! {
    let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
    let code = errno.to_le_bytes();
    let report = [stage, code[0], code[1], code[2], code[3]];
    let _ = libc::write(status_fd, report.as_ptr() as *const libc::c_void, report.len());
    libc::_exit(EXEC_FAILED_STATUS);
}

/// Close descriptors opened elsewhere in the process without `FD_CLOEXEC`;
/// a stray slave in the child keeps EOF from arriving.
unsafe fn close_inherited_fds(keep: RawFd) {
    let max_fd = libc::sysconf(libc::_SC_OPEN_MAX);
    let upper = if max_fd > 3 {
        max_fd.min(65_536) as RawFd
    } else {
        1024
    };
    for fd in 3..upper {
        if fd != keep {
            let _ = libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::time::Instant;

    fn spawn_sh(script: &str) -> NativePty {
        let args = vec!["-c".to_string(), script.to_string()];
        NativePty::spawn(&SpawnSpec {
            program: Path::new("/bin/sh"),
            args: &args,
            working_directory: None,
            size: PtySize::new(80, 24),
        })
        .expect("spawn /bin/sh")
    }

    fn read_all(pty: &NativePty) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            match pty.read(&mut buf, Duration::from_millis(50)).unwrap() {
                ReadOutcome::Data(n) => out.extend_from_slice(&buf[..n]),
                ReadOutcome::Pending => {}
                ReadOutcome::Eof => break,
            }
        }
        out
    }

    fn wait_exit(pty: &NativePty) -> i32 {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if let Some(code) = pty.try_wait().unwrap() {
                return code;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("child did not exit");
    }

    #[test]
    fn test_pty_output_and_exit_code() {
        let pty = spawn_sh("printf hi; exit 3");
        let out = read_all(&pty);
        assert!(String::from_utf8_lossy(&out).contains("hi"));
        assert_eq!(wait_exit(&pty), 3);
    }

    #[test]
    fn test_child_sees_a_tty() {
        let pty = spawn_sh("if [ -t 1 ]; then echo is-tty; else echo no-tty; fi");
        let out = String::from_utf8_lossy(&read_all(&pty)).to_string();
        assert!(out.contains("is-tty"), "output was {out:?}");
    }

    #[test]
    fn test_missing_program_fails_synchronously() {
        let program = PathBuf::from("/definitely/not/here");
        let err = NativePty::spawn(&SpawnSpec {
            program: &program,
            args: &[],
            working_directory: None,
            size: PtySize::default(),
        })
        .err()
        .expect("spawn should fail");
        assert_eq!(err.operation, "execve");
        assert_eq!(err.native_code, libc::ENOENT);
    }

    fn is_cloexec(fd: RawFd) -> bool {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        flags >= 0 && flags & libc::FD_CLOEXEC != 0
    }

    #[test]
    fn test_descriptors_are_close_on_exec() {
        let pty = spawn_sh("sleep 5");
        assert!(is_cloexec(pty.console_fd));
        assert!(is_cloexec(pty.input_fd));
        assert!(is_cloexec(pty.output_fd));
        let (mut read, mut write) = status_pipe().unwrap();
        assert!(is_cloexec(read));
        assert!(is_cloexec(write));
        close_fd(&mut read);
        close_fd(&mut write);
    }

    /// Unrelated processes forked on other threads must not hold the exec
    /// status pipe open, or a failed spawn would wait for them to exit.
    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_spawn_is_not_held_by_concurrent_forks() {
        use std::process::Command;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let stop = Arc::new(AtomicBool::new(false));
        let forker = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut children = Vec::new();
                while !stop.load(Ordering::SeqCst) {
                    if let Ok(child) = Command::new("/bin/sleep").arg("2").spawn() {
                        children.push(child);
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
                for mut child in children {
                    let _ = child.kill();
                    let _ = child.wait();
                }
            })
        };

        let program = PathBuf::from("/definitely/not/here");
        for _ in 0..20 {
            let started = Instant::now();
            let err = NativePty::spawn(&SpawnSpec {
                program: &program,
                args: &[],
                working_directory: None,
                size: PtySize::default(),
            })
            .err()
            .expect("spawn should fail");
            assert_eq!(err.operation, "execve");
            assert!(
                started.elapsed() < Duration::from_secs(1),
                "failed spawn took {:?}",
                started.elapsed()
            );
        }

        stop.store(true, Ordering::SeqCst);
        forker.join().unwrap();
    }

    #[test]
    fn test_missing_working_directory_fails() {
        let dir = PathBuf::from("/definitely/not/a/dir");
        let err = NativePty::spawn(&SpawnSpec {
            program: Path::new("/bin/sh"),
            args: &[],
            working_directory: Some(&dir),
            size: PtySize::default(),
        })
        .err()
        .expect("spawn should fail");
        assert_eq!(err.operation, "chdir");
    }

    #[test]
    fn test_resize_and_capabilities() {
        let pty = spawn_sh("sleep 5");
        pty.resize(PtySize::new(100, 40)).unwrap();
        let caps = pty.capabilities();
        assert!(caps.character_device);
        assert_eq!(caps.mode_query, Ok(PtySize::new(100, 40)));
        pty.terminate().unwrap();
        assert_eq!(wait_exit(&pty), 128 + libc::SIGKILL);
    }

    #[test]
    fn test_terminate_after_exit_keeps_code() {
        let pty = spawn_sh("exit 7");
        assert_eq!(wait_exit(&pty), 7);
        pty.terminate().unwrap();
        assert_eq!(pty.try_wait().unwrap(), Some(7));
    }

    #[test]
    fn test_release_is_ordered_and_idempotent() {
        let mut pty = spawn_sh("sleep 5");
        let mut steps = Vec::new();
        pty.release(&mut |step| steps.push(step));
        assert_eq!(
            steps,
            vec![
                ReleaseStep::TerminateProcess,
                ReleaseStep::CloseProcessHandles,
                ReleaseStep::CloseConsole,
                ReleaseStep::ClosePipes,
            ]
        );
        assert_eq!(pty.final_exit_code(), Some(128 + libc::SIGKILL));

        let mut again = Vec::new();
        pty.release(&mut |step| again.push(step));
        assert!(again.is_empty());
    }
}

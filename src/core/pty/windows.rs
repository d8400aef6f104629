//! ConPTY backend for Windows
//!
//! Wraps a Windows pseudo console (`HPCON`), the two anonymous pipe pairs it
//! talks through, the process-thread attribute list that binds it to the
//! child, and the child's process/thread handles.

use std::ffi::OsStr;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::Storage::FileSystem::{
    GetFileType, ReadFile, WriteFile, FILE_TYPE_CHAR, FILE_TYPE_DISK, FILE_TYPE_PIPE,
};
use windows::Win32::System::Console::{
    ClosePseudoConsole, CreatePseudoConsole, ResizePseudoConsole, COORD, HPCON,
};
use windows::Win32::System::Pipes::{CreatePipe, PeekNamedPipe};
use windows::Win32::System::Threading::{
    CreateProcessW, DeleteProcThreadAttributeList, GetExitCodeProcess,
    InitializeProcThreadAttributeList, TerminateProcess, UpdateProcThreadAttribute,
    WaitForSingleObject, EXTENDED_STARTUPINFO_PRESENT, LPPROC_THREAD_ATTRIBUTE_LIST,
    PROCESS_INFORMATION, STARTF_USESTDHANDLES, STARTUPINFOEXW,
};

use super::{NativeCapabilities, OsResourceError, PtySize, ReadOutcome, ReleaseStep, SpawnSpec};
use crate::request::command_line;

const PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE: usize = 0x00020016;

/// Exit code handed to `TerminateProcess`.
const KILLED_EXIT_CODE: u32 = 1;

/// Sleep between `PeekNamedPipe` polls while waiting for output.
const PEEK_INTERVAL: Duration = Duration::from_millis(5);

/// How long the output pipe must stay empty after the child exits before the
/// stream is considered finished. The console renders asynchronously, so the
/// last output can land after the process handle is signaled.
const EXIT_SETTLE: Duration = Duration::from_millis(250);

fn os_error(operation: &'static str, err: windows::core::Error) -> OsResourceError {
    OsResourceError::new(operation, err.code().0)
}

fn io_error(err: windows::core::Error) -> io::Error {
    io::Error::from_raw_os_error(err.code().0)
}

fn wide(value: &OsStr) -> Vec<u16> {
    value.encode_wide().chain(std::iter::once(0)).collect()
}

/// Backing memory for a `PROC_THREAD_ATTRIBUTE_LIST`.
struct AttributeList {
    buffer: Vec<u8>,
    initialized: bool,
}

impl AttributeList {
    fn as_raw(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        LPPROC_THREAD_ATTRIBUTE_LIST(self.buffer.as_mut_ptr() as *mut _)
    }
}

/// ConPTY handle set for one child process
pub struct NativePty {
    hpc: Option<HPCON>,
    input_read: HANDLE,
    input_write: HANDLE,
    output_read: HANDLE,
    output_write: HANDLE,
    attributes: Option<AttributeList>,
    process: PROCESS_INFORMATION,
    /// Exit code captured before the process handle is closed.
    final_exit_code: Option<i32>,
    size: Mutex<PtySize>,
    /// When the pipe was first seen empty behind an exited child; reset by
    /// any data that arrives afterwards.
    quiet_since: Mutex<Option<Instant>>,
}

// Safety: the raw handles are only closed through `release`, which requires
// `&mut self`; every other method is a thread-safe Win32 call on a live handle.
unsafe impl Send for NativePty {}
unsafe impl Sync for NativePty {}

impl NativePty {
    /// Create the pseudo console and start the child attached to it.
    ///
    /// Any handle created before a failing step is released when the
    /// partially built value is dropped.
    pub fn spawn(spec: &SpawnSpec<'_>) -> Result<Self, OsResourceError> {
        let size = spec.size.clamped();
        let mut pty = NativePty {
            hpc: None,
            input_read: HANDLE::default(),
            input_write: HANDLE::default(),
            output_read: HANDLE::default(),
            output_write: HANDLE::default(),
            attributes: None,
            process: PROCESS_INFORMATION::default(),
            final_exit_code: None,
            size: Mutex::new(size),
            quiet_since: Mutex::new(None),
        };

        unsafe {
            // Input pipe (we write, console reads)
            CreatePipe(&mut pty.input_read, &mut pty.input_write, None, 0)
                .map_err(|e| os_error("CreatePipe(input)", e))?;

            // Output pipe (console writes, we read)
            CreatePipe(&mut pty.output_read, &mut pty.output_write, None, 0)
                .map_err(|e| os_error("CreatePipe(output)", e))?;

            let coord = COORD {
                X: size.cols as i16,
                Y: size.rows as i16,
            };
            let hpc = CreatePseudoConsole(coord, pty.input_read, pty.output_write, 0)
                .map_err(|e| os_error("CreatePseudoConsole", e))?;
            pty.hpc = Some(hpc);

            // The console duplicated its ends; keeping ours open would hide EOF.
            let _ = CloseHandle(pty.input_read);
            pty.input_read = HANDLE::default();
            let _ = CloseHandle(pty.output_write);
            pty.output_write = HANDLE::default();

            let mut attr_list_size: usize = 0;
            let _ = InitializeProcThreadAttributeList(
                LPPROC_THREAD_ATTRIBUTE_LIST::default(),
                1,
                0,
                &mut attr_list_size,
            );
            let attributes = pty.attributes.insert(AttributeList {
                buffer: vec![0u8; attr_list_size],
                initialized: false,
            });
            InitializeProcThreadAttributeList(attributes.as_raw(), 1, 0, &mut attr_list_size)
                .map_err(|e| os_error("InitializeProcThreadAttributeList", e))?;
            attributes.initialized = true;

            UpdateProcThreadAttribute(
                attributes.as_raw(),
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
                Some(hpc.0 as *const _),
                std::mem::size_of::<HPCON>(),
                None,
                None,
            )
            .map_err(|e| os_error("UpdateProcThreadAttribute", e))?;

            let mut startup_info = STARTUPINFOEXW {
                StartupInfo: std::mem::zeroed(),
                lpAttributeList: attributes.as_raw(),
            };
            startup_info.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;
            // Null standard handles so nothing leaks past the console.
            startup_info.StartupInfo.dwFlags = STARTF_USESTDHANDLES;

            let application = wide(spec.program.as_os_str());
            let mut cmd_wide: Vec<u16> = command_line(spec.program, spec.args)
                .encode_utf16()
                .chain(std::iter::once(0))
                .collect();
            let cwd = spec.working_directory.map(|dir| wide(dir.as_os_str()));
            let cwd_ptr = cwd
                .as_ref()
                .map_or(PCWSTR::null(), |dir| PCWSTR(dir.as_ptr()));

            CreateProcessW(
                PCWSTR(application.as_ptr()),
                PWSTR(cmd_wide.as_mut_ptr()),
                None,
                None,
                false,
                EXTENDED_STARTUPINFO_PRESENT,
                None,
                cwd_ptr,
                &startup_info.StartupInfo,
                &mut pty.process,
            )
            .map_err(|e| os_error("CreateProcessW", e))?;
        }

        debug!(pid = pty.process.dwProcessId, %size, "ConPTY child started");
        Ok(pty)
    }

    pub fn pid(&self) -> u32 {
        self.process.dwProcessId
    }

    /// Read output, waiting at most `wait` for data to appear.
    ///
    /// The pipe handles are not overlapped, so availability is polled with
    /// `PeekNamedPipe` and `ReadFile` is only issued for bytes already queued.
    pub fn read(&self, buffer: &mut [u8], wait: Duration) -> io::Result<ReadOutcome> {
        let deadline = Instant::now() + wait;
        loop {
            let mut available: u32 = 0;
            let peeked = unsafe {
                PeekNamedPipe(self.output_read, None, 0, None, Some(&mut available), None)
            };
            if peeked.is_err() {
                // Broken pipe: console closed its end
                return Ok(ReadOutcome::Eof);
            }

            if available > 0 {
                *self.quiet_since.lock().unwrap_or_else(|e| e.into_inner()) = None;
                let to_read = (available as usize).min(buffer.len());
                let mut read: u32 = 0;
                unsafe {
                    ReadFile(
                        self.output_read,
                        Some(&mut buffer[..to_read]),
                        Some(&mut read),
                        None,
                    )
                    .map_err(io_error)?;
                }
                return Ok(if read == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Data(read as usize)
                });
            }

            // ConPTY keeps the pipe open after the child exits. The stream
            // ends once the pipe has stayed empty for `EXIT_SETTLE` since then.
            if !self.is_running() {
                let mut quiet_since = self.quiet_since.lock().unwrap_or_else(|e| e.into_inner());
                let since = *quiet_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= EXIT_SETTLE {
                    return Ok(ReadOutcome::Eof);
                }
            }
            if Instant::now() >= deadline {
                return Ok(ReadOutcome::Pending);
            }
            thread::sleep(PEEK_INTERVAL);
        }
    }

    /// Write bytes to the console input pipe.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut written: u32 = 0;
        unsafe {
            WriteFile(self.input_write, Some(data), Some(&mut written), None).map_err(io_error)?;
        }
        Ok(written as usize)
    }

    fn is_running(&self) -> bool {
        if self.process.hProcess.is_invalid() {
            return false;
        }
        unsafe { WaitForSingleObject(self.process.hProcess, 0) != WAIT_OBJECT_0 }
    }

    /// Exit code if the process handle is signaled.
    pub fn try_wait(&self) -> io::Result<Option<i32>> {
        if self.is_running() {
            return Ok(None);
        }
        let mut exit_code: u32 = 0;
        unsafe {
            GetExitCodeProcess(self.process.hProcess, &mut exit_code).map_err(io_error)?;
        }
        Ok(Some(exit_code as i32))
    }

    /// Forcibly terminate the child if it is still running.
    pub fn terminate(&self) -> io::Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        unsafe {
            TerminateProcess(self.process.hProcess, KILLED_EXIT_CODE).map_err(io_error)?;
        }
        Ok(())
    }

    /// Resize the pseudo console.
    pub fn resize(&self, size: PtySize) -> io::Result<()> {
        let Some(hpc) = self.hpc else {
            return Ok(());
        };
        let size = size.clamped();
        let coord = COORD {
            X: size.cols as i16,
            Y: size.rows as i16,
        };
        unsafe {
            ResizePseudoConsole(hpc, coord).map_err(io_error)?;
        }
        *self.size.lock().unwrap_or_else(|e| e.into_inner()) = size;
        Ok(())
    }

    pub fn capabilities(&self) -> NativeCapabilities {
        let file_type = unsafe { GetFileType(self.output_read) };
        let device_detail = if file_type == FILE_TYPE_CHAR {
            "character device"
        } else if file_type == FILE_TYPE_PIPE {
            "anonymous pipe owned by the pseudo console"
        } else if file_type == FILE_TYPE_DISK {
            "disk file"
        } else {
            "unknown handle type"
        };

        // A resize to the current size exercises the console mode path
        // without changing anything the child can observe.
        let current = *self.size.lock().unwrap_or_else(|e| e.into_inner());
        let mode_query = self
            .resize(current)
            .map(|()| current)
            .map_err(|e| e.to_string());

        NativeCapabilities {
            character_device: file_type == FILE_TYPE_CHAR,
            device_detail: device_detail.to_string(),
            mode_query,
        }
    }

    /// Discard whatever is queued on the output pipe.
    ///
    /// `ClosePseudoConsole` can block while the console is stuck writing to a
    /// full pipe.
    fn drain_output(&self) {
        let mut scratch = [0u8; 4096];
        loop {
            let mut available: u32 = 0;
            let peeked = unsafe {
                PeekNamedPipe(self.output_read, None, 0, None, Some(&mut available), None)
            };
            if peeked.is_err() || available == 0 {
                return;
            }
            let to_read = (available as usize).min(scratch.len());
            let mut read: u32 = 0;
            let ok = unsafe {
                ReadFile(
                    self.output_read,
                    Some(&mut scratch[..to_read]),
                    Some(&mut read),
                    None,
                )
            };
            if ok.is_err() || read == 0 {
                return;
            }
        }
    }

    /// Free every native resource in the fixed release order.
    ///
    /// Each handle is reset after it is closed, so a second call is a no-op.
    pub fn release(&mut self, on_step: &mut dyn FnMut(ReleaseStep)) {
        unsafe {
            if self.is_running() {
                if let Err(e) = TerminateProcess(self.process.hProcess, KILLED_EXIT_CODE) {
                    warn!("TerminateProcess during teardown failed: {}", e);
                }
                let _ = WaitForSingleObject(self.process.hProcess, 1000);
                on_step(ReleaseStep::TerminateProcess);
            }

            if !self.process.hProcess.is_invalid() || !self.process.hThread.is_invalid() {
                if !self.process.hProcess.is_invalid() {
                    let mut exit_code: u32 = 0;
                    if GetExitCodeProcess(self.process.hProcess, &mut exit_code).is_ok() {
                        self.final_exit_code = Some(exit_code as i32);
                    }
                    let _ = CloseHandle(self.process.hProcess);
                }
                if !self.process.hThread.is_invalid() {
                    let _ = CloseHandle(self.process.hThread);
                }
                self.process.hProcess = HANDLE::default();
                self.process.hThread = HANDLE::default();
                on_step(ReleaseStep::CloseProcessHandles);
            }

            if let Some(mut attributes) = self.attributes.take() {
                if attributes.initialized {
                    DeleteProcThreadAttributeList(attributes.as_raw());
                }
                drop(attributes);
                on_step(ReleaseStep::ReleaseAttributeList);
            }

            if let Some(hpc) = self.hpc.take() {
                self.drain_output();
                ClosePseudoConsole(hpc);
                on_step(ReleaseStep::CloseConsole);
            }

            let mut closed_any = false;
            for handle in [
                &mut self.input_read,
                &mut self.input_write,
                &mut self.output_read,
                &mut self.output_write,
            ] {
                if !handle.is_invalid() {
                    let _ = CloseHandle(*handle);
                    *handle = HANDLE::default();
                    closed_any = true;
                }
            }
            if closed_any {
                on_step(ReleaseStep::ClosePipes);
            }
        }
    }

    /// Exit code captured by `release`.
    pub fn final_exit_code(&self) -> Option<i32> {
        self.final_exit_code
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        self.release(&mut |_| {});
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn cmd_exe() -> PathBuf {
        std::env::var_os("ComSpec")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\Windows\System32\cmd.exe"))
    }

    #[test]
    fn test_conpty_creation() {
        let program = cmd_exe();
        let args = vec!["/c".to_string(), "echo hello".to_string()];
        let pty = NativePty::spawn(&SpawnSpec {
            program: &program,
            args: &args,
            working_directory: None,
            size: PtySize::new(80, 24),
        });
        assert!(pty.is_ok());
    }

    #[test]
    fn test_output_written_at_exit_is_not_lost() {
        let program = cmd_exe();
        let args = vec!["/d".to_string(), "/c".to_string(), "echo hi".to_string()];
        let pty = NativePty::spawn(&SpawnSpec {
            program: &program,
            args: &args,
            working_directory: None,
            size: PtySize::new(80, 24),
        })
        .unwrap();

        // Let the child exit before the first read so the tail is only
        // reachable through the settle window.
        let start = Instant::now();
        while pty.try_wait().unwrap().is_none() && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }

        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match pty.read(&mut buf, Duration::from_millis(50)).unwrap() {
                ReadOutcome::Data(n) => out.extend_from_slice(&buf[..n]),
                ReadOutcome::Pending => assert!(start.elapsed() < Duration::from_secs(10)),
                ReadOutcome::Eof => break,
            }
        }
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("hi"), "output was {text:?}");
    }

    #[test]
    fn test_missing_program_fails() {
        let program = PathBuf::from(r"C:\definitely\not\here.exe");
        let err = NativePty::spawn(&SpawnSpec {
            program: &program,
            args: &[],
            working_directory: None,
            size: PtySize::default(),
        })
        .err()
        .expect("spawn should fail");
        assert_eq!(err.operation, "CreateProcessW");
    }

    #[test]
    fn test_release_is_ordered_and_idempotent() {
        let program = cmd_exe();
        let args = vec!["/c".to_string(), "ping -n 5 127.0.0.1".to_string()];
        let mut pty = NativePty::spawn(&SpawnSpec {
            program: &program,
            args: &args,
            working_directory: None,
            size: PtySize::default(),
        })
        .unwrap();

        let mut steps = Vec::new();
        pty.release(&mut |step| steps.push(step));
        assert_eq!(
            steps,
            vec![
                ReleaseStep::TerminateProcess,
                ReleaseStep::CloseProcessHandles,
                ReleaseStep::ReleaseAttributeList,
                ReleaseStep::CloseConsole,
                ReleaseStep::ClosePipes,
            ]
        );

        let mut again = Vec::new();
        pty.release(&mut |step| again.push(step));
        assert!(again.is_empty());
    }
}

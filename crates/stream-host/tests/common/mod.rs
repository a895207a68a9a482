//! Reusable test harness for relay-stream-host integration tests.
//!
//! Spawns the real binary on a free loopback port with stdin/stdout piped,
//! so tests can feed the source and inspect the tee copy.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

// ── HostHandle ──────────────────────────────────────────────────────

/// Handle to a running relay-stream-host process. Kills it on drop.
pub struct HostHandle {
    pub child: Child,
    pub addr: SocketAddr,
    stdin: Option<ChildStdin>,
}

impl Drop for HostHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl HostHandle {
    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    /// Feed bytes to the server's stdin.
    pub fn write_stdin(&mut self, data: &[u8]) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin already closed"))?;
        stdin.write_all(data)?;
        stdin.flush()
    }

    /// Close the server's stdin, i.e. end of stream for stdin mode.
    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    /// Send SIGTERM and wait (bounded) for the process to exit.
    pub fn terminate(&mut self, timeout: Duration) -> Option<ExitStatus> {
        unsafe {
            libc::kill(self.child.id() as i32, libc::SIGTERM);
        }
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                _ => return None,
            }
        }
    }

    /// Everything the server wrote to stdout. Only call after it exited.
    pub fn read_stdout(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        if let Some(mut stdout) = self.child.stdout.take() {
            stdout.read_to_end(&mut out)?;
        }
        Ok(out)
    }
}

// ── Spawn helpers ───────────────────────────────────────────────────

fn free_port() -> io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Spawn the server with `args` (flags, then optionally `--` and a command).
/// Returns once the listener accepts connections.
pub fn spawn_host(args: &[&str]) -> io::Result<HostHandle> {
    let addr: SocketAddr = format!("127.0.0.1:{}", free_port()?)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let child = Command::new(env!("CARGO_BIN_EXE_relay-stream-host"))
        .arg("--addr")
        .arg(addr.to_string())
        .args(args)
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;

    let mut handle = HostHandle {
        stdin: None,
        child,
        addr,
    };
    handle.stdin = handle.child.stdin.take();

    // Wait for the listener to come up
    let deadline = Instant::now() + Duration::from_secs(5);
    while TcpStream::connect(addr).is_err() {
        if let Some(status) = handle.child.try_wait()? {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("relay-stream-host exited early: {status}"),
            ));
        }
        if Instant::now() > deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "listener did not come up within 5 seconds",
            ));
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    Ok(handle)
}

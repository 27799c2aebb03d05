//! Interactive SNX client session driver
//!
//! The SNX client runs an interactive authentication dialogue on its standard
//! streams: a password prompt, sometimes a terms-acceptance question, then
//! either an office-mode IP report, a denial, or an abrupt exit. This module
//! drives that dialogue as an explicit sequence of pattern-waits with
//! deadlines over the child's combined stdout/stderr output.

use crate::store::StoreError;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

pub const PASSWORD_PROMPT_TIMEOUT: Duration = Duration::from_secs(15);
pub const AUTH_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
pub const ACCEPT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(20);

/// Extra time allowed for the office-mode IP line to finish arriving after
/// its leading marker has already matched.
const OFFICE_IP_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Server, username, and password must all be provided")]
    MissingCredentials,
    #[error("Failed to start the SNX client: {0}")]
    Spawn(std::io::Error),
    #[error("Connection timed out waiting for a response from the SNX client")]
    Timeout,
    #[error("Connection denied by the server; check your credentials or server settings")]
    Denied,
    #[error("Another session is active, but no stored office-mode IP was found")]
    AnotherSessionNoStoredIp,
    #[error("The SNX client terminated unexpectedly before connecting")]
    UnexpectedTermination,
    #[error("Office-mode IP not found in the SNX client output")]
    OfficeIpNotFound,
    #[error("Client I/O error: {0}")]
    Io(std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ExpectError {
    #[error("Timed out waiting for client output")]
    Timeout,
    #[error("Client I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExpectError> for ConnectError {
    fn from(e: ExpectError) -> Self {
        match e {
            ExpectError::Timeout => ConnectError::Timeout,
            ExpectError::Io(e) => ConnectError::Io(e),
        }
    }
}

/// Outcome of a pattern wait.
#[derive(Debug, PartialEq, Eq)]
pub enum Expect {
    /// Index into the pattern list that matched first in stream order.
    Pattern(usize),
    /// Both output streams closed without a match.
    Eof,
}

/// A spawned client process with expect-style primitives.
///
/// Everything the process writes is accumulated into a transcript; a cursor
/// marks how far pattern matching has consumed it, so successive waits never
/// re-match earlier output. The child is killed on drop, so an early return
/// cannot leak a live process.
pub struct ClientSession {
    child: Child,
    stdin: ChildStdin,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    transcript: String,
    cursor: usize,
}

impl ClientSession {
    pub async fn spawn(bin: &str, args: &[&str]) -> std::io::Result<Self> {
        let mut child = Command::new(bin)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("client stdin not captured"))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        Ok(Self {
            child,
            stdin,
            stdout,
            stderr,
            transcript: String::new(),
            cursor: 0,
        })
    }

    /// Everything the process has written so far, both streams interleaved in
    /// arrival order.
    pub fn output(&self) -> &str {
        &self.transcript
    }

    fn streams_open(&self) -> bool {
        self.stdout.is_some() || self.stderr.is_some()
    }

    /// Read the next chunk from whichever stream produces one first. A stream
    /// hitting end-of-file is retired; returns the number of bytes appended.
    async fn read_chunk(&mut self) -> std::io::Result<usize> {
        if !self.streams_open() {
            return Ok(0);
        }
        let mut out_buf = [0u8; 4096];
        let mut err_buf = [0u8; 4096];
        let has_stdout = self.stdout.is_some();
        let has_stderr = self.stderr.is_some();
        let stdout = &mut self.stdout;
        let stderr = &mut self.stderr;

        let (from_stdout, res) = tokio::select! {
            r = async {
                match stdout.as_mut() {
                    Some(stream) => stream.read(&mut out_buf).await,
                    None => std::future::pending().await,
                }
            }, if has_stdout => (true, r),
            r = async {
                match stderr.as_mut() {
                    Some(stream) => stream.read(&mut err_buf).await,
                    None => std::future::pending().await,
                }
            }, if has_stderr => (false, r),
        };
        let n = res?;
        if n == 0 {
            if from_stdout {
                self.stdout = None;
            } else {
                self.stderr = None;
            }
            return Ok(0);
        }
        let chunk = if from_stdout { &out_buf[..n] } else { &err_buf[..n] };
        self.transcript.push_str(&String::from_utf8_lossy(chunk));
        Ok(n)
    }

    /// Wait until one of the patterns appears in unconsumed output, the
    /// process closes both streams, or the deadline passes. The match that
    /// occurs earliest in the stream wins; list order breaks ties.
    pub async fn expect(&mut self, patterns: &[&str], wait: Duration) -> Result<Expect, ExpectError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some((idx, end)) = self.find_earliest(patterns) {
                self.cursor = end;
                return Ok(Expect::Pattern(idx));
            }
            if !self.streams_open() {
                return Ok(Expect::Eof);
            }
            match timeout_at(deadline, self.read_chunk()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(ExpectError::Io(e)),
                Err(_) => return Err(ExpectError::Timeout),
            }
        }
    }

    fn find_earliest(&self, patterns: &[&str]) -> Option<(usize, usize)> {
        let window = &self.transcript[self.cursor..];
        let mut best: Option<(usize, usize, usize)> = None;
        for (idx, pattern) in patterns.iter().enumerate() {
            if let Some(pos) = window.find(pattern) {
                let keep_current = matches!(best, Some((best_pos, _, _)) if best_pos <= pos);
                if !keep_current {
                    best = Some((pos, idx, self.cursor + pos + pattern.len()));
                }
            }
        }
        best.map(|(_, idx, end)| (idx, end))
    }

    /// Keep reading until `scan` extracts a value from the transcript, the
    /// process exits, or the deadline passes.
    pub async fn drain_for<T>(
        &mut self,
        wait: Duration,
        scan: impl Fn(&str) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(value) = scan(&self.transcript) {
                return Some(value);
            }
            if !self.streams_open() {
                return None;
            }
            match timeout_at(deadline, self.read_chunk()).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => return scan(&self.transcript),
            }
        }
    }

    pub async fn send_line(&mut self, line: &str) -> Result<(), ExpectError> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Terminate and reap the child.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("Reaping client process failed: {}", e);
        }
    }
}

/// Driver for the SNX client's authentication dialogue.
pub struct SnxClient {
    bin: String,
    prompt_timeout: Duration,
    auth_timeout: Duration,
    accept_timeout: Duration,
}

impl Default for SnxClient {
    fn default() -> Self {
        Self::new("snx")
    }
}

impl SnxClient {
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            prompt_timeout: PASSWORD_PROMPT_TIMEOUT,
            auth_timeout: AUTH_RESPONSE_TIMEOUT,
            accept_timeout: ACCEPT_RESPONSE_TIMEOUT,
        }
    }

    /// Same driver with shortened deadlines; used by tests against scripted
    /// fake clients.
    pub fn with_timeouts(
        bin: impl Into<String>,
        prompt_timeout: Duration,
        auth_timeout: Duration,
        accept_timeout: Duration,
    ) -> Self {
        Self {
            bin: bin.into(),
            prompt_timeout,
            auth_timeout,
            accept_timeout,
        }
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    /// Run the full authentication dialogue and return the office-mode IP.
    ///
    /// `stored_ip` is the office-mode IP persisted by a previous successful
    /// connect, if any. It is preferred over a freshly parsed one, and it is
    /// what lets an "Another session" exit still count as connected.
    pub async fn authenticate(
        &self,
        server: &str,
        username: &str,
        password: &str,
        stored_ip: Option<String>,
    ) -> Result<String, ConnectError> {
        info!("Starting SNX client for {}", server);
        let mut session = ClientSession::spawn(&self.bin, &["-s", server, "-u", username])
            .await
            .map_err(ConnectError::Spawn)?;
        let result = self.negotiate(&mut session, password, stored_ip).await;
        session.shutdown().await;
        result
    }

    async fn negotiate(
        &self,
        session: &mut ClientSession,
        password: &str,
        stored_ip: Option<String>,
    ) -> Result<String, ConnectError> {
        match session
            .expect(&["password:", "Password:"], self.prompt_timeout)
            .await?
        {
            Expect::Pattern(_) => {}
            Expect::Eof => return finish_eof(session.output(), stored_ip),
        }
        session.send_line(password).await?;

        match session
            .expect(&["accept?", "Office"], self.auth_timeout)
            .await?
        {
            Expect::Pattern(0) => {
                debug!("Terms prompt received, accepting");
                session.send_line("y").await?;
                match session
                    .expect(&["Office", "denied"], self.accept_timeout)
                    .await?
                {
                    Expect::Pattern(1) => Err(ConnectError::Denied),
                    Expect::Pattern(_) => self.office_ip(session, stored_ip).await,
                    Expect::Eof => finish_eof(session.output(), stored_ip),
                }
            }
            Expect::Pattern(_) => {
                debug!("Session established without a terms prompt");
                self.office_ip(session, stored_ip).await
            }
            Expect::Eof => finish_eof(session.output(), stored_ip),
        }
    }

    async fn office_ip(
        &self,
        session: &mut ClientSession,
        stored_ip: Option<String>,
    ) -> Result<String, ConnectError> {
        if let Some(ip) = stored_ip {
            // First successful connect wins; a freshly parsed IP never
            // silently overwrites the persisted one.
            debug!("Keeping stored office-mode IP {}", ip);
            return Ok(ip);
        }
        match session.drain_for(OFFICE_IP_GRACE, parse_office_ip).await {
            Some(ip) => {
                info!("Office-mode IP obtained: {}", ip);
                Ok(ip)
            }
            None => {
                warn!("No office-mode IP in client output:\n{}", session.output());
                Err(ConnectError::OfficeIpNotFound)
            }
        }
    }
}

/// Classify an end-of-stream exit: a reported concurrent session keeps the
/// stored office-mode IP alive, anything else is a hard failure.
fn finish_eof(output: &str, stored_ip: Option<String>) -> Result<String, ConnectError> {
    if output.contains("Another session") {
        match stored_ip {
            Some(ip) => {
                info!("Another session is active; reusing stored office-mode IP {}", ip);
                Ok(ip)
            }
            None => Err(ConnectError::AnotherSessionNoStoredIp),
        }
    } else {
        Err(ConnectError::UnexpectedTermination)
    }
}

/// Pull the office-mode IP out of a `... Mode IP : <dotted-quad>` line,
/// tolerating surrounding whitespace and trailing punctuation.
pub fn parse_office_ip(output: &str) -> Option<String> {
    for line in output.lines() {
        let Some(pos) = line.find("Mode IP") else {
            continue;
        };
        let rest = line[pos + "Mode IP".len()..].trim_start();
        let Some(rest) = rest.strip_prefix(':') else {
            continue;
        };
        let value: String = rest
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let value = value.trim_end_matches('.');
        if value.parse::<Ipv4Addr>().is_ok() {
            return Some(value.to_string());
        }
    }
    None
}

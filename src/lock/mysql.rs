//! MySQL write freeze via `FLUSH TABLES WITH READ LOCK`
//!
//! The global read lock lives as long as the connection that took it, so
//! the driver keeps one `mysql` client process open for the whole freeze
//! window and talks to it over stdin/stdout. Each statement is followed by
//! a `SELECT '<marker>'` so completion can be detected with a timeout.
//! Closing the client drops the connection, which always releases the lock.
//! Anything else asked while frozen goes over a second, short-lived client
//! so a failing statement can never end the session holding the lock.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{DriverError, LockDriver, ReplicationInfo};

const STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);
const UNLOCK_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// How to reach the server with the `mysql` command line client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MySqlConnection {
    pub program: String,
    pub defaults_extra_file: Option<PathBuf>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub socket: Option<PathBuf>,
}

impl Default for MySqlConnection {
    fn default() -> Self {
        Self {
            program: "mysql".into(),
            defaults_extra_file: None,
            user: None,
            password: None,
            host: None,
            port: None,
            socket: None,
        }
    }
}

impl MySqlConnection {
    /// Client command line. The password travels in `MYSQL_PWD`, never in argv.
    pub fn argv(&self) -> Vec<String> {
        let mut args = vec![self.program.clone()];
        // must be the first option
        if let Some(file) = &self.defaults_extra_file {
            args.push(format!("--defaults-extra-file={}", file.display()));
        }
        if let Some(user) = &self.user {
            args.push(format!("--user={}", user));
        }
        if let Some(host) = &self.host {
            args.push(format!("--host={}", host));
        }
        if let Some(port) = self.port {
            args.push(format!("--port={}", port));
        }
        if let Some(socket) = &self.socket {
            args.push(format!("--socket={}", socket.display()));
        }
        args.extend(
            ["--batch", "--skip-column-names", "--unbuffered", "--silent"]
                .iter()
                .map(|s| s.to_string()),
        );
        args
    }
}

enum Line {
    Out(String),
    Err(String),
}

/// One long-lived client process.
struct Session {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<Line>,
    seq: u64,
}

impl Session {
    fn spawn(argv: &[String], password: Option<&str>) -> Result<Session, DriverError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| DriverError::Failed("empty mysql command line".into()))?;
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(password) = password {
            command.env("MYSQL_PWD", password);
        }
        debug!(target: "snapfreeze::lock", "Starting mysql client: {}", program);
        let mut child = command
            .spawn()
            .map_err(|e| DriverError::Failed(format!("failed to start '{}': {}", program, e)))?;

        let stdin = child.stdin.take();
        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            forward(stdout, tx.clone(), Line::Out);
        }
        if let Some(stderr) = child.stderr.take() {
            forward(stderr, tx, Line::Err);
        }
        Ok(Session { child, stdin, lines: rx, seq: 0 })
    }

    /// Run one statement and return its result rows.
    fn query(&mut self, sql: &str, timeout: Duration) -> Result<Vec<String>, DriverError> {
        self.seq += 1;
        let marker = format!("snapfreeze-{}", self.seq);
        debug!(target: "snapfreeze::lock", "mysql> {}", sql);

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| DriverError::Failed("mysql session already closed".into()))?;
        write!(stdin, "{};\nSELECT '{}';\n", sql, marker)
            .and_then(|_| stdin.flush())
            .map_err(|e| DriverError::Failed(format!("mysql client went away: {}", e)))?;

        let deadline = Instant::now() + timeout;
        let mut rows = Vec::new();
        let mut errors = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.lines.recv_timeout(remaining) {
                Ok(Line::Out(line)) if line.trim() == marker => return Ok(rows),
                Ok(Line::Out(line)) => rows.push(line),
                Ok(Line::Err(line)) => {
                    warn!(target: "snapfreeze::lock", "mysql: {}", line);
                    errors.push(line);
                }
                Err(RecvTimeoutError::Timeout) => return Err(DriverError::Timeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => {
                    let reason = if errors.is_empty() {
                        "mysql client exited unexpectedly".to_string()
                    } else {
                        errors.join("; ")
                    };
                    return Err(DriverError::Failed(reason));
                }
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill the client without waiting for the running statement.
    fn abort(mut self) {
        let _ = self.child.kill();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // EOF on stdin ends the client once it is idle
        self.stdin.take();
        let deadline = Instant::now() + CLOSE_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                _ => break,
            }
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn forward<R, F>(pipe: R, tx: Sender<Line>, wrap: F)
where
    R: Read + Send + 'static,
    F: Fn(String) -> Line + Send + 'static,
{
    thread::spawn(move || {
        for line in BufReader::new(pipe).lines() {
            let Ok(line) = line else { break };
            if tx.send(wrap(line)).is_err() {
                break;
            }
        }
    });
}

/// Freezes MySQL writes with `FLUSH TABLES WITH READ LOCK`.
pub struct MySqlFlushLock {
    argv: Vec<String>,
    password: Option<String>,
    session: Option<Session>,
    statement_timeout: Duration,
}

impl MySqlFlushLock {
    pub fn new(connection: &MySqlConnection) -> Self {
        Self {
            argv: connection.argv(),
            password: connection.password.clone(),
            session: None,
            statement_timeout: STATEMENT_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_command(argv: Vec<String>) -> Self {
        Self { argv, password: None, session: None, statement_timeout: Duration::from_secs(5) }
    }

    fn session(&mut self) -> Result<&mut Session, DriverError> {
        if self.session.is_none() {
            self.session = Some(Session::spawn(&self.argv, self.password.as_deref())?);
        }
        self.session
            .as_mut()
            .ok_or_else(|| DriverError::Failed("mysql session unavailable".into()))
    }

    /// Run a statement; a session that failed or timed out is torn down.
    fn execute(&mut self, sql: &str, timeout: Duration) -> Result<Vec<String>, DriverError> {
        let result = self.session()?.query(sql, timeout);
        if result.is_err() {
            if let Some(session) = self.session.take() {
                session.abort();
            }
        }
        result
    }
}

impl LockDriver for MySqlFlushLock {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn flush(&mut self) -> Result<(), DriverError> {
        info!(target: "snapfreeze::lock", "Executing FLUSH /*!40101 LOCAL */ TABLES");
        self.execute("FLUSH /*!40101 LOCAL */ TABLES", self.statement_timeout)
            .map(drop)
    }

    fn lock(&mut self, timeout: Duration) -> Result<(), DriverError> {
        info!(target: "snapfreeze::lock", "Executing FLUSH TABLES WITH READ LOCK");
        self.execute("FLUSH TABLES WITH READ LOCK", timeout).map(drop)
    }

    fn unlock(&mut self) -> Result<(), DriverError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        info!(target: "snapfreeze::lock", "Executing UNLOCK TABLES");
        match session.query("UNLOCK TABLES", UNLOCK_TIMEOUT) {
            Ok(_) => drop(session),
            Err(e) => {
                // dropping the connection releases the global read lock regardless
                warn!(target: "snapfreeze::lock", "UNLOCK TABLES failed ({}); closing the connection instead", e);
                session.abort();
            }
        }
        Ok(())
    }

    fn replication_info(&mut self) -> Result<Option<ReplicationInfo>, DriverError> {
        // the position cannot move while the global read lock is held
        let mut side = Session::spawn(&self.argv, self.password.as_deref())?;
        let rows = match side.query("SHOW MASTER STATUS", self.statement_timeout) {
            Ok(rows) => rows,
            Err(e) => {
                side.abort();
                return Err(e);
            }
        };
        Ok(rows.first().and_then(|row| parse_master_status(row)))
    }

    fn lock_held(&mut self) -> Result<(), DriverError> {
        match self.session.as_mut() {
            Some(session) => {
                if session.is_alive() {
                    Ok(())
                } else {
                    Err(DriverError::Failed("mysql client holding the lock has exited".into()))
                }
            }
            None => Err(DriverError::Failed("no mysql session holds the lock".into())),
        }
    }
}

/// `File<TAB>Position<TAB>...` from `SHOW MASTER STATUS`.
fn parse_master_status(row: &str) -> Option<ReplicationInfo> {
    let mut columns = row.split('\t');
    let log_file = columns.next()?.trim();
    let log_position = columns.next()?.trim().parse().ok()?;
    if log_file.is_empty() {
        return None;
    }
    Some(ReplicationInfo { log_file: log_file.to_string(), log_position })
}

/// Ask the server for its data directory.
pub fn query_datadir(connection: &MySqlConnection) -> Result<PathBuf, DriverError> {
    let mut session = Session::spawn(&connection.argv(), connection.password.as_deref())?;
    let rows = session.query("SELECT @@datadir", STATEMENT_TIMEOUT)?;
    rows.first()
        .map(|row| PathBuf::from(row.trim()))
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| DriverError::Failed("server did not report a datadir".into()))
}

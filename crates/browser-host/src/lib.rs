//! Host-side endpoint for a browser child process.
//!
//! Speaks the `browser-proto` line protocol over the child's
//! stdin/stdout. The channel is half-duplex from the caller's
//! perspective: one request line out, then await exactly one valid
//! response line back. Lines that do not parse as JSON (browser noise
//! on stdout) are logged and skipped; reading continues until a valid
//! response arrives, the deadline passes, or the pipe closes.
//!
//! The child's stderr is free-form text; [`spawn_stderr_drain`]
//! forwards it to the logger line by line.

use std::time::Duration;

use browser_proto::{ProtoError, ScrapeRequest, ScrapeResponse, decode_line, encode_line};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::time::{Instant, timeout_at};
use tracing::warn;

/// IO failure kinds on the child channel.
#[derive(Debug, thiserror::Error)]
pub enum ChildIoError {
    /// The child process is known to have exited before the request
    /// was written.
    #[error("child process is not running")]
    ChildDead,

    /// No valid response line arrived within the deadline.
    #[error("timed out waiting for response from child process")]
    Timeout,

    /// The child's stdout reached EOF mid-request.
    #[error("child channel closed")]
    ChannelClosed,

    #[error("child io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Proto(String),
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Host end of one child's stdio channel.
///
/// `send` takes `&mut self`, so requests on a single host are strictly
/// sequential and responses can never interleave.
pub struct ChildHost {
    label: String,
    stdin: BoxedWriter,
    lines: Lines<BufReader<BoxedReader>>,
}

impl ChildHost {
    /// Build a host from arbitrary reader/writer halves (tests use
    /// in-memory duplex pipes here).
    pub fn new(
        label: impl Into<String>,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            stdin: Box::new(writer),
            lines: BufReader::new(Box::new(reader) as BoxedReader).lines(),
        }
    }

    /// Take ownership of a spawned child's stdin/stdout.
    ///
    /// The child must have been spawned with both pipes set to
    /// `Stdio::piped()`.
    pub fn from_child(
        label: impl Into<String>,
        child: &mut tokio::process::Child,
    ) -> Result<Self, ChildIoError> {
        let stdin = child.stdin.take().ok_or_else(|| {
            ChildIoError::Io(std::io::Error::other("child spawned without piped stdin"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ChildIoError::Io(std::io::Error::other("child spawned without piped stdout"))
        })?;
        Ok(Self::new(label, stdin, stdout))
    }

    /// Write one request line, then await one valid response line.
    ///
    /// Non-JSON stdout lines are logged and skipped. A JSON line that
    /// does not match the response shape is likewise skipped; the call
    /// only resolves on a well-formed response, EOF, or the deadline.
    pub async fn send(
        &mut self,
        request: &ScrapeRequest,
        timeout: Duration,
    ) -> Result<ScrapeResponse, ChildIoError> {
        let line = encode_line(request).map_err(|e| ChildIoError::Proto(e.to_string()))?;
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(map_write_error)?;
        self.stdin.flush().await.map_err(map_write_error)?;

        let deadline = Instant::now() + timeout;
        loop {
            let next = timeout_at(deadline, self.lines.next_line())
                .await
                .map_err(|_| ChildIoError::Timeout)?;
            let Some(raw) = next? else {
                return Err(ChildIoError::ChannelClosed);
            };
            if raw.trim().is_empty() {
                continue;
            }
            match decode_line(&raw) {
                Ok(response) => return Ok(response),
                Err(ProtoError::NotJson(_)) => {
                    warn!(label = %self.label, line = %raw, "non-JSON line from child, skipping");
                }
                Err(e) => {
                    warn!(label = %self.label, line = %raw, error = %e, "unparseable response line, skipping");
                }
            }
        }
    }
}

/// A broken pipe on write means the child went away under us.
fn map_write_error(e: std::io::Error) -> ChildIoError {
    if e.kind() == std::io::ErrorKind::BrokenPipe {
        ChildIoError::ChildDead
    } else {
        ChildIoError::Io(e)
    }
}

/// Forward a child's stderr to the logger until the pipe closes.
///
/// Returns the drain task handle; dropping it detaches the drain.
pub fn spawn_stderr_drain(
    label: impl Into<String>,
    stderr: impl AsyncRead + Send + Unpin + 'static,
) -> tokio::task::JoinHandle<()> {
    let label = label.into();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.is_empty() {
                warn!(label = %label, "child stderr: {line}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, split};

    /// Build a host wired to an in-memory peer; the returned halves act
    /// as the mock child's stdin (read) and stdout (write).
    fn make_host() -> (
        ChildHost,
        BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    ) {
        let (host_end, child_end) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = split(host_end);
        let (child_read, child_write) = split(child_end);
        let host = ChildHost::new("session-test", host_write, host_read);
        (host, BufReader::new(child_read), child_write)
    }

    #[tokio::test]
    async fn send_round_trip() {
        let (mut host, mut child_in, mut child_out) = make_host();

        tokio::spawn(async move {
            let mut line = String::new();
            child_in.read_line(&mut line).await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(value["action"], "get_user_info");
            assert_eq!(value["username"], "alice");
            child_out
                .write_all(b"{\"status\":\"success\",\"data\":{\"ok\":true}}\n")
                .await
                .unwrap();
        });

        let resp = host
            .send(
                &ScrapeRequest::user_info("alice", None),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        match resp {
            ScrapeResponse::Success { data } => assert_eq!(data["ok"], true),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_skips_noise_lines() {
        let (mut host, mut child_in, mut child_out) = make_host();

        tokio::spawn(async move {
            let mut line = String::new();
            child_in.read_line(&mut line).await.unwrap();
            child_out
                .write_all(b"DevTools listening on ws://127.0.0.1\n\n{\"nope\":1}\n{\"status\":\"error\",\"message\":\"'user'\"}\n")
                .await
                .unwrap();
        });

        let resp = host
            .send(&ScrapeRequest::user_videos("bob"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            resp,
            ScrapeResponse::Error {
                message: "'user'".into()
            }
        );
    }

    #[tokio::test]
    async fn send_times_out_without_response() {
        let (mut host, _child_in, _child_out) = make_host();
        let err = host
            .send(
                &ScrapeRequest::user_videos("carol"),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChildIoError::Timeout));
    }

    #[tokio::test]
    async fn send_reports_closed_channel_on_eof() {
        let (mut host, mut child_in, child_out) = make_host();

        tokio::spawn(async move {
            let mut line = String::new();
            child_in.read_line(&mut line).await.unwrap();
            drop(child_out);
        });

        let err = host
            .send(&ScrapeRequest::user_videos("dave"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ChildIoError::ChannelClosed));
    }

    #[tokio::test]
    async fn sequential_requests_stay_ordered() {
        let (mut host, mut child_in, mut child_out) = make_host();

        tokio::spawn(async move {
            for i in 0..3 {
                let mut line = String::new();
                child_in.read_line(&mut line).await.unwrap();
                let resp = format!("{{\"status\":\"success\",\"data\":{i}}}\n");
                child_out.write_all(resp.as_bytes()).await.unwrap();
            }
        });

        for i in 0..3 {
            let resp = host
                .send(&ScrapeRequest::user_videos("eve"), Duration::from_secs(5))
                .await
                .unwrap();
            match resp {
                ScrapeResponse::Success { data } => assert_eq!(data, serde_json::json!(i)),
                other => panic!("expected success, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn drives_a_real_scripted_child() {
        let script = r#"while read -r line; do echo '{"status":"success","data":{"echo":true}}'; done"#;
        let mut child = tokio::process::Command::new("bash")
            .arg("-c")
            .arg(script)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();

        let mut host = ChildHost::from_child("session-bash", &mut child).unwrap();
        let resp = host
            .send(
                &ScrapeRequest::user_info("alice", Some("1".into())),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(resp.is_success());

        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn stderr_drain_consumes_until_eof() {
        let mut child = tokio::process::Command::new("bash")
            .arg("-c")
            .arg("echo oops >&2")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();

        let stderr = child.stderr.take().unwrap();
        let drain = spawn_stderr_drain("session-err", stderr);
        drain.await.unwrap();
        child.wait().await.unwrap();
    }
}

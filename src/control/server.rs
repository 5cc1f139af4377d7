//! Unix-socket control server run by the scheduler process.
//!
//! The scheduler holds the store's exclusive lock for its whole lifetime,
//! so operator commands issued while it runs are executed here, inside the
//! process that owns the store.

use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatch::dispatch;
use super::protocol::{ControlRequest, ControlResponse, MAX_LINE_BYTES};
use crate::pipeline::Services;

/// Socket file mode: owner read/write only.
const SOCKET_MODE: u32 = 0o600;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("failed to bind control socket {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("control socket path {} exists and is not a socket", .0.display())]
    NotASocket(PathBuf),
    #[error("control socket I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed control message: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("control message exceeds {} bytes", MAX_LINE_BYTES)]
    TooLarge,
    #[error("connection closed before a complete message")]
    Closed,
    #[error("control request timed out after {0}s")]
    Timeout(u64),
    #[error("no scheduler is listening on {}", .0.display())]
    Unavailable(PathBuf),
}

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    services: Arc<Services>,
    request_timeout: Duration,
}

impl ControlServer {
    /// Bind at `path`, replacing a stale socket left by a crashed run.
    pub fn bind(path: impl Into<PathBuf>, services: Arc<Services>) -> Result<Self, ControlError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ControlError::Bind {
                path: path.clone(),
                source,
            })?;
        }
        remove_stale_socket(&path)?;
        let listener = UnixListener::bind(&path).map_err(|source| ControlError::Bind {
            path: path.clone(),
            source,
        })?;
        set_socket_permissions(&path)?;

        let request_timeout = Duration::from_secs(services.config.scheduler.control_timeout_secs);
        info!(socket = %path.display(), "[Control] Listening");
        Ok(Self {
            listener,
            path,
            services,
            request_timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `cancel` fires, then remove the socket.
    /// Each connection is served on its own task.
    pub async fn serve(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let services = Arc::clone(&self.services);
                        let timeout = self.request_timeout;
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &services, timeout).await {
                                warn!(error = %e, "[Control] Connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "[Control] Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(socket = %self.path.display(), "[Control] Socket removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(socket = %self.path.display(), error = %e, "[Control] Failed to remove socket"),
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    services: &Services,
    timeout: Duration,
) -> Result<(), ControlError> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let line = read_line(&mut reader).await?;

    let response = match serde_json::from_str::<ControlRequest>(&line) {
        Ok(request) => {
            let name = request.name();
            debug!(request = name, "[Control] Request received");
            match tokio::time::timeout(timeout, dispatch(services, request)).await {
                Ok(Ok(reply)) => ControlResponse::Ok { reply },
                Ok(Err(e)) => {
                    warn!(request = name, error = %e, "[Control] Request failed");
                    ControlResponse::Error { message: e.to_string() }
                }
                Err(_) => ControlResponse::Error {
                    message: ControlError::Timeout(timeout.as_secs()).to_string(),
                },
            }
        }
        Err(e) => ControlResponse::Error {
            message: ControlError::Protocol(e).to_string(),
        },
    };

    write_line(&mut write, &response).await
}

/// Read one newline-terminated message of at most [`MAX_LINE_BYTES`].
pub(crate) async fn read_line<R>(reader: &mut R) -> Result<String, ControlError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = u64::try_from(MAX_LINE_BYTES).unwrap_or(u64::MAX).saturating_add(1);
    let read = reader.take(limit).read_until(b'\n', &mut buf).await?;
    if read == 0 {
        return Err(ControlError::Closed);
    }
    if buf.last() != Some(&b'\n') {
        return Err(if buf.len() > MAX_LINE_BYTES {
            ControlError::TooLarge
        } else {
            ControlError::Closed
        });
    }
    buf.pop();
    String::from_utf8(buf).map_err(|e| ControlError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

pub(crate) async fn write_line<W, T>(writer: &mut W, message: &T) -> Result<(), ControlError>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

fn remove_stale_socket(path: &Path) -> Result<(), ControlError> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(ControlError::Io(e)),
    };
    if !metadata.file_type().is_socket() {
        return Err(ControlError::NotASocket(path.to_path_buf()));
    }
    std::fs::remove_file(path)?;
    debug!(path = %path.display(), "[Control] Removed stale socket");
    Ok(())
}

fn set_socket_permissions(path: &Path) -> Result<(), ControlError> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_read_line_limits() {
        let mut input: &[u8] = b"{\"op\":\"maintenance\"}\nrest";
        assert_eq!(read_line(&mut input).await.unwrap(), r#"{"op":"maintenance"}"#);

        let mut truncated: &[u8] = b"{\"op\":";
        assert!(matches!(read_line(&mut truncated).await, Err(ControlError::Closed)));

        let mut empty: &[u8] = b"";
        assert!(matches!(read_line(&mut empty).await, Err(ControlError::Closed)));
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_and_refuses_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ctl.sock");

        // a socket left behind by a crashed process
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());
        remove_stale_socket(&path).unwrap();
        assert!(!path.exists());

        let listener = UnixListener::bind(&path).unwrap();
        set_socket_permissions(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SOCKET_MODE);
        drop(listener);

        let file = dir.path().join("not-a-socket");
        std::fs::write(&file, "data").unwrap();
        assert!(matches!(remove_stale_socket(&file), Err(ControlError::NotASocket(_))));
        assert!(file.exists());
    }
}

//! CLI side of the control channel.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::UnixStream;

use super::protocol::{ControlReply, ControlRequest, ControlResponse};
use super::server::{read_line, write_line, ControlError};
use crate::config::{defaults, AppConfig};

pub struct ControlClient {
    path: PathBuf,
    connect_timeout: Duration,
    request_timeout: Duration,
}

/// Outcome of sending a request: either the scheduler answered, or it
/// refused with a message.
pub type Answer = Result<ControlReply, String>;

impl ControlClient {
    pub fn new(path: impl Into<PathBuf>, request_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            connect_timeout: Duration::from_millis(defaults::CONTROL_CONNECT_MILLIS),
            request_timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        // the server bounds the work itself; leave room for its answer
        let request_timeout = Duration::from_secs(config.scheduler.control_timeout_secs)
            + Duration::from_millis(defaults::CONTROL_CONNECT_MILLIS);
        Self::new(config.scheduler.control_socket_path(), request_timeout)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send one request to the running scheduler.
    ///
    /// [`ControlError::Unavailable`] means no scheduler is listening and the
    /// caller may act on the store itself.
    pub async fn send(&self, request: &ControlRequest) -> Result<Answer, ControlError> {
        let unavailable = || ControlError::Unavailable(self.path.clone());
        if !self.path.exists() {
            return Err(unavailable());
        }
        let stream = match tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e))
                if matches!(e.kind(), io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound) =>
            {
                return Err(unavailable())
            }
            Ok(Err(e)) => return Err(ControlError::Io(e)),
            Err(_) => return Err(ControlError::Timeout(self.connect_timeout.as_secs())),
        };

        let exchange = async {
            let (read, mut write) = stream.into_split();
            write_line(&mut write, request).await?;
            let line = read_line(&mut BufReader::new(read)).await?;
            Ok::<_, ControlError>(serde_json::from_str::<ControlResponse>(&line)?)
        };
        let response = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| ControlError::Timeout(self.request_timeout.as_secs()))??;

        tracing::debug!(request = request.name(), socket = %self.path.display(), "Request served by scheduler");
        Ok(match response {
            ControlResponse::Ok { reply } => Ok(reply),
            ControlResponse::Error { message } => Err(message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_or_dead_socket_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let client = ControlClient::new(&path, Duration::from_secs(1));
        assert!(matches!(
            client.send(&ControlRequest::SettingsShow).await,
            Err(ControlError::Unavailable(_))
        ));

        // socket file left behind with nobody listening
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(matches!(
            client.send(&ControlRequest::SettingsShow).await,
            Err(ControlError::Unavailable(_))
        ));
    }
}

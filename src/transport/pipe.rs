//! Unix-domain socket endpoints.
//!
//! The multiplexer works over any `AsyncRead + AsyncWrite` stream; these
//! helpers cover the common local case of a responder binding a socket
//! path and an initiator connecting to it.
//!
//! # Example
//!
//! ```ignore
//! use chanmux::transport::{generate_pipe_path, PipeListener, PipeStream};
//!
//! let path = generate_pipe_path();
//! let listener = PipeListener::bind(&path).await?;
//! let initiator = PipeStream::connect(&path).await?;
//! let responder = listener.accept().await?;
//! ```

use std::path::Path;

use tokio::net::{UnixListener, UnixStream};

use crate::error::Result;

/// Generate a unique socket path for this process.
///
/// Format: `{tmp}/chanmux-{pid}-{random}.sock`
pub fn generate_pipe_path() -> String {
    let pid = std::process::id();
    let random = uuid::Uuid::new_v4().simple().to_string();
    std::env::temp_dir()
        .join(format!("chanmux-{}-{}.sock", pid, &random[..12]))
        .to_string_lossy()
        .into_owned()
}

/// Listening socket. Removes its socket file on drop.
pub struct PipeListener {
    listener: UnixListener,
    path: String,
}

impl PipeListener {
    /// Bind to a socket path, replacing any stale socket file.
    pub async fn bind(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        tracing::debug!("Listening on {}", path);

        Ok(Self {
            listener,
            path: path.to_string(),
        })
    }

    /// Accept a single connection.
    pub async fn accept(&self) -> Result<PipeStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(PipeStream { stream })
    }

    /// Get the socket path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A connected socket, ready to hand to a [`Multiplexer`](crate::Multiplexer).
pub struct PipeStream {
    stream: UnixStream,
}

impl PipeStream {
    /// Connect to a listening socket path.
    pub async fn connect(path: &str) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self { stream })
    }

    /// Unwrap the underlying tokio stream.
    pub fn into_inner(self) -> UnixStream {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_generate_pipe_path_unique() {
        let a = generate_pipe_path();
        let b = generate_pipe_path();

        assert_ne!(a, b);
        assert!(a.ends_with(".sock"));
        assert!(a.contains(&format!("chanmux-{}-", std::process::id())));
    }

    #[tokio::test]
    async fn test_connect_and_accept() {
        let path = generate_pipe_path();
        let listener = PipeListener::bind(&path).await.unwrap();

        let (client, server) = tokio::join!(PipeStream::connect(&path), listener.accept());
        let mut client = client.unwrap().into_inner();
        let mut server = server.unwrap().into_inner();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_listener_removes_socket_file() {
        let path = generate_pipe_path();
        {
            let listener = PipeListener::bind(&path).await.unwrap();
            assert_eq!(listener.path(), path);
            assert!(Path::new(&path).exists());
        }
        assert!(!Path::new(&path).exists());
    }
}

//! Platform-specific pipe implementation.
//!
//! - Unix: Unix domain socket on a filesystem path
//! - Windows: named pipe

use std::io;

use super::BoxedStream;

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::path::Path;
    use tokio::net::{UnixListener, UnixStream};

    /// Unix domain socket listener.
    ///
    /// The socket file is unlinked again when the listener is dropped.
    pub struct PipeListener {
        listener: UnixListener,
        path: String,
    }

    impl PipeListener {
        /// Bind to a socket path.
        ///
        /// Removes any stale socket file at the path before binding. With
        /// `allow_multiuser_access` the file is opened up to read+write for
        /// every local user; the default mode keeps it owner read/write.
        pub fn bind(path: &str, allow_multiuser_access: bool) -> io::Result<Self> {
            if Path::new(path).exists() {
                std::fs::remove_file(path)?;
            }

            let listener = UnixListener::bind(path)?;

            if allow_multiuser_access {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
            }

            Ok(Self {
                listener,
                path: path.to_string(),
            })
        }

        /// Accept a single connection.
        pub async fn accept(&self) -> io::Result<BoxedStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(Box::new(stream))
        }
    }

    impl Drop for PipeListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    /// Dial a pipe endpoint.
    pub async fn connect(path: &str) -> io::Result<BoxedStream> {
        let stream = UnixStream::connect(path).await?;
        Ok(Box::new(stream))
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use tokio::net::windows::named_pipe::{ClientOptions, ServerOptions};

    /// Windows named pipe listener.
    ///
    /// Named pipes have no persistent filesystem entry; each accept creates a
    /// fresh server instance on the same name.
    pub struct PipeListener {
        path: String,
        pending: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
    }

    impl PipeListener {
        pub fn bind(path: &str, _allow_multiuser_access: bool) -> io::Result<Self> {
            // Claim the name now so a second server fails here, not at accept.
            let first = ServerOptions::new()
                .first_pipe_instance(true)
                .create(path)?;

            Ok(Self {
                path: path.to_string(),
                pending: Some(first),
            })
        }

        pub async fn accept(&mut self) -> io::Result<BoxedStream> {
            let server = match self.pending.take() {
                Some(server) => server,
                None => ServerOptions::new().create(&self.path)?,
            };
            server.connect().await?;
            Ok(Box::new(server))
        }
    }

    /// Dial a pipe endpoint, retrying while all instances are busy.
    pub async fn connect(path: &str) -> io::Result<BoxedStream> {
        const ERROR_PIPE_BUSY: i32 = 231;

        loop {
            match ClientOptions::new().open(path) {
                Ok(client) => return Ok(Box::new(client)),
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ============================================================================
// Platform-independent re-exports
// ============================================================================

#[cfg(unix)]
pub(crate) use unix_impl::{connect, PipeListener};

#[cfg(windows)]
pub(crate) use windows_impl::{connect, PipeListener};

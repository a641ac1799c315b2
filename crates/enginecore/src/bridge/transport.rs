//! Socket transport for the client-worker channel pair.
//!
//! Each client creates two fresh endpoints (request + response) whose names
//! embed the pid and a UUID, so concurrent clients on one host never collide.
//! Platform-specific addressing:
//! - **Named**: filesystem sockets in a private temp directory (macOS, Linux, BSD)
//! - **Abstract**: Linux abstract namespace (no filesystem, auto-cleanup)
//!
//! The parent binds, the worker connects.

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Environment variable carrying the JSON `EndpointPair` to worker processes.
pub const ENDPOINTS_ENV: &str = "ENGINECORE_ENDPOINTS";

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Address of one local channel endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Endpoint {
    Named {
        path: PathBuf,
    },
    #[cfg(target_os = "linux")]
    Abstract {
        name: String,
    },
}

impl Endpoint {
    fn bind(&self) -> io::Result<UnixListener> {
        match self {
            Self::Named { path } => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                UnixListener::bind(path)
            }
            #[cfg(target_os = "linux")]
            Self::Abstract { name } => {
                use std::os::linux::net::SocketAddrExt;
                use std::os::unix::net::SocketAddr;

                let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
                UnixListener::bind_addr(&addr)
            }
        }
    }

    /// Connect with a blocking std stream.
    pub fn connect_std(&self) -> io::Result<UnixStream> {
        match self {
            Self::Named { path } => UnixStream::connect(path),
            #[cfg(target_os = "linux")]
            Self::Abstract { name } => {
                use std::os::linux::net::SocketAddrExt;
                use std::os::unix::net::SocketAddr;

                let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
                UnixStream::connect_addr(&addr)
            }
        }
    }

    /// Connect from inside a Tokio runtime.
    pub async fn connect(&self) -> io::Result<tokio::net::UnixStream> {
        match self {
            Self::Named { path } => tokio::net::UnixStream::connect(path).await,
            #[cfg(target_os = "linux")]
            Self::Abstract { .. } => {
                // tokio doesn't support abstract sockets directly
                let std_stream = self.connect_std()?;
                std_stream.set_nonblocking(true)?;
                tokio::net::UnixStream::from_std(std_stream)
            }
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Named { path } => write!(f, "unix:{}", path.display()),
            #[cfg(target_os = "linux")]
            Self::Abstract { name } => write!(f, "unix:@{}", name),
        }
    }
}

/// The two endpoints a worker connects to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPair {
    /// Client → worker.
    pub input: Endpoint,
    /// Worker → client.
    pub output: Endpoint,
}

impl EndpointPair {
    pub fn to_env_value(&self) -> io::Result<String> {
        serde_json::to_string(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn from_env_value(value: &str) -> io::Result<Self> {
        serde_json::from_str(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Read the pair a parent passed through `ENGINECORE_ENDPOINTS`.
    pub fn from_env() -> io::Result<Self> {
        let value = std::env::var(ENDPOINTS_ENV).map_err(|_| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not set (was this process spawned by a client?)", ENDPOINTS_ENV),
            )
        })?;
        Self::from_env_value(&value)
    }
}

fn unique_stem() -> String {
    format!(
        "enginecore-{}-{}",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Parent-side transport context: bound listeners plus any filesystem state.
///
/// Dropping the context closes the listeners and removes the socket directory.
pub struct TransportContext {
    dir: Option<PathBuf>,
    input_listener: Option<UnixListener>,
    output_listener: Option<UnixListener>,
}

impl TransportContext {
    /// Create using platform default (abstract on Linux, named elsewhere).
    pub fn create() -> io::Result<(Self, EndpointPair)> {
        #[cfg(target_os = "linux")]
        {
            Self::create_abstract()
        }

        #[cfg(not(target_os = "linux"))]
        {
            Self::create_named()
        }
    }

    /// Filesystem sockets: `{temp_dir}/enginecore-{pid}-{uuid}/{input,output}.sock`
    pub fn create_named() -> io::Result<(Self, EndpointPair)> {
        let dir = std::env::temp_dir().join(unique_stem());
        std::fs::create_dir_all(&dir)?;

        let endpoints = EndpointPair {
            input: Endpoint::Named {
                path: dir.join("input.sock"),
            },
            output: Endpoint::Named {
                path: dir.join("output.sock"),
            },
        };
        // Remove the directory if binding fails below.
        let mut context = Self {
            dir: Some(dir),
            input_listener: None,
            output_listener: None,
        };
        context.bind(&endpoints)?;
        Ok((context, endpoints))
    }

    #[cfg(target_os = "linux")]
    pub fn create_abstract() -> io::Result<(Self, EndpointPair)> {
        let stem = unique_stem();
        let endpoints = EndpointPair {
            input: Endpoint::Abstract {
                name: format!("{}-input", stem),
            },
            output: Endpoint::Abstract {
                name: format!("{}-output", stem),
            },
        };
        let mut context = Self {
            dir: None,
            input_listener: None,
            output_listener: None,
        };
        context.bind(&endpoints)?;
        Ok((context, endpoints))
    }

    fn bind(&mut self, endpoints: &EndpointPair) -> io::Result<()> {
        tracing::debug!(
            input = %endpoints.input,
            output = %endpoints.output,
            "Binding channel endpoints"
        );
        self.input_listener = Some(endpoints.input.bind()?);
        self.output_listener = Some(endpoints.output.bind()?);
        Ok(())
    }

    /// Accept the worker's connections: returns `(input, output)` streams.
    ///
    /// Fails with `TimedOut` if the worker has not connected both channels
    /// within `timeout`.
    pub fn accept(&mut self, timeout: Duration) -> io::Result<(UnixStream, UnixStream)> {
        let deadline = Instant::now() + timeout;
        let input = accept_before(listener(&self.input_listener)?, deadline)?;
        let output = accept_before(listener(&self.output_listener)?, deadline)?;

        self.input_listener = None;
        self.output_listener = None;
        tracing::trace!("Worker connected to both channels");
        Ok((input, output))
    }

    pub fn cleanup(&mut self) -> io::Result<()> {
        self.input_listener = None;
        self.output_listener = None;
        if let Some(dir) = self.dir.take()
            && dir.exists()
        {
            tracing::debug!(dir = %dir.display(), "Cleaning up socket directory");
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

impl Drop for TransportContext {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "Failed to cleanup socket directory");
        }
    }
}

fn listener(slot: &Option<UnixListener>) -> io::Result<&UnixListener> {
    slot.as_ref().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotConnected,
            "transport listeners already consumed",
        )
    })
}

fn accept_before(listener: &UnixListener, deadline: Instant) -> io::Result<UnixStream> {
    listener.set_nonblocking(true)?;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "worker did not connect to the channel endpoints",
                    ));
                }
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn endpoint_pair_roundtrips_through_env_value() {
        let pair = EndpointPair {
            input: Endpoint::Named {
                path: PathBuf::from("/tmp/enginecore-1/input.sock"),
            },
            output: Endpoint::Named {
                path: PathBuf::from("/tmp/enginecore-1/output.sock"),
            },
        };
        let value = pair.to_env_value().unwrap();
        assert_eq!(EndpointPair::from_env_value(&value).unwrap(), pair);
    }

    #[test]
    fn each_context_gets_fresh_endpoints() {
        let (_a, first) = TransportContext::create().unwrap();
        let (_b, second) = TransportContext::create().unwrap();
        assert_ne!(first.input, second.input);
        assert_ne!(first.output, second.output);
        assert_ne!(first.input, first.output);
    }

    #[test]
    fn named_context_connects_and_cleans_up() {
        let (mut context, endpoints) = TransportContext::create_named().unwrap();
        let Endpoint::Named { path } = &endpoints.input else {
            panic!("expected named endpoint");
        };
        let dir = path.parent().unwrap().to_path_buf();
        assert!(dir.exists());

        let mut worker_in = endpoints.input.connect_std().unwrap();
        let mut worker_out = endpoints.output.connect_std().unwrap();
        let (mut input, mut output) = context.accept(Duration::from_secs(5)).unwrap();

        input.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        worker_in.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        worker_out.write_all(b"pong").unwrap();
        output.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");

        drop(context);
        assert!(!dir.exists());
    }

    #[test]
    fn accept_times_out_without_worker() {
        let (mut context, _endpoints) = TransportContext::create().unwrap();
        let err = context.accept(Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn async_connect_reaches_listener() {
        use tokio::io::AsyncWriteExt;

        let (mut context, endpoints) = TransportContext::create().unwrap();
        let mut worker_in = endpoints.input.connect().await.unwrap();
        let _worker_out = endpoints.output.connect().await.unwrap();
        let (mut input, _output) = context.accept(Duration::from_secs(5)).unwrap();

        worker_in.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        input.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }
}

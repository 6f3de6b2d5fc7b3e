//! Socket connector: framed TCP or Unix-domain link to a broker.
//!
//! Dials at handshake time using the connect options, retrying while the
//! broker may still be starting, then runs one read loop and one writer
//! task. Writes are queued, so per-link ordering follows post order.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

use super::{Connector, ConnectorSink, HandshakeInfo};
use crate::command::{Args, Command, ProcessInfo, ProcessKind};
use crate::config::BusOptions;
use crate::error::{BusError, Result};
use crate::packet::{Frame, FrameStream};

/// Delay between dial attempts within the connect timeout window.
const DIAL_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Client end of a framed socket link.
pub struct SocketConnector {
    kind: ProcessKind,
    link: Mutex<Option<Link>>,
}

struct Link {
    frames: mpsc::UnboundedSender<Frame>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl SocketConnector {
    pub fn new(kind: ProcessKind) -> Self {
        Self {
            kind,
            link: Mutex::new(None),
        }
    }

    async fn dial_once(options: &BusOptions) -> io::Result<Box<dyn FrameStream>> {
        if let Some(path) = &options.path {
            #[cfg(unix)]
            {
                let stream = UnixStream::connect(path).await?;
                return Ok(Box::new(stream));
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix domain sockets are not available on this platform",
                ));
            }
        }
        // validate() guarantees a port when there is no path
        let port = options.port.unwrap_or_default();
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    /// Queue a pre-encoded frame.
    pub(crate) async fn post_frame(&self, frame: Frame) -> Result<()> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(BusError::NotConnected)?;
        trace!(bytes = frame.wire_len(), "Posting frame");
        link.frames.send(frame).map_err(|_| BusError::NotConnected)?;
        Ok(())
    }

    /// Dial with retries until the connect timeout elapses. A refused
    /// connection during broker startup is expected, not fatal.
    async fn dial(options: &BusOptions) -> Result<Box<dyn FrameStream>> {
        let deadline = Instant::now() + options.connect_timeout();
        loop {
            match Self::dial_once(options).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    if Instant::now() + DIAL_RETRY_DELAY >= deadline {
                        return Err(BusError::Connection(format!(
                            "could not reach broker within {:?}: {e}",
                            options.connect_timeout()
                        )));
                    }
                    debug!(error = %e, "Dial attempt failed, retrying");
                    sleep(DIAL_RETRY_DELAY).await;
                }
            }
        }
    }
}

#[async_trait]
impl Connector for SocketConnector {
    fn process_kind(&self) -> ProcessKind {
        self.kind
    }

    async fn handshake(
        &self,
        sink: Arc<dyn ConnectorSink>,
        options: &BusOptions,
    ) -> Result<HandshakeInfo> {
        options.validate()?;
        if !options.has_socket() {
            return Err(BusError::InvalidOptions(
                "socket connector needs a port or a path".into(),
            ));
        }
        let mut link = self.link.lock().await;
        if link.is_none() {
            let stream = Self::dial(options).await?;
            let (reader, writer) = tokio::io::split(stream);
            let (tx, rx) = mpsc::unbounded_channel();
            *link = Some(Link {
                frames: tx,
                read_task: tokio::spawn(read_loop(reader, sink)),
                write_task: tokio::spawn(write_loop(rx, writer)),
            });
            info!(kind = %self.kind, "Socket link established");
        }
        Ok(HandshakeInfo {
            process: ProcessInfo::current(self.kind),
        })
    }

    async fn post_command(&self, command: Command, args: Args) -> Result<()> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(BusError::NotConnected)?;
        let frame = Frame::encode(&command, args.as_slice())?;
        trace!(channel = %command.channel, bytes = frame.wire_len(), "Posting frame");
        link.frames.send(frame).map_err(|_| BusError::NotConnected)?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(link) = self.link.lock().await.take() {
            // Locally requested close: kill the reader first so no
            // on_closed callback fires, then let the writer drain.
            link.read_task.abort();
            drop(link.frames);
            let _ = link.write_task.await;
            info!("Socket link closed");
        }
        Ok(())
    }
}

async fn read_loop(mut reader: ReadHalf<Box<dyn FrameStream>>, sink: Arc<dyn ConnectorSink>) {
    loop {
        match Frame::read_from(&mut reader).await {
            Ok(Some(frame)) => match frame.decode() {
                Ok((command, args)) => sink.on_command(command, Arc::new(args)).await,
                Err(e) => warn!(error = %e, "Dropping undecodable frame"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Socket read failed");
                break;
            }
        }
    }
    sink.on_closed().await;
}

async fn write_loop(
    mut frames: mpsc::UnboundedReceiver<Frame>,
    mut writer: WriteHalf<Box<dyn FrameStream>>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = frame.write_to(&mut writer).await {
            warn!(error = %e, "Socket write failed");
            break;
        }
    }
}

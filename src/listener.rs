//! Connection Listeners
//!
//! Accepts clients on a unix socket (local) and optionally on TCP (remote).
//! Each connection gets a reader task that decodes framed requests into the
//! request loop's inbound channel and a writer task that frames whatever
//! the server queues for that client.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use xdix_proto::{FramedMessage, Request, ServerMessage, MAX_FRAME_LEN};

use crate::dix::ClientId;

/// Everything the request loop hears from the transports
#[derive(Debug)]
pub enum Inbound {
    Connected {
        client: ClientId,
        local: bool,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    },
    Request {
        client: ClientId,
        request: Request,
    },
    /// A frame that did not decode; answered with BadRequest
    Malformed {
        client: ClientId,
        reason: String,
    },
    Disconnected {
        client: ClientId,
    },
}

/// Bind the local socket, replacing a stale one
pub fn listen_unix(path: &Path, inbound: mpsc::Sender<Inbound>) -> Result<JoinHandle<()>> {
    if path.exists() {
        std::fs::remove_file(path).context("Failed to remove stale socket")?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }
    let listener = UnixListener::bind(path).context("Failed to bind unix socket")?;
    info!("Listening for local clients on {:?}", path);

    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(handle_client(stream, true, inbound.clone()));
                }
                Err(e) => error!("Unix accept error: {}", e),
            }
        }
    }))
}

/// Remote clients; the trusted-transport gate refuses them direct rendering
pub async fn listen_tcp(addr: &str, inbound: mpsc::Sender<Inbound>) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind TCP listener on {}", addr))?;
    info!("Listening for remote clients on {}", addr);

    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("TCP connection from {}", peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {}", e);
                    }
                    tokio::spawn(handle_client(stream, false, inbound.clone()));
                }
                Err(e) => error!("TCP accept error: {}", e),
            }
        }
    }))
}

async fn handle_client<S>(stream: S, local: bool, inbound: mpsc::Sender<Inbound>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let client = ClientId::next();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
    if inbound
        .send(Inbound::Connected {
            client,
            local,
            outbound,
        })
        .await
        .is_err()
    {
        return;
    }

    let (mut reader, mut writer) = tokio::io::split(stream);

    // client → server
    let requests = inbound.clone();
    let mut reader_task = tokio::spawn(async move {
        let mut len_buf = [0u8; 4];
        loop {
            if reader.read_exact(&mut len_buf).await.is_err() {
                break;
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            if len > MAX_FRAME_LEN {
                warn!("Frame too large: {} bytes", len);
                break;
            }

            let mut msg_buf = vec![0u8; len];
            if reader.read_exact(&mut msg_buf).await.is_err() {
                break;
            }

            let msg = match FramedMessage::decode_request(&msg_buf) {
                Ok(request) => Inbound::Request { client, request },
                Err(e) => Inbound::Malformed {
                    client,
                    reason: e.to_string(),
                },
            };
            if requests.send(msg).await.is_err() {
                break;
            }
        }
        debug!("Reader task ended");
    });

    // server → client
    let mut writer_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            match FramedMessage::new(&msg) {
                Ok(frame) => {
                    if writer.write_all(&frame.encode()).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to encode message: {}", e),
            }
        }
        debug!("Writer task ended");
    });

    tokio::select! {
        _ = &mut reader_task => writer_task.abort(),
        _ = &mut writer_task => reader_task.abort(),
    }

    let _ = inbound.send(Inbound::Disconnected { client }).await;
}

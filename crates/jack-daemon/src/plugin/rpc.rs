// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! The plugin RPC transport: one JSON object per line over the
//! child's stdin/stdout, multiplexed by request id. A reader task owns the
//! read half and demuxes replies to pending callers by id; callers hold only
//! a cloneable handle into a shared map of outstanding calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use jack_types::{RpcEnvelope, RpcReply, RpcRequest};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, oneshot};
use tokio::time::{Duration, timeout};
use tracing::{debug, warn};

use crate::framing::{self, FramingError};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] FramingError),

    #[error("call deadline exceeded")]
    DeadlineExceeded,

    #[error("plugin returned an error: {0}")]
    Remote(String),

    #[error("rpc channel closed")]
    Closed,
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<RpcReply>>>;

/// A handle to one plugin's RPC transport. Cloning shares the same pending
/// table and writer; the underlying child process and reader task are owned
/// by the [`super::process::PluginProcess`] that created this client.
#[derive(Clone)]
pub struct RpcClient {
    next_id: Arc<AtomicU64>,
    pending: Arc<PendingMap>,
    writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl RpcClient {
    /// Build a client around a writer half and spawn the reader task that
    /// demultiplexes replies from `reader` by id for as long as the
    /// transport stays open.
    pub fn spawn<R, W>(reader: R, writer: W) -> Self
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let client = Self {
            next_id: Arc::new(AtomicU64::new(1)),
            pending: pending.clone(),
            writer: Arc::new(Mutex::new(Box::new(writer))),
        };

        tokio::spawn(Self::reader_loop(BufReader::new(reader), pending));
        client
    }

    async fn reader_loop<R>(mut reader: BufReader<R>, pending: Arc<PendingMap>)
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        loop {
            let reply: RpcReply = match framing::read_frame(&mut reader).await {
                Ok(reply) => reply,
                Err(FramingError::Closed) => {
                    debug!("plugin rpc transport closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "plugin rpc transport read error");
                    break;
                }
            };
            if let Some(tx) = pending.lock().await.remove(&reply.id) {
                let _ = tx.send(reply);
            }
        }
        // Any calls still pending when the transport dies are dropped;
        // their `oneshot::Receiver` will observe a closed channel.
        pending.lock().await.clear();
    }

    /// Issue `request` and wait up to `deadline` for a reply. Each of the
    /// seven RPC methods (plus the handshake) goes through this one path.
    pub async fn call(&self, request: RpcRequest, deadline: Duration) -> Result<serde_json::Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let envelope = RpcEnvelope { id, request };
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = framing::write_frame(&mut *writer, &envelope).await {
                self.pending.lock().await.remove(&id);
                return Err(e.into());
            }
        }

        match timeout(deadline, rx).await {
            Ok(Ok(reply)) => reply.into_result().map_err(RpcError::Remote),
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(RpcError::DeadlineExceeded)
            }
        }
    }

    /// Shut down the write half, closing the plugin's stdin regardless of
    /// how many other clones of this client are still held elsewhere (the
    /// registry's `PluginHandle`, any emitter subscriber) — unlike dropping
    /// a clone, this reaches the underlying pipe directly.
    pub async fn close_write(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

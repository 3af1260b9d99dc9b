//! Stdio server loop: framed requests in, framed responses out.
//!
//! Frames are handled in arrival order. Handshake and listing responses are
//! written before the next frame is read; tool calls run concurrently in a
//! `JoinSet` and their responses are written as they complete. On input EOF
//! the loop stops reading, waits for every in-flight call, then returns.

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::frame::{ContentLengthCodec, DEFAULT_MAX_FRAME_LEN, DEFAULT_MAX_HEADER_LEN};
use crate::bridge::protocol::{RpcError, RpcRequest, RpcResponse};
use crate::dispatcher::{Dispatch, Dispatcher};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_frame_len: usize,
    pub max_header_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_header_len: DEFAULT_MAX_HEADER_LEN,
        }
    }
}

impl ServerConfig {
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    pub fn with_max_header_len(mut self, len: usize) -> Self {
        self.max_header_len = len;
        self
    }
}

/// Serve one connection until input closes and every in-flight call is answered.
///
/// Only a failure to write a response ends the loop early.
pub async fn serve<R, W>(
    input: R,
    output: W,
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let decoder = ContentLengthCodec::new()
        .with_max_frame_len(config.max_frame_len)
        .with_max_header_len(config.max_header_len);
    let mut frames = FramedRead::new(input, decoder);
    let mut responses = FramedWrite::new(output, ContentLengthCodec::new());
    let mut in_flight: JoinSet<Option<RpcResponse>> = JoinSet::new();
    let mut reading = true;

    tracing::info!(tools = dispatcher.registry().len(), "Serving requests");

    loop {
        tokio::select! {
            frame = frames.next(), if reading => match frame {
                Some(Ok(body)) => {
                    if let Some(response) = accept(&dispatcher, &body, &mut in_flight) {
                        write_response(&mut responses, &response).await?;
                    }
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Input stream failed");
                    reading = false;
                }
                None => {
                    tracing::debug!(in_flight = in_flight.len(), "Input closed");
                    reading = false;
                }
            },

            Some(joined) = in_flight.join_next() => match joined {
                Ok(Some(response)) => write_response(&mut responses, &response).await?,
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "Tool call task failed"),
            },

            else => break,
        }
    }

    tracing::info!("Server loop exiting");
    Ok(())
}

/// Parse and dispatch one frame body. Returns the response to write now, if any.
fn accept(
    dispatcher: &Dispatcher,
    body: &[u8],
    in_flight: &mut JoinSet<Option<RpcResponse>>,
) -> Option<RpcResponse> {
    let request = match RpcRequest::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(
                error = %e,
                body = %String::from_utf8_lossy(body),
                "Dropping unparsable message"
            );
            return None;
        }
    };
    tracing::trace!(id = ?request.id, method = %request.method, "Received request");

    match dispatcher.dispatch(request) {
        Dispatch::Ready(response) => response,
        Dispatch::Deferred { id, call } => {
            in_flight.spawn(async move {
                match AssertUnwindSafe(call).catch_unwind().await {
                    Ok(response) => response,
                    Err(_) => {
                        tracing::error!(id = ?id, "Tool handler panicked");
                        id.map(|id| {
                            RpcResponse::failure(
                                id,
                                RpcError::application("internal error: tool handler panicked"),
                            )
                        })
                    }
                }
            });
            None
        }
    }
}

async fn write_response<W>(
    responses: &mut FramedWrite<W, ContentLengthCodec>,
    response: &RpcResponse,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(response).map_err(io::Error::other)?;
    tracing::trace!(id = %response.id, is_error = response.is_error(), "Writing response");
    responses.send(Bytes::from(body)).await
}

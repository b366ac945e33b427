// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Byte-stream view of a WebSocket connection.
//!
//! The tunnel carries the raw SSH stream verbatim inside binary WebSocket
//! frames. [WebSocketByteStream] adapts a tungstenite [WebSocketStream] to
//! `AsyncRead`/`AsyncWrite` so the SSH layer can run over it unchanged.

use std::io::{Error as IoError, ErrorKind};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

fn to_io_error(e: tokio_tungstenite::tungstenite::Error) -> IoError {
  use tokio_tungstenite::tungstenite::Error as WsError;
  match e {
    WsError::ConnectionClosed | WsError::AlreadyClosed => {
      IoError::new(ErrorKind::BrokenPipe, "websocket closed")
    }
    WsError::Io(e) => e,
    other => IoError::new(ErrorKind::Other, other),
  }
}

pub struct WebSocketByteStream<S> {
  ws: WebSocketStream<S>,
  // Unconsumed tail of the most recent binary frame.
  readbuf: Vec<u8>,
  readpos: usize,
  // Fired when the transport reaches end-of-stream or fails, so the owner
  // can observe disconnection without polling.
  closed_signal: CancellationToken,
  write_closed: bool,
}

impl<S> WebSocketByteStream<S>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  pub fn new(ws: WebSocketStream<S>) -> Self {
    Self {
      ws,
      readbuf: Vec::new(),
      readpos: 0,
      closed_signal: CancellationToken::new(),
      write_closed: false,
    }
  }

  /// Token cancelled when the WebSocket reaches end-of-stream or errors.
  pub fn closed_signal(&self) -> CancellationToken {
    self.closed_signal.clone()
  }

  fn fill_from(&mut self, frame: Vec<u8>) {
    self.readbuf = frame;
    self.readpos = 0;
  }

  fn buffered(&self) -> &[u8] {
    &self.readbuf[self.readpos..]
  }
}

impl<S> AsyncRead for WebSocketByteStream<S>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    loop {
      if !this.buffered().is_empty() {
        let n = this.buffered().len().min(buf.remaining());
        buf.put_slice(&this.readbuf[this.readpos..this.readpos + n]);
        this.readpos += n;
        return Poll::Ready(Ok(()));
      }
      match futures::ready!(Pin::new(&mut this.ws).poll_next(cx)) {
        Some(Ok(Message::Binary(data))) => {
          this.fill_from(data);
          // Loop; an empty frame yields nothing to the caller.
        }
        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
          // Tungstenite answers pings internally while the stream is polled.
        }
        Some(Ok(Message::Text(_))) | Some(Ok(Message::Frame(_))) => {
          // The tunnel never sends text frames; discard.
        }
        Some(Ok(Message::Close(_))) | None => {
          this.closed_signal.cancel();
          return Poll::Ready(Ok(()));
        }
        Some(Err(e)) => {
          this.closed_signal.cancel();
          return Poll::Ready(Err(to_io_error(e)));
        }
      }
    }
  }
}

impl<S> AsyncWrite for WebSocketByteStream<S>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IoError>> {
    let this = self.get_mut();
    if this.write_closed {
      return Poll::Ready(Err(IoError::new(
        ErrorKind::BrokenPipe,
        "websocket write half closed",
      )));
    }
    match futures::ready!(Pin::new(&mut this.ws).poll_ready(cx)) {
      Ok(()) => {}
      Err(e) => {
        this.closed_signal.cancel();
        return Poll::Ready(Err(to_io_error(e)));
      }
    }
    match Pin::new(&mut this.ws).start_send(Message::Binary(buf.to_vec())) {
      Ok(()) => Poll::Ready(Ok(buf.len())),
      Err(e) => {
        this.closed_signal.cancel();
        Poll::Ready(Err(to_io_error(e)))
      }
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
    let this = self.get_mut();
    Pin::new(&mut this.ws).poll_flush(cx).map_err(to_io_error)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
    let this = self.get_mut();
    this.write_closed = true;
    match Pin::new(&mut this.ws).poll_close(cx) {
      Poll::Ready(Ok(())) | Poll::Ready(Err(_)) => Poll::Ready(Ok(())),
      Poll::Pending => Poll::Pending,
    }
  }
}

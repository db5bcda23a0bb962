//! AsyncRead/AsyncWrite over a single HTTP/2 stream.
//!
//! Each proxied connection rides one CONNECT stream; this adapter handles
//! the h2 flow-control bookkeeping (capacity reservation on write, window
//! release on read) so the rest of the code can treat it as a socket.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub struct H2Stream {
	read: H2Read,
	write: H2Write,
}

impl H2Stream {
	pub fn new(recv: h2::RecvStream, send: h2::SendStream<Bytes>) -> Self {
		H2Stream {
			read: H2Read {
				recv,
				buf: Bytes::new(),
			},
			write: H2Write { send },
		}
	}
}

struct H2Read {
	recv: h2::RecvStream,
	buf: Bytes,
}

struct H2Write {
	send: h2::SendStream<Bytes>,
}

fn h2_io_err(e: h2::Error) -> io::Error {
	if e.is_io() {
		return e.into_io().expect("checked is_io");
	}
	io::Error::other(e)
}

impl AsyncRead for H2Stream {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		out: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let this = &mut self.read;
		loop {
			if !this.buf.is_empty() {
				let n = this.buf.len().min(out.remaining());
				out.put_slice(&this.buf[..n]);
				this.buf.advance(n);
				// Releasing as we consume keeps the sender's window moving
				// at the pace of the actual reader.
				let _ = this.recv.flow_control().release_capacity(n);
				return Poll::Ready(Ok(()));
			}
			match ready!(this.recv.poll_data(cx)) {
				Some(Ok(data)) => {
					this.buf = data;
				},
				Some(Err(e)) => return Poll::Ready(Err(h2_io_err(e))),
				None => return Poll::Ready(Ok(())),
			}
		}
	}
}

impl AsyncWrite for H2Stream {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		data: &[u8],
	) -> Poll<io::Result<usize>> {
		let this = &mut self.write;
		this.send.reserve_capacity(data.len());
		match ready!(this.send.poll_capacity(cx)) {
			Some(Ok(0)) => {
				// Window moved without usable capacity; ask again.
				cx.waker().wake_by_ref();
				Poll::Pending
			},
			Some(Ok(capacity)) => {
				let n = capacity.min(data.len());
				this
					.send
					.send_data(Bytes::copy_from_slice(&data[..n]), false)
					.map_err(h2_io_err)?;
				Poll::Ready(Ok(n))
			},
			Some(Err(e)) => Poll::Ready(Err(h2_io_err(e))),
			None => Poll::Ready(Err(io::Error::new(
				io::ErrorKind::BrokenPipe,
				"h2 stream closed",
			))),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		// h2 has no explicit flush; frames are pushed as they are sent.
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		// Half-close; errors here mean the stream is already gone.
		let _ = self.write.send.send_data(Bytes::new(), true);
		Poll::Ready(Ok(()))
	}
}

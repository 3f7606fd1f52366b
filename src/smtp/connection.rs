//! Per-connection byte loop: framing, reply writing, and the STARTTLS
//! upgrade. Grounded on the teacher's `smtp/connection.rs` (`read_line`,
//! `read_buf`, `write_reply`, the `SessionReply` dispatch loop); the
//! teacher only ever ran inside an already-established TLS stream, so the
//! plaintext/TLS stream abstraction and the STARTTLS branch are new.

use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use smtp_proto::Request;
use thiserror::Error;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tokio_rustls::{TlsAcceptor, server::TlsStream};
use tracing::{debug, info, trace};

use crate::smtp::session::{AuthContinuation, DataReply, SessionReply, SmtpSession};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to accept connection: {0}")]
    Accept(io::Error),
    #[error("failed to write tcp stream: {0}")]
    Write(io::Error),
    #[error("failed to read tcp stream: {0}")]
    Read(io::Error),
    #[error("connection dropped unexpectedly")]
    Dropped,
    #[error("connection timed out waiting for the client")]
    Timeout,
}

const BUFFER_SIZE: usize = 4096;
const CODE_READY: u16 = 220;

/// Either a bare TCP connection or one upgraded to TLS, so a single
/// connection can switch mid-stream on STARTTLS.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Drives one connection end to end. `implicit_tls` skips straight past the
/// plaintext banner into a TLS handshake before the loop starts (port 465
/// style); otherwise the connection starts plaintext and may upgrade via
/// STARTTLS.
#[allow(clippy::too_many_arguments)]
pub async fn handle(
    stream: TcpStream,
    peer_addr: SocketAddr,
    server_name: &str,
    acceptor: TlsAcceptor,
    implicit_tls: bool,
    mut session: SmtpSession,
    connection_timeout: Duration,
    data_timeout: Duration,
) -> Result<(), ConnectionError> {
    let initial = if implicit_tls {
        let tls = acceptor
            .accept(stream)
            .await
            .map_err(ConnectionError::Accept)?;
        session.mark_tls();
        MaybeTlsStream::Tls(Box::new(tls))
    } else {
        MaybeTlsStream::Plain(stream)
    };

    trace!("handling connection with {peer_addr}");

    let mut reader = BufReader::with_capacity(BUFFER_SIZE, initial);
    let mut buffer = Vec::with_capacity(BUFFER_SIZE);

    write_reply(CODE_READY, &format!("{server_name} ESMTP ready"), &mut reader).await?;

    'session: loop {
        timeout(connection_timeout, read_line(&mut reader, &mut buffer)).await?;

        let request = Request::parse(&mut buffer.iter());
        let reply = session.handle(request).await;

        match reply {
            SessionReply::ReplyAndContinue(code, message) => {
                write_reply(code, &message, &mut reader).await?;
            }
            SessionReply::ReplyAndStop(code, message) => {
                write_reply(code, &message, &mut reader).await?;
                break 'session;
            }
            SessionReply::RawReply(buf) => {
                reader.write_all(&buf).await.map_err(ConnectionError::Write)?;
            }
            SessionReply::StartTls(code, message) => {
                write_reply(code, &message, &mut reader).await?;

                // Discard anything still buffered: RFC 3207 requires
                // dropping unconsumed plaintext to rule out command
                // injection across the TLS boundary.
                let MaybeTlsStream::Plain(plain) = reader.into_inner() else {
                    unreachable!("STARTTLS only offered on a plaintext stream");
                };
                let tls = acceptor
                    .accept(plain)
                    .await
                    .map_err(ConnectionError::Accept)?;
                session.mark_tls();
                reader = BufReader::with_capacity(BUFFER_SIZE, MaybeTlsStream::Tls(Box::new(tls)));
            }
            SessionReply::IngestData(code, message) => {
                write_reply(code, &message, &mut reader).await?;

                loop {
                    timeout(data_timeout, read_buf(&mut reader, &mut buffer)).await?;

                    match session.handle_data(&buffer).await {
                        DataReply::ContinueIngest => continue,
                        DataReply::ReplyAndContinue(code, message) => {
                            write_reply(code, &message, &mut reader).await?;
                            continue 'session;
                        }
                    }
                }
            }
            SessionReply::IngestAuth(code, message, continuation) => {
                write_reply(code, &message, &mut reader).await?;
                let mut continuation = continuation;

                loop {
                    timeout(connection_timeout, read_line(&mut reader, &mut buffer)).await?;
                    let trimmed_len = buffer.trim_ascii_end().len();
                    buffer.truncate(trimmed_len);

                    match continue_auth(&mut session, continuation, &buffer).await {
                        SessionReply::IngestAuth(code, message, next) => {
                            write_reply(code, &message, &mut reader).await?;
                            continuation = next;
                        }
                        SessionReply::ReplyAndContinue(code, message) => {
                            write_reply(code, &message, &mut reader).await?;
                            break;
                        }
                        SessionReply::ReplyAndStop(code, message) => {
                            write_reply(code, &message, &mut reader).await?;
                            break 'session;
                        }
                        _ => unreachable!("AUTH continuation only yields reply/ingest variants"),
                    }
                }
            }
        }
    }

    info!("connection handled");
    Ok(())
}

async fn continue_auth(
    session: &mut SmtpSession,
    continuation: AuthContinuation,
    line: &[u8],
) -> SessionReply {
    match continuation {
        AuthContinuation::Plain => {
            let mut line = line.to_vec();
            let (code, message) = session.handle_plain_auth(&mut line).await;
            SessionReply::ReplyAndContinue(code, message)
        }
        AuthContinuation::LoginUsername => session.handle_login_username(line).await,
        AuthContinuation::LoginPassword { username } => {
            let (code, message) = session.handle_login_password(&username, line).await;
            SessionReply::ReplyAndContinue(code, message)
        }
        AuthContinuation::CramMd5 { challenge } => {
            let (code, message) = session.handle_cram_md5_response(&challenge, line).await;
            SessionReply::ReplyAndContinue(code, message)
        }
    }
}

/// Bounds a read future by `connection_timeout`/`data_timeout`, surfacing
/// an expired deadline as [`ConnectionError::Timeout`].
async fn timeout<T>(
    duration: Duration,
    fut: impl Future<Output = Result<T, ConnectionError>>,
) -> Result<T, ConnectionError> {
    tokio::time::timeout(duration, fut)
        .await
        .unwrap_or(Err(ConnectionError::Timeout))
}

async fn read_buf(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
) -> Result<usize, ConnectionError> {
    buffer.clear();
    reader
        .take(BUFFER_SIZE as u64)
        .read_buf(buffer)
        .await
        .map_err(ConnectionError::Read)
        .and_then(|size| if size > 0 { Ok(size) } else { Err(ConnectionError::Dropped) })
}

async fn read_line(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
) -> Result<usize, ConnectionError> {
    buffer.clear();
    reader
        .take(BUFFER_SIZE as u64)
        .read_until(b'\n', buffer)
        .await
        .map_err(ConnectionError::Read)
        .and_then(|size| if size > 0 { Ok(size) } else { Err(ConnectionError::Dropped) })
}

async fn write_reply(
    code: u16,
    message: &str,
    mut sink: impl AsyncWriteExt + Unpin,
) -> Result<(), ConnectionError> {
    let n = sink
        .write(format!("{code} {message}\r\n").as_bytes())
        .await
        .map_err(ConnectionError::Write)?;

    if n < 256 {
        debug!("sent: {code} {message}");
    } else {
        trace!("sent {n} bytes");
    }

    Ok(())
}

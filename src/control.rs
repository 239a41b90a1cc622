//! Unix control socket for local helpers.
//!
//! The per-connection protocol is line-oriented, then raw: a `write` or
//! `sendfile` line, a destination line, for files a filename line, and the
//! payload until EOF. Parsed requests are forwarded into the session loop
//! over a channel so the Slack client is only ever driven from there.

use std::path::PathBuf;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub enum ControlRequest {
    /// Post a message as if another client had sent it; it comes back to
    /// IRC through the RTM echo.
    Write { dest: String, text: String },
    /// Upload a file; `reply` carries success back to the caller.
    SendFile {
        dest: String,
        filename: String,
        content: Vec<u8>,
        reply: oneshot::Sender<bool>,
    },
}

/// Accept loop. Each connection is parsed on its own task; the session loop
/// receives the requests through `tx`.
pub async fn listen(path: PathBuf, tx: mpsc::Sender<ControlRequest>) {
    // A previous run may have left the socket file behind
    let _ = std::fs::remove_file(&path);
    let listener = match UnixListener::bind(&path) {
        Ok(l) => l,
        Err(e) => {
            error!("unable to bind control socket {}: {e}", path.display());
            return;
        }
    };
    info!("control socket listening at {}", path.display());

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    if let Err(e) = handle_conn(BufReader::new(reader), writer, tx).await {
                        debug!("control connection error: {e}");
                    }
                });
            }
            Err(e) => {
                warn!("control socket accept failed: {e}");
                return;
            }
        }
    }
}

async fn read_trimmed_line(
    reader: &mut (impl AsyncBufRead + Unpin),
) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

/// One control connection. Unknown commands are ignored; malformed input
/// just closes the connection.
async fn handle_conn(
    mut reader: impl AsyncBufRead + Unpin,
    mut writer: impl AsyncWrite + Unpin,
    tx: mpsc::Sender<ControlRequest>,
) -> std::io::Result<()> {
    let Some(command) = read_trimmed_line(&mut reader).await? else {
        return Ok(());
    };
    match command.as_str() {
        "write" => {
            let Some(dest) = read_trimmed_line(&mut reader).await? else {
                return Ok(());
            };
            if dest.is_empty() {
                return Ok(());
            }
            let mut body = Vec::new();
            reader.read_to_end(&mut body).await?;
            let text = String::from_utf8_lossy(&body).into_owned();
            let _ = tx.send(ControlRequest::Write { dest, text }).await;
        }
        "sendfile" => {
            let Some(dest) = read_trimmed_line(&mut reader).await? else {
                return Ok(());
            };
            let Some(filename) = read_trimmed_line(&mut reader).await? else {
                return Ok(());
            };
            if dest.is_empty() || filename.is_empty() {
                return Ok(());
            }
            let mut content = Vec::new();
            reader.read_to_end(&mut content).await?;

            let (reply_tx, reply_rx) = oneshot::channel();
            let sent = tx
                .send(ControlRequest::SendFile {
                    dest,
                    filename,
                    content,
                    reply: reply_tx,
                })
                .await
                .is_ok();
            let ok = sent && reply_rx.await.unwrap_or(false);
            writer.write_all(if ok { b"ok" } else { b"fail" }).await?;
            writer.flush().await?;
        }
        other => {
            debug!("ignoring unknown control command {other:?}");
        }
    }
    Ok(())
}

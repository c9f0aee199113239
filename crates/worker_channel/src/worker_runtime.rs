//! Worker side of the control channel.
//!
//! A worker writes notifications to **stdout** and reads control requests from
//! **stdin**. Anything else a worker wants to print must go to stderr or a log
//! file, otherwise the master would try to parse it.

use anyhow::Result;
use serde_json::json;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::jsonrpc::Request;
use crate::message::{Method, WorkerReadyParams};

/// Writes one notification line to `out`.
pub async fn write_notification<W: AsyncWrite + Unpin>(out: &mut W, req: &Request) -> Result<()> {
    out.write_all(req.to_line()?.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

/// Tells the master that the internal HTTP surface listens on `port`.
pub async fn announce_ready(port: u16) -> Result<()> {
    let params = serde_json::to_value(WorkerReadyParams { port })?;
    let req = Request::notification(Method::WorkerReady, Some(params));
    write_notification(&mut io::stdout(), &req).await
}

/// Reads control lines until the master asks for a shutdown or the input closes.
pub async fn wait_for_shutdown<R: AsyncBufRead + Unpin>(input: R) {
    let mut lines = input.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Request>(&line) {
                    Ok(req) => match req.method() {
                        Some(Method::Shutdown) => {
                            info!("shutdown requested by master");
                            return;
                        }
                        _ => warn!(method = %req.method, "unsupported control request"),
                    },
                    Err(e) => warn!("invalid control line: {e}"),
                }
            }
            Ok(None) => {
                info!("control channel closed");
                return;
            }
            Err(e) => {
                warn!("control channel error: {e}");
                return;
            }
        }
    }
}

/// Spawns a stdin listener; the receiver resolves once the worker should stop.
pub fn listen_stdin() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        wait_for_shutdown(BufReader::new(io::stdin())).await;
        let _ = tx.send(());
    });
    rx
}

/// The request the master sends to stop a worker gracefully.
pub fn shutdown_request() -> Request {
    Request::notification(Method::Shutdown, Some(json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn shutdown_line_stops_the_listener() {
        let (mut master, worker) = duplex(1024);
        let listener = tokio::spawn(wait_for_shutdown(BufReader::new(worker)));

        master.write_all(b"garbage\n").await.unwrap();
        write_notification(&mut master, &shutdown_request())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), listener)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn closed_input_stops_the_listener() {
        let (master, worker) = duplex(64);
        drop(master);
        tokio::time::timeout(
            Duration::from_secs(2),
            wait_for_shutdown(BufReader::new(worker)),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn notification_is_one_json_line() {
        let (mut a, mut b) = duplex(1024);
        let req = Request::notification(Method::WorkerReady, Some(json!({"port": 3005})));
        write_notification(&mut a, &req).await.unwrap();
        drop(a);
        let mut out = String::new();
        b.read_to_string(&mut out).await.unwrap();
        let parsed: Request = serde_json::from_str(out.trim_end()).unwrap();
        assert_eq!(parsed.params.unwrap()["port"], 3005);
    }
}

//! Backend stdout/stderr forwarding.
//!
//! Stdout lines that hold a [`BackendEvent`] are forwarded to the pub/sub
//! pump; every other line is logged under the `backend` target.

use super::launcher::BackendOutput;
use crate::event::BackendEvent;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Spawns one reader task per pipe. Both end at EOF.
pub(crate) fn spawn_output_pump(
    output: BackendOutput,
    events: Option<mpsc::Sender<BackendEvent>>,
    pid: Option<u32>,
) -> [JoinHandle<()>; 2] {
    let stdout = tokio::spawn(pump_stdout(output.stdout, events, pid));
    let stderr = tokio::spawn(pump_stderr(output.stderr, pid));
    [stdout, stderr]
}

async fn pump_stdout(
    reader: Box<dyn AsyncRead + Send + Unpin>,
    events: Option<mpsc::Sender<BackendEvent>>,
    pid: Option<u32>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(target: "backend", ?pid, error = %e, "stdout read failed");
                break;
            }
        };

        match (BackendEvent::from_line(&line), &events) {
            (Some(event), Some(tx)) => {
                if tx.send(event).await.is_err() {
                    debug!(?pid, "Event pump closed, dropping backend event");
                }
            }
            _ => info!(target: "backend", ?pid, "{line}"),
        }
    }
    debug!(?pid, "Backend stdout closed");
}

async fn pump_stderr(reader: Box<dyn AsyncRead + Send + Unpin>, pid: Option<u32>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(target: "backend", ?pid, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn output(stdout: &'static [u8], stderr: &'static [u8]) -> BackendOutput {
        BackendOutput {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }

    #[tokio::test]
    async fn event_lines_are_forwarded_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let stdout = b"starting server\n{\"topic\":\"a\",\"payload\":1}\nnoise\n{\"topic\":\"b\",\"payload\":2}\n";
        let [out, err] = spawn_output_pump(output(stdout, b"oops\n"), Some(tx), Some(42));
        out.await.expect("stdout pump should finish");
        err.await.expect("stderr pump should finish");

        let first = rx.recv().await.expect("first event");
        let second = rx.recv().await.expect("second event");
        assert_eq!(first, BackendEvent::new("a", json!(1)));
        assert_eq!(second, BackendEvent::new("b", json!(2)));
        assert!(rx.recv().await.is_none(), "sender dropped after EOF");
    }

    #[tokio::test]
    async fn without_event_sink_lines_are_only_logged() {
        let [out, err] = spawn_output_pump(
            output(b"{\"topic\":\"a\",\"payload\":1}\n", b""),
            None,
            None,
        );
        out.await.expect("stdout pump should finish");
        err.await.expect("stderr pump should finish");
    }
}

use crate::handler::{DaemonState, handle_command};
use crate::shutdown::ShutdownReason;
use anyhow::Result;
use chatline::protocol::{Command, MAX_LINE_BYTES, ProtocolError, Response};
use chatline::transport::{IpcListener, IpcReader, IpcWriter};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::codec::{
    AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead, FramedWrite, LinesCodec,
};

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept client connections until shutdown is requested. The listener is
/// dropped on return, so no further connections are accepted.
pub async fn serve(state: Arc<DaemonState>, listener: IpcListener) -> Result<()> {
    tracing::info!(endpoint = %listener.endpoint(), "IPC server listening");

    loop {
        let accepted = tokio::select! {
            _ = state.shutdown.requested() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((r, w)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(state, r, w).await {
                        tracing::debug!(err = %e, "client disconnected");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(err = %e, "failed to accept client connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    tracing::info!("IPC server stopped accepting connections");
    Ok(())
}

/// Newline framing over raw bytes; each line is checked for UTF-8 on its own.
fn request_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), MAX_LINE_BYTES)
}

/// Serve one client: one response line per request line, in order.
async fn handle_client(state: Arc<DaemonState>, r: IpcReader, w: IpcWriter) -> Result<()> {
    let mut reader = FramedRead::new(r, request_codec());
    let mut writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    loop {
        let next = tokio::select! {
            _ = state.shutdown.requested() => break,
            next = reader.next() => next,
        };
        let frame = match next {
            None => break,
            Some(Ok(frame)) => frame,
            Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                tracing::warn!(limit = MAX_LINE_BYTES, "request too large, closing connection");
                send(&mut writer, &Response::from(ProtocolError::TooLarge)).await?;
                break;
            }
            Some(Err(AnyDelimiterCodecError::Io(e))) => return Err(e.into()),
        };
        if frame.trim_ascii().is_empty() {
            continue;
        }

        let cmd = match Command::parse_frame(&frame) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::debug!(err = %e, "rejected request");
                send(&mut writer, &Response::from(e)).await?;
                continue;
            }
        };
        state.idle.touch();

        let is_stop = matches!(cmd, Command::Stop);
        tracing::debug!(action = cmd.action(), "handling command");
        let resp = handle_command(&state, cmd).await;
        send(&mut writer, &resp).await?;

        if is_stop {
            state.shutdown.request(ShutdownReason::StopCommand);
            break;
        }
    }

    Ok(())
}

async fn send(writer: &mut FramedWrite<IpcWriter, LinesCodec>, resp: &Response) -> Result<()> {
    writer.send(serde_json::to_string(resp)?).await?;
    Ok(())
}

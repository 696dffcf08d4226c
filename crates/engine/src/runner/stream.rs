use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::capture::{OutputCapture, Stream};

/// Copies `reader` into `capture` chunk by chunk until EOF.
pub(super) async fn pump_stream<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: Stream,
    capture: Arc<OutputCapture>,
) -> io::Result<u64> {
    let mut total = 0u64;
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        capture.append(stream, &chunk[..n]);
        total += n as u64;
    }
    Ok(total)
}

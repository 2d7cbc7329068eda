use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore as _;

use super::{starts_with_ignore_case, LINE_MAX};
use crate::vg::transport::Transport;

/// Offer a WebSocket upgrade and require `HTTP/1.1 101`.
pub async fn check(t: &mut Transport, path: &str) -> anyhow::Result<()> {
    let host = t.remote_host().to_string();
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    let key = BASE64.encode(nonce);

    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    t.print(request)
        .await
        .map_err(|e| anyhow::anyhow!("WEBSOCKET: error sending upgrade request -- {e}"))?;

    let status = t
        .read_line(LINE_MAX)
        .await
        .map_err(|e| anyhow::anyhow!("WEBSOCKET: error receiving response -- {e}"))?;
    if !starts_with_ignore_case(&status, "HTTP/1.1 101") {
        anyhow::bail!("WEBSOCKET: upgrade refused -- {status}");
    }
    Ok(())
}

use crate::vg::transport::Transport;

const PROTOCOL_V10: u8 = 10;
const ERR_PACKET: u8 = 0xff;

/// Read the server handshake and require protocol version 10, then send
/// COM_QUIT so the server does not log an aborted connection.
pub async fn check(t: &mut Transport) -> anyhow::Result<()> {
    let mut header = [0u8; 4];
    let n = t
        .read_bytes(&mut header)
        .await
        .map_err(|e| anyhow::anyhow!("MYSQL: error receiving handshake -- {e}"))?;
    if n != 4 {
        anyhow::bail!("MYSQL: short handshake header ({n} bytes)");
    }
    let len = header[0] as usize | (header[1] as usize) << 8 | (header[2] as usize) << 16;
    if len == 0 {
        anyhow::bail!("MYSQL: empty handshake packet");
    }

    let mut payload = [0u8; 256];
    let want = len.min(payload.len());
    let n = t
        .read_bytes(&mut payload[..want])
        .await
        .map_err(|e| anyhow::anyhow!("MYSQL: error receiving handshake payload -- {e}"))?;
    if n == 0 {
        anyhow::bail!("MYSQL: empty handshake payload");
    }
    if payload[0] == ERR_PACKET {
        let msg = String::from_utf8_lossy(&payload[3.min(n)..n]).into_owned();
        anyhow::bail!("MYSQL: server error -- {}", msg.trim());
    }
    if payload[0] != PROTOCOL_V10 {
        anyhow::bail!("MYSQL: invalid protocol version {}", payload[0]);
    }

    // COM_QUIT: payload length 1, sequence 0, command 0x01.
    let quit = [0x01, 0x00, 0x00, 0x00, 0x01];
    t.write_bytes(&quit)
        .await
        .map_err(|e| anyhow::anyhow!("MYSQL: error sending QUIT -- {e}"))?;
    Ok(())
}

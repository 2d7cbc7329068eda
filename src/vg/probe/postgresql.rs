use crate::vg::transport::Transport;

/// Send a protocol-3.0 startup message for user/database "root" and accept
/// either an authentication request or an error response; both prove a
/// PostgreSQL backend on the other end.
pub async fn check(t: &mut Transport) -> anyhow::Result<()> {
    let body: &[u8] = b"user\0root\0database\0root\0\0";
    let mut startup = Vec::with_capacity(8 + body.len());
    startup.extend_from_slice(&((8 + body.len()) as u32).to_be_bytes());
    startup.extend_from_slice(&0x0003_0000u32.to_be_bytes());
    startup.extend_from_slice(body);

    t.write_bytes(&startup)
        .await
        .map_err(|e| anyhow::anyhow!("PGSQL: error sending startup packet -- {e}"))?;

    let mut buf = [0u8; 512];
    let n = t
        .read_bytes(&mut buf)
        .await
        .map_err(|e| anyhow::anyhow!("PGSQL: error receiving response -- {e}"))?;
    if n == 0 {
        anyhow::bail!("PGSQL: empty response");
    }
    match buf[0] {
        b'R' | b'E' => Ok(()),
        other => anyhow::bail!("PGSQL: unexpected response type {:?}", other as char),
    }
}

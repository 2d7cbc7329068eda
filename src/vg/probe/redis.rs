use super::{starts_with_ignore_case, LINE_MAX};
use crate::vg::transport::Transport;

/// PING and expect +PONG. An authentication error still proves a live Redis.
pub async fn check(t: &mut Transport) -> anyhow::Result<()> {
    t.print("PING\r\n")
        .await
        .map_err(|e| anyhow::anyhow!("REDIS: error sending PING -- {e}"))?;
    let reply = t
        .read_line(LINE_MAX)
        .await
        .map_err(|e| anyhow::anyhow!("REDIS: error receiving PING response -- {e}"))?;
    let ok = starts_with_ignore_case(&reply, "+PONG")
        || starts_with_ignore_case(&reply, "-NOAUTH")
        || starts_with_ignore_case(&reply, "-DENIED");
    if !ok {
        anyhow::bail!("REDIS: invalid PING response -- {reply}");
    }
    Ok(())
}

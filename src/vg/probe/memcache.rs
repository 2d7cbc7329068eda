use super::{starts_with_ignore_case, LINE_MAX};
use crate::vg::transport::Transport;

/// Ask for the server version over the text protocol.
pub async fn check(t: &mut Transport) -> anyhow::Result<()> {
    t.print("version\r\n")
        .await
        .map_err(|e| anyhow::anyhow!("MEMCACHE: error sending version command -- {e}"))?;
    let reply = t
        .read_line(LINE_MAX)
        .await
        .map_err(|e| anyhow::anyhow!("MEMCACHE: error receiving version -- {e}"))?;
    if !starts_with_ignore_case(&reply, "VERSION") {
        anyhow::bail!("MEMCACHE: invalid version response -- {reply}");
    }
    Ok(())
}

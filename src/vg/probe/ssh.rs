use super::{starts_with_ignore_case, LINE_MAX};
use crate::vg::transport::Transport;

/// Read the server identification string and answer with our own.
pub async fn check(t: &mut Transport) -> anyhow::Result<()> {
    let banner = t
        .read_line(LINE_MAX)
        .await
        .map_err(|e| anyhow::anyhow!("SSH: error receiving identification string -- {e}"))?;
    if !starts_with_ignore_case(&banner, "SSH-") {
        anyhow::bail!("SSH: protocol error {banner}");
    }

    t.print(format!("SSH-2.0-vigild_{}\r\n", env!("CARGO_PKG_VERSION")))
        .await
        .map_err(|e| anyhow::anyhow!("SSH: error sending identification string -- {e}"))?;
    Ok(())
}

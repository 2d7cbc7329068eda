use super::{starts_with_ignore_case, LINE_MAX};
use crate::vg::transport::Transport;

/// Check the server greeting for `* OK`, then send LOGOUT and check for
/// `* BYE`.
pub async fn check(t: &mut Transport) -> anyhow::Result<()> {
    let greeting = t
        .read_line(LINE_MAX)
        .await
        .map_err(|e| anyhow::anyhow!("IMAP: greeting read error -- {e}"))?;
    if !starts_with_ignore_case(&greeting, "* OK") {
        anyhow::bail!("IMAP: invalid greeting -- {greeting}");
    }

    t.print("001 LOGOUT\r\n")
        .await
        .map_err(|e| anyhow::anyhow!("IMAP: logout command error -- {e}"))?;
    let bye = t
        .read_line(LINE_MAX)
        .await
        .map_err(|e| anyhow::anyhow!("IMAP: logout response read error -- {e}"))?;
    if !starts_with_ignore_case(&bye, "* BYE") {
        anyhow::bail!("IMAP: invalid logout response: {bye}");
    }
    Ok(())
}

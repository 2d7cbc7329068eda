use super::{starts_with_ignore_case, LINE_MAX};
use crate::vg::transport::Transport;

/// Read the 220 greeting (multiline allowed), then QUIT and expect 221.
pub async fn check(t: &mut Transport) -> anyhow::Result<()> {
    loop {
        let line = t
            .read_line(LINE_MAX)
            .await
            .map_err(|e| anyhow::anyhow!("FTP: greeting read error -- {e}"))?;
        if starts_with_ignore_case(&line, "220 ") || line == "220" {
            break;
        }
        if !starts_with_ignore_case(&line, "220-") {
            anyhow::bail!("FTP: invalid greeting -- {line}");
        }
    }

    t.print("QUIT\r\n")
        .await
        .map_err(|e| anyhow::anyhow!("FTP: quit command error -- {e}"))?;
    let bye = t
        .read_line(LINE_MAX)
        .await
        .map_err(|e| anyhow::anyhow!("FTP: quit response read error -- {e}"))?;
    if !starts_with_ignore_case(&bye, "221") {
        anyhow::bail!("FTP: invalid quit response: {bye}");
    }
    Ok(())
}

use super::{starts_with_ignore_case, LINE_MAX};
use crate::vg::transport::Transport;

/// Check the `+OK` greeting, then QUIT and check for `+OK`.
pub async fn check(t: &mut Transport) -> anyhow::Result<()> {
    let greeting = t
        .read_line(LINE_MAX)
        .await
        .map_err(|e| anyhow::anyhow!("POP: greeting read error -- {e}"))?;
    if !starts_with_ignore_case(&greeting, "+OK") {
        anyhow::bail!("POP: invalid greeting -- {greeting}");
    }

    t.print("QUIT\r\n")
        .await
        .map_err(|e| anyhow::anyhow!("POP: quit command error -- {e}"))?;
    let bye = t
        .read_line(LINE_MAX)
        .await
        .map_err(|e| anyhow::anyhow!("POP: quit response read error -- {e}"))?;
    if !starts_with_ignore_case(&bye, "+OK") {
        anyhow::bail!("POP: invalid quit response: {bye}");
    }
    Ok(())
}

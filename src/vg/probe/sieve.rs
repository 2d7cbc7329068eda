use super::{starts_with_ignore_case, LINE_MAX};
use crate::vg::transport::Transport;

const GREETING_LINES_MAX: usize = 32;

/// ManageSieve: capability greeting ends with an OK line; LOGOUT must OK too.
pub async fn check(t: &mut Transport) -> anyhow::Result<()> {
    let mut seen_ok = false;
    for _ in 0..GREETING_LINES_MAX {
        let line = t
            .read_line(LINE_MAX)
            .await
            .map_err(|e| anyhow::anyhow!("SIEVE: greeting read error -- {e}"))?;
        if starts_with_ignore_case(&line, "OK") {
            seen_ok = true;
            break;
        }
        if starts_with_ignore_case(&line, "NO") || starts_with_ignore_case(&line, "BYE") {
            anyhow::bail!("SIEVE: invalid greeting -- {line}");
        }
    }
    if !seen_ok {
        anyhow::bail!("SIEVE: greeting did not complete with OK");
    }

    t.print("LOGOUT\r\n")
        .await
        .map_err(|e| anyhow::anyhow!("SIEVE: logout command error -- {e}"))?;
    let bye = t
        .read_line(LINE_MAX)
        .await
        .map_err(|e| anyhow::anyhow!("SIEVE: logout response read error -- {e}"))?;
    if !starts_with_ignore_case(&bye, "OK") {
        anyhow::bail!("SIEVE: invalid logout response: {bye}");
    }
    Ok(())
}

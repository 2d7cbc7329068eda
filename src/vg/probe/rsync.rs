use super::starts_with_ignore_case;
use crate::vg::transport::Transport;

const GREETING_MAX: usize = 64;

/// Check for the `@RSYNCD: <version>` greeting, echo it back, request the
/// module list and require a clean `@RSYNCD: EXIT`.
pub async fn check(t: &mut Transport) -> anyhow::Result<()> {
    let greeting = t
        .read_line(GREETING_MAX)
        .await
        .map_err(|e| anyhow::anyhow!("RSYNC: did not see server greeting -- {e}"))?;

    let mut parts = greeting.split_whitespace();
    let header = parts.next().unwrap_or("");
    let version = parts.next().unwrap_or("");
    let version_ok = {
        let mut it = version.splitn(2, '.');
        let major = it.next().and_then(|v| v.parse::<u32>().ok());
        let minor = it.next().and_then(|v| v.parse::<u32>().ok());
        major.is_some() && minor.is_some()
    };
    if !version_ok {
        anyhow::bail!("RSYNC: server greeting parse error {greeting}");
    }
    if !starts_with_ignore_case(header, "@RSYNCD:") {
        anyhow::bail!("RSYNC: server sent unexpected greeting -- {greeting}");
    }

    // Send back the greeting, then ask for the module list.
    t.print(format!("{greeting}\n"))
        .await
        .map_err(|e| anyhow::anyhow!("RSYNC: identification string send failed -- {e}"))?;
    t.print("#list\n")
        .await
        .map_err(|e| anyhow::anyhow!("RSYNC: #list command failed -- {e}"))?;

    // Discard list output and require a successful exit marker.
    let line = loop {
        let line = t
            .read_line(GREETING_MAX)
            .await
            .map_err(|e| anyhow::anyhow!("RSYNC: error receiving data -- {e}"))?;
        if starts_with_ignore_case(&line, "@RSYNCD:") {
            break line;
        }
    };
    if !starts_with_ignore_case(&line, "@RSYNCD: EXIT") {
        anyhow::bail!("RSYNC: server sent unexpected response -- {line}");
    }
    Ok(())
}

use super::LINE_MAX;
use crate::vg::transport::Transport;

/// Issue a GET for the configured path and require a non-error status.
pub async fn check(t: &mut Transport, path: &str) -> anyhow::Result<()> {
    let host = t.remote_host().to_string();
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Accept: */*\r\n\
         User-Agent: vigild/{}\r\n\
         Connection: close\r\n\r\n",
        env!("CARGO_PKG_VERSION")
    );
    t.print(request)
        .await
        .map_err(|e| anyhow::anyhow!("HTTP: error sending request -- {e}"))?;

    let status_line = t
        .read_line(LINE_MAX)
        .await
        .map_err(|e| anyhow::anyhow!("HTTP: error receiving status line -- {e}"))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("HTTP: cannot parse status in response: {status_line}"))?;
    if status >= 400 {
        anyhow::bail!("HTTP error: server replied {status}");
    }
    Ok(())
}

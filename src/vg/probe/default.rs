use regex::Regex;

use crate::vg::transport::Transport;

/// Generic send/expect check. With neither configured, a successful
/// connection is the check.
pub async fn check(t: &mut Transport, send: Option<&str>, expect: Option<&str>) -> anyhow::Result<()> {
    if let Some(s) = send {
        t.print(s)
            .await
            .map_err(|e| anyhow::anyhow!("DEFAULT: error sending data -- {e}"))?;
    }
    if let Some(pattern) = expect {
        let re = Regex::new(pattern)
            .map_err(|e| anyhow::anyhow!("DEFAULT: invalid expect pattern {pattern:?} -- {e}"))?;
        let mut buf = [0u8; 1024];
        let n = t
            .read_bytes(&mut buf)
            .await
            .map_err(|e| anyhow::anyhow!("DEFAULT: error receiving data -- {e}"))?;
        let got = String::from_utf8_lossy(&buf[..n]);
        if !re.is_match(&got) {
            let snippet: String = got.chars().take(128).collect();
            anyhow::bail!("DEFAULT: regex {pattern:?} does not match: {snippet}");
        }
    }
    Ok(())
}

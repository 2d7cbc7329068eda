use super::LINE_MAX;
use crate::vg::tls::ClientTlsOpts;
use crate::vg::transport::Transport;

/// Read an SMTP reply, skipping continuation lines ("250-..."), and return
/// the 3-digit code of the final line.
async fn read_reply(t: &mut Transport, what: &str) -> anyhow::Result<u16> {
    loop {
        let line = t
            .read_line(LINE_MAX)
            .await
            .map_err(|e| anyhow::anyhow!("SMTP: error receiving {what} -- {e}"))?;
        let code: u16 = line
            .get(..3)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("SMTP: malformed {what}: {line}"))?;
        if line.as_bytes().get(3) != Some(&b'-') {
            return Ok(code);
        }
    }
}

/// SMTP greeting + EHLO + optional STARTTLS upgrade + QUIT.
pub async fn check(t: &mut Transport, starttls: bool, tls_opts: Option<&ClientTlsOpts>) -> anyhow::Result<()> {
    let code = read_reply(t, "greeting").await?;
    if code != 220 {
        anyhow::bail!("SMTP: invalid greeting code {code}");
    }

    t.print("EHLO localhost\r\n")
        .await
        .map_err(|e| anyhow::anyhow!("SMTP: EHLO command error -- {e}"))?;
    let code = read_reply(t, "EHLO response").await?;
    if code != 250 {
        anyhow::bail!("SMTP: invalid EHLO response code {code}");
    }

    if starttls {
        let Some(opts) = tls_opts else {
            anyhow::bail!("SMTP: STARTTLS requested but no TLS options configured");
        };
        t.print("STARTTLS\r\n")
            .await
            .map_err(|e| anyhow::anyhow!("SMTP: STARTTLS command error -- {e}"))?;
        let code = read_reply(t, "STARTTLS response").await?;
        if code != 220 {
            anyhow::bail!("SMTP: invalid STARTTLS response code {code}");
        }
        t.switch_to_tls(opts)
            .await
            .map_err(|e| anyhow::anyhow!("SMTP: TLS upgrade failed -- {e}"))?;
        t.print("EHLO localhost\r\n")
            .await
            .map_err(|e| anyhow::anyhow!("SMTP: EHLO command error -- {e}"))?;
        let code = read_reply(t, "EHLO response").await?;
        if code != 250 {
            anyhow::bail!("SMTP: invalid EHLO response code {code}");
        }
    }

    t.print("QUIT\r\n")
        .await
        .map_err(|e| anyhow::anyhow!("SMTP: QUIT command error -- {e}"))?;
    let code = read_reply(t, "QUIT response").await?;
    if code != 221 {
        anyhow::bail!("SMTP: invalid QUIT response code {code}");
    }
    Ok(())
}

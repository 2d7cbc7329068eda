use rand::Rng as _;

use super::{starts_with_ignore_case, LINE_MAX};
use crate::vg::transport::Transport;

/// Send an OPTIONS request and require a SIP/2.0 reply.
pub async fn check(t: &mut Transport, target: Option<&str>) -> anyhow::Result<()> {
    let host = t.remote_host().to_string();
    let port = t.remote_port();
    let proto = if t.is_udp() { "UDP" } else { "TCP" };
    let uri = target
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("sip:{host}:{port}"));
    let branch: u32 = rand::thread_rng().gen();
    let call_id: u32 = rand::thread_rng().gen();

    let request = format!(
        "OPTIONS {uri} SIP/2.0\r\n\
         Via: SIP/2.0/{proto} localhost;branch=z9hG4bK{branch:08x}\r\n\
         Max-Forwards: 70\r\n\
         To: <{uri}>\r\n\
         From: <sip:vigild@localhost>;tag={call_id:08x}\r\n\
         Call-ID: {call_id:08x}@localhost\r\n\
         CSeq: 1 OPTIONS\r\n\
         Contact: <sip:vigild@localhost>\r\n\
         Accept: application/sdp\r\n\
         Content-Length: 0\r\n\r\n"
    );
    t.print(request)
        .await
        .map_err(|e| anyhow::anyhow!("SIP: error sending OPTIONS -- {e}"))?;

    let line = t
        .read_line(LINE_MAX)
        .await
        .map_err(|e| anyhow::anyhow!("SIP: error receiving response -- {e}"))?;
    if !starts_with_ignore_case(&line, "SIP/2.0 ") {
        anyhow::bail!("SIP: invalid response -- {line}");
    }
    Ok(())
}

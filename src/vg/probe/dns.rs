use crate::vg::transport::Transport;

// Standard query for the root name servers: id 0x0001, recursion desired,
// QDCOUNT 1, root name, QTYPE NS, QCLASS IN.
const QUERY: [u8; 17] = [
    0x00, 0x01, // id
    0x01, 0x00, // flags: recursion desired
    0x00, 0x01, // QDCOUNT
    0x00, 0x00, // ANCOUNT
    0x00, 0x00, // NSCOUNT
    0x00, 0x00, // ARCOUNT
    0x00, // root name
    0x00, 0x02, // QTYPE NS
    0x00, 0x01, // QCLASS IN
];

/// Query for the root name servers and accept any well-formed answer,
/// including NotImp/Refused (the server is alive either way).
pub async fn check(t: &mut Transport) -> anyhow::Result<()> {
    let mut sent = Vec::with_capacity(QUERY.len() + 2);
    if !t.is_udp() {
        // DNS over TCP carries a two-byte length prefix.
        sent.extend_from_slice(&(QUERY.len() as u16).to_be_bytes());
    }
    sent.extend_from_slice(&QUERY);
    t.write_bytes(&sent)
        .await
        .map_err(|e| anyhow::anyhow!("DNS: error sending query -- {e}"))?;

    let mut buf = [0u8; 512];
    let mut n = t
        .read_bytes(&mut buf)
        .await
        .map_err(|e| anyhow::anyhow!("DNS: error receiving response -- {e}"))?;
    let mut response = &buf[..n];
    if !t.is_udp() {
        if n < 2 {
            anyhow::bail!("DNS: short response ({n} bytes)");
        }
        response = &response[2..];
        n -= 2;
    }
    if n < 12 {
        anyhow::bail!("DNS: short response ({n} bytes)");
    }
    if response[0] != QUERY[0] || response[1] != QUERY[1] {
        anyhow::bail!("DNS: response id mismatch");
    }
    if response[2] & 0x80 == 0 {
        anyhow::bail!("DNS: response flag not set");
    }
    let rcode = response[3] & 0x0f;
    // NOERROR, NOTIMP and REFUSED all indicate a responsive server.
    if !matches!(rcode, 0 | 4 | 5) {
        anyhow::bail!("DNS: error response code {rcode}");
    }
    Ok(())
}

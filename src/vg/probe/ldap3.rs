use crate::vg::transport::Transport;

// LDAPv3 anonymous bind request, message id 1.
const BIND_REQUEST: [u8; 14] = [
    0x30, 0x0c, // universal sequence
    0x02, 0x01, 0x01, // message id 1
    0x60, 0x07, // bind request
    0x02, 0x01, 0x03, // protocol version 3
    0x04, 0x00, // anonymous dn
    0x80, 0x00, // simple authentication, empty credentials
];

// Expected bind response: success result code with empty matchedDN and
// diagnosticMessage.
const BIND_RESPONSE: [u8; 14] = [
    0x30, 0x0c, // universal sequence
    0x02, 0x01, 0x01, // message id 1
    0x61, 0x07, // bind response
    0x0a, 0x01, 0x00, // result code success
    0x04, 0x00, // matchedDN
    0x04, 0x00, // diagnosticMessage
];

// Unbind request, message id 2.
const UNBIND_REQUEST: [u8; 7] = [
    0x30, 0x05, // universal sequence
    0x02, 0x01, 0x02, // message id 2
    0x42, 0x00, // unbind request
];

/// Anonymous LDAPv3 bind/unbind handshake with byte-exact framing.
pub async fn check(t: &mut Transport) -> anyhow::Result<()> {
    t.write_bytes(&BIND_REQUEST)
        .await
        .map_err(|e| anyhow::anyhow!("LDAP: error sending bind request -- {e}"))?;

    let mut buf = [0u8; 64];
    let n = t
        .read_bytes(&mut buf)
        .await
        .map_err(|e| anyhow::anyhow!("LDAP: error receiving bind response -- {e}"))?;
    if n < BIND_RESPONSE.len() || buf[..BIND_RESPONSE.len()] != BIND_RESPONSE {
        anyhow::bail!("LDAP: anonymous bind failed");
    }

    t.write_bytes(&UNBIND_REQUEST)
        .await
        .map_err(|e| anyhow::anyhow!("LDAP: error sending unbind request -- {e}"))?;
    Ok(())
}

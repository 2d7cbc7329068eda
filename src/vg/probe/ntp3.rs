use crate::vg::transport::Transport;

const NTP_LEN: usize = 48;
const NTP_LEAP_NOTSYNC: u8 = 3; // Leap Indicator: clock not synchronized
const NTP_VERSION: u8 = 3;
const NTP_MODE_CLIENT: u8 = 3;
const NTP_MODE_SERVER: u8 = 4;

/// NTP version 3 synchronization request (RFC 1305).
///
/// First octet layout: bits 0-1 leap indicator, 2-4 version, 5-7 mode.
pub async fn check(t: &mut Transport) -> anyhow::Result<()> {
    let mut request = [0u8; NTP_LEN];
    request[0] = (NTP_LEAP_NOTSYNC << 6) | (NTP_VERSION << 3) | NTP_MODE_CLIENT;

    t.write_bytes(&request)
        .await
        .map_err(|e| anyhow::anyhow!("NTP: error sending NTP request -- {e}"))?;

    let mut response = [0u8; NTP_LEN];
    let n = t
        .read_bytes(&mut response)
        .await
        .map_err(|e| anyhow::anyhow!("NTP: did not receive answer from server -- {e}"))?;
    if n != NTP_LEN {
        anyhow::bail!("NTP: Received {n} bytes from server, expected {NTP_LEN} bytes");
    }

    if response[0] & 0x07 != NTP_MODE_SERVER {
        anyhow::bail!("NTP: Server mode error");
    }
    if response[0] & 0x38 != NTP_VERSION << 3 {
        anyhow::bail!("NTP: Server protocol version error");
    }
    if response[0] & 0xc0 == NTP_LEAP_NOTSYNC << 6 {
        anyhow::bail!("NTP: Server not synchronized");
    }
    Ok(())
}

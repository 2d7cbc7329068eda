use super::{starts_with_ignore_case, LINE_MAX};
use crate::vg::transport::Transport;

/// Check gpsd: request the device list and require a known device class.
pub async fn check(t: &mut Transport) -> anyhow::Result<()> {
    t.print("G\r\n")
        .await
        .map_err(|e| anyhow::anyhow!("GPS: error sending data -- {e}"))?;

    let line = t
        .read_line(LINE_MAX)
        .await
        .map_err(|e| anyhow::anyhow!("GPS: error receiving data -- {e}"))?;

    let ok = starts_with_ignore_case(&line, "GPSD,G=GPS")
        || starts_with_ignore_case(&line, "GPSD,G=RTCM104v2")
        || starts_with_ignore_case(&line, "GPSD,G=RTCM104");
    if !ok {
        anyhow::bail!("GPS error (no device): {line}");
    }
    Ok(())
}

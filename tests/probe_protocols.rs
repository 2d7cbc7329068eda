//! Protocol probes against local mock servers.

use md5::{Digest as _, Md5};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UdpSocket};

use vigild::vg::probe::{imap, ntp3, radius, rsync, Protocol};
use vigild::vg::transport::{Family, SocketKind, Transport};

async fn tcp_client(port: u16) -> Transport {
    Transport::connect("127.0.0.1", port, SocketKind::Tcp, Family::V4, None, 2000)
        .await
        .expect("connect mock")
}

async fn udp_client(port: u16) -> Transport {
    Transport::connect("127.0.0.1", port, SocketKind::Udp, Family::V4, None, 2000)
        .await
        .expect("connect mock")
}

#[tokio::test]
async fn imap_accepts_ok_greeting_and_bye() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (s, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(s);
        reader
            .get_mut()
            .write_all(b"* OK IMAP4rev1 server ready\r\n")
            .await
            .unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "001 LOGOUT\r\n");
        reader.get_mut().write_all(b"* BYE\r\n").await.unwrap();
    });

    let mut t = tcp_client(port).await;
    imap::check(&mut t).await.unwrap();
}

#[tokio::test]
async fn imap_rejects_bad_greeting() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut s, _) = listener.accept().await.unwrap();
        s.write_all(b"* NO bad\r\n").await.unwrap();
    });

    let mut t = tcp_client(port).await;
    let err = imap::check(&mut t).await.unwrap_err();
    assert!(err.to_string().contains("IMAP: invalid greeting"), "{err}");
}

#[tokio::test]
async fn ntp3_accepts_synchronized_server_reply() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 128];
        let (n, peer) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 48);
        // Client octet: leap=notsync, version=3, mode=client.
        assert_eq!(buf[0], (3 << 6) | (3 << 3) | 3);
        let mut resp = [0u8; 48];
        resp[0] = 0x1c; // leap=0, version=3, mode=server
        server.send_to(&resp, peer).await.unwrap();
    });

    let mut t = udp_client(port).await;
    ntp3::check(&mut t).await.unwrap();
}

#[tokio::test]
async fn ntp3_rejects_short_reply() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 128];
        let (_, peer) = server.recv_from(&mut buf).await.unwrap();
        server.send_to(&[0x1c; 47], peer).await.unwrap();
    });

    let mut t = udp_client(port).await;
    let err = ntp3::check(&mut t).await.unwrap_err();
    assert!(
        err.to_string().contains("Received 47 bytes"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn ntp3_rejects_unsynchronized_server() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 128];
        let (_, peer) = server.recv_from(&mut buf).await.unwrap();
        let mut resp = [0u8; 48];
        resp[0] = (3 << 6) | (3 << 3) | 4; // leap=notsync
        server.send_to(&resp, peer).await.unwrap();
    });

    let mut t = udp_client(port).await;
    let err = ntp3::check(&mut t).await.unwrap_err();
    assert!(err.to_string().contains("not synchronized"), "{err}");
}

fn radius_reply(code: u8, request: &[u8], secret: &[u8], sign: bool) -> Vec<u8> {
    let mut resp = vec![code, 0x00, 0x00, 0x14];
    resp.extend_from_slice(&[0u8; 16]);
    if sign {
        // Response authenticator: MD5 over the packet with the request
        // authenticator in place, followed by the shared secret.
        let mut tmp = resp.clone();
        tmp[4..20].copy_from_slice(&request[4..20]);
        let mut h = Md5::new();
        h.update(&tmp);
        h.update(secret);
        let digest: [u8; 16] = h.finalize().into();
        resp[4..20].copy_from_slice(&digest);
    }
    resp
}

#[tokio::test]
async fn radius_accepts_signed_status_server_reply() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 128];
        let (n, peer) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 38);
        assert_eq!(buf[0], 0x0c);
        assert_eq!(&buf[2..4], &[0x00, 0x26]);
        let resp = radius_reply(2, &buf[..n], b"testing123", true);
        server.send_to(&resp, peer).await.unwrap();
    });

    let mut t = udp_client(port).await;
    radius::check_with_authenticator(&mut t, "testing123", &[0u8; 16])
        .await
        .unwrap();
    assert!(t.last_error().is_none());
}

#[tokio::test]
async fn radius_records_soft_failure_for_bad_authenticator() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 128];
        let (n, peer) = server.recv_from(&mut buf).await.unwrap();
        let resp = radius_reply(2, &buf[..n], b"testing123", false);
        server.send_to(&resp, peer).await.unwrap();
    });

    let mut t = udp_client(port).await;
    // The reply authenticator is wrong: the probe still passes but records
    // the failure on the transport.
    radius::check_with_authenticator(&mut t, "testing123", &[0u8; 16])
        .await
        .unwrap();
    assert!(
        t.last_error().unwrap_or("").contains("fails authentication"),
        "missing soft error"
    );
}

#[tokio::test]
async fn radius_rejects_invalid_reply_code() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 128];
        let (n, peer) = server.recv_from(&mut buf).await.unwrap();
        let resp = radius_reply(3, &buf[..n], b"testing123", true);
        server.send_to(&resp, peer).await.unwrap();
    });

    let mut t = udp_client(port).await;
    let err = radius::check_with_authenticator(&mut t, "testing123", &[0u8; 16])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Invalid reply code"), "{err}");
}

#[tokio::test]
async fn radius_skips_stream_sockets() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let mut t = tcp_client(port).await;
    radius::check(&mut t, "testing123").await.unwrap();
    assert!(
        t.last_error().unwrap_or("").contains("unsupported socket type"),
        "missing skip note"
    );
}

#[tokio::test]
async fn rsync_handshakes_and_lists() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (s, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(s);
        reader.get_mut().write_all(b"@RSYNCD: 31.0\n").await.unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "@RSYNCD: 31.0\n");
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "#list\n");
        reader
            .get_mut()
            .write_all(b"backup\tnightly backups\n@RSYNCD: EXIT\n")
            .await
            .unwrap();
    });

    let mut t = tcp_client(port).await;
    rsync::check(&mut t).await.unwrap();
}

#[tokio::test]
async fn rsync_rejects_garbled_greeting() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut s, _) = listener.accept().await.unwrap();
        s.write_all(b"SSH-2.0-OpenSSH\n").await.unwrap();
    });

    let mut t = tcp_client(port).await;
    let err = rsync::check(&mut t).await.unwrap_err();
    assert!(err.to_string().contains("RSYNC"), "{err}");
}

#[tokio::test]
async fn gps_device_classes() {
    for (reply, ok) in [
        ("GPSD,G=GPS\r\n", true),
        ("GPSD,G=RTCM104v2\r\n", true),
        ("GPSD,G=?\r\n", false),
    ] {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let reply = reply.to_string();
        let reply_send = reply.clone();
        tokio::spawn(async move {
            let (s, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(s);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "G\r\n");
            reader.get_mut().write_all(reply_send.as_bytes()).await.unwrap();
        });

        let mut t = tcp_client(port).await;
        let p: Protocol = serde_yaml::from_str("kind: gps").unwrap();
        let result = p.check(&mut t, None).await;
        assert_eq!(result.is_ok(), ok, "reply {reply:?}");
    }
}

#[tokio::test]
async fn http_status_gate() {
    for (status, ok) in [("200 OK", true), ("301 Moved", true), ("503 Unavailable", false)] {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let status = status.to_string();
        let status_send = status.clone();
        tokio::spawn(async move {
            let (s, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(s);
            let mut line = String::new();
            // Drain request headers.
            loop {
                line.clear();
                reader.read_line(&mut line).await.unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let resp = format!("HTTP/1.1 {status_send}\r\nContent-Length: 0\r\n\r\n");
            reader.get_mut().write_all(resp.as_bytes()).await.unwrap();
        });

        let mut t = tcp_client(port).await;
        let p: Protocol = serde_yaml::from_str("kind: http").unwrap();
        let result = p.check(&mut t, None).await;
        assert_eq!(result.is_ok(), ok, "status {status:?}");
    }
}

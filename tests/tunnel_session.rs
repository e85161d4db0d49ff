//! End-to-end tunnel session tests against a scripted gateway.
//!
//! Each test opens a session over the in-memory transport and plays the
//! gateway's side of the conversation through [`MockGateway`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout, Instant};

use knx_tunnel::net::{MockGateway, MockTransport};
use knx_tunnel::protocol::constants::{
    CONN_STATE_NORMAL, E_CONNECTION_TYPE, E_NO_ERROR, E_NO_MORE_CONNECTIONS,
};
use knx_tunnel::protocol::frame::Hpai;
use knx_tunnel::protocol::services::{
    ConnectResponse, ConnectionStateResponse, DisconnectRequest, Frame, TunnelingAck,
    TunnelingRequest,
};
use knx_tunnel::{CemiFrame, GroupAddress, IndividualAddress, Tunnel, TunnelConfig, TunnelError};
use knx_tunnel::dpt::DptValue;

/// Tight timings so the scenarios complete quickly; heartbeats are pushed
/// out of the way unless a test is about them.
fn test_config() -> TunnelConfig {
    TunnelConfig {
        resend_interval: Duration::from_millis(50),
        heartbeat_interval: Duration::from_secs(60),
        response_timeout: Duration::from_secs(2),
    }
}

/// Bound every await in a test so a regression hangs loudly, not silently.
async fn within<T>(fut: impl Future<Output = T>) -> T {
    timeout(Duration::from_secs(5), fut).await.expect("test timed out")
}

fn connect_ok(channel: u8) -> Frame {
    Frame::ConnectResponse(ConnectResponse {
        channel,
        status: E_NO_ERROR,
        control: Hpai::UNSPECIFIED,
    })
}

fn connect_denied(status: u8) -> Frame {
    Frame::ConnectResponse(ConnectResponse { channel: 0, status, control: Hpai::UNSPECIFIED })
}

fn tunnel_req(channel: u8, seq: u8, payload: &CemiFrame) -> Frame {
    Frame::TunnelingRequest(TunnelingRequest { channel, seq, payload: payload.clone() })
}

fn ack(channel: u8, seq: u8) -> Frame {
    Frame::TunnelingAck(TunnelingAck { channel, seq, status: E_NO_ERROR })
}

fn sample_payload(sub: u8) -> CemiFrame {
    let source = IndividualAddress::new(1, 1, 1).unwrap();
    let destination = GroupAddress::new(1, 2, sub).unwrap();
    CemiFrame::group_write(source, destination, &DptValue::Bool(true))
}

/// Open a session on `channel`, answering the handshake.
async fn open_tunnel(
    channel: u8,
    config: TunnelConfig,
) -> (Tunnel<MockTransport>, MockGateway) {
    let (transport, mut gateway) = MockTransport::pair();
    let (opened, ()) = tokio::join!(Tunnel::open_with_transport(transport, config), async {
        let frame = within(gateway.recv_frame()).await.expect("gateway saw no frame");
        assert!(matches!(frame, Frame::ConnectRequest(_)), "expected connect request");
        gateway.send_frame(&connect_ok(channel));
    });
    (opened.expect("open failed"), gateway)
}

// S1: happy path. Connect, send, ack; the next send carries the next
// sequence number.
#[tokio::test]
async fn s1_send_sequences_increment() {
    let (tunnel, mut gateway) = open_tunnel(7, test_config()).await;

    for expected_seq in 0..3u8 {
        let payload = sample_payload(expected_seq);
        let (sent, ()) = tokio::join!(tunnel.send(payload.clone()), async {
            let frame = within(gateway.recv_frame()).await.unwrap();
            let Frame::TunnelingRequest(request) = frame else {
                panic!("expected tunneling request, got {frame:?}");
            };
            assert_eq!(request.channel, 7);
            assert_eq!(request.seq, expected_seq);
            assert_eq!(request.payload, payload);
            gateway.send_frame(&ack(7, expected_seq));
        });
        sent.expect("send failed");
    }
}

// S2: a busy gateway delays the handshake but does not fail it.
#[tokio::test]
async fn s2_busy_then_ok() {
    let (transport, mut gateway) = MockTransport::pair();
    let (opened, ()) =
        tokio::join!(Tunnel::open_with_transport(transport, test_config()), async {
            for _ in 0..2 {
                let frame = within(gateway.recv_frame()).await.unwrap();
                assert!(matches!(frame, Frame::ConnectRequest(_)));
                gateway.send_frame(&connect_denied(E_NO_MORE_CONNECTIONS));
            }
            // The client keeps asking at the resend interval.
            let frame = within(gateway.recv_frame()).await.unwrap();
            assert!(matches!(frame, Frame::ConnectRequest(_)));
            gateway.send_frame(&connect_ok(9));
        });
    opened.expect("open should survive busy responses");
}

// A denial with any other status fails the handshake.
#[tokio::test]
async fn connect_rejection_fails_open() {
    let (transport, mut gateway) = MockTransport::pair();
    let (opened, ()) =
        tokio::join!(Tunnel::open_with_transport(transport, test_config()), async {
            let _ = within(gateway.recv_frame()).await;
            gateway.send_frame(&connect_denied(E_CONNECTION_TYPE));
        });
    assert!(matches!(opened, Err(TunnelError::ConnectRejected(E_CONNECTION_TYPE))));
}

// A silent gateway bounds the handshake by the response timeout.
#[tokio::test]
async fn open_times_out_against_silent_gateway() {
    let config = TunnelConfig { response_timeout: Duration::from_millis(200), ..test_config() };
    let (transport, mut gateway) = MockTransport::pair();

    let started = Instant::now();
    let (opened, ()) = tokio::join!(Tunnel::open_with_transport(transport, config), async {
        let _ = within(gateway.recv_frame()).await;
    });

    assert!(matches!(opened, Err(TunnelError::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(200));
}

// S3: an unacknowledged request is retransmitted byte-identically until the
// ack arrives.
#[tokio::test]
async fn s3_resend_is_byte_identical() {
    let (tunnel, mut gateway) = open_tunnel(7, test_config()).await;

    let (sent, ()) = tokio::join!(tunnel.send(sample_payload(1)), async {
        let first = within(gateway.recv_raw()).await.unwrap();
        let second = within(gateway.recv_raw()).await.unwrap();
        assert_eq!(first, second, "retransmission must be identical");

        let Frame::TunnelingRequest(request) = Frame::decode(&second).unwrap() else {
            panic!("expected tunneling request");
        };
        gateway.send_frame(&ack(request.channel, request.seq));
    });
    sent.expect("send should succeed after the late ack");
}

// Invariant 4: an ack with the wrong sequence number never terminates an
// outstanding send.
#[tokio::test]
async fn stale_ack_is_ignored() {
    let (tunnel, mut gateway) = open_tunnel(7, test_config()).await;

    let (sent, ()) = tokio::join!(tunnel.send(sample_payload(1)), async {
        let frame = within(gateway.recv_frame()).await.unwrap();
        let Frame::TunnelingRequest(request) = frame else {
            panic!("expected tunneling request");
        };
        assert_eq!(request.seq, 0);

        gateway.send_frame(&ack(7, 5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        gateway.send_frame(&ack(7, 0));
    });
    sent.expect("send must complete on the matching ack only");
}

// An ack the gateway delivers after a send has timed out is dropped, not
// retained: the next send reuses the same sequence number and must wait for
// its own acknowledgement.
#[tokio::test]
async fn late_ack_from_timed_out_send_is_not_retained() {
    let config = TunnelConfig { response_timeout: Duration::from_millis(200), ..test_config() };
    let (tunnel, mut gateway) = open_tunnel(7, config).await;

    // First send goes unacknowledged and times out; the sequence counter
    // stays at 0.
    let (sent, ()) = tokio::join!(tunnel.send(sample_payload(1)), async {
        while timeout(Duration::from_millis(400), gateway.recv_frame()).await.is_ok() {}
    });
    assert!(matches!(sent, Err(TunnelError::Timeout)));

    // The gateway acknowledges the abandoned sequence only now.
    gateway.send_frame(&ack(7, 0));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The next send reuses sequence 0; the late ack must not complete it.
    let tunnel = Arc::new(tunnel);
    let second = tokio::spawn({
        let tunnel = Arc::clone(&tunnel);
        async move { tunnel.send(sample_payload(2)).await }
    });

    let frame = within(gateway.recv_frame()).await.unwrap();
    let Frame::TunnelingRequest(request) = frame else {
        panic!("expected tunneling request, got {frame:?}");
    };
    assert_eq!(request.seq, 0);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!second.is_finished(), "a retained late ack completed the send prematurely");

    gateway.send_frame(&ack(7, 0));
    within(second).await.unwrap().expect("send should complete on the fresh ack");
}

// A send with no ack at all surfaces Timeout without tearing the session
// down.
#[tokio::test]
async fn send_timeout_leaves_session_alive() {
    let config = TunnelConfig { response_timeout: Duration::from_millis(200), ..test_config() };
    let (mut tunnel, mut gateway) = open_tunnel(7, config).await;

    let (sent, ()) = tokio::join!(tunnel.send(sample_payload(1)), async {
        // Swallow the request and every retransmission; never acknowledge.
        while timeout(Duration::from_millis(400), gateway.recv_frame()).await.is_ok() {}
    });
    assert!(matches!(sent, Err(TunnelError::Timeout)));

    // The session is still serving inbound traffic.
    let payload = sample_payload(2);
    gateway.send_frame(&tunnel_req(7, 0, &payload));
    let frame = within(gateway.recv_frame()).await.unwrap();
    assert!(matches!(frame, Frame::TunnelingAck(TunnelingAck { channel: 7, seq: 0, .. })));
    assert_eq!(within(tunnel.recv()).await.unwrap(), payload);
}

// S4: a duplicated inbound request is acknowledged twice but delivered once.
#[tokio::test]
async fn s4_duplicate_inbound_delivered_once() {
    let (mut tunnel, mut gateway) = open_tunnel(7, test_config()).await;
    let payload = sample_payload(3);

    gateway.send_frame(&tunnel_req(7, 0, &payload));
    let frame = within(gateway.recv_frame()).await.unwrap();
    assert!(matches!(frame, Frame::TunnelingAck(TunnelingAck { seq: 0, status: 0, .. })));

    gateway.send_frame(&tunnel_req(7, 0, &payload));
    let frame = within(gateway.recv_frame()).await.unwrap();
    assert!(matches!(frame, Frame::TunnelingAck(TunnelingAck { seq: 0, status: 0, .. })));

    assert_eq!(within(tunnel.recv()).await.unwrap(), payload);
    assert!(
        timeout(Duration::from_millis(100), tunnel.recv()).await.is_err(),
        "the duplicate must not be delivered"
    );
}

// Out-of-window sequences are dropped without acknowledgement; the stream
// recovers with the expected sequence.
#[tokio::test]
async fn out_of_window_sequence_dropped() {
    let (mut tunnel, mut gateway) = open_tunnel(7, test_config()).await;

    gateway.send_frame(&tunnel_req(7, 5, &sample_payload(1)));
    let payload = sample_payload(2);
    gateway.send_frame(&tunnel_req(7, 0, &payload));

    // The only ack is for sequence 0.
    let frame = within(gateway.recv_frame()).await.unwrap();
    assert!(matches!(frame, Frame::TunnelingAck(TunnelingAck { seq: 0, .. })));

    assert_eq!(within(tunnel.recv()).await.unwrap(), payload);
    assert!(timeout(Duration::from_millis(100), tunnel.recv()).await.is_err());
}

// Invariant 3: frames for a foreign channel produce no state change and no
// reply.
#[tokio::test]
async fn foreign_channel_is_rejected() {
    let (mut tunnel, mut gateway) = open_tunnel(7, test_config()).await;

    gateway.send_frame(&tunnel_req(9, 0, &sample_payload(1)));
    let payload = sample_payload(2);
    gateway.send_frame(&tunnel_req(7, 0, &payload));

    let frame = within(gateway.recv_frame()).await.unwrap();
    assert!(
        matches!(frame, Frame::TunnelingAck(TunnelingAck { channel: 7, seq: 0, .. })),
        "first reply must be the ack for the matching channel, got {frame:?}"
    );
    assert_eq!(within(tunnel.recv()).await.unwrap(), payload);
}

// Invariant 1: concurrent senders serialize on the sequence counter.
#[tokio::test]
async fn concurrent_sends_use_distinct_sequences() {
    let (tunnel, mut gateway) = open_tunnel(7, test_config()).await;
    let tunnel = Arc::new(tunnel);

    let first = tokio::spawn({
        let tunnel = Arc::clone(&tunnel);
        async move { tunnel.send(sample_payload(1)).await }
    });
    let second = tokio::spawn({
        let tunnel = Arc::clone(&tunnel);
        async move { tunnel.send(sample_payload(2)).await }
    });

    for expected_seq in 0..2u8 {
        let frame = within(gateway.recv_frame()).await.unwrap();
        let Frame::TunnelingRequest(request) = frame else {
            panic!("expected tunneling request");
        };
        assert_eq!(request.seq, expected_seq);
        gateway.send_frame(&ack(7, expected_seq));
    }

    within(first).await.unwrap().expect("first send failed");
    within(second).await.unwrap().expect("second send failed");
}

// S5: heartbeat failure triggers a reconnect; the consumer stream survives.
#[tokio::test]
async fn s5_heartbeat_failure_reconnects() {
    let config = TunnelConfig {
        resend_interval: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(100),
        response_timeout: Duration::from_millis(300),
    };
    let (mut tunnel, mut gateway) = open_tunnel(7, config).await;

    // Ignore connection state requests until the probe gives up and the
    // supervisor starts over with a fresh CONNECT_REQUEST.
    loop {
        let frame = within(gateway.recv_frame()).await.unwrap();
        match frame {
            Frame::ConnectionStateRequest(_) => {}
            Frame::ConnectRequest(_) => break,
            other => panic!("unexpected frame during heartbeat failure: {other:?}"),
        }
    }
    gateway.send_frame(&connect_ok(8));

    // The session continues transparently on the new channel.
    let payload = sample_payload(4);
    gateway.send_frame(&tunnel_req(8, 0, &payload));
    loop {
        let frame = within(gateway.recv_frame()).await.unwrap();
        match frame {
            // Late retransmissions and fresh probes may interleave here.
            Frame::ConnectRequest(_) => {}
            Frame::ConnectionStateRequest(request) => {
                gateway.send_frame(&Frame::ConnectionStateResponse(ConnectionStateResponse {
                    channel: request.channel,
                    status: CONN_STATE_NORMAL,
                }));
            }
            Frame::TunnelingAck(ack) => {
                assert_eq!(ack.channel, 8);
                assert_eq!(ack.seq, 0);
                break;
            }
            other => panic!("unexpected frame after reconnect: {other:?}"),
        }
    }
    assert_eq!(within(tunnel.recv()).await.unwrap(), payload);
}

// S6: a gateway disconnect is acknowledged; when the reconnect is denied,
// the inbound stream closes and further sends fail.
#[tokio::test]
async fn s6_gateway_disconnect_and_failed_reconnect() {
    let (mut tunnel, mut gateway) = open_tunnel(7, test_config()).await;

    gateway.send_frame(&Frame::DisconnectRequest(DisconnectRequest {
        channel: 7,
        control: Hpai::UNSPECIFIED,
    }));

    let frame = within(gateway.recv_frame()).await.unwrap();
    let Frame::DisconnectResponse(response) = frame else {
        panic!("expected disconnect response, got {frame:?}");
    };
    assert_eq!(response.channel, 7);
    assert_eq!(response.status, E_NO_ERROR);

    // One reconnect attempt follows; deny it.
    let frame = within(gateway.recv_frame()).await.unwrap();
    assert!(matches!(frame, Frame::ConnectRequest(_)));
    gateway.send_frame(&connect_denied(E_CONNECTION_TYPE));

    assert!(within(tunnel.recv()).await.is_none(), "inbound stream must close");
    assert!(tunnel.send(sample_payload(1)).await.is_err());
}

// Invariant 8: after a disconnect the session recovers when the gateway
// accepts the new connect request, and sequence counters restart.
#[tokio::test]
async fn reconnect_resets_outbound_sequence() {
    let (tunnel, mut gateway) = open_tunnel(7, test_config()).await;

    // Advance the outbound sequence to 1.
    let (sent, ()) = tokio::join!(tunnel.send(sample_payload(1)), async {
        let _ = within(gateway.recv_frame()).await.unwrap();
        gateway.send_frame(&ack(7, 0));
    });
    sent.unwrap();

    // Gateway drops the connection, then accepts the reconnect on a new
    // channel.
    gateway.send_frame(&Frame::DisconnectRequest(DisconnectRequest {
        channel: 7,
        control: Hpai::UNSPECIFIED,
    }));
    loop {
        let frame = within(gateway.recv_frame()).await.unwrap();
        match frame {
            Frame::DisconnectResponse(_) => {}
            Frame::ConnectRequest(_) => break,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    gateway.send_frame(&connect_ok(11));

    // Wait until the new channel is live: an inbound frame on it gets acked
    // once the reconnected dispatcher is running.
    gateway.send_frame(&tunnel_req(11, 0, &sample_payload(9)));
    loop {
        let frame = within(gateway.recv_frame()).await.unwrap();
        match frame {
            Frame::ConnectRequest(_) => {}
            Frame::TunnelingAck(ack) => {
                assert_eq!(ack.channel, 11);
                break;
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    // The next send starts over at sequence 0 on the new channel.
    let (sent, ()) = tokio::join!(tunnel.send(sample_payload(2)), async {
        let frame = within(gateway.recv_frame()).await.unwrap();
        let Frame::TunnelingRequest(request) = frame else {
            panic!("expected tunneling request, got {frame:?}");
        };
        assert_eq!(request.channel, 11);
        assert_eq!(request.seq, 0);
        gateway.send_frame(&ack(11, 0));
    });
    sent.expect("send after reconnect failed");
}

// Invariant 7: close is idempotent and emits exactly one disconnect request.
#[tokio::test]
async fn close_is_idempotent() {
    let (mut tunnel, mut gateway) = open_tunnel(7, test_config()).await;

    tunnel.close().await;
    let frame = within(gateway.recv_frame()).await.unwrap();
    assert!(matches!(
        frame,
        Frame::DisconnectRequest(DisconnectRequest { channel: 7, .. })
    ));

    tunnel.close().await;
    assert!(
        timeout(Duration::from_millis(100), gateway.recv_frame()).await.is_err(),
        "a second close must not emit another disconnect request"
    );
}

// A dead socket ends the session; the consumer stream closes.
#[tokio::test]
async fn transport_loss_closes_the_session() {
    let (mut tunnel, gateway) = open_tunnel(7, test_config()).await;

    drop(gateway);
    assert!(within(tunnel.recv()).await.is_none());
    assert!(tunnel.send(sample_payload(1)).await.is_err());
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use apf::channel::ChannelStore;
use apf::framing::ApfCodec;
use apf::messages::{
    peek_type, ChannelClose, ChannelData, ChannelOpen, ChannelOpenConfirmation,
    ChannelOpenFailure, ChannelWindowAdjust, MessageType, OpenFailureReason,
};
use apf::transport::response_complete;
use apf::{
    ChannelError, CiraTransport, Connection, NoopHandler, TransportError, Tunnel, TunnelConfig,
};
use bytes::BytesMut;
use http::{Request, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio_util::codec::Decoder;

/// Channels the firmware allows open at once.
const DEVICE_CHANNEL_LIMIT: usize = 6;

const SOAP_RESPONSE: &str = "<a:Envelope><a:Body><r:Ok/></a:Body></a:Envelope>";

#[derive(Clone, Copy)]
enum Behaviour {
    /// Confirms opens with the given window and answers each request.
    Answer { window: u32 },
    /// Like `Answer`, but holds each response back for `delay`.
    Delayed { window: u32, delay: Duration },
    /// Refuses every open.
    Refuse,
    /// Confirms, then closes the channel as soon as the request is in.
    CloseWithoutReply,
    /// Reads frames and never answers.
    Silent,
}

fn harness(config: TunnelConfig) -> (Arc<CiraTransport<ChannelStore>>, DuplexStream) {
    let (local, remote) = tokio::io::duplex(256 * 1024);
    let (reader, writer) = tokio::io::split(local);
    let store = Arc::new(ChannelStore::new(Arc::new(Connection::new(writer)), &config));
    let tunnel = Tunnel::new(store.clone(), NoopHandler, config.clone());
    tokio::spawn(async move {
        let _ = tunnel.run(reader).await;
    });
    (Arc::new(CiraTransport::new(store, config)), remote)
}

struct DeviceChannel {
    peer: u32,
    request: Vec<u8>,
}

async fn send(writer: &mut WriteHalf<DuplexStream>, frame: &[u8]) {
    writer.write_all(frame).await.unwrap();
}

fn http_response() -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/soap+xml\r\nContent-Length: {}\r\n\r\n{}",
        SOAP_RESPONSE.len(),
        SOAP_RESPONSE
    )
    .into_bytes()
}

async fn fake_device(stream: DuplexStream, behaviour: Behaviour) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut codec = ApfCodec::default();
    let mut buf = BytesMut::new();
    let mut channels: HashMap<u32, DeviceChannel> = HashMap::new();
    loop {
        let frame = match codec.decode(&mut buf).unwrap() {
            Some(frame) => frame,
            None => {
                if reader.read_buf(&mut buf).await.unwrap() == 0 {
                    return;
                }
                continue;
            }
        };
        match peek_type(&frame).unwrap() {
            MessageType::ChannelOpen => {
                let open = ChannelOpen::decode(&frame).unwrap();
                assert_eq!(open.channel_type, "forwarded-tcpip");
                let ours = open.sender_channel + 100;
                let window = match behaviour {
                    Behaviour::Silent => continue,
                    Behaviour::Refuse => {
                        let failure = ChannelOpenFailure {
                            recipient_channel: open.sender_channel,
                            reason: OpenFailureReason::ConnectFailed,
                        };
                        send(&mut writer, &failure.encode()).await;
                        continue;
                    }
                    Behaviour::Answer { window } | Behaviour::Delayed { window, .. } => window,
                    Behaviour::CloseWithoutReply => 4096,
                };
                channels.insert(
                    ours,
                    DeviceChannel {
                        peer: open.sender_channel,
                        request: Vec::new(),
                    },
                );
                assert!(
                    channels.len() <= DEVICE_CHANNEL_LIMIT,
                    "{} channels open at once",
                    channels.len()
                );
                let confirm = ChannelOpenConfirmation {
                    recipient_channel: open.sender_channel,
                    sender_channel: ours,
                    initial_window: window,
                };
                send(&mut writer, &confirm.encode()).await;
            }
            MessageType::ChannelData => {
                let data = ChannelData::decode(&frame).unwrap();
                let channel = channels.get_mut(&data.recipient_channel).unwrap();
                channel.request.extend_from_slice(&data.data);
                let peer = channel.peer;
                let adjust = ChannelWindowAdjust {
                    recipient_channel: peer,
                    bytes_to_add: data.data.len() as u32,
                };
                send(&mut writer, &adjust.encode()).await;
                if !response_complete(&channel.request) {
                    continue;
                }
                if matches!(behaviour, Behaviour::CloseWithoutReply) {
                    send(&mut writer, &ChannelClose { recipient_channel: peer }.encode()).await;
                    continue;
                }
                if let Behaviour::Delayed { delay, .. } = behaviour {
                    tokio::time::sleep(delay).await;
                }
                let response = http_response();
                let (head, tail) = response.split_at(response.len() / 2);
                send(&mut writer, &ChannelData::encode_slice(peer, head)).await;
                send(&mut writer, &ChannelData::encode_slice(peer, tail)).await;
            }
            MessageType::ChannelClose => {
                let close = ChannelClose::decode(&frame).unwrap();
                if let Some(channel) = channels.remove(&close.recipient_channel) {
                    send(
                        &mut writer,
                        &ChannelClose {
                            recipient_channel: channel.peer,
                        }
                        .encode(),
                    )
                    .await;
                }
            }
            _ => {}
        }
    }
}

fn wsman_request(body: &str) -> Request<Vec<u8>> {
    Request::post("http://10.0.0.5:16992/wsman")
        .header("Authorization", "Digest username=\"admin\"")
        .body(body.as_bytes().to_vec())
        .unwrap()
}

#[tokio::test]
async fn round_trip_returns_parsed_response() {
    let config = TunnelConfig::default();
    let (transport, remote) = harness(config.clone());
    tokio::spawn(fake_device(remote, Behaviour::Answer { window: 4096 }));

    let response = transport
        .round_trip(wsman_request("<s:Envelope><s:Body/></s:Envelope>"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body(), SOAP_RESPONSE.as_bytes());
    assert_eq!(transport.available_slots(), config.max_channels);
}

#[tokio::test]
async fn small_window_forces_chunked_send() {
    let config = TunnelConfig {
        max_frame_size: 32,
        ..TunnelConfig::default()
    };
    let (transport, remote) = harness(config);
    tokio::spawn(fake_device(remote, Behaviour::Answer { window: 24 }));

    let body = format!("<s:Envelope>{}</s:Envelope>", "x".repeat(500));
    let response = transport.round_trip(wsman_request(&body)).await.unwrap();
    assert_eq!(response.body(), SOAP_RESPONSE.as_bytes());
}

#[tokio::test]
async fn concurrent_round_trips_share_the_connection() {
    let (transport, remote) = harness(TunnelConfig::default());
    tokio::spawn(fake_device(remote, Behaviour::Answer { window: 64 }));

    let calls: Vec<_> = (0..12)
        .map(|i| {
            let transport = transport.clone();
            tokio::spawn(async move {
                let body = format!("<s:Envelope>{i}</s:Envelope>");
                transport.round_trip(wsman_request(&body)).await
            })
        })
        .collect();
    for call in calls {
        let response = call.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn refused_open_is_reported() {
    let (transport, remote) = harness(TunnelConfig::default());
    tokio::spawn(fake_device(remote, Behaviour::Refuse));

    let err = transport
        .round_trip(wsman_request("<s:Envelope/>"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::Channel(ChannelError::OpenFailed(OpenFailureReason::ConnectFailed))
    ));
}

#[tokio::test]
async fn close_without_reply_is_empty_response() {
    let (transport, remote) = harness(TunnelConfig::default());
    tokio::spawn(fake_device(remote, Behaviour::CloseWithoutReply));

    let err = transport
        .round_trip(wsman_request("<s:Envelope/>"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::EmptyResponse));
}

#[tokio::test(start_paused = true)]
async fn open_without_confirmation_times_out() {
    let config = TunnelConfig {
        open_timeout_ms: 500,
        ..TunnelConfig::default()
    };
    let (transport, remote) = harness(config);
    tokio::spawn(fake_device(remote, Behaviour::Silent));

    let err = transport
        .round_trip(wsman_request("<s:Envelope/>"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Channel(ChannelError::Timeout(_))));
    assert_eq!(transport.available_slots(), 6);
}

#[tokio::test(start_paused = true)]
async fn seventh_exchange_waits_for_a_slot() {
    let config = TunnelConfig {
        open_timeout_ms: 2_000,
        slot_timeout_ms: 50,
        ..TunnelConfig::default()
    };
    let (transport, remote) = harness(config);
    tokio::spawn(fake_device(remote, Behaviour::Silent));

    let pending: Vec<_> = (0..6)
        .map(|_| {
            let transport = transport.clone();
            tokio::spawn(async move { transport.round_trip(wsman_request("<s:Envelope/>")).await })
        })
        .collect();
    while transport.available_slots() > 0 {
        tokio::task::yield_now().await;
    }

    let err = transport
        .round_trip(wsman_request("<s:Envelope/>"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout("channel slot")));

    for call in pending {
        assert!(matches!(
            call.await.unwrap(),
            Err(TransportError::Channel(ChannelError::Timeout(_)))
        ));
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(transport.available_slots(), 6);
}

#[tokio::test(start_paused = true)]
async fn seventh_exchange_runs_once_a_slot_frees() {
    let (transport, remote) = harness(TunnelConfig::default());
    tokio::spawn(fake_device(
        remote,
        Behaviour::Delayed {
            window: 4096,
            delay: Duration::from_millis(200),
        },
    ));

    let spawn_call = |i: usize| {
        let transport = transport.clone();
        tokio::spawn(async move {
            let body = format!("<s:Envelope>{i}</s:Envelope>");
            transport.round_trip(wsman_request(&body)).await
        })
    };
    let mut calls: Vec<_> = (0..6).map(&spawn_call).collect();
    while transport.available_slots() > 0 {
        tokio::task::yield_now().await;
    }
    let seventh = spawn_call(6);
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!seventh.is_finished());
    calls.push(seventh);

    for call in calls {
        let response = call.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(transport.available_slots(), 6);
}

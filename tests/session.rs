//! End-to-end session tests against a loopback mock device.
//!
//! The mock speaks the device side of the protocol using the crate's own
//! codec: 55AA framing, ECB payloads, and the v3.4 session-key handshake.

use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;
use tuyalan::crypto::TuyaCipher;
use tuyalan::protocol::{self, CommandType, PREFIX_55AA, PREFIX_6699, TuyaMessage, Version};
use tuyalan::{Device, DeviceBuilder, TuyaError};

const KEY: &[u8; 16] = b"0123456789abcdef";
const DEVICE_NONCE: &[u8; 16] = b"fedcba9876543210";

#[derive(Clone, Copy)]
struct MockConfig {
    version: Version,
    /// Close the socket instead of answering the first data request.
    drop_first_request: bool,
    /// Answer data requests at all.
    respond: bool,
    /// Answer data requests with a bare zero-length ack frame.
    respond_empty: bool,
    /// Delay before each response, so it lands after the client's
    /// post-write buffer flush.
    response_delay: Duration,
}

impl MockConfig {
    fn v33() -> Self {
        Self {
            version: Version::V3_3,
            drop_first_request: false,
            respond: true,
            respond_empty: false,
            response_delay: Duration::from_millis(80),
        }
    }

    fn v34() -> Self {
        Self {
            version: Version::V3_4,
            ..Self::v33()
        }
    }

    fn v35() -> Self {
        Self {
            version: Version::V3_5,
            // Long enough to outlive the client's triple buffer flush.
            response_delay: Duration::from_millis(150),
            ..Self::v33()
        }
    }
}

#[derive(Default)]
struct MockState {
    connections: AtomicU32,
    negotiations: AtomicU32,
    request_seqnos: Mutex<Vec<u32>>,
}

async fn start_mock(config: MockConfig) -> (u16, Arc<MockState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let state = Arc::new(MockState::default());

    let accept_state = state.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            accept_state.connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(handle_connection(stream, config, accept_state.clone()));
        }
    });
    (port, state)
}

async fn handle_connection(mut stream: TcpStream, config: MockConfig, state: Arc<MockState>) {
    let local_key = *KEY;
    let mut session_key = local_key;
    let mut client_nonce = [0u8; 16];
    let mut served = 0u32;

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        while let Ok(Some((_, frame))) = protocol::extract_frame(&mut buf) {
            let hmac_key = config
                .version
                .uses_session_key()
                .then_some(&session_key[..]);
            let Ok(msg) = protocol::unpack_message(&frame, hmac_key, None, Some(true)) else {
                return;
            };

            if msg.cmd == CommandType::SessKeyNegStart as u32 {
                let cipher = TuyaCipher::new(&local_key);
                // 6699 framing already decrypted the nonce; 55AA carries it ECB.
                let nonce = if config.version.uses_6699() {
                    msg.payload.clone()
                } else {
                    cipher.decrypt_ecb(&msg.payload, false).unwrap()
                };
                client_nonce.copy_from_slice(&nonce[..16]);

                let mut mac = Hmac::<Sha256>::new_from_slice(&local_key).unwrap();
                mac.update(&client_nonce);
                let mut body = DEVICE_NONCE.to_vec();
                body.extend_from_slice(&mac.finalize().into_bytes());

                let (payload, prefix, retcode) = if config.version.uses_6699() {
                    (body, PREFIX_6699, None)
                } else {
                    (cipher.encrypt_ecb(&body, true).unwrap(), PREFIX_55AA, Some(0))
                };
                let resp = TuyaMessage {
                    seqno: msg.seqno,
                    cmd: CommandType::SessKeyNegResp as u32,
                    retcode,
                    payload,
                    prefix,
                    ..Default::default()
                };
                let packed = protocol::pack_message(&resp, Some(&local_key[..])).unwrap();
                stream.write_all(&packed).await.unwrap();
            } else if msg.cmd == CommandType::SessKeyNegFinish as u32 {
                let cipher = TuyaCipher::new(&local_key);
                let finish = if config.version.uses_6699() {
                    msg.payload.clone()
                } else {
                    cipher.decrypt_ecb(&msg.payload, false).unwrap()
                };
                let mut mac = Hmac::<Sha256>::new_from_slice(&local_key).unwrap();
                mac.update(DEVICE_NONCE);
                mac.verify_slice(&finish[..32]).expect("finish hmac");

                let mut xored = [0u8; 16];
                for i in 0..16 {
                    xored[i] = client_nonce[i] ^ DEVICE_NONCE[i];
                }
                let derived = if config.version.uses_6699() {
                    cipher
                        .encrypt_gcm(&xored, Some(&client_nonce[..12]), None)
                        .unwrap()[12..28]
                        .to_vec()
                } else {
                    cipher.encrypt_ecb(&xored, false).unwrap()
                };
                session_key.copy_from_slice(&derived[..16]);
                state.negotiations.fetch_add(1, Ordering::SeqCst);
            } else {
                state.request_seqnos.lock().unwrap().push(msg.seqno);
                served += 1;
                if config.drop_first_request && served == 1 {
                    return;
                }
                if !config.respond {
                    continue;
                }
                if config.respond_empty {
                    tokio::time::sleep(config.response_delay).await;
                    let ack = TuyaMessage {
                        seqno: msg.seqno,
                        cmd: msg.cmd,
                        retcode: Some(0),
                        prefix: PREFIX_55AA,
                        ..Default::default()
                    };
                    let packed = protocol::pack_message(&ack, None).unwrap();
                    if stream.write_all(&packed).await.is_err() {
                        return;
                    }
                    continue;
                }

                let request = decode_request(&msg.payload, config.version, &session_key);
                let dps = request
                    .as_ref()
                    .and_then(|v| v.get("dps").or_else(|| v.pointer("/data/dps")))
                    .cloned()
                    .unwrap_or_else(|| json!({"1": true, "2": 17}));

                tokio::time::sleep(config.response_delay).await;
                let body = serde_json::to_vec(&json!({"dps": dps})).unwrap();
                let (payload, prefix) = if config.version.uses_6699() {
                    (body, PREFIX_6699)
                } else {
                    let cipher = TuyaCipher::new(&session_key);
                    (cipher.encrypt_ecb(&body, true).unwrap(), PREFIX_55AA)
                };
                let resp = TuyaMessage {
                    seqno: msg.seqno,
                    cmd: msg.cmd,
                    retcode: Some(0),
                    payload,
                    prefix,
                    ..Default::default()
                };
                let hmac_key = config
                    .version
                    .uses_session_key()
                    .then_some(&session_key[..]);
                let packed = protocol::pack_message(&resp, hmac_key).unwrap();
                if stream.write_all(&packed).await.is_err() {
                    return;
                }
            }
        }

        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn decode_request(payload: &[u8], version: Version, session_key: &[u8; 16]) -> Option<Value> {
    let cipher = TuyaCipher::new(session_key);
    let mut plain = if version.uses_6699() {
        payload.to_vec()
    } else if version >= Version::V3_4 {
        cipher.decrypt_ecb(payload, false).ok()?
    } else {
        let stripped = if payload.starts_with(version.as_bytes()) {
            &payload[15..]
        } else {
            payload
        };
        cipher.decrypt_ecb(stripped, false).ok()?
    };
    if plain.starts_with(version.as_bytes()) && plain.len() >= 15 {
        plain.drain(..15);
    }
    serde_json::from_slice(&plain).ok()
}

fn test_device(port: u16, version: &str) -> Device {
    DeviceBuilder::new("abc", &KEY[..])
        .address("127.0.0.1")
        .port(port)
        .version(version)
        .connection_timeout(Duration::from_secs(1))
        .retry_limit(1)
        .retry_delay(Duration::from_millis(10))
        .build()
        .unwrap()
}

#[tokio::test]
async fn v33_status_round_trip() {
    let (port, state) = start_mock(MockConfig::v33()).await;
    let device = test_device(port, "3.3");

    let status = device.status().await.unwrap();
    assert_eq!(status["success"], json!(true));
    assert_eq!(status["dps"], json!({"1": true, "2": 17}));

    // The snapshot is cached for I/O-free reads.
    let cached = device.cached_status().unwrap();
    assert_eq!(cached["dps"], status["dps"]);

    device.close().await;
    assert_eq!(state.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn v33_control_echoes_requested_dps() {
    let (port, _state) = start_mock(MockConfig::v33()).await;
    let device = test_device(port, "3.3");

    let result = device.set_status(true, "1", false).await.unwrap();
    assert_eq!(result["dps"], json!({"1": true}));

    let result = device.set_value(2, json!(42), false).await.unwrap();
    assert_eq!(result["dps"], json!({"2": 42}));

    device.close().await;
}

#[tokio::test]
async fn v34_negotiates_before_first_request() {
    let (port, state) = start_mock(MockConfig::v34()).await;
    let device = test_device(port, "3.4");

    let status = device.status().await.unwrap();
    assert_eq!(status["success"], json!(true));
    assert_eq!(status["dps"], json!({"1": true, "2": 17}));
    assert_eq!(state.negotiations.load(Ordering::SeqCst), 1);

    // The same negotiated socket serves follow-up operations.
    let again = device.status().await.unwrap();
    assert_eq!(again["success"], json!(true));
    assert_eq!(state.connections.load(Ordering::SeqCst), 1);
    assert_eq!(state.negotiations.load(Ordering::SeqCst), 1);

    device.close().await;
}

#[tokio::test]
async fn v35_full_session_over_6699() {
    let (port, state) = start_mock(MockConfig::v35()).await;
    let device = test_device(port, "3.5");

    let status = device.status().await.unwrap();
    assert_eq!(status["success"], json!(true));
    assert_eq!(status["dps"], json!({"1": true, "2": 17}));
    assert_eq!(state.negotiations.load(Ordering::SeqCst), 1);

    let result = device.set_value(1, json!(false), false).await.unwrap();
    assert_eq!(result["dps"], json!({"1": false}));
    assert_eq!(state.connections.load(Ordering::SeqCst), 1);

    device.close().await;
}

#[tokio::test]
async fn v33_set_multiple_and_update_dps() {
    let (port, _state) = start_mock(MockConfig::v33()).await;
    let device = test_device(port, "3.3");

    let result = device
        .set_multiple_values(json!({"1": true, "7": "low"}), false)
        .await
        .unwrap();
    assert_eq!(result["dps"], json!({"1": true, "7": "low"}));

    // update-dps requests name dpId rather than dps; the device replies
    // with a status push.
    let result = device.update_dps(&[4, 5], false).await.unwrap();
    assert_eq!(result["success"], json!(true));
    assert_eq!(result["dps"], json!({"1": true, "2": 17}));

    device.close().await;
}

#[tokio::test]
async fn error_recovery_reopens_and_renegotiates() {
    let (port, state) = start_mock(MockConfig {
        drop_first_request: true,
        ..MockConfig::v34()
    })
    .await;
    let device = test_device(port, "3.4");

    // The device hangs up mid-operation: the engine closes and reports.
    assert!(device.status().await.is_err());

    // Next call opens a fresh socket and re-runs the handshake.
    let status = device.status().await.unwrap();
    assert_eq!(status["success"], json!(true));
    assert_eq!(state.connections.load(Ordering::SeqCst), 2);
    assert_eq!(state.negotiations.load(Ordering::SeqCst), 2);

    // The sequence counter survives the reconnect.
    let seqnos = state.request_seqnos.lock().unwrap().clone();
    assert!(seqnos.windows(2).all(|w| w[0] < w[1]), "seqnos: {:?}", seqnos);

    device.close().await;
}

#[tokio::test]
async fn empty_ack_resolves_to_bare_success() {
    let (port, _state) = start_mock(MockConfig {
        respond_empty: true,
        ..MockConfig::v33()
    })
    .await;
    let device = DeviceBuilder::new("abc", &KEY[..])
        .address("127.0.0.1")
        .port(port)
        .version("3.3")
        .connection_timeout(Duration::from_millis(300))
        .retry_limit(1)
        .build()
        .unwrap();

    // The device acknowledges with an empty frame and sends nothing else.
    let result = device.set_value(3, json!(true), false).await.unwrap();
    assert_eq!(result, json!({"success": true}));
    assert!(result.get("dps").is_none());

    device.close().await;
}

#[tokio::test]
async fn read_timeout_closes_the_socket() {
    let (port, state) = start_mock(MockConfig {
        respond: false,
        ..MockConfig::v33()
    })
    .await;
    let device = DeviceBuilder::new("abc", &KEY[..])
        .address("127.0.0.1")
        .port(port)
        .version("3.3")
        .connection_timeout(Duration::from_millis(250))
        .retry_limit(1)
        .build()
        .unwrap();

    let err = device.status().await.unwrap_err();
    assert!(matches!(err, TuyaError::Timeout), "got {:?}", err);

    // Recovery path: a fresh connection on the next call.
    let _ = device.heartbeat(true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state.connections.load(Ordering::SeqCst), 2);

    device.close().await;
}

#[tokio::test]
async fn nowait_returns_after_the_write() {
    let (port, _state) = start_mock(MockConfig {
        respond: false,
        ..MockConfig::v33()
    })
    .await;
    let device = test_device(port, "3.3");

    let started = tokio::time::Instant::now();
    let result = device.set_value(1, json!(true), true).await.unwrap();
    assert_eq!(result, json!({"success": true}));
    assert!(started.elapsed() < Duration::from_millis(500));

    device.close().await;
}

#[tokio::test]
async fn non_persistent_handle_closes_after_each_operation() {
    let (port, state) = start_mock(MockConfig::v33()).await;
    let device = DeviceBuilder::new("abc", &KEY[..])
        .address("127.0.0.1")
        .port(port)
        .version("3.3")
        .connection_timeout(Duration::from_secs(1))
        .persist(false)
        .build()
        .unwrap();

    device.status().await.unwrap();
    device.status().await.unwrap();
    assert_eq!(state.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn concurrent_callers_each_get_their_own_response() {
    let (port, state) = start_mock(MockConfig::v33()).await;
    let device = Arc::new(test_device(port, "3.3"));

    let mut handles = Vec::new();
    for i in 1u32..=4 {
        let device = device.clone();
        handles.push(tokio::spawn(async move {
            let result = device.set_value(i, json!(100 + i), false).await.unwrap();
            (i, result)
        }));
    }
    for handle in handles {
        let (i, result) = handle.await.unwrap();
        assert_eq!(
            result["dps"],
            json!({ i.to_string(): 100 + i }),
            "caller {} received someone else's response",
            i
        );
    }

    // Requests reached the device strictly one at a time, in seqno order.
    let seqnos = state.request_seqnos.lock().unwrap().clone();
    assert_eq!(seqnos.len(), 4);
    assert!(seqnos.windows(2).all(|w| w[0] < w[1]), "seqnos: {:?}", seqnos);

    device.close().await;
}

//! End-to-end tests: framed requests over an in-memory stream.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use rendezvous_worker::codec::MsgPackCodec;
use rendezvous_worker::device::{CpuDevice, DeviceSet};
use rendezvous_worker::protocol::FRAME_MAGIC;
use rendezvous_worker::rendezvous::{LocalRendezvous, RendezvousArgs};
use rendezvous_worker::service::{FusedRecvTensorRequest, RecvTensorRequest};
use rendezvous_worker::transfer::{FusedTensorResponse, TensorResponse};
use rendezvous_worker::{MethodId, Server, StatusCode, WorkerEnv};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

fn start() -> (Arc<LocalRendezvous>, Server) {
    let rendezvous = Arc::new(LocalRendezvous::new());
    let devices = DeviceSet::new().with_device(Arc::new(CpuDevice::new(CPU0, CPU_INCARNATION)));
    let env = WorkerEnv::new(Arc::new(devices), rendezvous.clone())
        .with_graph(Arc::new(EchoGraph::default()));
    let server = Server::builder(env).max_concurrent_calls(8).build().unwrap();
    (rendezvous, server)
}

fn recv_request(step_id: i64, key: &str) -> Vec<u8> {
    MsgPackCodec::encode(&RecvTensorRequest {
        step_id,
        rendezvous_key: key.to_string(),
        recv_req_start_micros: 0,
    })
    .unwrap()
}

#[tokio::test]
async fn test_publish_then_receive_over_the_wire() {
    let (rendezvous, server) = start();
    let (client_end, server_end) = duplex(64 * 1024);
    let _connection = server.serve_connection(server_end);
    let mut client = FrameClient::new(client_end);

    let value = floats(&[1.0, 2.0, 3.0]);
    rendezvous
        .send(7, &parse(&cpu_key("K")), RendezvousArgs::host(), value.clone())
        .unwrap();
    rendezvous
        .send_dead(7, &parse(&cpu_key("K2")), RendezvousArgs::host())
        .unwrap();

    client
        .request(MethodId::RecvTensor.as_u8(), 1, &recv_request(7, &cpu_key("K")))
        .await;
    let frame = client.next_frame().await;
    assert_eq!(frame.tag(), 1);
    assert!(frame.is_response());
    frame.status().unwrap();
    let response = TensorResponse::decode(frame.payload.clone()).unwrap();
    assert_eq!(response.slot.payload.to_tensor().unwrap(), value);
    assert!(!response.slot.is_dead);

    client
        .request(MethodId::RecvTensor.as_u8(), 2, &recv_request(7, &cpu_key("K2")))
        .await;
    let frame = client.next_frame().await;
    assert_eq!(frame.tag(), 2);
    let response = TensorResponse::decode(frame.payload.clone()).unwrap();
    assert!(response.slot.is_dead);
    assert!(response.slot.payload.to_tensor().unwrap().is_empty());
}

#[tokio::test]
async fn test_fused_over_the_wire_in_key_order() {
    let (rendezvous, server) = start();
    let (client_end, server_end) = duplex(64 * 1024);
    let _connection = server.serve_connection(server_end);
    let mut client = FrameClient::new(client_end);

    let request = MsgPackCodec::encode(&FusedRecvTensorRequest {
        step_id: 7,
        rendezvous_keys: vec![cpu_key("K"), cpu_key("K2")],
        recv_req_start_micros: 0,
    })
    .unwrap();
    client
        .request(MethodId::FusedRecvTensor.as_u8(), 40, &request)
        .await;

    // publish after the request so the lookup has to wait
    tokio::time::sleep(Duration::from_millis(5)).await;
    rendezvous
        .send_dead(7, &parse(&cpu_key("K2")), RendezvousArgs::host())
        .unwrap();
    rendezvous
        .send(7, &parse(&cpu_key("K")), RendezvousArgs::host(), floats(&[4.0]))
        .unwrap();

    let frame = client.next_frame().await;
    assert_eq!(frame.tag(), 40);
    let response = FusedTensorResponse::decode(frame.payload.clone()).unwrap();
    assert_eq!(response.slots.len(), 2);
    assert_eq!(response.slots[0].payload.to_tensor().unwrap(), floats(&[4.0]));
    assert!(!response.slots[0].is_dead);
    assert!(response.slots[1].is_dead);
}

#[tokio::test]
async fn test_error_frames_carry_status() {
    let (_, server) = start();
    let (client_end, server_end) = duplex(64 * 1024);
    let _connection = server.serve_connection(server_end);
    let mut client = FrameClient::new(client_end);

    client.request(MethodId::CompleteGroup.as_u8(), 5, b"").await;
    let frame = client.next_frame().await;
    assert_eq!(frame.tag(), 5);
    assert!(frame.is_error());
    assert_eq!(frame.header.status, StatusCode::Unimplemented.as_u8());
    assert!(String::from_utf8_lossy(&frame.payload).contains("CompleteGroup"));

    client
        .request(MethodId::RecvTensor.as_u8(), 6, &recv_request(1, "nope"))
        .await;
    let frame = client.next_frame().await;
    assert_eq!(frame.tag(), 6);
    assert_eq!(frame.header.status, StatusCode::InvalidArgument.as_u8());
    let err = frame.status().unwrap_err();
    assert_eq!(err.status_code(), StatusCode::InvalidArgument);
}

#[tokio::test]
async fn test_unknown_method_byte() {
    let (_, server) = start();
    let (client_end, server_end) = duplex(64 * 1024);
    let _connection = server.serve_connection(server_end);
    let mut client = FrameClient::new(client_end);

    client.request(200, 9, b"").await;
    let frame = client.next_frame().await;
    assert_eq!(frame.tag(), 9);
    assert_eq!(frame.method(), 200);
    assert_eq!(frame.header.status, StatusCode::Unimplemented.as_u8());
}

#[tokio::test]
async fn test_cancel_frame_does_not_drop_call() {
    let (rendezvous, server) = start();
    let (client_end, server_end) = duplex(64 * 1024);
    let _connection = server.serve_connection(server_end);
    let mut client = FrameClient::new(client_end);

    client
        .request(MethodId::RecvTensor.as_u8(), 77, &recv_request(3, &cpu_key("late")))
        .await;
    while rendezvous.waiting_count() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    client.cancel(MethodId::RecvTensor.as_u8(), 77).await;
    // cancel for a tag that isn't running is ignored
    client.cancel(MethodId::RecvTensor.as_u8(), 1234).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    rendezvous
        .send(3, &parse(&cpu_key("late")), RendezvousArgs::host(), floats(&[8.0]))
        .unwrap();
    let frame = client.next_frame().await;
    assert_eq!(frame.tag(), 77);
    frame.status().unwrap();
}

#[tokio::test]
async fn test_forwarded_method_over_the_wire() {
    let (_, server) = start();
    let (client_end, server_end) = duplex(64 * 1024);
    let _connection = server.serve_connection(server_end);
    let mut client = FrameClient::new(client_end);

    client.request(MethodId::Logging.as_u8(), 3, b"level=1").await;
    let frame = client.next_frame().await;
    assert_eq!(frame.tag(), 3);
    assert_eq!(&frame.payload[..], b"Logging:level=1");
}

#[tokio::test]
async fn test_connection_closes_cleanly() {
    let (_, server) = start();
    let (client_end, server_end) = duplex(1024);
    let connection = server.serve_connection(server_end);
    FrameClient::new(client_end).close().await;
    tokio::time::timeout(Duration::from_secs(1), connection.wait_for_shutdown())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_bad_magic_closes_connection() {
    let (_, server) = start();
    let (mut client_end, server_end) = duplex(1024);
    let connection = server.serve_connection(server_end);

    let mut garbage = [0u8; 16];
    garbage[0] = FRAME_MAGIC.wrapping_add(1);
    garbage[1] = MethodId::GetStatus.as_u8();
    client_end.write_all(&garbage).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), connection.wait_for_shutdown())
        .await
        .unwrap();
    assert!(result.is_err());

    // nothing was answered
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_millis(50), client_end.read(&mut buf)).await;
    assert!(!matches!(read, Ok(Ok(n)) if n > 0));
}

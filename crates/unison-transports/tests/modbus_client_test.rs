//! Modbus-TCP client against a minimal in-process server.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use unison_core::Value;
use unison_transports::{
    ModbusClient, ModbusConfig, Protocol, TransportAddress, TransportClient, TransportMetadata,
};

#[derive(Default)]
struct Tables {
    holding: Vec<u16>,
    coils: Vec<bool>,
}

type Shared = Arc<Mutex<Tables>>;

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Handles function codes 1, 3, 5, 6, 15 and 16; anything else gets an
/// illegal-function exception.
fn handle(tables: &Shared, function: u8, data: &[u8]) -> Vec<u8> {
    let word = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);
    let mut t = tables.lock();
    match function {
        0x01 => {
            let (start, count) = (usize::from(word(0)), usize::from(word(2)));
            let bytes = pack_bits(&t.coils[start..start + count]);
            let mut pdu = vec![function, bytes.len() as u8];
            pdu.extend(bytes);
            pdu
        }
        0x03 => {
            let (start, count) = (usize::from(word(0)), usize::from(word(2)));
            let mut pdu = vec![function, (count * 2) as u8];
            for value in &t.holding[start..start + count] {
                pdu.extend_from_slice(&value.to_be_bytes());
            }
            pdu
        }
        0x05 => {
            t.coils[usize::from(word(0))] = word(2) == 0xFF00;
            let mut pdu = vec![function];
            pdu.extend_from_slice(&data[..4]);
            pdu
        }
        0x06 => {
            t.holding[usize::from(word(0))] = word(2);
            let mut pdu = vec![function];
            pdu.extend_from_slice(&data[..4]);
            pdu
        }
        0x0F => {
            let (start, count) = (usize::from(word(0)), usize::from(word(2)));
            for i in 0..count {
                t.coils[start + i] = data[5 + i / 8] & (1 << (i % 8)) != 0;
            }
            let mut pdu = vec![function];
            pdu.extend_from_slice(&data[..4]);
            pdu
        }
        0x10 => {
            let (start, count) = (usize::from(word(0)), usize::from(word(2)));
            for i in 0..count {
                t.holding[start + i] = word(5 + i * 2);
            }
            let mut pdu = vec![function];
            pdu.extend_from_slice(&data[..4]);
            pdu
        }
        _ => vec![function | 0x80, 0x01],
    }
}

async fn serve(mut stream: TcpStream, tables: Shared) {
    loop {
        let mut header = [0u8; 7];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let len = usize::from(u16::from_be_bytes([header[4], header[5]]));
        let mut pdu = vec![0u8; len - 1];
        if stream.read_exact(&mut pdu).await.is_err() {
            return;
        }
        let reply = handle(&tables, pdu[0], &pdu[1..]);
        let mut frame = header[..4].to_vec();
        frame.extend_from_slice(&((reply.len() + 1) as u16).to_be_bytes());
        frame.push(header[6]);
        frame.extend(reply);
        if stream.write_all(&frame).await.is_err() {
            return;
        }
    }
}

async fn spawn_server(tables: Shared) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream, tables.clone()));
        }
    });
    port
}

fn tables() -> Shared {
    Arc::new(Mutex::new(Tables {
        holding: (0..32).map(|i| i * 10).collect(),
        coils: vec![false; 32],
    }))
}

fn client(port: u16) -> ModbusClient {
    ModbusClient::new(
        TransportMetadata::new("plc", "PLC"),
        ModbusConfig::new("127.0.0.1").with_port(port).with_timeout(2),
    )
}

fn address(input: &str) -> TransportAddress {
    TransportAddress::parse(Protocol::Modbus, input).unwrap()
}

#[tokio::test]
async fn test_read_registers_scalar_and_list() {
    let client = client(spawn_server(tables()).await);
    assert_eq!(client.read(&address("holding:3")).await.unwrap(), Value::Int(30));
    assert_eq!(
        client.read(&address("holding:4:3")).await.unwrap(),
        Value::List(vec![Value::Int(40), Value::Int(50), Value::Int(60)])
    );
}

#[tokio::test]
async fn test_write_registers() {
    let tables = tables();
    let client = client(spawn_server(tables.clone()).await);

    client.write(&address("holding:1"), Value::Int(-2)).await.unwrap();
    assert_eq!(tables.lock().holding[1], 0xFFFE);

    let values = Value::List(vec![Value::Int(7), Value::Int(8)]);
    client.write(&address("holding:10:2"), values).await.unwrap();
    assert_eq!(&tables.lock().holding[10..12], &[7, 8]);
}

#[tokio::test]
async fn test_coils_round_trip() {
    let tables = tables();
    let client = client(spawn_server(tables.clone()).await);

    client.write(&address("coil:2"), Value::Bool(true)).await.unwrap();
    assert_eq!(client.read(&address("coil:2")).await.unwrap(), Value::Bool(true));

    let bits = Value::List(vec![Value::Bool(true), Value::Bool(false), Value::Bool(true)]);
    client.write(&address("coil:8:3"), bits.clone()).await.unwrap();
    assert_eq!(client.read(&address("coil:8:3")).await.unwrap(), bits);
    assert!(tables.lock().coils[10]);
}

#[tokio::test]
async fn test_exception_response_is_an_error() {
    let client = client(spawn_server(tables()).await);
    // Function 4 (input registers) is not served.
    let err = client.read(&address("input:0")).await.unwrap_err();
    assert!(!err.is_timeout(), "{err}");
}

//! TCP front end round trips.

use device_server::network::{LineServer, GREETING};
use device_server::tracing_setup::LogControl;
use device_server::{ActionDispatcher, DeviceRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

async fn start_server(
    devices: &str,
    idle: Option<Duration>,
) -> (std::net::SocketAddr, Arc<DeviceRegistry>) {
    let registry = Arc::new(DeviceRegistry::new());
    registry.load_str("mem", devices).await.unwrap();
    let dispatcher = ActionDispatcher::new(Arc::clone(&registry), LogControl::detached(2));
    let server = LineServer::bind("127.0.0.1:0".parse().unwrap(), dispatcher, idle)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    (addr, registry)
}

async fn read_reply(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Vec<String> {
    let mut reply = Vec::new();
    while let Some(line) = lines.next_line().await.unwrap() {
        let done = line == "#OK" || line.starts_with("#Error: ");
        reply.push(line);
        if done {
            break;
        }
    }
    reply
}

#[tokio::test]
async fn test_requests_over_tcp() {
    let (addr, registry) = start_server("door test\n", None).await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let greeting = lines.next_line().await.unwrap().unwrap();
    assert_eq!(format!("{greeting}\n"), GREETING);

    writer.write_all(b"door/ask/#hello\n").await.unwrap();
    assert_eq!(read_reply(&mut lines).await, vec!["##hello", "#OK"]);

    writer.write_all(b"nosuch/ask/x\r\n").await.unwrap();
    assert_eq!(
        read_reply(&mut lines).await,
        vec!["#Error: unknown device: nosuch"]
    );

    writer.write_all(b"SERVER/ping\n").await.unwrap();
    assert_eq!(read_reply(&mut lines).await, vec!["#OK"]);

    let door = registry.lookup("door").await.unwrap();
    assert!(door.is_open());

    drop(writer);
    drop(lines);
    // cleanup runs when the server notices the disconnect
    for _ in 0..100 {
        if !door.is_open() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!door.is_open());
}

#[tokio::test]
async fn test_connections_get_distinct_ids() {
    let (addr, registry) = start_server("door test\n", None).await;
    let mut clients = Vec::new();
    for _ in 0..2 {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        lines.next_line().await.unwrap();
        writer.write_all(b"door/ask/x\n").await.unwrap();
        read_reply(&mut lines).await;
        clients.push((lines, writer));
    }
    let door = registry.lookup("door").await.unwrap();
    assert_eq!(door.user_count(), 2);
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let (addr, _registry) = start_server("", Some(Duration::from_millis(100))).await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut lines = BufReader::new(stream).lines();
    lines.next_line().await.unwrap();
    let end = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(end, None);
}

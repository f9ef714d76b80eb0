#![cfg(unix)]

use std::net::TcpStream;
use std::time::Duration;

use termcast_core::FRAME_MAGIC;
use termcast_core::FrameHeader;
use termcast_core::parse_broadcast;
use termcast_daemon::CreateSessionOptions;
use termcast_daemon::Daemon;
use termcast_daemon::DaemonConfig;
use tungstenite::Message;
use tungstenite::WebSocket;
use tungstenite::stream::MaybeTlsStream;

type Client = WebSocket<MaybeTlsStream<TcpStream>>;

fn start(max_connections: usize) -> (Daemon, tempfile::TempDir) {
    let control = tempfile::tempdir().unwrap();
    let config = DaemonConfig::default()
        .with_listen("127.0.0.1:0")
        .with_control_dir(control.path())
        .with_max_connections(max_connections)
        .with_broadcast_interval(Duration::from_millis(10));
    (Daemon::start(&config).unwrap(), control)
}

fn connect(daemon: &Daemon) -> Client {
    let (client, _response) = tungstenite::connect(daemon.ws_url()).unwrap();
    if let MaybeTlsStream::Plain(stream) = client.get_ref() {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
    }
    client
}

fn next_binary(client: &mut Client) -> Vec<u8> {
    loop {
        match client.read().unwrap() {
            Message::Binary(data) => return data,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {:?}", other),
        }
    }
}

fn subscribe(client: &mut Client, session_id: &str) {
    let text = format!(r#"{{"type":"subscribe","sessionId":"{}"}}"#, session_id);
    client.send(Message::Text(text)).unwrap();
}

#[test]
fn two_viewers_receive_frames_for_the_same_session() {
    let (daemon, _control) = start(4);
    let workdir = tempfile::tempdir().unwrap();
    let id = daemon
        .manager()
        .create_session(vec!["cat".to_string()], CreateSessionOptions::new(workdir.path()))
        .unwrap();

    let mut a = connect(&daemon);
    let mut b = connect(&daemon);
    for client in [&mut a, &mut b] {
        subscribe(client, id.as_str());
        let message = next_binary(client);
        assert_eq!(message[0], 0xbf);
        let (session, frame) = parse_broadcast(&message).unwrap();
        assert_eq!(session, id.as_str());
        assert_eq!(u16::from_le_bytes([frame[0], frame[1]]), FRAME_MAGIC);
        let header = FrameHeader::parse(frame).unwrap();
        assert_eq!((header.cols, header.rows), (80, 24));
    }

    daemon.manager().write_input(&id, b"ping\n").unwrap();
    for client in [&mut a, &mut b] {
        let message = next_binary(client);
        assert_eq!(parse_broadcast(&message).unwrap().0, id.as_str());
    }

    daemon.shutdown();
}

#[test]
fn malformed_messages_keep_the_connection_open() {
    let (daemon, _control) = start(4);
    let workdir = tempfile::tempdir().unwrap();
    let id = daemon
        .manager()
        .create_session(vec!["cat".to_string()], CreateSessionOptions::new(workdir.path()))
        .unwrap();

    let mut client = connect(&daemon);
    client.send(Message::Text("{not json".to_string())).unwrap();
    client
        .send(Message::Text(r#"{"type":"subscribe"}"#.to_string()))
        .unwrap();
    subscribe(&mut client, "no-such-session");
    subscribe(&mut client, id.as_str());

    let message = next_binary(&mut client);
    assert_eq!(parse_broadcast(&message).unwrap().0, id.as_str());

    daemon.shutdown();
}

#[test]
fn connections_over_the_limit_are_refused() {
    let (daemon, _control) = start(1);
    let _first = connect(&daemon);

    match tungstenite::connect(daemon.ws_url()) {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 503),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("second connection should be refused"),
    }

    daemon.shutdown();
}

#[test]
fn closing_a_connection_frees_its_slot() {
    let (daemon, _control) = start(1);
    let mut first = connect(&daemon);
    first.close(None).unwrap();
    let _ = first.read();
    drop(first);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while daemon.governor().active_connections() > 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(daemon.governor().active_connections(), 0);
    let _second = connect(&daemon);

    daemon.shutdown();
}

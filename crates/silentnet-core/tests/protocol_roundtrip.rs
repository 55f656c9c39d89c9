//! Integration tests for the silentnet-core protocol stack.
//!
//! These tests push typed messages through the public API end to end:
//! typed message → codec → framer → byte stream → framer → codec → typed
//! message, and the same over an encrypted manager channel on loopback TCP.

use std::io::Cursor;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use silentnet_core::{
    ClientSummary, DhParams, Frame, Framer, MessageLink, RecvOutcome, Reply, Request,
    SecureChannel,
};

/// Frames every request into one buffer, then reads them back.
fn through_framer(requests: &[Request]) -> Vec<RecvOutcome<Request>> {
    let mut writer = Framer::new(Cursor::new(Vec::new()));
    for request in requests {
        writer.send_request(request).expect("send must succeed");
    }
    let bytes = writer.into_inner().into_inner();

    let mut reader = Framer::new(Cursor::new(bytes));
    let mut out = Vec::new();
    loop {
        match reader.recv_request() {
            RecvOutcome::Closed => break,
            outcome => out.push(outcome),
        }
    }
    out
}

fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let client = TcpStream::connect(listener.local_addr().unwrap()).expect("connect");
    let (server, _) = listener.accept().expect("accept");
    server
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    (server, client)
}

#[test]
fn test_employee_stream_survives_framing_in_order() {
    // Arrange
    let stream = vec![
        Request::EmployeeAuth {
            mac: "00:1a:2b:3c:4d:5e".to_string(),
            hostname: "finance-07".to_string(),
        },
        Request::ProcessOpen("excel.exe".to_string()),
        Request::InputEvent("keyboard\x1f57".to_string()),
        Request::CpuUsage("0,12.5;1,40.0".to_string()),
        Request::IpContact("10.0.0.1".to_string()),
        Request::ProcessClose("excel.exe".to_string()),
    ];

    // Act
    let decoded = through_framer(&stream);

    // Assert
    let expected: Vec<_> = stream.into_iter().map(RecvOutcome::Data).collect();
    assert_eq!(decoded, expected);
}

#[test]
fn test_manager_requests_survive_framing() {
    let requests = vec![
        Request::ManagerPassword(String::new()),
        Request::UpdateSettings {
            max_clients: 12,
            safety_threshold: 2,
        },
        Request::ListClients,
        Request::ClientStats {
            hostname: "finance-07".to_string(),
        },
        Request::RenameClient {
            from: "finance-07".to_string(),
            to: "finance-08".to_string(),
        },
        Request::DeleteClient {
            hostname: "finance-08".to_string(),
        },
        Request::ManagerExit,
    ];

    let decoded = through_framer(&requests);

    assert_eq!(decoded.len(), requests.len());
    for (outcome, request) in decoded.into_iter().zip(requests) {
        assert_eq!(outcome, RecvOutcome::Data(request));
    }
}

#[test]
fn test_zero_length_frame_ends_the_stream() {
    let mut reader = Framer::new(Cursor::new(b"0003MGC0000".to_vec()));
    assert_eq!(reader.recv().unwrap(), Frame::Data(b"MGC".to_vec()));
    assert_eq!(reader.recv().unwrap(), Frame::Closed);
}

#[test]
fn test_manager_session_over_encrypted_loopback() {
    // Arrange
    let (server_stream, client_stream) = tcp_pair();
    let server = thread::spawn(move || {
        let mut channel = SecureChannel::accept(Framer::new(server_stream)).expect("accept");
        let login = channel.recv_request();
        channel.send_reply(&Reply::PasswordValid).unwrap();
        let query = channel.recv_request();
        channel
            .send_reply(&Reply::ClientList(vec![ClientSummary {
                hostname: "finance-07".to_string(),
                active_percentage: 87,
                online: true,
            }]))
            .unwrap();
        (login, query)
    });

    // Act
    let mut manager =
        SecureChannel::initiate(Framer::new(client_stream), DhParams::rfc2409_group1())
            .expect("initiate");
    manager
        .send_request(&Request::ManagerPassword("itzik".to_string()))
        .unwrap();
    let auth = manager.recv_reply();
    manager.send_request(&Request::ListClients).unwrap();
    let list = manager.recv_reply();
    let (login, query) = server.join().expect("server thread");

    // Assert
    assert_eq!(
        login,
        RecvOutcome::Data(Request::ManagerPassword("itzik".to_string()))
    );
    assert_eq!(query, RecvOutcome::Data(Request::ListClients));
    assert_eq!(auth, RecvOutcome::Data(Reply::PasswordValid));
    match list {
        RecvOutcome::Data(Reply::ClientList(rows)) => {
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].hostname, "finance-07");
            assert!(rows[0].online);
        }
        other => panic!("expected client list, got {other:?}"),
    }
}

#[test]
fn test_plaintext_sent_on_secure_channel_is_malformed() {
    // A peer that skips encryption after the handshake produces garbage the
    // server must count as malformed rather than act upon.
    let (server_stream, client_stream) = tcp_pair();
    let server = thread::spawn(move || {
        let mut channel = SecureChannel::accept(Framer::new(server_stream)).expect("accept");
        channel.recv_request()
    });

    let manager = SecureChannel::initiate(Framer::new(client_stream), DhParams::rfc2409_group1())
        .expect("initiate");
    let mut raw = manager.into_framer();
    raw.send(b"MGC").unwrap();

    assert!(matches!(
        server.join().unwrap(),
        RecvOutcome::Malformed(_)
    ));
}

use std::{io::Write, net::TcpStream, process};

use netfork_tests::util::{netfork_bin, netfork_server_bin, spawn, wait_for_port};

#[test]
fn client_fails_without_server() {
    let code = spawn(
        process::Command::new(netfork_bin()).args(["--server", "localhost", "--port", "1"]),
    )
    .proc
    .wait()
    .unwrap();

    assert!(!code.success());
}

#[test]
fn server_rejects_truncated_stream() {
    let mut server = spawn(process::Command::new(netfork_server_bin()).args(["--port", "0"]));
    let port = wait_for_port(&server);

    // A fraction of a thread context, then a close mid-record.
    let mut socket = TcpStream::connect(("localhost", port)).unwrap();
    socket.write_all(&[0u8; 16]).unwrap();
    drop(socket);

    let code = server.proc.wait().unwrap();
    assert!(!code.success());
}

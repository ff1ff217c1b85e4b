use std::process;

use netfork_tests::util::{netfork_bin, netfork_server_bin, spawn, wait_for_output, wait_for_port};

#[test]
fn forks_client_onto_server() {
    let mut server = spawn(process::Command::new(netfork_server_bin()).args(["--port", "0"]));
    let port = wait_for_port(&server);

    let mut client = spawn(
        process::Command::new(netfork_bin())
            .args(["--server", "localhost"])
            .args(["--port", &port.to_string()]),
    );

    // The original call site must come back as the parent.
    let code = client.proc.wait().unwrap();
    assert!(code.success());
    assert!(client.stdout.lock().unwrap().contains("parent"));

    // The reconstructed child re-enters the fork call, observes the child
    // return, and exits cleanly; the server supervises it to the end.
    wait_for_output(&server, "child exited with code 0");

    let code = server.proc.wait().unwrap();
    assert!(code.success());
}

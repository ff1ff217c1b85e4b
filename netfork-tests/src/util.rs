use std::{
    env,
    io::Read,
    path::{Path, PathBuf},
    process::{self, Stdio},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

pub fn workspace_dir() -> PathBuf {
    let output = process::Command::new(env::var("CARGO").unwrap())
        .arg("locate-project")
        .arg("--workspace")
        .arg("--message-format=plain")
        .output()
        .unwrap()
        .stdout;
    let cargo_path = Path::new(std::str::from_utf8(&output).unwrap().trim());
    cargo_path.parent().unwrap().to_path_buf()
}

#[cfg(debug_assertions)]
pub fn cargo_profile() -> &'static str {
    "debug"
}

#[cfg(not(debug_assertions))]
pub fn cargo_profile() -> &'static str {
    "release"
}

pub fn target_dir() -> PathBuf {
    workspace_dir().join("target").join(cargo_profile())
}

fn bin(name: &str) -> String {
    target_dir()
        .join(format!("{name}{}", env::consts::EXE_SUFFIX))
        .to_string_lossy()
        .to_string()
}

pub fn netfork_bin() -> String {
    bin("netfork")
}

pub fn netfork_server_bin() -> String {
    bin("netfork-server")
}

pub struct ChildWithStreamedOutput {
    pub proc: process::Child,
    pub stdout: Arc<Mutex<String>>,
    pub stderr: Arc<Mutex<String>>,
}

pub fn spawn(cmd: &mut process::Command) -> ChildWithStreamedOutput {
    let mut proc = cmd
        .env("RUST_LOG", "debug")
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn");

    let stdout = Arc::new(Mutex::new("".to_string()));
    let stderr = Arc::new(Mutex::new("".to_string()));

    let pid = proc.id();
    let mut stdout_pipe = proc.stdout.take().unwrap();
    let mut stderr_pipe = proc.stderr.take().unwrap();

    thread::spawn({
        let stdout = stdout.clone();
        move || {
            let mut bbuf = [0u8; 1024];
            loop {
                let len = stdout_pipe.read(&mut bbuf).unwrap();
                if len == 0 {
                    break;
                }
                let out = String::from_utf8_lossy(&bbuf[..len]).to_string();
                print!("{}", out.replace("\n", &format!("\n [{pid}] ")));
                let mut buf = stdout.lock().unwrap();
                buf.push_str(out.as_str());
            }
        }
    });

    thread::spawn({
        let stderr = stderr.clone();
        move || {
            let mut bbuf = [0u8; 1024];
            loop {
                let len = stderr_pipe.read(&mut bbuf).unwrap();
                if len == 0 {
                    break;
                }
                let out = String::from_utf8_lossy(&bbuf[..len]).to_string();
                print!("{}", out.replace("\n", &format!("\n [{pid}] ")));
                let mut buf = stderr.lock().unwrap();
                buf.push_str(out.as_str());
            }
        }
    });

    ChildWithStreamedOutput {
        proc,
        stdout,
        stderr,
    }
}

pub fn wait_for_output(child: &ChildWithStreamedOutput, contents: &'static str) {
    loop {
        for out in [&child.stdout, &child.stderr] {
            let out = out.lock().unwrap();
            if out.contains(contents) {
                return;
            }
        }

        thread::sleep(Duration::from_millis(10));
    }
}

/// Waits for the server's listen line and extracts the bound port, so tests
/// can run it with `--port 0`.
pub fn wait_for_port(child: &ChildWithStreamedOutput) -> u16 {
    wait_for_output(child, "listening on port ");

    loop {
        let out = child.stderr.lock().unwrap();
        if let Some(rest) = out.split("listening on port ").nth(1) {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if !digits.is_empty() {
                return digits.parse().unwrap();
            }
        }
        drop(out);

        thread::sleep(Duration::from_millis(10));
    }
}

use assert_cmd::Command;
use predicates::prelude::*;
use std::net::TcpListener;

fn fieldsync() -> Command {
    let mut cmd = Command::cargo_bin("fieldsync").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

/// A local port with nothing listening on it.
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn test_help_lists_flags() {
    fieldsync()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--locator"))
        .stdout(predicate::str::contains("--yes"))
        .stdout(predicate::str::contains("--field"));
}

#[test]
fn test_connection_failure_exits_nonzero() {
    let port = closed_port();
    fieldsync()
        .args(["--yes", "--url", "http://127.0.0.1", "--port"])
        .arg(port.to_string())
        .args(["--db", "nowhere", "--locator", "http://127.0.0.1/web#id=1&model=ir.ui.view"])
        .write_stdin("")
        .assert()
        .failure()
        .stderr(predicate::str::contains("could not connect to http://127.0.0.1"))
        .stderr(predicate::str::contains(port.to_string()))
        .stderr(predicate::str::contains("\"nowhere\""));
}

#[test]
fn test_invalid_server_url() {
    fieldsync()
        .args(["-y", "--url", "localhost"])
        .write_stdin("")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid server URL"));
}

#[test]
fn test_prompts_for_connection_without_yes() {
    let port = closed_port();
    // Accept every default, pointing at a dead port.
    fieldsync()
        .args(["--url", "http://127.0.0.1", "--port"])
        .arg(port.to_string())
        .write_stdin("\n\n\n")
        .assert()
        .failure()
        .stdout(predicate::str::contains("Database (odoo)"))
        .stdout(predicate::str::contains("Username (admin)"));
}

/// Answers login, read and write the way an Odoo server would, one request
/// per connection. Returns the port.
#[cfg(unix)]
fn serve_odoo() -> u16 {
    use serde_json::{Value, json};
    use std::io::{BufRead, BufReader, Read, Write};

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let mut reader = BufReader::new(stream);
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    break;
                }
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':')
                    && name.eq_ignore_ascii_case("content-length")
                {
                    content_length = value.trim().parse().unwrap();
                }
            }
            let mut body = vec![0u8; content_length];
            if reader.read_exact(&mut body).is_err() {
                continue;
            }
            let request: Value = serde_json::from_slice(&body).unwrap();
            let result = match request["params"]["method"].as_str() {
                Some("login") => json!(2),
                _ => match request["params"]["args"][4].as_str() {
                    Some("read") => json!([{
                        "id": 288,
                        "name": "res.partner.form",
                        "arch_base": "<form/>",
                        "arch_fs": false
                    }]),
                    _ => json!(true),
                },
            };
            let payload = json!({"jsonrpc": "2.0", "id": request["id"], "result": result}).to_string();
            let mut stream = reader.into_inner();
            let _ = write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                payload.len(),
                payload
            );
        }
    });
    port
}

/// Starts a session, sends `signal` once the scratch file exists and checks
/// the file is gone after the process exits.
#[cfg(unix)]
fn assert_signal_removes_scratch_file(signal: &str) {
    use std::process::{Command as Process, Stdio};
    use std::time::{Duration, Instant};

    let port = serve_odoo();
    let dir = tempfile::TempDir::new().unwrap();
    let mut child = Process::new(assert_cmd::cargo::cargo_bin("fieldsync"))
        .args(["-y", "--url", "http://127.0.0.1", "--port"])
        .arg(port.to_string())
        .args([
            "--locator",
            "http://127.0.0.1/web#id=288&model=ir.ui.view",
            "--ext",
            "xml",
            "--dir",
        ])
        .arg(dir.path())
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    // Held open so the CLI keeps waiting for commands.
    let _stdin = child.stdin.take();

    let path = dir.path().join("ir_ui_view").join("res_partner_form_288.xml");
    let deadline = Instant::now() + Duration::from_secs(20);
    while !path.exists() {
        assert!(Instant::now() < deadline, "scratch file never appeared");
        assert!(child.try_wait().unwrap().is_none(), "fieldsync exited early");
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "<form/>");

    let killed = Process::new("kill")
        .arg(signal)
        .arg(child.id().to_string())
        .status()
        .unwrap();
    assert!(killed.success());

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("fieldsync ignored {}", signal);
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    assert!(status.success(), "exit status {:?}", status);
    assert!(!path.exists(), "scratch file left behind after {}", signal);
}

#[cfg(unix)]
#[test]
fn test_sigterm_removes_scratch_file() {
    assert_signal_removes_scratch_file("-TERM");
}

#[cfg(unix)]
#[test]
fn test_sighup_removes_scratch_file() {
    assert_signal_removes_scratch_file("-HUP");
}

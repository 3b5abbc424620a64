use predicates::prelude::*;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::thread;
use tempfile::tempdir;

const ABC_MD5: &str = "900150983cd24fb0d6963f7d28e17f72";

fn reconcile(root: &Path, commit_url: &str) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("ifupload");
    cmd.current_dir(root)
        .env("IFARCH_HOME", root)
        .env("IFARCH_CONFIG_PATH", root.join("absent.toml"))
        .env("IFARCH_INDEX_FILE", root.join("ifids.json"))
        .env("IFARCH_LOG_FILE", root.join("reconcile.log"))
        .env("IFARCH_PUBLIC_ROOT", root.join("htdocs"))
        .env("IFARCH_IFDB_URL", commit_url)
        .env("IFARCH_IFDB_KEY", "sekrit")
        .env("IFARCH_IFDB_TIMEOUT_SECS", "5")
        .env_remove("GATEWAY_INTERFACE");
    for var in [
        "HTTP_PROXY",
        "http_proxy",
        "HTTPS_PROXY",
        "https_proxy",
        "ALL_PROXY",
        "all_proxy",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

/// Archive tree under a canonical temp root, holding one file with content `abc`.
fn archive_file(root: &Path) -> std::path::PathBuf {
    let dir = root.join("htdocs/if-archive/games/zcode");
    fs::create_dir_all(&dir).expect("mkdir");
    let file = dir.join("abc.z5");
    fs::write(&file, "abc").expect("write");
    file
}

fn seed_index(root: &Path, id: &str) {
    fs::write(
        root.join("ifids.json"),
        format!("{{\"{ABC_MD5}\": {{\"id\": \"{id}\", \"time\": 1700000000.5}}}}\n"),
    )
    .expect("seed index");
}

/// Answers one request with `status` and `reply`, then hands back the
/// request text and the listener.
fn serve_once(
    listener: TcpListener,
    status: &'static str,
    reply: &'static str,
) -> thread::JoinHandle<(String, TcpListener)> {
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).expect("read");
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        write!(
            stream,
            "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reply}",
            reply.len()
        )
        .expect("respond");
        (String::from_utf8_lossy(&request).into_owned(), listener)
    })
}

fn no_pending_connection(listener: &TcpListener) -> bool {
    listener.set_nonblocking(true).expect("nonblocking");
    matches!(listener.accept(), Err(err) if err.kind() == ErrorKind::WouldBlock)
}

#[test]
fn unknown_file_is_reported_without_remote_call() {
    let tmp = tempdir().expect("tempdir");
    let root = fs::canonicalize(tmp.path()).expect("canonical");
    let file = archive_file(&root);
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let url = format!("http://{}/ifarchive-commit", listener.local_addr().expect("addr"));

    reconcile(&root, &url)
        .arg("reconcile")
        .arg("-n")
        .arg(&file)
        .assert()
        .failure()
        .stdout(predicate::str::contains(format!(
            "no identifier found for {}",
            file.display()
        )));

    assert!(no_pending_connection(&listener));
}

#[test]
fn remote_error_is_reported_verbatim_after_one_call() {
    let tmp = tempdir().expect("tempdir");
    let root = fs::canonicalize(tmp.path()).expect("canonical");
    let file = archive_file(&root);
    seed_index(&root, "xyzzy");

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let url = format!("http://{}/ifarchive-commit", listener.local_addr().expect("addr"));
    let server = serve_once(listener, "200 OK", "Error: invalid API key\n");

    reconcile(&root, &url)
        .arg("reconcile")
        .arg("--non-interactive")
        .arg(&file)
        .assert()
        .failure()
        .stdout(predicate::str::contains(format!(
            "IFDB update for {} failed. Error: invalid API key",
            file.display()
        )));

    let (request, listener) = server.join().expect("server thread");
    let request_line = request.lines().next().expect("request line");
    assert!(request_line.starts_with("GET /ifarchive-commit?ifdbid=xyzzy&path=%2Fif-archive%2Fgames%2Fzcode%2Fabc.z5&key=sekrit "));
    assert!(no_pending_connection(&listener));
}

#[test]
fn unreachable_catalog_fails_without_leaking_key() {
    let tmp = tempdir().expect("tempdir");
    let root = fs::canonicalize(tmp.path()).expect("canonical");
    let file = archive_file(&root);
    seed_index(&root, "xyzzy");
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr")
    };
    let url = format!("http://{addr}/ifarchive-commit");

    reconcile(&root, &url)
        .arg("reconcile")
        .arg("-n")
        .arg(&file)
        .assert()
        .failure()
        .stdout(predicate::str::contains(format!(
            "IFDB update for {} failed: ",
            file.display()
        )))
        .stdout(predicate::str::contains("sekrit").not())
        .stderr(predicate::str::contains("sekrit").not());

    let log = fs::read_to_string(root.join("reconcile.log")).expect("log");
    assert!(log.contains("IFDB call failed"), "{log}");
    assert!(log.contains("/if-archive/games/zcode/abc.z5"), "{log}");
    assert!(!log.contains("sekrit"), "{log}");
}

#[test]
fn server_error_status_is_a_failure() {
    let tmp = tempdir().expect("tempdir");
    let root = fs::canonicalize(tmp.path()).expect("canonical");
    let file = archive_file(&root);
    seed_index(&root, "xyzzy");
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let url = format!("http://{}/ifarchive-commit", listener.local_addr().expect("addr"));
    let server = serve_once(listener, "500 Internal Server Error", "boom\n");

    reconcile(&root, &url)
        .arg("reconcile")
        .arg("-n")
        .arg(&file)
        .assert()
        .failure()
        .stdout(predicate::str::contains(format!(
            "IFDB update for {} failed: IFDB commit failed with status 500",
            file.display()
        )))
        .stdout(predicate::str::contains("sekrit").not());

    let (_, listener) = server.join().expect("server thread");
    assert!(no_pending_connection(&listener));
    let log = fs::read_to_string(root.join("reconcile.log")).expect("log");
    assert!(!log.contains("sekrit"), "{log}");
}

#[test]
fn unreadable_index_names_the_file() {
    let tmp = tempdir().expect("tempdir");
    let root = fs::canonicalize(tmp.path()).expect("canonical");
    let file = archive_file(&root);
    fs::write(root.join("ifids.json"), "not json").expect("seed index");
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let url = format!("http://{}/ifarchive-commit", listener.local_addr().expect("addr"));

    reconcile(&root, &url)
        .arg("reconcile")
        .arg("-n")
        .arg(&file)
        .assert()
        .failure()
        .stdout(predicate::str::contains(format!(
            "could not reconcile {}: ",
            file.display()
        )));

    assert!(no_pending_connection(&listener));
    let log = fs::read_to_string(root.join("reconcile.log")).expect("log");
    let line = log
        .lines()
        .find(|line| line.contains("reconcile failed locally"))
        .expect("local failure logged");
    assert!(line.contains(&file.display().to_string()), "{line}");
}

#[test]
fn each_outcome_prints_before_the_next_prompt() {
    let tmp = tempdir().expect("tempdir");
    let root = fs::canonicalize(tmp.path()).expect("canonical");
    let file = archive_file(&root);
    let other = file.with_file_name("other.z5");
    fs::write(&other, "other").expect("write");
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let url = format!("http://{}/ifarchive-commit", listener.local_addr().expect("addr"));

    reconcile(&root, &url)
        .arg("reconcile")
        .arg(&file)
        .arg(&other)
        .write_stdin("\n\n")
        .assert()
        .failure()
        .stdout(predicate::str::contains(format!(
            "IFDB ID for abc.z5: skipped {}: no identifier entered\nIFDB ID for other.z5: ",
            file.display()
        )));

    assert!(no_pending_connection(&listener));
}

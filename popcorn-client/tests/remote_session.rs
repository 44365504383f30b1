//! Driver scenarios against a real server
//!
//! The stub compiler speaks just enough of the gcc driver contract for the
//! client: `-M -Wp,-v` emits a dependency rule plus an include search list,
//! a plain build copies the source to `-o`, and a source containing the
//! marker text fails with a diagnostic.

use clap::Parser;
use popcorn_client::{ClientSettings, LocalCompiler, perform_compilation};
use popcorn_server::{ServerSettings, ServerState, serve};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::Level;

struct TestServer {
    address: String,
    state: Arc<ServerState>,
    shutdown: watch::Sender<bool>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn start_server(working_dir: &Path) -> TestServer {
    let settings = ServerSettings::parse_from([
        "popcorn-server",
        "--working-dir",
        &working_dir.to_string_lossy(),
        "--cache-wait-secs",
        "2",
        "--cache-poll-ms",
        "10",
    ]);
    let state = Arc::new(ServerState::new(settings).expect("server state"));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("addr").to_string();
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(serve(Arc::clone(&state), listener, shutdown_rx));
    TestServer {
        address,
        state,
        shutdown,
    }
}

/// Stub compiler whose `-M` output names `headers` as the dependencies
fn write_stub_compiler(dir: &Path, headers: &[&Path], include_dir: Option<&Path>) -> PathBuf {
    let header_list = headers
        .iter()
        .map(|h| h.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let search_list = include_dir
        .map(|d| format!(" {}", d.display()))
        .unwrap_or_default();
    let script = format!(
        r#"#!/bin/sh
deps=0
out=""
src=""
expect_out=0
for arg in "$@"; do
  if [ "$expect_out" = 1 ]; then out="$arg"; expect_out=0; continue; fi
  case "$arg" in
    -M) deps=1 ;;
    -o) expect_out=1 ;;
    -*) ;;
    *) src="$arg" ;;
  esac
done
if [ "$deps" = 1 ]; then
  echo "$src.o: $src {header_list}"
  echo '#include "..." search starts here:' >&2
  echo '#include <...> search starts here:' >&2
  echo '{search_list}' >&2
  echo 'End of search list.' >&2
  exit 0
fi
if grep -q syntax-error "$src" 2>/dev/null; then
  echo "$src:1:1: error: expected expression" >&2
  exit 1
fi
mkdir -p "$(dirname "$out")"
cat "$src" > "$out"
"#
    );
    let path = dir.join("stubcc");
    std::fs::write(&path, script).expect("write stub");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

fn settings_for(server: Option<&TestServer>) -> ClientSettings {
    ClientSettings {
        servers: server.map(|s| vec![s.address.clone()]).unwrap_or_default(),
        log_filename: None,
        log_level: Level::WARN,
        use_object_cache: false,
    }
}

fn argv(list: &[&str]) -> Vec<String> {
    list.iter().map(ToString::to_string).collect()
}

#[tokio::test]
async fn remote_compile_round_trip() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let server = start_server(&tmp.path().join("server")).await;

    let inc_dir = tmp.path().join("inc");
    std::fs::create_dir_all(&inc_dir).expect("mkdir");
    let header = inc_dir.join("util.h");
    std::fs::write(&header, b"int util();\n").expect("write");

    let src_dir = tmp.path().join("src");
    std::fs::create_dir_all(&src_dir).expect("mkdir");
    let source = src_dir.join("main.cpp");
    std::fs::write(&source, b"int main() { return util(); }\n").expect("write");

    let out_dir = tmp.path().join("out");
    std::fs::create_dir_all(&out_dir).expect("mkdir");
    let object = out_dir.join("main.o");

    let stub = write_stub_compiler(tmp.path(), &[&header], Some(&inc_dir));
    let command = argv(&[
        &stub.to_string_lossy(),
        "-I",
        &inc_dir.to_string_lossy(),
        "-c",
        &source.to_string_lossy(),
        "-o",
        &object.to_string_lossy(),
    ]);

    let (exit_code, stdout, stderr) =
        perform_compilation(&command, &settings_for(Some(&server))).await;
    assert_eq!(exit_code, 0, "stderr: {}", String::from_utf8_lossy(&stderr));
    assert!(stdout.is_empty());
    assert_eq!(
        std::fs::read(&object).expect("object"),
        b"int main() { return util(); }\n"
    );

    // Source and header both reached the server's cache.
    assert_eq!(server.state.src_cache.entry_count(), 2);
    assert!(server.state.sessions.is_empty());
}

#[tokio::test]
async fn no_servers_falls_back_to_local_build() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let source = tmp.path().join("main.cpp");
    std::fs::write(&source, b"int main() { return 0; }\n").expect("write");
    let object = tmp.path().join("main.o");

    let stub = write_stub_compiler(tmp.path(), &[], None);
    let command = argv(&[
        &stub.to_string_lossy(),
        "-c",
        &source.to_string_lossy(),
        "-o",
        &object.to_string_lossy(),
    ]);

    let (exit_code, _, _) = perform_compilation(&command, &settings_for(None)).await;
    assert_eq!(exit_code, 0);
    assert_eq!(
        std::fs::read(&object).expect("object"),
        b"int main() { return 0; }\n"
    );
}

#[tokio::test]
async fn unreachable_server_falls_back_to_local_build() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let source = tmp.path().join("main.cpp");
    std::fs::write(&source, b"int main() { return 1; }\n").expect("write");
    let object = tmp.path().join("main.o");

    // Bind-then-drop guarantees a dead address.
    let dead = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let dead_address = dead.local_addr().expect("addr").to_string();
    drop(dead);

    let stub = write_stub_compiler(tmp.path(), &[], None);
    let command = argv(&[
        &stub.to_string_lossy(),
        "-c",
        &source.to_string_lossy(),
        "-o",
        &object.to_string_lossy(),
    ]);
    let settings = ClientSettings {
        servers: vec![dead_address],
        log_filename: None,
        log_level: Level::WARN,
        use_object_cache: false,
    };

    let (exit_code, _, _) = perform_compilation(&command, &settings).await;
    assert_eq!(exit_code, 0);
    assert!(object.exists());
}

#[tokio::test]
async fn remote_diagnostic_is_authoritative() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let server = start_server(&tmp.path().join("server")).await;

    let source = tmp.path().join("broken.cpp");
    std::fs::write(&source, b"int main() { syntax-error }\n").expect("write");
    let object = tmp.path().join("broken.o");

    let stub = write_stub_compiler(tmp.path(), &[], None);
    let command = argv(&[
        &stub.to_string_lossy(),
        "-c",
        &source.to_string_lossy(),
        "-o",
        &object.to_string_lossy(),
    ]);

    let (exit_code, _, stderr) =
        perform_compilation(&command, &settings_for(Some(&server))).await;
    assert_eq!(exit_code, 1);
    assert!(String::from_utf8_lossy(&stderr).contains("error: expected expression"));
    // A diagnosed build writes no object.
    assert!(!object.exists());
}

#[tokio::test]
async fn local_only_flags_never_go_remote() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let server = start_server(&tmp.path().join("server")).await;

    let source = tmp.path().join("main.cpp");
    std::fs::write(&source, b"int main() { return 0; }\n").expect("write");
    let object = tmp.path().join("main.o");

    let stub = write_stub_compiler(tmp.path(), &[], None);
    let command = argv(&[
        &stub.to_string_lossy(),
        "-march=native",
        "-c",
        &source.to_string_lossy(),
        "-o",
        &object.to_string_lossy(),
    ]);

    let (exit_code, _, _) = perform_compilation(&command, &settings_for(Some(&server))).await;
    assert_eq!(exit_code, 0);
    assert!(object.exists());
    // The invocation was local: the server saw nothing.
    assert_eq!(server.state.src_cache.entry_count(), 0);
    assert!(server.state.clients.is_empty());
}

#[test]
fn scanner_and_driver_agree_on_remote_safety() {
    let local = LocalCompiler::new(&argv(&["g++", "-c", "a.cpp", "-o", "a.o"]));
    assert!(local.remote_allowed);

    let local = LocalCompiler::new(&argv(&["g++", "-c", "a.cpp"]));
    assert!(!local.remote_allowed);
}

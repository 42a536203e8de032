#[path = "common/mod.rs"]
mod common;

use std::{
    collections::BTreeMap,
    panic::{AssertUnwindSafe, catch_unwind},
    path::Path,
    thread,
    time::{Duration, Instant},
};

use common::{
    free_port, quick_policy, serve_health, serve_silently, wait_for_process_exit, write_script,
};
use servebench::{
    error::ServerError,
    logs::LogSink,
    server::{Readiness, ServerConfig, ServerController, ServerState},
    supervisor::ProcessSupervisor,
};
use tempfile::tempdir;

/// A controller whose "server" is the given shell script.
fn controller(dir: &Path, port: u16, script_body: &str) -> ServerController {
    let script = write_script(dir, "fake-server.sh", script_body);
    let mut config = ServerConfig::new("test/model", "127.0.0.1", port)
        .with_program([script.display().to_string()])
        .with_reservation_tool(None);
    config.log_scan_interval = Duration::from_millis(100);
    config.health_timeout = Duration::from_millis(500);
    config.restart_pause = Duration::from_millis(10);

    let supervisor = ProcessSupervisor::with_policy(LogSink::new(dir.join("logs")), quick_policy());
    ServerController::new(config, supervisor).expect("failed to build controller")
}

#[test]
fn ready_when_health_endpoint_answers() {
    let temp = tempdir().expect("failed to create tempdir");
    let port = serve_health();
    let mut server = controller(temp.path(), port, "echo starting\nsleep 300");

    server.start("", BTreeMap::new()).expect("start failed");
    let readiness = server
        .wait_for_ready(Duration::from_secs(10), Duration::from_millis(100))
        .expect("wait failed");

    assert_eq!(readiness, Readiness::Ready);
    assert_eq!(server.state(), ServerState::Ready);
    server.stop();
    assert_eq!(server.state(), ServerState::Stopped);
}

#[test]
fn not_ready_is_reported_within_budget() {
    let temp = tempdir().expect("failed to create tempdir");
    let mut server = controller(temp.path(), free_port(), "sleep 300");

    server.start("", BTreeMap::new()).expect("start failed");
    let timeout = Duration::from_secs(1);
    let poll = Duration::from_millis(200);
    let started = Instant::now();
    let readiness = server.wait_for_ready(timeout, poll).expect("wait failed");
    let elapsed = started.elapsed();

    assert_eq!(readiness, Readiness::NotReady);
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + poll + Duration::from_secs(2));
    assert!(server.is_running());
    server.stop();
}

#[test]
fn hanging_endpoint_does_not_stretch_the_budget() {
    let temp = tempdir().expect("failed to create tempdir");
    let script = write_script(temp.path(), "fake-server.sh", "sleep 300");
    let config = ServerConfig::new("test/model", "127.0.0.1", serve_silently())
        .with_program([script.display().to_string()])
        .with_reservation_tool(None);
    let supervisor =
        ProcessSupervisor::with_policy(LogSink::new(temp.path().join("logs")), quick_policy());
    let mut server = ServerController::new(config, supervisor).expect("failed to build controller");

    server.start("", BTreeMap::new()).expect("start failed");
    let timeout = Duration::from_secs(1);
    let poll = Duration::from_millis(100);
    let started = Instant::now();
    let readiness = server.wait_for_ready(timeout, poll).expect("wait failed");
    let elapsed = started.elapsed();

    assert_eq!(readiness, Readiness::NotReady);
    assert!(elapsed >= timeout);
    assert!(
        elapsed <= timeout + poll + Duration::from_millis(400),
        "waited {elapsed:?} for a {timeout:?} budget"
    );
    server.stop();
}

#[test]
fn dead_process_fails_fast_with_log_tail() {
    let temp = tempdir().expect("failed to create tempdir");
    let mut server = controller(
        temp.path(),
        free_port(),
        "echo 'loading weights'\necho 'ValueError: bad config' >&2\nexit 3",
    );

    server.start("", BTreeMap::new()).expect("start failed");
    let started = Instant::now();
    let err = server
        .wait_for_ready(Duration::from_secs(30), Duration::from_millis(100))
        .expect_err("dead server must fail");

    assert!(started.elapsed() < Duration::from_secs(5));
    match err {
        ServerError::ProcessDied { tail } => {
            assert!(tail.contains("loading weights"));
            assert!(tail.contains("ValueError: bad config"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(server.state(), ServerState::Failed);
    server.stop();
}

#[test]
fn fatal_log_line_fails_even_while_process_lives() {
    let temp = tempdir().expect("failed to create tempdir");
    let mut server = controller(
        temp.path(),
        free_port(),
        "echo 'torch.cuda.OutOfMemoryError: CUDA out of memory'\nsleep 300",
    );

    server.start("", BTreeMap::new()).expect("start failed");
    let started = Instant::now();
    let err = server
        .wait_for_ready(Duration::from_secs(30), Duration::from_millis(100))
        .expect_err("fatal log must fail");

    assert!(started.elapsed() < Duration::from_secs(3));
    match err {
        ServerError::FatalLog { pattern, line, .. } => {
            assert_eq!(pattern, "OutOfMemoryError");
            assert_eq!(line, "torch.cuda.OutOfMemoryError: CUDA out of memory");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(server.is_running());
    server.stop();
    assert!(!server.is_running());
}

#[test]
fn fatal_log_wins_over_healthy_endpoint() {
    let temp = tempdir().expect("failed to create tempdir");
    let port = serve_health();
    let mut server = controller(
        temp.path(),
        port,
        "echo 'Segmentation fault (core dumped)'\nsleep 300",
    );

    server.start("", BTreeMap::new()).expect("start failed");
    thread::sleep(Duration::from_millis(500));
    let started = Instant::now();
    let err = server
        .wait_for_ready(Duration::from_secs(10), Duration::from_millis(100))
        .expect_err("fatal log must win");

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(matches!(err, ServerError::FatalLog { ref pattern, .. } if pattern == "Segmentation fault"));
    server.stop();
}

#[test]
fn start_truncates_previous_server_log() {
    let temp = tempdir().expect("failed to create tempdir");
    let logs = LogSink::new(temp.path().join("logs"));
    logs.append_line("server", "RuntimeError: CUDA error from a previous run")
        .expect("failed to seed log");

    let port = serve_health();
    let mut server = controller(temp.path(), port, "sleep 300");
    server.start("", BTreeMap::new()).expect("start failed");

    let readiness = server
        .wait_for_ready(Duration::from_secs(10), Duration::from_millis(100))
        .expect("stale log lines must not fail the new session");
    assert!(readiness.is_ready());
    server.stop();
}

#[test]
fn variant_environment_reaches_server() {
    let temp = tempdir().expect("failed to create tempdir");
    let port = serve_health();
    let mut server = controller(
        temp.path(),
        port,
        "echo \"backend=$VLLM_ATTENTION_BACKEND args=$*\"\nsleep 300",
    );

    let env = BTreeMap::from([(
        "VLLM_ATTENTION_BACKEND".to_string(),
        "FLASHINFER".to_string(),
    )]);
    server.start("--max-model-len 4096", env).expect("start failed");
    server
        .wait_for_ready(Duration::from_secs(10), Duration::from_millis(100))
        .expect("wait failed");

    let log = std::fs::read_to_string(server.log_path()).expect("missing server log");
    assert!(log.contains("backend=FLASHINFER"));
    assert!(log.contains("test/model --host 127.0.0.1"));
    assert!(log.contains("--max-model-len 4096"));
    server.stop();
}

#[test]
fn session_stops_server_when_scope_panics() {
    let temp = tempdir().expect("failed to create tempdir");
    let mut server = controller(temp.path(), free_port(), "sleep 300");
    let pid = server.start("", BTreeMap::new()).expect("start failed");

    let result = catch_unwind(AssertUnwindSafe(|| {
        let _session = server.session();
        panic!("workload blew up");
    }));

    assert!(result.is_err());
    wait_for_process_exit(pid);
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(!server.is_running());
}

#[test]
fn second_controller_on_same_port_is_rejected() {
    let temp = tempdir().expect("failed to create tempdir");
    let port = free_port();
    let script = write_script(temp.path(), "fake-server.sh", "sleep 300");
    let supervisor =
        ProcessSupervisor::with_policy(LogSink::new(temp.path().join("logs")), quick_policy());
    let config = ServerConfig::new("test/model", "127.0.0.1", port)
        .with_program([script.display().to_string()])
        .with_reservation_tool(None);

    let mut first = ServerController::new(config.clone(), supervisor.clone()).unwrap();
    let mut second = ServerController::new(config, supervisor).unwrap();

    first.start("", BTreeMap::new()).expect("first start failed");
    let err = second
        .start("", BTreeMap::new())
        .expect_err("port already owned");
    assert!(matches!(err, ServerError::Supervisor(_)));
    first.stop();
}

#[test]
fn restart_launches_a_new_process() {
    let temp = tempdir().expect("failed to create tempdir");
    let mut server = controller(temp.path(), free_port(), "sleep 300");

    let first = server.start("--seed 1", BTreeMap::new()).expect("start failed");
    let second = server.restart(None, None).expect("restart failed");

    assert_ne!(first, second);
    wait_for_process_exit(first);
    assert_eq!(server.state(), ServerState::Starting);
    assert_eq!(server.last_args(), "--seed 1");
    server.stop();
}

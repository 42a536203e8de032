#[path = "common/mod.rs"]
mod common;

use std::{
    sync::mpsc,
    thread,
    time::Duration,
};

use common::write_script;
use servebench::{
    logs::{LogSink, PatternSet},
    supervisor::{OutputRouting, ProcessCommand, ProcessSupervisor},
};
use tempfile::tempdir;

#[test]
fn transcript_and_child_output_share_a_channel() {
    let temp = tempdir().expect("failed to create tempdir");
    let logs = LogSink::new(temp.path().join("logs"));
    logs.init("script").expect("failed to init channel");
    logs.append_line("script", "=== before ===").expect("append failed");

    let supervisor = ProcessSupervisor::new(logs.clone());
    supervisor
        .run(
            "child",
            &ProcessCommand::new(["sh", "-c", "echo from child"]),
            Some(Duration::from_secs(10)),
            OutputRouting::Log("script".into()),
        )
        .expect("run failed");
    logs.append_line("script", "=== after ===").expect("append failed");

    assert_eq!(
        logs.tail("script", 10),
        vec!["=== before ===", "from child", "=== after ==="]
    );
}

#[test]
fn follower_sees_lines_written_by_a_running_child() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let script = write_script(
        dir,
        "ticker.sh",
        "for i in 1 2 3 4 5; do echo \"tick $i\"; sleep 0.05; done\nsleep 300",
    );

    let logs = LogSink::new(dir.join("logs"));
    logs.init("ticker").expect("failed to init channel");
    let follower = logs
        .follow("ticker", 0)
        .with_poll_interval(Duration::from_millis(10));

    let supervisor = ProcessSupervisor::new(logs.clone());
    supervisor
        .run_background(
            "ticker",
            &ProcessCommand::new([script.display().to_string()]),
            OutputRouting::Log("ticker".into()),
        )
        .expect("failed to start");

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in follower.take(5) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    let lines: Vec<String> = (0..5)
        .map(|_| {
            rx.recv_timeout(Duration::from_secs(5))
                .expect("timed out following log")
        })
        .collect();
    assert_eq!(lines, vec!["tick 1", "tick 2", "tick 3", "tick 4", "tick 5"]);
    supervisor.terminate("ticker");
}

#[test]
fn search_from_offset_skips_earlier_failures() {
    let temp = tempdir().expect("failed to create tempdir");
    let logs = LogSink::new(temp.path().join("logs"));
    logs.init("server").expect("failed to init channel");
    logs.append_line("server", "AssertionError: stale").expect("append failed");

    let offset = logs.end_offset("server");
    let patterns = PatternSet::new(["AssertionError", "Segmentation fault"]).expect("bad patterns");
    assert!(logs.search("server", &patterns, offset).is_none());

    let supervisor = ProcessSupervisor::new(logs.clone());
    supervisor
        .run(
            "crasher",
            &ProcessCommand::new(["sh", "-c", "echo 'Segmentation fault (core dumped)' >&2"]),
            Some(Duration::from_secs(10)),
            OutputRouting::Log("server".into()),
        )
        .expect("run failed");

    let found = logs
        .search("server", &patterns, offset)
        .expect("new failure not found");
    assert_eq!(found.pattern, "Segmentation fault");
    assert_eq!(found.line, "Segmentation fault (core dumped)");
}

#[test]
fn init_truncates_between_sessions() {
    let temp = tempdir().expect("failed to create tempdir");
    let logs = LogSink::new(temp.path().join("logs"));
    logs.append_line("server", "old session").expect("append failed");

    let path = logs.init("server").expect("failed to init channel");

    assert_eq!(std::fs::read_to_string(path).expect("read failed"), "");
    assert!(logs.tail("server", 5).is_empty());
}

#[path = "common/mod.rs"]
mod common;

use std::{
    thread,
    time::{Duration, Instant},
};

use common::{
    is_process_alive, quick_policy, wait_for_lines, wait_for_pid_file, wait_for_process_exit,
    write_script,
};
use servebench::{
    error::SupervisorError,
    logs::LogSink,
    supervisor::{OutputRouting, ProcessCommand, ProcessSupervisor},
};
use tempfile::tempdir;

#[test]
fn terminate_escalates_interrupt_then_terminate_then_kill() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let signals = dir.join("signals.txt");
    let ready = dir.join("ready.txt");
    let script = write_script(
        dir,
        "stubborn.sh",
        &format!(
            "trap 'echo INT >> {signals}' INT\n\
             trap 'echo TERM >> {signals}' TERM\n\
             echo up > {ready}\n\
             while :; do sleep 0.05; done",
            signals = signals.display(),
            ready = ready.display()
        ),
    );

    let policy = quick_policy();
    let supervisor = ProcessSupervisor::with_policy(LogSink::new(dir.join("logs")), policy);
    let pid = supervisor
        .run_background(
            "stubborn",
            &ProcessCommand::new([script.display().to_string()]),
            OutputRouting::Log("stubborn".into()),
        )
        .expect("failed to start");
    wait_for_lines(&ready, 1);

    let started = Instant::now();
    assert!(supervisor.terminate("stubborn"));
    let elapsed = started.elapsed();

    assert_eq!(wait_for_lines(&signals, 2), vec!["INT", "TERM"]);
    assert!(elapsed >= policy.interrupt_wait + policy.terminate_wait);
    wait_for_process_exit(pid);
    assert!(!supervisor.is_alive("stubborn"));
    assert!(supervisor.names().is_empty());
}

#[test]
fn cooperative_process_stops_at_first_stage() {
    let temp = tempdir().expect("failed to create tempdir");
    let supervisor =
        ProcessSupervisor::with_policy(LogSink::new(temp.path().join("logs")), quick_policy());
    supervisor
        .run_background(
            "sleeper",
            &ProcessCommand::new(["sleep", "300"]),
            OutputRouting::Discard,
        )
        .expect("failed to start");

    let started = Instant::now();
    assert!(supervisor.terminate("sleeper"));
    assert!(started.elapsed() < quick_policy().interrupt_wait);
}

#[test]
fn terminate_reaches_grandchildren() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let pid_file = dir.join("grandchild.pid");
    let script = write_script(
        dir,
        "parent.sh",
        &format!("sleep 300 &\necho $! > {}\nwait", pid_file.display()),
    );

    let supervisor = ProcessSupervisor::with_policy(LogSink::new(dir.join("logs")), quick_policy());
    supervisor
        .run_background(
            "parent",
            &ProcessCommand::new([script.display().to_string()]),
            OutputRouting::Discard,
        )
        .expect("failed to start");

    let grandchild = wait_for_pid_file(&pid_file);
    assert!(is_process_alive(grandchild));

    supervisor.terminate("parent");
    wait_for_process_exit(grandchild);
}

#[test]
fn run_timeout_kills_whole_group() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let pid_file = dir.join("grandchild.pid");
    let script = write_script(
        dir,
        "slow.sh",
        &format!("sleep 300 &\necho $! > {}\nwait", pid_file.display()),
    );

    let supervisor = ProcessSupervisor::with_policy(LogSink::new(dir.join("logs")), quick_policy());
    let started = Instant::now();
    let err = supervisor
        .run(
            "slow",
            &ProcessCommand::new([script.display().to_string()]),
            Some(Duration::from_millis(500)),
            OutputRouting::Discard,
        )
        .expect_err("run should time out");

    assert!(matches!(err, SupervisorError::Timeout { ref name, .. } if name == "slow"));
    assert!(started.elapsed() < Duration::from_secs(5));
    wait_for_process_exit(wait_for_pid_file(&pid_file));
    assert!(supervisor.names().is_empty());
}

#[test]
fn log_channel_interleaves_stdout_and_stderr() {
    let temp = tempdir().expect("failed to create tempdir");
    let logs = LogSink::new(temp.path().join("logs"));
    logs.init("bench").expect("failed to init channel");
    let supervisor = ProcessSupervisor::new(logs.clone());

    let outcome = supervisor
        .run(
            "client",
            &ProcessCommand::new(["sh", "-c", "echo out; echo err >&2; exit 4"]),
            Some(Duration::from_secs(10)),
            OutputRouting::Log("bench".into()),
        )
        .expect("run failed");

    assert_eq!(outcome.exit_code, Some(4));
    let mut lines = logs.tail("bench", 10);
    lines.sort();
    assert_eq!(lines, vec!["err", "out"]);
}

#[test]
fn environment_overrides_reach_child() {
    let temp = tempdir().expect("failed to create tempdir");
    let supervisor = ProcessSupervisor::new(LogSink::new(temp.path().join("logs")));
    let outcome = supervisor
        .run(
            "env",
            &ProcessCommand::new(["sh", "-c", "echo \"$VLLM_ATTENTION_BACKEND:$HOME\""]).env(
                [("VLLM_ATTENTION_BACKEND".to_string(), "FLASHINFER".to_string())].into(),
            ),
            Some(Duration::from_secs(10)),
            OutputRouting::Capture,
        )
        .expect("run failed");

    let home = std::env::var("HOME").unwrap_or_default();
    assert_eq!(outcome.stdout.trim(), format!("FLASHINFER:{home}"));
}

#[test]
fn concurrent_terminate_all_stops_everything_once() {
    let temp = tempdir().expect("failed to create tempdir");
    let supervisor =
        ProcessSupervisor::with_policy(LogSink::new(temp.path().join("logs")), quick_policy());

    let pids: Vec<u32> = (0..3)
        .map(|idx| {
            supervisor
                .run_background(
                    &format!("worker-{idx}"),
                    &ProcessCommand::new(["sleep", "300"]),
                    OutputRouting::Discard,
                )
                .expect("failed to start")
        })
        .collect();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let supervisor = supervisor.clone();
            thread::spawn(move || supervisor.terminate_all())
        })
        .collect();
    for handle in handles {
        handle.join().expect("cleanup thread panicked");
    }

    assert!(supervisor.names().is_empty());
    for pid in pids {
        wait_for_process_exit(pid);
    }
    assert!(!supervisor.terminate("worker-0"));
}

#[test]
fn dropping_last_handle_cleans_up() {
    let temp = tempdir().expect("failed to create tempdir");
    let supervisor =
        ProcessSupervisor::with_policy(LogSink::new(temp.path().join("logs")), quick_policy());
    let pid = supervisor
        .run_background(
            "orphan",
            &ProcessCommand::new(["sleep", "300"]),
            OutputRouting::Discard,
        )
        .expect("failed to start");

    drop(supervisor);
    wait_for_process_exit(pid);
}

#[test]
fn name_is_free_again_after_exit() {
    let temp = tempdir().expect("failed to create tempdir");
    let supervisor = ProcessSupervisor::new(LogSink::new(temp.path().join("logs")));
    let command = ProcessCommand::new(["sh", "-c", "exit 0"]);

    supervisor
        .run_background("once", &command, OutputRouting::Discard)
        .expect("first start failed");
    let deadline = Instant::now() + Duration::from_secs(5);
    while supervisor.is_alive("once") && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }

    supervisor
        .run_background("once", &command, OutputRouting::Discard)
        .expect("stale entry should be replaced");
}

#[test]
fn terminate_after_leader_exit_still_clears_group() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let pid_file = dir.join("worker.pid");
    let script = write_script(
        dir,
        "wrapper.sh",
        &format!("sleep 300 &\necho $! > {}\nexit 1", pid_file.display()),
    );

    let supervisor = ProcessSupervisor::with_policy(LogSink::new(dir.join("logs")), quick_policy());
    supervisor
        .run_background(
            "server",
            &ProcessCommand::new([script.display().to_string()]),
            OutputRouting::Discard,
        )
        .expect("failed to start");

    let worker = wait_for_pid_file(&pid_file);
    let deadline = Instant::now() + Duration::from_secs(5);
    while supervisor.is_alive("server") && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert!(is_process_alive(worker));

    assert!(!supervisor.terminate("server"));
    wait_for_process_exit(worker);
    assert!(supervisor.names().is_empty());
}

#[test]
fn captured_run_returns_when_leader_exits_before_its_children() {
    let temp = tempdir().expect("failed to create tempdir");
    let supervisor =
        ProcessSupervisor::with_policy(LogSink::new(temp.path().join("logs")), quick_policy());

    let started = Instant::now();
    let outcome = supervisor
        .run(
            "capture",
            &ProcessCommand::new(["sh", "-c", "sleep 8 & echo hi"]),
            Some(Duration::from_secs(1)),
            OutputRouting::Capture,
        )
        .expect("run failed");

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(outcome.success());
    assert_eq!(outcome.stdout.trim(), "hi");
    assert!(supervisor.names().is_empty());
}

//! Tests for local command execution

use std::sync::{Arc, Mutex};
use std::time::Duration;

use command_executor::{
    CancelToken, Command, Executor, OutputStream, ProcessEventType, DEFAULT_RUN_TIMEOUT,
};
use futures::StreamExt;

#[test]
fn test_basic_echo() {
    smol::block_on(async {
        let executor = Executor::new("test-echo");
        let cmd = Command::builder("echo").arg("hello world").build();

        let output = executor
            .run(cmd, DEFAULT_RUN_TIMEOUT, &CancelToken::new())
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello world");
    });
}

#[test]
fn test_env_override_wins_over_inherited() {
    smol::block_on(async {
        std::env::set_var("AZD_APP_TEST_VAR", "inherited");

        let executor = Executor::new("test-env");
        let cmd = Command::builder("sh")
            .arg("-c")
            .arg("echo $AZD_APP_TEST_VAR")
            .env("AZD_APP_TEST_VAR", "explicit")
            .build();

        let output = executor
            .run(cmd, DEFAULT_RUN_TIMEOUT, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(output.stdout.trim(), "explicit");
    });
}

#[test]
fn test_inherited_environment_passthrough() {
    smol::block_on(async {
        std::env::set_var("AZD_APP_PASSTHROUGH", "from-parent");

        let executor = Executor::new("test-env-inherit");
        let cmd = Command::builder("sh")
            .arg("-c")
            .arg("echo $AZD_APP_PASSTHROUGH")
            .build();

        let output = executor
            .run(cmd, DEFAULT_RUN_TIMEOUT, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(output.stdout.trim(), "from-parent");
    });
}

#[test]
fn test_exit_code_captured() {
    smol::block_on(async {
        let executor = Executor::new("test-exit-code");
        let cmd = Command::builder("sh").arg("-c").arg("exit 42").build();

        let output = executor
            .run(cmd, DEFAULT_RUN_TIMEOUT, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(output.status.code, Some(42));
        assert!(matches!(
            output.into_result("sh").unwrap_err(),
            command_executor::Error::Exit { code: 42, .. }
        ));
    });
}

#[test]
fn test_command_not_found() {
    smol::block_on(async {
        let executor = Executor::new("test-not-found");
        let cmd = Command::new("this_command_does_not_exist_12345");

        let err = executor
            .run(cmd, DEFAULT_RUN_TIMEOUT, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, command_executor::Error::NotFound { .. }));
    });
}

#[test]
fn test_run_timeout_kills_child() {
    smol::block_on(async {
        let executor = Executor::new("test-timeout");
        let cmd = Command::builder("sleep").arg("10").build();

        let err = executor
            .run(cmd, Duration::from_millis(200), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, command_executor::Error::Timeout { .. }));
    });
}

#[test]
fn test_run_cancellation() {
    smol::block_on(async {
        let executor = Executor::new("test-cancel");
        let cmd = Command::builder("sleep").arg("10").build();
        let cancel = CancelToken::new();

        let trigger = cancel.clone();
        let canceller = smol::spawn(async move {
            smol::Timer::after(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = executor
            .run(cmd, DEFAULT_RUN_TIMEOUT, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, command_executor::Error::Cancelled { .. }));
        canceller.await;
    });
}

#[test]
fn test_spawn_and_wait() {
    smol::block_on(async {
        let executor = Executor::new("test-spawn");
        let cmd = Command::builder("sleep").arg("0.1").build();

        let (_events, mut handle) = executor.spawn(cmd).unwrap();
        assert!(handle.pid() > 0);

        let exit = handle.wait().await.unwrap();
        assert_eq!(exit.code, Some(0));
    });
}

#[test]
#[cfg(unix)]
fn test_terminate_with_grace() {
    smol::block_on(async {
        let executor = Executor::new("test-terminate");
        let cmd = Command::builder("sleep").arg("30").build();

        let (_events, mut handle) = executor.spawn(cmd).unwrap();
        smol::Timer::after(Duration::from_millis(100)).await;

        let exit = handle.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(exit.terminated_by_signal());
        assert!(!command_executor::process::pid_alive(handle.pid()) || exit.signal.is_some());
    });
}

#[test]
fn test_event_streaming() {
    smol::block_on(async {
        let executor = Executor::new("test-events");
        let cmd = Command::builder("sh")
            .arg("-c")
            .arg("echo out; echo err >&2")
            .build();

        let (mut events, mut handle) = executor.spawn(cmd).unwrap();

        let mut collected = Vec::new();
        while let Some(event) = events.next().await {
            collected.push(event);
        }

        assert!(matches!(
            collected.first().unwrap().event_type,
            ProcessEventType::Started { .. }
        ));

        let stdout: Vec<_> = collected
            .iter()
            .filter(|e| e.event_type == ProcessEventType::Stdout)
            .collect();
        assert_eq!(stdout.len(), 1);
        assert_eq!(stdout[0].data.as_deref(), Some("out"));

        let stderr: Vec<_> = collected
            .iter()
            .filter(|e| e.event_type == ProcessEventType::Stderr)
            .collect();
        assert_eq!(stderr.len(), 1);
        assert_eq!(stderr[0].data.as_deref(), Some("err"));

        let exit = handle.wait().await.unwrap();
        assert_eq!(exit.code, Some(0));
    });
}

#[test]
fn test_monitored_spawn_sees_every_line() {
    smol::block_on(async {
        let executor = Executor::new("test-monitor");
        let cmd = Command::builder("sh")
            .arg("-c")
            .arg("echo one; echo two; echo three >&2")
            .build();

        let seen: Arc<Mutex<Vec<(OutputStream, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let monitor: command_executor::executor::LineMonitor =
            Arc::new(move |stream, line: &str| {
                sink.lock().unwrap().push((stream, line.to_string()));
            });

        let (mut events, mut handle) = executor.spawn_monitored(cmd, monitor).unwrap();
        while events.next().await.is_some() {}
        handle.wait().await.unwrap();

        let seen = seen.lock().unwrap();
        let stdout_lines: Vec<_> = seen
            .iter()
            .filter(|(s, _)| *s == OutputStream::Stdout)
            .map(|(_, l)| l.as_str())
            .collect();
        assert_eq!(stdout_lines, vec!["one", "two"]);
        assert!(seen
            .iter()
            .any(|(s, l)| *s == OutputStream::Stderr && l == "three"));
    });
}

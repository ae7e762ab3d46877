#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use core_test_support::MockExecutor;
use core_test_support::assert_no_event;
use core_test_support::is_mission_complete;
use core_test_support::process_alive;
use core_test_support::recv_event;
use core_test_support::recv_until;
use core_test_support::wait_until;
use pretty_assertions::assert_eq;
use stingbot_core::ConnectionId;
use stingbot_core::MissionOutcome;
use stingbot_core::MissionSession;
use stingbot_core::MissionState;
use stingbot_core::error::SessionError;
use stingbot_core::error::ValidationError;
use stingbot_core::output::EventSink;
use stingbot_core::session::ENGINE_STARTING;
use stingbot_core::session::MISSION_ABORTED;
use stingbot_core::session::MISSION_TERMINATED;
use stingbot_protocol::MissionCompleteEvent;
use stingbot_protocol::NeuralCompleteEvent;
use stingbot_protocol::ServerEvent;

fn session_for(
    executor: &MockExecutor,
    id: u64,
) -> (Arc<MissionSession>, async_channel::Receiver<ServerEvent>) {
    let (tx, rx) = async_channel::unbounded();
    let session = MissionSession::new(
        ConnectionId(id),
        Arc::new(executor.config.clone()),
        EventSink::new(tx),
    );
    (session, rx)
}

fn completed(result: &str) -> ServerEvent {
    ServerEvent::MissionComplete(MissionCompleteEvent {
        success: true,
        result: Some(result.to_string()),
        ..Default::default()
    })
}

fn failed(error: &str) -> ServerEvent {
    ServerEvent::MissionComplete(MissionCompleteEvent {
        success: false,
        error: Some(error.to_string()),
        ..Default::default()
    })
}

fn read_pid(executor: &MockExecutor) -> Option<u32> {
    core_test_support::read_pid(executor.dir.path())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relays_classified_output_and_completes_with_result() {
    let executor = MockExecutor::new(
        r#"echo "[*] scanning"; echo "analysing $1"; echo "MISSION_RESULT: 42""#,
    );
    let (session, rx) = session_for(&executor, 1);

    session.start_mission("recon").await.expect("start");
    let events = recv_until(&rx, is_mission_complete).await.expect("events");

    assert_eq!(
        events,
        vec![
            ServerEvent::update(ENGINE_STARTING),
            ServerEvent::update("scanning"),
            ServerEvent::log("analysing recon"),
            ServerEvent::NeuralComplete(NeuralCompleteEvent {
                result: "42".to_string()
            }),
            completed("42"),
        ]
    );
    assert_eq!(session.state(), MissionState::Idle);
    assert_eq!(
        session.last_outcome(),
        Some(MissionOutcome::Completed {
            result: "42".to_string()
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_line_yields_exactly_one_status_update() {
    let executor = MockExecutor::new(r#"echo "[*] scanning""#);
    let (session, rx) = session_for(&executor, 2);

    session.start_mission("recon").await.expect("start");
    let events = recv_until(&rx, is_mission_complete).await.expect("events");

    let updates: Vec<&ServerEvent> = events
        .iter()
        .filter(|event| **event == ServerEvent::update("scanning"))
        .collect();
    assert_eq!(updates.len(), 1);
    // Without a result line the accumulated stdout becomes the result.
    assert_eq!(events.last(), Some(&completed("[*] scanning")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn structured_records_take_precedence_over_markers() {
    let executor = MockExecutor::new(
        r#"echo '{"kind":"status","payload":"phase one"}'; echo '{"kind":"result","payload":"ok"}'"#,
    );
    let (session, rx) = session_for(&executor, 3);

    session.start_mission("recon").await.expect("start");
    let events = recv_until(&rx, is_mission_complete).await.expect("events");

    assert_eq!(events[1], ServerEvent::update("phase one"));
    assert_eq!(events.last(), Some(&completed("ok")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lines_after_the_result_are_not_relayed() {
    let executor = MockExecutor::new(r#"echo "MISSION_RESULT: done"; echo "trailing chatter""#);
    let (session, rx) = session_for(&executor, 4);

    session.start_mission("recon").await.expect("start");
    let events = recv_until(&rx, is_mission_complete).await.expect("events");

    assert!(!events.contains(&ServerEvent::log("trailing chatter")));
    assert_eq!(events.last(), Some(&completed("done")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_zero_exit_reports_stderr() {
    let executor = MockExecutor::new("echo boom 1>&2; exit 3");
    let (session, rx) = session_for(&executor, 5);

    session.start_mission("recon").await.expect("start");
    let events = recv_until(&rx, is_mission_complete).await.expect("events");

    assert_eq!(
        events,
        vec![
            ServerEvent::update(ENGINE_STARTING),
            ServerEvent::error("boom\n"),
            failed("boom"),
        ]
    );
    assert_matches!(session.last_outcome(), Some(MissionOutcome::Failed { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_failure_describes_the_exit() {
    let executor = MockExecutor::new("exit 2");
    let (session, rx) = session_for(&executor, 6);

    session.start_mission("recon").await.expect("start");
    let events = recv_until(&rx, is_mission_complete).await.expect("events");

    assert_eq!(events.last(), Some(&failed("executor exited with code 2")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_executor_is_reported_as_a_failed_mission() {
    let mut executor = MockExecutor::new("true");
    executor.config.executor.program = "/definitely/not/a/stingbot/executor".into();
    let (session, rx) = session_for(&executor, 7);

    session.start_mission("recon").await.expect("accepted");
    let event = recv_event(&rx).await.expect("event");

    assert_eq!(
        event,
        failed("executable `/definitely/not/a/stingbot/executor` not found")
    );
    assert_eq!(session.state(), MissionState::Idle);
    assert!(!session.has_active_mission());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blank_objective_never_spawns() {
    let executor = MockExecutor::new("touch spawned");
    let (session, rx) = session_for(&executor, 8);

    let result = session.start_mission("   ").await;

    assert_matches!(
        result,
        Err(SessionError::Validation(ValidationError::EmptyObjective))
    );
    assert_no_event(&rx, Duration::from_millis(200)).await;
    assert!(!executor.dir.path().join("spawned").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_start_is_rejected_while_running() {
    let executor = MockExecutor::new("sleep 30");
    let (session, rx) = session_for(&executor, 9);

    session.start_mission("first").await.expect("start");
    assert_eq!(session.state(), MissionState::Running);
    assert_matches!(
        session.start_mission("second").await,
        Err(SessionError::MissionAlreadyActive)
    );

    session.abort().await.expect("abort");
    let events = recv_until(&rx, is_mission_complete).await.expect("events");
    assert_eq!(events.len(), 3, "{events:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_reports_once_and_frees_the_session() {
    let executor = MockExecutor::new(r#"echo $$ > pid; echo "[*] working"; sleep 30"#);
    let (session, rx) = session_for(&executor, 10);

    session.start_mission("recon").await.expect("start");
    recv_until(&rx, |event| *event == ServerEvent::update("working"))
        .await
        .expect("progress");
    let pid = read_pid(&executor).expect("pid file");

    session.abort().await.expect("abort");
    // A repeated abort is not an error and emits nothing new.
    session.abort().await.expect("second abort");

    assert_eq!(
        recv_event(&rx).await.expect("status"),
        ServerEvent::update(MISSION_TERMINATED)
    );
    assert_eq!(
        recv_event(&rx).await.expect("terminal"),
        ServerEvent::MissionComplete(MissionCompleteEvent {
            success: false,
            error: Some(MISSION_ABORTED.to_string()),
            aborted: true,
            ..Default::default()
        })
    );
    assert_no_event(&rx, Duration::from_millis(300)).await;

    assert!(!process_alive(pid));
    assert_eq!(session.last_outcome(), Some(MissionOutcome::Aborted));
    assert_matches!(session.abort().await, Err(SessionError::NoActiveMission));

    session.start_mission("again").await.expect("restart");
    session.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_stays_rejected_until_aborted_process_exits() {
    let mut executor = MockExecutor::new(r#"trap '' TERM; echo "[*] stubborn"; sleep 30"#);
    executor.config.executor.kill_grace_ms = 1_000;
    let (session, rx) = session_for(&executor, 11);

    session.start_mission("recon").await.expect("start");
    recv_until(&rx, |event| *event == ServerEvent::update("stubborn"))
        .await
        .expect("progress");

    session.abort().await.expect("abort");
    assert_eq!(session.state(), MissionState::Aborted);
    assert_matches!(
        session.start_mission("too soon").await,
        Err(SessionError::MissionAlreadyActive)
    );

    let events = recv_until(&rx, is_mission_complete).await.expect("events");
    assert_eq!(events.len(), 2, "{events:?}");
    assert_eq!(session.state(), MissionState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_racing_a_natural_exit_completes_exactly_once() {
    let executor = MockExecutor::new(r#"echo "MISSION_RESULT: $1""#);
    let (session, rx) = session_for(&executor, 15);

    for round in 0..30u64 {
        let delay = Duration::from_millis(round % 10 * 3);
        let aborter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                session.abort().await
            })
        };
        session.start_mission("race").await.expect("start");
        let aborted = aborter.await.expect("join");

        let events = recv_until(&rx, is_mission_complete)
            .await
            .expect("terminal event");
        assert_no_event(&rx, Duration::from_millis(50)).await;

        if let Some(terminated) = events
            .iter()
            .position(|event| *event == ServerEvent::update(MISSION_TERMINATED))
        {
            assert!(aborted.is_ok(), "round {round}: {events:?}");
            assert!(
                !events[terminated..].contains(&ServerEvent::update(ENGINE_STARTING)),
                "round {round}: {events:?}"
            );
            assert_eq!(events.last(), Some(&MissionOutcome::Aborted.to_event()));
        } else {
            assert_matches!(aborted, Err(SessionError::NoActiveMission));
            assert_eq!(events.last(), Some(&completed("race")));
        }
        assert_eq!(session.state(), MissionState::Idle);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_terminates_the_executor_silently() {
    let executor = MockExecutor::new("echo $$ > pid; sleep 30");
    let (session, rx) = session_for(&executor, 12);

    session.start_mission("recon").await.expect("start");
    assert_eq!(
        recv_event(&rx).await.expect("starting"),
        ServerEvent::update(ENGINE_STARTING)
    );
    wait_until(|| read_pid(&executor).is_some())
        .await
        .expect("pid file");
    let pid = read_pid(&executor).expect("pid");

    session.close();

    wait_until(|| !process_alive(pid)).await.expect("executor gone");
    assert_no_event(&rx, Duration::from_millis(300)).await;
    assert!(!session.has_active_mission());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_sessions_never_cross_deliver() {
    let executor =
        MockExecutor::new(r#"echo "[*] $1"; sleep 0.2; echo "MISSION_RESULT: $1""#);
    let (alpha, alpha_rx) = session_for(&executor, 13);
    let (beta, beta_rx) = session_for(&executor, 14);

    alpha.start_mission("alpha").await.expect("alpha");
    beta.start_mission("beta").await.expect("beta");

    let alpha_events = recv_until(&alpha_rx, is_mission_complete)
        .await
        .expect("alpha events");
    let beta_events = recv_until(&beta_rx, is_mission_complete)
        .await
        .expect("beta events");

    assert_eq!(alpha_events[1], ServerEvent::update("alpha"));
    assert_eq!(alpha_events.last(), Some(&completed("alpha")));
    assert_eq!(beta_events[1], ServerEvent::update("beta"));
    assert_eq!(beta_events.last(), Some(&completed("beta")));
    let mentions = |events: &[ServerEvent], needle: &str| {
        events
            .iter()
            .any(|event| event.to_json().expect("serialize").contains(needle))
    };
    assert!(!mentions(&alpha_events, "beta"));
    assert!(!mentions(&beta_events, "alpha"));
}

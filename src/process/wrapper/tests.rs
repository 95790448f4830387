use super::*;
use crate::client::{ClientReader, ClientSender, RunClient};
use crate::process::descendant::NoProcessTable;
use crate::test_support::ArgvBuilder;
use crossbeam_channel::{unbounded, Receiver};
use std::net::TcpListener;

struct Harness {
    wrapper: RemoteProcessWrapper,
    events: Receiver<ProcessEvent>,
    socket_tx: Sender<SocketNotice>,
    socket_rx: Receiver<SocketNotice>,
}

fn harness(redirected: bool) -> Harness {
    let (events_tx, events) = unbounded();
    let (socket_tx, socket_rx) = unbounded();
    let wrapper = RemoteProcessWrapper::new(
        "c1".to_string(),
        PathBuf::from("demo.py"),
        redirected,
        4242,
        events_tx,
        Arc::new(NoProcessTable),
    );
    Harness {
        wrapper,
        events,
        socket_tx,
        socket_rx,
    }
}

fn attached_client(harness: &mut Harness) -> (ClientSender, ClientReader) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let client = RunClient::connect(port, "c1").expect("connect");
    let (stream, _) = listener.accept().expect("accept");
    let mut connection = Connection::new(stream).expect("connection");
    connection
        .read_handshake(Duration::from_secs(1))
        .expect("handshake");
    harness
        .wrapper
        .attach_connection(connection, harness.socket_tx.clone())
        .expect("attach");
    let (sender, mut reader) = client.into_split();
    reader
        .expect(protocol::METHOD_PROLOGUE_CONTINUE, Some(Duration::from_secs(2)))
        .expect("prologue continue is sent on attach");
    (sender, reader)
}

/// Feed socket notices to the wrapper until `count` process events were emitted.
fn pump_until(harness: &mut Harness, count: usize) -> Vec<ProcessEventKind> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = Vec::new();
    while seen.len() < count && Instant::now() < deadline {
        if let Ok(notice) = harness.socket_rx.recv_timeout(Duration::from_millis(50)) {
            assert_eq!(notice.correlation_id, "c1");
            harness.wrapper.handle_socket_event(notice.event);
        }
        seen.extend(harness.events.try_iter().map(|event| event.kind));
    }
    seen
}

fn finished_events(events: &Receiver<ProcessEvent>) -> Vec<FinishCode> {
    events
        .try_iter()
        .filter_map(|event| match event.kind {
            ProcessEventKind::Finished(code) => Some(code),
            _ => None,
        })
        .collect()
}

#[test]
fn stop_without_child_still_reports_killed_once() {
    let mut harness = harness(true);
    harness.wrapper.stop();
    harness.wrapper.stop();
    assert_eq!(finished_events(&harness.events), vec![FinishCode::Killed]);
    assert_eq!(harness.wrapper.state(), ProcessState::Terminated);
}

#[cfg(unix)]
#[test]
fn repeated_stop_kills_child_and_reports_once() {
    let mut harness = harness(true);
    harness
        .wrapper
        .start(RunKind::Run, &ArgvBuilder::sleep(30), &RunParameters::default())
        .expect("spawn sleep");
    let pid = harness.wrapper.pid().expect("child pid") as i32;
    for _ in 0..3 {
        harness.wrapper.stop();
    }
    assert_eq!(finished_events(&harness.events), vec![FinishCode::Killed]);
    assert!(harness.wrapper.pid().is_none());
    assert!(!crate::process_signal::process_exists(pid));
}

#[test]
fn start_reports_spawn_failure_synchronously() {
    let mut harness = harness(true);
    let builder = ArgvBuilder::new(&["/nonexistent/runsup-test-binary"]);
    let err = harness
        .wrapper
        .start(RunKind::Run, &builder, &RunParameters::default())
        .expect_err("spawn must fail");
    assert!(matches!(err, SupervisorError::Spawn { .. }));
    assert!(harness.wrapper.pid().is_none());
}

#[test]
fn start_passes_endpoint_only_when_redirected() {
    let builder = ArgvBuilder::new(&["/nonexistent/runsup-test-binary"]);
    let mut redirected = harness(true);
    let _ = redirected
        .wrapper
        .start(RunKind::Run, &builder, &RunParameters::default());
    let mut detached = harness(false);
    let _ = detached
        .wrapper
        .start(RunKind::Run, &builder, &RunParameters::default());
    let endpoints = builder.endpoints.lock().expect("endpoints").clone();
    assert_eq!(
        endpoints,
        vec![
            Some(ControlEndpoint {
                port: 4242,
                correlation_id: "c1".to_string()
            }),
            None
        ]
    );
}

#[test]
fn attach_is_rejected_twice_and_for_detached_wrappers() {
    let mut harness_ok = harness(true);
    let _client = attached_client(&mut harness_ok);
    assert_eq!(harness_ok.wrapper.state(), ProcessState::Running);

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let _second = RunClient::connect(port, "c1").expect("connect");
    let (stream, _) = listener.accept().expect("accept");
    let err = harness_ok
        .wrapper
        .attach_connection(
            Connection::new(stream).expect("connection"),
            harness_ok.socket_tx.clone(),
        )
        .expect_err("second attach");
    assert!(matches!(
        err,
        SupervisorError::InvalidState {
            operation: "attach_connection",
            state: "running"
        }
    ));

    let mut detached = harness(false);
    let _third = RunClient::connect(port, "c1").expect("connect");
    let (stream, _) = listener.accept().expect("accept");
    let err = detached
        .wrapper
        .attach_connection(
            Connection::new(stream).expect("connection"),
            detached.socket_tx.clone(),
        )
        .expect_err("detached attach");
    assert!(matches!(err, SupervisorError::InvalidState { state: "detached", .. }));
}

#[test]
fn routes_stdio_and_input_requests_then_exit_code() {
    let mut harness = harness(true);
    let (sender, mut reader) = attached_client(&mut harness);

    sender.send_stdout("hi").expect("stdout");
    sender.send_stderr("oops").expect("stderr");
    sender.send_raw("this is not json\n").expect("garbage");
    sender
        .send_raw("{\"method\":\"stdout\",\"correlationId\":\"other\",\"params\":{\"text\":\"x\"}}\n")
        .expect("foreign id");
    sender
        .send_raw("{\"method\":\"stdout\",\"correlationId\":\"c1\",\"params\":{}}\n")
        .expect("missing text");
    sender.send_input_request("name? ", false).expect("stdin");
    sender.send_exit_code(3).expect("exit code");

    let seen = pump_until(&mut harness, 4);
    assert_eq!(
        seen,
        vec![
            ProcessEventKind::Stdout("hi".to_string()),
            ProcessEventKind::Stderr("oops".to_string()),
            ProcessEventKind::InputRequest {
                prompt: "name? ".to_string(),
                echo: false
            },
            ProcessEventKind::Finished(FinishCode::Exited(3)),
        ]
    );
    reader
        .expect(protocol::METHOD_EPILOGUE_EXIT, Some(Duration::from_secs(2)))
        .expect("epilogue exit acknowledgement");
    assert_eq!(harness.wrapper.state(), ProcessState::Terminated);

    // A stop after a reported exit must not produce a second finish.
    harness.wrapper.stop();
    assert!(finished_events(&harness.events).is_empty());
}

#[test]
fn user_input_is_forwarded_as_stdin_message() {
    let mut harness = harness(true);
    let (_sender, mut reader) = attached_client(&mut harness);
    harness.wrapper.user_input("42");
    let message = reader
        .expect(protocol::METHOD_STDIN, Some(Duration::from_secs(2)))
        .expect("stdin reply");
    assert_eq!(message.str_param("input"), Ok("42"));
    assert_eq!(message.correlation_id, "c1");
}

#[test]
fn user_input_without_connection_is_a_no_op() {
    let mut harness = harness(true);
    harness.wrapper.user_input("ignored");
    assert!(harness.events.try_recv().is_err());
}

#[test]
fn disconnect_reports_once_and_suppresses_later_stop() {
    let mut harness = harness(true);
    let (sender, _reader) = attached_client(&mut harness);
    sender.shutdown();
    let seen = pump_until(&mut harness, 1);
    assert_eq!(seen, vec![ProcessEventKind::Finished(FinishCode::Disconnected)]);
    harness.wrapper.stop();
    harness.wrapper.handle_socket_event(SocketEvent::Closed);
    assert!(finished_events(&harness.events).is_empty());
}

#[test]
fn stop_detaches_so_queued_lines_are_dropped() {
    let mut harness = harness(true);
    let (sender, _reader) = attached_client(&mut harness);
    sender.send_stdout("late").expect("stdout");
    let notice = harness
        .socket_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("queued line");
    harness.wrapper.stop();
    harness.wrapper.handle_socket_event(notice.event);
    let kinds: Vec<ProcessEventKind> = harness.events.try_iter().map(|event| event.kind).collect();
    assert_eq!(kinds, vec![ProcessEventKind::Finished(FinishCode::Killed)]);
}

#[cfg(unix)]
#[test]
fn wait_detached_reaps_and_records_exit_code() {
    let mut harness = harness(false);
    harness
        .wrapper
        .start(
            RunKind::Run,
            &ArgvBuilder::new(&["sh", "-c", "exit 4"]),
            &RunParameters::default(),
        )
        .expect("spawn sh");
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut reaped = false;
    while !reaped && Instant::now() < deadline {
        reaped = harness.wrapper.wait_detached();
        if !reaped {
            thread::sleep(Duration::from_millis(20));
        }
    }
    assert!(reaped);
    assert_eq!(harness.wrapper.exit_code(), Some(4));
    assert!(harness.wrapper.wait_detached());
}


#[test]
fn reserved_or_oversized_exit_codes_are_ignored() {
    let mut harness = harness(true);
    let (sender, _reader) = attached_client(&mut harness);
    sender.send_exit_code(FinishCode::KILLED).expect("sentinel code");
    sender
        .send_raw("{\"method\":\"epilogue-exit-code\",\"correlationId\":\"c1\",\"params\":{\"exitCode\":4294967296}}\n")
        .expect("oversized code");
    sender.send_exit_code(7).expect("real code");
    let seen = pump_until(&mut harness, 1);
    assert_eq!(seen, vec![ProcessEventKind::Finished(FinishCode::Exited(7))]);
}

/// Process table that reports one fixed pid as the tagged runnee.
#[cfg(unix)]
struct FixedPidTable {
    pid: i32,
    lookups: std::sync::atomic::AtomicUsize,
}

#[cfg(unix)]
impl ProcessTable for FixedPidTable {
    fn find_descendant_by_tag(&self, tag: &ProcessTag) -> Option<i32> {
        assert_eq!(tag.correlation_id, "c1");
        assert_eq!(tag.port, 4242);
        self.lookups
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        crate::process_signal::process_exists(self.pid).then_some(self.pid)
    }
}

#[cfg(unix)]
#[test]
fn stop_kills_the_tagged_descendant() {
    let mut runnee = Command::new("sleep").arg("30").spawn().expect("spawn runnee");
    let pid = runnee.id() as i32;
    let (events_tx, events) = unbounded();
    let table = Arc::new(FixedPidTable {
        pid,
        lookups: std::sync::atomic::AtomicUsize::new(0),
    });
    let mut wrapper = RemoteProcessWrapper::new(
        "c1".to_string(),
        PathBuf::from("demo.py"),
        true,
        4242,
        events_tx,
        table.clone(),
    );

    wrapper.stop();
    let status = runnee.wait().expect("reap runnee");
    assert!(!status.success());
    assert!(table.lookups.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    assert_eq!(finished_events(&events), vec![FinishCode::Killed]);

    wrapper.stop();
    assert!(finished_events(&events).is_empty());
}

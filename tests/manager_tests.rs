//! # Security Manager Tests
//!
//! Loads policies from a TOML file on disk and runs the whole control loop
//! (policy match → tracker → dispatcher → mock companion → sink).

use std::io::Write;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, unbounded};
use tempfile::NamedTempFile;

use response_agent::actions::{ActionKind, ActionTracker, LocalExecutor};
use response_agent::comms::messages::{
    ContainerCmd, ContainerCommandResult, NotifyResult, Reply, Request,
};
use response_agent::comms::mock::MockTransport;
use response_agent::comms::Dispatcher;
use response_agent::config::{self, Config};
use response_agent::policy::Rule;
use response_agent::policy::event::{ActionStatus, PolicyEvent, SystemEvent};
use response_agent::policy::manager::SecurityManager;

const CONFIG: &str = r#"
[companion]
endpoint        = "http://10.0.0.5:7601"
max_loop_events = 2

[actions]
deadline      = "2s"
tick_interval = "50ms"

[[policies]]
id   = 10
name = "miner"
rule = { type = "process_name", names = ["xmrig"] }
actions = [
    { type = "capture", name = "miner-cap" },
    { type = "container", command = "kill" },
    { type = "notify", channel = "sec" },
]

[[policies]]
id      = 11
name    = "disabled"
enabled = false
rule    = { type = "process_name", names = ["xmrig"] }
actions = [{ type = "tag", key = "never", value = "set" }]
"#;

fn load_config() -> Config {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    config::load(file.path()).unwrap()
}

fn manager(cfg: &Config) -> (SecurityManager<MockTransport>, Receiver<PolicyEvent>) {
    let (local, _captures) = LocalExecutor::new();
    let (tx, rx) = unbounded();
    let tracker = ActionTracker::new(Box::new(local), Box::new(tx));
    let dispatcher = Dispatcher::new(cfg.companion.dispatcher_config(), MockTransport::new());
    let m = SecurityManager::new(dispatcher, tracker, cfg.policies.clone(), cfg.actions.deadline);
    (m, rx)
}

fn miner() -> SystemEvent {
    serde_json::from_str(
        r#"{"kind":"execve","pid":4242,"process_name":"xmrig","container_id":"abc123","container_image":"evil/miner"}"#,
    )
    .unwrap()
}

#[test]
fn test_config_file_drives_the_loop() {
    let cfg = load_config();
    assert_eq!(cfg.companion.endpoint, "http://10.0.0.5:7601");
    assert_eq!(cfg.actions.deadline, Duration::from_secs(2));
    assert_eq!(cfg.policies.len(), 2);
    assert!(matches!(cfg.policies[0].rule, Rule::ProcessName { .. }));

    let (mut m, rx) = manager(&cfg);
    let now = Instant::now();
    let handles = m.process_event(&miner(), now);
    assert_eq!(handles.len(), 1, "disabled policy is skipped");

    let sent = m.dispatcher().transport().sent().to_vec();
    assert_eq!(sent.len(), 2);
    match &sent[0].1 {
        Request::ContainerCommand(c) => {
            assert_eq!(c.container_id, "abc123");
            assert_eq!(c.cmd, ContainerCmd::Kill as i32);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(&sent[1].1, Request::Notify(n) if n.channel == "sec" && n.message.contains("xmrig")));

    let mock = m.dispatcher_mut().transport_mut();
    mock.reply(sent[0].0, Reply::ContainerCommand(ContainerCommandResult {
        successful: false,
        errstr: "no such container".into(),
    }));
    mock.reply(sent[1].0, Reply::Notify(NotifyResult { successful: true, errstr: String::new() }));

    assert!(m.run_once(now));
    let ev = rx.try_recv().unwrap();
    assert_eq!(ev.policy_id, 10);
    assert_eq!(ev.container_id.as_deref(), Some("abc123"));
    let results: Vec<_> = ev.action_results.iter().map(|r| (r.kind, r.status)).collect();
    assert_eq!(
        results,
        vec![
            (ActionKind::Capture, ActionStatus::Completed),
            (ActionKind::Container, ActionStatus::Failed),
            (ActionKind::Notify, ActionStatus::Completed),
        ]
    );
    assert_eq!(ev.action_results[1].detail.as_deref(), Some("no such container"));
    assert!(m.is_idle());
}

#[test]
fn test_loop_cap_spreads_completions_over_cycles() {
    let cfg = load_config();
    let (mut m, rx) = manager(&cfg);
    let now = Instant::now();
    m.process_event(&miner(), now);
    m.process_event(&miner(), now);

    let sent = m.dispatcher().transport().sent().to_vec();
    assert_eq!(sent.len(), 4);
    for (token, request) in &sent {
        let reply = match request {
            Request::ContainerCommand(_) => Reply::ContainerCommand(ContainerCommandResult {
                successful: true,
                errstr: String::new(),
            }),
            _ => Reply::Notify(NotifyResult { successful: true, errstr: String::new() }),
        };
        m.dispatcher_mut().transport_mut().reply(*token, reply);
    }

    // max_loop_events = 2: first event completes in the first cycle
    m.run_once(now);
    assert_eq!(rx.try_iter().count(), 1);
    m.run_once(now);
    assert_eq!(rx.try_iter().count(), 1);
    assert!(m.is_idle());
}

#[test]
fn test_unanswered_actions_time_out() {
    let cfg = load_config();
    let (mut m, rx) = manager(&cfg);
    let start = Instant::now();
    m.process_event(&miner(), start);

    m.run_once(start + Duration::from_secs(1));
    assert!(rx.try_recv().is_err());
    m.run_once(start + Duration::from_secs(2));
    let ev = rx.try_recv().unwrap();
    assert_eq!(ev.action_results[1].status, ActionStatus::TimedOut);
    assert_eq!(ev.action_results[2].status, ActionStatus::TimedOut);

    // operations are still registered until the companion answers or we stop
    assert_eq!(m.dispatcher().in_flight(), 2);
    m.shutdown(start + Duration::from_secs(3));
    assert!(m.is_idle());
    assert!(rx.try_recv().is_err(), "already-emitted event is not re-emitted");
}

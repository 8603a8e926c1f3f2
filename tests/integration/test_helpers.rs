// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use vigil::config::{CheckableDef, Config, EndpointDef, HostDef, ZoneDef};
use vigil::core::VigilError;
use vigil::core::checker::executor::{CheckCommand, CheckRunner, PluginOutput};
use vigil::core::checker::scheduler::SchedulerCommand;
use vigil::core::cluster::link::{LinkDirection, PeerHandle};
use vigil::core::cluster::protocol::Message;
use vigil::core::events::Event;
use vigil::core::replay::JournalWriterTask;
use vigil::core::state::EngineState;
use vigil::core::timeperiod::TimePeriod;

/// A deterministic check runner: plays the scripted outcomes in order and
/// repeats the last one forever.
pub struct ScriptedRunner {
    outcomes: Mutex<Vec<(i32, String)>>,
}

impl ScriptedRunner {
    pub fn new(outcomes: Vec<(i32, &str)>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(
                outcomes
                    .into_iter()
                    .map(|(code, out)| (code, out.to_string()))
                    .collect(),
            ),
        })
    }

    pub fn repeating(code: i32, output: &str) -> Arc<Self> {
        Self::new(vec![(code, output)])
    }
}

#[async_trait]
impl CheckRunner for ScriptedRunner {
    async fn run(&self, _command: &CheckCommand) -> Result<PluginOutput, VigilError> {
        let mut outcomes = self.outcomes.lock();
        let (code, output) = if outcomes.len() > 1 {
            outcomes.remove(0)
        } else {
            outcomes[0].clone()
        };
        Ok(PluginOutput {
            exit_status: code,
            stdout: output,
        })
    }
}

/// A complete engine instance backed by a temp directory, with a running
/// journal writer and an event collector.
pub struct TestEngine {
    pub state: Arc<EngineState>,
    pub events: Arc<Mutex<Vec<Event>>>,
    pub scheduler_rx: Option<mpsc::Receiver<SchedulerCommand>>,
    pub relay_rx: Option<mpsc::Receiver<Message>>,
    _dir: tempfile::TempDir,
}

impl TestEngine {
    pub fn event_count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

fn checkable_def(command: &str, interval: f64, retry: f64, attempts: u32) -> CheckableDef {
    CheckableDef {
        check_command: command.into(),
        check_interval: interval,
        retry_interval: retry,
        max_check_attempts: attempts,
        check_period: TimePeriod::default(),
        notification_period: TimePeriod::default(),
        notification_interval: 0.0,
        zone: None,
        high_flap_threshold: None,
        low_flap_threshold: None,
    }
}

/// A config for `node` in a zone shared with `peers`, carrying `host_count`
/// fast-cycling hosts. `start_engine` rebases the data paths into its own
/// temp directory.
pub fn cluster_config(node: &str, peers: &[&str], host_count: usize) -> Config {
    let mut config = Config::default();
    config.engine.node_name = node.to_string();
    config.tls.cert_path = "certs/test.crt".into();
    config.tls.key_path = "certs/test.key".into();

    let mut members: Vec<String> = vec![node.to_string()];
    members.extend(peers.iter().map(|p| p.to_string()));
    members.sort();
    config.endpoints = members
        .iter()
        .map(|name| EndpointDef {
            name: name.clone(),
            host: None,
            port: None,
            features: vec![],
        })
        .collect();
    config.zones = vec![ZoneDef {
        name: "primary".into(),
        endpoints: members,
        parent: None,
    }];

    config.hosts = (0..host_count)
        .map(|i| HostDef {
            name: format!("host{i}"),
            parents: vec![],
            checkable: checkable_def("ping", 0.05, 0.02, 2),
        })
        .collect();
    config
}

/// Builds the engine, spawns its journal writer, and wires up an event
/// collector.
pub async fn start_engine(config: Config, runner: Arc<dyn CheckRunner>) -> TestEngine {
    config.validate().expect("test config must validate");
    let dir = tempfile::tempdir().expect("tempdir");
    // Rebase paths into the owned tempdir so parallel tests never collide.
    let mut config = config;
    config.engine.state_dir = dir.path().join("state").to_string_lossy().into_owned();
    config.engine.log_dir = Some(dir.path().join("log").to_string_lossy().into_owned());

    let init = EngineState::initialize(config, runner).expect("engine init");
    let state = init.state.clone();

    let writer = JournalWriterTask::new(
        state.config.log_dir(),
        state.config.journal.segment_max_bytes,
        state.config.journal.retention,
        init.journal_rx,
        state.journal_healthy.clone(),
        state.journal_position.clone(),
    );
    tokio::spawn(writer.run(state.shutdown_tx.subscribe()));

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    state
        .bus
        .subscribe(None, move |event| sink.lock().push(event.clone()));

    TestEngine {
        state,
        events,
        scheduler_rx: Some(init.scheduler_rx),
        relay_rx: Some(init.relay_rx),
        _dir: dir,
    }
}

/// Simulates a live link to `peer`, returning the queue its writer task
/// would drain.
pub fn attach_peer_link(state: &Arc<EngineState>, peer: &str) -> mpsc::Receiver<Message> {
    let (handle, outbound_rx, _close_rx) = PeerHandle::new(peer.to_string(), LinkDirection::Inbound);
    handle.mark_live();
    state.links.insert(peer.to_string(), handle);
    outbound_rx
}

/// Polls until `predicate` holds over the collected events or the timeout
/// elapses.
pub async fn wait_for_event(
    engine: &TestEngine,
    timeout: std::time::Duration,
    predicate: impl Fn(&Event) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if engine.events.lock().iter().any(&predicate) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

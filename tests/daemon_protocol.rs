//! Daemon clients over TCP: login, queued scripts, events and dry runs.

use rust_ics::cache::LocalCache;
use rust_ics::config::{DaemonConfig, DeviceConfig, PasswdEntry, Settings};
use rust_ics::context::Context;
use rust_ics::daemon::{
    AccessLevel, AuthMethod, Authenticator, Command, DaemonServer, DaemonSession, Event, HashAlgorithm,
    ScriptState,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    backlog: Vec<Event>,
}

impl TestClient {
    async fn connect(address: &str) -> Self {
        let stream = TcpStream::connect(address).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
            backlog: Vec::new(),
        }
    }

    async fn send(&mut self, command: Command) {
        let mut line = command.encode().unwrap();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    /// Next event matching `pred`; others are kept for later calls.
    async fn expect(&mut self, what: &str, pred: impl Fn(&Event) -> bool) -> Event {
        if let Some(pos) = self.backlog.iter().position(&pred) {
            return self.backlog.remove(pos);
        }
        let wait = async {
            loop {
                let line = self.lines.next_line().await.unwrap().unwrap();
                let event = Event::decode(&line).unwrap();
                if pred(&event) {
                    return event;
                }
                self.backlog.push(event);
            }
        };
        match tokio::time::timeout(Duration::from_secs(5), wait).await {
            Ok(event) => event,
            Err(_) => panic!("timed out waiting for {}", what),
        }
    }

    async fn reply(&mut self, command: &'static str) -> (bool, String, Option<u64>) {
        let event = self
            .expect(command, |e| matches!(e, Event::Reply { command: c, .. } if c == command))
            .await;
        match event {
            Event::Reply { ok, message, id, .. } => (ok, message, id),
            _ => unreachable!(),
        }
    }

    async fn login(&mut self, user: &str, password: &str) -> bool {
        self.send(Command::Authenticate {
            user: user.into(),
            password: password.into(),
        })
        .await;
        self.reply("authenticate").await.0
    }
}

async fn start_daemon() -> (String, Arc<Context>, CancellationToken) {
    let daemon = DaemonConfig {
        auth_method: AuthMethod::List,
        hash_algorithm: HashAlgorithm::Sha256,
        passwd: vec![
            PasswdEntry {
                user: "alice".into(),
                hash: HashAlgorithm::Sha256.hex_digest("secret"),
                level: AccessLevel::User,
            },
            PasswdEntry {
                user: "guest".into(),
                hash: String::new(),
                level: AccessLevel::Guest,
            },
        ],
        ..DaemonConfig::default()
    };
    let settings = Arc::new(Settings {
        daemon,
        ..Settings::default()
    });
    let ctx = Context::builder(Arc::clone(&settings))
        .cache(Arc::new(LocalCache::in_memory()))
        .build();
    let motor = DeviceConfig::new("virtual_motor").with("abslimits", json!([-10.0, 10.0]));
    ctx.create_device_from("m1", &motor).await.unwrap();

    let session = DaemonSession::new(Arc::clone(&ctx));
    let auth = Authenticator::from_config(&settings.daemon);
    let server = DaemonServer::bind("127.0.0.1:0", Arc::clone(&session), auth)
        .await
        .unwrap();
    let address = server.local_addr().unwrap().to_string();
    let token = server.shutdown_token();
    let session_stop = session.shutdown_token();
    let stop = token.clone();
    tokio::spawn(async move {
        stop.cancelled().await;
        session_stop.cancel();
    });
    tokio::spawn(session.run());
    tokio::spawn(server.run());
    (address, ctx, token)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_login_is_required() {
    let (address, _ctx, token) = start_daemon().await;
    let mut client = TestClient::connect(&address).await;

    client
        .send(Command::Run {
            code: "1".into(),
            name: None,
        })
        .await;
    let (ok, message, _) = client.reply("run").await;
    assert!(!ok);
    assert!(message.contains("not logged in"));

    assert!(!client.login("alice", "wrong").await);
    assert!(!client.login("mallory", "secret").await);
    assert!(client.login("alice", "secret").await);
    token.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_script_runs_and_reports_events() {
    let (address, ctx, token) = start_daemon().await;
    let mut client = TestClient::connect(&address).await;
    assert!(client.login("alice", "secret").await);
    client.send(Command::Subscribe).await;
    assert!(client.reply("subscribe").await.0);

    client
        .send(Command::Run {
            code: r#"maw("m1", 3.0); print("pos=" + read("m1"));"#.into(),
            name: Some("scan".into()),
        })
        .await;
    let (ok, _, id) = client.reply("run").await;
    assert!(ok);
    let id = id.unwrap();

    let printed = client
        .expect("script output", |e| {
            matches!(e, Event::Message { text, .. } if text.starts_with("pos="))
        })
        .await;
    match printed {
        Event::Message { text, script, .. } => {
            assert_eq!(text, "pos=3.0");
            assert_eq!(script, Some(id));
        }
        _ => unreachable!(),
    }
    client
        .expect("finish message", |e| {
            matches!(e, Event::Message { text, .. } if text == "scan finished")
        })
        .await;
    client
        .expect("idle status", |e| {
            matches!(e, Event::Status { state: ScriptState::Idle, script: None, queue: 0 })
        })
        .await;

    let motor = ctx.device("m1").unwrap();
    assert_eq!(motor.core().local("target"), Some(json!(3.0)));
    token.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_guest_may_watch_but_not_run() {
    let (address, _ctx, token) = start_daemon().await;
    let mut guest = TestClient::connect(&address).await;
    assert!(guest.login("guest", "").await);

    guest.send(Command::GetStatus).await;
    guest.expect("status", |e| matches!(e, Event::Status { .. })).await;

    guest
        .send(Command::Run {
            code: r#"start("m1", 1.0);"#.into(),
            name: None,
        })
        .await;
    let (ok, message, _) = guest.reply("run").await;
    assert!(!ok);
    assert!(message.contains("user access is required"), "{}", message);

    guest
        .send(Command::Help {
            topic: Some("maw".into()),
        })
        .await;
    let help = guest.expect("help", |e| matches!(e, Event::ShowHelp { .. })).await;
    match help {
        Event::ShowHelp { topic, text } => {
            assert_eq!(topic, "maw");
            assert!(text.contains("maw"));
        }
        _ => unreachable!(),
    }
    token.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_simulation_leaves_devices_alone() {
    let (address, ctx, token) = start_daemon().await;
    let mut client = TestClient::connect(&address).await;
    assert!(client.login("alice", "secret").await);
    client.send(Command::Subscribe).await;
    assert!(client.reply("subscribe").await.0);

    client
        .send(Command::Simulate {
            code: r#"maw("m1", 7.0); sleep(60);"#.into(),
            devices: vec!["m1".into()],
        })
        .await;
    let (ok, _, id) = client.reply("simulate").await;
    assert!(ok);
    let id = id.unwrap();

    let report = client
        .expect("simulation report", |e| matches!(e, Event::Simulation { .. }))
        .await;
    match report {
        Event::Simulation {
            id: report_id,
            elapsed,
            devices,
            error,
        } => {
            assert_eq!(report_id, id);
            assert_eq!(error, None);
            assert!((elapsed - 60.0).abs() < 1e-6, "{}", elapsed);
            assert_eq!(devices.len(), 1);
            assert_eq!(devices[0].name, "m1");
        }
        _ => unreachable!(),
    }

    let motor = ctx.device("m1").unwrap();
    assert_ne!(motor.core().local("target"), Some(json!(7.0)));
    token.cancel();
}

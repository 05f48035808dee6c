//! End-to-end tests against a fake MPV.
//!
//! The fake is a shell script that prints the readiness marker; the test
//! itself plays MPV's side of the IPC socket through a `UnixListener`.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use mpv_ipc::{ClientEvent, ClientState, Command, MpvClient, MpvConfig, MpvError, Topic};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;

static SCRIPTS: OnceLock<TempDir> = OnceLock::new();

fn write_script(dir: &Path, name: &str, body: &str) {
  let path = dir.join(name);
  let script = format!("#!/bin/sh\necho '[ipc] Starting IPC master'\n{}\n", body);
  std::fs::write(&path, script).unwrap();
  std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Scripts are written once, before any test spawns a process.
fn script(name: &str) -> PathBuf {
  let dir = SCRIPTS.get_or_init(|| {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "idle", "exec sleep 30");
    write_script(dir.path(), "crash", "sleep 1\nexit 3");
    write_script(dir.path(), "quick", "exit 0");
    dir
  });
  dir.path().join(name)
}

struct FakeMpv {
  listener: UnixListener,
  config: MpvConfig,
  _dir: TempDir,
}

impl FakeMpv {
  fn start(script_name: &str, auto_respawn: bool) -> Self {
    let binary = script(script_name);
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("mpv.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let config = MpvConfig {
      endpoint_path: Some(socket),
      binary_path: Some(binary),
      auto_respawn,
      ..MpvConfig::default()
    };
    Self {
      listener,
      config,
      _dir: dir,
    }
  }

  async fn accept(&self) -> (Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf) {
    let (stream, _) = within(self.listener.accept()).await.unwrap();
    let (reader, writer) = stream.into_split();
    (BufReader::new(reader).lines(), writer)
  }
}

async fn within<F: std::future::Future>(fut: F) -> F::Output {
  tokio::time::timeout(Duration::from_secs(10), fut)
    .await
    .expect("timed out")
}

async fn read_line(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> String {
  within(lines.next_line()).await.unwrap().expect("socket closed")
}

async fn wait_for_state(client: &MpvClient, state: ClientState) {
  within(async {
    while client.state() != state {
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
  })
  .await;
}

fn counter(client: &MpvClient, topic: impl Into<Topic>) -> Arc<AtomicUsize> {
  let count = Arc::new(AtomicUsize::new(0));
  let c = count.clone();
  client.on(topic, move |_| {
    c.fetch_add(1, Ordering::SeqCst);
  });
  count
}

#[tokio::test]
async fn test_get_property_resolves_with_reply_data() {
  let fake = FakeMpv::start("idle", false);
  let client = MpvClient::new(fake.config.clone()).unwrap();
  assert_eq!(client.endpoint_path(), fake.config.endpoint_path.as_deref().unwrap());

  let volume = client.get_property("volume");
  let (mut lines, mut writer) = fake.accept().await;
  assert_eq!(read_line(&mut lines).await, r#"{"command":["get_property","volume"]}"#);

  writer.write_all(b"{\"error\":\"success\",\"data\":50}\n").await.unwrap();
  assert_eq!(within(volume).await.unwrap(), json!(50));

  client.terminate().await;
  assert_eq!(client.state(), ClientState::Terminated);
}

#[tokio::test]
async fn test_buffered_commands_flush_in_order_and_replies_match_fifo() {
  let fake = FakeMpv::start("idle", false);
  let ready = Arc::new(AtomicUsize::new(0));
  let ready_count = ready.clone();
  let client = MpvClient::with_ready(fake.config.clone(), move || {
    ready_count.fetch_add(1, Ordering::SeqCst);
  })
  .unwrap();

  let first = client.set_property("volume", 30);
  let second = client.get_property("volume");
  let third = client.send_command("frame-step", Vec::<Value>::new());

  let (mut lines, mut writer) = fake.accept().await;
  within(client.wait_started()).await.unwrap();
  assert_eq!(client.state(), ClientState::Connected);
  assert_eq!(ready.load(Ordering::SeqCst), 1);

  let fourth = client.send(Command::get_property("pause"));

  assert_eq!(read_line(&mut lines).await, r#"{"command":["set_property","volume",30]}"#);
  assert_eq!(read_line(&mut lines).await, r#"{"command":["get_property","volume"]}"#);
  assert_eq!(read_line(&mut lines).await, r#"{"command":["frame-step"]}"#);
  assert_eq!(read_line(&mut lines).await, r#"{"command":["get_property","pause"]}"#);

  writer
    .write_all(
      b"{\"error\":\"success\"}\n\
{\"error\":\"success\",\"data\":30}\n\
{\"error\":\"invalid parameter\"}\n\
{\"error\":\"success\",\"data\":true}\n",
    )
    .await
    .unwrap();

  assert_eq!(within(first).await.unwrap(), Value::Null);
  assert_eq!(within(second).await.unwrap(), json!(30));
  match within(third).await {
    Err(MpvError::CommandFailed(reply)) => {
      assert_eq!(reply.error, "invalid parameter");
      assert_eq!(reply.raw, json!({"error": "invalid parameter"}));
    }
    other => panic!("Expected command failure, got {:?}", other),
  }
  assert_eq!(within(fourth).await.unwrap(), json!(true));

  client.terminate().await;
  assert_eq!(ready.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_events_reach_subscribers_without_consuming_replies() {
  let fake = FakeMpv::start("idle", false);
  let client = MpvClient::new(fake.config.clone()).unwrap();
  let pauses = counter(&client, "pause");
  let any_event = counter(&client, "event");
  let messages = counter(&client, "message");
  let seeks = counter(&client, Topic::Event("seek".to_string()));

  let volume = client.get_property("volume");
  let (mut lines, mut writer) = fake.accept().await;
  read_line(&mut lines).await;

  writer.write_all(b"{\"event\":\"pause\"}\n{\"err").await.unwrap();
  writer.write_all(b"or\":\"success\",\"data\":50}\n").await.unwrap();

  assert_eq!(within(volume).await.unwrap(), json!(50));
  assert_eq!(pauses.load(Ordering::SeqCst), 1);
  assert_eq!(any_event.load(Ordering::SeqCst), 1);
  assert_eq!(messages.load(Ordering::SeqCst), 2);
  assert_eq!(seeks.load(Ordering::SeqCst), 0);

  client.terminate().await;
}

#[tokio::test]
async fn test_decode_errors_and_desync_are_observable() {
  let fake = FakeMpv::start("idle", false);
  let client = MpvClient::new(fake.config.clone()).unwrap();
  let events = client.subscribe();

  let (mut lines, mut writer) = fake.accept().await;
  writer
    .write_all(b"not json\n{\"error\":\"success\",\"data\":1}\n")
    .await
    .unwrap();

  let mut decode_error = false;
  loop {
    match within(events.recv()).await.unwrap() {
      ClientEvent::Error(e) => decode_error |= matches!(*e, MpvError::Decode(_)),
      ClientEvent::Desync(value) => {
        assert_eq!(value["data"], json!(1));
        break;
      }
      _ => {}
    }
  }
  assert!(decode_error);

  let pause = client.get_property("pause");
  read_line(&mut lines).await;
  writer.write_all(b"{\"error\":\"success\",\"data\":false}\n").await.unwrap();
  assert_eq!(within(pause).await.unwrap(), json!(false));

  client.terminate().await;
}

#[tokio::test]
async fn test_respawn_relaunches_and_runs_reconfigure_hook() {
  let fake = FakeMpv::start("crash", true);
  let client = MpvClient::new(fake.config.clone()).unwrap();
  let exits = counter(&client, Topic::ProcessExited);
  client.set_reconfigure(|commands| {
    let _ = commands.send(Command::observe_property(1, "pause"));
  });

  let stale = client.get_property("pause");
  let (mut first, _first_writer) = fake.accept().await;
  assert_eq!(read_line(&mut first).await, r#"{"command":["get_property","pause"]}"#);

  assert!(matches!(within(stale).await, Err(MpvError::Disconnected)));
  assert!(exits.load(Ordering::SeqCst) >= 1);

  let (mut second, _second_writer) = fake.accept().await;
  assert_eq!(
    read_line(&mut second).await,
    r#"{"command":["observe_property",1,"pause"]}"#
  );
  assert_ne!(client.state(), ClientState::Terminated);

  client.terminate().await;
  assert_eq!(client.state(), ClientState::Terminated);
}

#[tokio::test]
async fn test_exit_without_respawn_terminates() {
  let fake = FakeMpv::start("crash", false);
  let client = MpvClient::new(fake.config.clone()).unwrap();
  let events = client.subscribe();

  let pending = client.get_property("pause");
  let (mut lines, _writer) = fake.accept().await;
  read_line(&mut lines).await;

  assert!(matches!(within(pending).await, Err(MpvError::Disconnected)));
  wait_for_state(&client, ClientState::Terminated).await;

  let mut exit_code = None;
  while let Ok(event) = events.try_recv() {
    if let ClientEvent::ProcessExited { code } = event {
      exit_code = code;
    }
  }
  assert_eq!(exit_code, Some(3));

  assert!(matches!(
    within(client.get_property("volume")).await,
    Err(MpvError::Terminated)
  ));
}

#[tokio::test]
async fn test_terminate_fails_pending_commands() {
  let fake = FakeMpv::start("idle", true);
  let client = MpvClient::new(fake.config.clone()).unwrap();
  let exits = counter(&client, Topic::ProcessExited);

  let pending = client.get_property("pause");
  let (mut lines, _writer) = fake.accept().await;
  read_line(&mut lines).await;

  within(client.terminate()).await;
  assert!(matches!(within(pending).await, Err(MpvError::Terminated)));
  assert_eq!(client.state(), ClientState::Terminated);
  assert!(client.wait_started().await.is_err());
  assert!(matches!(
    within(client.quit()).await,
    Err(MpvError::Terminated)
  ));
  assert_eq!(exits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_terminate_stops_a_respawn_loop() {
  for _ in 0..5 {
    let fake = FakeMpv::start("quick", true);
    let client = MpvClient::new(fake.config.clone()).unwrap();
    let exits = counter(&client, Topic::ProcessExited);
    let stopping = Arc::new(AtomicBool::new(false));
    let late_hooks = Arc::new(AtomicUsize::new(0));
    let (flag, late) = (stopping.clone(), late_hooks.clone());
    client.set_reconfigure(move |_| {
      if flag.load(Ordering::SeqCst) {
        late.fetch_add(1, Ordering::SeqCst);
      }
    });

    within(async {
      while exits.load(Ordering::SeqCst) < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await;

    stopping.store(true, Ordering::SeqCst);
    within(client.terminate()).await;
    let settled = exits.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(late_hooks.load(Ordering::SeqCst), 0);
    assert_eq!(exits.load(Ordering::SeqCst), settled);
    assert_eq!(client.state(), ClientState::Terminated);
  }
}

#[tokio::test]
async fn test_connect_failure_keeps_commands_buffered() {
  let dir = tempfile::tempdir().unwrap();
  let config = MpvConfig {
    endpoint_path: Some(dir.path().join("nobody.sock")),
    binary_path: Some(script("idle")),
    ..MpvConfig::default()
  };
  let client = MpvClient::new(config).unwrap();
  let events = client.subscribe();
  let mut pending = client.get_property("volume");

  loop {
    match within(events.recv()).await.unwrap() {
      ClientEvent::Error(e) => {
        match &*e {
          MpvError::Connect { path, .. } => assert!(path.ends_with("nobody.sock")),
          other => panic!("Expected connect error, got {:?}", other),
        }
        break;
      }
      ClientEvent::Started => panic!("Connected without a listener"),
      _ => {}
    }
  }
  assert_eq!(client.state(), ClientState::WaitingForReady);
  assert!(tokio::time::timeout(Duration::from_millis(100), &mut pending)
    .await
    .is_err());

  within(client.terminate()).await;
  assert!(matches!(within(pending).await, Err(MpvError::Terminated)));
}

#[tokio::test]
async fn test_socket_close_fails_pending_and_waits_for_ready() {
  let fake = FakeMpv::start("idle", false);
  let client = MpvClient::new(fake.config.clone()).unwrap();
  let exits = counter(&client, Topic::ProcessExited);
  let events = client.subscribe();

  let pending = client.get_property("pause");
  let (mut lines, writer) = fake.accept().await;
  read_line(&mut lines).await;
  drop(lines);
  drop(writer);

  loop {
    if let ClientEvent::Disconnected = within(events.recv()).await.unwrap() {
      break;
    }
  }
  assert!(matches!(within(pending).await, Err(MpvError::Disconnected)));
  assert_eq!(client.state(), ClientState::WaitingForReady);
  assert_eq!(exits.load(Ordering::SeqCst), 0);

  within(client.terminate()).await;
  assert_eq!(client.state(), ClientState::Terminated);
}

#[tokio::test]
async fn test_spawn_failure_is_fatal() {
  let _ = script("idle");
  let dir = tempfile::tempdir().unwrap();
  let config = MpvConfig {
    endpoint_path: Some(dir.path().join("mpv.sock")),
    binary_path: Some(PathBuf::from("/nonexistent/mpv")),
    auto_respawn: true,
    ..MpvConfig::default()
  };
  let client = MpvClient::new(config).unwrap();
  let events = client.subscribe();

  let pending = client.get_property("volume");
  assert!(matches!(within(pending).await, Err(MpvError::Terminated)));

  match within(events.recv()).await.unwrap() {
    ClientEvent::Error(e) => assert!(matches!(*e, MpvError::Spawn { .. })),
    other => panic!("Expected spawn error, got {:?}", other),
  }
  wait_for_state(&client, ClientState::Terminated).await;
  assert!(client.wait_started().await.is_err());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
  let config = MpvConfig {
    extra_args: vec!["--input-ipc-server=/tmp/elsewhere".to_string()],
    ..MpvConfig::default()
  };
  assert!(matches!(
    MpvClient::new(config),
    Err(MpvError::InvalidConfig(_))
  ));
}

#[test]
fn test_client_needs_a_runtime() {
  assert!(matches!(
    MpvClient::new(MpvConfig::default()),
    Err(MpvError::NoRuntime)
  ));
}

//! Integration tests for service routing, lifecycle and timers
//!
//! Each test runs a real multi-threaded server on a background thread and
//! observes services through a flume channel.

use flume::{Receiver, Sender};
use hearth_core::prelude::*;
use hearth_runtime::prelude::*;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct Seen {
    by: String,
    ty: u8,
    sender: u32,
    text: String,
}

/// Reports every dispatched message.
struct Recorder {
    tx: Sender<Seen>,
    name: String,
}

impl Service for Recorder {
    fn init(&mut self, ctx: &ServiceContext, config: &ServiceConfig) -> Result<()> {
        self.name = config.name.clone();
        let _ = self.tx.send(Seen {
            by: self.name.clone(),
            ty: ptype::INTEGER,
            sender: ctx.id().raw(),
            text: "ready".into(),
        });
        Ok(())
    }

    fn dispatch(&mut self, _ctx: &ServiceContext, msg: &mut Message) {
        let _ = self.tx.send(Seen {
            by: self.name.clone(),
            ty: msg.ty(),
            sender: msg.sender(),
            text: String::from_utf8_lossy(msg.bytes()).into_owned(),
        });
    }
}

/// Forwards TEXT messages to the service whose raw id is in `params`.
struct Forwarder {
    target: ServiceId,
}

impl Service for Forwarder {
    fn init(&mut self, _ctx: &ServiceContext, config: &ServiceConfig) -> Result<()> {
        let raw = config
            .params
            .parse::<u32>()
            .map_err(|e| HearthError::service_init(e.to_string()))?;
        self.target = ServiceId::from_raw(raw);
        Ok(())
    }

    fn dispatch(&mut self, _ctx: &ServiceContext, msg: &mut Message) {
        if msg.ty() == ptype::TEXT {
            msg.set_receiver(self.target);
        }
    }
}

struct Failing;

impl Service for Failing {
    fn init(&mut self, _ctx: &ServiceContext, _config: &ServiceConfig) -> Result<()> {
        Err(HearthError::service_init("refusing to start"))
    }

    fn dispatch(&mut self, _ctx: &ServiceContext, _msg: &mut Message) {}
}

/// Runs an async script in `init` and reports each step.
struct Script<F> {
    tx: Sender<String>,
    script: F,
}

impl<F> Service for Script<F>
where
    F: Fn(ServiceContext, Sender<String>) -> futures::future::LocalBoxFuture<'static, ()> + 'static,
{
    fn init(&mut self, ctx: &ServiceContext, _config: &ServiceConfig) -> Result<()> {
        ctx.spawn((self.script)(ctx.clone(), self.tx.clone()));
        Ok(())
    }

    fn dispatch(&mut self, _ctx: &ServiceContext, msg: &mut Message) {
        let text = String::from_utf8_lossy(msg.bytes()).into_owned();
        let _ = self
            .tx
            .send(format!("dispatch {} {}", ptype::name(msg.ty()), text));
    }
}

fn register_script<F>(server: &Server, name: &str, tx: &Sender<String>, script: F)
where
    F: Fn(ServiceContext, Sender<String>) -> futures::future::LocalBoxFuture<'static, ()>
        + Clone
        + Send
        + Sync
        + 'static,
{
    let tx = tx.clone();
    server
        .register_service(name, move || {
            Box::new(Script {
                tx: tx.clone(),
                script: script.clone(),
            })
        })
        .unwrap();
}

fn start(workers: usize) -> (Arc<Server>, Sender<Seen>, Receiver<Seen>) {
    hearth_runtime_test_tracing();
    let server = Server::new(
        ServerOptions::new()
            .with_worker_count(workers)
            .with_name("test"),
    );
    let (tx, rx) = flume::unbounded();
    let recorder_tx = tx.clone();
    server
        .register_service("recorder", move || {
            Box::new(Recorder {
                tx: recorder_tx.clone(),
                name: String::new(),
            })
        })
        .unwrap();
    server
        .register_service("forwarder", || {
            Box::new(Forwarder {
                target: ServiceId::NONE,
            })
        })
        .unwrap();
    server.register_service("failing", || Box::new(Failing)).unwrap();
    (server, tx, rx)
}

fn run(server: &Arc<Server>) -> JoinHandle<Result<i32>> {
    let server = Arc::clone(server);
    thread::spawn(move || server.run())
}

fn hearth_runtime_test_tracing() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Collect `ready` events until every name in `names` has reported.
fn wait_ready(rx: &Receiver<Seen>, names: &[&str]) -> Vec<(String, ServiceId)> {
    let mut ready = Vec::new();
    while ready.len() < names.len() {
        let seen = rx.recv_timeout(WAIT).expect("service did not start");
        if seen.text == "ready" && names.contains(&seen.by.as_str()) {
            ready.push((seen.by, ServiceId::from_raw(seen.sender)));
        }
    }
    ready
}

fn id_of(ready: &[(String, ServiceId)], name: &str) -> ServiceId {
    ready.iter().find(|(n, _)| n == name).map(|(_, id)| *id).unwrap()
}

/// Everything received within `window`.
fn drain_for(rx: &Receiver<Seen>, window: Duration) -> Vec<Seen> {
    let deadline = Instant::now() + window;
    let mut out = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(seen) => out.push(seen),
            Err(_) => break,
        }
    }
    out
}

fn stop(server: &Arc<Server>, runner: JoinHandle<Result<i32>>) -> i32 {
    server.stop(0);
    runner.join().unwrap().unwrap()
}

#[test]
fn test_system_broadcast_reaches_only_unique_services() {
    let (server, _tx, rx) = start(2);
    server.new_service(ServiceConfig::new("recorder").with_name("root").unique(true));
    server.new_service(ServiceConfig::new("recorder").with_name("a").unique(true));
    server.new_service(ServiceConfig::new("recorder").with_name("b"));
    server.new_service(ServiceConfig::new("recorder").with_name("c"));
    server.new_service(ServiceConfig::new("recorder").with_name("d").unique(true));
    let runner = run(&server);

    let ready = wait_ready(&rx, &["root", "a", "b", "c", "d"]);
    let d = id_of(&ready, "d");

    server.broadcast(d, &ByteBuffer::from("notice"), ptype::SYSTEM);
    let seen = drain_for(&rx, Duration::from_millis(300));
    let mut receivers: Vec<_> = seen
        .iter()
        .filter(|s| s.text == "notice")
        .map(|s| s.by.as_str())
        .collect();
    receivers.sort_unstable();
    assert_eq!(receivers, ["a", "root"]);

    // TEXT broadcasts reach everyone but the sender
    server.broadcast(d, &ByteBuffer::from("hello"), ptype::TEXT);
    let seen = drain_for(&rx, Duration::from_millis(300));
    let mut receivers: Vec<_> = seen
        .iter()
        .filter(|s| s.text == "hello")
        .map(|s| s.by.as_str())
        .collect();
    receivers.sort_unstable();
    assert_eq!(receivers, ["a", "b", "c", "root"]);

    assert_eq!(stop(&server, runner), 0);
}

#[test]
fn test_redirect_is_delivered_once() {
    let (server, _tx, rx) = start(2);
    server.new_service(ServiceConfig::new("recorder").with_name("sink"));
    let runner = run(&server);
    let ready = wait_ready(&rx, &["sink"]);
    let sink = id_of(&ready, "sink");

    server.new_service(
        ServiceConfig::new("forwarder")
            .with_name("fwd")
            .unique(true)
            .with_params(sink.raw().to_string()),
    );
    let fwd = loop {
        if let Some(id) = server.unique_service("fwd") {
            break id;
        }
        thread::sleep(Duration::from_millis(5));
    };

    let origin = ServiceId::new(1, 0x00FF_FF00);
    // the unknown sender only matters if something bounces
    server.send(origin, fwd, ByteBuffer::from("relay"), 0, ptype::TEXT);

    let seen = drain_for(&rx, Duration::from_millis(300));
    let relayed: Vec<_> = seen.iter().filter(|s| s.text == "relay").collect();
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].by, "sink");
    assert_eq!(relayed[0].sender, origin.raw());

    assert_eq!(stop(&server, runner), 0);
}

#[test]
fn test_broadcast_is_never_redirected() {
    let (server, _tx, rx) = start(1);
    server.new_service(ServiceConfig::new("recorder").with_name("sink"));
    server.new_service(ServiceConfig::new("recorder").with_name("other"));
    let runner = run(&server);
    let ready = wait_ready(&rx, &["sink", "other"]);
    let sink = id_of(&ready, "sink");

    // the forwarder tries to send every TEXT it sees on to the sink
    server.new_service(
        ServiceConfig::new("forwarder")
            .with_name("fwd")
            .unique(true)
            .with_params(sink.raw().to_string()),
    );
    while server.unique_service("fwd").is_none() {
        thread::sleep(Duration::from_millis(5));
    }

    let origin = ServiceId::new(1, 0x00FF_FF00);
    server.broadcast(origin, &ByteBuffer::from("news"), ptype::TEXT);

    let seen = drain_for(&rx, Duration::from_millis(300));
    let mut receivers: Vec<_> = seen
        .iter()
        .filter(|s| s.text == "news")
        .map(|s| s.by.as_str())
        .collect();
    receivers.sort_unstable();
    // one copy each; the forwarder's redirect attempt delivers nothing extra
    assert_eq!(receivers, ["other", "sink"]);

    // the worker keeps routing normally afterwards
    server.send(origin, sink, ByteBuffer::from("direct"), 0, ptype::TEXT);
    let direct = rx.recv_timeout(WAIT).unwrap();
    assert_eq!((direct.by.as_str(), direct.text.as_str()), ("sink", "direct"));

    assert_eq!(stop(&server, runner), 0);
}

#[test]
fn test_dead_letters_fail_calls() {
    let (server, _tx, _rx) = start(2);
    let (tx, rx) = flume::unbounded();
    register_script(&server, "caller", &tx, |ctx, tx| {
        Box::pin(async move {
            let dead_local = ServiceId::new(ctx.worker_id(), 0x00AB_CDEF);
            let unknown_worker = ServiceId::new(200, 1);
            for target in [dead_local, unknown_worker] {
                let outcome = ctx.call(target, ByteBuffer::from("hi"), ptype::TEXT).await;
                let _ = tx.send(match outcome {
                    Ok(_) => "ok".to_string(),
                    Err(e) => e.to_string(),
                });
            }
        })
    });
    server.new_service(ServiceConfig::new("caller").with_name("caller"));
    let runner = run(&server);

    for _ in 0..2 {
        let text = rx.recv_timeout(WAIT).unwrap();
        assert!(text.contains("attempt send to dead service"), "{text}");
        // payload is hex encoded
        assert!(text.ends_with("6869"), "{text}");
    }

    assert_eq!(stop(&server, runner), 0);
}

#[test]
fn test_service_lifecycle_and_unique_names() {
    let (server, _tx, _rx) = start(2);
    let (tx, rx) = flume::unbounded();
    register_script(&server, "manager", &tx, |ctx, tx| {
        Box::pin(async move {
            let report = |s: String| {
                let _ = tx.send(s);
            };
            let conf = ServiceConfig::new("recorder").with_name("p1").unique(true);
            let id = ctx.new_service(conf.clone()).await.unwrap();
            report(format!(
                "created {}",
                ctx.server().unique_service("p1") == Some(id)
            ));

            match ctx.new_service(conf).await {
                Ok(_) => report("duplicate created".into()),
                Err(e) => report(format!("duplicate {e}")),
            }
            match ctx.new_service(ServiceConfig::new("nope")).await {
                Ok(_) => report("unknown created".into()),
                Err(e) => report(format!("unknown {e}")),
            }

            let listing = ctx.scan_services(id.worker()).await.unwrap();
            report(format!("scan {}", listing.contains("\"name\":\"p1\"")));

            ctx.remove_service(id).await.unwrap();
            report(format!("removed {}", ctx.server().unique_service("p1").is_none()));
            match ctx.remove_service(id).await {
                Ok(()) => report("removed twice".into()),
                Err(e) => report(format!("again {e}")),
            }
        })
    });
    server.new_service(ServiceConfig::new("manager").with_name("manager").unique(true));
    let runner = run(&server);

    let mut next = || rx.recv_timeout(WAIT).unwrap();
    assert_eq!(next(), "created true");
    let dup = next();
    assert!(dup.starts_with("duplicate 0 "), "{dup}");
    assert!(dup.contains("'p1' is already taken"), "{dup}");
    let unknown = next();
    assert!(unknown.contains("Unknown service type 'nope'"), "{unknown}");
    assert_eq!(next(), "scan true");

    // the exit notice is a SYSTEM broadcast; manager is unique so it sees it
    let mut saw_exit = false;
    let mut removed = None;
    let mut again = None;
    while removed.is_none() || again.is_none() || !saw_exit {
        let line = next();
        if line.starts_with("dispatch system _service_exit,name:p1") {
            saw_exit = true;
        } else if line.starts_with("removed") {
            removed = Some(line);
        } else if line.starts_with("again") {
            again = Some(line);
        }
    }
    assert_eq!(removed.as_deref(), Some("removed true"));
    assert!(again.unwrap().contains("not found"));

    assert_eq!(stop(&server, runner), 0);
    assert_eq!(server.service_count(), 0);
}

#[test]
fn test_scan_escapes_service_names() {
    let (server, _tx, rx) = start(1);
    let (script_tx, script_rx) = flume::unbounded();
    register_script(&server, "scanner", &script_tx, |ctx, tx| {
        Box::pin(async move {
            let listing = ctx.scan_services(ctx.worker_id()).await.unwrap();
            let _ = tx.send(listing);
        })
    });
    server.new_service(ServiceConfig::new("recorder").with_name("we\"ird\\name"));
    let runner = run(&server);
    wait_ready(&rx, &["we\"ird\\name"]);
    server.new_service(ServiceConfig::new("scanner").with_name("scanner"));

    let listing = script_rx.recv_timeout(WAIT).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&listing).unwrap();
    let names: Vec<&str> = parsed
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"we\"ird\\name"), "{listing}");
    assert!(names.contains(&"scanner"), "{listing}");
    assert!(parsed[0]["serviceid"].as_str().unwrap().starts_with('1'));

    assert_eq!(stop(&server, runner), 0);
}

#[test]
fn test_timers_and_sleep() {
    let (server, _tx, _rx) = start(1);
    let (tx, rx) = flume::unbounded();
    register_script(&server, "sleeper", &tx, |ctx, tx| {
        Box::pin(async move {
            let started = Instant::now();
            ctx.sleep(50).await.unwrap();
            let _ = tx.send(format!("slept {}", started.elapsed() >= Duration::from_millis(45)));
            let timer = ctx.timeout(20);
            let _ = tx.send(format!("timer {timer}"));
        })
    });
    server.new_service(ServiceConfig::new("sleeper").with_name("sleeper"));
    let runner = run(&server);

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "slept true");
    let timer = rx.recv_timeout(WAIT).unwrap();
    let id = timer.strip_prefix("timer ").unwrap();
    // the TIMER message itself is dispatched with an empty payload
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "dispatch timer ");
    assert!(!id.is_empty());

    assert_eq!(stop(&server, runner), 0);
}

#[test]
fn test_shutdown_notifies_services() {
    let (server, _tx, rx) = start(2);
    server.new_service(ServiceConfig::new("recorder").with_name("x"));
    server.new_service(ServiceConfig::new("recorder").with_name("y"));
    let runner = run(&server);
    wait_ready(&rx, &["x", "y"]);

    assert_eq!(stop(&server, runner), 0);
    let shutdowns = rx
        .drain()
        .filter(|s| s.ty == ptype::SHUTDOWN)
        .count();
    assert_eq!(shutdowns, 2);
    assert_eq!(server.state(), ServerState::Stopped);
}

#[test]
fn test_failed_bootstrap_stops_server() {
    let (server, _tx, _rx) = start(1);
    server.new_service(ServiceConfig::new("failing").with_name("boot"));
    let runner = run(&server);
    assert_eq!(runner.join().unwrap().unwrap(), -1);
}

#[test]
fn test_unknown_bootstrap_type_stops_server() {
    let (server, _tx, _rx) = start(2);
    server.new_service(ServiceConfig::new("not-registered").with_name("boot"));
    let runner = run(&server);

    let deadline = Instant::now() + WAIT;
    while !runner.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(runner.is_finished(), "run() still blocked in {:?}", server.state());
    assert_eq!(runner.join().unwrap().unwrap(), -1);
    assert_eq!(server.service_count(), 0);
}

#[test]
fn test_removing_bootstrap_stops_server() {
    let (server, _tx, rx) = start(1);
    server.new_service(ServiceConfig::new("recorder").with_name("boot"));
    let runner = run(&server);
    let ready = wait_ready(&rx, &["boot"]);
    assert_eq!(id_of(&ready, "boot"), ServiceId::BOOTSTRAP);

    server.remove_service(ServiceId::BOOTSTRAP, ServiceId::NONE, 0);
    assert_eq!(runner.join().unwrap().unwrap(), 0);
}

#[test]
fn test_info_before_start() {
    let (server, _tx, _rx) = start(3);
    let info = server.info();
    assert!(info.starts_with("[{\"id\":0,"));
    assert_eq!(info.matches("\"mqsize\"").count(), 3);
}

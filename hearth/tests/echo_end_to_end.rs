//! End-to-end test through the public facade: a gate service hands every
//! accepted connection to a fresh echo service.

use flume::Sender;
use hearth::prelude::*;
use std::cell::Cell;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

struct Gate {
    tx: Sender<String>,
}

impl Service for Gate {
    fn init(&mut self, ctx: &ServiceContext, _config: &ServiceConfig) -> Result<()> {
        let tx = self.tx.clone();
        let task = ctx.clone();
        ctx.spawn(async move {
            let (listener, addr) = task.listen("127.0.0.1", 0, ptype::SOCKET_TCP).await.unwrap();
            let _ = tx.send(addr.to_string());
            // runs until shutdown abandons the pending session
            while let Ok(echo) = task.new_service(ServiceConfig::new("echo")).await {
                let Ok(fd) = task.accept(listener, echo).await else {
                    break;
                };
                task.send(echo, ByteBuffer::from(format!("set_fd|{fd}")), ptype::COMMAND);
            }
        });
        Ok(())
    }

    fn dispatch(&mut self, _ctx: &ServiceContext, _msg: &mut Message) {}
}

struct Echo {
    tx: Sender<String>,
}

impl Service for Echo {
    fn init(&mut self, _ctx: &ServiceContext, _config: &ServiceConfig) -> Result<()> {
        Ok(())
    }

    fn dispatch(&mut self, ctx: &ServiceContext, msg: &mut Message) {
        let cmd = Command::parse(msg.as_str().unwrap_or_default());
        let Some(fd) = cmd.arg_as::<u32>(0) else {
            return;
        };
        let tx = self.tx.clone();
        let task = ctx.clone();
        ctx.spawn(async move {
            let _ = tx.send(format!("worker {}", task.worker_id()));
            while let Ok(mut line) = task.read(fd, 0, b"\n").await {
                line.write_back(b"\n");
                task.write(fd, line);
            }
            let _ = tx.send(format!("closed, write {}", task.write(fd, "late".into())));
            task.quit();
        });
    }
}

fn start() -> (Arc<Server>, thread::JoinHandle<Result<i32>>, flume::Receiver<String>) {
    let server = Server::new(ServerOptions::new().with_worker_count(2));
    let (tx, rx) = flume::unbounded();
    let gate_tx = tx.clone();
    server
        .register_service("gate", move || Box::new(Gate { tx: gate_tx.clone() }))
        .unwrap();
    server
        .register_service("echo", move || Box::new(Echo { tx: tx.clone() }))
        .unwrap();
    server.new_service(ServiceConfig::new("gate").with_name("gate").unique(true));

    let runner = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.run())
    };
    (server, runner, rx)
}

fn echo_line(stream: &mut TcpStream, reader: &mut BufReader<TcpStream>, line: &str) -> String {
    stream.write_all(line.as_bytes()).unwrap();
    let mut reply = String::new();
    reader.read_line(&mut reply).unwrap();
    reply
}

#[test]
fn test_echo_through_gate() {
    hearth::dev_tracing::init_tracing();
    let (server, runner, rx) = start();
    let addr = rx.recv_timeout(WAIT).unwrap();

    let mut a = TcpStream::connect(&addr).unwrap();
    a.set_read_timeout(Some(WAIT)).unwrap();
    let mut a_reader = BufReader::new(a.try_clone().unwrap());
    let mut b = TcpStream::connect(&addr).unwrap();
    b.set_read_timeout(Some(WAIT)).unwrap();
    let mut b_reader = BufReader::new(b.try_clone().unwrap());

    assert_eq!(echo_line(&mut a, &mut a_reader, "ping\n"), "ping\n");
    assert_eq!(echo_line(&mut b, &mut b_reader, "pong\n"), "pong\n");
    assert_eq!(echo_line(&mut a, &mut a_reader, "again\n"), "again\n");

    // one echo service per connection
    for _ in 0..2 {
        assert!(rx.recv_timeout(WAIT).unwrap().starts_with("worker "));
    }

    drop(a_reader);
    drop(a);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "closed, write false");

    // gate, the echo still serving b, and the spare echo waiting for the next connection
    let deadline = Instant::now() + WAIT;
    while server.service_count() != 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(server.service_count(), 3);

    server.stop(0);
    assert_eq!(runner.join().unwrap().unwrap(), 0);
}

/// Accepts one connection on worker 2 and hands it to an echo pinned to
/// worker 1. Once that echo exits, calls it to observe the dead letter.
struct PinnedGate {
    tx: Sender<String>,
    echo: Rc<Cell<ServiceId>>,
}

impl Service for PinnedGate {
    fn init(&mut self, ctx: &ServiceContext, _config: &ServiceConfig) -> Result<()> {
        let tx = self.tx.clone();
        let echo_slot = Rc::clone(&self.echo);
        let task = ctx.clone();
        ctx.spawn(async move {
            let (listener, addr) = task.listen("127.0.0.1", 0, ptype::SOCKET_TCP).await.unwrap();
            let conf = ServiceConfig::new("pinned_echo").with_name("echo").pinned_to(1);
            let echo = task.new_service(conf).await.unwrap();
            echo_slot.set(echo);
            let _ = tx.send(addr.to_string());

            let fd = task.accept(listener, echo).await.unwrap();
            task.send(echo, ByteBuffer::from(format!("set_fd|{fd}")), ptype::COMMAND);
        });
        Ok(())
    }

    fn dispatch(&mut self, ctx: &ServiceContext, msg: &mut Message) {
        let echo = self.echo.get();
        let exited = msg.ty() == ptype::SYSTEM
            && msg.as_str().is_some_and(|t| t.starts_with("_service_exit,name:echo"));
        if !exited || echo.is_none() {
            return;
        }
        let tx = self.tx.clone();
        let task = ctx.clone();
        ctx.spawn(async move {
            let outcome = task.call(echo, ByteBuffer::from("ping"), ptype::TEXT).await;
            let _ = tx.send(match outcome {
                Ok(_) => "call answered".to_string(),
                Err(e) => format!("call failed: {e}"),
            });
        });
    }
}

/// Turns every line read from its connection into a TEXT message to itself
/// and writes TEXT payloads back to the connection.
struct PinnedEcho {
    tx: Sender<String>,
    fd: Rc<Cell<u32>>,
}

impl Service for PinnedEcho {
    fn init(&mut self, _ctx: &ServiceContext, _config: &ServiceConfig) -> Result<()> {
        Ok(())
    }

    fn dispatch(&mut self, ctx: &ServiceContext, msg: &mut Message) {
        match msg.ty() {
            ptype::COMMAND => {
                let cmd = Command::parse(msg.as_str().unwrap_or_default());
                let Some(fd) = cmd.arg_as::<u32>(0) else {
                    return;
                };
                self.fd.set(fd);
                let _ = self.tx.send(format!("echo on worker {}", ctx.worker_id()));

                let task = ctx.clone();
                ctx.spawn(async move {
                    while let Ok(line) = task.read(fd, 0, b"\n").await {
                        task.send(task.id(), line, ptype::TEXT);
                    }
                    // one more TEXT after the handle is gone
                    task.send(task.id(), ByteBuffer::from("late"), ptype::TEXT);
                });
            }
            ptype::TEXT => {
                let mut line = msg.take_payload();
                line.write_back(b"\n");
                if !ctx.write(self.fd.get(), line) {
                    let _ = self.tx.send("write on closed handle refused".to_string());
                    ctx.quit();
                }
            }
            _ => {}
        }
    }
}

/// Holds the bootstrap id so that no service under test is the bootstrap.
struct Idle;

impl Service for Idle {
    fn init(&mut self, _ctx: &ServiceContext, _config: &ServiceConfig) -> Result<()> {
        Ok(())
    }

    fn dispatch(&mut self, _ctx: &ServiceContext, _msg: &mut Message) {}
}

#[test]
fn test_pinned_echo_then_dead_letter() {
    let server = Server::new(ServerOptions::new().with_worker_count(2));
    let (tx, rx) = flume::unbounded();
    let gate_tx = tx.clone();
    server
        .register_service("pinned_gate", move || {
            Box::new(PinnedGate {
                tx: gate_tx.clone(),
                echo: Rc::new(Cell::new(ServiceId::NONE)),
            })
        })
        .unwrap();
    server
        .register_service("pinned_echo", move || {
            Box::new(PinnedEcho {
                tx: tx.clone(),
                fd: Rc::new(Cell::new(0)),
            })
        })
        .unwrap();
    server.register_service("idle", || Box::new(Idle)).unwrap();
    // the echo quits mid-test; removing the bootstrap would stop the server
    server.new_service(ServiceConfig::new("idle").with_name("boot").pinned_to(1));
    server.new_service(
        ServiceConfig::new("pinned_gate")
            .with_name("gate")
            .unique(true)
            .pinned_to(2),
    );
    let runner = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.run())
    };

    let addr = rx.recv_timeout(WAIT).unwrap();
    let mut client = TcpStream::connect(&addr).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    let mut reader = BufReader::new(client.try_clone().unwrap());

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "echo on worker 1");
    assert_eq!(echo_line(&mut client, &mut reader, "ping\n"), "ping\n");

    drop(reader);
    drop(client);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "write on closed handle refused");

    let outcome = rx.recv_timeout(WAIT).unwrap();
    assert!(outcome.starts_with("call failed: "), "{outcome}");
    assert!(outcome.contains("attempt send to dead service"), "{outcome}");
    // hex of "ping"
    assert!(outcome.ends_with("70696e67"), "{outcome}");
    assert_eq!(server.unique_service("gate").map(|id| id.worker()), Some(2));
    assert_eq!(server.state(), ServerState::Running);

    server.stop(0);
    assert_eq!(runner.join().unwrap().unwrap(), 0);
}

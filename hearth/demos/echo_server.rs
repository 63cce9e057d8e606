//! Line echo server
//!
//! A unique `gate` service owns the listener. Every accepted connection gets
//! its own `echo` service, placed on the least-loaded worker, which reads
//! lines and writes them back until the peer goes away.
//!
//! Run with `cargo run --example echo_server -- --port 28221` and talk to it
//! with `nc 127.0.0.1 28221`.

use hearth::prelude::*;
use std::env;

const DEFAULT_PORT: u16 = 28221;

struct Gate {
    port: u16,
}

impl Service for Gate {
    fn init(&mut self, ctx: &ServiceContext, _config: &ServiceConfig) -> Result<()> {
        let port = self.port;
        let task = ctx.clone();
        ctx.spawn(async move {
            let (listener, addr) = match task.listen("127.0.0.1", port, ptype::SOCKET_TCP).await {
                Ok(bound) => bound,
                Err(e) => {
                    eprintln!("listen failed: {e}");
                    task.server().stop(1);
                    return;
                }
            };
            println!("echo server listening on {addr}");

            loop {
                let echo = match task.new_service(ServiceConfig::new("echo")).await {
                    Ok(id) => id,
                    Err(e) => {
                        eprintln!("cannot create echo service: {e}");
                        task.server().stop(1);
                        return;
                    }
                };
                match task.accept(listener, echo).await {
                    Ok(fd) => {
                        let cmd = format!("set_fd|{fd}");
                        task.send(echo, ByteBuffer::from(cmd), ptype::COMMAND);
                    }
                    Err(e) => {
                        eprintln!("accept failed: {e}");
                        task.close_service(echo);
                    }
                }
            }
        });
        Ok(())
    }

    fn dispatch(&mut self, _ctx: &ServiceContext, _msg: &mut Message) {}
}

struct Echo;

impl Service for Echo {
    fn init(&mut self, _ctx: &ServiceContext, _config: &ServiceConfig) -> Result<()> {
        Ok(())
    }

    fn dispatch(&mut self, ctx: &ServiceContext, msg: &mut Message) {
        if msg.ty() != ptype::COMMAND {
            return;
        }
        let cmd = Command::parse(msg.as_str().unwrap_or_default());
        let Some(fd) = cmd.arg_as::<u32>(0).filter(|_| cmd.verb() == "set_fd") else {
            return;
        };

        let task = ctx.clone();
        ctx.spawn(async move {
            let peer = task.address(fd).unwrap_or_default();
            println!("[{}] {} connected", task.id(), peer);
            loop {
                match task.read(fd, 0, b"\n").await {
                    Ok(mut line) => {
                        line.write_back(b"\n");
                        if !task.write(fd, line) {
                            break;
                        }
                    }
                    Err(e) => {
                        println!("[{}] {} closed: {}", task.id(), peer, e);
                        break;
                    }
                }
            }
            task.quit();
        });
    }
}

fn main() -> Result<()> {
    hearth::dev_tracing::init_tracing();

    let args: Vec<String> = env::args().collect();
    let port = if args.len() > 2 && args[1] == "--port" {
        args[2].parse::<u16>().unwrap_or(DEFAULT_PORT)
    } else {
        DEFAULT_PORT
    };

    let server = Server::new(ServerOptions::new().with_name("echo"));
    server.register_service("gate", move || Box::new(Gate { port }))?;
    server.register_service("echo", || Box::new(Echo))?;
    server.new_service(ServiceConfig::new("gate").with_name("gate").unique(true));

    let code = server.run()?;
    std::process::exit(code);
}

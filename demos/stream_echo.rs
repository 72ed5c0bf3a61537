use std::{
    io::{Read, Write},
    net::TcpStream,
    thread,
    time::Duration,
};

use mill_conn::{
    prelude::*,
    protocol::frame::{FrameHead, HEAD_LEN_SIZE},
};
use tracing_subscriber::EnvFilter;

const CMD_ECHO: u32 = 1;
const CMD_UPPER: u32 = 2;

struct Echo;

impl StreamDispatcher for Echo {
    fn on_connected(&self, conn: &mut StreamConnection) {
        tracing::info!(conn = %conn.id(), "client connected");
    }

    fn dispatch(&self, conn: &mut StreamConnection, cmd: u32, body: &[u8]) -> anyhow::Result<()> {
        let reply = match cmd {
            CMD_ECHO => body.to_vec(),
            CMD_UPPER => body.to_ascii_uppercase(),
            other => anyhow::bail!("unknown command {other}"),
        };
        conn.send(&encode_frame(cmd, &reply)?)?;
        Ok(())
    }

    fn on_destroy(&self, conn: &mut StreamConnection) {
        tracing::info!(conn = %conn.id(), "client gone");
    }
}

fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len = [0u8; HEAD_LEN_SIZE];
    stream.read_exact(&mut len)?;
    let head_len = u64::from_be_bytes(len) as usize;
    let mut head = vec![0u8; head_len];
    stream.read_exact(&mut head)?;
    let head: FrameHead = serde_json::from_slice(&head)?;
    let mut body = vec![0u8; head.body_len as usize];
    stream.read_exact(&mut body)?;
    Ok(body)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::builder()
        .address("127.0.0.1:0".parse()?)
        .workers(2)
        .build()?;
    let mut server = Server::bind(config, StreamProtocol::new(Echo))?;
    let addr = server.local_addr()?;
    let handle = server.shutdown_handle();
    let runner = thread::spawn(move || server.run());

    let mut client = TcpStream::connect(addr)?;
    client.set_read_timeout(Some(Duration::from_secs(5)))?;
    for (cmd, text) in [(CMD_ECHO, "hello"), (CMD_UPPER, "shout"), (CMD_ECHO, "bye")] {
        client.write_all(&encode_frame(cmd, text.as_bytes())?)?;
        let reply = read_frame(&mut client)?;
        println!("cmd {} {:?} -> {:?}", cmd, text, String::from_utf8_lossy(&reply));
    }
    drop(client);

    handle.shutdown();
    runner.join().map_err(|_| "server thread panicked")??;
    Ok(())
}

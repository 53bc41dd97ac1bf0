//! rtcastd: single-threaded media routing server. Drives the sans-io core
//! with a current-thread tokio runtime: UDP for WebRTC media, TCP for
//! GB28181 ingest, and HTTP for the API and the live remux edge.

use clap::Parser;
use log::{debug, info, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

use rtcast::api::ApiServer;
use rtcast::config::MemoryConfig;
use rtcast::gb::GbListener;
use rtcast::hooks::NopHooks;
use rtcast::http::stream::HttpStreamServer;
use rtcast::http::{BufferResponseWriter, HttpMessage};
use rtcast::manager::ResourceManager;
use rtcast::network::NetworkWriter;
use rtcast::session::RtcSession;
use rtcast::stats::Statistic;

#[derive(Parser, Debug)]
#[command(name = "rtcastd", about = "real-time media routing server")]
struct Args {
    /// UDP port for WebRTC media.
    #[arg(long, default_value_t = 8000)]
    rtc_port: u16,

    /// TCP port for the HTTP API and live streams.
    #[arg(long, default_value_t = 1985)]
    http_port: u16,

    /// TCP port for GB28181 media ingest.
    #[arg(long, default_value_t = 9000)]
    gb_port: u16,
}

struct UdpWriter {
    socket: Rc<UdpSocket>,
    peer: SocketAddr,
    local: SocketAddr,
}

impl NetworkWriter for UdpWriter {
    fn write_packet(&self, data: &[u8]) -> shared::error::Result<usize> {
        self.socket
            .try_send_to(data, self.peer)
            .map_err(shared::error::Error::from)
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to build runtime: {e}");
            std::process::exit(1);
        }
    };

    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        if let Err(e) = run(args).await {
            eprintln!("server failed: {e}");
            std::process::exit(1);
        }
    });
}

async fn run(args: Args) -> std::io::Result<()> {
    let manager = ResourceManager::new("server");
    let config = Rc::new(MemoryConfig {
        stream_caster_listen: args.gb_port,
        ..Default::default()
    });
    let stat = Rc::new(Statistic::new(
        &format!("vid-{:08x}", rand::random::<u32>()),
        &format!("svc-{:08x}", rand::random::<u32>()),
        &std::process::id().to_string(),
    ));

    let api = Rc::new(ApiServer::new(stat.clone(), config.clone()));
    let streams = Rc::new(HttpStreamServer::new(
        config.clone(),
        stat.clone(),
        Rc::new(NopHooks),
    ));
    let gb = Rc::new(GbListener::new(manager.clone(), &*config));

    info!(
        "rtcastd: rtc udp :{}, http :{}, gb tcp :{}",
        args.rtc_port, args.http_port, args.gb_port
    );

    let udp = Rc::new(UdpSocket::bind(("0.0.0.0", args.rtc_port)).await?);
    let http = TcpListener::bind(("0.0.0.0", args.http_port)).await?;
    let gb_listener = TcpListener::bind(("0.0.0.0", args.gb_port)).await?;

    // Sessions by peer address, filled as STUN bindings arrive.
    let peers: Rc<RefCell<HashMap<SocketAddr, Rc<RtcSession>>>> =
        Rc::new(RefCell::new(HashMap::new()));

    // UDP media loop.
    {
        let udp = udp.clone();
        let peers = peers.clone();
        let manager = manager.clone();
        tokio::task::spawn_local(async move {
            let mut buf = vec![0u8; 2048];
            let local = udp.local_addr().ok();
            loop {
                let (n, peer) = match udp.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("udp recv: {e}");
                        continue;
                    }
                };
                let session = peers.borrow().get(&peer).cloned();
                let Some(session) = session else {
                    debug!("udp: no session for {peer}, drop {n} bytes");
                    continue;
                };
                let writer = Rc::new(UdpWriter {
                    socket: udp.clone(),
                    peer,
                    local: local.unwrap_or(peer),
                });
                session
                    .udp_network()
                    .borrow_mut()
                    .update_sendonly_socket(writer);
                if let Err(e) = session.on_udp_packet(&buf[..n], Instant::now()) {
                    debug!("udp: packet from {peer} dropped: {e}");
                }
                manager.dispose();
            }
        });
    }

    // GB28181 media ingest.
    {
        let gb = gb.clone();
        let manager = manager.clone();
        tokio::task::spawn_local(async move {
            loop {
                let (mut socket, peer) = match gb_listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("gb accept: {e}");
                        continue;
                    }
                };
                info!("gb: media connection from {peer}");
                let mut conn = gb.accept();
                let manager = manager.clone();
                tokio::task::spawn_local(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) => break,
                            Ok(n) => {
                                if let Err(e) = conn.on_data(&buf[..n]) {
                                    debug!("gb: {peer}: {e}");
                                }
                            }
                            Err(e) => {
                                debug!("gb: {peer} read: {e}");
                                break;
                            }
                        }
                    }
                    conn.on_disconnect();
                    manager.dispose();
                });
            }
        });
    }

    // HTTP API and live streams.
    loop {
        let (mut socket, peer) = http.accept().await?;
        let api = api.clone();
        let streams = streams.clone();
        let manager = manager.clone();
        tokio::task::spawn_local(async move {
            let mut buf = vec![0u8; 8192];
            let n = match socket.read(&mut buf).await {
                Ok(n) if n > 0 => n,
                _ => return,
            };
            let Some(req) = parse_request(&buf[..n]) else {
                return;
            };
            debug!("http: {peer} {} {}", req.method, req.path);

            let mut w = BufferResponseWriter::new();
            let served = if req.path.starts_with("/api") || req.path == "/metrics" {
                api.serve_http(&mut w, &req)
            } else {
                streams.serve_http(&mut w, &req)
            };
            if let Err(e) = &served {
                debug!("http: {peer}: {e}");
            }

            let status = w.status.unwrap_or(500);
            let mut head = format!("HTTP/1.1 {status} OK\r\nConnection: Close\r\n");
            for (k, v) in w.header.iter() {
                head.push_str(&format!("{k}: {v}\r\n"));
            }
            head.push_str("\r\n");
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(&w.body).await;
            let _ = socket.shutdown().await;
            manager.dispose();
        });
    }
}

/// Parses the request line and a JSON body if present; headers are skipped.
fn parse_request(data: &[u8]) -> Option<HttpMessage> {
    let text = String::from_utf8_lossy(data);
    let mut lines = text.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;

    let mut msg = HttpMessage::with_method(method, target);
    if let Some((_, body)) = text.split_once("\r\n\r\n") {
        msg.body = body.as_bytes().to_vec();
    }
    Some(msg)
}

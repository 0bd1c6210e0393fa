/*!
 * Listener and client tasks for the stream services. Every socket is
 * driven by a cooperative task on the single-threaded runtime; the
 * registries in [`crate::services`] stay behind the shared lock.
 */
use std::sync::Arc;

use rx1090::decode::time::now_in_s;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc::{unbounded_channel, Sender};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cli::Endpoint;
use crate::raw::RawFramer;
use crate::sbs::SbsMessage;
use crate::services::{
    connect_with_timeout, ServiceKind, CONNECT_TIMEOUT,
};
use crate::{App, Input};

type Shared = Arc<Mutex<App>>;

/// Bind the four stream listeners. A port that cannot be bound is fatal
/// at startup, like the original's listen setup.
pub async fn start_listeners(
    app: Shared,
    tx: Sender<Input>,
    raw_in_udp: bool,
) -> std::io::Result<()> {
    let (ri, ro, si, so) = {
        let services = &app.lock().await.services;
        (
            services.raw_in.port,
            services.raw_out.port,
            services.sbs_in.port,
            services.sbs_out.port,
        )
    };

    if raw_in_udp {
        let socket = UdpSocket::bind(("0.0.0.0", ri)).await?;
        note_url(&app, ServiceKind::RawIn, "udp", ri).await;
        tokio::spawn(raw_in_udp_loop(socket, app.clone(), tx.clone()));
    } else {
        let listener = TcpListener::bind(("0.0.0.0", ri)).await?;
        note_url(&app, ServiceKind::RawIn, "tcp", ri).await;
        tokio::spawn(accept_loop(
            listener,
            ServiceKind::RawIn,
            app.clone(),
            tx.clone(),
        ));
    }

    for (kind, port) in [
        (ServiceKind::RawOut, ro),
        (ServiceKind::SbsIn, si),
        (ServiceKind::SbsOut, so),
    ] {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        note_url(&app, kind, "tcp", port).await;
        tokio::spawn(accept_loop(listener, kind, app.clone(), tx.clone()));
    }

    Ok(())
}

async fn note_url(app: &Shared, kind: ServiceKind, proto: &str, port: u16) {
    let url = format!("{proto}://0.0.0.0:{port}");
    info!("{kind} listening on {url}");
    app.lock().await.services.get_mut(kind).url = Some(url);
}

async fn accept_loop(
    listener: TcpListener,
    kind: ServiceKind,
    app: Shared,
    tx: Sender<Input>,
) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!("accept failed on {kind}: {e}");
                continue;
            }
        };

        let admit = app
            .lock()
            .await
            .services
            .client_admit(kind, addr, now_in_s());
        if !admit {
            // dropping the socket shuts it down before any byte is read
            continue;
        }

        match kind {
            ServiceKind::RawOut | ServiceKind::SbsOut => {
                spawn_out_client(socket, addr, kind, app.clone());
            }
            ServiceKind::RawIn => {
                tokio::spawn(raw_in_client(
                    socket,
                    addr,
                    true,
                    app.clone(),
                    tx.clone(),
                ));
            }
            ServiceKind::SbsIn => {
                tokio::spawn(sbs_in_client(
                    socket,
                    addr,
                    true,
                    app.clone(),
                    tx.clone(),
                ));
            }
            ServiceKind::Http => unreachable!("http is served by warp"),
        }
    }
}

/// A subscriber of one of the out services: its send queue is drained
/// into the socket, anything it sends is discarded, and either side
/// failing frees the record.
fn spawn_out_client(
    socket: TcpStream,
    addr: std::net::SocketAddr,
    kind: ServiceKind,
    app: Shared,
) {
    tokio::spawn(async move {
        let (sender, mut queue) = unbounded_channel::<Vec<u8>>();
        let id = app
            .lock()
            .await
            .services
            .add_client(kind, addr, true, Some(sender));

        let (mut rd, mut wr) = socket.into_split();
        let mut drain = [0u8; 512];
        let mut already_freed = false;
        loop {
            tokio::select! {
                payload = queue.recv() => match payload {
                    Some(bytes) => {
                        if wr.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // the record was already freed, the queue is gone
                        already_freed = true;
                        break;
                    }
                },
                n = rd.read(&mut drain) => match n {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {} // subscribers have nothing to tell us
                },
            }
        }

        if !already_freed {
            app.lock().await.services.free_client(kind, id);
        }
    });
}

/// Read `*hex;` framed messages from one raw-in connection and queue them
/// for the decoder. The frame handler runs once per record, on this very
/// connection.
async fn raw_in_client(
    mut socket: TcpStream,
    addr: std::net::SocketAddr,
    accepted: bool,
    app: Shared,
    tx: Sender<Input>,
) {
    let kind = ServiceKind::RawIn;
    let id = app
        .lock()
        .await
        .services
        .add_client(kind, addr, accepted, None);

    let mut framer = RawFramer::default();
    let mut buf = [0u8; 1024];
    let mut peer_error = None;

    'receive: loop {
        match socket.read(&mut buf).await {
            Ok(0) => break,
            Err(e) => {
                peer_error = Some(e.to_string());
                break;
            }
            Ok(n) => {
                app.lock().await.services.get_mut(kind).bytes_in +=
                    n as u64;
                for frame in framer.push(&buf[..n]) {
                    let input = Input::Frame {
                        bytes: frame,
                        timestamp: None,
                        system_timestamp: now_in_s(),
                        signal: None,
                    };
                    if tx.send(input).await.is_err() {
                        break 'receive;
                    }
                }
            }
        }
    }

    let mut app = app.lock().await;
    app.stats.good_raw += framer.good;
    app.stats.empty_raw += framer.empty;
    app.stats.unrecognized_raw += framer.unrecognized;
    app.services.free_client(kind, id);
    if !accepted {
        // losing an actively initiated connection takes the receiver down
        let err = peer_error.unwrap_or_else(|| "closed by peer".to_string());
        app.services
            .get_mut(kind)
            .store_error(format!("Connection to host {addr} lost; {err}"));
        app.request_exit();
    }
}

/// Raw input over UDP: each datagram stands alone
async fn raw_in_udp_loop(socket: UdpSocket, app: Shared, tx: Sender<Input>) {
    let kind = ServiceKind::RawIn;
    let mut buf = [0u8; 2048];
    loop {
        let Ok((n, _peer)) = socket.recv_from(&mut buf).await else {
            continue;
        };
        let mut framer = RawFramer::default();
        let frames = framer.push(&buf[..n]);
        {
            let mut app = app.lock().await;
            app.services.get_mut(kind).bytes_in += n as u64;
            app.stats.good_raw += framer.good;
            app.stats.empty_raw += framer.empty;
            app.stats.unrecognized_raw += framer.unrecognized;
        }
        for frame in frames {
            let input = Input::Frame {
                bytes: frame,
                timestamp: None,
                system_timestamp: now_in_s(),
                signal: None,
            };
            if tx.send(input).await.is_err() {
                return;
            }
        }
    }
}

/// Read CR/LF separated Basestation records from one sbs-in connection
async fn sbs_in_client(
    mut socket: TcpStream,
    addr: std::net::SocketAddr,
    accepted: bool,
    app: Shared,
    tx: Sender<Input>,
) {
    let kind = ServiceKind::SbsIn;
    let id = app
        .lock()
        .await
        .services
        .add_client(kind, addr, accepted, None);

    let mut acc: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];
    let mut peer_error = None;

    'receive: loop {
        match socket.read(&mut buf).await {
            Ok(0) => break,
            Err(e) => {
                peer_error = Some(e.to_string());
                break;
            }
            Ok(n) => {
                acc.extend_from_slice(&buf[..n]);
                {
                    let mut app = app.lock().await;
                    app.services.get_mut(kind).bytes_in += n as u64;
                }
                while let Some(eol) = acc.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = acc.drain(..=eol).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match line.parse::<SbsMessage>() {
                        Ok(msg) => {
                            app.lock().await.stats.good_sbs += 1;
                            if tx.send(Input::Sbs(msg)).await.is_err() {
                                break 'receive;
                            }
                        }
                        Err(_) => {
                            app.lock().await.stats.unrecognized_sbs += 1;
                        }
                    }
                }
            }
        }
    }

    let mut app = app.lock().await;
    app.services.free_client(kind, id);
    if !accepted {
        let err = peer_error.unwrap_or_else(|| "closed by peer".to_string());
        app.services
            .get_mut(kind)
            .store_error(format!("Connection to host {addr} lost; {err}"));
        app.request_exit();
    }
}

/// Start an active connection for raw-in or sbs-in, with the one-shot
/// connect timeout. Failure to establish the connection records the
/// error on the service and signals orderly shutdown.
pub fn start_active(
    kind: ServiceKind,
    endpoint: Endpoint,
    app: Shared,
    tx: Sender<Input>,
) {
    tokio::spawn(async move {
        let url = endpoint.to_string();
        app.lock().await.services.get_mut(kind).url =
            Some(format!("tcp://{url}"));

        let connect =
            TcpStream::connect((endpoint.host.clone(), endpoint.port));
        match connect_with_timeout(connect, CONNECT_TIMEOUT, kind, &url).await
        {
            Ok(socket) => {
                info!("Connected to host {url} (service \"{kind}\")");
                let addr = socket
                    .peer_addr()
                    .unwrap_or_else(|_| ([0, 0, 0, 0], 0).into());
                match kind {
                    ServiceKind::RawIn => {
                        raw_in_client(socket, addr, false, app, tx).await;
                    }
                    ServiceKind::SbsIn => {
                        sbs_in_client(socket, addr, false, app, tx).await;
                    }
                    _ => unreachable!("only the input services connect out"),
                }
            }
            Err(err) => {
                let mut app = app.lock().await;
                app.services.get_mut(kind).store_error(err);
                app.request_exit();
            }
        }
    });
}

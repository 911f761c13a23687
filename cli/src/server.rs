// HTTP + WebSocket binding for the relay
//
// Routes:
// - GET /                                   health text
// - GET /stats                              relay statistics as JSON
// - WS  /introduction/{peer}                control link for one peer
// - WS  /connection/{requester}/{target}/{topic}  rendezvous link

use futures::future::ready;
use futures::{SinkExt, StreamExt};
use peerlink_core::{decode_segment, Frame, Link, LinkError, RelayServer};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use warp::ws::{Message, WebSocket};
use warp::Filter;

#[derive(Debug, Serialize)]
struct StatsPayload {
    version: String,
    peers_connected: usize,
    pending_rendezvous: usize,
    pairs_formed: u64,
    abandoned: u64,
    introductions_sent: u64,
}

/// Adapt an upgraded warp socket into a [`Link`]
pub fn websocket_link(socket: WebSocket) -> Link {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(|e| LinkError::Transport(e.to_string()))
        .with(|frame: Frame| {
            ready(Ok::<Message, LinkError>(match frame {
                Frame::Text(text) => Message::text(text),
                Frame::Binary(data) => Message::binary(data),
            }))
        });
    let stream = stream
        .map(|message| message.map_err(|e| LinkError::Transport(e.to_string())))
        .take_while(|message| ready(!matches!(message, Ok(msg) if msg.is_close())))
        .filter_map(|message| {
            ready(match message {
                Ok(msg) if msg.is_text() => msg.to_str().ok().map(|text| Ok(Frame::text(text))),
                Ok(msg) if msg.is_binary() => Some(Ok(Frame::binary(msg.as_bytes().to_vec()))),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        });
    Link::from_parts(sink, stream)
}

/// Serve the relay on 0.0.0.0:port until the future is dropped
pub async fn serve(server: Arc<RelayServer>, port: u16) {
    let server_filter = warp::any().map(move || Arc::clone(&server));

    // 1. Health check at /
    let health_route = warp::path::end()
        .and(warp::get())
        .map(|| format!("peerlink relay {}\n", env!("CARGO_PKG_VERSION")))
        .boxed();

    // 2. Statistics
    let stats_route = warp::path!("stats")
        .and(warp::get())
        .and(server_filter.clone())
        .map(|server: Arc<RelayServer>| {
            let stats = server.get_stats();
            warp::reply::json(&StatsPayload {
                version: env!("CARGO_PKG_VERSION").to_string(),
                peers_connected: stats.peers_connected,
                pending_rendezvous: stats.pending_rendezvous,
                pairs_formed: stats.pairs_formed,
                abandoned: stats.abandoned,
                introductions_sent: stats.introductions_sent,
            })
        })
        .boxed();

    // 3. Introduction endpoint
    let introduction_route = warp::path!("introduction" / String)
        .and(warp::ws())
        .and(server_filter.clone())
        .map(|peer: String, ws: warp::ws::Ws, server: Arc<RelayServer>| {
            let peer = decode_segment(&peer);
            debug!("Introduction upgrade for {}", peer);
            ws.on_upgrade(move |socket| server.serve_introduction(peer, websocket_link(socket)))
        })
        .boxed();

    // 4. Connection endpoint
    let connection_route = warp::path!("connection" / String / String / String)
        .and(warp::ws())
        .and(server_filter)
        .map(
            |requester: String, target: String, topic: String, ws: warp::ws::Ws, server: Arc<RelayServer>| {
                let requester = decode_segment(&requester);
                let target = decode_segment(&target);
                let topic = decode_segment(&topic);
                ws.on_upgrade(move |socket| async move {
                    let outcome =
                        server.serve_connection(requester, target, topic, websocket_link(socket));
                    debug!("Connection request: {:?}", outcome);
                })
            },
        )
        .boxed();

    let routes = health_route
        .or(stats_route)
        .or(introduction_route)
        .or(connection_route)
        .boxed();

    warp::serve(routes).run(([0, 0, 0, 0], port)).await;
}

//! A server combining static files, an SSE room and a JSON endpoint.
//!
//! ```text
//! cargo run --example basic_server -- ./public
//! curl -N http://localhost:8080/events
//! curl -X POST http://localhost:8080/publish -d 'hello'
//! ```

use std::time::Duration;

use microserve::files::{file_handler, FileOptions};
use microserve::server::{
    first_handler, handler_fn, AccessControlConfig, Response, Server, ServerConfig, ServerHooks, StatusCode,
};
use microserve::sse::{SseEvent, SseOptions, SseRoom};
use microserve::Method;
use serde::Serialize;

#[derive(Serialize)]
struct Health {
    status: &'static str,
    subscribers: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let root = std::env::args().nth(1).unwrap_or_else(|| ".".to_string());

    let config = ServerConfig {
        ip: "127.0.0.1".to_string(),
        port: 0,
        port_hint: Some(8080),
        access_control: Some(AccessControlConfig {
            allowed_origins: vec!["*".to_string()],
            ..AccessControlConfig::default()
        }),
        send_server_timing: true,
        ..ServerConfig::default()
    };

    let room = SseRoom::new(SseOptions {
        keepalive: Some(Duration::from_secs(15)),
        retry: Some(Duration::from_secs(2)),
        ..SseOptions::default()
    });
    room.start();

    let api_room = room.clone();
    let api = handler_fn(move |request| {
        let room = api_room.clone();
        async move {
            let response = match (request.method, request.path()) {
                (Method::GET, "/events") => room.connect_request(&request),
                (Method::POST, "/publish") => {
                    let id = room.send_event(SseEvent::new(request.body_text()).with_type("message"));
                    Response::text(StatusCode::ACCEPTED, format!("event {id} sent"))
                }
                (Method::GET, "/health") => Response::new(StatusCode::OK).with_json(&Health {
                    status: "ok",
                    subscribers: room.connection_count(),
                })?,
                _ => return Ok(None),
            };
            Ok(Some(response))
        }
    });
    let handler = first_handler(vec![api, file_handler(root, FileOptions::default())]);

    let hooks = ServerHooks::new()
        .with_started_callback(|origin| println!("Serving on {origin}"))
        .with_stopped_callback(|reason| println!("Stopped: {reason}"));

    let server = Server::new(config, handler).with_hooks(hooks).start().await?;
    let reason = server.stopped().await;
    room.stop();
    log::info!("shutdown complete ({reason})");
    Ok(())
}

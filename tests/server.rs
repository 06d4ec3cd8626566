use std::net::SocketAddr;

use serde_json::json;
use sluice::{AppState, Ctx, Endpoint, HandlerError, Method, Router, Server, StatusMapping, health, schema};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

async fn send(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn get(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
}

#[tokio::test]
async fn serves_routes_and_shuts_down() {
    let get_user = Endpoint::builder("getUser")
        .path("id", schema::integer())
        .response(schema::object().field("id", schema::integer()).field("name", schema::string()))
        .handler(|ctx: Ctx| async move {
            let id = ctx.input().get("id").cloned().unwrap_or_default();
            Ok::<_, HandlerError>(json!({ "id": id, "name": "Ann" }))
        })
        .unwrap();
    let router = Router::new(AppState::new().error_handler(StatusMapping::new()))
        .route(Method::Get, "/users/{id}", get_user)
        .unwrap()
        .route(Method::Get, "/healthz", health::liveness().unwrap())
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(Server::bind("127.0.0.1:0").run(listener, router, async {
        let _ = stopped.await;
    }));

    let ok = send(addr, &get("/users/42")).await;
    assert!(ok.starts_with("HTTP/1.1 200"), "{ok}");
    assert!(ok.to_ascii_lowercase().contains("cache-control: no-store"));
    assert!(ok.ends_with(r#"{"id":42,"name":"Ann"}"#), "{ok}");

    let invalid = send(addr, &get("/users/abc")).await;
    assert!(invalid.starts_with("HTTP/1.1 400"), "{invalid}");

    let missing = send(addr, &get("/nowhere")).await;
    assert!(missing.starts_with("HTTP/1.1 404"), "{missing}");

    let wrong_method = send(addr, "DELETE /healthz HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n").await;
    assert!(wrong_method.starts_with("HTTP/1.1 405"), "{wrong_method}");

    let alive = send(addr, &get("/healthz")).await;
    assert!(alive.ends_with(r#""ok""#), "{alive}");

    stop.send(()).unwrap();
    server.await.unwrap().unwrap();
}

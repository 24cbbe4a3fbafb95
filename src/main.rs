use salvo::catcher::Catcher;
use salvo::prelude::*;
use salvo::server::ServerHandle;
use tokio::signal;
use tracing::info;

use ephaptic::config;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    config::init();
    let cfg = config::get();
    ephaptic::utils::init();

    let _guard = cfg.log.guard();
    tracing::info!("log level: {}", &cfg.log.filter_level);

    let app = ephaptic::App::build(ephaptic::demo::build_registry(), cfg)
        .await
        .expect("failed to build ephaptic runtime");
    app.install();

    let router = build_router(cfg.ws_path.as_str());
    let service = Service::new(router).hoop(ephaptic::utils::logger::Logger).catcher(Catcher::default());

    let listen_addr = format!("{}:{}", cfg.listen_addr, cfg.listen_port);
    println!("🚀 Ephaptic listening on ws://{listen_addr}{}", cfg.ws_path);
    let acceptor = TcpListener::new(listen_addr.clone()).bind().await;
    let server = Server::new(acceptor);
    tokio::spawn(shutdown_signal(server.handle()));
    server.serve(service).await;
}

fn build_router(ws_path: &str) -> Router {
    Router::new()
        .push(Router::with_path(ws_path).goal(ephaptic::ws::ws_upgrade))
        .push(Router::with_path("rpc/{name}").post(ephaptic::http::call_procedure))
}

async fn shutdown_signal(handle: ServerHandle) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl_c signal received"),
        _ = terminate => info!("terminate signal received"),
    }
    handle.stop_graceful(std::time::Duration::from_secs(30));
}

#[cfg(test)]
mod tests {
    use ephaptic::codec::{self, str_value};
    use ephaptic::transport::{ChannelTestPeer, ChannelTransport, Transport};
    use ephaptic::{App, Session};
    use rmpv::Value;
    use std::collections::HashMap;
    use std::sync::Arc;

    async fn test_app() -> Arc<App> {
        let cfg = ephaptic::config::ServerConfig::default();
        App::build(ephaptic::demo::build_registry(), &cfg).await.unwrap()
    }

    fn frame(pairs: Vec<(&str, Value)>) -> Value {
        Value::Map(pairs.into_iter().map(|(k, v)| (str_value(k), v)).collect())
    }

    #[tokio::test]
    async fn demo_registry_serves_the_echo_scenario() {
        let app = test_app().await;
        let (transport, peer) = ChannelTransport::pair();
        let transport: Arc<dyn Transport> = transport;
        let session = Session::new(transport, app.registry.clone(), app.connections.clone(), app.limiter.clone());
        let run = tokio::spawn(session.run());

        send(&peer, &frame(vec![("type", str_value("init")), ("auth", str_value("user123"))])).await;

        let mut kwargs = HashMap::new();
        kwargs.insert("message".to_string(), str_value("Hello, Ephaptic!"));
        send(
            &peer,
            &frame(vec![
                ("type", str_value("rpc")),
                ("id", Value::from(1)),
                ("name", str_value("echo")),
                ("kwargs", codec::kwargs_to_value(kwargs)),
            ]),
        )
        .await;

        let reply = recv(&peer).await;
        assert_eq!(reply.as_map().unwrap()[1].1.as_str(), Some("Hello, Ephaptic!"));

        drop(peer);
        let _ = run.await;
    }

    async fn send(peer: &ChannelTestPeer, value: &Value) {
        let bytes = codec::encode(value).unwrap();
        peer.to_transport.send(bytes).unwrap();
    }

    async fn recv(peer: &ChannelTestPeer) -> Value {
        let bytes = peer.from_transport.lock().await.recv().await.unwrap();
        codec::decode(&bytes).unwrap()
    }

    #[tokio::test]
    async fn broadcast_to_self_arrives_as_an_out_of_band_event() {
        let app = test_app().await;
        let (transport, peer) = ChannelTransport::pair();
        let transport: Arc<dyn Transport> = transport;
        let session = Session::new(transport, app.registry.clone(), app.connections.clone(), app.limiter.clone());
        let run = tokio::spawn(session.run());

        send(&peer, &frame(vec![("type", str_value("init")), ("auth", str_value("user123"))])).await;
        send(&peer, &frame(vec![("type", str_value("rpc")), ("id", Value::from(7)), ("name", str_value("greet_self"))])).await;

        let reply = recv(&peer).await;
        assert_eq!(reply.as_map().unwrap()[0].1, Value::from(7));

        let event = recv(&peer).await;
        let event = event.as_map().unwrap();
        assert_eq!(event.iter().find(|(k, _)| k.as_str() == Some("name")).unwrap().1.as_str(), Some("MyEvent"));

        drop(peer);
        let _ = run.await;
    }

    #[tokio::test]
    async fn http_adapter_serves_login_gated_and_rate_limited_procedures() {
        use salvo::prelude::*;
        use salvo::test::{ResponseExt, TestClient};

        let cfg = ephaptic::config::ServerConfig::default();
        let app = ephaptic::App::build(ephaptic::demo::build_registry(), &cfg).await.unwrap();
        app.install();

        let service = Service::new(super::build_router(&cfg.ws_path));

        let body: serde_json::Value = TestClient::post("http://127.0.0.1/rpc/echo")
            .json(&serde_json::json!({"kwargs": {"message": "hi"}}))
            .send(&service)
            .await
            .take_json()
            .await
            .unwrap();
        assert_eq!(body, serde_json::json!("hi"));

        let status = TestClient::post("http://127.0.0.1/rpc/greet_self")
            .json(&serde_json::json!({}))
            .send(&service)
            .await
            .status_code;
        assert_eq!(status, Some(StatusCode::UNAUTHORIZED));

        TestClient::post("http://127.0.0.1/rpc/spam_me")
            .json(&serde_json::json!({}))
            .send(&service)
            .await;
        let second = TestClient::post("http://127.0.0.1/rpc/spam_me")
            .json(&serde_json::json!({}))
            .send(&service)
            .await;
        assert_eq!(second.status_code, Some(StatusCode::TOO_MANY_REQUESTS));
    }
}

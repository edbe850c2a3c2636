use axum::Router;
use tokio::net::TcpListener;

/// Serves `router` on an ephemeral loopback port and returns its base URL.
pub async fn spawn_mock(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock listener");
    let address = listener.local_addr().expect("mock address");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("mock server");
    });
    format!("http://{address}")
}

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use server_api::ApiContext;
use shared::domain::Role;
use storage::Storage;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};

use crate::{
    auth::{mint_token, AuthConfig},
    registry::ChannelRegistry,
    AppState,
};

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_server() -> (SocketAddr, Arc<AppState>) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let state = Arc::new(AppState {
        api: ApiContext { storage },
        auth: AuthConfig {
            secret: "test-secret".into(),
            ttl_seconds: 60,
        },
        registry: ChannelRegistry::new(),
    });
    let app = crate::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, state)
}

async fn connect(addr: SocketAddr, slug: &str, token: Option<&str>) -> ClientSocket {
    let mut request = format!("ws://{addr}/ws/chat/{slug}")
        .into_client_request()
        .expect("request");
    if let Some(token) = token {
        request.headers_mut().insert(
            "authorization",
            format!("Bearer {token}").parse().expect("header"),
        );
    }
    let (socket, _) = connect_async(request).await.expect("connect");
    socket
}

/// Next text frame, or `None` once the server closes the socket.
async fn next_text(socket: &mut ClientSocket) -> Option<String> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")?;
        match frame {
            Ok(WsMessage::Text(text)) => return Some(text),
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn wait_for_subscribers(state: &AppState, slug: &str, want: usize) {
    for _ in 0..200 {
        if state.registry.subscriber_count(slug) == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("never reached {want} subscribers on {slug}");
}

#[tokio::test]
async fn socket_without_token_gets_one_error_frame_then_close() {
    let (addr, state) = spawn_server().await;
    let mut socket = connect(addr, "movie-fans", None).await;

    let text = next_text(&mut socket).await.expect("error frame");
    let frame: serde_json::Value = serde_json::from_str(&text).expect("json");
    assert_eq!(frame["error"], "provide an auth token");

    assert!(
        next_text(&mut socket).await.is_none(),
        "socket must close after the error frame"
    );
    assert_eq!(state.registry.subscriber_count("movie-fans"), 0);
}

#[tokio::test]
async fn socket_with_bad_token_is_rejected_and_never_registered() {
    let (addr, state) = spawn_server().await;
    let mut socket = connect(addr, "movie-fans", Some("not.a.jwt")).await;

    let text = next_text(&mut socket).await.expect("error frame");
    let frame: serde_json::Value = serde_json::from_str(&text).expect("json");
    assert_eq!(frame["error"], "invalid token");
    assert!(next_text(&mut socket).await.is_none());
    assert_eq!(state.registry.subscriber_count("movie-fans"), 0);
}

#[tokio::test]
async fn frame_from_member_fans_out_to_every_subscriber() {
    let (addr, state) = spawn_server().await;
    let user = state.api.storage.create_user("alice@x.com").await.expect("user");
    let group = state
        .api
        .storage
        .create_public_group(Some("fans"))
        .await
        .expect("group");
    state
        .api
        .storage
        .insert_membership(group.group_id, user, Role::Member)
        .await
        .expect("join");
    let token = mint_token(&state.auth, user, "alice@x.com").expect("token");

    let mut sender = connect(addr, &group.slug, Some(&token)).await;
    let mut listener = connect(addr, &group.slug, Some(&token)).await;
    wait_for_subscribers(&state, &group.slug, 2).await;

    sender
        .send(WsMessage::Text(r#"{"body": "hello"}"#.into()))
        .await
        .expect("send");

    // The sender's own connection receives the fan-out too.
    for socket in [&mut sender, &mut listener] {
        let text = next_text(socket).await.expect("fan-out frame");
        let frame: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(frame["message"]["body"], "hello");
        assert_eq!(frame["user"]["email"], "alice@x.com");
    }
}

#[tokio::test]
async fn non_member_frame_gets_error_frame_on_own_socket_only() {
    let (addr, state) = spawn_server().await;
    let group = state
        .api
        .storage
        .create_public_group(Some("fans"))
        .await
        .expect("group");
    let stranger = state
        .api
        .storage
        .create_user("mallory@x.com")
        .await
        .expect("user");
    let token = mint_token(&state.auth, stranger, "mallory@x.com").expect("token");

    // Subscribing is allowed for any authenticated user; appending is not.
    let mut socket = connect(addr, &group.slug, Some(&token)).await;
    wait_for_subscribers(&state, &group.slug, 1).await;

    socket
        .send(WsMessage::Text(r#"{"body": "let me in"}"#.into()))
        .await
        .expect("send");

    let text = next_text(&mut socket).await.expect("error frame");
    let frame: serde_json::Value = serde_json::from_str(&text).expect("json");
    assert_eq!(frame["error"], "user is not a member of this group");

    // The rejection does not tear the connection down.
    assert_eq!(state.registry.subscriber_count(&group.slug), 1);
}

#[tokio::test]
async fn disconnect_deregisters_the_connection() {
    let (addr, state) = spawn_server().await;
    let user = state.api.storage.create_user("alice@x.com").await.expect("user");
    let group = state
        .api
        .storage
        .create_public_group(Some("fans"))
        .await
        .expect("group");
    state
        .api
        .storage
        .insert_membership(group.group_id, user, Role::Member)
        .await
        .expect("join");
    let token = mint_token(&state.auth, user, "alice@x.com").expect("token");

    let mut socket = connect(addr, &group.slug, Some(&token)).await;
    wait_for_subscribers(&state, &group.slug, 1).await;

    socket.close(None).await.expect("close");
    wait_for_subscribers(&state, &group.slug, 0).await;
    assert_eq!(state.registry.publish(&group.slug, "nobody"), 0);
}

//! Connection state machine: handshake, authentication, redirects,
//! heartbeat liveness, and reconnection.

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use common::{connect_client, open_and_login, test_options};
use syncwire_client::{ClientError, ConnectionState, ErrorEvent};
use syncwire_core::{Action, Event, Topic};

fn collect_states(client: &syncwire_client::Client) -> Arc<Mutex<Vec<ConnectionState>>> {
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    client.on_connection_state(move |state| sink.lock().push(state));
    states
}

fn collect_errors(client: &syncwire_client::Client) -> Arc<Mutex<Vec<ErrorEvent>>> {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    client.on_error(move |event| sink.lock().push(event.clone()));
    errors
}

#[tokio::test(start_paused = true)]
async fn handshake_with_challenge_reaches_open() {
    let (client, provider) = connect_client("ws://host:6020", test_options());
    let states = collect_states(&client);

    let mut conn = provider.expect_connection().await;
    assert_eq!(conn.url, "ws://host:6020/sync");
    conn.open().await;

    conn.send_msg(Topic::Connection, Action::Challenge, &[]).await;
    let response = conn.expect_message().await;
    assert_eq!(response.topic, Topic::Connection);
    assert_eq!(response.action, Action::ChallengeResponse);
    assert_eq!(response.field(0), Some("ws://host:6020/sync"));

    conn.send_msg(Topic::Connection, Action::Ack, &[]).await;

    let login = client.login(json!({"username": "alice"}));
    let serve = async {
        let request = conn.expect_message().await;
        assert_eq!(request.topic, Topic::Auth);
        assert_eq!(request.action, Action::Request);
        let params: serde_json::Value =
            serde_json::from_str(request.field(0).expect("auth payload")).expect("valid json");
        assert_eq!(params, json!({"username": "alice"}));
        conn.send_msg(Topic::Auth, Action::Ack, &[]).await;
    };
    let (result, ()) = tokio::join!(login, serve);
    assert!(matches!(result, Ok(None)));

    assert_eq!(
        *states.lock(),
        vec![
            ConnectionState::AwaitingConnection,
            ConnectionState::Challenging,
            ConnectionState::AwaitingAuthentication,
            ConnectionState::Authenticating,
            ConnectionState::Open,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn auth_ack_payload_is_decoded() {
    let (client, provider) = connect_client("ws://host", test_options());

    let conn = provider.expect_connection().await;
    conn.open().await;
    conn.send_msg(Topic::Connection, Action::Ack, &[]).await;

    let login = client.login(json!({"token": "t"}));
    let serve = async {
        conn.send_msg(Topic::Auth, Action::Ack, &[r#"O{"id":"u-1"}"#])
            .await;
    };
    let (result, ()) = tokio::join!(login, serve);
    assert_eq!(result.expect("login succeeds"), Some(json!({"id": "u-1"})));
}

#[tokio::test(start_paused = true)]
async fn auth_rejection_allows_retry() {
    let (client, provider) = connect_client("ws://host", test_options());

    let mut conn = provider.expect_connection().await;
    conn.open().await;
    conn.send_msg(Topic::Connection, Action::Ack, &[]).await;

    let login = client.login(json!({"token": "bad"}));
    let serve = async {
        conn.expect_message().await;
        conn.send_msg(Topic::Auth, Action::Error, &["INVALID_AUTH_DATA", "Sdenied"])
            .await;
    };
    let (result, ()) = tokio::join!(login, serve);
    match result {
        Err(ClientError::AuthenticationFailed { reason, data }) => {
            assert_eq!(reason, "INVALID_AUTH_DATA");
            assert_eq!(data, Some(json!("denied")));
        }
        other => panic!("expected AuthenticationFailed, got {other:?}"),
    }
    assert_eq!(client.connection_state(), ConnectionState::AwaitingAuthentication);

    // The connection is still alive; a second attempt can succeed.
    let login = client.login(json!({"token": "good"}));
    let serve = async {
        conn.expect_message().await;
        conn.send_msg(Topic::Auth, Action::Ack, &[]).await;
    };
    let (result, ()) = tokio::join!(login, serve);
    assert!(matches!(result, Ok(None)));
    assert_eq!(client.connection_state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn too_many_auth_attempts_is_terminal() {
    let (client, provider) = connect_client("ws://host", test_options());

    let mut conn = provider.expect_connection().await;
    conn.open().await;
    conn.send_msg(Topic::Connection, Action::Ack, &[]).await;

    let login = client.login(json!({"token": "bad"}));
    let serve = async {
        conn.expect_message().await;
        conn.send_msg(
            Topic::Auth,
            Action::Error,
            &["TOO_MANY_AUTH_ATTEMPTS", "Stoo many"],
        )
        .await;
    };
    let (result, ()) = tokio::join!(login, serve);
    assert!(matches!(
        result,
        Err(ClientError::AuthenticationFailed { .. })
    ));

    conn.wait_client_close().await;
    wait_for_state(&client, ConnectionState::Closed).await;

    // The terminal flag latches: no further authentication is accepted.
    let result = client.login(json!({"token": "any"})).await;
    assert!(matches!(result, Err(ClientError::ConnectionClosed)));
}

#[tokio::test(start_paused = true)]
async fn challenge_rejection_closes_permanently() {
    let (client, provider) = connect_client("ws://host", test_options());

    let mut conn = provider.expect_connection().await;
    conn.open().await;
    conn.send_msg(Topic::Connection, Action::Rejection, &[]).await;

    conn.wait_client_close().await;
    wait_for_state(&client, ConnectionState::Closed).await;

    let result = client.login(json!({"token": "t"})).await;
    assert!(matches!(result, Err(ClientError::ConnectionClosed)));
}

#[tokio::test(start_paused = true)]
async fn redirect_moves_then_reconnect_restores_original_url() {
    let (_client, provider) = connect_client("ws://host", test_options());

    let mut conn = provider.expect_connection().await;
    assert_eq!(conn.url, "ws://host/sync");
    conn.open().await;
    conn.send_msg(Topic::Connection, Action::Redirect, &["ws://other/sync"])
        .await;
    conn.wait_client_close().await;

    // The client follows the redirect with a fresh endpoint.
    let redirected = provider.expect_connection().await;
    assert_eq!(redirected.url, "ws://other/sync");
    redirected.open().await;

    // Losing the redirected endpoint reconnects to the original URL.
    redirected.close().await;
    let reconnected = provider.expect_connection().await;
    assert_eq!(reconnected.url, "ws://host/sync");
}

#[tokio::test(start_paused = true)]
async fn transport_error_defers_report_and_reconnects() {
    let (client, provider) = connect_client("ws://host", test_options());
    let errors = collect_errors(&client);
    let states = collect_states(&client);

    let conn = provider.expect_connection().await;
    conn.open().await;
    conn.fail("wire snapped").await;

    // The reconnect path takes over and a new attempt is made.
    let retry = provider.expect_connection().await;
    retry.open().await;

    let seen = errors.lock();
    assert!(
        seen.iter().any(|event| {
            event.topic == Topic::Connection
                && event.event == Event::ConnectionError.as_str()
                && event.message.contains("wire snapped")
        }),
        "expected a deferred connection error, got {seen:?}"
    );
    assert!(states.lock().contains(&ConnectionState::Error));
    assert!(states.lock().contains(&ConnectionState::Reconnecting));
}

#[tokio::test(start_paused = true)]
async fn first_reconnect_waits_one_backoff_step() {
    // test_options: reconnect_interval_increment = 100ms.
    let (_client, provider) = connect_client("ws://host", test_options());

    let conn = provider.expect_connection().await;
    conn.open().await;
    conn.fail("wire snapped").await;

    // No instant retry: the first attempt waits a full increment.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(provider.connect_count(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(provider.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_gives_up_after_max_attempts() {
    let (client, provider) = connect_client("ws://host", test_options());
    let errors = collect_errors(&client);
    provider.fail_next_connects(usize::MAX);

    wait_for_state(&client, ConnectionState::Closed).await;

    // One initial attempt plus max_reconnect_attempts retries.
    assert_eq!(provider.connect_count(), 6);
    assert!(errors
        .lock()
        .iter()
        .any(|event| event.event == Event::MaxReconnectionAttemptsReached.as_str()));
}

#[tokio::test(start_paused = true)]
async fn heartbeat_timeout_forces_reconnect_and_resubscription() {
    let (client, provider) = connect_client("ws://host", test_options());
    let states = collect_states(&client);
    let errors = collect_errors(&client);

    let mut conn = open_and_login(&client, &provider).await;

    // Bring a record to ready so resubscription is observable.
    let record = client.records().get_record("sensor/1").expect("record");
    let read = conn.expect_message().await;
    assert_eq!((read.topic, read.action), (Topic::Record, Action::Read));
    conn.send_msg(Topic::Record, Action::Update, &["sensor/1", "1-a", "{}"])
        .await;
    record.when_ready().await.expect("ready");

    // Server goes silent: PINGs at each interval, then the endpoint is
    // closed once the tolerance is exceeded.
    let ping = conn.next_message().await;
    assert_eq!((ping.topic, ping.action), (Topic::Connection, Action::Ping));
    conn.wait_client_close().await;
    assert!(errors
        .lock()
        .iter()
        .any(|event| event.event == Event::HeartbeatTimeout.as_str()));

    // Reconnect: handshake again, stored credentials re-submitted, and the
    // live record re-reads.
    let mut retry = provider.expect_connection().await;
    assert_eq!(retry.url, "ws://host/sync");
    retry.open().await;
    retry.send_msg(Topic::Connection, Action::Ack, &[]).await;

    let auth = retry.expect_message().await;
    assert_eq!((auth.topic, auth.action), (Topic::Auth, Action::Request));
    retry.send_msg(Topic::Auth, Action::Ack, &[]).await;

    let reread = retry.expect_message().await;
    assert_eq!((reread.topic, reread.action), (Topic::Record, Action::Read));
    assert_eq!(reread.field(0), Some("sensor/1"));

    assert!(states.lock().contains(&ConnectionState::Reconnecting));
    assert!(!record.is_destroyed());
}

#[tokio::test(start_paused = true)]
async fn deliberate_close_reaches_closed_without_reconnect() {
    let (client, provider) = connect_client("ws://host", test_options());
    let mut conn = open_and_login(&client, &provider).await;

    client.close();
    conn.wait_client_close().await;
    wait_for_state(&client, ConnectionState::Closed).await;

    // No reconnection attempt follows a deliberate close.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(provider.connect_count(), 1);
}

async fn wait_for_state(client: &syncwire_client::Client, expected: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(600), async {
        while client.connection_state() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "timed out waiting for {expected}, still {}",
            client.connection_state()
        )
    });
}

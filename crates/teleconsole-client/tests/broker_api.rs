//! Integration tests for the broker control protocol, driven against an
//! in-process mock of the broker's HTTP surface.

use url::Url;

use teleconsole_client::{ApiClient, Config};
use teleconsole_core::constants::WEB_SESSION_ID_LEN;
use teleconsole_core::forward::ForwardedPort;
use teleconsole_core::geo::endpoint_for_session;
use teleconsole_core::identity::UserMap;
use teleconsole_core::session::{CertAuthority, SessionSecrets, SessionStats, Party};
use teleconsole_core::Error;
use teleconsole_test_utils::MockBroker;

fn config_for(broker: &MockBroker) -> Config {
    let mut config = Config::load().expect("default config");
    // The mock speaks plain HTTP on an ephemeral port.
    config.api_endpoint_url =
        Url::parse(&format!("http://{}", broker.host_port())).expect("mock url");
    config
}

fn test_secrets() -> SessionSecrets {
    SessionSecrets {
        site_name: "teleconsole-client".into(),
        listen_addr: "localhost:3024".into(),
        cas: vec![CertAuthority {
            domain: "teleconsole-client".into(),
            public_key: "ssh-ed25519 AAAA host-ca".into(),
        }],
        users: UserMap::new(),
    }
}

#[tokio::test]
async fn version_handshake_carries_client_version() {
    let broker = MockBroker::start().await;
    let mut api = ApiClient::new(&config_for(&broker), "9.9.9").unwrap();

    let version = api.check_version().await.unwrap();
    assert_eq!(version.server_version, "mock");
    assert!(version.warning.is_empty());

    let state = broker.state.lock().unwrap();
    assert_eq!(state.last_client_version.as_deref(), Some("9.9.9"));
}

#[tokio::test]
async fn version_redirects_are_followed_at_most_twice() {
    // One redirect hop lands back on the same mock and succeeds.
    let broker = MockBroker::start().await;
    let self_url = format!("http://{}", broker.host_port());
    broker.state.lock().unwrap().redirects = vec![self_url.clone()];
    let mut api = ApiClient::new(&config_for(&broker), "1.0.0").unwrap();
    api.check_version().await.unwrap();
    assert_eq!(api.endpoint().as_str(), format!("{self_url}/"));

    // Two hops still succeed.
    broker.state.lock().unwrap().redirects = vec![self_url.clone(), self_url.clone()];
    let mut api = ApiClient::new(&config_for(&broker), "1.0.0").unwrap();
    api.check_version().await.unwrap();

    // A third redirect is refused.
    broker.state.lock().unwrap().redirects =
        vec![self_url.clone(), self_url.clone(), self_url.clone()];
    let mut api = ApiClient::new(&config_for(&broker), "1.0.0").unwrap();
    let err = api.check_version().await.unwrap_err();
    assert!(
        matches!(err, Error::BrokerProtocol { status: 307, .. }),
        "{err:?}"
    );
}

#[tokio::test]
async fn new_session_gets_a_40_hex_id_and_the_proxy_address() {
    let broker = MockBroker::start().await;
    broker.state.lock().unwrap().proxy_host_port = "proxy.example:3023".into();
    let mut api = ApiClient::new(&config_for(&broker), "1.0.0").unwrap();

    let session = api
        .request_new_session(
            "alice",
            test_secrets(),
            "localhost:3022",
            Some(ForwardedPort {
                src_ip: String::new(),
                src_port: 0,
                dest_host: "localhost".into(),
                dest_port: 5000,
            }),
        )
        .await
        .unwrap();

    assert_eq!(session.id.len(), WEB_SESSION_ID_LEN);
    assert!(session.id.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(session.id, api.session_id());
    assert_eq!(session.proxy_host_port, "proxy.example:3023");
    assert_eq!(session.login, "alice");
    assert_eq!(session.forwarded_port.unwrap().dest_port, 5000);

    // An unprefixed visible id routes to the default endpoint and strips
    // to the same web sid.
    let (_, stripped) = endpoint_for_session(&session.id);
    assert_eq!(stripped, session.id);
}

#[tokio::test]
async fn publish_is_idempotent_for_observers() {
    let broker = MockBroker::start().await;
    let mut api = ApiClient::new(&config_for(&broker), "1.0.0").unwrap();
    let session = api
        .request_new_session("alice", test_secrets(), "localhost:3022", None)
        .await
        .unwrap();
    assert!(session.tsid.is_empty());

    let tsid = "11111111-2222-3333-4444-555555555555";
    api.publish_session_id(tsid).await.unwrap();
    // A network retry double-fires; observers must see the same state.
    api.publish_session_id(tsid).await.unwrap();

    let fetched = api.get_session_details(&session.id).await.unwrap();
    assert_eq!(fetched.tsid, tsid);
    assert_eq!(broker.state.lock().unwrap().publishes[&session.id], 2);
}

#[tokio::test]
async fn unknown_session_is_session_not_found() {
    let broker = MockBroker::start().await;
    let api = ApiClient::new(&config_for(&broker), "1.0.0").unwrap();
    let err = api.get_session_details("doesnotexist").await.unwrap_err();
    match err {
        Error::SessionNotFound(sid) => assert_eq!(sid, "doesnotexist"),
        other => panic!("expected SessionNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn stats_report_connected_parties() {
    let broker = MockBroker::start().await;
    let mut api = ApiClient::new(&config_for(&broker), "1.0.0").unwrap();
    let session = api
        .request_new_session("alice", test_secrets(), "localhost:3022", None)
        .await
        .unwrap();

    let stats = api.get_session_stats(&session.id).await.unwrap();
    assert!(stats.parties.is_empty());

    broker.state.lock().unwrap().stats = SessionStats {
        parties: vec![Party {
            remote_addr: "203.0.113.9:41234".into(),
            last_active: "2016-09-01T00:00:00Z".into(),
        }],
        term_width: 80,
        term_height: 24,
    };
    let stats = api.get_session_stats(&session.id).await.unwrap();
    assert_eq!(stats.parties.len(), 1);
    assert_eq!(stats.parties[0].remote_addr, "203.0.113.9:41234");
}

#[tokio::test]
async fn broker_errors_surface_json_message() {
    let broker = MockBroker::start().await;
    let api = ApiClient::new(&config_for(&broker), "1.0.0").unwrap();
    let err = api.get_session_stats("missing").await.unwrap_err();
    match err {
        Error::BrokerProtocol { status, message } => {
            assert_eq!(status, 404);
            assert!(message.contains("missing"), "raw body leaked: {message}");
        }
        other => panic!("expected BrokerProtocol, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_broker_is_a_transport_error() {
    let mut config = Config::load().expect("default config");
    // Nothing listens here.
    config.api_endpoint_url = Url::parse("http://127.0.0.1:9/").unwrap();
    let mut api = ApiClient::new(&config, "1.0.0").unwrap();
    let err = api.check_version().await.unwrap_err();
    assert!(matches!(err, Error::BrokerTransport { .. }), "{err:?}");
}

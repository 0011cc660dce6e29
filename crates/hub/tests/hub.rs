#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use kedge_bus::MessageBus;
use kedge_core::prelude::*;
use kedge_hub::{load_server_config, Hub, HubConfig, HubError, HubEvent, HubEventKind, TlsFiles};
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<tokio_rustls::client::TlsStream<TcpStream>>;

static INIT: Once = Once::new();

fn init_crypto_provider() {
    INIT.call_once(|| {
        rustls::crypto::ring::default_provider().install_default().expect("install crypto provider");
    });
}

fn make_ca() -> rcgen::Certificate {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        rcgen::KeyUsagePurpose::KeyCertSign,
        rcgen::KeyUsagePurpose::DigitalSignature,
        rcgen::KeyUsagePurpose::KeyEncipherment,
    ];
    rcgen::Certificate::from_params(params).expect("ca params")
}

fn make_leaf(san: SanType) -> rcgen::Certificate {
    let mut params = CertificateParams::default();
    params.subject_alt_names = vec![san];
    params.key_usages = vec![rcgen::KeyUsagePurpose::DigitalSignature, rcgen::KeyUsagePurpose::KeyEncipherment];
    params.key_pair = Some(KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256).expect("keypair"));
    rcgen::Certificate::from_params(params).expect("leaf params")
}

fn signed(ca: &rcgen::Certificate, leaf: &rcgen::Certificate) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let der = leaf.serialize_der_with_signer(ca).expect("sign leaf");
    let key = PrivateKeyDer::try_from(leaf.serialize_private_key_der()).expect("leaf key");
    (CertificateDer::from(der), key)
}

struct Pki {
    ca: rcgen::Certificate,
    ca_der: CertificateDer<'static>,
}

impl Pki {
    fn new() -> Self {
        let ca = make_ca();
        let ca_der = CertificateDer::from(ca.serialize_der().expect("ca der"));
        Self { ca, ca_der }
    }

    fn client(&self, san: SanType) -> Arc<ClientConfig> {
        let (cert, key) = signed(&self.ca, &make_leaf(san));
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_der.clone()).expect("add ca");
        let cfg = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(vec![cert], key)
            .expect("client auth cert");
        Arc::new(cfg)
    }

    fn node(&self, node_id: &str) -> Arc<ClientConfig> {
        self.client(SanType::DnsName(node_id.to_string()))
    }
}

struct Fixture {
    pki: Pki,
    hub: Arc<Hub>,
    bus: MessageBus,
    addr: SocketAddr,
    cancel: CancellationToken,
    events: broadcast::Receiver<HubEvent>,
}

impl Fixture {
    async fn start(config: HubConfig) -> Self {
        init_crypto_provider();
        let pki = Pki::new();
        let (cert, key) = signed(&pki.ca, &make_leaf(SanType::DnsName("localhost".into())));
        let tls = kedge_hub::tls::server_config(&[pki.ca_der.clone()], vec![cert], key).expect("server tls");

        let bus = MessageBus::new(16);
        for module in [MODULE_CLOUDHUB, MODULE_EDGE_CONTROLLER, MODULE_DEVICE_CONTROLLER] {
            bus.register(module).unwrap();
        }
        let hub = Arc::new(Hub::new(config, tls, bus.clone()));
        let events = hub.subscribe();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let serving = Arc::clone(&hub);
        let c = cancel.clone();
        tokio::spawn(async move { serving.serve(listener, c).await });
        let dispatching = Arc::clone(&hub);
        let c = cancel.clone();
        tokio::spawn(async move { dispatching.dispatch(c).await });

        Self { pki, hub, bus, addr, cancel, events }
    }

    async fn connect(&self, path: &str, tls: Arc<ClientConfig>) -> Result<Client, tungstenite::Error> {
        let tcp = TcpStream::connect(self.addr).await?;
        let name = ServerName::try_from("localhost".to_owned()).expect("server name");
        let stream = TlsConnector::from(tls).connect(name, tcp).await?;
        let (ws, _) = tokio_tungstenite::client_async(format!("wss://localhost{path}"), stream).await?;
        Ok(ws)
    }

    async fn connect_node(&mut self, node_id: &str) -> Client {
        let ws = self.connect(&format!("/proj/{node_id}/events"), self.pki.node(node_id)).await.expect("upgrade");
        self.expect_event(HubEventKind::Connected, node_id).await;
        ws
    }

    async fn next_event(&mut self) -> HubEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("hub event in time")
            .expect("hub event channel open")
    }

    async fn expect_event(&mut self, kind: HubEventKind, node_id: &str) -> HubEvent {
        let ev = self.next_event().await;
        assert_eq!((ev.kind, ev.node_id.as_str()), (kind, node_id), "unexpected event {ev:?}");
        ev
    }
}

fn status_of(err: tungstenite::Error) -> u16 {
    match err {
        tungstenite::Error::Http(resp) => resp.status().as_u16(),
        other => panic!("expected an HTTP refusal, got {other}"),
    }
}

async fn next_message(ws: &mut Client) -> Message {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("frame");
        if let WsMessage::Text(text) = frame {
            return Message::from_json(text.as_str()).expect("decodable frame");
        }
    }
}

fn frame(msg: &Message) -> WsMessage {
    WsMessage::text(msg.to_json().unwrap())
}

fn quick(limit: usize) -> HubConfig {
    HubConfig { node_limit: limit, keepalive_interval: Duration::from_secs(30), ..Default::default() }
}

#[tokio::test]
async fn node_limit_refuses_the_third_node_until_a_slot_frees() {
    let mut fx = Fixture::start(quick(2)).await;
    let mut first = fx.connect_node("edge-1").await;
    let _second = fx.connect_node("edge-2").await;

    let refused = fx.connect("/proj/edge-3/events", fx.pki.node("edge-3")).await.err().expect("third node refused");
    assert_eq!(status_of(refused), 429);
    assert!(!fx.hub.registry().is_connected("edge-3"));

    first.close(None).await.unwrap();
    let ev = fx.expect_event(HubEventKind::Disconnected, "edge-1").await;
    assert_eq!(ev.reason, Some("peer_closed"));

    let _third = fx.connect_node("edge-3").await;
    assert_eq!(fx.hub.registry().nodes(), vec!["edge-2".to_string(), "edge-3".to_string()]);
    assert_eq!(fx.hub.available_slots(), 0);
    fx.cancel.cancel();
}

#[tokio::test]
async fn certificate_must_name_the_node() {
    let mut fx = Fixture::start(quick(4)).await;
    let refused = fx.connect("/proj/edge-2/events", fx.pki.node("edge-1")).await.err().expect("mismatch refused");
    assert_eq!(status_of(refused), 403);
    assert_eq!(fx.hub.available_slots(), 4);

    let uri = fx.pki.client(SanType::URI("spiffe://kedge/node/edge-7".into()));
    let _ws = fx.connect("/proj/edge-7/events", uri).await.expect("uri san accepted");
    fx.expect_event(HubEventKind::Connected, "edge-7").await;
    fx.cancel.cancel();
}

#[tokio::test]
async fn missing_path_segment_is_a_bad_request() {
    let fx = Fixture::start(quick(4)).await;
    let refused = fx.connect("/proj/events", fx.pki.node("proj")).await.err().expect("short path refused");
    assert_eq!(status_of(refused), 400);
    fx.cancel.cancel();
}

#[tokio::test]
async fn untrusted_client_certificate_never_reaches_http() {
    let fx = Fixture::start(quick(4)).await;
    let stranger = Pki::new();
    let res = fx.connect("/proj/edge-1/events", stranger.node("edge-1")).await;
    assert!(res.is_err());
    assert_eq!(fx.hub.available_slots(), 4);
    fx.cancel.cancel();
}

#[tokio::test]
async fn inbound_frames_are_prefixed_and_routed() {
    let mut fx = Fixture::start(quick(4)).await;
    let mut ws = fx.connect_node("edge-1").await;

    let beacon = Message::new().build_router("edgehub", GROUP_RESOURCE, "", Operation::Keepalive);
    let status = Message::new()
        .build_router("edged", GROUP_RESOURCE, "default/podstatus/web", Operation::Update)
        .fill_body(json!([]));
    let twin = Message::new()
        .build_router("twin", GROUP_TWIN, "device/d1/twin/edge_updated", Operation::Update)
        .fill_body(json!({"twin": {}}));
    ws.send(frame(&beacon)).await.unwrap();
    ws.send(WsMessage::text("not json")).await.unwrap();
    ws.send(frame(&status)).await.unwrap();
    ws.send(frame(&twin)).await.unwrap();

    let wait = Duration::from_secs(5);
    let got = tokio::time::timeout(wait, fx.bus.receive(MODULE_EDGE_CONTROLLER)).await.unwrap().unwrap();
    assert_eq!(got.id(), status.id());
    assert_eq!(got.resource(), "node/edge-1/default/podstatus/web");
    let got = tokio::time::timeout(wait, fx.bus.receive(MODULE_DEVICE_CONTROLLER)).await.unwrap().unwrap();
    assert_eq!(got.resource(), "node/edge-1/device/d1/twin/edge_updated");
    assert_eq!(fx.bus.depth(MODULE_EDGE_CONTROLLER), Some(0));
    assert!(fx.hub.registry().is_connected("edge-1"));
    fx.cancel.cancel();
}

#[tokio::test]
async fn outbound_messages_reach_their_node_without_the_prefix() {
    let mut fx = Fixture::start(quick(4)).await;
    let mut one = fx.connect_node("edge-1").await;
    let mut two = fx.connect_node("edge-2").await;

    let for_two = Message::new()
        .build_router(MODULE_EDGE_CONTROLLER, GROUP_RESOURCE, "node/edge-2/default/configmap/cm", Operation::Update)
        .fill_body(json!({"data": {"k": "v"}}));
    let for_one = Message::new().build_router(MODULE_EDGE_CONTROLLER, GROUP_RESOURCE, "node/edge-1/default/secret/s", Operation::Delete);
    fx.bus.send(MODULE_CLOUDHUB, for_two.clone()).await.unwrap();
    fx.bus.send(MODULE_CLOUDHUB, for_one.clone()).await.unwrap();

    let got = next_message(&mut two).await;
    assert_eq!(got.id(), for_two.id());
    assert_eq!(got.resource(), "default/configmap/cm");
    assert_eq!(got.content, for_two.content);
    let got = next_message(&mut one).await;
    assert_eq!(got.id(), for_one.id());
    assert_eq!(got.resource(), "default/secret/s");
    fx.cancel.cancel();
}

#[tokio::test]
async fn silent_node_is_dropped_after_two_intervals() {
    let mut fx = Fixture::start(HubConfig { keepalive_interval: Duration::from_millis(100), ..quick(4) }).await;
    let _ws = fx.connect_node("edge-1").await;
    let ev = fx.expect_event(HubEventKind::Disconnected, "edge-1").await;
    assert_eq!(ev.reason, Some("keepalive_timeout"));
    assert!(!fx.hub.registry().is_connected("edge-1"));
    assert_eq!(fx.hub.available_slots(), 4);
    fx.cancel.cancel();
}

#[tokio::test]
async fn beaconing_node_stays_connected() {
    let mut fx = Fixture::start(HubConfig { keepalive_interval: Duration::from_millis(100), ..quick(4) }).await;
    let mut ws = fx.connect_node("edge-1").await;
    for _ in 0..12 {
        let beacon = Message::new().build_router("edgehub", GROUP_RESOURCE, "", Operation::Keepalive);
        ws.send(frame(&beacon)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(matches!(fx.events.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    assert!(fx.hub.registry().is_connected("edge-1"));
    fx.cancel.cancel();
}

#[tokio::test]
async fn reconnect_supersedes_the_older_session() {
    let mut fx = Fixture::start(quick(4)).await;
    let _old = fx.connect_node("edge-1").await;
    let mut new = fx.connect_node("edge-1").await;
    let ev = fx.expect_event(HubEventKind::Disconnected, "edge-1").await;
    assert_eq!(ev.reason, Some("superseded"));
    assert!(fx.hub.registry().is_connected("edge-1"));
    assert_eq!(fx.hub.available_slots(), 3);

    let msg = Message::new().build_router(MODULE_EDGE_CONTROLLER, GROUP_RESOURCE, "node/edge-1/default/pod/web", Operation::Update);
    fx.bus.send(MODULE_CLOUDHUB, msg.clone()).await.unwrap();
    assert_eq!(next_message(&mut new).await.id(), msg.id());
    fx.cancel.cancel();
}

#[tokio::test]
async fn shutdown_closes_every_session() {
    let mut fx = Fixture::start(quick(4)).await;
    let _a = fx.connect_node("edge-1").await;
    fx.cancel.cancel();
    let ev = fx.expect_event(HubEventKind::Disconnected, "edge-1").await;
    assert_eq!(ev.reason, Some("shutdown"));
    assert!(fx.hub.registry().is_empty());
}

#[test]
fn tls_material_loads_from_pem_files() {
    init_crypto_provider();
    let ca = make_ca();
    let server = make_leaf(SanType::DnsName("localhost".into()));
    let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
    let dir = std::env::temp_dir().join(format!("kedge-hub-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("ca.pem"), ca.serialize_pem().unwrap()).unwrap();
    std::fs::write(dir.join("cert.pem"), server.serialize_pem_with_signer(&ca).unwrap()).unwrap();
    std::fs::write(dir.join("key.pem"), server.serialize_private_key_pem()).unwrap();

    let files = TlsFiles { ca: dir.join("ca.pem"), cert: dir.join("cert.pem"), key: dir.join("key.pem") };
    load_server_config(&files).unwrap();

    let missing = TlsFiles { ca: dir.join("absent.pem"), ..files.clone() };
    assert!(matches!(load_server_config(&missing), Err(HubError::Read { .. })));
    let no_key = TlsFiles { key: dir.join("cert.pem"), ..files.clone() };
    assert!(matches!(load_server_config(&no_key), Err(HubError::NoPrivateKey(_))));
    let no_cert = TlsFiles { cert: dir.join("key.pem"), ..files };
    assert!(matches!(load_server_config(&no_cert), Err(HubError::NoCertificate(_))));

    std::fs::remove_dir_all(&dir).unwrap();
}

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use hrbridge::fake::{FakeDevice, FakeGateway};
use hrbridge::hub::Hub;
use hrbridge::server::SubscriberServer;
use hrbridge::session::{SessionConfig, SessionController, SessionState};
use hrbridge::signal::{StatusBus, StatusEvent};
use hrbridge::telemetry::TelemetryReading;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PATIENCE: Duration = Duration::from_secs(5);


struct Running {
    hub: Arc<Hub>,
    bus: StatusBus,
    url: String,
    shutdown: CancellationToken,
}

async fn serve() -> Running {
    let bus = StatusBus::new();
    let hub = Arc::new(Hub::new(bus.clone()));
    let server = SubscriberServer::bind("127.0.0.1:0", Arc::clone(&hub), bus.clone(), Duration::from_secs(1))
        .await
        .unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));

    Running { hub, bus, url, shutdown }
}

async fn connect(url: &str) -> Client {
    let (client, _) = connect_async(url).await.unwrap();
    client
}

async fn wait_for_subscribers(hub: &Hub, count: usize) {
    tokio::time::timeout(PATIENCE, async {
        while hub.subscriber_count().await != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriber count never settled");
}

async fn next_text(client: &mut Client) -> String {
    loop {
        let message = tokio::time::timeout(PATIENCE, client.next())
            .await
            .expect("no message in time")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = message {
            return text.as_str().to_string();
        }
    }
}

async fn wait_for_event(rx: &mut broadcast::Receiver<StatusEvent>, wanted: impl Fn(&StatusEvent) -> bool) -> StatusEvent {
    tokio::time::timeout(PATIENCE, async {
        loop {
            let event = rx.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event never arrived")
}


#[tokio::test]
async fn every_client_receives_the_heart_rate() {
    let running = serve().await;
    let mut first = connect(&running.url).await;
    let mut second = connect(&running.url).await;
    wait_for_subscribers(&running.hub, 2).await;

    let report = running.hub.broadcast(&TelemetryReading::heart_rate(72)).await;

    assert_eq!(report.delivered, 2);
    assert_eq!(next_text(&mut first).await, "72");
    assert_eq!(next_text(&mut second).await, "72");
    running.shutdown.cancel();
}

#[tokio::test]
async fn closing_a_client_removes_it() {
    let running = serve().await;
    let mut events = running.bus.subscribe();
    let mut client = connect(&running.url).await;
    wait_for_subscribers(&running.hub, 1).await;

    client.close(None).await.unwrap();

    wait_for_event(&mut events, |event| matches!(event, StatusEvent::SubscriberLeft { count: 0 })).await;
    assert_eq!(running.hub.subscriber_count().await, 0);
    running.shutdown.cancel();
}

#[tokio::test]
async fn client_messages_are_logged_not_answered() {
    let running = serve().await;
    let mut events = running.bus.subscribe();
    let mut client = connect(&running.url).await;
    wait_for_subscribers(&running.hub, 1).await;

    client.send(Message::text("hello from unity".to_string())).await.unwrap();

    let event = wait_for_event(&mut events, |event| matches!(event, StatusEvent::SubscriberMessage { .. })).await;
    let StatusEvent::SubscriberMessage { text, .. } = event else { unreachable!() };
    assert_eq!(text, "hello from unity");
    assert_eq!(running.hub.subscriber_count().await, 1);
    running.shutdown.cancel();
}

#[tokio::test]
async fn strap_to_websocket_end_to_end() {
    let running = serve().await;
    let gateway = FakeGateway::new(vec![
        FakeDevice::new("Other", "CC:DD"),
        FakeDevice::new("Polar H10", "AA:BB"),
    ]);
    let config = SessionConfig {
        name_filter: "Polar".into(),
        scan_timeout: Duration::from_secs(1),
        battery_poll: Duration::from_secs(5),
        forward_battery: false,
    };
    let controller = SessionController::new(gateway, Arc::clone(&running.hub), running.bus.clone(), config);

    let mut client = connect(&running.url).await;
    wait_for_subscribers(&running.hub, 1).await;

    controller.start().await.unwrap();
    let mut state = controller.watch_state();
    tokio::time::timeout(PATIENCE, state.wait_for(|state| *state == SessionState::Streaming))
        .await
        .unwrap()
        .unwrap();

    let connection = controller.gateway().last_connection().unwrap();
    for bpm in [71, 72, 73] {
        connection.push(&[0x00, bpm]);
    }
    for bpm in ["71", "72", "73"] {
        assert_eq!(next_text(&mut client).await, bpm);
    }

    controller.stop().await;
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(connection.is_closed());
    running.shutdown.cancel();
}

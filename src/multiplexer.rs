use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::gateway::{Connection, GatewayError, NotificationHandler};
use crate::telemetry::{decode_battery, decode_heart_rate, DecodeError, TelemetryReading};
use crate::telemetry::{BATTERY_LEVEL_UUID, HEART_RATE_MEASUREMENT_UUID};


/// A decoded reading, or the reason a frame could not be decoded.
pub type MuxItem = Result<TelemetryReading, DecodeError>;


/// Runs the two acquisition paths against one connection: heart-rate
/// notifications (push) and battery reads on a timer (poll). Both feed the
/// same channel; each path keeps its own order.
pub struct Multiplexer {
    cancel: CancellationToken,
    poll_task: JoinHandle<()>,
}

impl Multiplexer {
    pub async fn start<C: Connection>(
        connection: Arc<C>,
        poll_every: Duration,
        tx: mpsc::UnboundedSender<MuxItem>,
    ) -> Result<Self, GatewayError> {
        let cancel = CancellationToken::new();

        let push_cancel = cancel.clone();
        let push_tx = tx.clone();
        let on_data: NotificationHandler = Arc::new(move |frame: Vec<u8>| {
            if push_cancel.is_cancelled() {
                return;
            }
            // Runs on the BLE delivery task, so it only enqueues
            let _ = push_tx.send(decode_heart_rate(&frame));
        });
        connection
            .subscribe_notifications(HEART_RATE_MEASUREMENT_UUID, on_data)
            .await?;

        let poll_task = tokio::spawn(poll_battery(connection, poll_every, tx, cancel.clone()));

        Ok(Multiplexer { cancel, poll_task })
    }

    /// Stops both paths. Returns once the poll task has exited, so no battery
    /// read is outstanding afterwards.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.poll_task.await {
            warn!(error = %err, "battery poll task ended abnormally");
        }
    }
}

async fn poll_battery<C: Connection>(
    connection: Arc<C>,
    every: Duration,
    tx: mpsc::UnboundedSender<MuxItem>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = connection.read_characteristic(BATTERY_LEVEL_UUID) => read,
        };
        let item = match read {
            Ok(frame) => decode_battery(&frame),
            Err(err) => {
                warn!(error = %err, "battery read failed");
                continue;
            }
        };

        if cancel.is_cancelled() || tx.send(item).is_err() {
            break;
        }
    }

    debug!("battery poll stopped");
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeConnection, FakeDevice, FakeGateway};
    use crate::gateway::Gateway;
    use crate::telemetry::ReadingKind;
    use tokio::time::Instant;

    const POLL: Duration = Duration::from_secs(5);

    async fn open(gateway: &FakeGateway) -> Arc<FakeConnection> {
        let handle = gateway.discover("Polar", Duration::from_secs(1)).await.unwrap();
        gateway.connect(handle).await.unwrap()
    }

    fn strap() -> FakeGateway {
        FakeGateway::new(vec![FakeDevice::new("Polar H10", "AA:BB")])
    }

    fn kind(item: MuxItem) -> ReadingKind {
        item.unwrap().kind
    }

    #[tokio::test(start_paused = true)]
    async fn every_notification_becomes_one_reading_in_order() {
        let gateway = strap();
        let connection = open(&gateway).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mux = Multiplexer::start(connection.clone(), POLL, tx).await.unwrap();

        // first poll fires right away
        assert_eq!(kind(rx.recv().await.unwrap()), ReadingKind::BatteryLevel { percent: 100 });

        for bpm in [70, 71, 72] {
            assert!(connection.push(&[0x00, bpm]));
        }
        for bpm in [70, 71, 72] {
            assert_eq!(kind(rx.recv().await.unwrap()), ReadingKind::HeartRate { bpm });
        }

        mux.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn a_burst_of_notifications_is_never_dropped() {
        let gateway = strap();
        let connection = open(&gateway).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mux = Multiplexer::start(connection.clone(), POLL, tx).await.unwrap();

        // nobody reads while the burst arrives
        for bpm in 60..70 {
            assert!(connection.push(&[0x00, bpm]));
        }

        let mut heart_rates = vec![];
        while heart_rates.len() < 10 {
            if let ReadingKind::HeartRate { bpm } = kind(rx.recv().await.unwrap()) {
                heart_rates.push(bpm);
            }
        }
        assert_eq!(heart_rates, (60..70).collect::<Vec<u8>>());

        mux.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn battery_is_polled_on_a_fixed_interval() {
        let gateway = strap().with_battery_frame(vec![87]);
        let connection = open(&gateway).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        let mux = Multiplexer::start(connection.clone(), POLL, tx).await.unwrap();

        for _ in 0..3 {
            assert_eq!(kind(rx.recv().await.unwrap()), ReadingKind::BatteryLevel { percent: 87 });
        }

        assert_eq!(connection.read_count(), 3);
        assert_eq!(started.elapsed(), POLL * 2);
        mux.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn decode_errors_do_not_stop_either_path() {
        let gateway = strap().with_battery_frame(vec![]);
        let connection = open(&gateway).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mux = Multiplexer::start(connection.clone(), POLL, tx).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), Err(DecodeError::BatteryLength { len: 0 }));

        connection.push(&[0x01, 0x48, 0x00]);
        connection.push(&[0x00, 65]);
        assert_eq!(rx.recv().await.unwrap(), Err(DecodeError::HeartRate16Bit { flags: 0x01 }));
        assert_eq!(kind(rx.recv().await.unwrap()), ReadingKind::HeartRate { bpm: 65 });

        connection.set_battery_frame(vec![42]);
        assert_eq!(kind(rx.recv().await.unwrap()), ReadingKind::BatteryLevel { percent: 42 });

        mux.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_the_poll_wait_immediately() {
        let gateway = strap();
        let connection = open(&gateway).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mux = Multiplexer::start(connection.clone(), POLL, tx).await.unwrap();
        rx.recv().await.unwrap();

        let before = Instant::now();
        mux.stop().await;
        assert_eq!(before.elapsed(), Duration::ZERO);

        // late notifications are swallowed
        connection.push(&[0x00, 80]);
        tokio::time::sleep(POLL * 3).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(connection.read_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_abandons_an_in_flight_read() {
        let gateway = strap().with_read_delay(Duration::from_secs(3));
        let connection = open(&gateway).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let mux = Multiplexer::start(connection.clone(), POLL, tx).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connection.reads_in_flight(), 1);

        mux.stop().await;
        assert_eq!(connection.reads_in_flight(), 0);
    }
}

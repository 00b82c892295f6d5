//! Consumer supervision: restart a stopped consumer after a backoff

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use super::{Broker, EnvelopeHandler};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// A consumer that stayed up this long starts over from the initial backoff
const HEALTHY_RUN: Duration = Duration::from_secs(60);

/// Run `handler` against `queue` until `shutdown` flips, restarting it whenever the
/// consumer stops on its own. A broker whose connection died reopens it on the next
/// `consume`.
pub async fn supervise(
    broker: Arc<dyn Broker>,
    queue: String,
    handler: Arc<dyn EnvelopeHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let started = Instant::now();
        let result = broker
            .consume(&queue, handler.clone(), shutdown.clone())
            .await;
        if *shutdown.borrow() {
            break;
        }
        if started.elapsed() >= HEALTHY_RUN {
            backoff = INITIAL_BACKOFF;
        }

        match result {
            Ok(()) => tracing::warn!(consumer = handler.name(), "Consumer exited, restarting"),
            Err(e) => tracing::error!(
                consumer = handler.name(),
                error = %e,
                backoff_ms = backoff.as_millis() as u64,
                "Consumer failed, restarting after backoff"
            ),
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
    tracing::info!(consumer = handler.name(), "Consumer supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Envelope, Topology};
    use async_trait::async_trait;
    use chatgate_shared::{GatewayError, GatewayResult};
    use std::sync::Mutex;

    /// Broker that records when each consume starts and runs each attempt from a script
    struct ScriptedBroker {
        /// How long each attempt stays up before failing; past the end it waits for shutdown
        runs: Vec<Duration>,
        starts: Mutex<Vec<Instant>>,
    }

    impl ScriptedBroker {
        fn new(runs: Vec<Duration>) -> Self {
            Self {
                runs,
                starts: Mutex::new(Vec::new()),
            }
        }

        fn gaps(&self) -> Vec<Duration> {
            let starts = self.starts.lock().unwrap();
            starts.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    #[async_trait]
    impl Broker for ScriptedBroker {
        async fn publish(&self, _: &str, _: &str, _: Vec<u8>) -> GatewayResult<()> {
            Ok(())
        }

        async fn consume(
            &self,
            _queue: &str,
            _handler: Arc<dyn EnvelopeHandler>,
            mut shutdown: watch::Receiver<bool>,
        ) -> GatewayResult<()> {
            let attempt = {
                let mut starts = self.starts.lock().unwrap();
                starts.push(Instant::now());
                starts.len() - 1
            };
            match self.runs.get(attempt) {
                Some(run) => {
                    tokio::time::sleep(*run).await;
                    Err(GatewayError::transient("connection reset"))
                }
                None => {
                    let _ = shutdown.changed().await;
                    Ok(())
                }
            }
        }
    }

    struct Noop;

    #[async_trait]
    impl EnvelopeHandler for Noop {
        fn name(&self) -> &'static str {
            "noop"
        }

        async fn handle(&self, _: &Envelope) -> GatewayResult<()> {
            Ok(())
        }
    }

    fn start(broker: Arc<ScriptedBroker>) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(supervise(
            broker,
            Topology::default().private_message_queue,
            Arc::new(Noop),
            rx,
        ));
        (tx, task)
    }

    fn assert_gaps(actual: &[Duration], expected: &[Duration]) {
        assert_eq!(actual.len(), expected.len(), "gaps: {actual:?}");
        for (gap, want) in actual.iter().zip(expected) {
            assert!(
                *gap >= *want && *gap < *want + Duration::from_millis(10),
                "gap {gap:?}, expected {want:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_between_failures() {
        let broker = Arc::new(ScriptedBroker::new(vec![Duration::ZERO; 3]));
        let (tx, task) = start(broker.clone());

        tokio::time::sleep(Duration::from_secs(10)).await;
        let ms = Duration::from_millis;
        assert_gaps(&broker.gaps(), &[ms(500), ms(1000), ms(2000)]);

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_healthy_run() {
        let ms = Duration::from_millis;
        let broker = Arc::new(ScriptedBroker::new(vec![
            Duration::ZERO,
            Duration::ZERO,
            HEALTHY_RUN,
            Duration::ZERO,
        ]));
        let (tx, task) = start(broker.clone());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_gaps(
            &broker.gaps(),
            &[ms(500), ms(1000), HEALTHY_RUN + ms(500), ms(1000)],
        );

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let broker = Arc::new(ScriptedBroker::new(vec![Duration::ZERO]));
        let (tx, task) = start(broker.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(broker.starts.lock().unwrap().len(), 1);
    }
}

//! Tracker announce sessions
//!
//! One announcer task per tracker tier (BEP 12). Within a tier trackers
//! are tried in order and the first one that works floats to the front.
//! Lifecycle per session: `started` once, periodic reannounces at the
//! clamped server interval, `completed` on command when the download
//! finishes, and a best-effort `stopped` on shutdown. Failures back off
//! from 30 seconds, doubling to a 30 minute cap.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::tracker::{AnnounceEvent, AnnounceRequest, TrackerTransport};
use crate::types::{InfoHash, PeerId};

/// How long the final `stopped` announce may take before shutdown proceeds.
const STOPPED_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Swarm totals the announcer reports; the coordinator publishes updates
/// through a watch channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwarmCounters {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Events an announcer feeds back to the coordinator.
#[derive(Debug)]
pub enum AnnouncerEvent {
    /// Peers discovered by an announce
    Peers { peers: Vec<SocketAddr> },
}

/// Commands from the coordinator.
#[derive(Debug)]
pub enum AnnouncerCommand {
    /// Announce immediately with the given event (e.g. `completed`)
    AnnounceNow(AnnounceEvent),
}

/// Tunables snapshot for one announcer.
#[derive(Debug, Clone, Copy)]
pub struct AnnouncerConfig {
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub numwant: u32,
}

/// Identity of the announcing torrent.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceIdentity {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
}

/// Run one tracker tier until cancelled.
#[allow(clippy::too_many_arguments)]
pub async fn run_tier(
    mut trackers: Vec<String>,
    transport: Arc<dyn TrackerTransport>,
    identity: AnnounceIdentity,
    counters: watch::Receiver<SwarmCounters>,
    events: mpsc::Sender<AnnouncerEvent>,
    mut commands: mpsc::Receiver<AnnouncerCommand>,
    cancel: CancellationToken,
    config: AnnouncerConfig,
) {
    if trackers.is_empty() {
        return;
    }

    // The event to deliver with the next announce. Stays pending across
    // failures so `started` is never silently dropped.
    let mut pending_event = AnnounceEvent::Started;
    let mut backoff = config.backoff_initial;

    loop {
        let request = build_request(&identity, &counters, pending_event, config.numwant);
        let outcome = announce_tier(&mut trackers, transport.as_ref(), &request).await;

        let sleep_for = match outcome {
            Some(response) => {
                backoff = config.backoff_initial;
                pending_event = AnnounceEvent::None;
                if !response.peers.is_empty()
                    && events
                        .send(AnnouncerEvent::Peers {
                            peers: response.peers,
                        })
                        .await
                        .is_err()
                {
                    return;
                }
                response
                    .interval
                    .clamp(config.min_interval, config.max_interval)
            }
            None => {
                let wait = backoff;
                backoff = (backoff * 2).min(config.backoff_max);
                wait
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(AnnouncerCommand::AnnounceNow(event)) => {
                    pending_event = event;
                    continue;
                }
                None => break,
            },
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }

    // Loop shutdown: tell the tier we are gone, best effort.
    let request = build_request(&identity, &counters, AnnounceEvent::Stopped, 0);
    let _ = tokio::time::timeout(
        STOPPED_ANNOUNCE_TIMEOUT,
        announce_tier(&mut trackers, transport.as_ref(), &request),
    )
    .await;
}

fn build_request(
    identity: &AnnounceIdentity,
    counters: &watch::Receiver<SwarmCounters>,
    event: AnnounceEvent,
    numwant: u32,
) -> AnnounceRequest {
    let totals = *counters.borrow();
    AnnounceRequest {
        info_hash: identity.info_hash,
        peer_id: identity.peer_id,
        port: identity.port,
        uploaded: totals.uploaded,
        downloaded: totals.downloaded,
        left: totals.left,
        event,
        numwant,
    }
}

/// Try each tracker in tier order; promote the first success to the front
/// (BEP 12).
async fn announce_tier(
    trackers: &mut Vec<String>,
    transport: &dyn TrackerTransport,
    request: &AnnounceRequest,
) -> Option<crate::tracker::AnnounceResponse> {
    for i in 0..trackers.len() {
        match transport.announce(&trackers[i], request).await {
            Ok(response) => {
                tracing::debug!(
                    "announce to {} ok: {} peers, interval {:?}",
                    trackers[i],
                    response.peers.len(),
                    response.interval
                );
                if i > 0 {
                    let winner = trackers.remove(i);
                    trackers.insert(0, winner);
                }
                return Some(response);
            }
            Err(e) => {
                tracing::debug!("announce to {} failed: {}", trackers[i], e);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, ProtocolErrorKind};
    use crate::tracker::AnnounceResponse;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Scripted transport: records every announce and fails URLs on a
    /// deny-list.
    struct FakeTransport {
        calls: Mutex<Vec<(String, AnnounceEvent)>>,
        failing: Vec<String>,
        peers: Vec<SocketAddr>,
        interval: Duration,
    }

    impl FakeTransport {
        fn new(peers: Vec<SocketAddr>, interval: Duration) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failing: Vec::new(),
                peers,
                interval,
            }
        }

        fn calls(&self) -> Vec<(String, AnnounceEvent)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl TrackerTransport for FakeTransport {
        async fn announce(
            &self,
            url: &str,
            request: &AnnounceRequest,
        ) -> crate::error::Result<AnnounceResponse> {
            self.calls.lock().push((url.to_string(), request.event));
            if self.failing.iter().any(|f| f == url) {
                return Err(EngineError::protocol(
                    ProtocolErrorKind::TrackerError,
                    "scripted failure",
                ));
            }
            Ok(AnnounceResponse {
                interval: self.interval,
                complete: Some(1),
                incomplete: Some(1),
                peers: self.peers.clone(),
            })
        }
    }

    fn config() -> AnnouncerConfig {
        AnnouncerConfig {
            min_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(3600),
            backoff_initial: Duration::from_millis(20),
            backoff_max: Duration::from_millis(100),
            numwant: 50,
        }
    }

    fn identity() -> AnnounceIdentity {
        AnnounceIdentity {
            info_hash: [1u8; 20],
            peer_id: [2u8; 20],
            port: 6881,
        }
    }

    #[tokio::test]
    async fn test_started_once_then_regular_and_stopped() {
        let peer: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let transport = Arc::new(FakeTransport::new(
            vec![peer],
            Duration::from_millis(10),
        ));
        let (_counters_tx, counters_rx) = watch::channel(SwarmCounters::default());
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (_commands_tx, commands_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_tier(
            vec!["http://a.example/announce".to_string()],
            transport.clone(),
            identity(),
            counters_rx,
            events_tx,
            commands_rx,
            cancel.clone(),
            config(),
        ));

        // First announce discovers the peer
        match events_rx.recv().await.unwrap() {
            AnnouncerEvent::Peers { peers } => assert_eq!(peers, vec![peer]),
        }

        // Wait for at least one reannounce, then stop
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        handle.await.unwrap();

        let calls = transport.calls();
        assert!(calls.len() >= 3);
        assert_eq!(calls[0].1, AnnounceEvent::Started);
        // Exactly one started, exactly one stopped (the last call)
        assert_eq!(
            calls
                .iter()
                .filter(|(_, e)| *e == AnnounceEvent::Started)
                .count(),
            1
        );
        assert_eq!(calls.last().unwrap().1, AnnounceEvent::Stopped);
        assert!(calls[1..calls.len() - 1]
            .iter()
            .all(|(_, e)| *e == AnnounceEvent::None));
    }

    #[tokio::test]
    async fn test_tier_promotion_on_failure() {
        let mut transport = FakeTransport::new(vec![], Duration::from_millis(10));
        transport.failing = vec!["http://bad.example/announce".to_string()];
        let transport = Arc::new(transport);

        let (_counters_tx, counters_rx) = watch::channel(SwarmCounters::default());
        let (events_tx, _events_rx) = mpsc::channel(8);
        let (_commands_tx, commands_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_tier(
            vec![
                "http://bad.example/announce".to_string(),
                "http://good.example/announce".to_string(),
            ],
            transport.clone(),
            identity(),
            counters_rx,
            events_tx,
            commands_rx,
            cancel.clone(),
            config(),
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        handle.await.unwrap();

        let calls = transport.calls();
        // Round one: bad then good. After promotion the good tracker leads.
        assert_eq!(calls[0].0, "http://bad.example/announce");
        assert_eq!(calls[1].0, "http://good.example/announce");
        assert_eq!(calls[2].0, "http://good.example/announce");
    }

    #[tokio::test]
    async fn test_completed_on_command() {
        let transport = Arc::new(FakeTransport::new(vec![], Duration::from_secs(3600)));
        let (_counters_tx, counters_rx) = watch::channel(SwarmCounters::default());
        let (events_tx, _events_rx) = mpsc::channel(8);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_tier(
            vec!["http://a.example/announce".to_string()],
            transport.clone(),
            identity(),
            counters_rx,
            events_tx,
            commands_rx,
            cancel.clone(),
            config(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        commands_tx
            .send(AnnouncerCommand::AnnounceNow(AnnounceEvent::Completed))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let events: Vec<AnnounceEvent> =
            transport.calls().into_iter().map(|(_, e)| e).collect();
        assert_eq!(events[0], AnnounceEvent::Started);
        assert!(events.contains(&AnnounceEvent::Completed));
        assert_eq!(*events.last().unwrap(), AnnounceEvent::Stopped);
    }

    #[tokio::test]
    async fn test_backoff_retries_keep_pending_started() {
        let mut transport = FakeTransport::new(vec![], Duration::from_secs(1));
        transport.failing = vec!["http://flaky.example/announce".to_string()];
        let transport = Arc::new(transport);

        let (_counters_tx, counters_rx) = watch::channel(SwarmCounters::default());
        let (events_tx, _events_rx) = mpsc::channel(8);
        let (_commands_tx, commands_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_tier(
            vec!["http://flaky.example/announce".to_string()],
            transport.clone(),
            identity(),
            counters_rx,
            events_tx,
            commands_rx,
            cancel.clone(),
            config(),
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        let calls = transport.calls();
        // Every retry still carries `started` because none succeeded
        assert!(calls.len() >= 2);
        assert!(calls[..calls.len() - 1]
            .iter()
            .all(|(_, e)| *e == AnnounceEvent::Started));
    }
}

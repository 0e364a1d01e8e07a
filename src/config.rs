//! Engine configuration
//!
//! All tunables of the per-torrent engine. Defaults follow common
//! BitTorrent client practice; tests override individual fields.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a torrent's coordinator loop and its workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Maximum simultaneous peer connections
    pub max_peers: usize,
    /// Maximum outstanding block requests per peer
    pub request_queue_len: usize,
    /// Number of regular unchoke slots
    pub unchoke_slots: usize,
    /// Interval between choke rounds
    pub choke_interval: Duration,
    /// Every n-th choke round rotates the optimistic unchoke
    pub optimistic_rounds: u32,
    /// Window for peer transfer-rate ranking
    pub rate_window: Duration,
    /// A peer connected less than this long ago counts as new for the
    /// optimistic unchoke weighting
    pub fresh_peer_window: Duration,

    /// Handshake must complete within this long
    pub handshake_timeout: Duration,
    /// TCP dial timeout for outbound peers
    pub connect_timeout: Duration,
    /// Send a keep-alive after this long without outbound traffic
    pub keepalive_interval: Duration,
    /// Close the connection after this long without inbound traffic
    pub idle_timeout: Duration,
    /// Mark a peer snubbed after this long without a block while requests
    /// are outstanding
    pub snub_timeout: Duration,
    /// A peer snubbed for this long is excluded from the regular unchoke
    /// ranking
    pub snub_penalty: Duration,

    /// Fraction of the piece count below which endgame mode activates
    pub endgame_ratio: f64,
    /// Download pieces in index order instead of rarest-first
    pub sequential: bool,
    /// Override for the picker's deterministic shuffle seed. When unset the
    /// seed is derived from the info-hash.
    pub picker_seed: Option<u64>,
    /// Drop a peer after this many consecutive hash failures
    pub max_hash_failures: u32,

    /// Clamp range for tracker-supplied announce intervals
    pub min_announce_interval: Duration,
    pub max_announce_interval: Duration,
    /// Announce retry backoff, doubling from initial to max
    pub announce_backoff_initial: Duration,
    pub announce_backoff_max: Duration,
    /// Tracker request timeout
    pub tracker_timeout: Duration,

    /// Webseed failure backoff, doubling from initial to max
    pub webseed_backoff_initial: Duration,
    pub webseed_backoff_max: Duration,
    /// Webseed request timeout
    pub webseed_timeout: Duration,

    /// Minimum spacing between coalesced resume writes
    pub resume_write_interval: Duration,
    /// Grace period for workers to drain on stop before they are aborted
    pub stop_grace: Duration,

    /// User agent for tracker and webseed HTTP requests
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_peers: 50,
            request_queue_len: 50,
            unchoke_slots: 4,
            choke_interval: Duration::from_secs(10),
            optimistic_rounds: 3,
            rate_window: Duration::from_secs(20),
            fresh_peer_window: Duration::from_secs(60),

            handshake_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(600),
            snub_timeout: Duration::from_secs(30),
            snub_penalty: Duration::from_secs(60),

            endgame_ratio: 0.02,
            sequential: false,
            picker_seed: None,
            max_hash_failures: 3,

            min_announce_interval: Duration::from_secs(60),
            max_announce_interval: Duration::from_secs(3600),
            announce_backoff_initial: Duration::from_secs(30),
            announce_backoff_max: Duration::from_secs(30 * 60),
            tracker_timeout: Duration::from_secs(15),

            webseed_backoff_initial: Duration::from_secs(60),
            webseed_backoff_max: Duration::from_secs(3600),
            webseed_timeout: Duration::from_secs(30),

            resume_write_interval: Duration::from_secs(5),
            stop_grace: Duration::from_secs(30),

            user_agent: format!("riptide/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Config {
    /// Endgame threshold for a torrent with `num_pieces` pieces:
    /// `max(1, endgame_ratio * N)`.
    pub fn endgame_threshold(&self, num_pieces: usize) -> usize {
        ((num_pieces as f64 * self.endgame_ratio).floor() as usize).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_peers, 50);
        assert_eq!(config.request_queue_len, 50);
        assert_eq!(config.unchoke_slots, 4);
        assert_eq!(config.choke_interval, Duration::from_secs(10));
        assert_eq!(config.snub_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_endgame_threshold() {
        let config = Config::default();
        // 2% of 1000 pieces
        assert_eq!(config.endgame_threshold(1000), 20);
        // Never below one piece
        assert_eq!(config.endgame_threshold(1), 1);
        assert_eq!(config.endgame_threshold(10), 1);
    }

    #[test]
    fn test_serde_round_trip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_peers, config.max_peers);
        assert_eq!(back.choke_interval, config.choke_interval);
    }
}

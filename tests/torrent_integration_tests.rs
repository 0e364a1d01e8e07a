//! Torrent engine integration tests
//!
//! End-to-end scenarios over loopback sockets: downloading from a scripted
//! peer, hash-failure handling, webseed fallback via a mock HTTP server,
//! resume restarts and the upload path.

mod mock_peer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use riptide::resume::{MemoryResumeStore, ResumeSnapshot, ResumeStore};
use riptide::storage::MemoryStorage;
use riptide::tracker::AnnounceEvent;
use riptide::{
    Bitfield, Collaborators, Info, RateLimits, Torrent, TorrentEvent, TorrentId, TorrentParams,
    TorrentStatus,
};

use mock_peer::{MockPeer, MockPeerConfig, Recorded};
use test_helpers::{build_info, make_pieces, test_config, wait_for, wait_for_status, RecordingTracker};

const INFO_HASH: [u8; 20] = [0x42; 20];
const PIECE_LEN: usize = 16_384;

fn torrent_params(info: Arc<Info>) -> TorrentParams {
    TorrentParams {
        id: TorrentId::new(),
        info_hash: INFO_HASH,
        name: info.name.clone(),
        info: Some(info),
        trackers: Vec::new(),
        url_list: Vec::new(),
        fixed_peers: Vec::new(),
        dest: PathBuf::from("/nonexistent"),
        port: 6881,
        resume: None,
    }
}

fn collaborators(storage: Arc<MemoryStorage>) -> (Collaborators, Arc<MemoryResumeStore>) {
    let resume = Arc::new(MemoryResumeStore::new());
    (
        Collaborators {
            storage,
            resume: Arc::clone(&resume) as Arc<dyn ResumeStore>,
            tracker: RecordingTracker::new(Vec::new()),
            limits: RateLimits::unlimited(),
        },
        resume,
    )
}

async fn seeder_with_pieces(piece_data: &[Vec<u8>]) -> Arc<MockPeer> {
    let mut config = MockPeerConfig::new(INFO_HASH, piece_data.len());
    for (index, data) in piece_data.iter().enumerate() {
        config = config.with_piece(index as u32, data.clone());
    }
    let peer = Arc::new(MockPeer::bind(config).await.unwrap());
    Arc::clone(&peer).start();
    peer
}

#[tokio::test]
async fn test_single_piece_download_from_one_peer() {
    let piece_data = vec![vec![0u8; PIECE_LEN]];
    let info = build_info("zeros.bin", PIECE_LEN as u64, &piece_data);
    let storage = Arc::new(MemoryStorage::new(Arc::clone(&info)));
    let (collab, _) = collaborators(Arc::clone(&storage));

    let peer = seeder_with_pieces(&piece_data).await;
    let torrent = Torrent::spawn(torrent_params(info), test_config(), collab);
    let mut events = torrent.subscribe();

    torrent.start().await.unwrap();
    wait_for_status(&torrent, TorrentStatus::Downloading, Duration::from_secs(5)).await;
    torrent.add_peers(vec![peer.addr()]).await.unwrap();

    wait_for_status(&torrent, TorrentStatus::Seeding, Duration::from_secs(20)).await;

    let bitfield = torrent.bitfield().await.unwrap().unwrap();
    assert!(bitfield.is_complete());
    assert_eq!(bitfield.len(), 1);

    let stats = torrent.stats().await.unwrap();
    assert_eq!(stats.bytes_downloaded, PIECE_LEN as u64);
    assert_eq!(stats.have_pieces, 1);
    assert_eq!(storage.piece_count(), 1);

    // The peer saw our interest and the block request
    assert!(peer
        .received()
        .contains(&Recorded::Interested));
    assert!(peer.received().contains(&Recorded::Request {
        index: 0,
        begin: 0,
        length: PIECE_LEN as u32
    }));

    // Completed fired exactly once
    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, TorrentEvent::Completed) {
            completed += 1;
        }
    }
    assert_eq!(completed, 1);

    torrent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_corrupt_peer_is_dropped_after_repeated_failures() {
    let piece_data = vec![vec![1u8; PIECE_LEN]];
    let info = build_info("good.bin", PIECE_LEN as u64, &piece_data);
    let storage = Arc::new(MemoryStorage::new(Arc::clone(&info)));
    let (collab, _) = collaborators(storage);

    let config = MockPeerConfig::new(INFO_HASH, 1)
        .with_piece(0, piece_data[0].clone())
        .with_corrupt_data();
    let peer = Arc::new(MockPeer::bind(config).await.unwrap());
    Arc::clone(&peer).start();

    let torrent = Torrent::spawn(torrent_params(info), test_config(), collab);
    let mut events = torrent.subscribe();

    torrent.start().await.unwrap();
    wait_for_status(&torrent, TorrentStatus::Downloading, Duration::from_secs(5)).await;
    torrent.add_peers(vec![peer.addr()]).await.unwrap();

    // Three corrupt pieces get wasted, then the peer is dropped
    let settled = wait_for(Duration::from_secs(30), || async {
        let stats = torrent.stats().await.unwrap();
        stats.bytes_wasted >= 3 * PIECE_LEN as u64 && stats.connected_peers == 0
    })
    .await;
    assert!(settled, "corrupt peer was not dropped");

    let stats = torrent.stats().await.unwrap();
    assert_eq!(stats.bytes_downloaded, 0);
    assert_eq!(torrent.status().await.unwrap(), TorrentStatus::Downloading);

    let mut failures = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, TorrentEvent::PieceFailed { index: 0 }) {
            failures += 1;
        }
    }
    assert!(failures >= 3, "saw only {} failure events", failures);

    torrent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_webseed_download_with_range_request() {
    let piece_data = make_pieces(PIECE_LEN, 1, None);
    let info = build_info("data.bin", PIECE_LEN as u64, &piece_data);
    let storage = Arc::new(MemoryStorage::new(Arc::clone(&info)));
    let (collab, _) = collaborators(Arc::clone(&storage));

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .and(header("Range", "bytes=0-16383"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(piece_data[0].clone()))
        .mount(&server)
        .await;

    let mut params = torrent_params(info);
    params.url_list = vec![format!("{}/data.bin", server.uri())];

    let torrent = Torrent::spawn(params, test_config(), collab);
    torrent.start().await.unwrap();

    wait_for_status(&torrent, TorrentStatus::Seeding, Duration::from_secs(20)).await;
    assert_eq!(storage.piece_count(), 1);
    let stats = torrent.stats().await.unwrap();
    assert_eq!(stats.bytes_downloaded, PIECE_LEN as u64);

    torrent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_webseed_server_error_backs_off() {
    let piece_data = make_pieces(PIECE_LEN, 1, None);
    let info = build_info("data.bin", PIECE_LEN as u64, &piece_data);
    let storage = Arc::new(MemoryStorage::new(Arc::clone(&info)));
    let (collab, _) = collaborators(storage);

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut params = torrent_params(info);
    params.url_list = vec![format!("{}/data.bin", server.uri())];

    let torrent = Torrent::spawn(params, test_config(), collab);
    torrent.start().await.unwrap();
    wait_for_status(&torrent, TorrentStatus::Downloading, Duration::from_secs(5)).await;

    // Give the engine time to try, fail, and enter the backoff window
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(torrent.status().await.unwrap(), TorrentStatus::Downloading);
    let stats = torrent.stats().await.unwrap();
    assert_eq!(stats.bytes_downloaded, 0);

    // One attempt only: the 60s backoff blocks any retry in this window
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);

    torrent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resume_restart_announces_started_and_completes() {
    let piece_data = make_pieces(PIECE_LEN, 4, None);
    let info = build_info("resume.bin", PIECE_LEN as u64, &piece_data);

    // Two pieces already on disk from the previous run
    let storage = Arc::new(MemoryStorage::new(Arc::clone(&info)));
    storage.insert_piece(0, piece_data[0].clone());
    storage.insert_piece(1, piece_data[1].clone());

    let mut have = Bitfield::new(4);
    have.set(0);
    have.set(1);
    let snapshot = ResumeSnapshot {
        info_hash: INFO_HASH,
        trackers: vec![vec!["http://tracker.example/announce".to_string()]],
        url_list: Vec::new(),
        dest_path: PathBuf::from("/nonexistent"),
        port: 6881,
        name: "resume.bin".to_string(),
        bitfield: have.serialize(),
        num_pieces: 4,
        bytes_downloaded: 2 * PIECE_LEN as u64,
        bytes_uploaded: 0,
        bytes_wasted: 0,
        seeded_for: Duration::ZERO,
        added_at: chrono::Utc::now(),
    };

    let peer = seeder_with_pieces(&piece_data).await;
    let tracker = RecordingTracker::new(vec![peer.addr()]);
    let resume_store = Arc::new(MemoryResumeStore::new());
    let collab = Collaborators {
        storage: Arc::clone(&storage) as Arc<dyn riptide::Storage>,
        resume: Arc::clone(&resume_store) as Arc<dyn ResumeStore>,
        tracker: Arc::clone(&tracker) as Arc<dyn riptide::TrackerTransport>,
        limits: RateLimits::unlimited(),
    };

    let params = TorrentParams::from_snapshot(TorrentId::new(), snapshot, Some(info));
    let torrent = Torrent::spawn(params, test_config(), collab);
    let id = torrent.id();

    torrent.start().await.unwrap();
    wait_for_status(&torrent, TorrentStatus::Seeding, Duration::from_secs(20)).await;

    // Restart announced `started`, not `completed`, then completed once the
    // remaining pieces arrived
    let events = tracker.events();
    assert_eq!(events.first(), Some(&AnnounceEvent::Started));
    assert!(events.contains(&AnnounceEvent::Completed));

    let bitfield = torrent.bitfield().await.unwrap().unwrap();
    assert!(bitfield.is_complete());
    let stats = torrent.stats().await.unwrap();
    assert_eq!(stats.bytes_downloaded, 4 * PIECE_LEN as u64);

    // Stop flushes a final snapshot with the full bitfield
    torrent.stop().await.unwrap();
    wait_for_status(&torrent, TorrentStatus::Stopped, Duration::from_secs(10)).await;
    let saved = resume_store.read(&id).await.unwrap().unwrap();
    let saved_bits = saved.decode_bitfield().unwrap();
    assert!(saved_bits.is_complete());

    // The tier got a `stopped` on the way down
    assert_eq!(tracker.events().last(), Some(&AnnounceEvent::Stopped));

    torrent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_two_peers_complete_torrent() {
    let piece_data = make_pieces(PIECE_LEN, 4, Some(5_000));
    let info = build_info("multi.bin", PIECE_LEN as u64, &piece_data);
    let storage = Arc::new(MemoryStorage::new(Arc::clone(&info)));
    let (collab, _) = collaborators(Arc::clone(&storage));

    let peer_a = seeder_with_pieces(&piece_data).await;
    let peer_b = seeder_with_pieces(&piece_data).await;

    let torrent = Torrent::spawn(torrent_params(info), test_config(), collab);
    torrent.start().await.unwrap();
    wait_for_status(&torrent, TorrentStatus::Downloading, Duration::from_secs(5)).await;
    torrent
        .add_peers(vec![peer_a.addr(), peer_b.addr()])
        .await
        .unwrap();

    wait_for_status(&torrent, TorrentStatus::Seeding, Duration::from_secs(30)).await;
    assert_eq!(storage.piece_count(), 4);

    let stats = torrent.stats().await.unwrap();
    // Short last piece: 3 full pieces plus 5000 bytes
    assert_eq!(stats.bytes_downloaded, (3 * PIECE_LEN + 5_000) as u64);

    torrent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_seeding_serves_leech_requests() {
    let piece_data = make_pieces(PIECE_LEN, 1, None);
    let info = build_info("serve.bin", PIECE_LEN as u64, &piece_data);
    let storage = Arc::new(MemoryStorage::new(Arc::clone(&info)));
    storage.insert_piece(0, piece_data[0].clone());
    let (collab, _) = collaborators(Arc::clone(&storage));

    let config = MockPeerConfig::new(INFO_HASH, 1).as_leech(0, 0, PIECE_LEN as u32);
    let leech = Arc::new(MockPeer::bind(config).await.unwrap());
    Arc::clone(&leech).start();

    let torrent = Torrent::spawn(torrent_params(info), test_config(), collab);
    torrent.start().await.unwrap();
    wait_for_status(&torrent, TorrentStatus::Seeding, Duration::from_secs(5)).await;
    torrent.add_peers(vec![leech.addr()]).await.unwrap();

    // The choke round unchokes the interested leech; it requests a block
    // and receives the piece data
    let served = wait_for(Duration::from_secs(20), || async {
        leech.count_received(|m| matches!(m, Recorded::Piece { index: 0, begin: 0, len } if *len == PIECE_LEN as u32)) > 0
    })
    .await;
    assert!(served, "leech never received the requested block");

    let stats = torrent.stats().await.unwrap();
    assert_eq!(stats.bytes_uploaded, PIECE_LEN as u64);

    torrent.shutdown().await.unwrap();
}

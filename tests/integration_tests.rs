use chrono::{DateTime, Duration, TimeZone, Utc};
use transit_intervals::accumulator::Accumulator;
use transit_intervals::checkpoint::CheckpointStore;
use transit_intervals::estimate::{Bucket, BucketClock, UpdateRule};
use transit_intervals::filter::OutlierFilter;
use transit_intervals::pipeline::process_snapshot;
use transit_intervals::publish::{DirPublisher, publish_current};
use transit_intervals::shard::shard_key;
use transit_intervals::snapshot::{FeedFormat, decode};
use transit_intervals::topology::{PollWindow, StaticTopology};
use transit_intervals::types::StopPairKey;

fn t0() -> DateTime<Utc> {
    // Monday 2024-03-04 08:00:00 UTC.
    Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap()
}

/// An ETA JSON poll observed `poll_offset` seconds after t0.
fn eta_payload(poll_offset: i64, etas: &[(&str, &str, i64)]) -> Vec<u8> {
    let data: Vec<_> = etas
        .iter()
        .map(|(stop, trip, at)| {
            serde_json::json!({
                "stop": stop,
                "trip": trip,
                "eta": (t0() + Duration::seconds(*at)).to_rfc3339(),
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "generated_timestamp": (t0() + Duration::seconds(poll_offset)).to_rfc3339(),
        "data": data,
    }))
    .unwrap()
}

#[test]
fn test_three_poll_scenario() {
    let topology = StaticTopology::new().with_trip("T1", ["A", "B", "C"]);
    let accumulator = Accumulator::default();
    let filter = OutlierFilter::default();
    let mut window = PollWindow::new(3);
    let key = StopPairKey::new("A", "B");

    let polls = [
        eta_payload(0, &[("A", "T1", 100), ("B", "T1", 250)]),
        eta_payload(60, &[("A", "T1", 100), ("B", "T1", 270)]),
        eta_payload(120, &[("B", "T1", 265), ("C", "T1", 255)]),
    ];

    let snapshot = decode(FeedFormat::EtaJson, &polls[0], Utc::now()).unwrap();
    assert_eq!(snapshot.observed_at, t0());
    process_snapshot(&mut window, snapshot, &topology, &filter, &accumulator, None);

    let est = accumulator.global_estimate(&key).unwrap();
    assert_eq!((est.count, est.mean), (1, 150.0));

    let snapshot = decode(FeedFormat::EtaJson, &polls[1], Utc::now()).unwrap();
    process_snapshot(&mut window, snapshot, &topology, &filter, &accumulator, None);

    let est = accumulator.global_estimate(&key).unwrap();
    assert_eq!(est.count, 2);
    assert!((est.mean - 160.0).abs() < 1e-9);

    // B > C is predicted backwards: dropped as inconsistent, never recorded.
    let snapshot = decode(FeedFormat::EtaJson, &polls[2], Utc::now()).unwrap();
    let stats = process_snapshot(&mut window, snapshot, &topology, &filter, &accumulator, None);
    assert_eq!(stats.inconsistent, 1);
    assert!(accumulator.global_estimate(&StopPairKey::new("B", "C")).is_none());

    let snap = accumulator.snapshot();
    let pair = snap.get(&key).unwrap();
    let bucket = pair.bucket(Bucket::new(0, 8).unwrap()).unwrap();
    assert_eq!(bucket.count, 2);
    assert_eq!(pair.hourly.len(), 1);
}

#[tokio::test]
async fn test_checkpoint_and_publish_round_trip() {
    let root = std::env::temp_dir().join("transit_intervals_it_publish");
    let _ = std::fs::remove_dir_all(&root);
    std::fs::create_dir_all(&root).unwrap();

    let accumulator = Accumulator::default();
    accumulator.record_sample(&StopPairKey::new("076E1E9D", "076E1EA0"), 150.0, t0());
    accumulator.record_sample(&StopPairKey::new("X", "076E1E9D"), 80.0, t0());
    accumulator.record_sample(&StopPairKey::new("X", "Y"), 40.0, t0() + Duration::hours(3));

    // Survives a restart.
    let store = CheckpointStore::new(root.join("state/checkpoint.json"));
    store.save(&accumulator.snapshot()).unwrap();
    let restored = Accumulator::restore(store.load().unwrap(), BucketClock::utc(), UpdateRule::Cumulative);
    assert_eq!(restored.snapshot(), accumulator.snapshot());

    let publisher = DirPublisher::new(root.join("public"));
    let report = publish_current(&restored.snapshot(), restored.clock(), t0(), &publisher)
        .await
        .unwrap();
    assert_eq!(report.failed, 0);

    let read_json = |path: &str| -> serde_json::Value {
        serde_json::from_slice(&std::fs::read(root.join("public").join(path)).unwrap()).unwrap()
    };

    assert_eq!(shard_key("076E1E9D"), "07");
    let shard = read_json("times/07.json");
    assert_eq!(shard["076E1E9D"][0]["destinationStopId"], "076E1EA0");
    assert_eq!(shard["076E1E9D"][0]["averageSeconds"], 150.0);
    assert_eq!(shard["076E1E9D"][0]["sampleCount"], 1);

    let x = read_json("times/X.json");
    assert_eq!(x["X"].as_array().unwrap().len(), 2);

    let all = read_json("times/all.json");
    assert_eq!(all.as_object().unwrap().len(), 2);

    // The 11:00 sample for X > Y is absent from the 08:00 bucket.
    let hourly = read_json("times_hourly/1/08/X.json");
    assert_eq!(hourly["X"].as_array().unwrap().len(), 1);
    assert_eq!(hourly["X"][0]["destinationStopId"], "076E1E9D");

    let first = std::fs::read(root.join("public/times/all.json")).unwrap();
    publish_current(&restored.snapshot(), restored.clock(), t0(), &publisher)
        .await
        .unwrap();
    let second = std::fs::read(root.join("public/times/all.json")).unwrap();
    assert_eq!(first, second);

    std::fs::remove_dir_all(&root).unwrap();
}

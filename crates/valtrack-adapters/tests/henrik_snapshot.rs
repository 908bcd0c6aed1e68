use std::fs;
use std::path::PathBuf;

use valtrack_adapters::{HenrikAdapter, HenrikConfig, MatchProvider};
use valtrack_core::{MatchRecord, PlayerRef};
use valtrack_storage::{FetchResult, ResponseBody};

fn fixture_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/henrik/sample")
}

fn read_json(name: &str) -> serde_json::Value {
    let text = fs::read_to_string(fixture_dir().join(name)).expect("read fixture");
    serde_json::from_str(&text).expect("parse fixture")
}

#[test]
fn henrik_sample_normalizes_to_snapshot() {
    let response = FetchResult {
        status: Some(200),
        data: Some(ResponseBody::Json(read_json("match.json"))),
        url: "https://api.henrikdev.xyz/valorant/v4/matches/na/pc/AGreenFruit/PEPE".into(),
        error: None,
    };
    let player: PlayerRef = "AGreenFruit#PEPE".parse().expect("player ref");

    let record = HenrikAdapter::new(HenrikConfig::default())
        .normalize(&response, &player)
        .expect("record");
    let expected: MatchRecord = serde_json::from_value(read_json("snapshot.json")).expect("snapshot");

    assert_eq!(record, expected);
    assert_eq!(record.kd_ratio(), 1.47);
    assert!(record.is_victory());
}

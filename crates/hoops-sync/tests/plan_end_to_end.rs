use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use hoops_core::{ErrorKind, ErrorLog, Inventory, SeasonKey, ToPullManifest};
use hoops_sync::{create_inventory, get_data_to_pull, HoopsConfig, PlanRequest, StorageRoot};

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/rosters")
}

fn key(year: i32) -> SeasonKey {
    SeasonKey::from_start_year(year).unwrap()
}

fn touch_dir(root: &Path, rel: &str) {
    fs::create_dir_all(root.join(rel)).unwrap();
}

fn offline_config() -> HoopsConfig {
    HoopsConfig {
        bucket_name: None,
        storage_endpoint: Some("http://127.0.0.1:9".into()),
        stats_base_url: "http://127.0.0.1:9".into(),
        user_agent: "hoops-test".into(),
        http_timeout_secs: 1,
        request_interval_ms: 0,
    }
}

#[tokio::test]
async fn inventory_then_plan_against_captured_rosters() {
    let work = tempfile::tempdir().unwrap();
    let data = work.path().join("data/nba");
    touch_dir(&data, "GAME/REGULAR_SEASON/0022000001");
    fs::write(data.join("GAME/REGULAR_SEASON/0022000001/0022000001_advanced.csv"), "GAME_ID\n").unwrap();
    touch_dir(&data, "PLAYER/2544");
    touch_dir(&data, "SEASON/PER_GAME/REGULAR_SEASON/202021");
    touch_dir(&data, "SEASON/PER_GAME/PLAYOFFS");
    touch_dir(&data, "SEASON/PER_POSSESSION/REGULAR_SEASON/202021");
    touch_dir(&data, "SEASON/PER_POSSESSION/REGULAR_SEASON/202122");
    touch_dir(&data, "SEASON/PER_POSSESSION/PLAYOFFS");

    let config = offline_config();
    let inventory_path = work.path().join("data/meta/inventory.yaml");
    let summary = create_inventory(&StorageRoot::Local(data.clone()), &inventory_path, &config)
        .await
        .expect("inventory");
    assert_eq!(summary.players, 1);
    assert_eq!(summary.games, 1);

    let inventory: Inventory = serde_yaml::from_str(&fs::read_to_string(&inventory_path).unwrap()).unwrap();
    assert!(inventory.game.regular_season.contains("0022000001"));
    assert_eq!(inventory.season.per_possession.regular_season.len(), 2);
    assert!(inventory.season.per_game.playoffs.is_empty());

    let request = PlanRequest {
        inventory_path: inventory_path.clone(),
        output_path: work.path().join("data/meta/data_to_pull.yaml"),
        earliest_season_year: 2020,
        error_log_dir: work.path().join("data/logs/PLAN"),
        roster_fixtures: Some(fixtures_dir()),
        // March 2022 belongs to the 2021-22 season.
        today: NaiveDate::from_ymd_opt(2022, 3, 1).unwrap(),
    };
    let plan = get_data_to_pull(&request, &config).await.expect("plan");
    assert_eq!(plan.current_season, key(2021));
    assert_eq!(plan.seasons_scanned, 2);
    assert_eq!(plan.no_data, 1);
    assert_eq!(plan.fetch_failures, 0);

    let manifest: ToPullManifest =
        serde_yaml::from_str(&fs::read_to_string(&request.output_path).unwrap()).unwrap();
    assert_eq!(manifest.season.per_game.regular_season, vec![key(2021)]);
    assert_eq!(manifest.season.per_game.playoffs, vec![key(2020), key(2021)]);
    assert_eq!(manifest.season.per_possession.regular_season, vec![key(2021)]);
    assert_eq!(manifest.season.per_possession.playoffs, vec![key(2020), key(2021)]);

    assert_eq!(manifest.game.regular_season[&key(2021)].len(), 3);
    assert_eq!(
        manifest.game.playoffs[&key(2020)].iter().cloned().collect::<Vec<_>>(),
        vec!["0042000401"]
    );
    assert!(!manifest.game.playoffs.contains_key(&key(2021)));
    assert_eq!(
        manifest.player.iter().cloned().collect::<Vec<_>>(),
        vec!["1629029", "201939", "203507"]
    );

    let errors: ErrorLog =
        serde_yaml::from_str(&fs::read_to_string(work.path().join("data/logs/PLAN/2022-03-01.yaml")).unwrap())
            .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors.records[0].identifier, "202122");
    assert_eq!(errors.records[0].kind, ErrorKind::NoData);
}

#[tokio::test]
async fn malformed_inventory_aborts_planning() {
    let work = tempfile::tempdir().unwrap();
    let inventory_path = work.path().join("inventory.yaml");
    fs::write(&inventory_path, "PLAYER:\n  nested: {deeper: true}\n").unwrap();

    let request = PlanRequest {
        inventory_path,
        output_path: work.path().join("data_to_pull.yaml"),
        earliest_season_year: 2020,
        error_log_dir: work.path().join("logs"),
        roster_fixtures: Some(fixtures_dir()),
        today: NaiveDate::from_ymd_opt(2022, 3, 1).unwrap(),
    };
    let err = get_data_to_pull(&request, &offline_config()).await.unwrap_err();
    assert!(format!("{err:#}").contains("does not match the expected schema"));
    assert!(!request.output_path.exists());
}

#[tokio::test]
async fn missing_data_root_fails_instead_of_writing_empty_inventory() {
    let work = tempfile::tempdir().unwrap();
    let output = work.path().join("inventory.yaml");
    let result = create_inventory(
        &StorageRoot::Local(work.path().join("does-not-exist")),
        &output,
        &offline_config(),
    )
    .await;
    assert!(result.is_err());
    assert!(!output.exists());
}

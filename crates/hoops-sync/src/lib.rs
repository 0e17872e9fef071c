//! Inventory building, fetch planning and metadata archiving.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use hoops_adapters::{stats_provider_headers, FixtureRosterSource, RosterError, RosterSource, StatsApiRosterSource};
use hoops_core::{
    current_season, DirTree, ErrorKind, ErrorLog, ErrorRecord, IdSet, Inventory, SeasonKey, SeasonKeyError,
    SeasonType, Subject, ToPullManifest, SEASON_GRAINS,
};
use hoops_storage::{
    read_bytes, read_yaml, write_atomic, write_yaml, BucketConfig, BucketPrefixLister, HttpClientConfig,
    HttpFetcher, LocalDirLister, StorageError, StorageLister, TokenBucketConfig,
};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hoops-sync";

pub const INVENTORY_FILE: &str = "inventory.yaml";
pub const DATA_TO_PULL_FILE: &str = "data_to_pull.yaml";
pub const ARCHIVE_MANIFEST_FILE: &str = "archive_manifest.json";

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct HoopsConfig {
    pub bucket_name: Option<String>,
    /// S3-compatible endpoint override; AWS when unset.
    pub storage_endpoint: Option<String>,
    pub stats_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub request_interval_ms: u64,
}

impl HoopsConfig {
    pub fn from_env() -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            bucket_name: non_empty("BUCKET_NAME"),
            storage_endpoint: non_empty("HOOPS_STORAGE_ENDPOINT"),
            stats_base_url: non_empty("HOOPS_STATS_BASE_URL")
                .unwrap_or_else(|| hoops_adapters::DEFAULT_STATS_BASE_URL.to_string()),
            user_agent: non_empty("HOOPS_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: env_number("HOOPS_HTTP_TIMEOUT_SECS", non_empty("HOOPS_HTTP_TIMEOUT_SECS"), 30),
            request_interval_ms: env_number(
                "HOOPS_REQUEST_INTERVAL_MS",
                non_empty("HOOPS_REQUEST_INTERVAL_MS"),
                1000,
            ),
        }
    }

    /// Client for the stats provider: browser headers plus the per-request throttle.
    pub fn stats_http_config(&self) -> HttpClientConfig {
        let token_bucket = (self.request_interval_ms > 0)
            .then(|| TokenBucketConfig::min_interval(Duration::from_millis(self.request_interval_ms)));
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            default_headers: stats_provider_headers(),
            token_bucket,
            ..Default::default()
        }
    }

    pub fn bucket_config(&self, bucket: &str) -> BucketConfig {
        BucketConfig {
            endpoint: self.storage_endpoint.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            ..BucketConfig::new(bucket)
        }
    }
}

/// Parsed value of a numeric setting; an unparsable value falls back to `default`.
fn env_number(name: &str, raw: Option<String>, default: u64) -> u64 {
    match raw {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(setting = name, value = %raw, default, "ignoring non-numeric setting");
            default
        }),
        None => default,
    }
}

/// Where the collected data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageRoot {
    Local(PathBuf),
    Bucket { bucket: String, prefix: String },
}

impl StorageRoot {
    pub fn lister(&self, config: &HoopsConfig) -> Result<Box<dyn StorageLister>> {
        let lister: Box<dyn StorageLister> = match self {
            StorageRoot::Local(path) => Box::new(LocalDirLister::new(path.clone())),
            StorageRoot::Bucket { bucket, prefix } => {
                Box::new(BucketPrefixLister::s3(&config.bucket_config(bucket), prefix)?)
            }
        };
        Ok(lister)
    }
}

type TreeFuture<'a> = Pin<Box<dyn Future<Output = Result<DirTree, StorageError>> + Send + 'a>>;

/// Walks a storage hierarchy and records which identifiers already have data.
pub struct InventoryBuilder<'a> {
    lister: &'a dyn StorageLister,
}

impl<'a> InventoryBuilder<'a> {
    pub fn new(lister: &'a dyn StorageLister) -> Self {
        Self { lister }
    }

    pub async fn build_tree(&self) -> Result<DirTree, StorageError> {
        self.walk(Vec::new()).await
    }

    pub async fn build(&self) -> Result<Inventory, StorageError> {
        let tree = self.build_tree().await?;
        Ok(Inventory::from_tree(&tree))
    }

    fn walk(&self, segments: Vec<String>) -> TreeFuture<'_> {
        Box::pin(async move {
            let children = self.lister.list_children(&segments).await?;
            let mut nodes = BTreeMap::new();
            for child in children {
                let mut child_path = segments.clone();
                child_path.push(child.clone());
                let node = self.walk(child_path).await?;
                nodes.insert(child, node);
            }

            if nodes.values().all(DirTree::is_empty_leaf) {
                Ok(DirTree::Leaves(nodes.into_keys().collect()))
            } else {
                Ok(DirTree::Branch(nodes))
            }
        })
    }
}

/// Expected minus present; an empty difference still re-checks the current season,
/// which keeps picking up games while it is in progress.
pub fn missing_seasons(expected: &[SeasonKey], present: &IdSet, current: SeasonKey) -> Vec<SeasonKey> {
    let missing: Vec<SeasonKey> = expected
        .iter()
        .filter(|key| !present.contains(&key.to_string()))
        .copied()
        .collect();
    if missing.is_empty() {
        vec![current]
    } else {
        missing
    }
}

#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub current_season: SeasonKey,
    pub manifest: ToPullManifest,
    pub errors: ErrorLog,
    pub seasons_scanned: usize,
}

/// Diffs the expected identifier universe against an inventory.
pub struct FetchPlanner<'a> {
    roster: &'a dyn RosterSource,
}

impl<'a> FetchPlanner<'a> {
    pub fn new(roster: &'a dyn RosterSource) -> Self {
        Self { roster }
    }

    pub async fn plan(
        &self,
        inventory: &Inventory,
        earliest_season_year: i32,
        today: NaiveDate,
    ) -> Result<PlanOutcome, SeasonKeyError> {
        let current = current_season(today)?;
        let expected = SeasonKey::range_inclusive(earliest_season_year, current.start_year())?;

        let mut manifest = ToPullManifest::default();
        for grain in &SEASON_GRAINS {
            *manifest.season.grain_mut(grain) = missing_seasons(&expected, inventory.seasons(grain), current);
        }

        let mut errors = ErrorLog::default();
        let mut players = IdSet::new();
        let mut seasons_scanned = 0;

        for season_type in SeasonType::ALL {
            let seasons = manifest.season.per_game.get(season_type).to_vec();
            info!(season_type = season_type.slug(), seasons = seasons.len(), "scanning season rosters");
            let known_games = inventory.games(season_type);

            for season in seasons {
                match self.roster.list_season_roster(season, season_type).await {
                    Ok(roster) => {
                        seasons_scanned += 1;
                        let pending: IdSet = roster.game_ids.difference(known_games).cloned().collect();
                        info!(
                            %season,
                            season_type = season_type.slug(),
                            games = roster.game_ids.len(),
                            pending = pending.len(),
                            players = roster.player_ids.len(),
                            "season roster listed"
                        );
                        manifest.game.get_mut(season_type).insert(season, pending);
                        players.extend(roster.player_ids);
                    }
                    Err(err) => {
                        match &err {
                            RosterError::NoData { .. } => info!(%season, "{err}"),
                            RosterError::Fetch { .. } => warn!(%season, "{err}; retrying next run"),
                        }
                        errors.push(ErrorRecord {
                            subject: Subject::Season,
                            identifier: season.to_string(),
                            grain: Some(season_type.slug().to_string()),
                            kind: err.kind(),
                            message: err.to_string(),
                        });
                    }
                }
            }
        }

        manifest.player = players.difference(&inventory.player).cloned().collect();

        Ok(PlanOutcome {
            current_season: current,
            manifest,
            errors,
            seasons_scanned,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InventorySummary {
    pub run_id: Uuid,
    pub root: String,
    pub output: String,
    pub games: usize,
    pub players: usize,
    pub season_entries: usize,
}

pub async fn create_inventory(root: &StorageRoot, output: &Path, config: &HoopsConfig) -> Result<InventorySummary> {
    let run_id = Uuid::new_v4();
    let lister = root.lister(config)?;
    info!(%run_id, root = %lister.describe(), "building inventory");

    let inventory = InventoryBuilder::new(lister.as_ref())
        .build()
        .await
        .with_context(|| format!("walking {}", lister.describe()))?;

    info!(output = %output.display(), "saving inventory");
    write_yaml(output, &inventory).await?;

    Ok(InventorySummary {
        run_id,
        root: lister.describe(),
        output: output.display().to_string(),
        games: SeasonType::ALL.iter().map(|t| inventory.games(*t).len()).sum(),
        players: inventory.player.len(),
        season_entries: SEASON_GRAINS.iter().map(|g| inventory.seasons(g).len()).sum(),
    })
}

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub inventory_path: PathBuf,
    pub output_path: PathBuf,
    pub earliest_season_year: i32,
    pub error_log_dir: PathBuf,
    pub roster_fixtures: Option<PathBuf>,
    pub today: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub run_id: Uuid,
    pub current_season: SeasonKey,
    pub seasons_scanned: usize,
    pub games_to_pull: usize,
    pub players_to_pull: usize,
    pub fetch_failures: usize,
    pub no_data: usize,
    pub output: String,
    pub error_log: String,
}

pub async fn get_data_to_pull(request: &PlanRequest, config: &HoopsConfig) -> Result<PlanSummary> {
    let run_id = Uuid::new_v4();
    info!(%run_id, inventory = %request.inventory_path.display(), "reading inventory");
    let inventory: Inventory = read_yaml(&request.inventory_path).await?;

    let roster: Box<dyn RosterSource> = match &request.roster_fixtures {
        Some(dir) => Box::new(FixtureRosterSource::new(dir.clone())),
        None => {
            let http = HttpFetcher::new(config.stats_http_config())?;
            Box::new(StatsApiRosterSource::new(http, config.stats_base_url.clone(), run_id))
        }
    };
    info!(source = roster.source_id(), "planning fetches");

    let outcome = FetchPlanner::new(roster.as_ref())
        .plan(&inventory, request.earliest_season_year, request.today)
        .await
        .context("computing expected seasons")?;

    info!(output = %request.output_path.display(), "saving data to pull");
    write_yaml(&request.output_path, &outcome.manifest).await?;

    let error_log_path = request
        .error_log_dir
        .join(format!("{}.yaml", request.today.format("%Y-%m-%d")));
    write_yaml(&error_log_path, &outcome.errors).await?;
    if !outcome.errors.is_empty() {
        warn!(
            errors = outcome.errors.len(),
            path = %error_log_path.display(),
            "some seasons were skipped"
        );
    }

    Ok(PlanSummary {
        run_id,
        current_season: outcome.current_season,
        seasons_scanned: outcome.seasons_scanned,
        games_to_pull: outcome.manifest.game.total(),
        players_to_pull: outcome.manifest.player.len(),
        fetch_failures: outcome.errors.count(ErrorKind::FetchFailed),
        no_data: outcome.errors.count(ErrorKind::NoData),
        output: request.output_path.display().to_string(),
        error_log: error_log_path.display().to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveManifest {
    pub schema_version: u32,
    pub archived_on: NaiveDate,
    pub files: Vec<ArchiveEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveEntry {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Copy the current inventory and to-pull manifest into `out_dir/<date>/`.
pub async fn copy_previous_meta(meta_dir: &Path, out_dir: &Path, today: NaiveDate) -> Result<PathBuf> {
    let archive_dir = out_dir.join(today.format("%Y-%m-%d").to_string());
    let mut files = Vec::new();

    for name in [INVENTORY_FILE, DATA_TO_PULL_FILE] {
        let source = meta_dir.join(name);
        let bytes = read_bytes(&source).await?;
        serde_yaml::from_slice::<serde_yaml::Value>(&bytes)
            .with_context(|| format!("parsing {}", source.display()))?;

        let stored = write_atomic(&archive_dir.join(name), &bytes).await?;
        info!(file = name, path = %stored.path.display(), "archived");
        files.push(ArchiveEntry {
            name: name.trim_end_matches(".yaml").to_string(),
            path: name.to_string(),
            sha256: stored.content_hash,
            bytes: stored.byte_size as u64,
        });
    }

    let manifest = ArchiveManifest {
        schema_version: 1,
        archived_on: today,
        files,
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing archive manifest")?;
    write_atomic(&archive_dir.join(ARCHIVE_MANIFEST_FILE), &bytes).await?;

    Ok(archive_dir)
}

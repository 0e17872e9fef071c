//! Season roster sources: the stats provider's league game log and offline fixtures.

use std::path::PathBuf;

use async_trait::async_trait;
use hoops_core::{ErrorKind, IdSet, SeasonKey, SeasonType};
use hoops_storage::HttpFetcher;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hoops-adapters";

pub const DEFAULT_STATS_BASE_URL: &str = "https://stats.nba.com/stats";

const GAME_ID_COLUMN: &str = "GAME_ID";
const PLAYER_ID_COLUMN: &str = "PLAYER_ID";

/// Game and player identifiers observed in one season.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonRoster {
    pub game_ids: IdSet,
    pub player_ids: IdSet,
}

impl SeasonRoster {
    pub fn is_empty(&self) -> bool {
        self.game_ids.is_empty() && self.player_ids.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("no {} data for season {season}", season_type.api_label())]
    NoData {
        season: SeasonKey,
        season_type: SeasonType,
    },
    #[error("fetching season {season}: {message}")]
    Fetch { season: SeasonKey, message: String },
}

impl RosterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RosterError::NoData { .. } => ErrorKind::NoData,
            RosterError::Fetch { .. } => ErrorKind::FetchFailed,
        }
    }
}

#[async_trait]
pub trait RosterSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn list_season_roster(
        &self,
        season: SeasonKey,
        season_type: SeasonType,
    ) -> Result<SeasonRoster, RosterError>;
}

#[derive(Debug, Error)]
pub enum GameLogError {
    #[error("decoding game log: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("game log has no result set with {0}")]
    MissingColumn(&'static str),
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(rename = "resultSets")]
    result_sets: Vec<ResultSet>,
}

#[derive(Debug, Deserialize)]
struct ResultSet {
    headers: Vec<String>,
    #[serde(rename = "rowSet", default)]
    row_set: Vec<Vec<JsonValue>>,
}

/// Extract game and player identifiers from a league game log response.
pub fn parse_league_game_log(body: &[u8]) -> Result<SeasonRoster, GameLogError> {
    let response: StatsResponse = serde_json::from_slice(body)?;
    let Some((result_set, game_col, player_col)) = response.result_sets.iter().find_map(|set| {
        let game_col = set.headers.iter().position(|h| h == GAME_ID_COLUMN)?;
        let player_col = set.headers.iter().position(|h| h == PLAYER_ID_COLUMN)?;
        Some((set, game_col, player_col))
    }) else {
        let has_game = response
            .result_sets
            .iter()
            .any(|set| set.headers.iter().any(|h| h == GAME_ID_COLUMN));
        return Err(GameLogError::MissingColumn(if has_game {
            PLAYER_ID_COLUMN
        } else {
            GAME_ID_COLUMN
        }));
    };

    let mut roster = SeasonRoster::default();
    for row in &result_set.row_set {
        if let Some(id) = row.get(game_col).and_then(cell_to_id) {
            roster.game_ids.insert(id);
        }
        if let Some(id) = row.get(player_col).and_then(cell_to_id) {
            roster.player_ids.insert(id);
        }
    }
    Ok(roster)
}

fn cell_to_id(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(match n.as_i64() {
            Some(i) => i.to_string(),
            None => n.to_string(),
        }),
        _ => None,
    }
}

/// Headers the stats provider insists on before it answers.
pub fn stats_provider_headers() -> Vec<(String, String)> {
    [
        ("Accept", "application/json, text/plain, */*"),
        ("Accept-Language", "en-US,en;q=0.9"),
        ("Origin", "https://www.nba.com"),
        ("Referer", "https://www.nba.com/"),
        ("x-nba-stats-origin", "stats"),
        ("x-nba-stats-token", "true"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Roster listing backed by the provider's `leaguegamelog` endpoint.
#[derive(Debug)]
pub struct StatsApiRosterSource {
    http: HttpFetcher,
    base_url: String,
    run_id: Uuid,
}

impl StatsApiRosterSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            run_id,
        }
    }

    pub fn game_log_url(&self, season: SeasonKey, season_type: SeasonType) -> Result<Url, RosterError> {
        let label = season.api_label();
        Url::parse_with_params(
            &format!("{}/leaguegamelog", self.base_url),
            &[
                ("Counter", "0"),
                ("Direction", "DESC"),
                ("LeagueID", "00"),
                ("PlayerOrTeam", "P"),
                ("Season", label.as_str()),
                ("SeasonType", season_type.api_label()),
                ("Sorter", "DATE"),
            ],
        )
        .map_err(|err| RosterError::Fetch {
            season,
            message: format!("building game log url: {err}"),
        })
    }
}

#[async_trait]
impl RosterSource for StatsApiRosterSource {
    fn source_id(&self) -> &'static str {
        "stats-api"
    }

    async fn list_season_roster(
        &self,
        season: SeasonKey,
        season_type: SeasonType,
    ) -> Result<SeasonRoster, RosterError> {
        let url = self.game_log_url(season, season_type)?;
        let response = self
            .http
            .fetch_bytes(self.run_id, self.source_id(), url.as_str())
            .await
            .map_err(|err| RosterError::Fetch {
                season,
                message: err.to_string(),
            })?;

        let roster = parse_league_game_log(&response.body).map_err(|err| RosterError::Fetch {
            season,
            message: err.to_string(),
        })?;
        debug!(
            %season,
            season_type = season_type.slug(),
            games = roster.game_ids.len(),
            players = roster.player_ids.len(),
            "parsed league game log"
        );
        if roster.is_empty() {
            return Err(RosterError::NoData {
                season,
                season_type,
            });
        }
        Ok(roster)
    }
}

pub fn fixture_file_name(season: SeasonKey, season_type: SeasonType) -> String {
    format!("{season}_{}.json", season_type.slug())
}

/// Roster listing served from captured game log responses on disk.
#[derive(Debug, Clone)]
pub struct FixtureRosterSource {
    dir: PathBuf,
}

impl FixtureRosterSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl RosterSource for FixtureRosterSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn list_season_roster(
        &self,
        season: SeasonKey,
        season_type: SeasonType,
    ) -> Result<SeasonRoster, RosterError> {
        let path = self.dir.join(fixture_file_name(season, season_type));
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RosterError::NoData {
                    season,
                    season_type,
                })
            }
            Err(err) => {
                return Err(RosterError::Fetch {
                    season,
                    message: format!("reading {}: {err}", path.display()),
                })
            }
        };

        let roster = parse_league_game_log(&body).map_err(|err| RosterError::Fetch {
            season,
            message: format!("{}: {err}", path.display()),
        })?;
        if roster.is_empty() {
            return Err(RosterError::NoData {
                season,
                season_type,
            });
        }
        Ok(roster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use hoops_storage::{BackoffPolicy, HttpClientConfig};
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn key(year: i32) -> SeasonKey {
        SeasonKey::from_start_year(year).unwrap()
    }

    /// Answers every request with `status`/`body` and reports the request line.
    async fn serve_once(status: u16, body: &'static str) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let _ = tx.send(request.lines().next().unwrap_or_default().to_string());
                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}"), rx)
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            default_headers: stats_provider_headers(),
            backoff: BackoffPolicy {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        })
        .expect("fetcher")
    }

    const GAME_LOG: &str = r#"{"resultSets":[{"name":"LeagueGameLog",
        "headers":["SEASON_ID","PLAYER_ID","GAME_ID","PTS"],
        "rowSet":[["22020",2544,"0022000001",25],["22020",2544,"0022000002",31],["22020","201939","0022000001",40]]}]}"#;

    #[test]
    fn game_log_ids_are_strings_regardless_of_cell_type() {
        let roster = parse_league_game_log(GAME_LOG.as_bytes()).unwrap();
        assert_eq!(
            roster.game_ids.iter().cloned().collect::<Vec<_>>(),
            vec!["0022000001", "0022000002"]
        );
        assert_eq!(
            roster.player_ids.iter().cloned().collect::<Vec<_>>(),
            vec!["201939", "2544"]
        );
    }

    #[test]
    fn game_log_without_player_column_is_rejected() {
        let body = br#"{"resultSets":[{"headers":["GAME_ID"],"rowSet":[["1"]]}]}"#;
        assert!(matches!(
            parse_league_game_log(body),
            Err(GameLogError::MissingColumn(PLAYER_ID_COLUMN))
        ));
        assert!(matches!(
            parse_league_game_log(b"<html>blocked</html>"),
            Err(GameLogError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn fixture_source_distinguishes_missing_and_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(fixture_file_name(key(2020), SeasonType::Playoffs)),
            r#"{"resultSets":[{"headers":["PLAYER_ID","GAME_ID"],"rowSet":[]}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join(fixture_file_name(key(2020), SeasonType::RegularSeason)),
            GAME_LOG,
        )
        .unwrap();
        std::fs::write(
            dir.path().join(fixture_file_name(key(2019), SeasonType::RegularSeason)),
            "not json",
        )
        .unwrap();
        let source = FixtureRosterSource::new(dir.path());

        let roster = source
            .list_season_roster(key(2020), SeasonType::RegularSeason)
            .await
            .unwrap();
        assert_eq!(roster.game_ids.len(), 2);

        let empty = source
            .list_season_roster(key(2020), SeasonType::Playoffs)
            .await
            .unwrap_err();
        assert_eq!(empty.kind(), ErrorKind::NoData);

        let missing = source
            .list_season_roster(key(2021), SeasonType::RegularSeason)
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NoData);

        let broken = source
            .list_season_roster(key(2019), SeasonType::RegularSeason)
            .await
            .unwrap_err();
        assert_eq!(broken.kind(), ErrorKind::FetchFailed);
    }

    #[tokio::test]
    async fn stats_source_requests_season_label_and_type() {
        let (base, mut requests) = serve_once(200, GAME_LOG).await;
        let source = StatsApiRosterSource::new(fetcher(), base, Uuid::new_v4());

        let roster = source
            .list_season_roster(key(2020), SeasonType::Playoffs)
            .await
            .unwrap();
        assert_eq!(roster.player_ids.len(), 2);

        let request_line = requests.recv().await.unwrap();
        assert!(request_line.starts_with("GET /leaguegamelog?"), "{request_line}");
        assert!(request_line.contains("Season=2020-21"), "{request_line}");
        assert!(request_line.contains("SeasonType=Playoffs"), "{request_line}");
        assert!(request_line.contains("PlayerOrTeam=P"), "{request_line}");
    }

    #[tokio::test]
    async fn stats_source_maps_server_errors_to_fetch_failures() {
        let (base, _requests) = serve_once(503, "{}").await;
        let source = StatsApiRosterSource::new(fetcher(), base, Uuid::new_v4());
        let err = source
            .list_season_roster(key(2019), SeasonType::RegularSeason)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FetchFailed);
        assert!(err.to_string().contains("201920"));
    }
}

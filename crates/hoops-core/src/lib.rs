//! Core domain model for hoops: season keys, inventory and to-pull manifests.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "hoops-core";

pub const MIN_SEASON_YEAR: i32 = 1000;
pub const MAX_SEASON_YEAR: i32 = 9998;

/// Last calendar month that still belongs to the season started the year before.
pub const SEASON_CUTOFF_MONTH: u32 = 9;

/// Identifier set used for every inventory leaf.
pub type IdSet = BTreeSet<String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeasonKeyError {
    #[error("season year {0} is outside {MIN_SEASON_YEAR}..={MAX_SEASON_YEAR}")]
    OutOfRange(i32),
    #[error("malformed season key {0:?}")]
    Malformed(String),
}

/// Six-digit season identifier: starting year plus the zero-padded last two
/// digits of the following year (`2020` -> `"202021"`, `1999` -> `"199900"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeasonKey {
    start_year: i32,
}

impl SeasonKey {
    pub fn from_start_year(start_year: i32) -> Result<Self, SeasonKeyError> {
        if !(MIN_SEASON_YEAR..=MAX_SEASON_YEAR).contains(&start_year) {
            return Err(SeasonKeyError::OutOfRange(start_year));
        }
        Ok(Self { start_year })
    }

    pub fn start_year(&self) -> i32 {
        self.start_year
    }

    fn suffix(&self) -> i32 {
        (self.start_year + 1) % 100
    }

    /// Season label the stats provider expects, e.g. `"2020-21"`.
    pub fn api_label(&self) -> String {
        format!("{:04}-{:02}", self.start_year, self.suffix())
    }

    /// Contiguous keys from `first` through `last`; empty when `first > last`.
    pub fn range_inclusive(first: i32, last: i32) -> Result<Vec<SeasonKey>, SeasonKeyError> {
        if first > last {
            return Ok(Vec::new());
        }
        Self::from_start_year(first)?;
        Self::from_start_year(last)?;
        Ok((first..=last).map(|start_year| SeasonKey { start_year }).collect())
    }
}

impl fmt::Display for SeasonKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}", self.start_year, self.suffix())
    }
}

impl FromStr for SeasonKey {
    type Err = SeasonKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || SeasonKeyError::Malformed(s.to_string());
        if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let start_year: i32 = s[0..4].parse().map_err(|_| malformed())?;
        let suffix: i32 = s[4..6].parse().map_err(|_| malformed())?;
        let key = Self::from_start_year(start_year)?;
        if key.suffix() != suffix {
            return Err(malformed());
        }
        Ok(key)
    }
}

impl Serialize for SeasonKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SeasonKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Most recently started season year as of `today`.
pub fn current_season_year(today: NaiveDate) -> i32 {
    if today.month() <= SEASON_CUTOFF_MONTH {
        today.year() - 1
    } else {
        today.year()
    }
}

pub fn current_season(today: NaiveDate) -> Result<SeasonKey, SeasonKeyError> {
    SeasonKey::from_start_year(current_season_year(today))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeasonType {
    RegularSeason,
    Playoffs,
}

impl SeasonType {
    pub const ALL: [SeasonType; 2] = [SeasonType::RegularSeason, SeasonType::Playoffs];

    pub fn api_label(self) -> &'static str {
        match self {
            SeasonType::RegularSeason => "Regular Season",
            SeasonType::Playoffs => "Playoffs",
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            SeasonType::RegularSeason => "REGULAR_SEASON",
            SeasonType::Playoffs => "PLAYOFFS",
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            SeasonType::RegularSeason => "regular_season",
            SeasonType::Playoffs => "playoffs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeasonMode {
    PerGame,
    PerPossession,
}

impl SeasonMode {
    pub fn dir_name(self) -> &'static str {
        match self {
            SeasonMode::PerGame => "PER_GAME",
            SeasonMode::PerPossession => "PER_POSSESSION",
        }
    }
}

/// One season output grain: a stat mode crossed with a season type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeasonGrain {
    pub name: &'static str,
    pub mode: SeasonMode,
    pub season_type: SeasonType,
}

impl SeasonGrain {
    /// Directory path of this grain below the data root.
    pub fn inventory_path(&self) -> [&'static str; 3] {
        ["SEASON", self.mode.dir_name(), self.season_type.dir_name()]
    }
}

pub const SEASON_GRAINS: [SeasonGrain; 4] = [
    SeasonGrain {
        name: "regular_season_pergame",
        mode: SeasonMode::PerGame,
        season_type: SeasonType::RegularSeason,
    },
    SeasonGrain {
        name: "playoffs_pergame",
        mode: SeasonMode::PerGame,
        season_type: SeasonType::Playoffs,
    },
    SeasonGrain {
        name: "regular_season_perpossession",
        mode: SeasonMode::PerPossession,
        season_type: SeasonType::RegularSeason,
    },
    SeasonGrain {
        name: "playoffs_perpossession",
        mode: SeasonMode::PerPossession,
        season_type: SeasonType::Playoffs,
    },
];

/// Directory listing shape: a directory whose children are all leaves collapses
/// into the set of their names, anything deeper stays a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DirTree {
    Leaves(IdSet),
    Branch(BTreeMap<String, DirTree>),
}

impl Default for DirTree {
    fn default() -> Self {
        DirTree::Leaves(IdSet::new())
    }
}

impl DirTree {
    pub fn is_empty_leaf(&self) -> bool {
        matches!(self, DirTree::Leaves(names) if names.is_empty())
    }

    /// Names recorded at `path`. A branch contributes its keys; an absent path,
    /// or one whose parent collapsed into a set, has no names.
    pub fn names_at(&self, path: &[&str]) -> IdSet {
        let mut node = self;
        for segment in path {
            match node {
                DirTree::Branch(children) => match children.get(*segment) {
                    Some(child) => node = child,
                    None => return IdSet::new(),
                },
                DirTree::Leaves(_) => return IdSet::new(),
            }
        }
        match node {
            DirTree::Leaves(names) => names.clone(),
            DirTree::Branch(children) => children.keys().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonTypeSets {
    #[serde(rename = "REGULAR_SEASON", default)]
    pub regular_season: IdSet,
    #[serde(rename = "PLAYOFFS", default)]
    pub playoffs: IdSet,
}

impl SeasonTypeSets {
    pub fn get(&self, season_type: SeasonType) -> &IdSet {
        match season_type {
            SeasonType::RegularSeason => &self.regular_season,
            SeasonType::Playoffs => &self.playoffs,
        }
    }

    pub fn get_mut(&mut self, season_type: SeasonType) -> &mut IdSet {
        match season_type {
            SeasonType::RegularSeason => &mut self.regular_season,
            SeasonType::Playoffs => &mut self.playoffs,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonInventory {
    #[serde(rename = "PER_GAME", default)]
    pub per_game: SeasonTypeSets,
    #[serde(rename = "PER_POSSESSION", default)]
    pub per_possession: SeasonTypeSets,
}

impl SeasonInventory {
    pub fn get(&self, mode: SeasonMode) -> &SeasonTypeSets {
        match mode {
            SeasonMode::PerGame => &self.per_game,
            SeasonMode::PerPossession => &self.per_possession,
        }
    }

    pub fn get_mut(&mut self, mode: SeasonMode) -> &mut SeasonTypeSets {
        match mode {
            SeasonMode::PerGame => &mut self.per_game,
            SeasonMode::PerPossession => &mut self.per_possession,
        }
    }
}

/// Identifiers already persisted, by category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(rename = "GAME", default)]
    pub game: SeasonTypeSets,
    #[serde(rename = "PLAYER", default)]
    pub player: IdSet,
    #[serde(rename = "SEASON", default)]
    pub season: SeasonInventory,
}

impl Inventory {
    /// Project a storage walk onto the fixed inventory schema.
    pub fn from_tree(tree: &DirTree) -> Self {
        let mut inventory = Inventory {
            player: tree.names_at(&["PLAYER"]),
            ..Default::default()
        };
        for season_type in SeasonType::ALL {
            *inventory.game.get_mut(season_type) = tree.names_at(&["GAME", season_type.dir_name()]);
        }
        for grain in &SEASON_GRAINS {
            *inventory
                .season
                .get_mut(grain.mode)
                .get_mut(grain.season_type) = tree.names_at(&grain.inventory_path());
        }
        inventory
    }

    pub fn games(&self, season_type: SeasonType) -> &IdSet {
        self.game.get(season_type)
    }

    pub fn seasons(&self, grain: &SeasonGrain) -> &IdSet {
        self.season.get(grain.mode).get(grain.season_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GamesToPull {
    #[serde(default)]
    pub regular_season: BTreeMap<SeasonKey, IdSet>,
    #[serde(default)]
    pub playoffs: BTreeMap<SeasonKey, IdSet>,
}

impl GamesToPull {
    pub fn get(&self, season_type: SeasonType) -> &BTreeMap<SeasonKey, IdSet> {
        match season_type {
            SeasonType::RegularSeason => &self.regular_season,
            SeasonType::Playoffs => &self.playoffs,
        }
    }

    pub fn get_mut(&mut self, season_type: SeasonType) -> &mut BTreeMap<SeasonKey, IdSet> {
        match season_type {
            SeasonType::RegularSeason => &mut self.regular_season,
            SeasonType::Playoffs => &mut self.playoffs,
        }
    }

    pub fn total(&self) -> usize {
        self.regular_season
            .values()
            .chain(self.playoffs.values())
            .map(BTreeSet::len)
            .sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonTypeLists {
    #[serde(default)]
    pub regular_season: Vec<SeasonKey>,
    #[serde(default)]
    pub playoffs: Vec<SeasonKey>,
}

impl SeasonTypeLists {
    pub fn get(&self, season_type: SeasonType) -> &[SeasonKey] {
        match season_type {
            SeasonType::RegularSeason => &self.regular_season,
            SeasonType::Playoffs => &self.playoffs,
        }
    }

    pub fn get_mut(&mut self, season_type: SeasonType) -> &mut Vec<SeasonKey> {
        match season_type {
            SeasonType::RegularSeason => &mut self.regular_season,
            SeasonType::Playoffs => &mut self.playoffs,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonsToPull {
    #[serde(default)]
    pub per_game: SeasonTypeLists,
    #[serde(default)]
    pub per_possession: SeasonTypeLists,
}

impl SeasonsToPull {
    pub fn grain(&self, grain: &SeasonGrain) -> &[SeasonKey] {
        self.mode(grain.mode).get(grain.season_type)
    }

    pub fn grain_mut(&mut self, grain: &SeasonGrain) -> &mut Vec<SeasonKey> {
        match grain.mode {
            SeasonMode::PerGame => self.per_game.get_mut(grain.season_type),
            SeasonMode::PerPossession => self.per_possession.get_mut(grain.season_type),
        }
    }

    fn mode(&self, mode: SeasonMode) -> &SeasonTypeLists {
        match mode {
            SeasonMode::PerGame => &self.per_game,
            SeasonMode::PerPossession => &self.per_possession,
        }
    }
}

/// Identifiers the next ingestion run has to fetch; mirrors the inventory schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToPullManifest {
    #[serde(default)]
    pub game: GamesToPull,
    #[serde(default)]
    pub player: IdSet,
    #[serde(default)]
    pub season: SeasonsToPull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Season,
    Game,
    Player,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The provider has nothing for the identifier (e.g. a season not yet played).
    NoData,
    /// Transport or provider failure; retried on the next run.
    FetchFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub subject: Subject,
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grain: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorLog {
    pub records: Vec<ErrorRecord>,
}

impl ErrorLog {
    pub fn push(&mut self, record: ErrorRecord) {
        self.records.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn count(&self, kind: ErrorKind) -> usize {
        self.records.iter().filter(|r| r.kind == kind).count()
    }
}

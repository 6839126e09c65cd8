use std::collections::HashMap;

use chrono::NaiveDate;

use crate::config::StatType;
use crate::error::EngineError;
use crate::store::{GameRecord, LineupRecord, TeamGameRecord};
use crate::table::FeatureTable;

pub const POINTS_FEATURES: [&str; 18] = [
    "avg_minutes_last5",
    "avg_minutes_last10",
    "avg_points_last5",
    "avg_points_last10",
    "std_points_last10",
    "avg_assists_last5",
    "avg_rebounds_last5",
    "avg_points_per_min_last5",
    "days_since_last_game",
    "is_back_to_back",
    "is_home",
    "games_played_season",
    "team_points_avg_last5",
    "team_points_avg_last10",
    "opponent_points_allowed_last5",
    "lineup_net_rating",
    "lineup_pace",
    "pred_minutes",
];

pub const ASSISTS_FEATURES: [&str; 18] = [
    "avg_minutes_last5",
    "avg_minutes_last10",
    "avg_assists_last5",
    "avg_assists_last10",
    "std_assists_last10",
    "avg_points_last5",
    "avg_turnovers_last5",
    "avg_assists_per_min_last5",
    "days_since_last_game",
    "is_back_to_back",
    "is_home",
    "games_played_season",
    "team_assists_avg_last5",
    "team_assists_avg_last10",
    "opponent_assists_allowed_last5",
    "lineup_net_rating",
    "lineup_pace",
    "pred_minutes",
];

pub const REBOUNDS_FEATURES: [&str; 17] = [
    "avg_minutes_last5",
    "avg_minutes_last10",
    "avg_rebounds_last5",
    "avg_rebounds_last10",
    "std_rebounds_last10",
    "avg_points_last5",
    "avg_rebounds_per_min_last5",
    "days_since_last_game",
    "is_back_to_back",
    "is_home",
    "games_played_season",
    "team_rebounds_avg_last5",
    "team_rebounds_avg_last10",
    "opponent_rebounds_allowed_last5",
    "lineup_net_rating",
    "lineup_pace",
    "pred_minutes",
];

/// Features for the auxiliary minutes projection; deliberately free of any
/// column that depends on the target game's box score.
pub const MINUTES_FEATURES: [&str; 6] = [
    "avg_minutes_last5",
    "avg_minutes_last10",
    "days_since_last_game",
    "is_back_to_back",
    "is_home",
    "games_played_season",
];

const TABLE_COLUMNS: [&str; 42] = [
    "minutes",
    "points",
    "assists",
    "rebounds",
    "steals",
    "blocks",
    "turnovers",
    "avg_points_last5",
    "avg_points_last10",
    "std_points_last10",
    "avg_assists_last5",
    "avg_assists_last10",
    "std_assists_last10",
    "avg_rebounds_last5",
    "avg_rebounds_last10",
    "std_rebounds_last10",
    "avg_minutes_last5",
    "avg_minutes_last10",
    "avg_turnovers_last5",
    "avg_points_per_min_last5",
    "avg_assists_per_min_last5",
    "avg_rebounds_per_min_last5",
    "days_since_last_game",
    "is_back_to_back",
    "is_home",
    "games_played_season",
    "team_points_avg_last5",
    "team_points_avg_last10",
    "opponent_points_allowed_last5",
    "team_assists_avg_last5",
    "team_assists_avg_last10",
    "opponent_assists_allowed_last5",
    "team_rebounds_avg_last5",
    "team_rebounds_avg_last10",
    "opponent_rebounds_allowed_last5",
    "lineup_off_rating",
    "lineup_def_rating",
    "lineup_net_rating",
    "lineup_pace",
    "lineup_ast_pct",
    "lineup_reb_pct",
    "pred_minutes",
];

pub fn stat_features(stat: StatType) -> &'static [&'static str] {
    match stat {
        StatType::Points => &POINTS_FEATURES,
        StatType::Assists => &ASSISTS_FEATURES,
        StatType::Rebounds => &REBOUNDS_FEATURES,
    }
}

/// Home side is the left token of "BOS vs. LAL"; "BOS @ LAL" means away.
pub fn parse_is_home(matchup: &str) -> Result<bool, EngineError> {
    if matchup.contains(" vs. ") {
        Ok(true)
    } else if matchup.contains(" @ ") {
        Ok(false)
    } else {
        Err(EngineError::Configuration(format!(
            "matchup {matchup:?} has no ' vs. ' or ' @ ' separator"
        )))
    }
}

pub fn parse_opponent_team(matchup: &str) -> Option<&str> {
    if let Some((_, opp)) = matchup.split_once(" vs. ") {
        return Some(opp.trim());
    }
    if let Some((_, opp)) = matchup.split_once(" @ ") {
        return Some(opp.trim());
    }
    None
}

/// A live-prediction target: one player in one scheduled game.
#[derive(Debug, Clone)]
pub struct ServeCandidate {
    pub player_id: i64,
    pub game_id: String,
    pub game_date: NaiveDate,
    pub matchup: String,
    pub team_abbreviation: String,
}

#[derive(Debug, Clone, Copy, Default)]
struct TeamFeatureVals {
    points_avg_last5: Option<f64>,
    points_avg_last10: Option<f64>,
    assists_avg_last5: Option<f64>,
    assists_avg_last10: Option<f64>,
    rebounds_avg_last5: Option<f64>,
    rebounds_avg_last10: Option<f64>,
    allowed_points_last5: Option<f64>,
    allowed_assists_last5: Option<f64>,
    allowed_rebounds_last5: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct LineupFeatureVals {
    off_rating: f64,
    def_rating: f64,
    net_rating: f64,
    pace: f64,
    ast_pct: f64,
    reb_pct: f64,
}

#[derive(Debug, Clone, Copy)]
struct TeamGameTotals {
    date: NaiveDate,
    totals: [f64; 3],
    allowed: Option<[f64; 3]>,
}

/// Turns raw history into causal, point-in-time feature rows.
///
/// All rolling statistics are shifted by one game so a row never sees its own
/// outcome; serve-time lookups only consult rows dated strictly before the
/// target date.
pub struct FeatureBuilder {
    games: Vec<GameRecord>,
    team_history: HashMap<String, Vec<(String, TeamGameTotals)>>,
    team_by_game: HashMap<(String, String), TeamFeatureVals>,
    lineup_by_team: HashMap<String, LineupFeatureVals>,
}

impl FeatureBuilder {
    pub fn new(
        mut games: Vec<GameRecord>,
        team_games: Vec<TeamGameRecord>,
        lineups: Vec<LineupRecord>,
    ) -> Self {
        games.sort_by(|a, b| {
            a.player_id
                .cmp(&b.player_id)
                .then_with(|| a.game_date.cmp(&b.game_date))
                .then_with(|| a.game_id.cmp(&b.game_id))
        });

        let team_history = build_team_history(&games, &team_games);
        let team_by_game = build_team_feature_map(&team_history);
        let lineup_by_team = build_lineup_features(&lineups);

        Self {
            games,
            team_history,
            team_by_game,
            lineup_by_team,
        }
    }

    pub fn table_columns() -> &'static [&'static str] {
        &TABLE_COLUMNS
    }

    /// Build the full training table: one row per (player, game), rolling
    /// features computed from strictly prior games. Rows keep `None` for
    /// undefined features; training selection drops them later.
    pub fn training_table(&self) -> Result<FeatureTable, EngineError> {
        let mut table = FeatureTable::new(&TABLE_COLUMNS);
        let col = ColumnIds::resolve(&table)?;

        let mut start = 0usize;
        while start < self.games.len() {
            let player_id = self.games[start].player_id;
            let mut end = start;
            while end < self.games.len() && self.games[end].player_id == player_id {
                end += 1;
            }
            self.push_player_rows(&mut table, &col, &self.games[start..end])?;
            start = end;
        }

        table.sort_by_date();
        Ok(table)
    }

    /// Serve-time feature row for one candidate. Fails with
    /// `DataInsufficiency` when the player has no game strictly before the
    /// target date.
    pub fn serve_row(
        &self,
        table: &mut FeatureTable,
        candidate: &ServeCandidate,
    ) -> Result<usize, EngineError> {
        let col = ColumnIds::resolve(table)?;
        let history: Vec<&GameRecord> = self
            .games
            .iter()
            .filter(|g| g.player_id == candidate.player_id && g.game_date < candidate.game_date)
            .collect();
        if history.is_empty() {
            return Err(EngineError::DataInsufficiency {
                player_id: candidate.player_id,
                detail: format!("no games before {}", candidate.game_date),
            });
        }

        let points: Vec<f64> = history.iter().map(|g| g.points).collect();
        let assists: Vec<f64> = history.iter().map(|g| g.assists).collect();
        let rebounds: Vec<f64> = history.iter().map(|g| g.rebounds).collect();
        let minutes: Vec<f64> = history.iter().map(|g| g.minutes).collect();
        let turnovers: Vec<f64> = history.iter().map(|g| g.turnovers).collect();

        let mut buf = table.row_buffer();
        let avg_min5 = mean_last(&minutes, 5);
        set(&mut buf, col.avg_points_last5, mean_last(&points, 5));
        set(&mut buf, col.avg_points_last10, mean_last(&points, 10));
        set(&mut buf, col.std_points_last10, std_last(&points, 10));
        set(&mut buf, col.avg_assists_last5, mean_last(&assists, 5));
        set(&mut buf, col.avg_assists_last10, mean_last(&assists, 10));
        set(&mut buf, col.std_assists_last10, std_last(&assists, 10));
        set(&mut buf, col.avg_rebounds_last5, mean_last(&rebounds, 5));
        set(&mut buf, col.avg_rebounds_last10, mean_last(&rebounds, 10));
        set(&mut buf, col.std_rebounds_last10, std_last(&rebounds, 10));
        set(&mut buf, col.avg_minutes_last5, avg_min5);
        set(&mut buf, col.avg_minutes_last10, mean_last(&minutes, 10));
        set(&mut buf, col.avg_turnovers_last5, mean_last(&turnovers, 5));
        set(
            &mut buf,
            col.avg_points_per_min_last5,
            per_minute(mean_last(&points, 5), avg_min5),
        );
        set(
            &mut buf,
            col.avg_assists_per_min_last5,
            per_minute(mean_last(&assists, 5), avg_min5),
        );
        set(
            &mut buf,
            col.avg_rebounds_per_min_last5,
            per_minute(mean_last(&rebounds, 5), avg_min5),
        );

        let last_date = history.last().map(|g| g.game_date).expect("non-empty");
        let gap = (candidate.game_date - last_date).num_days() as f64;
        set(&mut buf, col.days_since_last_game, Some(gap));
        set(
            &mut buf,
            col.is_back_to_back,
            Some(if gap <= 1.0 { 1.0 } else { 0.0 }),
        );
        set(
            &mut buf,
            col.games_played_season,
            Some(history.len() as f64),
        );
        set(
            &mut buf,
            col.is_home,
            Some(if parse_is_home(&candidate.matchup)? {
                1.0
            } else {
                0.0
            }),
        );

        let team = self.team_asof(&candidate.team_abbreviation, candidate.game_date);
        set(&mut buf, col.team_points_avg_last5, team.points_avg_last5);
        set(&mut buf, col.team_points_avg_last10, team.points_avg_last10);
        set(&mut buf, col.team_assists_avg_last5, team.assists_avg_last5);
        set(
            &mut buf,
            col.team_assists_avg_last10,
            team.assists_avg_last10,
        );
        set(
            &mut buf,
            col.team_rebounds_avg_last5,
            team.rebounds_avg_last5,
        );
        set(
            &mut buf,
            col.team_rebounds_avg_last10,
            team.rebounds_avg_last10,
        );

        let opp = parse_opponent_team(&candidate.matchup)
            .map(|name| self.team_asof(name, candidate.game_date))
            .unwrap_or_default();
        set(
            &mut buf,
            col.opponent_points_allowed_last5,
            opp.allowed_points_last5,
        );
        set(
            &mut buf,
            col.opponent_assists_allowed_last5,
            opp.allowed_assists_last5,
        );
        set(
            &mut buf,
            col.opponent_rebounds_allowed_last5,
            opp.allowed_rebounds_last5,
        );

        self.fill_lineup(&mut buf, &col, &candidate.team_abbreviation);

        // Serve-time minutes proxy; the caller overrides this with the
        // minutes-projection model output.
        set(&mut buf, col.pred_minutes, avg_min5);

        let row = table.len();
        table.push_row(
            candidate.player_id,
            candidate.game_id.clone(),
            candidate.game_date,
            buf,
        );
        Ok(row)
    }

    fn push_player_rows(
        &self,
        table: &mut FeatureTable,
        col: &ColumnIds,
        games: &[GameRecord],
    ) -> Result<(), EngineError> {
        let points: Vec<f64> = games.iter().map(|g| g.points).collect();
        let assists: Vec<f64> = games.iter().map(|g| g.assists).collect();
        let rebounds: Vec<f64> = games.iter().map(|g| g.rebounds).collect();
        let minutes: Vec<f64> = games.iter().map(|g| g.minutes).collect();
        let turnovers: Vec<f64> = games.iter().map(|g| g.turnovers).collect();

        for (i, game) in games.iter().enumerate() {
            let prior_points = &points[..i];
            let prior_assists = &assists[..i];
            let prior_rebounds = &rebounds[..i];
            let prior_minutes = &minutes[..i];
            let prior_turnovers = &turnovers[..i];

            let mut buf = table.row_buffer();
            set(&mut buf, col.minutes, Some(game.minutes));
            set(&mut buf, col.points, Some(game.points));
            set(&mut buf, col.assists, Some(game.assists));
            set(&mut buf, col.rebounds, Some(game.rebounds));
            set(&mut buf, col.steals, Some(game.steals));
            set(&mut buf, col.blocks, Some(game.blocks));
            set(&mut buf, col.turnovers, Some(game.turnovers));

            let avg_min5 = mean_last(prior_minutes, 5);
            set(&mut buf, col.avg_points_last5, mean_last(prior_points, 5));
            set(&mut buf, col.avg_points_last10, mean_last(prior_points, 10));
            set(&mut buf, col.std_points_last10, std_last(prior_points, 10));
            set(&mut buf, col.avg_assists_last5, mean_last(prior_assists, 5));
            set(
                &mut buf,
                col.avg_assists_last10,
                mean_last(prior_assists, 10),
            );
            set(&mut buf, col.std_assists_last10, std_last(prior_assists, 10));
            set(
                &mut buf,
                col.avg_rebounds_last5,
                mean_last(prior_rebounds, 5),
            );
            set(
                &mut buf,
                col.avg_rebounds_last10,
                mean_last(prior_rebounds, 10),
            );
            set(
                &mut buf,
                col.std_rebounds_last10,
                std_last(prior_rebounds, 10),
            );
            set(&mut buf, col.avg_minutes_last5, avg_min5);
            set(&mut buf, col.avg_minutes_last10, mean_last(prior_minutes, 10));
            set(
                &mut buf,
                col.avg_turnovers_last5,
                mean_last(prior_turnovers, 5),
            );
            set(
                &mut buf,
                col.avg_points_per_min_last5,
                per_minute(mean_last(prior_points, 5), avg_min5),
            );
            set(
                &mut buf,
                col.avg_assists_per_min_last5,
                per_minute(mean_last(prior_assists, 5), avg_min5),
            );
            set(
                &mut buf,
                col.avg_rebounds_per_min_last5,
                per_minute(mean_last(prior_rebounds, 5), avg_min5),
            );

            let gap = if i > 0 {
                Some((game.game_date - games[i - 1].game_date).num_days() as f64)
            } else {
                None
            };
            set(&mut buf, col.days_since_last_game, gap);
            set(
                &mut buf,
                col.is_back_to_back,
                Some(match gap {
                    Some(d) if d <= 1.0 => 1.0,
                    _ => 0.0,
                }),
            );
            set(&mut buf, col.games_played_season, Some(i as f64));
            set(
                &mut buf,
                col.is_home,
                Some(if parse_is_home(&game.matchup)? { 1.0 } else { 0.0 }),
            );

            let team = self
                .team_by_game
                .get(&(game.team_abbreviation.clone(), game.game_id.clone()))
                .copied()
                .unwrap_or_default();
            set(&mut buf, col.team_points_avg_last5, team.points_avg_last5);
            set(&mut buf, col.team_points_avg_last10, team.points_avg_last10);
            set(&mut buf, col.team_assists_avg_last5, team.assists_avg_last5);
            set(
                &mut buf,
                col.team_assists_avg_last10,
                team.assists_avg_last10,
            );
            set(
                &mut buf,
                col.team_rebounds_avg_last5,
                team.rebounds_avg_last5,
            );
            set(
                &mut buf,
                col.team_rebounds_avg_last10,
                team.rebounds_avg_last10,
            );

            // Opponent strength comes from the opposing team's own shifted
            // history at the same game, so it is point-in-time by
            // construction. A missing counterpart leaves the features
            // undefined rather than failing the row.
            let opp = parse_opponent_team(&game.matchup)
                .and_then(|name| {
                    self.team_by_game
                        .get(&(name.to_string(), game.game_id.clone()))
                })
                .copied()
                .unwrap_or_default();
            set(
                &mut buf,
                col.opponent_points_allowed_last5,
                opp.allowed_points_last5,
            );
            set(
                &mut buf,
                col.opponent_assists_allowed_last5,
                opp.allowed_assists_last5,
            );
            set(
                &mut buf,
                col.opponent_rebounds_allowed_last5,
                opp.allowed_rebounds_last5,
            );

            self.fill_lineup(&mut buf, col, &game.team_abbreviation);

            // Minutes proxy for training and backtests; the trainer swaps in
            // the projection model's output before fitting the primary
            // estimator.
            set(&mut buf, col.pred_minutes, avg_min5);

            table.push_row(game.player_id, game.game_id.clone(), game.game_date, buf);
        }
        Ok(())
    }

    fn fill_lineup(&self, buf: &mut [Option<f64>], col: &ColumnIds, team: &str) {
        let Some(lineup) = self.lineup_by_team.get(team) else {
            return;
        };
        set(buf, col.lineup_off_rating, Some(lineup.off_rating));
        set(buf, col.lineup_def_rating, Some(lineup.def_rating));
        set(buf, col.lineup_net_rating, Some(lineup.net_rating));
        set(buf, col.lineup_pace, Some(lineup.pace));
        set(buf, col.lineup_ast_pct, Some(lineup.ast_pct));
        set(buf, col.lineup_reb_pct, Some(lineup.reb_pct));
    }

    /// Trailing team features over games strictly before `asof`.
    fn team_asof(&self, team: &str, asof: NaiveDate) -> TeamFeatureVals {
        let Some(history) = self.team_history.get(team) else {
            return TeamFeatureVals::default();
        };
        let mut totals: Vec<[f64; 3]> = Vec::new();
        let mut allowed: Vec<[f64; 3]> = Vec::new();
        for (_, tg) in history {
            if tg.date >= asof {
                break;
            }
            totals.push(tg.totals);
            if let Some(a) = tg.allowed {
                allowed.push(a);
            }
        }
        team_vals_from_hist(&totals, &allowed)
    }
}

struct ColumnIds {
    minutes: usize,
    points: usize,
    assists: usize,
    rebounds: usize,
    steals: usize,
    blocks: usize,
    turnovers: usize,
    avg_points_last5: usize,
    avg_points_last10: usize,
    std_points_last10: usize,
    avg_assists_last5: usize,
    avg_assists_last10: usize,
    std_assists_last10: usize,
    avg_rebounds_last5: usize,
    avg_rebounds_last10: usize,
    std_rebounds_last10: usize,
    avg_minutes_last5: usize,
    avg_minutes_last10: usize,
    avg_turnovers_last5: usize,
    avg_points_per_min_last5: usize,
    avg_assists_per_min_last5: usize,
    avg_rebounds_per_min_last5: usize,
    days_since_last_game: usize,
    is_back_to_back: usize,
    is_home: usize,
    games_played_season: usize,
    team_points_avg_last5: usize,
    team_points_avg_last10: usize,
    opponent_points_allowed_last5: usize,
    team_assists_avg_last5: usize,
    team_assists_avg_last10: usize,
    opponent_assists_allowed_last5: usize,
    team_rebounds_avg_last5: usize,
    team_rebounds_avg_last10: usize,
    opponent_rebounds_allowed_last5: usize,
    lineup_off_rating: usize,
    lineup_def_rating: usize,
    lineup_net_rating: usize,
    lineup_pace: usize,
    lineup_ast_pct: usize,
    lineup_reb_pct: usize,
    pred_minutes: usize,
}

impl ColumnIds {
    fn resolve(table: &FeatureTable) -> Result<Self, EngineError> {
        Ok(Self {
            minutes: table.col("minutes")?,
            points: table.col("points")?,
            assists: table.col("assists")?,
            rebounds: table.col("rebounds")?,
            steals: table.col("steals")?,
            blocks: table.col("blocks")?,
            turnovers: table.col("turnovers")?,
            avg_points_last5: table.col("avg_points_last5")?,
            avg_points_last10: table.col("avg_points_last10")?,
            std_points_last10: table.col("std_points_last10")?,
            avg_assists_last5: table.col("avg_assists_last5")?,
            avg_assists_last10: table.col("avg_assists_last10")?,
            std_assists_last10: table.col("std_assists_last10")?,
            avg_rebounds_last5: table.col("avg_rebounds_last5")?,
            avg_rebounds_last10: table.col("avg_rebounds_last10")?,
            std_rebounds_last10: table.col("std_rebounds_last10")?,
            avg_minutes_last5: table.col("avg_minutes_last5")?,
            avg_minutes_last10: table.col("avg_minutes_last10")?,
            avg_turnovers_last5: table.col("avg_turnovers_last5")?,
            avg_points_per_min_last5: table.col("avg_points_per_min_last5")?,
            avg_assists_per_min_last5: table.col("avg_assists_per_min_last5")?,
            avg_rebounds_per_min_last5: table.col("avg_rebounds_per_min_last5")?,
            days_since_last_game: table.col("days_since_last_game")?,
            is_back_to_back: table.col("is_back_to_back")?,
            is_home: table.col("is_home")?,
            games_played_season: table.col("games_played_season")?,
            team_points_avg_last5: table.col("team_points_avg_last5")?,
            team_points_avg_last10: table.col("team_points_avg_last10")?,
            opponent_points_allowed_last5: table.col("opponent_points_allowed_last5")?,
            team_assists_avg_last5: table.col("team_assists_avg_last5")?,
            team_assists_avg_last10: table.col("team_assists_avg_last10")?,
            opponent_assists_allowed_last5: table.col("opponent_assists_allowed_last5")?,
            team_rebounds_avg_last5: table.col("team_rebounds_avg_last5")?,
            team_rebounds_avg_last10: table.col("team_rebounds_avg_last10")?,
            opponent_rebounds_allowed_last5: table.col("opponent_rebounds_allowed_last5")?,
            lineup_off_rating: table.col("lineup_off_rating")?,
            lineup_def_rating: table.col("lineup_def_rating")?,
            lineup_net_rating: table.col("lineup_net_rating")?,
            lineup_pace: table.col("lineup_pace")?,
            lineup_ast_pct: table.col("lineup_ast_pct")?,
            lineup_reb_pct: table.col("lineup_reb_pct")?,
            pred_minutes: table.col("pred_minutes")?,
        })
    }
}

fn set(buf: &mut [Option<f64>], idx: usize, value: Option<f64>) {
    if let Some(slot) = buf.get_mut(idx) {
        *slot = value;
    }
}

/// Mean over the up-to-k most recent values; undefined on an empty slice.
pub fn mean_last(values: &[f64], k: usize) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let tail = &values[values.len().saturating_sub(k)..];
    Some(tail.iter().sum::<f64>() / tail.len() as f64)
}

/// Sample standard deviation over the up-to-k most recent values; needs at
/// least two observations.
pub fn std_last(values: &[f64], k: usize) -> Option<f64> {
    let tail = &values[values.len().saturating_sub(k)..];
    if tail.len() < 2 {
        return None;
    }
    let mean = tail.iter().sum::<f64>() / tail.len() as f64;
    let var = tail.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (tail.len() - 1) as f64;
    Some(var.sqrt())
}

/// Per-minute rate; undefined (never zero-divided) when the minutes mean is
/// missing or zero.
fn per_minute(stat_mean: Option<f64>, minutes_mean: Option<f64>) -> Option<f64> {
    let stat = stat_mean?;
    let minutes = minutes_mean?;
    if minutes == 0.0 {
        return None;
    }
    Some(stat / minutes)
}

/// Team totals per (team, game): explicit team-game records win, otherwise
/// totals are aggregated from player rows. The opposing totals come from the
/// single other row sharing the game_id; an absent or ambiguous counterpart
/// leaves `allowed` undefined.
fn build_team_history(
    games: &[GameRecord],
    team_games: &[TeamGameRecord],
) -> HashMap<String, Vec<(String, TeamGameTotals)>> {
    let mut by_key: HashMap<(String, String), (NaiveDate, [f64; 3])> = HashMap::new();
    for tg in team_games {
        by_key.insert(
            (tg.team_abbreviation.clone(), tg.game_id.clone()),
            (tg.game_date, [tg.points, tg.assists, tg.rebounds]),
        );
    }
    for g in games {
        let entry = by_key
            .entry((g.team_abbreviation.clone(), g.game_id.clone()))
            .or_insert((g.game_date, [0.0; 3]));
        if team_games
            .iter()
            .any(|tg| tg.team_abbreviation == g.team_abbreviation && tg.game_id == g.game_id)
        {
            continue;
        }
        entry.1[0] += g.points;
        entry.1[1] += g.assists;
        entry.1[2] += g.rebounds;
    }

    // Index game_id -> participating teams for the opponent join.
    let mut teams_by_game: HashMap<String, Vec<String>> = HashMap::new();
    for (team, game_id) in by_key.keys() {
        teams_by_game
            .entry(game_id.clone())
            .or_default()
            .push(team.clone());
    }

    let mut history: HashMap<String, Vec<(String, TeamGameTotals)>> = HashMap::new();
    for ((team, game_id), (date, totals)) in &by_key {
        let allowed = teams_by_game.get(game_id).and_then(|teams| {
            let others: Vec<&String> = teams.iter().filter(|t| *t != team).collect();
            match others.as_slice() {
                [single] => by_key
                    .get(&((*single).clone(), game_id.clone()))
                    .map(|(_, t)| *t),
                _ => None,
            }
        });
        history.entry(team.clone()).or_default().push((
            game_id.clone(),
            TeamGameTotals {
                date: *date,
                totals: *totals,
                allowed,
            },
        ));
    }
    for rows in history.values_mut() {
        rows.sort_by(|a, b| a.1.date.cmp(&b.1.date).then_with(|| a.0.cmp(&b.0)));
    }
    history
}

/// Shifted rolling team features keyed by (team, game_id): the values a row
/// at that game may legally see.
fn build_team_feature_map(
    history: &HashMap<String, Vec<(String, TeamGameTotals)>>,
) -> HashMap<(String, String), TeamFeatureVals> {
    let mut out = HashMap::new();
    for (team, rows) in history {
        let mut totals: Vec<[f64; 3]> = Vec::new();
        let mut allowed: Vec<[f64; 3]> = Vec::new();
        for (game_id, tg) in rows {
            out.insert(
                (team.clone(), game_id.clone()),
                team_vals_from_hist(&totals, &allowed),
            );
            totals.push(tg.totals);
            if let Some(a) = tg.allowed {
                allowed.push(a);
            }
        }
    }
    out
}

fn team_vals_from_hist(totals: &[[f64; 3]], allowed: &[[f64; 3]]) -> TeamFeatureVals {
    let pick = |rows: &[[f64; 3]], idx: usize| -> Vec<f64> { rows.iter().map(|r| r[idx]).collect() };
    let points = pick(totals, 0);
    let assists = pick(totals, 1);
    let rebounds = pick(totals, 2);
    let allowed_points = pick(allowed, 0);
    let allowed_assists = pick(allowed, 1);
    let allowed_rebounds = pick(allowed, 2);

    TeamFeatureVals {
        points_avg_last5: mean_last(&points, 5),
        points_avg_last10: mean_last(&points, 10),
        assists_avg_last5: mean_last(&assists, 5),
        assists_avg_last10: mean_last(&assists, 10),
        rebounds_avg_last5: mean_last(&rebounds, 5),
        rebounds_avg_last10: mean_last(&rebounds, 10),
        allowed_points_last5: mean_last(&allowed_points, 5),
        allowed_assists_last5: mean_last(&allowed_assists, 5),
        allowed_rebounds_last5: mean_last(&allowed_rebounds, 5),
    }
}

/// Minutes-weighted lineup rating averages per team; unweighted mean
/// fallback when no lineup recorded any minutes.
fn build_lineup_features(lineups: &[LineupRecord]) -> HashMap<String, LineupFeatureVals> {
    let mut grouped: HashMap<String, Vec<&LineupRecord>> = HashMap::new();
    for row in lineups {
        grouped
            .entry(row.team_abbreviation.clone())
            .or_default()
            .push(row);
    }

    let mut out = HashMap::new();
    for (team, rows) in grouped {
        let total_minutes: f64 = rows.iter().map(|r| r.minutes.max(0.0)).sum();
        let vals = if total_minutes > 0.0 {
            let mut acc = LineupFeatureVals::default();
            for r in &rows {
                let w = r.minutes.max(0.0) / total_minutes;
                acc.off_rating += w * r.off_rating;
                acc.def_rating += w * r.def_rating;
                acc.net_rating += w * r.net_rating;
                acc.pace += w * r.pace;
                acc.ast_pct += w * r.ast_pct;
                acc.reb_pct += w * r.reb_pct;
            }
            acc
        } else {
            let n = rows.len() as f64;
            LineupFeatureVals {
                off_rating: rows.iter().map(|r| r.off_rating).sum::<f64>() / n,
                def_rating: rows.iter().map(|r| r.def_rating).sum::<f64>() / n,
                net_rating: rows.iter().map(|r| r.net_rating).sum::<f64>() / n,
                pace: rows.iter().map(|r| r.pace).sum::<f64>() / n,
                ast_pct: rows.iter().map(|r| r.ast_pct).sum::<f64>() / n,
                reb_pct: rows.iter().map(|r| r.reb_pct).sum::<f64>() / n,
            }
        };
        out.insert(team, vals);
    }
    out
}

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, params};

use crate::config::StatType;

const DATE_FMT: &str = "%Y-%m-%d";

/// One player's line in one game. Unique per (player_id, game_id); immutable
/// once written except for backfilling previously-null shooting fields.
#[derive(Debug, Clone)]
pub struct GameRecord {
    pub player_id: i64,
    pub game_id: String,
    pub game_date: NaiveDate,
    pub matchup: String,
    pub team_abbreviation: String,
    pub minutes: f64,
    pub points: f64,
    pub assists: f64,
    pub rebounds: f64,
    pub steals: f64,
    pub blocks: f64,
    pub turnovers: f64,
    pub fg_attempts: Option<f64>,
    pub fg_made: Option<f64>,
    pub three_attempts: Option<f64>,
    pub three_made: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TeamGameRecord {
    pub team_abbreviation: String,
    pub game_id: String,
    pub game_date: NaiveDate,
    pub points: f64,
    pub assists: f64,
    pub rebounds: f64,
}

#[derive(Debug, Clone)]
pub struct LineupRecord {
    pub team_abbreviation: String,
    pub season: String,
    pub lineup_id: String,
    pub minutes: f64,
    pub off_rating: f64,
    pub def_rating: f64,
    pub net_rating: f64,
    pub pace: f64,
    pub ast_pct: f64,
    pub reb_pct: f64,
}

#[derive(Debug, Clone)]
pub struct ScheduledGame {
    pub game_id: String,
    pub game_date: NaiveDate,
    pub matchup: String,
    pub home_team_abbr: String,
    pub away_team_abbr: String,
}

#[derive(Debug, Clone)]
pub struct PredictionRecord {
    pub player_id: i64,
    pub stat_type: String,
    pub game_id: String,
    pub game_date: Option<NaiveDate>,
    pub prediction_date: Option<NaiveDate>,
    pub pred_value: f64,
    pub pred_p10: Option<f64>,
    pub pred_p50: Option<f64>,
    pub pred_p90: Option<f64>,
    pub confidence: Option<f64>,
    pub model_version: Option<String>,
    pub actual_value: Option<f64>,
    pub abs_error: Option<f64>,
}

/// A prediction whose realized value is known, as read back for grading
/// aggregates.
#[derive(Debug, Clone)]
pub struct GradedPrediction {
    pub player_id: i64,
    pub game_date: NaiveDate,
    pub pred_value: f64,
    pub pred_p10: Option<f64>,
    pub actual_value: f64,
}

#[derive(Debug, Clone)]
pub struct UnderRateRecord {
    pub player_id: i64,
    pub stat_type: String,
    pub window_n: usize,
    pub sample_size: usize,
    pub under_count: usize,
    pub under_rate: f64,
    pub threshold_type: String,
    pub as_of_date: NaiveDate,
}

/// Latest rolling row per player, used to pick live-prediction candidates
/// by team.
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub player_id: i64,
    pub team_abbreviation: String,
    pub last_game_date: NaiveDate,
    pub games_played: usize,
    pub avg_points_last5: f64,
    pub avg_assists_last5: f64,
    pub avg_rebounds_last5: f64,
    pub avg_minutes_last5: f64,
}

pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let conn =
        Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS player_game_stats (
            player_id INTEGER NOT NULL,
            game_id TEXT NOT NULL,
            game_date TEXT NOT NULL,
            matchup TEXT NOT NULL,
            team_abbreviation TEXT NOT NULL,
            minutes REAL NOT NULL,
            points REAL NOT NULL,
            assists REAL NOT NULL,
            rebounds REAL NOT NULL,
            steals REAL NOT NULL,
            blocks REAL NOT NULL,
            turnovers REAL NOT NULL,
            fg_attempts REAL NULL,
            fg_made REAL NULL,
            three_attempts REAL NULL,
            three_made REAL NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (player_id, game_id)
        );
        CREATE INDEX IF NOT EXISTS idx_pgs_date ON player_game_stats(game_date);
        CREATE INDEX IF NOT EXISTS idx_pgs_team ON player_game_stats(team_abbreviation);

        CREATE TABLE IF NOT EXISTS team_game_stats (
            team_abbreviation TEXT NOT NULL,
            game_id TEXT NOT NULL,
            game_date TEXT NOT NULL,
            points REAL NOT NULL,
            assists REAL NOT NULL,
            rebounds REAL NOT NULL,
            PRIMARY KEY (team_abbreviation, game_id)
        );
        CREATE INDEX IF NOT EXISTS idx_tgs_game ON team_game_stats(game_id);

        CREATE TABLE IF NOT EXISTS lineup_stats (
            team_abbreviation TEXT NOT NULL,
            season TEXT NOT NULL,
            lineup_id TEXT NOT NULL,
            minutes REAL NOT NULL,
            off_rating REAL NOT NULL,
            def_rating REAL NOT NULL,
            net_rating REAL NOT NULL,
            pace REAL NOT NULL,
            ast_pct REAL NOT NULL,
            reb_pct REAL NOT NULL,
            PRIMARY KEY (team_abbreviation, season, lineup_id)
        );

        CREATE TABLE IF NOT EXISTS game_schedule (
            game_id TEXT PRIMARY KEY,
            game_date TEXT NOT NULL,
            matchup TEXT NOT NULL,
            home_team_abbr TEXT NOT NULL,
            away_team_abbr TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_schedule_date ON game_schedule(game_date);

        CREATE TABLE IF NOT EXISTS prediction_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            player_id INTEGER NOT NULL,
            stat_type TEXT NOT NULL,
            game_id TEXT NOT NULL,
            game_date TEXT NULL,
            prediction_date TEXT NULL,
            pred_value REAL NOT NULL,
            pred_p10 REAL NULL,
            pred_p50 REAL NULL,
            pred_p90 REAL NULL,
            confidence REAL NULL,
            model_version TEXT NULL,
            actual_value REAL NULL,
            abs_error REAL NULL,
            UNIQUE (player_id, stat_type, game_id)
        );
        CREATE INDEX IF NOT EXISTS idx_pl_stat_date ON prediction_logs(stat_type, game_date);

        CREATE TABLE IF NOT EXISTS player_under_risk (
            player_id INTEGER NOT NULL,
            stat_type TEXT NOT NULL,
            window_n INTEGER NOT NULL,
            sample_size INTEGER NOT NULL,
            under_count INTEGER NOT NULL,
            under_rate REAL NOT NULL,
            threshold_type TEXT NOT NULL,
            as_of_date TEXT NOT NULL,
            computed_at TEXT NOT NULL,
            UNIQUE (player_id, stat_type)
        );

        CREATE TABLE IF NOT EXISTS player_rolling_snapshot (
            player_id INTEGER PRIMARY KEY,
            team_abbreviation TEXT NOT NULL,
            last_game_date TEXT NOT NULL,
            games_played INTEGER NOT NULL,
            avg_points_last5 REAL NOT NULL,
            avg_assists_last5 REAL NOT NULL,
            avg_rebounds_last5 REAL NOT NULL,
            avg_minutes_last5 REAL NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_snapshot_team ON player_rolling_snapshot(team_abbreviation);
        "#,
    )
    .context("create sqlite schema")?;
    Ok(())
}

pub fn upsert_games(conn: &mut Connection, rows: &[GameRecord]) -> Result<usize> {
    let tx = conn.transaction().context("begin game upsert")?;
    let mut written = 0usize;
    for row in rows {
        tx.execute(
            r#"
            INSERT INTO player_game_stats (
                player_id, game_id, game_date, matchup, team_abbreviation,
                minutes, points, assists, rebounds, steals, blocks, turnovers,
                fg_attempts, fg_made, three_attempts, three_made, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ON CONFLICT(player_id, game_id) DO UPDATE SET
                game_date = excluded.game_date,
                matchup = excluded.matchup,
                team_abbreviation = excluded.team_abbreviation,
                minutes = excluded.minutes,
                points = excluded.points,
                assists = excluded.assists,
                rebounds = excluded.rebounds,
                steals = excluded.steals,
                blocks = excluded.blocks,
                turnovers = excluded.turnovers,
                fg_attempts = COALESCE(player_game_stats.fg_attempts, excluded.fg_attempts),
                fg_made = COALESCE(player_game_stats.fg_made, excluded.fg_made),
                three_attempts = COALESCE(player_game_stats.three_attempts, excluded.three_attempts),
                three_made = COALESCE(player_game_stats.three_made, excluded.three_made),
                updated_at = excluded.updated_at
            "#,
            params![
                row.player_id,
                row.game_id,
                fmt_date(row.game_date),
                row.matchup,
                row.team_abbreviation,
                row.minutes,
                row.points,
                row.assists,
                row.rebounds,
                row.steals,
                row.blocks,
                row.turnovers,
                row.fg_attempts,
                row.fg_made,
                row.three_attempts,
                row.three_made,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("upsert player game")?;
        written += 1;
    }
    tx.commit().context("commit game upsert")?;
    Ok(written)
}

/// Fill shooting fields that were null at ingest time. Existing non-null
/// values are left untouched.
pub fn backfill_shooting_fields(conn: &mut Connection, rows: &[GameRecord]) -> Result<usize> {
    let tx = conn.transaction().context("begin shooting backfill")?;
    let mut touched = 0usize;
    for row in rows {
        let n = tx
            .execute(
                r#"
                UPDATE player_game_stats SET
                    fg_attempts = COALESCE(fg_attempts, ?3),
                    fg_made = COALESCE(fg_made, ?4),
                    three_attempts = COALESCE(three_attempts, ?5),
                    three_made = COALESCE(three_made, ?6),
                    updated_at = ?7
                WHERE player_id = ?1 AND game_id = ?2
                  AND (fg_attempts IS NULL OR fg_made IS NULL
                       OR three_attempts IS NULL OR three_made IS NULL)
                "#,
                params![
                    row.player_id,
                    row.game_id,
                    row.fg_attempts,
                    row.fg_made,
                    row.three_attempts,
                    row.three_made,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("backfill shooting fields")?;
        touched += n;
    }
    tx.commit().context("commit shooting backfill")?;
    Ok(touched)
}

/// Full ordered history, sorted per player then chronologically.
pub fn load_games(conn: &Connection) -> Result<Vec<GameRecord>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT player_id, game_id, game_date, matchup, team_abbreviation,
                   minutes, points, assists, rebounds, steals, blocks, turnovers,
                   fg_attempts, fg_made, three_attempts, three_made
            FROM player_game_stats
            ORDER BY player_id ASC, game_date ASC, game_id ASC
            "#,
        )
        .context("prepare load games")?;
    let rows = stmt
        .query_map([], game_from_row)
        .context("query load games")?;
    collect_rows(rows)
}

pub fn load_games_for_player(conn: &Connection, player_id: i64) -> Result<Vec<GameRecord>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT player_id, game_id, game_date, matchup, team_abbreviation,
                   minutes, points, assists, rebounds, steals, blocks, turnovers,
                   fg_attempts, fg_made, three_attempts, three_made
            FROM player_game_stats
            WHERE player_id = ?1
            ORDER BY game_date ASC, game_id ASC
            "#,
        )
        .context("prepare load player games")?;
    let rows = stmt
        .query_map(params![player_id], game_from_row)
        .context("query load player games")?;
    collect_rows(rows)
}

pub fn latest_game_date(conn: &Connection) -> Result<Option<NaiveDate>> {
    let raw: Option<String> = conn
        .query_row("SELECT MAX(game_date) FROM player_game_stats", [], |row| {
            row.get(0)
        })
        .context("query latest game date")?;
    raw.map(|s| parse_date(&s)).transpose()
}

pub fn upsert_team_games(conn: &mut Connection, rows: &[TeamGameRecord]) -> Result<usize> {
    let tx = conn.transaction().context("begin team game upsert")?;
    for row in rows {
        tx.execute(
            r#"
            INSERT INTO team_game_stats (team_abbreviation, game_id, game_date, points, assists, rebounds)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(team_abbreviation, game_id) DO UPDATE SET
                game_date = excluded.game_date,
                points = excluded.points,
                assists = excluded.assists,
                rebounds = excluded.rebounds
            "#,
            params![
                row.team_abbreviation,
                row.game_id,
                fmt_date(row.game_date),
                row.points,
                row.assists,
                row.rebounds,
            ],
        )
        .context("upsert team game")?;
    }
    tx.commit().context("commit team game upsert")?;
    Ok(rows.len())
}

pub fn load_team_games(conn: &Connection) -> Result<Vec<TeamGameRecord>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT team_abbreviation, game_id, game_date, points, assists, rebounds
            FROM team_game_stats
            ORDER BY team_abbreviation ASC, game_date ASC, game_id ASC
            "#,
        )
        .context("prepare load team games")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, f64>(5)?,
            ))
        })
        .context("query load team games")?;

    let mut out = Vec::new();
    for row in rows {
        let (team, game_id, date, points, assists, rebounds) =
            row.context("decode team game row")?;
        out.push(TeamGameRecord {
            team_abbreviation: team,
            game_id,
            game_date: parse_date(&date)?,
            points,
            assists,
            rebounds,
        });
    }
    Ok(out)
}

pub fn upsert_lineups(conn: &mut Connection, rows: &[LineupRecord]) -> Result<usize> {
    let tx = conn.transaction().context("begin lineup upsert")?;
    for row in rows {
        tx.execute(
            r#"
            INSERT INTO lineup_stats (
                team_abbreviation, season, lineup_id, minutes,
                off_rating, def_rating, net_rating, pace, ast_pct, reb_pct
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(team_abbreviation, season, lineup_id) DO UPDATE SET
                minutes = excluded.minutes,
                off_rating = excluded.off_rating,
                def_rating = excluded.def_rating,
                net_rating = excluded.net_rating,
                pace = excluded.pace,
                ast_pct = excluded.ast_pct,
                reb_pct = excluded.reb_pct
            "#,
            params![
                row.team_abbreviation,
                row.season,
                row.lineup_id,
                row.minutes,
                row.off_rating,
                row.def_rating,
                row.net_rating,
                row.pace,
                row.ast_pct,
                row.reb_pct,
            ],
        )
        .context("upsert lineup")?;
    }
    tx.commit().context("commit lineup upsert")?;
    Ok(rows.len())
}

pub fn load_lineups(conn: &Connection) -> Result<Vec<LineupRecord>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT team_abbreviation, season, lineup_id, minutes,
                   off_rating, def_rating, net_rating, pace, ast_pct, reb_pct
            FROM lineup_stats
            ORDER BY team_abbreviation ASC, season ASC, lineup_id ASC
            "#,
        )
        .context("prepare load lineups")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(LineupRecord {
                team_abbreviation: row.get(0)?,
                season: row.get(1)?,
                lineup_id: row.get(2)?,
                minutes: row.get(3)?,
                off_rating: row.get(4)?,
                def_rating: row.get(5)?,
                net_rating: row.get(6)?,
                pace: row.get(7)?,
                ast_pct: row.get(8)?,
                reb_pct: row.get(9)?,
            })
        })
        .context("query load lineups")?;
    collect_rows(rows)
}

pub fn upsert_schedule(conn: &mut Connection, rows: &[ScheduledGame]) -> Result<usize> {
    let tx = conn.transaction().context("begin schedule upsert")?;
    for row in rows {
        tx.execute(
            r#"
            INSERT INTO game_schedule (game_id, game_date, matchup, home_team_abbr, away_team_abbr)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(game_id) DO UPDATE SET
                game_date = excluded.game_date,
                matchup = excluded.matchup,
                home_team_abbr = excluded.home_team_abbr,
                away_team_abbr = excluded.away_team_abbr
            "#,
            params![
                row.game_id,
                fmt_date(row.game_date),
                row.matchup,
                row.home_team_abbr,
                row.away_team_abbr,
            ],
        )
        .context("upsert scheduled game")?;
    }
    tx.commit().context("commit schedule upsert")?;
    Ok(rows.len())
}

pub fn load_schedule_on(conn: &Connection, date: NaiveDate) -> Result<Vec<ScheduledGame>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT game_id, game_date, matchup, home_team_abbr, away_team_abbr
            FROM game_schedule
            WHERE game_date = ?1
            ORDER BY game_id ASC
            "#,
        )
        .context("prepare load schedule")?;
    let rows = stmt
        .query_map(params![fmt_date(date)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .context("query load schedule")?;

    let mut out = Vec::new();
    for row in rows {
        let (game_id, date, matchup, home, away) = row.context("decode schedule row")?;
        out.push(ScheduledGame {
            game_id,
            game_date: parse_date(&date)?,
            matchup,
            home_team_abbr: home,
            away_team_abbr: away,
        });
    }
    Ok(out)
}

pub fn upsert_predictions(conn: &mut Connection, rows: &[PredictionRecord]) -> Result<usize> {
    let tx = conn.transaction().context("begin prediction upsert")?;
    for row in rows {
        tx.execute(
            r#"
            INSERT INTO prediction_logs (
                player_id, stat_type, game_id, game_date, prediction_date,
                pred_value, pred_p10, pred_p50, pred_p90, confidence, model_version,
                actual_value, abs_error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(player_id, stat_type, game_id) DO UPDATE SET
                game_date = excluded.game_date,
                prediction_date = excluded.prediction_date,
                pred_value = excluded.pred_value,
                pred_p10 = excluded.pred_p10,
                pred_p50 = excluded.pred_p50,
                pred_p90 = excluded.pred_p90,
                confidence = excluded.confidence,
                model_version = excluded.model_version,
                actual_value = COALESCE(excluded.actual_value, prediction_logs.actual_value),
                abs_error = COALESCE(excluded.abs_error, prediction_logs.abs_error)
            "#,
            params![
                row.player_id,
                row.stat_type,
                row.game_id,
                row.game_date.map(fmt_date),
                row.prediction_date.map(fmt_date),
                row.pred_value,
                row.pred_p10,
                row.pred_p50,
                row.pred_p90,
                row.confidence,
                row.model_version,
                row.actual_value,
                row.abs_error,
            ],
        )
        .context("upsert prediction")?;
    }
    tx.commit().context("commit prediction upsert")?;
    Ok(rows.len())
}

/// Fill realized values on ungraded predictions from game stats, keyed by
/// (player_id, game_id). Returns the number of rows graded.
pub fn grade_predictions(conn: &Connection, stat: StatType) -> Result<usize> {
    let n = conn
        .execute(
            &format!(
                r#"
                UPDATE prediction_logs SET
                    actual_value = (
                        SELECT pgs.{col} FROM player_game_stats pgs
                        WHERE pgs.player_id = prediction_logs.player_id
                          AND pgs.game_id = prediction_logs.game_id
                    ),
                    abs_error = ABS((
                        SELECT pgs.{col} FROM player_game_stats pgs
                        WHERE pgs.player_id = prediction_logs.player_id
                          AND pgs.game_id = prediction_logs.game_id
                    ) - pred_value)
                WHERE actual_value IS NULL
                  AND stat_type = ?1
                  AND EXISTS (
                        SELECT 1 FROM player_game_stats pgs
                        WHERE pgs.player_id = prediction_logs.player_id
                          AND pgs.game_id = prediction_logs.game_id
                  )
                "#,
                col = stat.column()
            ),
            params![stat.column()],
        )
        .context("grade predictions")?;
    Ok(n)
}

/// Graded predictions for a stat, ordered per player by date descending so
/// callers can take the freshest N per player.
pub fn load_graded_predictions(conn: &Connection, stat: StatType) -> Result<Vec<GradedPrediction>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT player_id, game_date, pred_value, pred_p10, actual_value
            FROM prediction_logs
            WHERE stat_type = ?1
              AND actual_value IS NOT NULL
              AND game_date IS NOT NULL
            ORDER BY player_id ASC, game_date DESC
            "#,
        )
        .context("prepare load graded predictions")?;
    let rows = stmt
        .query_map(params![stat.column()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, Option<f64>>(3)?,
                row.get::<_, f64>(4)?,
            ))
        })
        .context("query load graded predictions")?;

    let mut out = Vec::new();
    for row in rows {
        let (player_id, date, pred, p10, actual) = row.context("decode graded prediction")?;
        out.push(GradedPrediction {
            player_id,
            game_date: parse_date(&date)?,
            pred_value: pred,
            pred_p10: p10,
            actual_value: actual,
        });
    }
    Ok(out)
}

/// Most recent signed residuals (pred - actual) for one player, newest
/// first, for the history confidence path.
pub fn load_recent_residuals(
    conn: &Connection,
    stat: StatType,
    player_id: i64,
    window: usize,
) -> Result<Vec<f64>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT pred_value, actual_value
            FROM prediction_logs
            WHERE stat_type = ?1 AND player_id = ?2 AND actual_value IS NOT NULL
            ORDER BY game_date DESC
            LIMIT ?3
            "#,
        )
        .context("prepare load residuals")?;
    let rows = stmt
        .query_map(params![stat.column(), player_id, window as i64], |row| {
            Ok(row.get::<_, f64>(0)? - row.get::<_, f64>(1)?)
        })
        .context("query load residuals")?;
    collect_rows(rows)
}

pub fn delete_walkforward_logs(conn: &Connection, stat: StatType) -> Result<usize> {
    let n = conn
        .execute(
            "DELETE FROM prediction_logs WHERE stat_type = ?1 AND model_version LIKE 'walkforward_%'",
            params![stat.column()],
        )
        .context("delete walk-forward logs")?;
    Ok(n)
}

pub fn upsert_under_rates(conn: &mut Connection, rows: &[UnderRateRecord]) -> Result<usize> {
    let tx = conn.transaction().context("begin under-rate upsert")?;
    for row in rows {
        tx.execute(
            r#"
            INSERT INTO player_under_risk (
                player_id, stat_type, window_n, sample_size, under_count,
                under_rate, threshold_type, as_of_date, computed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(player_id, stat_type) DO UPDATE SET
                window_n = excluded.window_n,
                sample_size = excluded.sample_size,
                under_count = excluded.under_count,
                under_rate = excluded.under_rate,
                threshold_type = excluded.threshold_type,
                as_of_date = excluded.as_of_date,
                computed_at = excluded.computed_at
            "#,
            params![
                row.player_id,
                row.stat_type,
                row.window_n as i64,
                row.sample_size as i64,
                row.under_count as i64,
                row.under_rate,
                row.threshold_type,
                fmt_date(row.as_of_date),
                Utc::now().to_rfc3339(),
            ],
        )
        .context("upsert under-rate")?;
    }
    tx.commit().context("commit under-rate upsert")?;
    Ok(rows.len())
}

pub fn upsert_snapshot_rows(conn: &mut Connection, rows: &[SnapshotRow]) -> Result<usize> {
    let tx = conn.transaction().context("begin snapshot upsert")?;
    for row in rows {
        tx.execute(
            r#"
            INSERT INTO player_rolling_snapshot (
                player_id, team_abbreviation, last_game_date, games_played,
                avg_points_last5, avg_assists_last5, avg_rebounds_last5,
                avg_minutes_last5, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(player_id) DO UPDATE SET
                team_abbreviation = excluded.team_abbreviation,
                last_game_date = excluded.last_game_date,
                games_played = excluded.games_played,
                avg_points_last5 = excluded.avg_points_last5,
                avg_assists_last5 = excluded.avg_assists_last5,
                avg_rebounds_last5 = excluded.avg_rebounds_last5,
                avg_minutes_last5 = excluded.avg_minutes_last5,
                updated_at = excluded.updated_at
            "#,
            params![
                row.player_id,
                row.team_abbreviation,
                fmt_date(row.last_game_date),
                row.games_played as i64,
                row.avg_points_last5,
                row.avg_assists_last5,
                row.avg_rebounds_last5,
                row.avg_minutes_last5,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("upsert snapshot row")?;
    }
    tx.commit().context("commit snapshot upsert")?;
    Ok(rows.len())
}

pub fn load_snapshot_for_team(conn: &Connection, team: &str) -> Result<Vec<SnapshotRow>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT player_id, team_abbreviation, last_game_date, games_played,
                   avg_points_last5, avg_assists_last5, avg_rebounds_last5, avg_minutes_last5
            FROM player_rolling_snapshot
            WHERE team_abbreviation = ?1
            ORDER BY player_id ASC
            "#,
        )
        .context("prepare load snapshot")?;
    let rows = stmt
        .query_map(params![team], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, f64>(7)?,
            ))
        })
        .context("query load snapshot")?;

    let mut out = Vec::new();
    for row in rows {
        let (player_id, team, date, games, pts, ast, reb, min) =
            row.context("decode snapshot row")?;
        out.push(SnapshotRow {
            player_id,
            team_abbreviation: team,
            last_game_date: parse_date(&date)?,
            games_played: games.max(0) as usize,
            avg_points_last5: pts,
            avg_assists_last5: ast,
            avg_rebounds_last5: reb,
            avg_minutes_last5: min,
        });
    }
    Ok(out)
}

fn game_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GameRecord> {
    let date_raw: String = row.get(2)?;
    Ok(GameRecord {
        player_id: row.get(0)?,
        game_id: row.get(1)?,
        game_date: NaiveDate::parse_from_str(&date_raw, DATE_FMT).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        matchup: row.get(3)?,
        team_abbreviation: row.get(4)?,
        minutes: row.get(5)?,
        points: row.get(6)?,
        assists: row.get(7)?,
        rebounds: row.get(8)?,
        steals: row.get(9)?,
        blocks: row.get(10)?,
        turnovers: row.get(11)?,
        fg_attempts: row.get(12)?,
        fg_made: row.get(13)?,
        three_attempts: row.get(14)?,
        three_made: row.get(15)?,
    })
}

fn collect_rows<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode sqlite row")?);
    }
    Ok(out)
}

fn fmt_date(date: NaiveDate) -> String {
    date.format(DATE_FMT).to_string()
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FMT)
        .with_context(|| format!("parse stored date {raw:?}"))
}

use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

use crate::features::mean_last;
use crate::store::{self, GameRecord, SnapshotRow};

/// One snapshot row per player: trailing (unshifted) last-5 averages over
/// the full stored history plus the player's current team. The live path
/// uses the team column to pick candidates for a scheduled game.
pub fn snapshot_rows(games: &[GameRecord]) -> Vec<SnapshotRow> {
    let mut sorted: Vec<&GameRecord> = games.iter().collect();
    sorted.sort_by(|a, b| {
        a.player_id
            .cmp(&b.player_id)
            .then_with(|| a.game_date.cmp(&b.game_date))
            .then_with(|| a.game_id.cmp(&b.game_id))
    });

    let mut out = Vec::new();
    let mut start = 0usize;
    while start < sorted.len() {
        let player_id = sorted[start].player_id;
        let mut end = start;
        while end < sorted.len() && sorted[end].player_id == player_id {
            end += 1;
        }
        let span = &sorted[start..end];
        let last = span.last().expect("non-empty span");

        let points: Vec<f64> = span.iter().map(|g| g.points).collect();
        let assists: Vec<f64> = span.iter().map(|g| g.assists).collect();
        let rebounds: Vec<f64> = span.iter().map(|g| g.rebounds).collect();
        let minutes: Vec<f64> = span.iter().map(|g| g.minutes).collect();

        out.push(SnapshotRow {
            player_id,
            team_abbreviation: last.team_abbreviation.clone(),
            last_game_date: last.game_date,
            games_played: span.len(),
            avg_points_last5: mean_last(&points, 5).unwrap_or(0.0),
            avg_assists_last5: mean_last(&assists, 5).unwrap_or(0.0),
            avg_rebounds_last5: mean_last(&rebounds, 5).unwrap_or(0.0),
            avg_minutes_last5: mean_last(&minutes, 5).unwrap_or(0.0),
        });
        start = end;
    }
    out
}

pub fn refresh_snapshot(conn: &mut Connection) -> Result<usize> {
    let games = store::load_games(conn)?;
    let rows = snapshot_rows(&games);
    let written = store::upsert_snapshot_rows(conn, &rows)?;
    info!(players = written, "refreshed rolling snapshot");
    Ok(written)
}

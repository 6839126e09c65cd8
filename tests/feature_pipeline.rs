use chrono::NaiveDate;

use propcast::features::{FeatureBuilder, ServeCandidate};
use propcast::snapshot::refresh_snapshot;
use propcast::store::{self, GameRecord, TeamGameRecord};
use propcast::table::FeatureTable;

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
}

fn game(player_id: i64, g: u32, matchup: &str, team: &str, rebounds: f64) -> GameRecord {
    GameRecord {
        player_id,
        game_id: format!("g{g}"),
        game_date: day(g),
        matchup: matchup.to_string(),
        team_abbreviation: team.to_string(),
        minutes: 30.0,
        points: 18.0,
        assists: 5.0,
        rebounds,
        steals: 1.0,
        blocks: 0.5,
        turnovers: 2.0,
        fg_attempts: None,
        fg_made: None,
        three_attempts: None,
        three_made: None,
    }
}

#[test]
fn stored_history_produces_worked_rolling_example() {
    // Rebounds [10, 12, 8, 14, 9, 11] through sqlite and back: the shifted
    // five-game mean at the sixth game is 10.6.
    let mut conn = store::open_in_memory().unwrap();
    let rows: Vec<GameRecord> = [10.0, 12.0, 8.0, 14.0, 9.0, 11.0]
        .iter()
        .enumerate()
        .map(|(i, v)| game(1, i as u32 + 1, "BOS vs. LAL", "BOS", *v))
        .collect();
    store::upsert_games(&mut conn, &rows).unwrap();

    let loaded = store::load_games(&conn).unwrap();
    let table = FeatureBuilder::new(loaded, Vec::new(), Vec::new())
        .training_table()
        .unwrap();
    let col = table.col("avg_rebounds_last5").unwrap();
    let sixth = table.rows().iter().find(|r| r.game_id == "g6").unwrap();
    assert!((sixth.value(col).unwrap() - 10.6).abs() < 1e-9);
}

#[test]
fn team_features_survive_explicit_team_rows() {
    let mut conn = store::open_in_memory().unwrap();
    let mut rows = Vec::new();
    for g in 1..=6u32 {
        rows.push(game(1, g, "BOS vs. LAL", "BOS", 8.0));
        rows.push(game(2, g, "LAL @ BOS", "LAL", 6.0));
    }
    store::upsert_games(&mut conn, &rows).unwrap();

    // Explicit team totals override the player-row aggregation.
    let team_rows: Vec<TeamGameRecord> = (1..=6u32)
        .flat_map(|g| {
            [
                TeamGameRecord {
                    team_abbreviation: "BOS".into(),
                    game_id: format!("g{g}"),
                    game_date: day(g),
                    points: 110.0,
                    assists: 25.0,
                    rebounds: 44.0,
                },
                TeamGameRecord {
                    team_abbreviation: "LAL".into(),
                    game_id: format!("g{g}"),
                    game_date: day(g),
                    points: 104.0,
                    assists: 22.0,
                    rebounds: 40.0,
                },
            ]
        })
        .collect();
    store::upsert_team_games(&mut conn, &team_rows).unwrap();

    let table = FeatureBuilder::new(
        store::load_games(&conn).unwrap(),
        store::load_team_games(&conn).unwrap(),
        Vec::new(),
    )
    .training_table()
    .unwrap();

    let own = table.col("team_points_avg_last5").unwrap();
    let allowed = table.col("opponent_points_allowed_last5").unwrap();
    let row = table
        .rows()
        .iter()
        .find(|r| r.player_id == 1 && r.game_id == "g6")
        .unwrap();
    assert_eq!(row.value(own), Some(110.0));
    // LAL allowed BOS's 110 in each completed prior game.
    assert_eq!(row.value(allowed), Some(110.0));
}

#[test]
fn serve_row_matches_training_row_for_same_information_set() {
    // A serve-time row for game N and the training row of game N see the
    // same prior history, so shared features must agree.
    let games: Vec<GameRecord> = [10.0, 12.0, 8.0, 14.0, 9.0, 11.0]
        .iter()
        .enumerate()
        .map(|(i, v)| game(1, i as u32 + 1, "BOS vs. LAL", "BOS", *v))
        .collect();
    let history: Vec<GameRecord> = games[..5].to_vec();

    let training = FeatureBuilder::new(games, Vec::new(), Vec::new())
        .training_table()
        .unwrap();
    let train_row = training.rows().iter().find(|r| r.game_id == "g6").unwrap();

    let builder = FeatureBuilder::new(history, Vec::new(), Vec::new());
    let mut serve_table = FeatureTable::new(FeatureBuilder::table_columns());
    let serve_idx = builder
        .serve_row(
            &mut serve_table,
            &ServeCandidate {
                player_id: 1,
                game_id: "g6".into(),
                game_date: day(6),
                matchup: "BOS vs. LAL".into(),
                team_abbreviation: "BOS".into(),
            },
        )
        .unwrap();
    let serve_row = &serve_table.rows()[serve_idx];

    for name in [
        "avg_rebounds_last5",
        "avg_rebounds_last10",
        "std_rebounds_last10",
        "avg_minutes_last5",
        "days_since_last_game",
        "is_back_to_back",
        "is_home",
        "games_played_season",
    ] {
        let t = training.col(name).unwrap();
        let s = serve_table.col(name).unwrap();
        assert_eq!(train_row.value(t), serve_row.value(s), "feature {name}");
    }
}

#[test]
fn snapshot_feeds_candidate_selection() {
    let mut conn = store::open_in_memory().unwrap();
    let rows: Vec<GameRecord> = (1..=6u32)
        .map(|g| game(7, g, "BOS vs. LAL", "BOS", 9.0))
        .collect();
    store::upsert_games(&mut conn, &rows).unwrap();
    refresh_snapshot(&mut conn).unwrap();

    let bos = store::load_snapshot_for_team(&conn, "BOS").unwrap();
    assert_eq!(bos.len(), 1);
    assert_eq!(bos[0].player_id, 7);
    assert_eq!(bos[0].games_played, 6);
    assert!(store::load_snapshot_for_team(&conn, "NYK").unwrap().is_empty());
}

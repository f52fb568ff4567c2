mod support;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context as _, Result};
use ln_subswap::fees::feed::cache_bust;
use ln_subswap::fees::oracle::FeeRateOracle;
use ln_subswap::fees::{FeeError, FeeMatrixBody, FeeSnapshot};
use support::fakes::{StaticFeeFeed, flat_matrix};
use support::wait::wait_for;

/// Cells grow towards short targets and high confidence.
fn graded_matrix() -> FeeMatrixBody {
    let index = vec![1, 2, 3, 6, 12, 24, 144];
    let columns: Vec<String> = ["0.5", "0.8", "0.9", "0.95", "0.99"]
        .iter()
        .map(|c| c.to_string())
        .collect();
    let data = (0..index.len() as i32)
        .map(|row| {
            (0..columns.len() as i32)
                .map(|col| 500 - row * 50 + col * 20)
                .collect()
        })
        .collect();
    FeeMatrixBody {
        index,
        columns,
        data,
    }
}

fn assert_close(got: f64, want: f64) {
    assert!((got - want).abs() < 1e-9, "got {got}, want {want}");
}

#[test]
fn fee_rate_picks_exact_cell() -> Result<()> {
    let snapshot = FeeSnapshot::try_from(graded_matrix()).context("valid matrix")?;

    // Whole window left: certainty 0.5, nearest target to 144 is 144.
    assert_close(snapshot.fee_rate(144, 144)?, (200.0_f64 / 100.0).exp());

    // At the deadline: certainty 1.0 picks the 0.99 column, target 1.
    assert_close(snapshot.fee_rate(0, 144)?, (580.0_f64 / 100.0).exp());

    // Negative remaining blocks clamp to the deadline.
    assert_close(snapshot.fee_rate(-20, 144)?, snapshot.fee_rate(0, 144)?);

    // Beyond the window clamps to the window.
    assert_close(snapshot.fee_rate(10_000, 144)?, snapshot.fee_rate(144, 144)?);
    Ok(())
}

#[test]
fn fee_rate_is_monotone_in_blocks_remaining() -> Result<()> {
    let snapshot = FeeSnapshot::try_from(graded_matrix()).context("valid matrix")?;

    for window in [24_u32, 144, 288] {
        let mut previous = f64::INFINITY;
        for blocks in -5..=(i64::from(window) + 5) {
            let rate = snapshot.fee_rate(blocks, window)?;
            assert!(
                rate <= previous,
                "rate rose from {previous} to {rate} at {blocks}/{window}"
            );
            previous = rate;
        }
    }
    Ok(())
}

#[test]
fn nearest_ties_take_the_first_entry() -> Result<()> {
    // Target 4 sits between 2 and 6; column 0.75 between 0.5 and 1.0.
    let snapshot = FeeSnapshot::try_from(FeeMatrixBody {
        index: vec![2, 6],
        columns: vec!["0.5".into(), "1.0".into()],
        data: vec![vec![100, 200], vec![300, 400]],
    })?;

    // blocks 4 of 8: certainty = 0.5 + 0.25 = 0.75.
    assert_close(snapshot.fee_rate(4, 8)?, 1.0_f64.exp());
    Ok(())
}

#[test]
fn malformed_matrices_are_rejected() {
    let mut body = flat_matrix(100);
    body.index.clear();
    body.data.clear();
    assert!(matches!(
        FeeSnapshot::try_from(body),
        Err(FeeError::EmptyIndex)
    ));

    let mut body = flat_matrix(100);
    body.columns.clear();
    assert!(matches!(
        FeeSnapshot::try_from(body),
        Err(FeeError::EmptyColumns)
    ));

    let mut body = flat_matrix(100);
    body.columns[1] = "ninety".into();
    assert!(matches!(
        FeeSnapshot::try_from(body),
        Err(FeeError::InvalidColumn(c)) if c == "ninety"
    ));

    let mut body = flat_matrix(100);
    body.data.pop();
    assert!(matches!(
        FeeSnapshot::try_from(body),
        Err(FeeError::RowCount { rows: 2, index: 3 })
    ));

    let mut body = flat_matrix(100);
    body.data[2].pop();
    assert!(matches!(
        FeeSnapshot::try_from(body),
        Err(FeeError::RowWidth {
            row: 2,
            cells: 2,
            columns: 3
        })
    ));
}

#[test]
fn zero_window_is_an_error() -> Result<()> {
    let snapshot = FeeSnapshot::try_from(flat_matrix(100))?;
    assert!(matches!(
        snapshot.fee_rate(10, 0),
        Err(FeeError::EmptyWindow)
    ));
    Ok(())
}

#[test]
fn matrix_parses_from_feed_json() -> Result<()> {
    let raw = r#"{"index":[3,6],"columns":["0.5000","0.9000"],"data":[[120,180],[100,150]]}"#;
    let body: FeeMatrixBody = serde_json::from_str(raw).context("decode feed json")?;
    let snapshot = FeeSnapshot::try_from(body)?;
    assert_eq!(snapshot.rows(), 2);
    assert_eq!(snapshot.columns(), 2);
    Ok(())
}

#[test]
fn cache_bust_floors_to_five_minutes() {
    assert_eq!(cache_bust(1_700_000_123), 1_700_000_100);
    assert_eq!(cache_bust(1_700_000_100), 1_700_000_100);
    assert_eq!(cache_bust(299), 0);
}

#[tokio::test]
async fn oracle_has_no_data_before_first_refresh() -> Result<()> {
    let feed = Arc::new(StaticFeeFeed::new(None));
    let oracle = FeeRateOracle::new(feed.clone(), Duration::from_secs(300));

    assert!(matches!(oracle.fee_rate(10, 100), Err(FeeError::NoData)));
    assert!(oracle.refresh().await.is_err());
    assert!(matches!(oracle.fee_rate(10, 100), Err(FeeError::NoData)));
    assert_eq!(feed.fetches.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn failed_refresh_keeps_last_snapshot() -> Result<()> {
    let feed = Arc::new(StaticFeeFeed::new(Some(flat_matrix(0))));
    let oracle = FeeRateOracle::new(feed.clone(), Duration::from_secs(300));

    oracle.refresh().await.context("first refresh")?;
    assert_close(oracle.fee_rate(10, 100)?, 1.0);

    let mut broken = flat_matrix(500);
    broken.data.pop();
    *feed.body.lock().unwrap() = Some(broken);
    assert!(oracle.refresh().await.is_err());
    assert_close(oracle.fee_rate(10, 100)?, 1.0);

    *feed.body.lock().unwrap() = Some(flat_matrix(200));
    oracle.refresh().await.context("third refresh")?;
    assert_close(oracle.fee_rate(10, 100)?, 2.0_f64.exp());
    Ok(())
}

#[tokio::test]
async fn oracle_loop_stops_on_shutdown() -> Result<()> {
    let feed = Arc::new(StaticFeeFeed::new(Some(flat_matrix(0))));
    let oracle = Arc::new(FeeRateOracle::new(feed.clone(), Duration::from_secs(3600)));
    let (trigger, shutdown) = ln_subswap::shutdown::channel();

    let task = tokio::spawn({
        let oracle = oracle.clone();
        async move { oracle.run(shutdown).await }
    });

    let fetches = &feed.fetches;
    wait_for("first fee fetch", Duration::from_secs(5), || async move {
        Ok((fetches.load(Ordering::SeqCst) > 0).then_some(()))
    })
    .await?;
    trigger.trigger();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .context("oracle loop did not stop")?
        .context("join oracle loop")?;

    assert!(oracle.snapshot().is_ok());
    Ok(())
}

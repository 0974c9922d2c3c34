mod common;

use anyhow::Result;
use common::{fund, register, test_engine};
use farebox::application::LedgerError;
use farebox::domain::{Actor, Direction, EntryStatus, EntryType, FareBreakdown, LedgerEntry};
use farebox::io::Exporter;
use uuid::Uuid;

#[tokio::test]
async fn test_audit_passes_after_normal_activity() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let (rider, _) = register(&engine, "rider@example.com").await?;
    let (driver, _) = register(&engine, "driver@example.com").await?;
    fund(&engine, &rider, 500000).await?;
    engine
        .wallets()
        .create_top_up_transaction(rider.id, 50000, "ORDER-7", "KEY-7", EntryStatus::Pending)
        .await?;

    let settled = Uuid::new_v4();
    let cancelled = Uuid::new_v4();
    engine
        .rides()
        .hold_ride_funds(rider.id, settled, 200000, None)
        .await?;
    engine
        .rides()
        .hold_ride_funds(rider.id, cancelled, 50000, None)
        .await?;
    engine
        .rides()
        .settle_ride_funds(rider.id, driver.id, settled, &FareBreakdown::new(180000))
        .await?;
    engine
        .rides()
        .release_ride_funds(rider.id, cancelled, None)
        .await?;

    let report = engine.audit_ledger().await?;
    assert!(report.is_healthy(), "issues: {:?}", report.issues);
    // rider, driver, system
    assert_eq!(report.wallet_count, 3);
    assert_eq!(report.pending_top_ups, 1);
    assert!(!report.has_sequence_gaps);

    Ok(())
}

#[tokio::test]
async fn test_audit_reports_unbalanced_and_orphan_groups() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let (rider, wallet) = register(&engine, "rider@example.com").await?;
    fund(&engine, &rider, 500000).await?;

    // A capture debit with no hold and no credits
    let mut stray = LedgerEntry::new(
        EntryType::CaptureFare,
        Direction::Out,
        Actor::User(rider.id),
        wallet.id,
        1000,
        "VND",
        EntryStatus::Success,
    );
    let repo = engine.repository();
    let mut conn = repo.acquire().await?;
    repo.insert_entry(&mut conn, &mut stray).await?;
    drop(conn);

    let report = engine.audit_ledger().await?;
    assert!(!report.is_healthy());
    assert_eq!(report.unbalanced_groups.len(), 1);
    assert_eq!(report.unbalanced_groups[0].group_id, stray.group_id);
    assert_eq!(report.unbalanced_groups[0].debited, 1000);
    assert_eq!(report.unbalanced_groups[0].credited, 0);
    assert_eq!(report.orphan_resolutions, vec![stray.group_id]);
    // both derivations agree even on a broken ledger
    assert!(report.mismatches.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_partial_snapshot_is_rejected_on_read() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let (rider, wallet) = register(&engine, "rider@example.com").await?;
    fund(&engine, &rider, 500000).await?;

    let hold = engine
        .wallets()
        .hold_amount(wallet.id, 100000, Uuid::new_v4(), None)
        .await?;

    let mut conn = engine.repository().acquire().await?;
    sqlx::query("UPDATE ledger_entries SET after_pending = NULL WHERE id = ?")
        .bind(hold.id.to_string())
        .execute(&mut *conn)
        .await?;
    drop(conn);

    let err = engine.wallets().get_entry(hold.id).await.unwrap_err();
    assert!(matches!(err, LedgerError::IncompleteSnapshot));

    let report = engine.audit_ledger().await?;
    assert_eq!(report.incomplete_snapshots, 1);
    assert!(!report.is_healthy());

    Ok(())
}

#[tokio::test]
async fn test_export_entries_csv() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let (rider, wallet) = register(&engine, "rider@example.com").await?;
    fund(&engine, &rider, 500000).await?;
    engine
        .wallets()
        .hold_amount(wallet.id, 100000, Uuid::new_v4(), Some("airport".into()))
        .await?;

    let mut buffer = Vec::new();
    let count = Exporter::new(&engine)
        .export_entries_csv(&mut buffer)
        .await?;
    assert_eq!(count, 2);

    let csv = String::from_utf8(buffer)?;
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("sequence,id,created_at,group_id,entry_type"));
    assert!(lines[1].contains(",TOPUP,IN,USER,"));
    assert!(lines[2].contains(",HOLD_CREATE,INTERNAL,USER,"));
    assert!(lines[2].ends_with(",500000,400000,0,100000,airport"));

    Ok(())
}

#[tokio::test]
async fn test_export_full_json_snapshot() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let (rider, wallet) = register(&engine, "rider@example.com").await?;
    fund(&engine, &rider, 500000).await?;
    engine
        .wallets()
        .hold_amount(wallet.id, 100000, Uuid::new_v4(), None)
        .await?;

    let mut buffer = Vec::new();
    let snapshot = Exporter::new(&engine).export_full_json(&mut buffer).await?;
    assert_eq!(snapshot.users.len(), 1);
    assert_eq!(snapshot.wallets.len(), 1);
    assert_eq!(snapshot.entries.len(), 2);
    assert_eq!(snapshot.balances[0].available, 400000);
    assert_eq!(snapshot.balances[0].pending, 100000);

    let json: serde_json::Value = serde_json::from_slice(&buffer)?;
    assert_eq!(json["entries"][1]["entry_type"], "HOLD_CREATE");

    Ok(())
}

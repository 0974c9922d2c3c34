mod common;

use anyhow::Result;
use common::{fund, register, test_engine};
use farebox::application::{ErrorKind, LedgerError};
use farebox::domain::{EntryStatus, EntryType, compute_balance};
use uuid::Uuid;

#[tokio::test]
async fn test_hold_moves_available_to_pending() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let (user, wallet) = register(&engine, "rider@example.com").await?;
    fund(&engine, &user, 500000).await?;

    let g1 = Uuid::new_v4();
    let hold = engine
        .wallets()
        .hold_amount(wallet.id, 100000, g1, Some("airport ride".into()))
        .await?;
    assert_eq!(hold.entry_type, EntryType::HoldCreate);
    assert_eq!(hold.status, EntryStatus::Success);
    assert_eq!(hold.group_id, g1);
    assert_eq!(hold.note.as_deref(), Some("airport ride"));

    let snapshot = hold.snapshot.expect("hold carries a snapshot");
    assert_eq!(snapshot.before_available, 500000);
    assert_eq!(snapshot.after_available, 400000);
    assert_eq!(snapshot.before_pending, 0);
    assert_eq!(snapshot.after_pending, 100000);

    assert_eq!(
        engine.balances().calculate_available_balance(wallet.id).await?,
        400000
    );
    assert_eq!(
        engine.balances().calculate_pending_balance(wallet.id).await?,
        100000
    );

    Ok(())
}

#[tokio::test]
async fn test_release_restores_available() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let (user, wallet) = register(&engine, "rider@example.com").await?;
    fund(&engine, &user, 500000).await?;

    let g1 = Uuid::new_v4();
    engine
        .wallets()
        .hold_amount(wallet.id, 100000, g1, None)
        .await?;
    let release = engine.wallets().release_hold(g1, None).await?;
    assert_eq!(release.entry_type, EntryType::HoldRelease);
    assert_eq!(release.amount, 100000);
    assert_eq!(release.group_id, g1);

    let balance = engine.balances().calculate_balance(wallet.id).await?;
    assert_eq!(balance.available, 500000);
    assert_eq!(balance.pending, 0);

    Ok(())
}

#[tokio::test]
async fn test_hold_cannot_be_released_twice() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let (user, wallet) = register(&engine, "rider@example.com").await?;
    fund(&engine, &user, 500000).await?;

    let g1 = Uuid::new_v4();
    engine
        .wallets()
        .hold_amount(wallet.id, 100000, g1, None)
        .await?;
    engine.wallets().release_hold(g1, None).await?;

    let err = engine.wallets().release_hold(g1, None).await.unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyResolved(g) if g == g1));
    assert_eq!(err.kind(), ErrorKind::Validation);

    // Still exactly one resolution
    let group = engine.wallets().list_group(g1).await?;
    assert_eq!(group.len(), 2);
    assert_eq!(engine.balances().calculate_available_balance(wallet.id).await?, 500000);

    Ok(())
}

#[tokio::test]
async fn test_release_unknown_group_is_not_found() -> Result<()> {
    let (engine, _temp) = test_engine().await?;

    let err = engine
        .wallets()
        .release_hold(Uuid::new_v4(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::HoldNotFound(_)));
    assert_eq!(err.kind(), ErrorKind::NotFound);

    Ok(())
}

#[tokio::test]
async fn test_hold_above_available_is_rejected() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let (user, wallet) = register(&engine, "rider@example.com").await?;
    fund(&engine, &user, 500000).await?;

    let err = engine
        .wallets()
        .hold_amount(wallet.id, 500001, Uuid::new_v4(), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InsufficientBalance {
            available: 500000,
            required: 500001,
            ..
        }
    ));

    // Nothing was written
    assert_eq!(engine.wallets().list_entries(wallet.id).await?.len(), 1);

    // The whole balance can be held
    engine
        .wallets()
        .hold_amount(wallet.id, 500000, Uuid::new_v4(), None)
        .await?;
    assert_eq!(engine.balances().calculate_available_balance(wallet.id).await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_hold_rejects_bad_input() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let (user, wallet) = register(&engine, "rider@example.com").await?;
    fund(&engine, &user, 500000).await?;

    let err = engine
        .wallets()
        .hold_amount(wallet.id, 0, Uuid::new_v4(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidAmount(_)));

    let err = engine
        .wallets()
        .hold_amount(Uuid::new_v4(), 100, Uuid::new_v4(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::WalletNotFound(_)));

    Ok(())
}

#[tokio::test]
async fn test_group_holds_only_once() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let (user, wallet) = register(&engine, "rider@example.com").await?;
    fund(&engine, &user, 500000).await?;

    let g1 = Uuid::new_v4();
    engine
        .wallets()
        .hold_amount(wallet.id, 100000, g1, None)
        .await?;

    let err = engine
        .wallets()
        .hold_amount(wallet.id, 100000, g1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::HoldAlreadyExists(g) if g == g1));
    assert_eq!(engine.balances().calculate_pending_balance(wallet.id).await?, 100000);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_holds_cannot_double_spend() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let (user, wallet) = register(&engine, "rider@example.com").await?;
    fund(&engine, &user, 500000).await?;

    let wallet_id = wallet.id;
    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .wallets()
                .hold_amount(wallet_id, 300000, Uuid::new_v4(), None)
                .await
        }));
    }

    let mut succeeded = 0;
    let mut insufficient = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => succeeded += 1,
            Err(LedgerError::InsufficientBalance { .. }) => insufficient += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(succeeded, 1);
    assert_eq!(insufficient, 1);

    let balance = engine.balances().calculate_balance(wallet.id).await?;
    assert_eq!(balance.available, 200000);
    assert_eq!(balance.pending, 300000);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_holds_admit_exactly_what_fits() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let (user, wallet) = register(&engine, "rider@example.com").await?;
    fund(&engine, &user, 550000).await?;

    let wallet_id = wallet.id;
    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .wallets()
                .hold_amount(wallet_id, 100000, Uuid::new_v4(), None)
                .await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        if handle.await?.is_ok() {
            succeeded += 1;
        }
    }
    assert_eq!(succeeded, 5);

    let balance = engine.balances().calculate_balance(wallet.id).await?;
    assert_eq!(balance.available, 50000);
    assert_eq!(balance.pending, 500000);

    // Every snapshot chain starts where the previous hold ended
    let mut holds: Vec<_> = engine
        .wallets()
        .list_entries(wallet.id)
        .await?
        .into_iter()
        .filter(|e| e.entry_type == EntryType::HoldCreate)
        .collect();
    holds.sort_by_key(|e| e.sequence);
    for pair in holds.windows(2) {
        let prev = pair[0].snapshot.expect("snapshot");
        let next = pair[1].snapshot.expect("snapshot");
        assert_eq!(prev.after_available, next.before_available);
        assert_eq!(prev.after_pending, next.before_pending);
    }

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_releases_resolve_once() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let (user, wallet) = register(&engine, "rider@example.com").await?;
    fund(&engine, &user, 500000).await?;

    let g1 = Uuid::new_v4();
    engine
        .wallets()
        .hold_amount(wallet.id, 200000, g1, None)
        .await?;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.wallets().release_hold(g1, None).await
        }));
    }

    let mut released = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => released += 1,
            Err(LedgerError::AlreadyResolved(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(released, 1);
    assert_eq!(engine.balances().calculate_available_balance(wallet.id).await?, 500000);

    Ok(())
}

#[tokio::test]
async fn test_sql_balance_matches_entry_replay() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let (user, wallet) = register(&engine, "rider@example.com").await?;
    fund(&engine, &user, 500000).await?;

    let g1 = Uuid::new_v4();
    let g2 = Uuid::new_v4();
    engine
        .wallets()
        .hold_amount(wallet.id, 100000, g1, None)
        .await?;
    engine
        .wallets()
        .hold_amount(wallet.id, 50000, g2, None)
        .await?;
    engine.wallets().release_hold(g2, None).await?;

    let entries = engine.wallets().list_entries(wallet.id).await?;
    let replayed = compute_balance(wallet.id, &entries);
    let aggregated = engine.balances().calculate_balance(wallet.id).await?;
    assert_eq!(replayed, aggregated);

    Ok(())
}

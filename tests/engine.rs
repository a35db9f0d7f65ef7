use polyleverage_engine::domain::{MarginHealth, PositionStatus, Side};
use polyleverage_engine::error::EngineError;
use polyleverage_engine::infrastructure::InMemoryRemoteStore;
use polyleverage_engine::services::{
    BalanceLedger, CreatePositionRequest, PositionManager, PositionStore,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const REMOTE_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    manager: PositionManager<InMemoryRemoteStore>,
    store: Arc<PositionStore<InMemoryRemoteStore>>,
    ledger: Arc<BalanceLedger>,
}

fn build(dir: &Path) -> Harness {
    let store = Arc::new(PositionStore::open(
        dir.join("positions.json"),
        InMemoryRemoteStore::new(),
        REMOTE_TIMEOUT,
    ));
    let ledger = Arc::new(BalanceLedger::open(dir.join("deposits.json")));
    let manager = PositionManager::new(Arc::clone(&store), Arc::clone(&ledger));
    Harness {
        manager,
        store,
        ledger,
    }
}

fn request(
    user: &str,
    market: &str,
    side: Side,
    entry: Decimal,
    collateral: Decimal,
    leverage: u16,
    total_deposits: Decimal,
) -> CreatePositionRequest {
    CreatePositionRequest {
        market_id: market.to_string(),
        market_name: format!("Market {}", market),
        side,
        entry_price: entry,
        collateral,
        leverage,
        maintenance_margin: None,
        user_address: user.to_string(),
        total_deposits,
    }
}

#[tokio::test]
async fn create_reserves_collateral_and_lists_enriched() {
    let dir = TempDir::new().unwrap();
    let h = build(dir.path());

    let position = h
        .manager
        .create_position(request(
            "alice",
            "btc",
            Side::Long,
            dec!(100),
            dec!(500),
            10,
            dec!(500),
        ))
        .await
        .unwrap();

    assert_eq!(position.liquidation_price, dec!(90));
    assert_eq!(position.current_price, dec!(100));
    assert_eq!(position.status, PositionStatus::Active);
    assert_eq!(h.ledger.used_amount("alice").await, dec!(500));

    let summaries = h.manager.list_user_positions("alice").await.unwrap();
    assert_eq!(summaries.len(), 1);
    let s = &summaries[0];
    assert_eq!(s.position.id, position.id);
    assert_eq!(s.margin_ratio, dec!(10)); // percent
    assert_eq!(s.health, MarginHealth::Healthy);
    assert_eq!(s.pnl, dec!(0));
    assert_eq!(s.pnl_percentage, dec!(0));
    assert_eq!(s.position_size, dec!(5000));
}

#[tokio::test]
async fn second_create_beyond_deposits_is_rejected() {
    let dir = TempDir::new().unwrap();
    let h = build(dir.path());

    h.manager
        .create_position(request(
            "alice",
            "btc",
            Side::Long,
            dec!(100),
            dec!(500),
            10,
            dec!(500),
        ))
        .await
        .unwrap();

    // the full deposit total is now reserved; any further collateral fails
    let err = h
        .manager
        .create_position(request(
            "alice",
            "eth",
            Side::Short,
            dec!(3500),
            dec!(1),
            5,
            dec!(500),
        ))
        .await
        .unwrap_err();

    match err {
        EngineError::InsufficientBalance {
            required,
            available,
        } => {
            assert_eq!(required, dec!(1));
            assert_eq!(available, dec!(0));
        }
        other => panic!("expected InsufficientBalance, got {:?}", other),
    }

    // the failed attempt must not have touched the reservation
    assert_eq!(h.ledger.used_amount("alice").await, dec!(500));
}

#[tokio::test]
async fn invalid_parameters_fail_before_any_mutation() {
    let dir = TempDir::new().unwrap();
    let h = build(dir.path());

    let cases = vec![
        request("alice", "btc", Side::Long, dec!(100), dec!(100), 0, dec!(1000)),
        request("alice", "btc", Side::Long, dec!(100), dec!(100), 21, dec!(1000)),
        request("alice", "btc", Side::Long, dec!(0), dec!(100), 10, dec!(1000)),
        request("alice", "btc", Side::Long, dec!(100), dec!(0), 10, dec!(1000)),
        {
            let mut r = request("alice", "btc", Side::Long, dec!(100), dec!(100), 10, dec!(1000));
            r.maintenance_margin = Some(dec!(0.2));
            r
        },
    ];

    for case in cases {
        let err = h.manager.create_position(case).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter(_)));
    }

    assert_eq!(h.ledger.used_amount("alice").await, dec!(0));
    assert!(h.manager.get_all_active().await.is_empty());
}

#[tokio::test]
async fn close_returns_final_balance_to_ledger() {
    let dir = TempDir::new().unwrap();
    let h = build(dir.path());

    let position = h
        .manager
        .create_position(request(
            "alice",
            "btc",
            Side::Long,
            dec!(100),
            dec!(400),
            5,
            dec!(1000),
        ))
        .await
        .unwrap();
    assert_eq!(h.ledger.used_amount("alice").await, dec!(400));

    // +10% price move on 2000 notional: pnl +200
    h.manager.update_mark_price("btc", dec!(110)).await.unwrap();

    let err = h
        .manager
        .close_position(&position.id, "mallory")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));

    let closed = h.manager.close_position(&position.id, "alice").await.unwrap();
    assert_eq!(closed.pnl, dec!(200));
    assert_eq!(closed.final_balance, dec!(600));
    assert_eq!(closed.position.status, PositionStatus::Closed);

    // release is floored at zero: 400 used minus 600 returned
    assert_eq!(h.ledger.used_amount("alice").await, dec!(0));

    // closing again neither succeeds nor releases more funds
    let err = h
        .manager
        .close_position(&position.id, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
    assert_eq!(h.ledger.used_amount("alice").await, dec!(0));
}

#[tokio::test]
async fn close_at_a_loss_returns_remainder_only() {
    let dir = TempDir::new().unwrap();
    let h = build(dir.path());

    let position = h
        .manager
        .create_position(request(
            "bob",
            "btc",
            Side::Long,
            dec!(100),
            dec!(400),
            5,
            dec!(1000),
        ))
        .await
        .unwrap();

    // -5% price move on 2000 notional: pnl -100
    h.manager.update_mark_price("btc", dec!(95)).await.unwrap();

    let closed = h.manager.close_position(&position.id, "bob").await.unwrap();
    assert_eq!(closed.pnl, dec!(-100));
    assert_eq!(closed.final_balance, dec!(300));
    assert_eq!(h.ledger.used_amount("bob").await, dec!(100));
}

#[tokio::test]
async fn sweep_liquidates_crossed_positions_and_forfeits_collateral() {
    let dir = TempDir::new().unwrap();
    let h = build(dir.path());

    let position = h
        .manager
        .create_position(request(
            "carol",
            "btc",
            Side::Long,
            dec!(100),
            dec!(1000),
            10,
            dec!(2000),
        ))
        .await
        .unwrap();
    assert_eq!(position.liquidation_price, dec!(90));

    // price exactly at the liquidation price is eligible
    h.manager.update_mark_price("btc", dec!(90)).await.unwrap();

    let report = h.manager.sweep_liquidations().await;
    assert_eq!(report.liquidations.len(), 1);
    assert!(report.errors.is_empty());

    let outcome = &report.liquidations[0];
    assert_eq!(outcome.position_id, position.id);
    assert_eq!(outcome.pnl, dec!(-1000));
    assert_eq!(outcome.remaining_collateral, dec!(0));

    let stored = h.store.get(&position.id).await.unwrap();
    assert_eq!(stored.status, PositionStatus::Liquidated);

    // liquidation forfeits the reservation; nothing returns to the ledger
    assert_eq!(h.ledger.used_amount("carol").await, dec!(1000));
    assert_eq!(
        h.ledger.available_balance("carol", dec!(2000)).await,
        dec!(1000)
    );

    // a second sweep finds nothing left to do
    let report = h.manager.sweep_liquidations().await;
    assert!(report.liquidations.is_empty());
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn explicit_liquidation_revalidates_the_price() {
    let dir = TempDir::new().unwrap();
    let h = build(dir.path());

    let position = h
        .manager
        .create_position(request(
            "dave",
            "btc",
            Side::Long,
            dec!(100),
            dec!(500),
            10,
            dec!(1000),
        ))
        .await
        .unwrap();

    // still at the entry price: does not qualify
    let err = h
        .manager
        .liquidate_position(&position.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PreconditionFailed(_)));

    // supplied mark price below the liquidation price qualifies
    let outcome = h
        .manager
        .liquidate_position(&position.id, Some(dec!(85)))
        .await
        .unwrap();
    assert_eq!(outcome.market_price, dec!(85));
    assert!(outcome.pnl < dec!(0));

    // already liquidated
    let err = h
        .manager
        .liquidate_position(&position.id, Some(dec!(85)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    let err = h.manager.liquidate_position("missing", None).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn mark_price_update_targets_one_market() {
    let dir = TempDir::new().unwrap();
    let h = build(dir.path());

    for (user, market) in [("alice", "btc"), ("bob", "btc"), ("carol", "eth")] {
        h.manager
            .create_position(request(
                user,
                market,
                Side::Long,
                dec!(100),
                dec!(100),
                2,
                dec!(1000),
            ))
            .await
            .unwrap();
    }

    let report = h.manager.update_mark_price("btc", dec!(120)).await.unwrap();
    assert_eq!(report.updated, 2);
    assert!(report.errors.is_empty());

    for position in h.manager.get_all_active().await {
        let expected = if position.market_id == "btc" {
            dec!(120)
        } else {
            dec!(100)
        };
        assert_eq!(position.current_price, expected);
    }

    let err = h.manager.update_mark_price("btc", dec!(0)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidParameter(_)));
}

#[tokio::test]
async fn concurrent_closes_release_funds_once() {
    let dir = TempDir::new().unwrap();
    let h = build(dir.path());

    h.manager
        .create_position(request(
            "alice",
            "eth",
            Side::Long,
            dec!(100),
            dec!(500),
            2,
            dec!(1000),
        ))
        .await
        .unwrap();
    let target = h
        .manager
        .create_position(request(
            "alice",
            "btc",
            Side::Long,
            dec!(100),
            dec!(500),
            2,
            dec!(1000),
        ))
        .await
        .unwrap();
    assert_eq!(h.ledger.used_amount("alice").await, dec!(1000));

    let manager = Arc::new(h.manager);
    let first = {
        let manager = Arc::clone(&manager);
        let id = target.id.clone();
        tokio::spawn(async move { manager.close_position(&id, "alice").await })
    };
    let second = {
        let manager = Arc::clone(&manager);
        let id = target.id.clone();
        tokio::spawn(async move { manager.close_position(&id, "alice").await })
    };

    let results = [first.await.unwrap(), second.await.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for result in &results {
        if let Err(e) = result {
            assert!(matches!(e, EngineError::InvalidState(_)));
        }
    }

    // exactly one release of 500; the other position stays reserved
    assert_eq!(h.ledger.used_amount("alice").await, dec!(500));
}

#[tokio::test]
async fn failed_price_updates_are_reported() {
    let dir = TempDir::new().unwrap();
    let h = build(dir.path());
    let positions_path = dir.path().join("positions.json");

    let position = h
        .manager
        .create_position(request(
            "alice",
            "btc",
            Side::Long,
            dec!(100),
            dec!(100),
            2,
            dec!(1000),
        ))
        .await
        .unwrap();

    std::fs::remove_file(&positions_path).unwrap();
    std::fs::create_dir(&positions_path).unwrap();

    let report = h.manager.update_mark_price("btc", dec!(120)).await.unwrap();
    assert_eq!(report.updated, 0);
    assert_eq!(report.errors.len(), 1);

    // the failed write rolled back
    assert_eq!(
        h.store.get(&position.id).await.unwrap().current_price,
        dec!(100)
    );
}

#[tokio::test]
async fn sweep_isolates_store_failures_per_position() {
    let dir = TempDir::new().unwrap();
    let h = build(dir.path());
    let positions_path = dir.path().join("positions.json");

    // a stays healthy on its own market; b and c will cross
    let a = h
        .manager
        .create_position(request(
            "alice",
            "sol",
            Side::Long,
            dec!(100),
            dec!(100),
            2,
            dec!(1000),
        ))
        .await
        .unwrap();
    let b = h
        .manager
        .create_position(request(
            "bob",
            "btc",
            Side::Long,
            dec!(100),
            dec!(100),
            10,
            dec!(1000),
        ))
        .await
        .unwrap();
    let c = h
        .manager
        .create_position(request(
            "carol",
            "btc",
            Side::Long,
            dec!(100),
            dec!(100),
            10,
            dec!(1000),
        ))
        .await
        .unwrap();

    h.manager.update_mark_price("btc", dec!(85)).await.unwrap();

    // break the snapshot path so every status write fails
    std::fs::remove_file(&positions_path).unwrap();
    std::fs::create_dir(&positions_path).unwrap();

    let report = h.manager.sweep_liquidations().await;

    // both eligible positions failed, each reported individually, and the
    // sweep still ran to completion
    assert!(report.liquidations.is_empty());
    assert_eq!(report.errors.len(), 2);

    // failed transitions rolled back: nothing is stuck half-liquidated
    for id in [&b.id, &c.id] {
        let position = h.store.get(id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Active);
    }
    assert_eq!(
        h.store.get(&a.id).await.unwrap().status,
        PositionStatus::Active
    );

    // restore the path and the next sweep succeeds
    std::fs::remove_dir(&positions_path).unwrap();
    let report = h.manager.sweep_liquidations().await;
    assert_eq!(report.liquidations.len(), 2);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn ledger_survives_restart_and_floors_release() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("deposits.json");

    {
        let ledger = BalanceLedger::open(&path);
        ledger.reserve("alice", dec!(300)).await.unwrap();
        ledger.reserve("alice", dec!(200)).await.unwrap();
        assert_eq!(ledger.used_amount("alice").await, dec!(500));
    }

    let ledger = BalanceLedger::open(&path);
    assert_eq!(ledger.used_amount("alice").await, dec!(500));
    assert_eq!(ledger.available_balance("alice", dec!(800)).await, dec!(300));
    assert_eq!(ledger.available_balance("alice", dec!(400)).await, dec!(0));

    // releasing more than is reserved floors at zero
    ledger.release("alice", dec!(700)).await.unwrap();
    assert_eq!(ledger.used_amount("alice").await, dec!(0));

    // releasing for an unknown user is harmless
    ledger.release("nobody", dec!(10)).await.unwrap();
    assert_eq!(ledger.used_amount("nobody").await, dec!(0));
}

#[tokio::test]
async fn engine_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let id;

    {
        let h = build(dir.path());
        let position = h
            .manager
            .create_position(request(
                "alice",
                "btc",
                Side::Short,
                dec!(200),
                dec!(250),
                4,
                dec!(500),
            ))
            .await
            .unwrap();
        id = position.id;
    }

    let h = build(dir.path());
    let position = h.store.get(&id).await.unwrap();
    assert_eq!(position.side, Side::Short);
    assert_eq!(position.liquidation_price, dec!(250));
    assert_eq!(h.ledger.used_amount("alice").await, dec!(250));

    // the reservation still gates new positions after restart
    let err = h
        .manager
        .create_position(request(
            "alice",
            "eth",
            Side::Long,
            dec!(100),
            dec!(300),
            2,
            dec!(500),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientBalance { .. }));
}

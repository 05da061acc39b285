//! Integration tests for the Postgres fabric: topic routing, visibility
//! leases, redelivery, and dead-lettering.

use std::time::Duration;

use serde_json::json;

use graft_fabric::pg::{FabricConfig, PgFabric};
use graft_fabric::routing::{RESULTS_PATTERN, RESULTS_QUEUE, dispatch_key, result_key};
use graft_fabric::Fabric;
use graft_test_utils::{create_test_db, drop_test_db};

fn fabric(pool: sqlx::PgPool, visibility: Duration, dead_letter_after: i32) -> PgFabric {
    PgFabric::new(
        pool,
        FabricConfig {
            visibility_timeout: visibility,
            dead_letter_after,
        },
    )
}

#[tokio::test]
async fn publish_consume_ack_roundtrip() {
    let (pool, db_name) = create_test_db().await;
    let fabric = fabric(pool.clone(), Duration::from_secs(30), 5);

    fabric
        .declare_queue("task.generic", &[dispatch_key("generic")])
        .await
        .unwrap();

    let payload = json!({"task_id": "t1", "dispatch_seq": 1});
    fabric.publish(&dispatch_key("generic"), &payload).await.unwrap();

    let delivery = fabric
        .consume("task.generic")
        .await
        .unwrap()
        .expect("message should be delivered");
    assert_eq!(delivery.payload, payload);
    assert_eq!(delivery.routing_key, "task.generic");
    assert_eq!(delivery.delivery_count, 1);
    assert!(!delivery.redelivered());

    fabric.ack(&delivery).await.unwrap();
    assert!(fabric.consume("task.generic").await.unwrap().is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn unroutable_messages_are_dropped() {
    let (pool, db_name) = create_test_db().await;
    let fabric = fabric(pool.clone(), Duration::from_secs(30), 5);

    fabric
        .declare_queue("task.file_writer", &[dispatch_key("file_writer")])
        .await
        .unwrap();

    // No binding matches this key.
    fabric
        .publish(&dispatch_key("code_executor"), &json!({}))
        .await
        .unwrap();
    assert!(fabric.consume("task.file_writer").await.unwrap().is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn wildcard_binding_collects_all_results() {
    let (pool, db_name) = create_test_db().await;
    let fabric = fabric(pool.clone(), Duration::from_secs(30), 5);

    fabric
        .declare_queue(RESULTS_QUEUE, &[RESULTS_PATTERN.to_string()])
        .await
        .unwrap();

    fabric
        .publish(&result_key("code_executor"), &json!({"task": 1}))
        .await
        .unwrap();
    fabric
        .publish(&result_key("file_writer"), &json!({"task": 2}))
        .await
        .unwrap();

    let first = fabric.consume(RESULTS_QUEUE).await.unwrap().unwrap();
    let second = fabric.consume(RESULTS_QUEUE).await.unwrap().unwrap();
    assert_eq!(first.payload["task"], 1);
    assert_eq!(second.payload["task"], 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn fanout_reaches_every_matching_queue() {
    let (pool, db_name) = create_test_db().await;
    let fabric = fabric(pool.clone(), Duration::from_secs(30), 5);

    fabric
        .declare_queue("task.code_executor", &[dispatch_key("code_executor")])
        .await
        .unwrap();
    fabric
        .declare_queue("audit", &["task.#".to_string()])
        .await
        .unwrap();

    fabric
        .publish(&dispatch_key("code_executor"), &json!({"n": 7}))
        .await
        .unwrap();

    let to_executor = fabric.consume("task.code_executor").await.unwrap().unwrap();
    let to_audit = fabric.consume("audit").await.unwrap().unwrap();
    assert_eq!(to_executor.payload["n"], 7);
    assert_eq!(to_audit.payload["n"], 7);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn unacked_message_redelivers_after_visibility_lapses() {
    let (pool, db_name) = create_test_db().await;
    let fabric = fabric(pool.clone(), Duration::from_millis(200), 5);

    fabric
        .declare_queue("task.generic", &[dispatch_key("generic")])
        .await
        .unwrap();
    fabric
        .publish(&dispatch_key("generic"), &json!({"v": 1}))
        .await
        .unwrap();

    let first = fabric.consume("task.generic").await.unwrap().unwrap();
    assert_eq!(first.delivery_count, 1);

    // Invisible while the lease is live.
    assert!(fabric.consume("task.generic").await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let second = fabric.consume("task.generic").await.unwrap().unwrap();
    assert_eq!(second.message_id, first.message_id);
    assert_eq!(second.delivery_count, 2);
    assert!(second.redelivered());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn nack_returns_message_immediately() {
    let (pool, db_name) = create_test_db().await;
    let fabric = fabric(pool.clone(), Duration::from_secs(30), 5);

    fabric
        .declare_queue("task.generic", &[dispatch_key("generic")])
        .await
        .unwrap();
    fabric
        .publish(&dispatch_key("generic"), &json!({"v": 1}))
        .await
        .unwrap();

    let delivery = fabric.consume("task.generic").await.unwrap().unwrap();
    fabric.nack(&delivery).await.unwrap();

    // Available again without waiting out the lease.
    let again = fabric.consume("task.generic").await.unwrap().unwrap();
    assert_eq!(again.message_id, delivery.message_id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn message_dead_letters_after_redelivery_budget() {
    let (pool, db_name) = create_test_db().await;
    let fabric = fabric(pool.clone(), Duration::from_secs(30), 2);

    fabric
        .declare_queue("task.generic", &[dispatch_key("generic")])
        .await
        .unwrap();
    fabric
        .publish(&dispatch_key("generic"), &json!({"poison": true}))
        .await
        .unwrap();

    // Two deliveries consume the budget.
    for _ in 0..2 {
        let delivery = fabric.consume("task.generic").await.unwrap().unwrap();
        fabric.nack(&delivery).await.unwrap();
    }

    // The third attempt moves the message aside instead of delivering it.
    assert!(fabric.consume("task.generic").await.unwrap().is_none());

    let dead = fabric.dead_letters("task.generic").await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload["poison"], true);
    assert_eq!(dead[0].delivery_count, 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

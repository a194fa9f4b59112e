/// Integration tests for the sqlite status store
///
/// Tests the complete database lifecycle including:
/// - Database creation, WAL mode and schema
/// - Merge-upsert semantics on disk
/// - Records surviving a reopen
use anvil_engine::db::Database;
use anvil_engine::status::{Phase, StatusStore, StatusUpdate};
use tempfile::TempDir;

#[tokio::test]
async fn test_database_lifecycle() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("anvil.db");

    let db = Database::new(&db_path).await.unwrap();
    assert!(db_path.exists());
    assert!(temp_dir.path().join("nested").join("anvil.db-wal").exists());

    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(db.pool())
            .await
            .unwrap();
    assert!(tables.contains(&"results".to_string()));

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_run_history_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("anvil.db");

    {
        let db = Database::new(&db_path).await.unwrap();
        let store = db.results();
        store
            .upsert(
                "s1",
                StatusUpdate::phase(Phase::Pending).prompt("add a LICENSE file"),
            )
            .await
            .unwrap();
        store
            .upsert("s1", StatusUpdate::phase(Phase::ExecutingStep(2)))
            .await
            .unwrap();
        store
            .upsert(
                "s1",
                StatusUpdate::phase(Phase::Failed).error_detail("[TextGeneration] boom"),
            )
            .await
            .unwrap();
        db.close().await.unwrap();
    }

    let db = Database::new(&db_path).await.unwrap();
    let store = db.results();

    // Terminal status is sticky across processes
    let record = store
        .upsert(
            "s1",
            StatusUpdate::phase(Phase::Completed).final_result("late"),
        )
        .await
        .unwrap();
    assert_eq!(record.status, Phase::Failed);
    assert_eq!(record.error_detail, "[TextGeneration] boom");
    assert_eq!(record.prompt, "add a LICENSE file");
    // Non-status fields still merge
    assert_eq!(record.final_result, "late");

    let view = store.get("s1").await.unwrap().unwrap().view();
    assert_eq!(view.status, "FAILED");
    assert!(!view.is_running());
    assert_eq!(view.error_detail.as_deref(), Some("[TextGeneration] boom"));

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_status_column_uses_external_names() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("anvil.db")).await.unwrap();
    let store = db.results();

    store
        .upsert("s1", StatusUpdate::phase(Phase::ExecutingStep(3)))
        .await
        .unwrap();

    let status: String = sqlx::query_scalar("SELECT status FROM results WHERE session_id = ?")
        .bind("s1")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(status, "EXECUTING_STEP_3");
}

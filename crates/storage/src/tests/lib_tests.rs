use super::*;

#[tokio::test]
async fn empty_database_has_no_session() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    assert!(storage.load_session().await.expect("load").is_none());
}

#[tokio::test]
async fn saving_twice_keeps_only_latest_session() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .save_session("token-1", &Username::from("alice"))
        .await
        .expect("save");
    storage
        .save_session("token-2", &Username::from("alice"))
        .await
        .expect("save again");

    let session = storage.load_session().await.expect("load").expect("session");
    assert_eq!(session.token, "token-2");
    assert_eq!(session.username, Username::from("alice"));
}

#[tokio::test]
async fn clear_session_removes_persisted_token() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .save_session("token", &Username::from("bob"))
        .await
        .expect("save");
    storage.clear_session().await.expect("clear");
    assert!(storage.load_session().await.expect("load").is_none());
}

#[tokio::test]
async fn session_survives_reopening_database_file() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("session.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    {
        let storage = Storage::new(&database_url).await.expect("db");
        storage
            .save_session("persisted-token", &Username::from("carol"))
            .await
            .expect("save");
    }

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    let reopened = Storage::new(&database_url).await.expect("reopen");
    let session = reopened.load_session().await.expect("load").expect("session");
    assert_eq!(session.token, "persisted-token");
    assert_eq!(session.username, Username::from("carol"));
}

#[test]
fn memory_url_has_no_backing_path() {
    assert!(sqlite_path("sqlite::memory:").is_none());
    assert_eq!(
        sqlite_path("sqlite://./data/session.db?mode=rwc"),
        Some(PathBuf::from("./data/session.db"))
    );
}

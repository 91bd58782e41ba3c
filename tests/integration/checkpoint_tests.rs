//! Write-ahead log checkpointing of the data directory.

use agent_warden::models::spawn::SpawnStatus;
use agent_warden::persistence::StorageCatalog;
use agent_warden::Warden;

use super::test_helpers::{harness, test_config};

#[tokio::test]
async fn checkpoint_after_shutdown_leaves_single_files() {
    let h = harness().await;
    let agent = h.agent("planner").await;
    let spawn = h.running_spawn(&agent, Some(7)).await;
    let config = h.warden.config().as_ref().clone();
    let data_dir = config.data_dir.clone();
    let temp = h.temp;
    h.warden.shutdown().await;

    let catalog = StorageCatalog::standard(data_dir.clone(), config.storage.clone());
    let paths = catalog.checkpoint().await.expect("checkpoint");
    assert_eq!(paths.len(), 2, "ledger and sessions stores");

    for path in &paths {
        for suffix in ["-wal", "-shm"] {
            let mut side = path.as_os_str().to_owned();
            side.push(suffix);
            assert!(
                !std::path::Path::new(&side).exists(),
                "{} should be gone",
                std::path::Path::new(&side).display()
            );
        }
    }

    let reopened = Warden::open(test_config(temp.path())).await.expect("reopen");
    let stored = reopened.ledger().get(&spawn.id).await.expect("spawn survives");
    assert_eq!(stored.status, SpawnStatus::Running);
    assert_eq!(stored.pid, Some(7));
    reopened.shutdown().await;
}

#[tokio::test]
async fn checkpoint_refuses_while_a_store_is_open() {
    let h = harness().await;
    h.agent("planner").await;

    let catalog = StorageCatalog::standard(
        h.warden.config().data_dir.clone(),
        h.warden.config().storage.clone(),
    );
    assert!(catalog.checkpoint().await.is_err());
    h.shutdown().await;
}

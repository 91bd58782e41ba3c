use agent_warden::models::agent::Agent;
use agent_warden::models::spawn::{Spawn, SpawnFilter, SpawnStatus};
use agent_warden::persistence::agent_repo::AgentRepo;
use agent_warden::persistence::schema::LEDGER_MIGRATIONS;
use agent_warden::persistence::spawn_repo::SpawnRepo;
use agent_warden::persistence::Store;
use chrono::{Duration, Utc};

async fn repos() -> (AgentRepo, SpawnRepo) {
    let store = Store::open_in_memory("ledger", LEDGER_MIGRATIONS)
        .await
        .expect("open ledger");
    (AgentRepo::new(store.clone()), SpawnRepo::new(store))
}

async fn agent(agents: &AgentRepo, identity: &str) -> Agent {
    agents
        .create(&Agent::new(identity.into(), None))
        .await
        .expect("create agent")
}

fn spawn_at(agent_id: &str, channel: Option<&str>, offset_secs: i64) -> Spawn {
    let mut spawn = Spawn::new(agent_id.into(), None, channel.map(Into::into), None);
    spawn.created_at = Utc::now() + Duration::seconds(offset_secs);
    spawn
}

#[tokio::test]
async fn insert_bumps_agent_counter() {
    let (agents, spawns) = repos().await;
    let planner = agent(&agents, "planner").await;

    for _ in 0..2 {
        let spawn = Spawn::new(planner.id.clone(), None, None, None);
        assert!(spawns.insert_with_agent_bump(&spawn).await.expect("insert"));
    }

    let refreshed = agents
        .get_by_id(&planner.id)
        .await
        .expect("query")
        .expect("agent exists");
    assert_eq!(refreshed.spawn_count, 2);
    assert!(refreshed.last_active_at >= planner.last_active_at);
}

#[tokio::test]
async fn insert_refuses_unknown_or_archived_agent() {
    let (agents, spawns) = repos().await;

    let orphan = Spawn::new("no-such-agent".into(), None, None, None);
    assert!(!spawns.insert_with_agent_bump(&orphan).await.expect("insert"));
    assert!(spawns.get_by_id(&orphan.id).await.expect("query").is_none());

    let scout = agent(&agents, "scout").await;
    agents.set_archived(&scout.id).await.expect("archive");
    let spawn = Spawn::new(scout.id.clone(), None, None, None);
    assert!(!spawns.insert_with_agent_bump(&spawn).await.expect("insert"));
}

#[tokio::test]
async fn compare_and_set_requires_expected_status() {
    let (agents, spawns) = repos().await;
    let planner = agent(&agents, "planner").await;
    let spawn = Spawn::new(planner.id.clone(), None, None, None);
    spawns.insert_with_agent_bump(&spawn).await.expect("insert");

    assert!(!spawns
        .compare_and_set_status(&spawn.id, SpawnStatus::Running, SpawnStatus::Completed, None)
        .await
        .expect("stale cas"));

    let ended = Utc::now();
    assert!(spawns
        .compare_and_set_status(&spawn.id, SpawnStatus::Pending, SpawnStatus::Killed, Some(ended))
        .await
        .expect("cas"));

    let stored = spawns
        .get_by_id(&spawn.id)
        .await
        .expect("query")
        .expect("exists");
    assert_eq!(stored.status, SpawnStatus::Killed);
    assert!(stored.ended_at.is_some());
}

#[tokio::test]
async fn session_link_is_write_once() {
    let (agents, spawns) = repos().await;
    let planner = agent(&agents, "planner").await;
    let spawn = Spawn::new(planner.id.clone(), None, None, None);
    spawns.insert_with_agent_bump(&spawn).await.expect("insert");

    assert!(spawns
        .set_session_if_unlinked(&spawn.id, "first")
        .await
        .expect("link"));
    assert!(!spawns
        .set_session_if_unlinked(&spawn.id, "second")
        .await
        .expect("relink"));
    assert_eq!(
        spawns.find_by_session("first").await.expect("lookup"),
        Some(spawn.id.clone())
    );
    assert_eq!(spawns.find_by_session("second").await.expect("lookup"), None);
}

#[tokio::test]
async fn prefix_search_escapes_wildcards() {
    let (agents, spawns) = repos().await;
    let planner = agent(&agents, "planner").await;
    let spawn = Spawn::new(planner.id.clone(), None, None, None);
    spawns.insert_with_agent_bump(&spawn).await.expect("insert");

    let found = spawns.find_by_prefix(&spawn.id[..8], 2).await.expect("prefix");
    assert_eq!(found.len(), 1);
    assert!(spawns.find_by_prefix("%", 2).await.expect("wildcard").is_empty());
    assert!(spawns.find_by_prefix("_", 2).await.expect("wildcard").is_empty());
}

#[tokio::test]
async fn list_filters_and_orders_newest_first() {
    let (agents, spawns) = repos().await;
    let planner = agent(&agents, "planner").await;
    let reviewer = agent(&agents, "reviewer").await;

    let oldest = spawn_at(&planner.id, Some("c1"), -30);
    let middle = spawn_at(&reviewer.id, Some("c1"), -20);
    let newest = spawn_at(&planner.id, Some("c2"), -10);
    for spawn in [&oldest, &middle, &newest] {
        spawns.insert_with_agent_bump(spawn).await.expect("insert");
    }
    spawns
        .compare_and_set_status(&middle.id, SpawnStatus::Pending, SpawnStatus::Running, None)
        .await
        .expect("run middle");
    spawns
        .compare_and_set_status(&newest.id, SpawnStatus::Pending, SpawnStatus::Failed, Some(Utc::now()))
        .await
        .expect("fail newest");

    let ids = |rows: Vec<Spawn>| rows.into_iter().map(|s| s.id).collect::<Vec<_>>();

    let all = spawns.list(&SpawnFilter::default()).await.expect("all");
    assert_eq!(ids(all), vec![newest.id.clone(), middle.id.clone(), oldest.id.clone()]);

    let by_agent = SpawnFilter {
        agent_id: Some(planner.id.clone()),
        ..SpawnFilter::default()
    };
    assert_eq!(
        ids(spawns.list(&by_agent).await.expect("agent")),
        vec![newest.id.clone(), oldest.id.clone()]
    );

    let by_channel = SpawnFilter {
        channel_id: Some("c1".into()),
        ..SpawnFilter::default()
    };
    assert_eq!(
        ids(spawns.list(&by_channel).await.expect("channel")),
        vec![middle.id.clone(), oldest.id.clone()]
    );

    let live = SpawnFilter {
        statuses: SpawnStatus::parse_filter("running|pending").expect("filter"),
        ..SpawnFilter::default()
    };
    assert_eq!(
        ids(spawns.list(&live).await.expect("statuses")),
        vec![middle.id.clone(), oldest.id.clone()]
    );

    let limited = SpawnFilter {
        limit: Some(1),
        ..SpawnFilter::default()
    };
    assert_eq!(ids(spawns.list(&limited).await.expect("limit")), vec![newest.id.clone()]);

    let running = spawns.list_running().await.expect("running");
    assert_eq!(ids(running), vec![middle.id]);
}

//! Leadership lifecycle over the policies index: a server discovers
//! policies through the monitor, wins their leases, coordinates their
//! revisions, and releases the leases on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use uuid::Uuid;

use fleet_common::model::{Policy, PolicyLeader, Server, ServerIdentity};
use fleet_common::store::{DocStore, Query};
use fleet_common::{current_time_ms, MemStore};
use fleet_coordinator::{
    CoordinatorZero, IndexMonitor, MonitorConfig, MonitorLoop, MonitorLoopConfig,
    RELEASE_HORIZON_MS,
};

const POLICIES: &str = ".fleet-policies";
const LEADERS: &str = ".fleet-policies-leader";
const AGENTS: &str = ".fleet-agents";
const SERVERS: &str = ".fleet-servers";

fn loop_config() -> MonitorLoopConfig {
    MonitorLoopConfig {
        check_interval: Duration::from_millis(50),
        unenroll_check_interval: Duration::from_millis(10),
        lease_ttl: Duration::from_millis(30_000),
        policies_index: POLICIES.to_string(),
        leaders_index: LEADERS.to_string(),
        agents_index: AGENTS.to_string(),
        servers_index: SERVERS.to_string(),
    }
}

fn monitor_config() -> MonitorConfig {
    MonitorConfig {
        poll_interval: Duration::from_millis(20),
        fetch_size: 64,
        subscriber_buffer: 64,
    }
}

fn identity() -> ServerIdentity {
    let id = Uuid::new_v4().to_string();
    ServerIdentity {
        agent_id: id.clone(),
        host_id: id,
        version: "1.0.0".to_string(),
    }
}

async fn create_policy(store: &MemStore, policy_id: &str, revision_idx: i64) {
    let policy = Policy {
        policy_id: policy_id.to_string(),
        revision_idx,
        coordinator_idx: 0,
        data: serde_json::json!({}),
        unenroll_timeout: 0,
        checkin_timeout: 0,
    };
    store
        .create(
            POLICIES,
            &Uuid::new_v4().to_string(),
            serde_json::to_value(&policy).unwrap(),
        )
        .await
        .unwrap();
}

async fn retry<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time: {what}");
}

async fn read_leader(store: &MemStore, policy_id: &str) -> Option<PolicyLeader> {
    let hit = store.read(LEADERS, policy_id).await.ok()?;
    serde_json::from_value(hit.body).ok()
}

async fn find_coordinated(store: &MemStore, policy_id: &str) -> Option<Policy> {
    let hits = store
        .search(POLICIES, &Query::LatestN { size: 100 })
        .await
        .unwrap();
    hits.into_iter()
        .filter_map(|h| serde_json::from_value::<Policy>(h.body).ok())
        .filter(|p| p.policy_id == policy_id && p.coordinator_idx >= 1)
        .last()
}

#[tokio::test]
async fn test_monitor_leadership() {
    let store = Arc::new(MemStore::new());
    let identity = identity();
    let server_id = identity.agent_id.clone();

    // one policy exists before the monitors start
    let policy1 = Uuid::new_v4().to_string();
    create_policy(&store, &policy1, 1).await;

    let monitor = Arc::new(IndexMonitor::new(
        POLICIES,
        Arc::clone(&store) as Arc<dyn DocStore>,
        monitor_config(),
    ));
    let monitor_loop = Arc::new(MonitorLoop::new(
        loop_config(),
        identity,
        Arc::clone(&store) as _,
        Arc::clone(&store) as _,
        Arc::clone(&monitor),
        Arc::new(|| Box::new(CoordinatorZero)),
    ));

    let monitor_shutdown = Arc::new(Notify::new());
    let loop_shutdown = Arc::new(Notify::new());

    let m = Arc::clone(&monitor);
    let ms = Arc::clone(&monitor_shutdown);
    let monitor_join = tokio::spawn(async move { m.run(ms).await });

    let l = Arc::clone(&monitor_loop);
    let ls = Arc::clone(&loop_shutdown);
    let loop_join = tokio::spawn(async move { l.run(ls).await });

    // a second policy appears while everything is live
    tokio::time::sleep(Duration::from_millis(200)).await;
    let policy2 = Uuid::new_v4().to_string();
    create_policy(&store, &policy2, 1).await;

    // the server registered itself
    retry("server record registered", || {
        let store = Arc::clone(&store);
        let server_id = server_id.clone();
        async move {
            match store.read(SERVERS, &server_id).await {
                Ok(hit) => {
                    let server: Server = serde_json::from_value(hit.body).unwrap();
                    server.identity.agent_id == server_id
                }
                Err(_) => false,
            }
        }
    })
    .await;

    // leadership over both policies, with fresh heartbeats
    for policy_id in [&policy1, &policy2] {
        retry("leadership held with fresh lease", || {
            let store = Arc::clone(&store);
            let server_id = server_id.clone();
            let policy_id = policy_id.clone();
            async move {
                match read_leader(&store, &policy_id).await {
                    Some(lease) => {
                        lease.server_id == server_id
                            && current_time_ms().saturating_sub(lease.timestamp) < 5_000
                    }
                    None => false,
                }
            }
        })
        .await;
    }

    // both input revisions got coordinated: revision 1, coordinator 1
    for policy_id in [&policy1, &policy2] {
        retry("coordinated revision published", || {
            let store = Arc::clone(&store);
            let policy_id = policy_id.clone();
            async move {
                matches!(
                    find_coordinated(&store, &policy_id).await,
                    Some(p) if p.revision_idx == 1 && p.coordinator_idx == 1
                )
            }
        })
        .await;
    }

    assert_eq!(monitor_loop.led_policies().len(), 2);

    // stop the monitors
    loop_shutdown.notify_one();
    loop_join.await.unwrap().unwrap();
    monitor_shutdown.notify_one();
    monitor_join.await.unwrap().unwrap();

    // leadership was released: timestamps read as expired immediately
    for policy_id in [&policy1, &policy2] {
        let lease = read_leader(&store, policy_id).await.expect("lease record");
        assert_eq!(lease.server_id, server_id);
        let age = current_time_ms().saturating_sub(lease.timestamp);
        assert!(
            age >= RELEASE_HORIZON_MS,
            "released lease must be at least the release horizon in the past, got {age}ms"
        );
    }
}

#[tokio::test]
async fn test_second_server_takes_over_released_lease() {
    let store = Arc::new(MemStore::new());

    let policy1 = Uuid::new_v4().to_string();
    create_policy(&store, &policy1, 1).await;

    // first server: win, then shut down cleanly
    {
        let identity = identity();
        let monitor = Arc::new(IndexMonitor::new(
            POLICIES,
            Arc::clone(&store) as Arc<dyn DocStore>,
            monitor_config(),
        ));
        let monitor_loop = Arc::new(MonitorLoop::new(
            loop_config(),
            identity.clone(),
            Arc::clone(&store) as _,
            Arc::clone(&store) as _,
            Arc::clone(&monitor),
            Arc::new(|| Box::new(CoordinatorZero)),
        ));
        let monitor_shutdown = Arc::new(Notify::new());
        let loop_shutdown = Arc::new(Notify::new());

        let m = Arc::clone(&monitor);
        let ms = Arc::clone(&monitor_shutdown);
        let monitor_join = tokio::spawn(async move { m.run(ms).await });
        let l = Arc::clone(&monitor_loop);
        let ls = Arc::clone(&loop_shutdown);
        let loop_join = tokio::spawn(async move { l.run(ls).await });

        retry("first server leads", || {
            let store = Arc::clone(&store);
            let policy_id = policy1.clone();
            let server_id = identity.agent_id.clone();
            async move {
                matches!(read_leader(&store, &policy_id).await,
                    Some(lease) if lease.server_id == server_id)
            }
        })
        .await;

        loop_shutdown.notify_one();
        loop_join.await.unwrap().unwrap();
        monitor_shutdown.notify_one();
        monitor_join.await.unwrap().unwrap();
    }

    // second server: the released lease reads as expired, takeover is
    // immediate (no 30 s wait)
    let identity_b = identity();
    let server_b = identity_b.agent_id.clone();
    let monitor = Arc::new(IndexMonitor::new(
        POLICIES,
        Arc::clone(&store) as Arc<dyn DocStore>,
        monitor_config(),
    ));
    let monitor_loop = Arc::new(MonitorLoop::new(
        loop_config(),
        identity_b,
        Arc::clone(&store) as _,
        Arc::clone(&store) as _,
        Arc::clone(&monitor),
        Arc::new(|| Box::new(CoordinatorZero)),
    ));
    let monitor_shutdown = Arc::new(Notify::new());
    let loop_shutdown = Arc::new(Notify::new());

    let m = Arc::clone(&monitor);
    let ms = Arc::clone(&monitor_shutdown);
    let monitor_join = tokio::spawn(async move { m.run(ms).await });
    let l = Arc::clone(&monitor_loop);
    let ls = Arc::clone(&loop_shutdown);
    let loop_join = tokio::spawn(async move { l.run(ls).await });

    retry("second server takes over", || {
        let store = Arc::clone(&store);
        let policy_id = policy1.clone();
        let server_b = server_b.clone();
        async move {
            matches!(read_leader(&store, &policy_id).await,
                Some(lease) if lease.server_id == server_b)
        }
    })
    .await;

    loop_shutdown.notify_one();
    loop_join.await.unwrap().unwrap();
    monitor_shutdown.notify_one();
    monitor_join.await.unwrap().unwrap();
}

use std::time::Duration;

use anyhow::Result;

use crate::cluster::ClusterManager;
use crate::config::Config;
use crate::database::Database;
use crate::dispatcher::{Dispatcher, PollOutcome};
use crate::error::AppError;
use crate::fixtures;
use berth_core::models::{Command, DataSourceSpec, NodeRole, NodeUpdate};

async fn setup() -> Result<(tempfile::TempDir, Database, Dispatcher, ClusterManager)> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config).await?;
    let dispatcher = Dispatcher::new(db.clone());
    let manager = ClusterManager::new(db.clone(), dispatcher.clone());
    Ok((tmpdir, db, dispatcher, manager))
}

fn spec(name: &str, kind: &str) -> DataSourceSpec {
    DataSourceSpec {
        name: name.into(),
        kind: kind.into(),
        instances: None,
    }
}

fn is_app_error(err: &anyhow::Error, check: impl Fn(&AppError) -> bool) -> bool {
    err.downcast_ref::<AppError>().map(check).unwrap_or(false)
}

#[tokio::test]
async fn create_data_source_defaults_to_one_instance() -> Result<()> {
    let (_tmpdir, db, _dispatcher, manager) = setup().await?;

    let ds = manager.create_data_source("alice", spec("cache1", "redis")).await?;

    assert_eq!(ds.instances, 1, "expected default instances of 1, got {}", ds.instances);
    assert!(!ds.agent_token.as_str().is_empty(), "expected an agent token to be minted");
    let stored = db.must_get_data_source("cache1").await?;
    assert_eq!(stored, ds, "expected the stored record to match the returned record");

    Ok(())
}

#[tokio::test]
async fn create_data_source_rejects_invalid_input() -> Result<()> {
    let (_tmpdir, _db, _dispatcher, manager) = setup().await?;

    for (name, kind) in [("", "redis"), ("Bad_Name", "redis"), ("cache1", "postgres")] {
        let err = manager.create_data_source("alice", spec(name, kind)).await.expect_err("expected invalid input to be rejected");
        assert!(
            is_app_error(&err, |err| matches!(err, AppError::InvalidInput(_))),
            "expected an invalid input error for {:?}/{:?}, got {:?}",
            name,
            kind,
            err
        );
    }

    Ok(())
}

#[tokio::test]
async fn concurrent_creates_with_same_name_have_one_winner() -> Result<()> {
    let (_tmpdir, _db, _dispatcher, manager) = setup().await?;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.create_data_source("alice", spec("cache1", "redis")).await })
        })
        .collect();
    let (mut wins, mut conflicts) = (0, 0);
    for task in tasks {
        match task.await? {
            Ok(_) => wins += 1,
            Err(err) if is_app_error(&err, |err| matches!(err, AppError::Conflict(_))) => conflicts += 1,
            Err(err) => return Err(err),
        }
    }

    assert_eq!(wins, 1, "expected exactly one create to succeed, got {}", wins);
    assert_eq!(conflicts, 7, "expected all other creates to conflict, got {}", conflicts);

    Ok(())
}

#[tokio::test]
async fn update_instances_enforces_bounds() -> Result<()> {
    let (_tmpdir, db, _dispatcher, manager) = setup().await?;
    let ds = manager.create_data_source("alice", spec("cache1", "redis")).await?;

    for instances in [0, -1, -100, i64::from(i32::MAX) + 1, 3_000_000_000] {
        let err = manager.update_instances(&ds, instances).await.expect_err("expected out of range instances to be rejected");
        assert!(is_app_error(&err, |err| matches!(err, AppError::InvalidInput(_))), "expected invalid input, got {:?}", err);
        assert_eq!(db.must_get_data_source("cache1").await?, ds, "expected rejected counts to leave the record untouched");
    }
    for instances in [1, 3, 7, i64::from(i32::MAX)] {
        let ds = db.must_get_data_source("cache1").await?;
        let updated = manager.update_instances(&ds, instances).await?;
        assert_eq!(updated.instances as i64, instances, "expected instances to be updated");
        let stored = db.must_get_data_source("cache1").await?;
        assert_eq!(stored.instances as i64, instances, "expected instances to be persisted");
    }

    Ok(())
}

#[tokio::test]
async fn update_instances_retries_stale_version_once() -> Result<()> {
    let (_tmpdir, db, _dispatcher, manager) = setup().await?;
    let stale = manager.create_data_source("alice", spec("cache1", "redis")).await?;
    manager.update_instances(&stale, 2).await?;

    let updated = manager.update_instances(&stale, 5).await?;

    assert_eq!(updated.instances, 5, "expected the retry to apply the update");
    assert_eq!(db.must_get_data_source("cache1").await?.version, 2, "expected two committed writes");

    Ok(())
}

#[tokio::test]
async fn first_node_is_master_and_later_nodes_follow_it() -> Result<()> {
    let (_tmpdir, _db, _dispatcher, manager) = setup().await?;
    let ds = manager.create_data_source("alice", spec("cache1", "redis")).await?;
    let token = ds.agent_token.as_str();

    let first = manager.create_node("cache1", token, "10.0.0.5").await?;
    let second = manager.create_node("cache1", token, "10.0.0.6").await?;
    let again = manager.create_node("cache1", token, "10.0.0.6").await?;

    assert_eq!(first.role, NodeRole::Master, "expected the first node to be master");
    assert_eq!(first.master_host, "10.0.0.5", "expected the master to follow itself");
    assert_eq!(second.role, NodeRole::Replica, "expected the second node to be a replica");
    assert_eq!(second.master_host, "10.0.0.5", "expected the replica to follow the master");
    assert_eq!(again, second, "expected re-registration to return the existing node");
    assert_eq!(manager.list_nodes("cache1").await?.len(), 2, "expected two nodes");

    Ok(())
}

#[tokio::test]
async fn create_node_rejects_bad_token() -> Result<()> {
    let (_tmpdir, _db, _dispatcher, manager) = setup().await?;
    manager.create_data_source("alice", spec("cache1", "redis")).await?;

    let err = manager.create_node("cache1", "not-the-token", "10.0.0.5").await.expect_err("expected a bad token to be rejected");

    assert!(is_app_error(&err, |err| matches!(err, AppError::Unauthorized)), "expected unauthorized, got {:?}", err);
    assert!(manager.list_nodes("cache1").await?.is_empty(), "expected no node to be created");

    Ok(())
}

#[tokio::test]
async fn set_master_swaps_roles_and_enqueues_commands() -> Result<()> {
    let (_tmpdir, db, dispatcher, manager) = setup().await?;
    fixtures::setup_data_source(&db, "cache1", "alice", &["10.0.0.5", "10.0.0.6"]).await?;

    manager.set_master("cache1", "10.0.0.6").await?;

    let old = db.must_get_node("cache1", "10.0.0.5").await?;
    let new = db.must_get_node("cache1", "10.0.0.6").await?;
    assert_eq!(old.role, NodeRole::Replica, "expected the old master to be demoted");
    assert_eq!(old.master_host, "10.0.0.6", "expected the old master to follow the new master");
    assert_eq!(new.role, NodeRole::Master, "expected the target to be promoted");
    assert_eq!(new.master_host, "10.0.0.6", "expected the new master to follow itself");

    let timeout = Duration::from_millis(50);
    let old_cmd = dispatcher.wait_for_command("cache1", "10.0.0.5", timeout).await?;
    let new_cmd = dispatcher.wait_for_command("cache1", "10.0.0.6", timeout).await?;
    assert_eq!(old_cmd, PollOutcome::Command(Command::Demote { master_host: "10.0.0.6".into() }), "unexpected old master command");
    assert_eq!(new_cmd, PollOutcome::Command(Command::Promote), "unexpected new master command");

    Ok(())
}

#[tokio::test]
async fn set_master_on_current_master_is_noop() -> Result<()> {
    let (_tmpdir, db, _dispatcher, manager) = setup().await?;
    let (ds, _) = fixtures::setup_data_source(&db, "cache1", "alice", &["10.0.0.5", "10.0.0.6"]).await?;

    manager.set_master("cache1", "10.0.0.5").await?;

    let stored = db.must_get_data_source("cache1").await?;
    assert_eq!(stored.version, ds.version, "expected no write for a no-op transition");
    let master = db.must_get_node("cache1", "10.0.0.5").await?;
    assert!(master.pending_command.is_none(), "expected no command for a no-op transition");

    Ok(())
}

#[tokio::test]
async fn set_master_sequences_keep_a_single_master() -> Result<()> {
    let (_tmpdir, db, _dispatcher, manager) = setup().await?;
    let hosts = ["10.0.0.5", "10.0.0.6", "10.0.0.7"];
    fixtures::setup_data_source(&db, "cache1", "alice", &hosts).await?;

    for target in ["10.0.0.7", "10.0.0.6", "10.0.0.6", "10.0.0.5", "10.0.0.7"] {
        manager.set_master("cache1", target).await?;
        let nodes = db.list_nodes("cache1").await?;
        let masters: Vec<_> = nodes.iter().filter(|node| node.is_master()).collect();
        assert_eq!(masters.len(), 1, "expected exactly one master after promoting {}, got {:?}", target, masters);
        assert_eq!(masters[0].host, target, "expected {} to be master", target);
        assert!(
            nodes.iter().all(|node| node.master_host == target),
            "expected every node to follow {}, got {:?}",
            target,
            nodes
        );
    }

    Ok(())
}

#[tokio::test]
async fn concurrent_set_master_calls_keep_a_single_master() -> Result<()> {
    let (_tmpdir, db, _dispatcher, manager) = setup().await?;
    let hosts = ["10.0.0.5", "10.0.0.6", "10.0.0.7", "10.0.0.8"];
    fixtures::setup_data_source(&db, "cache1", "alice", &hosts).await?;

    let tasks: Vec<_> = hosts[1..]
        .iter()
        .map(|host| {
            let (manager, host) = (manager.clone(), host.to_string());
            tokio::spawn(async move { manager.set_master("cache1", &host).await })
        })
        .collect();
    for task in tasks {
        if let Err(err) = task.await? {
            assert!(is_app_error(&err, |err| matches!(err, AppError::Conflict(_))), "expected only conflicts, got {:?}", err);
        }
    }

    let masters = db.list_nodes("cache1").await?.into_iter().filter(|node| node.is_master()).count();
    assert_eq!(masters, 1, "expected exactly one master, got {}", masters);

    Ok(())
}

#[tokio::test]
async fn set_master_of_unknown_node_is_not_found() -> Result<()> {
    let (_tmpdir, db, _dispatcher, manager) = setup().await?;
    fixtures::setup_data_source(&db, "cache1", "alice", &["10.0.0.5"]).await?;

    let err = manager.set_master("cache1", "10.9.9.9").await.expect_err("expected an unknown node to be rejected");

    assert!(is_app_error(&err, |err| matches!(err, AppError::ResourceNotFound(_))), "expected not found, got {:?}", err);

    Ok(())
}

#[tokio::test]
async fn update_node_rejects_role_changes() -> Result<()> {
    let (_tmpdir, db, _dispatcher, manager) = setup().await?;
    fixtures::setup_data_source(&db, "cache1", "alice", &["10.0.0.5", "10.0.0.6"]).await?;
    let update = |role: &str| NodeUpdate { role: Some(role.into()), master_host: None };

    let err = manager.update_node("cache1", "10.0.0.6", update("master")).await.expect_err("expected a role change to be rejected");
    assert!(is_app_error(&err, |err| matches!(err, AppError::InvalidInput(_))), "expected invalid input, got {:?}", err);
    let err = manager.update_node("cache1", "10.0.0.6", update("leader")).await.expect_err("expected an unknown role to be rejected");
    assert!(is_app_error(&err, |err| matches!(err, AppError::InvalidInput(_))), "expected invalid input, got {:?}", err);
    let node = manager.update_node("cache1", "10.0.0.6", update("replica")).await?;
    assert_eq!(node.role, NodeRole::Replica, "expected a restated role to be accepted");

    let masters = db.list_nodes("cache1").await?.into_iter().filter(|node| node.is_master()).count();
    assert_eq!(masters, 1, "expected exactly one master, got {}", masters);

    Ok(())
}

#[tokio::test]
async fn update_node_redirects_replica() -> Result<()> {
    let (_tmpdir, db, dispatcher, manager) = setup().await?;
    fixtures::setup_data_source(&db, "cache1", "alice", &["10.0.0.5", "10.0.0.6", "10.0.0.7"]).await?;
    let update = NodeUpdate {
        role: None,
        master_host: Some("10.0.0.6".into()),
    };

    let node = manager.update_node("cache1", "10.0.0.7", update.clone()).await?;
    let err = manager.update_node("cache1", "10.0.0.5", update).await.expect_err("expected the master redirect to be rejected");

    assert_eq!(node.master_host, "10.0.0.6", "expected the replica to be redirected");
    assert!(is_app_error(&err, |err| matches!(err, AppError::InvalidInput(_))), "expected invalid input, got {:?}", err);
    let stored = db.must_get_node("cache1", "10.0.0.7").await?;
    assert_eq!(stored.master_host, "10.0.0.6", "expected the redirect to be persisted");
    assert_eq!(
        stored.pending_command,
        Some(Command::Demote { master_host: "10.0.0.6".into() }),
        "expected the redirect and its command to be stored together"
    );
    let outcome = dispatcher.wait_for_command("cache1", "10.0.0.7", Duration::from_millis(50)).await?;
    assert_eq!(outcome, PollOutcome::Command(Command::Demote { master_host: "10.0.0.6".into() }), "unexpected command");

    Ok(())
}

#[tokio::test]
async fn redirect_overwrites_undelivered_command() -> Result<()> {
    let (_tmpdir, db, dispatcher, manager) = setup().await?;
    fixtures::setup_data_source(&db, "cache1", "alice", &["10.0.0.5", "10.0.0.6", "10.0.0.7"]).await?;
    dispatcher.enqueue(db.must_get_node("cache1", "10.0.0.7").await?, Command::Promote).await?;
    let update = NodeUpdate {
        role: None,
        master_host: Some("10.0.0.6".into()),
    };

    let node = manager.update_node("cache1", "10.0.0.7", update).await?;

    assert_eq!(node.master_host, "10.0.0.6", "expected the replica to be redirected");
    let outcome = dispatcher.wait_for_command("cache1", "10.0.0.7", Duration::from_millis(50)).await?;
    assert_eq!(outcome, PollOutcome::Command(Command::Demote { master_host: "10.0.0.6".into() }), "expected the newest command");

    Ok(())
}

#[tokio::test]
async fn link_and_unlink_are_idempotent() -> Result<()> {
    let (_tmpdir, db, _dispatcher, manager) = setup().await?;
    let (ds, _) = fixtures::setup_data_source(&db, "cache1", "alice", &[]).await?;
    fixtures::setup_app(&db, "web", "alice", "v1").await?;

    let first = manager.link_app(&ds, "web").await?;
    let second = manager.link_app(&ds, "web").await?;
    assert!(first.data_sources.contains("cache1"), "expected the link to be recorded");
    assert_eq!(first, second, "expected the second link to be a no-op");

    let first = manager.unlink_app(&ds, "web").await?;
    let second = manager.unlink_app(&ds, "web").await?;
    assert!(first.data_sources.is_empty(), "expected the link to be removed");
    assert_eq!(first, second, "expected the second unlink to be a no-op");

    Ok(())
}

#[tokio::test]
async fn link_unknown_or_foreign_app_is_not_found() -> Result<()> {
    let (_tmpdir, db, _dispatcher, manager) = setup().await?;
    let (ds, _) = fixtures::setup_data_source(&db, "cache1", "alice", &[]).await?;
    fixtures::setup_app(&db, "theirs", "bob", "v1").await?;

    for app in ["missing", "theirs"] {
        let err = manager.link_app(&ds, app).await.expect_err("expected the link to be rejected");
        assert!(is_app_error(&err, |err| matches!(err, AppError::ResourceNotFound(_))), "expected not found, got {:?}", err);
    }

    Ok(())
}

#[tokio::test]
async fn get_owned_hides_foreign_data_sources() -> Result<()> {
    let (_tmpdir, db, _dispatcher, manager) = setup().await?;
    fixtures::setup_data_source(&db, "cache1", "alice", &[]).await?;

    let err = manager.get_owned("bob", "cache1").await.expect_err("expected a foreign data source to be hidden");

    assert!(is_app_error(&err, |err| matches!(err, AppError::ResourceNotFound(_))), "expected not found, got {:?}", err);
    assert!(manager.list_data_sources("bob").await?.is_empty(), "expected bob to see no data sources");
    assert_eq!(manager.list_data_sources("alice").await?.len(), 1, "expected alice to see her data source");

    Ok(())
}

#[tokio::test]
async fn delete_removes_nodes_links_and_releases_pollers() -> Result<()> {
    let (_tmpdir, db, dispatcher, manager) = setup().await?;
    let (ds, _) = fixtures::setup_data_source(&db, "cache1", "alice", &["10.0.0.5"]).await?;
    fixtures::setup_app(&db, "web", "alice", "v1").await?;
    manager.link_app(&ds, "web").await?;
    let waiter = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.wait_for_command("cache1", "10.0.0.5", Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let unlinked = manager.delete_data_source(&ds).await?;

    assert!(db.get_data_source("cache1").await?.is_none(), "expected the record to be deleted");
    assert!(db.list_nodes("cache1").await?.is_empty(), "expected the nodes to be deleted");
    assert_eq!(unlinked.len(), 1, "expected one application to be unlinked");
    assert!(db.must_get_app("web").await?.data_sources.is_empty(), "expected the link to be removed");
    let outcome = tokio::time::timeout(Duration::from_secs(2), waiter).await???;
    assert_eq!(outcome, PollOutcome::ClusterRemoved, "expected the blocked poll to be released");

    Ok(())
}

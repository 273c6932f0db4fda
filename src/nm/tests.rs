use super::directory::DirectoryStore;
use super::handlers::{handle_connection, NmContext};
use super::registry::{promote_down_primaries, SsRegistry};
use super::replicator::{ReplTask, Replicator};
use super::state::NmState;
use super::types::{Perm, TrashEntry, ANONYMOUS};

use crate::proto::framing::{recv_frame, send_frame};
use crate::proto::message::LookupReply;
use crate::proto::ticket::Ticket;

use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

fn state_in(dir: &TempDir) -> NmState {
    NmState::new(&dir.path().join("nm_state.json"))
}

// ============================================================
// DIRECTORY TESTS
// ============================================================

#[test]
fn test_directory_set_and_lookup() {
    let mut dir = DirectoryStore::new();
    dir.set_primary("a", 1);
    dir.set_primary("b", 2);

    assert_eq!(dir.primary("a"), Some(1));
    assert_eq!(dir.primary("b"), Some(2));
    assert_eq!(dir.primary("ghost"), None);
    // Repeated lookups hit the cache and stay correct.
    assert_eq!(dir.primary("a"), Some(1));
    assert_eq!(dir.len(), 2);
}

#[test]
fn test_directory_replicas_exclude_primary_and_dups() {
    let mut dir = DirectoryStore::new();
    dir.set_primary("a", 1);
    dir.set_replicas("a", vec![2, 1, 3, 2]);
    assert_eq!(dir.replicas("a"), vec![2, 3]);

    // Promoting a replica to primary drops it from the replica list.
    dir.set_primary("a", 2);
    assert_eq!(dir.replicas("a"), vec![3]);
}

#[test]
fn test_directory_rename() {
    let mut dir = DirectoryStore::new();
    dir.set_primary("old", 1);
    dir.set_replicas("old", vec![2]);

    assert!(dir.rename("old", "new"));
    assert_eq!(dir.primary("new"), Some(1));
    assert_eq!(dir.replicas("new"), vec![2]);
    assert_eq!(dir.primary("old"), None);

    dir.set_primary("taken", 3);
    assert!(!dir.rename("new", "taken"));
    assert!(!dir.rename("ghost", "x"));
}

#[test]
fn test_directory_rename_prefix() {
    let mut dir = DirectoryStore::new();
    dir.set_primary("docs/a", 1);
    dir.set_primary("docs/sub/b", 2);
    dir.set_primary("other/c", 3);

    let mut moved = dir.rename_prefix("docs", "archive");
    moved.sort();
    assert_eq!(
        moved,
        vec![
            ("docs/a".to_string(), "archive/a".to_string(), 1),
            ("docs/sub/b".to_string(), "archive/sub/b".to_string(), 2),
        ]
    );
    assert_eq!(dir.primary("archive/a"), Some(1));
    assert_eq!(dir.primary("archive/sub/b"), Some(2));
    assert_eq!(dir.primary("other/c"), Some(3));
    // No false prefix match on "docsish".
    dir.set_primary("docsish/d", 4);
    assert!(dir.rename_prefix("docs", "x").is_empty());
}

#[test]
fn test_directory_load_counts() {
    let mut dir = DirectoryStore::new();
    dir.set_primary("a", 1);
    dir.set_primary("b", 1);
    dir.set_primary("c", 2);
    let counts = dir.load_counts();
    assert_eq!(counts.get(&1), Some(&2));
    assert_eq!(counts.get(&2), Some(&1));
}

// ============================================================
// STATE & PERSISTENCE TESTS
// ============================================================

#[test]
fn test_acl_owner_always_passes() {
    let dir = TempDir::new().unwrap();
    let mut st = state_in(&dir);
    st.acl_set_owner("f", "alice");
    assert!(st.acl_check("f", "alice", false));
    assert!(st.acl_check("f", "alice", true));
    assert!(!st.acl_check("f", "bob", false));
    assert!(!st.acl_check("ghost", "alice", false));
}

#[test]
fn test_acl_write_does_not_imply_read() {
    let dir = TempDir::new().unwrap();
    let mut st = state_in(&dir);
    st.acl_set_owner("f", "alice");
    st.acl_grant("f", "bob", Perm::W);
    assert!(st.acl_check("f", "bob", true));
    assert!(!st.acl_check("f", "bob", false));

    st.acl_grant("f", "carol", Perm::R);
    assert!(st.acl_check("f", "carol", false));
    assert!(!st.acl_check("f", "carol", true));
}

#[test]
fn test_acl_anonymous_fallback() {
    let dir = TempDir::new().unwrap();
    let mut st = state_in(&dir);
    st.acl_set_owner("f", "alice");
    st.acl_grant("f", ANONYMOUS, Perm::R);

    // No grant for dave: the public fallback applies.
    assert!(st.acl_check("f", "dave", false));
    assert!(!st.acl_check("f", "dave", true));

    // An explicit grant decides and blocks the fallback.
    st.acl_grant("f", "bob", Perm::W);
    assert!(!st.acl_check("f", "bob", false));
}

#[test]
fn test_acl_format_access_summary() {
    let dir = TempDir::new().unwrap();
    let mut st = state_in(&dir);
    st.acl_set_owner("f", "alice");
    st.acl_grant("f", "alice", Perm::RW);
    st.acl_grant("f", "bob", Perm::R);
    st.acl_grant("f", "carol", Perm::W);
    assert_eq!(st.acl_format_access("f"), "alice (RW), bob (R), carol (W)");
    assert_eq!(st.acl_format_access("ghost"), "");
}

#[test]
fn test_requests_one_pending_per_user() {
    let dir = TempDir::new().unwrap();
    let mut st = state_in(&dir);
    assert!(st.add_request("f", "bob", Perm::R));
    assert!(!st.add_request("f", "bob", Perm::W));
    assert!(st.add_request("f", "carol", Perm::W));
    assert_eq!(st.list_requests("f").len(), 2);

    st.remove_request("f", "bob");
    let left = st.list_requests("f");
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].user, "carol");

    st.clear_requests_for("f");
    assert!(st.list_requests("f").is_empty());
}

#[test]
fn test_trash_add_find_remove() {
    let dir = TempDir::new().unwrap();
    let mut st = state_in(&dir);
    st.trash_add(TrashEntry {
        file: "a".into(),
        trashed: ".trash/1_a".into(),
        owner: "alice".into(),
        ssid: 1,
        when: 1,
    });
    assert_eq!(st.trash_find("a").unwrap().trashed, ".trash/1_a");
    assert!(st.trash_remove("a"));
    assert!(!st.trash_remove("a"));
    assert!(st.trash_find("a").is_none());
}

#[test]
fn test_move_folder_prefix_carries_acls_and_requests() {
    let dir = TempDir::new().unwrap();
    let mut st = state_in(&dir);
    st.add_folder("docs");
    st.add_folder("docs/sub");
    st.directory.set_primary("docs/a", 1);
    st.acl_set_owner("docs/a", "alice");
    st.add_request("docs/a", "bob", Perm::R);

    let moved = st.move_folder_prefix("docs", "archive");
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].1, "archive/a");
    assert!(st.folder_exists("archive"));
    assert!(st.folder_exists("archive/sub"));
    assert_eq!(st.acl_owner("archive/a"), Some("alice"));
    assert_eq!(st.list_requests("archive/a").len(), 1);
}

#[tokio::test]
async fn test_state_save_load_roundtrip() {
    let dir = TempDir::new().unwrap();
    let mut st = state_in(&dir);
    st.add_user("alice");
    st.set_user_active("bob", true);
    st.directory.set_primary("docs/a", 2);
    st.directory.set_replicas("docs/a", vec![3]);
    if let Some(e) = st.directory.get_mut("docs/a") {
        e.last_modified_user = Some("alice".into());
        e.last_modified_time = 1000;
    }
    st.acl_set_owner("docs/a", "alice");
    st.acl_grant("docs/a", "bob", Perm::W);
    st.add_request("docs/a", "carol", Perm::W);
    st.add_folder("docs");
    st.trash_add(TrashEntry {
        file: "old".into(),
        trashed: ".trash/5_old".into(),
        owner: "alice".into(),
        ssid: 2,
        when: 5,
    });
    st.save().await.unwrap();

    let mut loaded = NmState::load(&dir.path().join("nm_state.json")).await.unwrap();
    assert!(loaded.users.contains(&"alice".to_string()));
    assert!(loaded.user_is_active("bob"));
    assert_eq!(loaded.directory.primary("docs/a"), Some(2));
    assert_eq!(loaded.directory.replicas("docs/a"), vec![3]);
    let entry = loaded.directory.get("docs/a").unwrap();
    assert_eq!(entry.last_modified_user.as_deref(), Some("alice"));
    assert_eq!(entry.last_modified_time, 1000);
    assert_eq!(loaded.acl_owner("docs/a"), Some("alice"));
    assert!(loaded.acl_check("docs/a", "bob", true));
    let reqs = loaded.list_requests("docs/a");
    assert_eq!(reqs.len(), 1);
    assert_eq!(reqs[0].mode, Perm::W);
    assert!(loaded.folder_exists("docs"));
    assert_eq!(loaded.trash_find("old").unwrap().ssid, 2);
}

#[tokio::test]
async fn test_state_load_accepts_legacy_format() {
    // Older documents stored bare ss-ids in `directory` and bare
    // usernames in `requests`.
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nm_state.json");
    let legacy = json!({
        "users": ["alice", "bob"],
        "active": ["alice"],
        "directory": {"a.txt": 2},
        "acls": {"a.txt": {"owner": "alice", "grants": {"bob": "R"}}},
        "replicas": {"a.txt": [3]},
        "requests": {"a.txt": ["bob"]},
        "folders": ["docs"],
        "trash": []
    });
    tokio::fs::write(&path, serde_json::to_vec(&legacy).unwrap())
        .await
        .unwrap();

    let mut st = NmState::load(&path).await.unwrap();
    assert_eq!(st.directory.primary("a.txt"), Some(2));
    assert_eq!(st.directory.replicas("a.txt"), vec![3]);
    assert!(st.user_is_active("alice"));
    let reqs = st.list_requests("a.txt");
    assert_eq!(reqs.len(), 1);
    assert_eq!(reqs[0].user, "bob");
    assert_eq!(reqs[0].mode, Perm::R);
}

#[tokio::test]
async fn test_state_first_run_writes_skeleton() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nm_state.json");
    let _ = NmState::load(&path).await.unwrap();
    assert!(path.exists());
    // And the skeleton loads back.
    let st = NmState::load(&path).await.unwrap();
    assert!(st.directory.is_empty());
}

// ============================================================
// REGISTRY & FAILOVER TESTS
// ============================================================

#[test]
fn test_registry_heartbeat_before_register_stays_down() {
    let registry = SsRegistry::new();
    // An unknown server heartbeating has no known data port.
    assert!(!registry.heartbeat(5, "127.0.0.1"));
    assert!(!registry.is_up(5));

    registry.register(5, "127.0.0.1", 7001, 7002);
    assert!(registry.is_up(5));
    assert_eq!(registry.data_addr(5).unwrap(), "127.0.0.1:7002");
}

#[test]
fn test_registry_heartbeat_up_transition() {
    let registry = SsRegistry::new();
    registry.register(1, "127.0.0.1", 7001, 7002);
    registry.force_down(1);
    assert!(!registry.is_up(1));
    // The next heartbeat brings a registered server back up.
    assert!(registry.heartbeat(1, "127.0.0.1"));
    assert!(registry.is_up(1));
    // Repeat beats are not transitions.
    assert!(!registry.heartbeat(1, "127.0.0.1"));
}

#[test]
fn test_registry_least_loaded_pick() {
    let registry = SsRegistry::new();
    registry.register(1, "127.0.0.1", 7001, 7002);
    registry.register(2, "127.0.0.1", 7003, 7004);
    registry.register(3, "127.0.0.1", 7005, 7006);
    registry.force_down(3);

    let mut load = std::collections::HashMap::new();
    load.insert(1u32, 4usize);
    load.insert(2u32, 1usize);
    load.insert(3u32, 0usize); // down, must not win

    let picked = registry.pick_least_loaded(&load).unwrap();
    assert_eq!(picked.ss_id, 2);
}

#[test]
fn test_registry_replica_pick_excludes_primary() {
    let registry = SsRegistry::new();
    registry.register(1, "127.0.0.1", 7001, 7002);
    registry.register(2, "127.0.0.1", 7003, 7004);
    registry.register(3, "127.0.0.1", 7005, 7006);

    assert_eq!(registry.pick_replicas(1, 1), vec![2]);
    assert_eq!(registry.pick_replicas(1, 5), vec![2, 3]);
    assert_eq!(registry.pick_replicas(2, 2), vec![1, 3]);
}

#[test]
fn test_promotion_swaps_primary_and_replica() {
    let dir = TempDir::new().unwrap();
    let mut st = state_in(&dir);
    let registry = SsRegistry::new();
    registry.register(1, "127.0.0.1", 7001, 7002);
    registry.register(2, "127.0.0.1", 7003, 7004);

    st.directory.set_primary("f", 1);
    st.directory.set_replicas("f", vec![2]);

    // Primary healthy: nothing to do.
    assert!(!promote_down_primaries(&registry, &mut st));

    registry.force_down(1);
    assert!(promote_down_primaries(&registry, &mut st));
    assert_eq!(st.directory.primary("f"), Some(2));
    // The old primary heads the replica list for the rejoin resync.
    assert_eq!(st.directory.replicas("f"), vec![1]);

    // Idempotent once swapped.
    assert!(!promote_down_primaries(&registry, &mut st));
}

#[test]
fn test_promotion_skips_files_without_up_replica() {
    let dir = TempDir::new().unwrap();
    let mut st = state_in(&dir);
    let registry = SsRegistry::new();
    registry.register(1, "127.0.0.1", 7001, 7002);
    registry.register(2, "127.0.0.1", 7003, 7004);
    registry.force_down(1);
    registry.force_down(2);

    st.directory.set_primary("f", 1);
    st.directory.set_replicas("f", vec![2]);
    assert!(!promote_down_primaries(&registry, &mut st));
    assert_eq!(st.directory.primary("f"), Some(1));
}

// ============================================================
// REPLICATOR TESTS
// ============================================================

#[tokio::test]
async fn test_replicator_queue_drains_on_failure() {
    // No storage servers exist, so every task fails fast; the gauge must
    // still return to zero because failures are logged, not retained.
    let registry = SsRegistry::new();
    let replicator = Replicator::start(registry, 2);
    for _ in 0..4 {
        replicator.enqueue(ReplTask::Put {
            file: "f".into(),
            primary: 1,
            target: 2,
        });
    }
    let mut drained = false;
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        if replicator.queue_depth() == 0 {
            drained = true;
            break;
        }
    }
    assert!(drained, "replication queue did not drain");
}

// ============================================================
// HANDLER TESTS (no storage servers needed)
// ============================================================

struct Conn {
    stream: tokio::io::DuplexStream,
}

impl Conn {
    fn open(ctx: &Arc<NmContext>) -> Self {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            handle_connection(ctx, server, "127.0.0.1".to_string()).await;
        });
        Self { stream: client }
    }

    async fn request(&mut self, payload: Value) -> Value {
        send_frame(&mut self.stream, &payload).await.unwrap();
        recv_frame(&mut self.stream).await.unwrap().unwrap()
    }
}

async fn test_ctx(dir: &TempDir) -> Arc<NmContext> {
    let state = Arc::new(Mutex::new(NmState::new(
        &dir.path().join("nm_state.json"),
    )));
    let registry = SsRegistry::new();
    let replicator = Replicator::start(registry.clone(), 1);
    Arc::new(NmContext {
        state,
        registry,
        replicator,
        replica_target: 1,
    })
}

#[tokio::test]
async fn test_client_hello_single_active_session() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir).await;

    let mut first = Conn::open(&ctx);
    let resp = first
        .request(json!({"type": "CLIENT_HELLO", "user": "alice"}))
        .await;
    assert_eq!(resp["status"], "OK");

    let mut second = Conn::open(&ctx);
    let resp = second
        .request(json!({"type": "CLIENT_HELLO", "user": "alice"}))
        .await;
    assert_eq!(resp["status"], "ERR_CONFLICT");
    assert_eq!(resp["msg"], "user-already-active");

    // After logout the name is free again.
    let resp = first.request(json!({"type": "LOGOUT", "user": "alice"})).await;
    assert_eq!(resp["status"], "OK");
    let mut third = Conn::open(&ctx);
    let resp = third
        .request(json!({"type": "CLIENT_HELLO", "user": "alice"}))
        .await;
    assert_eq!(resp["status"], "OK");
}

#[tokio::test]
async fn test_list_users_active_and_inactive() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir).await;
    let mut conn = Conn::open(&ctx);

    conn.request(json!({"type": "CLIENT_HELLO", "user": "alice"}))
        .await;
    conn.request(json!({"type": "CLIENT_HELLO", "user": "bob"}))
        .await;
    conn.request(json!({"type": "LOGOUT", "user": "bob"})).await;

    let resp = conn.request(json!({"type": "LIST_USERS"})).await;
    assert_eq!(resp["status"], "OK");
    assert_eq!(resp["active"], json!(["alice"]));
    assert_eq!(resp["inactive"], json!(["bob"]));
}

#[tokio::test]
async fn test_lookup_missing_file() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir).await;
    let mut conn = Conn::open(&ctx);

    // READ of an unknown file never provisions.
    let resp = conn
        .request(json!({"type": "LOOKUP", "op": "READ", "file": "nope", "user": "alice"}))
        .await;
    assert_eq!(resp["status"], "ERR_NOTFOUND");

    // WRITE would provision, but there is no storage server to hold it.
    let resp = conn
        .request(json!({"type": "LOOKUP", "op": "WRITE", "file": "nope", "user": "alice"}))
        .await;
    assert_eq!(resp["status"], "ERR_UNAVAILABLE");

    let resp = conn
        .request(json!({"type": "LOOKUP", "op": "SMASH", "file": "nope", "user": "alice"}))
        .await;
    assert_eq!(resp["status"], "ERR_BADREQ");
}

#[tokio::test]
async fn test_lookup_authorizes_and_issues_ticket() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir).await;
    ctx.registry.register(1, "127.0.0.1", 7001, 7002);
    {
        let mut st = ctx.state.lock().await;
        st.directory.set_primary("f", 1);
        st.acl_set_owner("f", "alice");
        st.acl_grant("f", "bob", Perm::R);
    }
    let mut conn = Conn::open(&ctx);

    let resp = conn
        .request(json!({"type": "LOOKUP", "op": "READ", "file": "f", "user": "bob"}))
        .await;
    let resp: LookupReply = serde_json::from_value(resp).unwrap();
    assert!(resp.status.is_ok());
    assert_eq!(resp.ss_addr.as_deref(), Some("127.0.0.1"));
    assert_eq!(resp.ss_data_port, Some(7002));
    let ticket = resp.ticket.unwrap();
    assert!(Ticket::validate(&ticket, "f", "READ", 1));
    assert!(!Ticket::validate(&ticket, "f", "WRITE", 1));

    // bob holds R only.
    let resp = conn
        .request(json!({"type": "LOOKUP", "op": "WRITE", "file": "f", "user": "bob"}))
        .await;
    assert_eq!(resp["status"], "ERR_NOAUTH");

    // READ-like ops ride the read side.
    let resp = conn
        .request(json!({"type": "LOOKUP", "op": "LISTCHECKPOINTS", "file": "f", "user": "bob"}))
        .await;
    assert_eq!(resp["status"], "OK");

    // The lookup tracked the access.
    let st = ctx.state.lock().await;
    let entry = st.directory.get("f").unwrap();
    assert_eq!(entry.last_accessed_user.as_deref(), Some("bob"));
    assert!(entry.last_accessed_time > 0);
}

#[tokio::test]
async fn test_access_request_lifecycle() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir).await;
    {
        let mut st = ctx.state.lock().await;
        st.directory.set_primary("f", 1);
        st.acl_set_owner("f", "alice");
    }
    let mut conn = Conn::open(&ctx);

    let resp = conn
        .request(json!({"type": "REQUEST_ACCESS", "file": "f", "user": "bob", "mode": "W"}))
        .await;
    assert_eq!(resp["status"], "OK");
    // One pending request per (file, user).
    let resp = conn
        .request(json!({"type": "REQUEST_ACCESS", "file": "f", "user": "bob", "mode": "R"}))
        .await;
    assert_eq!(resp["status"], "ERR_CONFLICT");
    let resp = conn
        .request(json!({"type": "REQUEST_ACCESS", "file": "ghost", "user": "bob"}))
        .await;
    assert_eq!(resp["status"], "ERR_NOTFOUND");

    // Only the owner sees the queue.
    let resp = conn
        .request(json!({"type": "VIEWREQUESTS", "file": "f", "user": "bob"}))
        .await;
    assert_eq!(resp["status"], "ERR_NOAUTH");
    let resp = conn
        .request(json!({"type": "VIEWREQUESTS", "file": "f", "user": "alice"}))
        .await;
    assert_eq!(resp["requests"], json!([{"user": "bob", "mode": "W"}]));

    // Approval grants and clears; an approved writer reads too.
    let resp = conn
        .request(json!({
            "type": "APPROVE_ACCESS", "file": "f", "user": "alice",
            "target": "bob", "mode": "W",
        }))
        .await;
    assert_eq!(resp["status"], "OK");
    let st = ctx.state.lock().await;
    assert!(st.acl_check("f", "bob", true));
    assert!(st.acl_check("f", "bob", false));
    assert!(st.list_requests("f").is_empty());
}

#[tokio::test]
async fn test_deny_access_only_clears() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir).await;
    {
        let mut st = ctx.state.lock().await;
        st.directory.set_primary("f", 1);
        st.acl_set_owner("f", "alice");
        st.add_request("f", "bob", Perm::R);
    }
    let mut conn = Conn::open(&ctx);

    let resp = conn
        .request(json!({"type": "DENY_ACCESS", "file": "f", "user": "alice", "target": "bob"}))
        .await;
    assert_eq!(resp["status"], "OK");
    let st = ctx.state.lock().await;
    assert!(st.list_requests("f").is_empty());
    assert!(!st.acl_check("f", "bob", false));
}

#[tokio::test]
async fn test_addaccess_clears_pending_request() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir).await;
    {
        let mut st = ctx.state.lock().await;
        st.directory.set_primary("f", 1);
        st.acl_set_owner("f", "alice");
        st.add_request("f", "bob", Perm::R);
    }
    let mut conn = Conn::open(&ctx);

    let resp = conn
        .request(json!({"type": "ADDACCESS", "file": "f", "user": "bob", "mode": "R"}))
        .await;
    assert_eq!(resp["status"], "OK");
    let resp = conn
        .request(json!({"type": "REMACCESS", "file": "f", "user": "bob"}))
        .await;
    assert_eq!(resp["status"], "OK");

    let st = ctx.state.lock().await;
    assert!(st.list_requests("f").is_empty());
    assert!(!st.acl_check("f", "bob", false));
}

#[tokio::test]
async fn test_view_filters_by_acl() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir).await;
    {
        let mut st = ctx.state.lock().await;
        st.directory.set_primary("mine", 1);
        st.acl_set_owner("mine", "alice");
        st.directory.set_primary("theirs", 1);
        st.acl_set_owner("theirs", "bob");
        st.directory.set_primary("public", 1);
        st.acl_set_owner("public", "bob");
        st.acl_grant("public", ANONYMOUS, Perm::R);
    }
    let mut conn = Conn::open(&ctx);

    let resp = conn
        .request(json!({"type": "VIEW", "flags": "", "user": "alice"}))
        .await;
    assert_eq!(resp["files"], json!(["mine", "public"]));

    let resp = conn
        .request(json!({"type": "VIEW", "flags": "-a", "user": "alice"}))
        .await;
    assert_eq!(resp["files"], json!(["mine", "public", "theirs"]));
}

#[tokio::test]
async fn test_folder_listing_immediate_children() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir).await;
    {
        let mut st = ctx.state.lock().await;
        st.add_folder("docs");
        st.add_folder("docs/drafts");
        st.add_folder("docs/final");
        st.directory.set_primary("top.txt", 1);
        st.directory.set_primary("docs/a.txt", 1);
        st.directory.set_primary("docs/drafts/b.txt", 1);
    }
    let mut conn = Conn::open(&ctx);

    // Root listing: "", "/" and "~" are synonyms.
    for root in ["", "/", "~"] {
        let resp = conn
            .request(json!({"type": "VIEWFOLDER", "path": root}))
            .await;
        assert_eq!(resp["status"], "OK", "root spelled {:?}", root);
        assert_eq!(resp["path"], "~");
        assert_eq!(resp["folders"], json!(["docs"]));
        assert_eq!(resp["files"], json!(["top.txt"]));
    }

    let resp = conn
        .request(json!({"type": "VIEWFOLDER", "path": "docs"}))
        .await;
    assert_eq!(resp["folders"], json!(["drafts", "final"]));
    assert_eq!(resp["files"], json!(["a.txt"]));
}

#[tokio::test]
async fn test_rename_checks() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir).await;
    {
        let mut st = ctx.state.lock().await;
        st.directory.set_primary("a", 1);
        st.acl_set_owner("a", "alice");
        st.directory.set_primary("b", 1);
        st.acl_set_owner("b", "alice");
    }
    let mut conn = Conn::open(&ctx);

    let resp = conn
        .request(json!({"type": "RENAME", "file": "ghost", "newFile": "x", "user": "alice"}))
        .await;
    assert_eq!(resp["status"], "ERR_NOTFOUND");

    let resp = conn
        .request(json!({"type": "RENAME", "file": "a", "newFile": "b", "user": "alice"}))
        .await;
    assert_eq!(resp["status"], "ERR_CONFLICT");

    let resp = conn
        .request(json!({"type": "RENAME", "file": "a", "newFile": "c", "user": "mallory"}))
        .await;
    assert_eq!(resp["status"], "ERR_NOAUTH");
}

#[tokio::test]
async fn test_move_requires_write_on_source() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir).await;
    {
        let mut st = ctx.state.lock().await;
        st.directory.set_primary("a", 1);
        st.acl_set_owner("a", "alice");
    }
    let mut conn = Conn::open(&ctx);

    let resp = conn
        .request(json!({"type": "MOVE", "src": "a", "dst": "b", "user": "mallory"}))
        .await;
    assert_eq!(resp["status"], "ERR_NOAUTH");

    // No user field means the anonymous caller, who holds no grant.
    let resp = conn
        .request(json!({"type": "MOVE", "src": "a", "dst": "b"}))
        .await;
    assert_eq!(resp["status"], "ERR_NOAUTH");

    // Moving a path onto itself is an acknowledged no-op for anyone.
    let resp = conn
        .request(json!({"type": "MOVE", "src": "a", "dst": "a", "user": "mallory"}))
        .await;
    assert_eq!(resp["status"], "OK");
}

#[tokio::test]
async fn test_move_destination_must_be_free() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir).await;
    {
        let mut st = ctx.state.lock().await;
        st.directory.set_primary("a", 1);
        st.acl_set_owner("a", "alice");
        st.directory.set_primary("b", 2);
        st.acl_set_owner("b", "bob");
    }
    let mut conn = Conn::open(&ctx);

    let resp = conn
        .request(json!({"type": "MOVE", "src": "a", "dst": "b", "user": "alice"}))
        .await;
    assert_eq!(resp["status"], "ERR_CONFLICT");

    // The taken destination still maps to its own file.
    let mut st = ctx.state.lock().await;
    assert_eq!(st.directory.primary("b"), Some(2));
    assert_eq!(st.acl_owner("b"), Some("bob"));
}

#[tokio::test]
async fn test_move_folder_requires_write_on_every_file() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir).await;
    {
        let mut st = ctx.state.lock().await;
        st.add_folder("docs");
        st.directory.set_primary("docs/a", 1);
        st.acl_set_owner("docs/a", "alice");
        st.directory.set_primary("docs/b", 1);
        st.acl_set_owner("docs/b", "bob");
    }
    let mut conn = Conn::open(&ctx);

    // alice cannot move the folder while bob's file sits under it.
    let resp = conn
        .request(json!({"type": "MOVE", "src": "docs", "dst": "archive", "user": "alice"}))
        .await;
    assert_eq!(resp["status"], "ERR_NOAUTH");

    // Nothing was rewritten by the rejected attempt.
    {
        let mut st = ctx.state.lock().await;
        assert_eq!(st.directory.primary("docs/a"), Some(1));
        assert!(st.folder_exists("docs"));
    }

    let resp = conn
        .request(json!({"type": "MOVE", "src": "ghost", "dst": "x", "user": "alice"}))
        .await;
    assert_eq!(resp["status"], "ERR_NOTFOUND");
}

#[tokio::test]
async fn test_stats_reports_queue_and_files() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir).await;
    {
        let mut st = ctx.state.lock().await;
        st.directory.set_primary("a", 1);
        st.directory.set_primary("b", 2);
    }
    let mut conn = Conn::open(&ctx);

    let resp = conn.request(json!({"type": "STATS"})).await;
    assert_eq!(resp["status"], "OK");
    assert_eq!(resp["files"], 2);
    assert!(resp["replicationQueue"].is_number());
    assert!(resp["memTotalMb"].is_number());
}

#[tokio::test]
async fn test_list_ss_snapshot() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir).await;
    ctx.registry.register(2, "127.0.0.1", 7003, 7004);
    ctx.registry.register(1, "127.0.0.1", 7001, 7002);
    let mut conn = Conn::open(&ctx);

    let resp = conn.request(json!({"type": "LIST_SS"})).await;
    assert_eq!(resp["status"], "OK");
    let servers = resp["servers"].as_array().unwrap();
    assert_eq!(servers.len(), 2);
    assert_eq!(servers[0]["id"], 1);
    assert_eq!(servers[1]["id"], 2);
    assert_eq!(servers[1]["data"], 7004);
}

#[tokio::test]
async fn test_ss_commit_fans_out_to_replicas() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir).await;
    {
        let mut st = ctx.state.lock().await;
        st.directory.set_primary("f", 1);
        st.directory.set_replicas("f", vec![2]);
    }
    let mut conn = Conn::open(&ctx);

    let resp = conn
        .request(json!({"type": "SS_COMMIT", "file": "f", "ssId": 1}))
        .await;
    assert_eq!(resp["status"], "OK");
    // A commit reported by a non-primary is acknowledged but not fanned
    // out; either way the request itself succeeds.
    let resp = conn
        .request(json!({"type": "SS_COMMIT", "file": "f", "ssId": 9}))
        .await;
    assert_eq!(resp["status"], "OK");
    let resp = conn
        .request(json!({"type": "SS_COMMIT", "file": "", "ssId": 1}))
        .await;
    assert_eq!(resp["status"], "ERR_BADREQ");
}

#[tokio::test]
async fn test_listtrash_empty_and_after_manual_add() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir).await;
    let mut conn = Conn::open(&ctx);

    let resp = conn.request(json!({"type": "LISTTRASH"})).await;
    assert_eq!(resp["trash"], json!([]));

    {
        let mut st = ctx.state.lock().await;
        st.trash_add(TrashEntry {
            file: "a".into(),
            trashed: ".trash/9_a".into(),
            owner: "alice".into(),
            ssid: 1,
            when: 9,
        });
    }
    let resp = conn.request(json!({"type": "LISTTRASH"})).await;
    assert_eq!(resp["trash"][0]["file"], "a");
    assert_eq!(resp["trash"][0]["trashed"], ".trash/9_a");
}

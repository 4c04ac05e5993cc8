//! Port conflict handling end to end: detection, the three policies, the
//! persisted always-kill preference and the failure modes.

mod common;

use common::{free_port, FakeController};
use stackup::error::Error;
use stackup::port::{
    is_port_available, ConflictDecision, ConflictPolicy, JsonPreferenceStore, MemoryPortStore,
    PortManager, PortRange, PortStore, PreferenceStore, ProcessController, ResolutionAction,
    StaticPrompt, ALWAYS_KILL_KEY,
};
use std::sync::Arc;
use std::time::Duration;

const OWNER: u32 = 700_001;
const CHILD: u32 = 700_002;
const GRANDCHILD: u32 = 700_003;

fn manager(controller: &Arc<FakeController>, answer: Option<ConflictDecision>) -> PortManager {
    PortManager::new(Arc::clone(controller) as Arc<dyn ProcessController>)
        .with_prompt(Arc::new(StaticPrompt(answer)))
        .with_range(PortRange::new(20000, 60000).unwrap())
        .with_verify_timeout(Duration::from_secs(2))
}

/// An owner holding `port` with a child and a grandchild.
fn occupied(port: u16) -> Arc<FakeController> {
    let controller = Arc::new(FakeController::new());
    controller.listen(OWNER, "node", port);
    controller.child(CHILD, OWNER, "esbuild");
    controller.child(GRANDCHILD, CHILD, "esbuild-worker");
    controller
}

// ============================================================================
// Policies
// ============================================================================

#[tokio::test]
async fn test_unanswered_prompt_leaves_conflict_unresolved() {
    let port = free_port();
    let controller = occupied(port);
    let store = Arc::new(MemoryPortStore::new());
    let ports = manager(&controller, None).with_store(store.clone());

    let err = ports
        .assign_port("api", port, ConflictPolicy::Prompt)
        .await
        .unwrap_err();

    match err {
        Error::PortConflict {
            port: p,
            pid,
            process_name,
        } => {
            assert_eq!(p, port);
            assert_eq!(pid, Some(OWNER));
            assert_eq!(process_name.as_deref(), Some("node"));
        }
        other => panic!("expected a port conflict, got {:?}", other),
    }

    assert!(controller.signals().is_empty(), "nothing may be killed");
    assert!(controller.is_alive(OWNER));
    let assignment = ports.assignment("api").unwrap();
    assert_eq!(assignment.action, ResolutionAction::Unresolved);
    assert_eq!(assignment.owner.map(|o| o.pid), Some(OWNER));
    assert!(store.get("api").is_none());
}

#[tokio::test]
async fn test_always_kill_terminates_tree_deepest_first_and_keeps_port() {
    let port = free_port();
    let controller = occupied(port);
    let ports = manager(&controller, None);

    let assignment = ports
        .assign_port("api", port, ConflictPolicy::AlwaysKill)
        .await
        .unwrap();

    assert_eq!(assignment.resolved, port);
    assert_eq!(assignment.action, ResolutionAction::Killed);
    assert_eq!(assignment.owner.map(|o| o.name), Some("node".to_string()));
    assert_eq!(controller.terminated(), vec![GRANDCHILD, CHILD, OWNER]);
    assert!(is_port_available(port));
}

#[tokio::test]
async fn test_survivors_of_graceful_stop_are_force_killed() {
    let port = free_port();
    let controller = occupied(port);
    controller.ignore_term(OWNER);
    let ports = manager(&controller, None);

    let assignment = ports
        .assign_port("api", port, ConflictPolicy::AlwaysKill)
        .await
        .unwrap();

    assert_eq!(assignment.action, ResolutionAction::Killed);
    let signals = controller.signals();
    assert_eq!(signals.last(), Some(&("kill", OWNER)));
    assert!(!signals.contains(&("kill", CHILD)), "children died on SIGTERM");
}

#[tokio::test]
async fn test_auto_reassign_moves_service_without_killing() {
    let port = free_port();
    let controller = occupied(port);
    let ports = manager(&controller, None);

    let assignment = ports
        .assign_port("api", port, ConflictPolicy::AutoReassign)
        .await
        .unwrap();

    assert_ne!(assignment.resolved, port);
    assert_eq!(assignment.requested, port);
    assert_eq!(assignment.action, ResolutionAction::Reassigned);
    assert!(ports.range().contains(assignment.resolved));
    assert!(controller.signals().is_empty());
    assert!(controller.is_alive(OWNER));
}

#[tokio::test]
async fn test_prompt_reassign_answer() {
    let port = free_port();
    let controller = occupied(port);
    let ports = manager(&controller, Some(ConflictDecision::Reassign));

    let assignment = ports
        .assign_port("api", port, ConflictPolicy::Prompt)
        .await
        .unwrap();
    assert_eq!(assignment.action, ResolutionAction::Reassigned);
    assert!(controller.signals().is_empty());
}

#[tokio::test]
async fn test_always_kill_answer_is_remembered() {
    let dir = tempfile::tempdir().unwrap();
    let prefs_path = dir.path().join("preferences.json");

    let first_port = free_port();
    let controller = occupied(first_port);
    let ports = manager(&controller, Some(ConflictDecision::AlwaysKill))
        .with_preferences(Arc::new(JsonPreferenceStore::new(&prefs_path)));

    let assignment = ports
        .assign_port("api", first_port, ConflictPolicy::Prompt)
        .await
        .unwrap();
    assert_eq!(assignment.action, ResolutionAction::Killed);
    assert!(ports.always_kill_preferred());

    // A later session reads the preference from disk
    let reloaded = JsonPreferenceStore::new(&prefs_path);
    assert_eq!(reloaded.get_preference(ALWAYS_KILL_KEY).as_deref(), Some("true"));

    let second_port = free_port();
    let controller = Arc::new(FakeController::new());
    controller.listen(OWNER, "python", second_port);
    // Would cancel if it were asked
    let ports = manager(&controller, Some(ConflictDecision::Cancel))
        .with_preferences(Arc::new(reloaded));

    let assignment = ports
        .assign_port("worker", second_port, ConflictPolicy::Prompt)
        .await
        .unwrap();
    assert_eq!(assignment.action, ResolutionAction::Killed);
    assert_eq!(controller.terminated(), vec![OWNER]);
}

// ============================================================================
// Failure modes
// ============================================================================

#[tokio::test]
async fn test_unkillable_owner_reports_kill_failure() {
    let port = free_port();
    let controller = Arc::new(FakeController::new());
    controller.listen(OWNER, "postgres", port);
    controller.make_unkillable(OWNER);
    let ports = manager(&controller, None);

    let err = ports
        .assign_port("db", port, ConflictPolicy::AlwaysKill)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::KillFailure { pid: OWNER, .. }), "{:?}", err);
    assert_eq!(
        ports.assignment("db").map(|a| a.action),
        Some(ResolutionAction::Unresolved)
    );
    assert!(!is_port_available(port));
}

#[tokio::test]
async fn test_unknown_owner_cannot_be_killed() {
    let port = free_port();
    let _held = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    // Knows nothing about the socket above
    let controller = Arc::new(FakeController::new());
    let ports = manager(&controller, None);

    let err = ports
        .assign_port("db", port, ConflictPolicy::AlwaysKill)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::KillFailure { pid: 0, .. }), "{:?}", err);
}

#[tokio::test]
async fn test_exhausted_range() {
    let controller = Arc::new(FakeController::new());
    let requested = free_port();
    controller.listen(OWNER, "node", requested);
    let only_candidate = free_port();
    controller.listen(OWNER + 1, "node", only_candidate);

    let ports = manager(&controller, None)
        .with_range(PortRange::new(only_candidate, only_candidate).unwrap());

    let err = ports
        .assign_port("api", requested, ConflictPolicy::AutoReassign)
        .await
        .unwrap_err();
    match err {
        Error::PortExhausted { start, end } => {
            assert_eq!(start, only_candidate);
            assert_eq!(end, only_candidate);
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_assignments_persist_in_project_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(stackup::port::JsonPortStore::for_project(dir.path()));
    let controller = Arc::new(FakeController::new());
    let ports = manager(&controller, None).with_store(store.clone());

    let port = free_port();
    ports
        .assign_port("api", port, ConflictPolicy::Prompt)
        .await
        .unwrap();

    let reloaded = stackup::port::JsonPortStore::for_project(dir.path());
    assert_eq!(reloaded.get("api").map(|a| a.port), Some(port));
    assert!(reloaded.path().ends_with(".stackup/ports.json"));
}

// ============================================================================
// Real processes
// ============================================================================

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_kill_real_process() {
    use stackup::port::{kill_process_tree, UnixProcessController, KILL_GRACE_PERIOD};

    let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();
    let controller = UnixProcessController;
    assert!(controller.is_alive(pid));

    let order = kill_process_tree(&controller, pid, KILL_GRACE_PERIOD)
        .await
        .unwrap();
    assert_eq!(order.last(), Some(&pid));
    assert!(!controller.is_alive(pid));

    let status = child.wait().unwrap();
    assert!(!status.success());
}

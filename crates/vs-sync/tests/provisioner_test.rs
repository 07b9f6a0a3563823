//! Agent provisioning and memory-block scenarios.

mod common;

use common::*;
use vs_clients::agents::MemoryBlock;
use vs_core::types::Project;
use vs_sync::provisioner::{agent_name, project_tag, MAX_BLOCK_CHARS, SYNC_TAG};

/// Scenario: two agents carry the same name and both required tags. The
/// newer one is selected and bound; no new agent is created.
#[tokio::test]
async fn duplicate_agent_guard_selects_newest() {
    let env = test_env().await;
    let name = agent_name("HVSYN");
    let tags: Vec<&str> = vec![SYNC_TAG, "project:HVSYN"];

    env.agents.seed_agent("agent-old", &name, &tags, 1_000);
    env.agents.seed_agent("agent-new", &name, &tags, 2_000);

    let project = Project::new("HVSYN", "Vibe Sync");
    env.store.upsert_project(&project).await.unwrap();

    let selected = env.provisioner.ensure_agent(&project).await.unwrap();
    assert_eq!(selected, "agent-new");

    // Binding persisted in the store; still exactly two agents upstream.
    let bound = env.store.get_project("HVSYN").await.unwrap().unwrap();
    assert_eq!(bound.agent_id.as_deref(), Some("agent-new"));
    assert_eq!(env.agents.agents.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn missing_agent_is_created_with_tags_and_tools() {
    let env = test_env().await;

    // Control agent with the canonical tool bundle.
    env.agents
        .seed_agent("agent-control", "huly-vibe-control", &[SYNC_TAG], 1);
    env.agents.tools.lock().unwrap().insert(
        "agent-control".to_string(),
        vec![
            vs_clients::agents::ToolRef {
                id: "tool-pm".into(),
                name: "pm".into(),
            },
            vs_clients::agents::ToolRef {
                id: "tool-tracker".into(),
                name: "tracker".into(),
            },
        ],
    );

    let project = Project::new("HVSYN", "Vibe Sync");
    env.store.upsert_project(&project).await.unwrap();

    let agent_id = env.provisioner.ensure_agent(&project).await.unwrap();

    let agents = env.agents.agents.lock().unwrap();
    let created = agents.iter().find(|a| a.id == agent_id).unwrap();
    assert_eq!(created.name, agent_name("HVSYN"));
    assert!(created.tags.contains(&SYNC_TAG.to_string()));
    assert!(created.tags.contains(&project_tag("HVSYN")));
    drop(agents);

    // Tool bundle copied off the control agent.
    let tools = env.agents.tools.lock().unwrap();
    let attached = tools.get(&agent_id).unwrap();
    assert_eq!(attached.len(), 2);

    // Idempotent: a second ensure finds the agent, creates nothing.
    let again = env.provisioner.ensure_agent(&project).await.unwrap();
    assert_eq!(again, agent_id);
}

/// Memory updates are hash-gated: an unchanged block set costs zero API
/// calls the second time.
#[tokio::test]
async fn memory_update_is_hash_gated() {
    let env = test_env().await;
    env.agents.seed_agent("agent-1", "x", &[], 1);

    let blocks = vec![
        MemoryBlock {
            label: "project_overview".into(),
            value: "Project HVSYN — 3 issues.".into(),
        },
        MemoryBlock {
            label: "open_issues".into(),
            value: "- HVSYN-1 [Backlog] Fix login".into(),
        },
    ];

    let wrote = env
        .provisioner
        .update_memory_blocks("agent-1", blocks.clone())
        .await
        .unwrap();
    assert!(wrote);

    let calls_after_first = env.agents.calls();
    let wrote_again = env
        .provisioner
        .update_memory_blocks("agent-1", blocks)
        .await
        .unwrap();
    assert!(!wrote_again);
    assert_eq!(env.agents.calls(), calls_after_first, "no API calls expected");
}

#[tokio::test]
async fn changed_block_updates_only_the_diff() {
    let env = test_env().await;
    env.agents.seed_agent("agent-1", "x", &[], 1);

    let overview = MemoryBlock {
        label: "project_overview".into(),
        value: "v1".into(),
    };
    let open = MemoryBlock {
        label: "open_issues".into(),
        value: "list".into(),
    };
    env.provisioner
        .update_memory_blocks("agent-1", vec![overview.clone(), open.clone()])
        .await
        .unwrap();
    let writes_before = env
        .agents
        .block_writes
        .load(std::sync::atomic::Ordering::SeqCst);

    let changed = MemoryBlock {
        label: "project_overview".into(),
        value: "v2".into(),
    };
    env.provisioner
        .update_memory_blocks("agent-1", vec![changed, open])
        .await
        .unwrap();

    let writes_after = env
        .agents
        .block_writes
        .load(std::sync::atomic::Ordering::SeqCst);
    assert_eq!(writes_after - writes_before, 1, "only the changed block written");
}

/// Boundary: a block value beyond the cap is persisted truncated, with the
/// marker visible, and the hash cache reflects the truncated value.
#[tokio::test]
async fn oversized_block_is_truncated_and_cached() {
    let env = test_env().await;
    env.agents.seed_agent("agent-1", "x", &[], 1);

    let huge = MemoryBlock {
        label: "open_issues".into(),
        value: "x".repeat(MAX_BLOCK_CHARS * 2),
    };
    env.provisioner
        .update_memory_blocks("agent-1", vec![huge.clone()])
        .await
        .unwrap();

    let blocks = env.agents.blocks.lock().unwrap();
    let stored = blocks
        .get("agent-1")
        .unwrap()
        .iter()
        .find(|b| b.label == "open_issues")
        .unwrap();
    assert_eq!(stored.value.chars().count(), MAX_BLOCK_CHARS);
    assert!(stored.value.contains("[truncated]"));
    drop(blocks);

    // The cache holds the truncated hash: resending the same oversized
    // input is a no-op.
    let calls = env.agents.calls();
    env.provisioner
        .update_memory_blocks("agent-1", vec![huge])
        .await
        .unwrap();
    assert_eq!(env.agents.calls(), calls);
}

use super::open_store;
use crate::output::{or_dash, print_json, print_table, short_id, when};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;
use vigil_core::attempt::SyncAttempt;

pub fn run(root: &Path, task: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let task = store.find_task(task)?;
    let occurrences = chains(store.attempts_for_task(task.id)?);

    if json {
        return print_json(&serde_json::json!({
            "task_id": task.id,
            "occurrences": occurrences,
        }));
    }
    if occurrences.is_empty() {
        println!("No attempts for task {}.", task.id);
        return Ok(());
    }

    let mut rows = Vec::new();
    for chain in &occurrences {
        for a in chain {
            let indent = if a.retry_attempt == 0 { "" } else { "  └ " };
            rows.push(vec![
                format!("{indent}{}", short_id(a.id)),
                a.retry_attempt.to_string(),
                a.status.to_string(),
                or_dash(a.error_category),
                a.duration_ms.map(|d| format!("{d}ms")).unwrap_or_else(|| "-".into()),
                when(a.started_at.or(a.next_retry_at)),
                or_dash(a.error_message.as_deref()),
            ]);
        }
    }
    print_table(
        &["ATTEMPT", "RETRY", "STATUS", "CATEGORY", "DURATION", "AT", "MESSAGE"],
        rows,
    );
    Ok(())
}

/// Group attempts into per-occurrence retry chains, first attempt first.
fn chains(attempts: Vec<SyncAttempt>) -> Vec<Vec<SyncAttempt>> {
    let mut child_of: HashMap<Uuid, SyncAttempt> = HashMap::new();
    let mut roots = Vec::new();
    for a in attempts {
        match a.parent_attempt_id {
            Some(parent) => {
                child_of.insert(parent, a);
            }
            None => roots.push(a),
        }
    }

    roots
        .into_iter()
        .map(|root| {
            let mut chain = vec![root];
            while let Some(next) = chain.last().and_then(|a| child_of.remove(&a.id)) {
                chain.push(next);
            }
            chain
        })
        .collect()
}

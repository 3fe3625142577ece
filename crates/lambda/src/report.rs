use std::collections::BTreeMap;

use common::stats::cumulative_secs;

/// (indent, timer, parent timer)
const PROFILE_TREE: &[(usize, &str, &str)] = &[
    (0, "LambdaFunc.Invoke", ""),
    (1, "LambdaInstance-WaitSandbox", "LambdaFunc.Invoke"),
    (2, "LambdaInstance-WaitSandbox-Unpause", "LambdaInstance-WaitSandbox"),
    (2, "LambdaInstance-WaitSandbox-NoImportCache", "LambdaInstance-WaitSandbox"),
    (2, "ImportCache.Create", "LambdaInstance-WaitSandbox"),
    (3, "ImportCache.root.Lookup", "ImportCache.Create"),
    (3, "ImportCache.createChildSandboxFromNode", "ImportCache.Create"),
    (4, "ImportCache.getSandboxInNode", "ImportCache.createChildSandboxFromNode"),
    (
        4,
        "ImportCache.createChildSandboxFromNode:childSandboxPool.Create",
        "ImportCache.createChildSandboxFromNode",
    ),
    (4, "ImportCache.putSandboxInNode", "ImportCache.createChildSandboxFromNode"),
    (5, "ImportCache.putSandboxInNode:Lock", "ImportCache.putSandboxInNode"),
    (5, "ImportCache.putSandboxInNode:Pause", "ImportCache.putSandboxInNode"),
    (1, "LambdaInstance-ServeRequests", "LambdaFunc.Invoke"),
    (2, "LambdaInstance-RoundTrip", "LambdaInstance-ServeRequests"),
];

/// Cumulative time per timer, nested under its parent with the share of the
/// parent's time
pub fn profile_lines(snapshot: &BTreeMap<String, i64>) -> Vec<String> {
    let mut lines = Vec::with_capacity(PROFILE_TREE.len() + 1);
    lines.push("Request Profiling (cumulative seconds):".to_string());

    for (indent, name, parent) in PROFILE_TREE {
        let self_time = cumulative_secs(snapshot, name);
        let parent_time = if parent.is_empty() {
            0.0
        } else {
            cumulative_secs(snapshot, parent)
        };
        let tabs = "\t".repeat(*indent);
        if parent_time > 0.0 {
            lines.push(format!(
                "{}{}: {:.3} ({:.1}%)",
                tabs,
                name,
                self_time,
                self_time / parent_time * 100.0
            ));
        } else {
            lines.push(format!("{}{}: {:.3}", tabs, name, self_time));
        }
    }

    lines
}

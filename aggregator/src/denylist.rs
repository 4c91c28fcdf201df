use std::collections::HashSet;

/// Destructive tool names refused before dispatch unless the process runs
/// with the yolo override.
#[derive(Debug, Clone)]
pub struct Denylist {
    names: HashSet<String>,
    yolo: bool,
}

/// Baseline of destructive admin operations.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "core_service_delete",
    "core_mcpserver_delete",
];

impl Denylist {
    pub fn new(extra: impl IntoIterator<Item = String>, yolo: bool) -> Self {
        let mut names: HashSet<String> =
            DEFAULT_DENYLIST.iter().map(|s| (*s).to_string()).collect();
        names.extend(extra);
        Self { names, yolo }
    }

    /// `Some(reason)` when the call must be refused.
    pub fn refuse_reason(&self, tool: &str) -> Option<String> {
        if self.yolo {
            return None;
        }
        self.names.contains(tool).then(|| {
            format!("tool `{tool}` is denied by the destructive-tool denylist (start with the yolo override to allow it)")
        })
    }
}

impl Default for Denylist {
    fn default() -> Self {
        Self::new(std::iter::empty(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_block_destructive_tools() {
        let denylist = Denylist::default();
        assert!(denylist.refuse_reason("core_service_delete").is_some());
        assert!(denylist.refuse_reason("core_service_list").is_none());
    }

    #[test]
    fn yolo_overrides_everything() {
        let denylist = Denylist::new(vec!["custom_rm".to_string()], true);
        assert!(denylist.refuse_reason("core_service_delete").is_none());
        assert!(denylist.refuse_reason("custom_rm").is_none());
    }

    #[test]
    fn extra_names_are_refused() {
        let denylist = Denylist::new(vec!["prod_wipe".to_string()], false);
        assert!(denylist.refuse_reason("prod_wipe").is_some());
    }
}

//! Live union of upstream capabilities.
//!
//! Readers load an immutable snapshot through an atomic pointer swap;
//! writes rebuild the union from the per-upstream capability sets and swap
//! it in. The version only moves when the resulting snapshot actually
//! differs, so identical rebuilds coalesce into zero `list_changed`
//! notifications.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use arc_swap::ArcSwap;
use rmcp::model::Prompt;
use rmcp::model::Resource;
use rmcp::model::Tool;
use serde_json::Value;
use tracing::warn;

use muster_protocol::AUTHENTICATE_TOOL;
use muster_upstream::UpstreamSnapshot;

/// A public tool and where it came from.
#[derive(Debug, Clone)]
pub struct ToolEntry {
    pub public_name: String,
    pub upstream: String,
    pub original_name: String,
    pub tool: Tool,
}

#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub public_uri: String,
    pub upstream: String,
    pub original_uri: String,
    pub resource: Resource,
}

#[derive(Debug, Clone)]
pub struct PromptEntry {
    pub public_name: String,
    pub upstream: String,
    pub original_name: String,
    pub prompt: Prompt,
}

/// Immutable view of the aggregated capability surface.
#[derive(Default)]
pub struct CapabilitySnapshot {
    pub version: u64,
    pub tools: HashMap<String, ToolEntry>,
    pub resources: HashMap<String, ResourceEntry>,
    pub prompts: HashMap<String, PromptEntry>,
    /// Reverse index: upstream → public tool names it owns.
    pub by_upstream: HashMap<String, Vec<String>>,
    /// When set, the surface is reduced to the synthetic authenticate tool.
    pub pending_auth: bool,
}

struct WriterState {
    /// Registration order matters: the first registrant of a colliding name
    /// keeps it.
    upstreams: Vec<UpstreamSnapshot>,
    pending_auth: bool,
    /// Canonical JSON of the last published snapshot, for change detection.
    fingerprint: Value,
    version: u64,
}

/// Three name→descriptor maps behind an atomically swapped snapshot.
pub struct CapabilityIndex {
    snapshot: ArcSwap<CapabilitySnapshot>,
    writer: Mutex<WriterState>,
}

impl CapabilityIndex {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(CapabilitySnapshot::default()),
            writer: Mutex::new(WriterState {
                upstreams: Vec::new(),
                pending_auth: false,
                fingerprint: Value::Null,
                version: 0,
            }),
        }
    }

    /// Lock-free read of the current snapshot.
    pub fn load(&self) -> Arc<CapabilitySnapshot> {
        self.snapshot.load_full()
    }

    pub fn version(&self) -> u64 {
        self.snapshot.load().version
    }

    /// Insert or replace one upstream's capability set. Returns true when
    /// the published snapshot changed.
    pub fn apply_upstream(&self, incoming: UpstreamSnapshot) -> bool {
        let mut writer = self.writer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match writer
            .upstreams
            .iter_mut()
            .find(|existing| existing.name == incoming.name)
        {
            Some(existing) => *existing = incoming,
            None => writer.upstreams.push(incoming),
        }
        self.rebuild(&mut writer)
    }

    /// Drop one upstream's entries. Returns true when anything changed;
    /// after the swap no lookup can resolve its names.
    pub fn remove_upstream(&self, name: &str) -> bool {
        let mut writer = self.writer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = writer.upstreams.len();
        writer.upstreams.retain(|snapshot| snapshot.name != name);
        if writer.upstreams.len() == before {
            return false;
        }
        self.rebuild(&mut writer)
    }

    /// Toggle pending-auth mode. While set, the published surface is the
    /// single synthetic authenticate tool; clearing it republishes the
    /// full union in one swap.
    pub fn set_pending_auth(&self, pending: bool) -> bool {
        let mut writer = self.writer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if writer.pending_auth == pending {
            return false;
        }
        writer.pending_auth = pending;
        self.rebuild(&mut writer)
    }

    fn rebuild(&self, writer: &mut WriterState) -> bool {
        let mut tools: HashMap<String, ToolEntry> = HashMap::new();
        let mut resources: HashMap<String, ResourceEntry> = HashMap::new();
        let mut prompts: HashMap<String, PromptEntry> = HashMap::new();
        let mut by_upstream: HashMap<String, Vec<String>> = HashMap::new();

        if writer.pending_auth {
            let tool = synthetic_authenticate_tool();
            tools.insert(
                AUTHENTICATE_TOOL.to_string(),
                ToolEntry {
                    public_name: AUTHENTICATE_TOOL.to_string(),
                    upstream: String::new(),
                    original_name: String::new(),
                    tool,
                },
            );
        } else {
            for snapshot in &writer.upstreams {
                let owned = by_upstream.entry(snapshot.name.clone()).or_default();

                for tool in &snapshot.tools {
                    let base = format!("{}{}", snapshot.prefix, tool.name);
                    let public_name = disambiguate(&base, |candidate| {
                        !tools.contains_key(candidate)
                    });
                    if public_name != base {
                        warn!(
                            upstream = %snapshot.name,
                            tool = %tool.name,
                            renamed = %public_name,
                            "public tool name collision; renaming newcomer"
                        );
                    }
                    let mut public_tool = tool.clone();
                    public_tool.name = public_name.clone().into();
                    owned.push(public_name.clone());
                    tools.insert(
                        public_name.clone(),
                        ToolEntry {
                            public_name,
                            upstream: snapshot.name.clone(),
                            original_name: tool.name.to_string(),
                            tool: public_tool,
                        },
                    );
                }

                for resource in &snapshot.resources {
                    let original_uri = resource.uri.to_string();
                    // Duplicate URIs are renamed like tools, for symmetry.
                    let public_uri = disambiguate(&original_uri, |candidate| {
                        !resources.contains_key(candidate)
                    });
                    if public_uri != original_uri {
                        warn!(
                            upstream = %snapshot.name,
                            uri = %original_uri,
                            renamed = %public_uri,
                            "resource URI collision; renaming newcomer"
                        );
                    }
                    let mut public_resource = resource.clone();
                    public_resource.raw.uri = public_uri.clone();
                    resources.insert(
                        public_uri.clone(),
                        ResourceEntry {
                            public_uri,
                            upstream: snapshot.name.clone(),
                            original_uri,
                            resource: public_resource,
                        },
                    );
                }

                for prompt in &snapshot.prompts {
                    let base = format!("{}{}", snapshot.prefix, prompt.name);
                    let public_name = disambiguate(&base, |candidate| {
                        !prompts.contains_key(candidate)
                    });
                    if public_name != base {
                        warn!(
                            upstream = %snapshot.name,
                            prompt = %prompt.name,
                            renamed = %public_name,
                            "prompt name collision; renaming newcomer"
                        );
                    }
                    let mut public_prompt = prompt.clone();
                    public_prompt.name = public_name.clone();
                    prompts.insert(
                        public_name.clone(),
                        PromptEntry {
                            public_name,
                            upstream: snapshot.name.clone(),
                            original_name: prompt.name.clone(),
                            prompt: public_prompt,
                        },
                    );
                }
            }
        }

        let fingerprint = fingerprint(&tools, &resources, &prompts, writer.pending_auth);
        if fingerprint == writer.fingerprint {
            return false;
        }
        writer.fingerprint = fingerprint;
        writer.version += 1;

        self.snapshot.store(Arc::new(CapabilitySnapshot {
            version: writer.version,
            tools,
            resources,
            prompts,
            by_upstream,
            pending_auth: writer.pending_auth,
        }));
        true
    }
}

impl Default for CapabilityIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// First free candidate: the base name, then `base__2`, `base__3`, …
fn disambiguate(base: &str, is_free: impl Fn(&str) -> bool) -> String {
    if is_free(base) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}__{n}");
        if is_free(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Canonical JSON of the public surface. BTreeMap keeps key order stable so
/// equal surfaces compare equal.
fn fingerprint(
    tools: &HashMap<String, ToolEntry>,
    resources: &HashMap<String, ResourceEntry>,
    prompts: &HashMap<String, PromptEntry>,
    pending_auth: bool,
) -> Value {
    let tools: BTreeMap<&String, Value> = tools
        .iter()
        .map(|(name, entry)| {
            (
                name,
                serde_json::to_value(&entry.tool).unwrap_or(Value::Null),
            )
        })
        .collect();
    let resources: BTreeMap<&String, Value> = resources
        .iter()
        .map(|(uri, entry)| {
            (
                uri,
                serde_json::to_value(&entry.resource).unwrap_or(Value::Null),
            )
        })
        .collect();
    let prompts: BTreeMap<&String, Value> = prompts
        .iter()
        .map(|(name, entry)| {
            (
                name,
                serde_json::to_value(&entry.prompt).unwrap_or(Value::Null),
            )
        })
        .collect();
    serde_json::json!({
        "pending_auth": pending_auth,
        "tools": tools,
        "resources": resources,
        "prompts": prompts,
    })
}

fn synthetic_authenticate_tool() -> Tool {
    let schema = serde_json::json!({
        "type": "object",
        "properties": {},
        "additionalProperties": false,
    });
    let schema_object = match schema {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    Tool::new(
        AUTHENTICATE_TOOL,
        "Authenticate this muster instance. Call once, then follow the returned URL in a browser; the full tool set appears after login.",
        Arc::new(schema_object),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tool(name: &str) -> Tool {
        Tool::new(
            name.to_string(),
            format!("test tool {name}"),
            Arc::new(serde_json::Map::new()),
        )
    }

    fn snapshot(name: &str, prefix: &str, tools: &[&str]) -> UpstreamSnapshot {
        UpstreamSnapshot {
            name: name.to_string(),
            prefix: prefix.to_string(),
            tools: tools.iter().map(|t| tool(t)).collect(),
            resources: Vec::new(),
            prompts: Vec::new(),
        }
    }

    #[test]
    fn prefixes_keep_same_named_tools_distinct() {
        let index = CapabilityIndex::new();
        index.apply_upstream(snapshot("a", "a_", &["ping"]));
        index.apply_upstream(snapshot("b", "b_", &["ping"]));

        let snap = index.load();
        assert!(snap.tools.contains_key("a_ping"));
        assert!(snap.tools.contains_key("b_ping"));
        assert_eq!(snap.tools["a_ping"].original_name, "ping");
        assert_eq!(snap.tools["b_ping"].upstream, "b");
    }

    #[test]
    fn collision_renames_second_registrant_with_suffix() {
        let index = CapabilityIndex::new();
        index.apply_upstream(snapshot("a", "", &["ping"]));
        index.apply_upstream(snapshot("b", "", &["ping"]));

        let snap = index.load();
        assert!(snap.tools.contains_key("ping"));
        assert!(snap.tools.contains_key("ping__2"));
        assert_eq!(snap.tools["ping"].upstream, "a");
        assert_eq!(snap.tools["ping__2"].upstream, "b");
        assert_eq!(snap.tools["ping__2"].original_name, "ping");
    }

    #[test]
    fn removing_an_upstream_drops_all_its_entries() {
        let index = CapabilityIndex::new();
        index.apply_upstream(snapshot("a", "a_", &["ping", "pong"]));
        index.apply_upstream(snapshot("b", "b_", &["ping"]));

        assert!(index.remove_upstream("a"));
        let snap = index.load();
        assert!(!snap.tools.contains_key("a_ping"));
        assert!(!snap.tools.contains_key("a_pong"));
        assert!(snap.tools.contains_key("b_ping"));
        assert!(!snap.by_upstream.contains_key("a"));
    }

    #[test]
    fn identical_rebuilds_do_not_bump_the_version() {
        let index = CapabilityIndex::new();
        assert!(index.apply_upstream(snapshot("a", "a_", &["ping"])));
        let version = index.version();

        // Same content again: no change, no version bump.
        assert!(!index.apply_upstream(snapshot("a", "a_", &["ping"])));
        assert_eq!(index.version(), version);

        assert!(index.apply_upstream(snapshot("a", "a_", &["ping", "pong"])));
        assert_eq!(index.version(), version + 1);
    }

    #[test]
    fn pending_auth_swaps_to_the_synthetic_tool_and_back() {
        let index = CapabilityIndex::new();
        index.apply_upstream(snapshot("a", "a_", &["ping"]));

        assert!(index.set_pending_auth(true));
        let snap = index.load();
        assert!(snap.pending_auth);
        assert_eq!(snap.tools.len(), 1);
        assert!(snap.tools.contains_key(AUTHENTICATE_TOOL));

        // One swap restores the full union.
        assert!(index.set_pending_auth(false));
        let snap = index.load();
        assert!(!snap.pending_auth);
        assert!(snap.tools.contains_key("a_ping"));
        assert!(!snap.tools.contains_key(AUTHENTICATE_TOOL));

        // Setting the same mode twice is a no-op.
        assert!(!index.set_pending_auth(false));
    }

    #[test]
    fn first_registrant_keeps_its_name_after_re_list() {
        let index = CapabilityIndex::new();
        index.apply_upstream(snapshot("a", "", &["ping"]));
        index.apply_upstream(snapshot("b", "", &["ping"]));
        // Upstream `a` re-lists; `b` must keep its renamed slot.
        index.apply_upstream(snapshot("a", "", &["ping"]));

        let snap = index.load();
        assert_eq!(snap.tools["ping"].upstream, "a");
        assert_eq!(snap.tools["ping__2"].upstream, "b");
    }
}

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use futures::future::{try_join_all, BoxFuture, Shared};
use futures::FutureExt;
use http::Method;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::AccessTokenProvider;
use crate::errors::{ClientError, Result};
use crate::fhir::client::FhirClient;
use crate::observability::metrics::get_metrics;

/// How resolved references are reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolveMode {
    /// Reference nodes in the root are replaced by the fetched resources.
    #[default]
    Graph,
    /// The root is left untouched; only the returned cache is filled.
    Flat,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceEntry {
    Resolved(Value),
    /// The server answered 404; the reference was left as is.
    NotFound,
}

/// Outcome of every reference fetched during one `resolve_references`
/// call, keyed by the reference as written in the resource.
#[derive(Debug, Clone, Default)]
pub struct ReferenceCache {
    entries: BTreeMap<String, ReferenceEntry>,
}

impl ReferenceCache {
    pub fn get(&self, reference: &str) -> Option<&ReferenceEntry> {
        self.entries.get(reference)
    }

    /// The fetched resource, if the reference resolved.
    pub fn resource(&self, reference: &str) -> Option<&Value> {
        match self.entries.get(reference)? {
            ReferenceEntry::Resolved(resource) => Some(resource),
            ReferenceEntry::NotFound => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ReferenceEntry)> {
        self.entries.iter()
    }

    /// `{reference: resource | null}`
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .entries
            .iter()
            .map(|(reference, entry)| {
                let value = match entry {
                    ReferenceEntry::Resolved(resource) => resource.clone(),
                    ReferenceEntry::NotFound => Value::Null,
                };
                (reference.clone(), value)
            })
            .collect();
        Value::Object(map)
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Option<Value>>>>;

/// In-flight and settled fetches of one resolution call.
///
/// A fetch is registered before it is first polled, so a sibling asking for
/// the same reference joins the pending future instead of issuing a second
/// request. The same lookup stops reference cycles.
struct SharedFetches<P> {
    client: FhirClient<P>,
    fetches: Mutex<HashMap<String, SharedFetch>>,
}

impl<P> SharedFetches<P>
where
    P: AccessTokenProvider + 'static,
{
    fn new(client: FhirClient<P>) -> Self {
        Self {
            client,
            fetches: Mutex::new(HashMap::new()),
        }
    }

    fn fetch(&self, reference: &str) -> SharedFetch {
        let metrics = get_metrics();
        let mut fetches = self.fetches.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = fetches.get(reference) {
            debug!("reference {} already requested, reusing", reference);
            metrics.reference_fetches.with_label_values(&["deduplicated"]).inc();
            return existing.clone();
        }

        let client = self.client.clone();
        let owned = reference.to_string();
        let fetch = async move {
            match client.request(Method::GET, &owned, None).await {
                Ok(resource) => {
                    metrics.reference_fetches.with_label_values(&["resolved"]).inc();
                    Ok(Some(resource))
                }
                Err(e) if e.is_not_found() => {
                    warn!("reference {} not found, leaving it unresolved", owned);
                    metrics.reference_fetches.with_label_values(&["not_found"]).inc();
                    Ok(None)
                }
                Err(e) => {
                    metrics.reference_fetches.with_label_values(&["error"]).inc();
                    Err(e)
                }
            }
        }
        .boxed()
        .shared();

        fetches.insert(reference.to_string(), fetch.clone());
        fetch
    }

    /// Absolute reference outside the origin of the FHIR base; never fetched.
    fn is_foreign(&self, reference: &str) -> bool {
        match Url::parse(reference) {
            Ok(url) => url.origin() != self.client.base_url().origin(),
            Err(_) => false,
        }
    }

    /// Settled, successful fetches; followed by flat mode in place of the
    /// untouched root.
    fn resolved_snapshot(&self) -> HashMap<String, Value> {
        let fetches = self.fetches.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        fetches
            .iter()
            .filter_map(|(reference, fetch)| match fetch.peek() {
                Some(Ok(Some(resource))) => Some((reference.clone(), resource.clone())),
                _ => None,
            })
            .collect()
    }

    fn into_cache(self) -> ReferenceCache {
        let fetches = self.fetches.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entries = fetches
            .into_iter()
            .filter_map(|(reference, fetch)| {
                let entry = match fetch.peek()? {
                    Ok(Some(resource)) => ReferenceEntry::Resolved(resource.clone()),
                    Ok(None) => ReferenceEntry::NotFound,
                    Err(_) => return None,
                };
                Some((reference, entry))
            })
            .collect();
        ReferenceCache { entries }
    }
}

/// A reference found while walking a path.
#[derive(Debug, Clone, PartialEq)]
struct Target {
    /// JSON pointer of the reference node inside the resource
    pointer: String,
    reference: String,
}

impl<P> FhirClient<P>
where
    P: AccessTokenProvider + 'static,
{
    /// Fetches the references found at `paths` inside `root`.
    ///
    /// Paths are dot separated; `..` (or an array met on the way) iterates
    /// the array at that point. Paths are processed by ascending depth and a
    /// depth only starts once the previous one has settled. A Bundle root
    /// resolves every `entry[].resource` over one shared cache.
    ///
    /// A 404 leaves the reference unresolved; any other failure aborts.
    pub async fn resolve_references(
        &self,
        root: &mut Value,
        paths: &[&str],
        mode: ResolveMode,
    ) -> Result<ReferenceCache> {
        let paths = normalize_paths(paths);
        let fetches = SharedFetches::new(self.clone());
        if paths.is_empty() {
            return Ok(ReferenceCache::default());
        }

        if is_bundle(root) {
            if let Some(entries) = root.get_mut("entry").and_then(Value::as_array_mut) {
                let resources = entries.iter_mut().filter_map(|entry| entry.get_mut("resource"));
                try_join_all(resources.map(|resource| resolve_in_resource(resource, &paths, mode, &fetches))).await?;
            }
        } else {
            resolve_in_resource(root, &paths, mode, &fetches).await?;
        }

        let cache = fetches.into_cache();
        info!("resolved {} distinct references", cache.len());
        Ok(cache)
    }
}

async fn resolve_in_resource<P>(
    resource: &mut Value,
    paths: &[String],
    mode: ResolveMode,
    fetches: &SharedFetches<P>,
) -> Result<()>
where
    P: AccessTokenProvider + 'static,
{
    for (depth, group) in group_by_depth(paths) {
        let resolved = match mode {
            ResolveMode::Flat => Some(fetches.resolved_snapshot()),
            ResolveMode::Graph => None,
        };

        let mut targets = Vec::new();
        for path in &group {
            let segments: Vec<&str> = path.split('.').collect();
            walk(resource, &segments, String::new(), resolved.as_ref(), &mut targets);
        }
        targets.retain(|target| {
            if fetches.is_foreign(&target.reference) {
                warn!("reference {} points outside the FHIR server, skipped", target.reference);
                get_metrics().reference_fetches.with_label_values(&["foreign"]).inc();
                return false;
            }
            true
        });
        debug!("depth {}: {} references for {:?}", depth, targets.len(), group);

        let settled = try_join_all(targets.into_iter().map(|target| async move {
            let resource = fetches.fetch(&target.reference).await?;
            Ok::<_, ClientError>((target, resource))
        }))
        .await?;

        if mode == ResolveMode::Graph {
            for (target, fetched) in settled {
                let Some(fetched) = fetched else { continue };
                if let Some(node) = resource.pointer_mut(&target.pointer) {
                    *node = fetched;
                }
            }
        }
    }
    Ok(())
}

/// Trimmed, non-empty, first occurrence kept.
fn normalize_paths(paths: &[&str]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(paths.len());
    for path in paths.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        if normalized.iter().any(|seen| seen == path) {
            debug!("duplicate reference path '{}' ignored", path);
            continue;
        }
        normalized.push(path.to_string());
    }
    normalized
}

/// Depth is the number of `.` separated segments.
fn group_by_depth(paths: &[String]) -> BTreeMap<usize, Vec<String>> {
    let mut groups: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for path in paths {
        groups.entry(path.split('.').count()).or_default().push(path.clone());
    }
    groups
}

fn walk(
    node: &Value,
    segments: &[&str],
    pointer: String,
    resolved: Option<&HashMap<String, Value>>,
    out: &mut Vec<Target>,
) {
    if let Value::Array(items) = node {
        // an explicit index picks one item, anything else visits them all
        if let Some((head, rest)) = segments.split_first() {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(item) = items.get(index) {
                    walk(item, rest, format!("{}/{}", pointer, index), resolved, out);
                }
                return;
            }
        }
        for (index, item) in items.iter().enumerate() {
            if is_falsy(item) {
                continue;
            }
            walk(item, segments, format!("{}/{}", pointer, index), resolved, out);
        }
        return;
    }

    let Some((head, rest)) = segments.split_first() else {
        if let Some(reference) = node.get("reference").and_then(Value::as_str) {
            // contained resources are already in the document
            if !reference.is_empty() && !reference.starts_with('#') {
                out.push(Target {
                    pointer,
                    reference: reference.to_string(),
                });
            }
        }
        return;
    };

    if head.is_empty() {
        return walk(node, rest, pointer, resolved, out);
    }

    // flat mode leaves reference nodes in place, so step through the cache
    let node = match (resolved, node.get("reference").and_then(Value::as_str)) {
        (Some(resolved), Some(reference)) if node.get(*head).is_none() => match resolved.get(reference) {
            Some(resource) => resource,
            None => return,
        },
        _ => node,
    };

    if let Some(child) = node.get(*head).filter(|child| !is_falsy(child)) {
        let pointer = format!("{}/{}", pointer, head.replace('~', "~0").replace('/', "~1"));
        walk(child, rest, pointer, resolved, out);
    }
}

fn is_bundle(value: &Value) -> bool {
    value.get("resourceType").and_then(Value::as_str) == Some("Bundle")
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::String(text) => text.is_empty(),
        Value::Number(number) => number.as_f64() == Some(0.0),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn targets(resource: &Value, path: &str) -> Vec<(String, String)> {
        let segments: Vec<&str> = path.split('.').collect();
        let mut out = Vec::new();
        walk(resource, &segments, String::new(), None, &mut out);
        out.into_iter().map(|t| (t.pointer, t.reference)).collect()
    }

    #[test]
    fn paths_are_trimmed_and_deduplicated() {
        let paths = normalize_paths(&[" subject ", "", "subject", "encounter", "  "]);
        assert_eq!(paths, vec!["subject".to_string(), "encounter".to_string()]);
    }

    #[test]
    fn paths_are_grouped_by_ascending_depth() {
        let paths = normalize_paths(&["a.b.c", "a", "x.y", "b"]);
        let groups: Vec<(usize, Vec<String>)> = group_by_depth(&paths).into_iter().collect();
        assert_eq!(groups[0], (1, vec!["a".to_string(), "b".to_string()]));
        assert_eq!(groups[1], (2, vec!["x.y".to_string()]));
        assert_eq!(groups[2], (3, vec!["a.b.c".to_string()]));
    }

    #[test]
    fn single_reference_is_found() {
        let resource = json!({"subject": {"reference": "Patient/1"}});
        assert_eq!(targets(&resource, "subject"), vec![("/subject".into(), "Patient/1".into())]);
    }

    #[test]
    fn arrays_are_iterated_and_falsy_items_skipped() {
        let resource = json!({
            "performer": [
                {"actor": {"reference": "Practitioner/1"}},
                null,
                {"actor": {"reference": "Practitioner/2"}}
            ],
            "basedOn": [{"reference": "ServiceRequest/9"}, {"reference": "#contained"}]
        });

        assert_eq!(
            targets(&resource, "performer..actor"),
            vec![
                ("/performer/0/actor".into(), "Practitioner/1".into()),
                ("/performer/2/actor".into(), "Practitioner/2".into()),
            ]
        );
        assert_eq!(targets(&resource, "basedOn"), vec![("/basedOn/0".into(), "ServiceRequest/9".into())]);
        assert_eq!(
            targets(&resource, "performer.2.actor"),
            vec![("/performer/2/actor".into(), "Practitioner/2".into())]
        );
    }

    #[test]
    fn flat_walk_steps_through_resolved_references() {
        let resource = json!({"encounter": {"reference": "Encounter/5"}});
        let mut resolved = HashMap::new();
        resolved.insert(
            "Encounter/5".to_string(),
            json!({"resourceType": "Encounter", "serviceProvider": {"reference": "Organization/3"}}),
        );

        let segments = ["encounter", "serviceProvider"];
        let mut out = Vec::new();
        walk(&resource, &segments, String::new(), Some(&resolved), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].reference, "Organization/3");

        let mut out = Vec::new();
        walk(&resource, &segments, String::new(), None, &mut out);
        assert!(out.is_empty());
    }
}

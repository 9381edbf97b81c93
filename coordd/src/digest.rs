use std::collections::{BTreeMap, HashMap};
use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::ServiceRecord;

/// Stable projection of a node: metadata is re-keyed into a BTreeMap so the
/// serialized form does not depend on hash map iteration order.
#[derive(Serialize)]
struct NodeView<'a> {
    id: &'a str,
    address: &'a str,
    metadata: BTreeMap<&'a str, &'a str>,
}

#[derive(Serialize)]
struct RecordView<'a> {
    name: &'a str,
    version: &'a str,
    nodes: Vec<NodeView<'a>>,
}

/// SHA-256 over a registry scan.
/// Records are sorted by name, node order is kept since it is part of the record.
pub fn records_digest(records: &[ServiceRecord]) -> String {
    let mut indices: Vec<usize> = (0..records.len()).collect();
    indices.sort_by(|&a, &b| records[a].name.cmp(&records[b].name));

    let views: Vec<RecordView<'_>> = indices
        .iter()
        .map(|&i| {
            let r = &records[i];
            RecordView {
                name: &r.name,
                version: &r.version,
                nodes: r
                    .nodes
                    .iter()
                    .map(|n| NodeView {
                        id: &n.id,
                        address: &n.address,
                        metadata: n
                            .metadata
                            .iter()
                            .map(|(k, v)| (k.as_str(), v.as_str()))
                            .collect(),
                    })
                    .collect(),
            }
        })
        .collect();

    hash_view(&views)
}

/// SHA-256 over a cache space's key/value contents
pub fn entries_digest(entries: &HashMap<String, String>) -> String {
    let view: BTreeMap<&str, &str> = entries
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    hash_view(&view)
}

fn hash_view<T: Serialize>(view: &T) -> String {
    // Views hold only strings and maps with string keys, serialization cannot fail
    let json = serde_json::to_vec(view).unwrap_or_default();
    hex::encode(Sha256::digest(&json))
}

//! Node selection (component E): ranks registry nodes for a given
//! `(playbackID, lat, lon)` request and returns one.

use rand::seq::SliceRandom;

use crate::geo;
use crate::registry::{NodeRegistry, ScoredNode};

const TOP_N: usize = 3;

/// Parse `lat`/`lon` query or header values. Returns `None` when either is
/// missing or out of range — callers should then skip geo banding entirely
/// rather than score against `(0, 0)`, per SPEC_FULL.md 4.E step 1.
#[must_use]
pub fn parse_coords(lat: Option<&str>, lon: Option<&str>) -> Option<(f64, f64)> {
    let lat: f64 = lat?.parse().ok()?;
    let lon: f64 = lon?.parse().ok()?;
    if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) {
        Some((lat, lon))
    } else {
        None
    }
}

/// Selection result: the winning node's name and the fully-qualified
/// playback id to route to on that node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub node_name: String,
    pub full_playback_id: String,
}

/// `getBestNode(prefixes, playbackID, lat, lon, fallbackPrefix, isStudioReq)`.
///
/// `own_node_name` is used both as the fallback when the snapshot is empty
/// and to build `full_playback_id` when falling back. `fallback_prefix` is
/// `RedirectConfig::fallback_prefix` — used only when `prefixes` is empty,
/// per SPEC_FULL.md 8 ("Empty prefix list: selector returns
/// `video+{ID}`" with the deployment's configured fallback, not a literal).
pub fn get_best_node(
    registry: &NodeRegistry,
    prefixes: &[String],
    playback_id: &str,
    coords: Option<(f64, f64)>,
    own_node_name: &str,
    fallback_prefix: &str,
) -> Selection {
    let prefix = prefixes.first().map_or(fallback_prefix, String::as_str);
    let full_playback_id = format!("{prefix}+{playback_id}");

    let mut snapshot = registry.snapshot_fresh();
    if snapshot.is_empty() {
        return Selection {
            node_name: own_node_name.to_string(),
            full_playback_id,
        };
    }

    if let Some((lat, lon)) = coords {
        apply_geo_scores(&mut snapshot, lat, lon);
    } else {
        // No usable coordinates: all nodes tie at the best band so locality
        // drops out of the ranking entirely, per SPEC_FULL.md 4.E step 1.
        for node in &mut snapshot {
            node.geo_score = 2;
        }
    }

    let tier = pick_tier(&snapshot, playback_id);
    let chosen = pick_from_top_n(&tier, TOP_N);

    Selection {
        node_name: chosen.name.clone(),
        full_playback_id,
    }
}

fn apply_geo_scores(snapshot: &mut [ScoredNode], lat: f64, lon: f64) {
    let coords: Vec<(f64, f64)> = snapshot
        .iter()
        .map(|n| (n.metrics.geo_lat, n.metrics.geo_lon))
        .collect();
    let scored = geo::score_all(&coords, lat, lon);
    for (node, (distance, score)) in snapshot.iter_mut().zip(scored) {
        node.geo_distance_km = distance;
        node.geo_score = score;
    }
}

/// Returns the winning tier's nodes. Tier 1 and tier 2 are filters; tier 3
/// is a weighted sort over everything, so it always produces a non-empty
/// result once the snapshot itself is non-empty.
fn pick_tier(snapshot: &[ScoredNode], playback_id: &str) -> Vec<ScoredNode> {
    let tier1: Vec<ScoredNode> = snapshot
        .iter()
        .filter(|n| n.geo_score == 2 && n.has_playback_stream(playback_id) && n.load_score == 2)
        .cloned()
        .collect();
    if !tier1.is_empty() {
        return tier1;
    }

    let tier2: Vec<ScoredNode> = snapshot
        .iter()
        .filter(|n| n.geo_score == 2 && n.load_score == 2)
        .cloned()
        .collect();
    if !tier2.is_empty() {
        return tier2;
    }

    let mut tier3: Vec<ScoredNode> = snapshot
        .iter()
        .map(|n| {
            let mut n = n.clone();
            n.score = n.geo_score + n.load_score + if n.has_playback_stream(playback_id) { 2 } else { 0 };
            n
        })
        .collect();
    tier3.sort_by(|a, b| b.score.cmp(&a.score));
    tier3
}

/// Shuffle-and-truncate to the top `n` (all, if fewer), then pick uniformly
/// at random. `tier` is assumed already sorted best-first for tier 3; tiers
/// 1/2 have no internal ordering, which is fine since every member of the
/// tier is equally eligible.
fn pick_from_top_n(tier: &[ScoredNode], n: usize) -> ScoredNode {
    let take = tier.len().min(n);
    let mut candidates: Vec<&ScoredNode> = tier[..take].iter().collect();
    let mut rng = rand::thread_rng();
    candidates.shuffle(&mut rng);
    candidates[0].clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Node, NodeMetrics, RegistryTimeouts};
    use std::collections::HashMap;
    use std::time::Instant;

    fn setup(nodes: &[(&str, f64, f64, f64)]) -> NodeRegistry {
        let reg = NodeRegistry::new(RegistryTimeouts::default());
        let member_nodes: Vec<Node> = nodes
            .iter()
            .map(|(name, ..)| Node {
                name: (*name).to_string(),
                tags: HashMap::new(),
            })
            .collect();
        reg.replace_membership(member_nodes);
        for (name, lat, cpu, _lon) in nodes {
            reg.record_metrics(
                name,
                NodeMetrics {
                    cpu: *cpu,
                    ram: 10.0,
                    bandwidth: 0.0,
                    load5: 0.1,
                    geo_lat: *lat,
                    geo_lon: 0.0,
                    received_at: Instant::now(),
                },
            );
        }
        reg
    }

    #[test]
    fn parse_coords_boundaries() {
        assert!(parse_coords(Some("90"), Some("180")).is_some());
        assert!(parse_coords(Some("-90"), Some("-180")).is_some());
        assert!(parse_coords(Some("90.0001"), Some("0")).is_none());
        assert!(parse_coords(None, Some("0")).is_none());
        assert!(parse_coords(Some("abc"), Some("0")).is_none());
    }

    #[test]
    fn empty_snapshot_falls_back_to_self() {
        let reg = NodeRegistry::new(RegistryTimeouts::default());
        let sel = get_best_node(&reg, &[], "abc", None, "self", "video");
        assert_eq!(sel.node_name, "self");
        assert_eq!(sel.full_playback_id, "video+abc");
    }

    #[test]
    fn scenario_tier2_beats_tier3() {
        // A(lat=51,cpu=10), B(lat=51,cpu=95), C(lat=1,cpu=10); request lat=51.
        let reg = setup(&[("A", 51.0, 10.0, 0.0), ("B", 51.0, 95.0, 0.0), ("C", 1.0, 10.0, 0.0)]);
        let sel = get_best_node(&reg, &[], "abc", Some((51.0, 0.0)), "self", "video");
        assert_eq!(sel.node_name, "A");
    }

    #[test]
    fn scenario_tier1_wins_with_stream_affinity() {
        let reg = setup(&[("A", 51.0, 10.0, 0.0), ("B", 51.0, 10.0, 0.0), ("C", 1.0, 10.0, 0.0)]);
        reg.record_streams("B", &["abc".to_string()], &[], Instant::now());
        let sel = get_best_node(&reg, &[], "abc", Some((51.0, 0.0)), "self", "video");
        assert_eq!(sel.node_name, "B");
    }

    #[test]
    fn tier1_exclusivity_property() {
        // If any tier-1 node exists, the winner must come only from tier 1.
        let reg = setup(&[
            ("A", 51.0, 10.0, 0.0),
            ("B", 51.0, 10.0, 0.0),
            ("C", 51.0, 10.0, 0.0),
        ]);
        reg.record_streams("B", &["abc".to_string()], &[], Instant::now());
        for _ in 0..20 {
            let sel = get_best_node(&reg, &[], "abc", Some((51.0, 0.0)), "self", "video");
            assert_eq!(sel.node_name, "B");
        }
    }

    #[test]
    fn empty_prefix_list_defaults_to_video() {
        let reg = setup(&[("A", 51.0, 10.0, 0.0)]);
        let sel = get_best_node(&reg, &[], "abc", None, "self", "video");
        assert_eq!(sel.full_playback_id, "video+abc");
    }

    #[test]
    fn no_coords_skips_geo_banding_all_nodes_tie() {
        let reg = setup(&[("A", 51.0, 10.0, 0.0), ("C", 1.0, 10.0, 0.0)]);
        // Both should be reachable as winners across many draws once coords
        // are absent, since geo no longer distinguishes them.
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let sel = get_best_node(&reg, &[], "abc", None, "self", "video");
            seen.insert(sel.node_name);
        }
        assert_eq!(seen.len(), 2);
    }
}

//! Identity reconciliation between a fresh grouping and the previous clusters.
//!
//! A group inherits a previous cluster when their overlap exceeds half of the
//! previous cluster's size and half of the group's size. At most one group can
//! satisfy both halves for a given cluster, so inheritance never has to be
//! arbitrated between groups; ties between clusters for one group go to the
//! larger overlap, then the lower id.
//!
//! Forced groups are resolved per person name `N`, first match wins:
//! 1. an automatic group that inherited a cluster named `N` absorbs the forced faces
//! 2. the unclaimed previous cluster named `N` (lowest id) is inherited
//! 3. the overlap rule above, against unclaimed clusters
//! 4. a new cluster
//!
//! In every case the resulting cluster is named `N`. Faces currently forced
//! onto any name do not count toward an automatic group's overlap.

use std::collections::{BTreeMap, HashMap, HashSet};

/// A cluster as it stood before the run.
#[derive(Debug, Clone)]
pub(crate) struct PriorCluster {
    pub id: i64,
    pub name: Option<String>,
    pub members: Vec<i64>,
}

/// A cluster to be written by the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlannedCluster {
    /// Previous cluster whose identity is kept; `None` mints a new cluster.
    pub inherits: Option<i64>,
    /// Name to write. `None` keeps the stored name of an inherited cluster.
    pub forced_name: Option<String>,
    /// Member face ids, ascending.
    pub members: Vec<i64>,
}

/// Match automatic groups and forced groups to previous clusters.
///
/// `auto_groups` come from density clustering; `forced` maps each person name to
/// the faces forced onto it. Face ids must not appear in more than one input group.
pub(crate) fn reconcile(
    auto_groups: Vec<Vec<i64>>,
    forced: &BTreeMap<String, Vec<i64>>,
    prior: &[PriorCluster],
) -> Vec<PlannedCluster> {
    let owner = owners(prior);
    let mut claimed = vec![false; prior.len()];
    let mut planned = Vec::with_capacity(auto_groups.len() + forced.len());

    // Automatic groups are matched against the automatic part of each previous
    // cluster; forced faces it absorbed last time are resolved by name below.
    let forced_ids: HashSet<i64> = forced.values().flatten().copied().collect();
    let auto_prior: Vec<PriorCluster> = prior
        .iter()
        .map(|c| PriorCluster {
            id: c.id,
            name: c.name.clone(),
            members: c
                .members
                .iter()
                .copied()
                .filter(|id| !forced_ids.contains(id))
                .collect(),
        })
        .collect();
    let auto_owner = owners(&auto_prior);

    for mut members in auto_groups {
        members.sort_unstable();
        let inherits = best_match(&members, &auto_prior, &auto_owner, &claimed);
        if let Some(idx) = inherits {
            claimed[idx] = true;
        }
        planned.push(PlannedCluster {
            inherits: inherits.map(|idx| prior[idx].id),
            forced_name: None,
            members,
        });
    }
    let auto_count = planned.len();

    let name_of: HashMap<i64, Option<&str>> = prior
        .iter()
        .map(|c| (c.id, c.name.as_deref()))
        .collect();

    for (name, faces) in forced {
        let absorbing = planned[..auto_count]
            .iter()
            .enumerate()
            .filter(|(_, p)| p.forced_name.is_none())
            .filter_map(|(i, p)| p.inherits.map(|id| (i, id)))
            .filter(|(_, id)| name_of.get(id).copied().flatten() == Some(name.as_str()))
            .min_by_key(|(_, id)| *id)
            .map(|(i, _)| i);

        if let Some(i) = absorbing {
            let target = &mut planned[i];
            target.members.extend(faces.iter().copied());
            target.members.sort_unstable();
            target.forced_name = Some(name.clone());
            continue;
        }

        let mut members = faces.clone();
        members.sort_unstable();

        let inherits = prior
            .iter()
            .enumerate()
            .find(|(idx, c)| !claimed[*idx] && c.name.as_deref() == Some(name.as_str()))
            .map(|(idx, _)| idx)
            .or_else(|| best_match(&members, prior, &owner, &claimed));
        if let Some(idx) = inherits {
            claimed[idx] = true;
        }

        planned.push(PlannedCluster {
            inherits: inherits.map(|idx| prior[idx].id),
            forced_name: Some(name.clone()),
            members,
        });
    }

    planned
}

/// Face id to the index of the previous cluster holding it.
fn owners(prior: &[PriorCluster]) -> HashMap<i64, usize> {
    let mut owner = HashMap::new();
    for (idx, cluster) in prior.iter().enumerate() {
        for &face_id in &cluster.members {
            owner.insert(face_id, idx);
        }
    }
    owner
}

/// Index of the unclaimed previous cluster this group inherits, if any.
fn best_match(
    members: &[i64],
    prior: &[PriorCluster],
    owner: &HashMap<i64, usize>,
    claimed: &[bool],
) -> Option<usize> {
    let mut overlap: HashMap<usize, usize> = HashMap::new();
    for face_id in members {
        if let Some(&idx) = owner.get(face_id) {
            *overlap.entry(idx).or_default() += 1;
        }
    }

    overlap
        .into_iter()
        .filter(|&(idx, shared)| {
            !claimed[idx] && 2 * shared > prior[idx].members.len() && 2 * shared > members.len()
        })
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| prior[b.0].id.cmp(&prior[a.0].id)))
        .map(|(idx, _)| idx)
}

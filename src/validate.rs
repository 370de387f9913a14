//! Consistency checks run before a result is persisted.
//!
//! Any failure here is a logic defect: the run aborts and the previous
//! result stays authoritative.

use std::collections::{BTreeSet, HashSet};

use crate::error::ConsistencyError;
use crate::model::{AnalysisResult, ClusterNode, LabelStatus, Members};

/// Structural checks plus exact accounting against the input ticket ids.
pub fn validate(result: &AnalysisResult, input_ids: &BTreeSet<String>) -> Result<(), ConsistencyError> {
    let assigned = validate_structure(result)?;
    for id in &assigned {
        if !input_ids.contains(*id) {
            return Err(ConsistencyError::UnknownTicket(id.to_string()));
        }
    }
    if let Some(missing) = input_ids.iter().find(|id| !assigned.contains(id.as_str())) {
        return Err(ConsistencyError::MissingTicket(missing.clone()));
    }
    Ok(())
}

/// Checks that need no input: tree shape, volumes, disjoint leaves, labels
/// and metadata totals. Returns every assigned ticket id.
pub fn validate_structure(result: &AnalysisResult) -> Result<HashSet<&str>, ConsistencyError> {
    let mut node_ids = HashSet::new();
    let mut assigned: HashSet<&str> = HashSet::new();
    let last = result.nodes.len().saturating_sub(1);

    for (i, node) in result.nodes.iter().enumerate() {
        if node.is_noise() && i != last {
            return Err(ConsistencyError::NoiseNotLast);
        }
        check_node(node, &mut node_ids, &mut assigned)?;
        if let Members::Parent { children } = &node.members {
            if children.len() < 2 {
                return Err(ConsistencyError::SingleChildParent(node.id.clone()));
            }
            for child in children {
                if !child.is_leaf() {
                    return Err(ConsistencyError::TooDeep(child.id.clone()));
                }
                if child.is_noise() {
                    return Err(ConsistencyError::NoiseNotLast);
                }
                check_node(child, &mut node_ids, &mut assigned)?;
            }
        }
    }

    let total: usize = result.nodes.iter().map(|n| n.metrics.volume).sum();
    if total != result.metadata.total_tickets || assigned.len() != total {
        return Err(ConsistencyError::VolumeMismatch {
            id: "result".into(),
            volume: total,
            expected: result.metadata.total_tickets,
        });
    }
    if node_ids.len() != result.metadata.total_nodes {
        return Err(ConsistencyError::VolumeMismatch {
            id: "result.total_nodes".into(),
            volume: node_ids.len(),
            expected: result.metadata.total_nodes,
        });
    }
    Ok(assigned)
}

fn check_node<'a>(
    node: &'a ClusterNode,
    node_ids: &mut HashSet<&'a str>,
    assigned: &mut HashSet<&'a str>,
) -> Result<(), ConsistencyError> {
    if !node_ids.insert(node.id.as_str()) {
        return Err(ConsistencyError::DuplicateNodeId(node.id.clone()));
    }
    if node.label_status == LabelStatus::Pending {
        return Err(ConsistencyError::Unlabeled(node.id.clone()));
    }
    let members = node.ticket_ids();
    if members.is_empty() {
        return Err(ConsistencyError::EmptyNode(node.id.clone()));
    }
    if node.metrics.volume != members.len() {
        return Err(ConsistencyError::VolumeMismatch {
            id: node.id.clone(),
            volume: node.metrics.volume,
            expected: members.len(),
        });
    }
    if let Members::Leaf { ticket_ids } = &node.members {
        for id in ticket_ids {
            if !assigned.insert(id.as_str()) {
                return Err(ConsistencyError::DuplicateTicket(id.clone()));
            }
        }
    }
    Ok(())
}

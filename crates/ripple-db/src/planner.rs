use std::collections::BTreeSet;

use ripple_query::{FieldOp, Selector};

use crate::error::DbError;
use crate::index::IndexRegistry;

/// Where the engine reads candidate documents from.
#[derive(Debug, Clone)]
pub enum Candidates {
    /// No index could narrow the selector; evaluate everything.
    FullScan,
    /// Positions contributed by the index registry.
    Positions(BTreeSet<usize>),
}

/// The planner's verdict: a candidate source plus the residual
/// selector that still has to be evaluated per candidate. An empty
/// residual means the candidate set is the exact result.
#[derive(Debug, Clone)]
pub struct Plan {
    pub candidates: Candidates,
    pub residual: Selector,
}

impl Plan {
    fn full_scan(residual: Selector) -> Plan {
        Plan {
            candidates: Candidates::FullScan,
            residual,
        }
    }
}

/// Combine the selector with index results.
///
/// Inside a batch the registry is stale and every query is a full
/// scan. A registry carrying both sync and async providers refuses to
/// plan (`IndexUnsupportedMix`).
pub fn plan(selector: &Selector, registry: &IndexRegistry) -> Result<Plan, DbError> {
    if selector.is_empty() {
        return Ok(Plan::full_scan(Selector::all()));
    }
    if registry.has_mixed_modes() {
        return Err(DbError::IndexUnsupportedMix);
    }
    if registry.is_outdated() {
        return Ok(Plan::full_scan(selector.clone()));
    }

    let (candidates, residual) = plan_node(selector, registry);
    Ok(Plan {
        candidates: match candidates {
            Some(positions) => Candidates::Positions(positions),
            None => Candidates::FullScan,
        },
        residual: residual.unwrap_or_else(Selector::all),
    })
}

/// Returns `(candidates, residual)`. `None` candidates means no index
/// contribution; `None` residual means the node was fully consumed.
fn plan_node(
    selector: &Selector,
    registry: &IndexRegistry,
) -> (Option<BTreeSet<usize>>, Option<Selector>) {
    match selector {
        Selector::Field(field, pred) => {
            // id fast path: at most one position.
            if field == "id"
                && let [FieldOp::Eq(value)] = pred.ops.as_slice()
            {
                let positions: BTreeSet<usize> =
                    registry.id_position(value).into_iter().collect();
                return (Some(positions), None);
            }

            match registry.field(field) {
                Some(index) => match index.query(pred, registry.len()) {
                    Some(m) => {
                        let residual = if m.consumed {
                            None
                        } else {
                            Some(selector.clone())
                        };
                        (Some(m.positions), residual)
                    }
                    None => (None, Some(selector.clone())),
                },
                None => (None, Some(selector.clone())),
            }
        }

        Selector::And(children) => {
            let mut candidates: Option<BTreeSet<usize>> = None;
            let mut residuals: Vec<Selector> = Vec::new();
            for child in children {
                let (child_cands, child_residual) = plan_node(child, registry);
                if let Some(set) = child_cands {
                    candidates = Some(match candidates {
                        // smallest set wins implicitly: intersection
                        // of contributing providers
                        Some(prev) => prev.intersection(&set).copied().collect(),
                        None => set,
                    });
                }
                if let Some(residual) = child_residual {
                    residuals.push(residual);
                }
            }
            let residual = match residuals.len() {
                0 => None,
                1 => residuals.pop(),
                _ => Some(Selector::And(residuals)),
            };
            (candidates, residual)
        }

        Selector::Or(children) => {
            // A disjunction is only optimizable when every branch is
            // fully consumed by an index.
            let mut union = BTreeSet::new();
            for child in children {
                match plan_node(child, registry) {
                    (Some(set), None) => union.extend(set),
                    _ => return (None, Some(selector.clone())),
                }
            }
            (Some(union), None)
        }

        // $nor, $expr and $text always evaluate residually.
        _ => (None, Some(selector.clone())),
    }
}

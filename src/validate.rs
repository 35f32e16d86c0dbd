//! Registry health checks.
//!
//! Walks every mapping in the central registry looking for cross-machine
//! collisions (error), mappings that have not synced in over 30 days
//! (warning), and mappings whose local directory vanished from this machine
//! (warning). A malformed registry file is itself an error-level finding.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::registry::Registry;

/// Mappings idle longer than this are flagged stale.
pub const STALE_AFTER_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    Collision,
    Stale,
    Missing,
    Malformed,
    /// Reserved for cross-checks such as central directories with no mapping.
    Orphan,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub central_path: String,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationStats {
    pub total: usize,
    pub active: usize,
    pub stale: usize,
    pub collisions: usize,
    pub missing: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub issues: Vec<Issue>,
    pub stats: ValidationStats,
}

impl ValidationReport {
    /// Valid iff no error-level issues exist.
    pub fn is_valid(&self) -> bool {
        self.issues.iter().all(|i| i.severity != Severity::Error)
    }
}

/// Validate the registry at `central_root` as seen from `machine_id`.
pub fn validate_registry(central_root: &Path, machine_id: &str) -> Result<ValidationReport> {
    validate_registry_at(central_root, machine_id, Utc::now())
}

/// Deterministic core with an injected clock.
pub fn validate_registry_at(
    central_root: &Path,
    machine_id: &str,
    now: DateTime<Utc>,
) -> Result<ValidationReport> {
    let registry = match Registry::load_strict(central_root) {
        Ok(registry) => registry,
        Err(Error::Validation(detail)) => {
            return Ok(ValidationReport {
                issues: vec![Issue {
                    kind: IssueKind::Malformed,
                    severity: Severity::Error,
                    central_path: String::new(),
                    detail,
                }],
                stats: ValidationStats::default(),
            });
        }
        Err(e) => return Err(e),
    };

    let mut issues = Vec::new();
    let mut stats = ValidationStats { total: registry.mappings.len(), ..Default::default() };

    // Collisions: one central path owned by several machines.
    let mut owners: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for mapping in &registry.mappings {
        owners.entry(&mapping.path).or_default().push(&mapping.machine_id);
    }
    for (central_path, machines) in &owners {
        let mut distinct: Vec<&str> = machines.clone();
        distinct.sort();
        distinct.dedup();
        if distinct.len() > 1 {
            stats.collisions += 1;
            issues.push(Issue {
                kind: IssueKind::Collision,
                severity: Severity::Error,
                central_path: central_path.to_string(),
                detail: format!("claimed by multiple machines: {}", distinct.join(", ")),
            });
        }
    }

    for mapping in &registry.mappings {
        let stale = match &mapping.last_sync {
            Some(iso) => match DateTime::parse_from_rfc3339(iso) {
                Ok(last) => now.signed_duration_since(last) > Duration::days(STALE_AFTER_DAYS),
                Err(_) => true,
            },
            None => true,
        };
        if stale {
            stats.stale += 1;
            issues.push(Issue {
                kind: IssueKind::Stale,
                severity: Severity::Warning,
                central_path: mapping.path.clone(),
                detail: match &mapping.last_sync {
                    Some(iso) => format!(
                        "last synced {iso}, more than {STALE_AFTER_DAYS} days ago ({})",
                        mapping.machine_id
                    ),
                    None => format!("never synced ({})", mapping.machine_id),
                },
            });
        } else {
            stats.active += 1;
        }

        if mapping.machine_id == machine_id && !mapping.local_root().is_dir() {
            stats.missing += 1;
            issues.push(Issue {
                kind: IssueKind::Missing,
                severity: Severity::Warning,
                central_path: mapping.path.clone(),
                detail: format!("local directory {} no longer exists", mapping.local_path),
            });
        }
    }

    Ok(ValidationReport { issues, stats })
}

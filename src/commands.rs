//! Operation entry points.
//!
//! Each command turns a [`MigrationConfig`] into a request, plans it against
//! the store and hands the plan to [`MigrationExecutor`]. The binary is a thin
//! argument parser on top of these.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::MigrationConfig;
use crate::db::DocumentStore;
use crate::error::MigrationError;
use crate::executor::{ExecutionReport, MigrationExecutor};
use crate::planner::{resolve_group_key, ConsolidationPlanner, ConsolidationRequest, PlanStamp};
use crate::repair::{plan_repair, RepairRequest};
use crate::reversal::{ReversalPlanner, ReversalRequest};
use crate::swap::{plan_identity_swap, SwapIdsRequest};
use crate::verify::{build_report, GroupReport};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Executed(ExecutionReport),
    Unchanged { group_key: String, reason: String },
}

impl CommandOutcome {
    pub fn summary(&self) -> String {
        match self {
            CommandOutcome::Executed(report) => report.summary(),
            CommandOutcome::Unchanged { group_key, reason } => {
                format!("Nothing to do for {}: {}", group_key, reason)
            }
        }
    }
}

pub fn consolidate<S: DocumentStore>(
    store: &S,
    config: &MigrationConfig,
    stamp: &PlanStamp,
) -> Result<CommandOutcome, MigrationError> {
    let request = ConsolidationRequest::from_config(config)?;
    let plan = ConsolidationPlanner::new(store).plan(&request, stamp)?;
    let report = MigrationExecutor::new(store).execute(&plan)?;
    Ok(CommandOutcome::Executed(report))
}

pub fn revert<S: DocumentStore>(
    store: &S,
    config: &MigrationConfig,
    now: DateTime<Utc>,
) -> Result<CommandOutcome, MigrationError> {
    let request = ReversalRequest {
        group_key: config.group_key.clone(),
        admin: config.admin_email.clone(),
        dry_run: config.dry_run,
    };
    let plan = ReversalPlanner::new(store).plan(&request, now)?;
    let report = MigrationExecutor::new(store).execute(&plan)?;
    Ok(CommandOutcome::Executed(report))
}

pub fn swap_ids<S: DocumentStore>(
    store: &S,
    config: &MigrationConfig,
    stamp: &PlanStamp,
) -> Result<CommandOutcome, MigrationError> {
    let request = SwapIdsRequest {
        group_key: config.group_key.clone(),
        admin: config.require_admin_email()?.to_string(),
        dry_run: config.dry_run,
    };
    match plan_identity_swap(store, &request, stamp)? {
        Some(plan) => Ok(CommandOutcome::Executed(
            MigrationExecutor::new(store).execute(&plan)?,
        )),
        None => Ok(CommandOutcome::Unchanged {
            group_key: resolve_group_key(
                request.group_key.as_deref(),
                Some(request.admin.as_str()),
                &[],
            )?,
            reason: "identifiers already swapped".to_string(),
        }),
    }
}

pub fn repair_members<S: DocumentStore>(
    store: &S,
    config: &MigrationConfig,
    now: DateTime<Utc>,
) -> Result<CommandOutcome, MigrationError> {
    let request = RepairRequest {
        group_key: config.group_key.clone(),
        admin: config.admin_email.clone(),
        dry_run: config.dry_run,
    };
    let plan = plan_repair(store, &request, now)?;
    if plan.member_writes.is_empty() {
        return Ok(CommandOutcome::Unchanged {
            group_key: plan.group_key,
            reason: "every member already points at the consolidated account".to_string(),
        });
    }
    let report = MigrationExecutor::new(store).execute(&plan)?;
    Ok(CommandOutcome::Executed(report))
}

pub fn verify<S: DocumentStore>(
    store: &S,
    config: &MigrationConfig,
) -> Result<GroupReport, MigrationError> {
    let group_key = resolve_group_key(
        config.group_key.as_deref(),
        config.admin_email.as_deref(),
        &config.user_emails,
    )?;
    build_report(store, &group_key, &config.user_emails)
}

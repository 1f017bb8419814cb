//! enterprise-migrate: consolidate individual accounts into one group account.
//!
//! Dry-run by default. Pass `--apply` (or `MIGRATE_DRY_RUN=false`) to write.
//! A file backup of the store is taken before every live run.

use std::path::PathBuf;

use chrono::Utc;

use enterprise_migrate_lib::commands::{self, CommandOutcome};
use enterprise_migrate_lib::config::{split_list, MigrationConfig};
use enterprise_migrate_lib::db::SqliteStore;
use enterprise_migrate_lib::db_backup::backup_before_run;
use enterprise_migrate_lib::error::MigrationError;
use enterprise_migrate_lib::planner::PlanStamp;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let exit_code = match run(std::env::args().skip(1).collect()) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("{error}");
            2
        }
    };
    std::process::exit(exit_code);
}

// =============================================================================
// Argument parsing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Mutate(Mutation),
    Verify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mutation {
    Consolidate,
    Revert,
    SwapIds,
    RepairMembers,
}

/// Flag values layered over the loaded configuration.
#[derive(Debug, Default, PartialEq)]
struct CliOptions {
    config_file: Option<PathBuf>,
    db_path: Option<PathBuf>,
    admin_email: Option<String>,
    domain: Option<String>,
    emails: Option<Vec<String>>,
    legacy_emails: Option<Vec<String>>,
    role: Option<String>,
    tier: Option<String>,
    dry_run: Option<bool>,
    use_admin_id: Option<bool>,
}

impl CliOptions {
    fn parse(args: &[String]) -> Result<Self, String> {
        let mut options = Self::default();
        let mut index = 0usize;
        while index < args.len() {
            let flag = args[index].as_str();
            let mut value = || {
                index += 1;
                args.get(index)
                    .cloned()
                    .ok_or_else(|| format!("{flag} requires a value"))
            };
            match flag {
                "--config" => options.config_file = Some(PathBuf::from(value()?)),
                "--db" => options.db_path = Some(PathBuf::from(value()?)),
                "--admin" => options.admin_email = Some(value()?),
                "--domain" => options.domain = Some(value()?.trim().to_lowercase()),
                "--emails" => options.emails = Some(split_list(&value()?)),
                "--legacy-emails" => options.legacy_emails = Some(split_list(&value()?)),
                "--role" => options.role = Some(value()?),
                "--tier" => options.tier = Some(value()?),
                "--apply" => options.dry_run = Some(false),
                "--dry-run" => options.dry_run = Some(true),
                "--admin-id" => options.use_admin_id = Some(true),
                "--no-admin-id" => options.use_admin_id = Some(false),
                other => return Err(format!("unknown flag '{other}'\n\n{}", usage())),
            }
            index += 1;
        }
        Ok(options)
    }

    fn apply(self, mut config: MigrationConfig) -> Result<MigrationConfig, String> {
        if let Some(path) = self.db_path {
            config.db_path = Some(path);
        }
        if let Some(email) = self.admin_email {
            config.admin_email = Some(email);
        }
        if let Some(domain) = self.domain {
            config.group_key = Some(domain);
        }
        if let Some(emails) = self.emails {
            config.user_emails = emails;
        }
        if let Some(emails) = self.legacy_emails {
            config.legacy_member_emails = emails;
        }
        if let Some(role) = self.role {
            config.default_role = role.parse()?;
        }
        if let Some(tier) = self.tier {
            config.plan.subscription_tier = tier;
        }
        if let Some(dry_run) = self.dry_run {
            config.dry_run = dry_run;
        }
        if let Some(use_admin_id) = self.use_admin_id {
            config.use_admin_id_for_consolidator = use_admin_id;
        }
        Ok(config)
    }
}

fn usage() -> String {
    [
        "enterprise-migrate usage:",
        "  enterprise-migrate consolidate    [options]",
        "  enterprise-migrate revert         [options]",
        "  enterprise-migrate swap-ids       [options]",
        "  enterprise-migrate repair-members [options]",
        "  enterprise-migrate verify         [options]",
        "",
        "options (override MIGRATE_* variables and --config):",
        "  --config <path>          JSON configuration file",
        "  --db <path>              store path (default ~/.enterprise-migrate/accounts.db)",
        "  --admin <email>          administrator account",
        "  --domain <group>         group key (default: administrator's domain)",
        "  --emails <a,b,...>       explicit member list (default: whole domain)",
        "  --legacy-emails <a,...>  members whose ids stay resolvable",
        "  --role <editor|viewer>   role for non-administrator members",
        "  --tier <name>            subscription tier",
        "  --apply | --dry-run      write changes, or only print the plan (default)",
        "  --admin-id | --no-admin-id",
        "                           give the group account the administrator's id",
        "",
        "exit codes:",
        "  0   success",
        "  1   operation failed (nothing was written)",
        "  2   usage error",
    ]
    .join("\n")
}

// =============================================================================
// Dispatch
// =============================================================================

fn run(args: Vec<String>) -> Result<i32, String> {
    let Some(name) = args.first() else {
        return Err(usage());
    };
    let command = match name.as_str() {
        "consolidate" => Command::Mutate(Mutation::Consolidate),
        "revert" => Command::Mutate(Mutation::Revert),
        "swap-ids" => Command::Mutate(Mutation::SwapIds),
        "repair-members" => Command::Mutate(Mutation::RepairMembers),
        "verify" => Command::Verify,
        "help" | "--help" | "-h" => {
            println!("{}", usage());
            return Ok(0);
        }
        other => return Err(format!("unknown subcommand '{other}'\n\n{}", usage())),
    };

    let options = CliOptions::parse(&args[1..])?;
    let config_file = options.config_file.clone();
    let config = match MigrationConfig::load(config_file.as_deref()) {
        Ok(config) => options.apply(config)?,
        Err(e) => return Ok(report_failure(&e)),
    };

    match execute(command, &config) {
        Ok(line) => {
            println!("{line}");
            Ok(0)
        }
        Err(e) => Ok(report_failure(&e)),
    }
}

fn execute(command: Command, config: &MigrationConfig) -> Result<String, MigrationError> {
    let path = config.db_path()?;
    let mutation = match command {
        Command::Mutate(mutation) => mutation,
        Command::Verify => {
            let store = SqliteStore::open_readonly_at(&path)?;
            let report = commands::verify(&store, config)?;
            println!("{}", report.to_pretty_json());
            return Ok(format!(
                "Verified {}: {} member(s), {} stale pointer(s)",
                report.group_key,
                report.members.len(),
                report.stale_members()
            ));
        }
    };

    let store = SqliteStore::open_at(path)?;
    if !config.dry_run {
        backup_store(&store)?;
    }

    let outcome: CommandOutcome = match mutation {
        Mutation::Consolidate => commands::consolidate(&store, config, &PlanStamp::fresh())?,
        Mutation::Revert => commands::revert(&store, config, Utc::now())?,
        Mutation::SwapIds => commands::swap_ids(&store, config, &PlanStamp::fresh())?,
        Mutation::RepairMembers => commands::repair_members(&store, config, Utc::now())?,
    };
    Ok(outcome.summary())
}

fn backup_store(store: &SqliteStore) -> Result<(), MigrationError> {
    backup_before_run(store).map_err(MigrationError::Backup)?;
    Ok(())
}

fn report_failure(error: &MigrationError) -> i32 {
    log::error!("{}", error);
    log::error!("{}", error.recovery_suggestion());
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use enterprise_migrate_lib::types::Role;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_flags() {
        let options = CliOptions::parse(&args(&[
            "--admin",
            "ana@acme.com",
            "--domain",
            "ACME.com",
            "--emails",
            "a@acme.com, b@acme.com",
            "--apply",
            "--no-admin-id",
            "--role",
            "edicion",
        ]))
        .expect("parse");

        let config = options.apply(MigrationConfig::default()).expect("apply");
        assert_eq!(config.admin_email.as_deref(), Some("ana@acme.com"));
        assert_eq!(config.group_key.as_deref(), Some("acme.com"));
        assert_eq!(config.user_emails, vec!["a@acme.com", "b@acme.com"]);
        assert!(!config.dry_run);
        assert!(!config.use_admin_id_for_consolidator);
        assert_eq!(config.default_role, Role::Editor);
    }

    #[test]
    fn test_missing_value_and_unknown_flag_are_usage_errors() {
        assert!(CliOptions::parse(&args(&["--admin"])).is_err());
        assert!(CliOptions::parse(&args(&["--force"])).is_err());
        assert!(run(args(&["frobnicate"])).is_err());
        assert!(run(vec![]).is_err());
    }

    #[test]
    fn test_help_exits_zero() {
        assert_eq!(run(args(&["help"])).expect("help"), 0);
    }

    #[test]
    fn test_unwritable_backup_is_reported_as_backup_failure() {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("accounts.db");
        let store = SqliteStore::open_at(db_path.clone()).expect("store");
        std::fs::create_dir(format!("{}.pre-consolidation.bak", db_path.display()))
            .expect("block backup path");

        let err = backup_store(&store).expect_err("backup must fail");
        assert!(matches!(err, MigrationError::Backup(_)), "{err:?}");
        assert_eq!(report_failure(&err), 1);
    }

    #[test]
    fn test_flags_keep_config_values_they_do_not_mention() {
        let base = MigrationConfig {
            admin_email: Some("root@acme.com".to_string()),
            ..MigrationConfig::default()
        };
        let config = CliOptions::default().apply(base.clone()).expect("apply");
        assert_eq!(config, base);
    }
}

//! Known migrations, ordered by their `YYYY-MM-DD-<name>` identifier.

mod format_backfill;

use std::collections::BTreeSet;

use serde::Serialize;
use time::format_description::FormatItem;
use time::Date;
use tracing::info;

pub use format_backfill::AddFormatToStandings;

use crate::history::{MigrationHistory, MigrationRecord};
use crate::migration::{
    Migration, MigrationAbort, MigrationDescriptor, MigrationOutcome, MigrationRunner,
};
use crate::store::{DocumentStore, StoreError};
use crate::CoreError;

pub struct MigrationRegistry {
    migrations: Vec<Box<dyn Migration>>,
}

impl std::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.migrations.iter().map(|migration| migration.descriptor().id))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub applied: Option<MigrationRecord>,
}

/// Result of running every pending migration.
#[derive(Debug)]
pub struct PendingRun {
    pub outcomes: Vec<MigrationOutcome>,
    /// Set when a migration failed; later migrations were not attempted.
    pub abort: Option<MigrationAbort>,
}

impl MigrationRegistry {
    /// # Errors
    /// Returns [`CoreError::Validation`] when an identifier is not
    /// `YYYY-MM-DD-<name>` or two migrations share an id or a name.
    pub fn new(mut migrations: Vec<Box<dyn Migration>>) -> Result<Self, CoreError> {
        let mut ids = BTreeSet::new();
        let mut names = BTreeSet::new();
        for migration in &migrations {
            let descriptor = migration.descriptor();
            check_identifier(descriptor)?;
            if !ids.insert(descriptor.id) {
                return Err(CoreError::Validation(format!(
                    "migration id {} is registered twice",
                    descriptor.id
                )));
            }
            if !names.insert(descriptor.name) {
                return Err(CoreError::Validation(format!(
                    "migration name {} is registered twice",
                    descriptor.name
                )));
            }
        }
        migrations.sort_by_key(|migration| migration.descriptor().id);
        Ok(Self { migrations })
    }

    /// # Errors
    /// Returns [`CoreError::Validation`] if a built-in descriptor is malformed.
    pub fn standard() -> Result<Self, CoreError> {
        Self::new(vec![Box::new(AddFormatToStandings)])
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Migration> {
        self.migrations.iter().map(|migration| &**migration)
    }

    /// Looks a migration up by name or by full identifier.
    #[must_use]
    pub fn get(&self, name_or_id: &str) -> Option<&dyn Migration> {
        self.iter().find(|migration| {
            let descriptor = migration.descriptor();
            descriptor.name == name_or_id || descriptor.id == name_or_id
        })
    }

    /// # Errors
    /// Returns a [`StoreError`] when the history cannot be read.
    pub fn status(&self, store: &dyn DocumentStore) -> Result<Vec<MigrationStatus>, StoreError> {
        let history = MigrationHistory::new(store);
        self.iter()
            .map(|migration| {
                let descriptor = migration.descriptor();
                Ok(MigrationStatus {
                    id: descriptor.id.to_string(),
                    name: descriptor.name.to_string(),
                    version: descriptor.version.to_string(),
                    description: descriptor.description.to_string(),
                    applied: history.find(descriptor.name)?,
                })
            })
            .collect()
    }

    /// Runs every registered migration in identifier order. Applied ones
    /// report `AlreadyApplied`; the first abort stops the sequence.
    #[must_use]
    pub fn run_pending(&self, runner: &MigrationRunner<'_>) -> PendingRun {
        let mut outcomes = Vec::new();
        for migration in self.iter() {
            match runner.run(migration) {
                Ok(outcome) => outcomes.push(outcome),
                Err(abort) => {
                    info!(
                        migration = migration.descriptor().name,
                        remaining = self.migrations.len() - outcomes.len() - 1,
                        "stopping pending run after abort"
                    );
                    return PendingRun { outcomes, abort: Some(abort) };
                }
            }
        }
        PendingRun { outcomes, abort: None }
    }
}

const DATE_FORMAT: &[FormatItem<'static>] =
    time::macros::format_description!("[year]-[month]-[day]");

fn check_identifier(descriptor: &MigrationDescriptor) -> Result<(), CoreError> {
    let invalid = |reason: &str| {
        CoreError::Validation(format!(
            "migration id {:?} {reason}; expected YYYY-MM-DD-{}",
            descriptor.id, descriptor.name
        ))
    };

    let (Some(date), Some(rest)) = (descriptor.id.get(..10), descriptor.id.get(10..)) else {
        return Err(invalid("is too short"));
    };
    Date::parse(date, DATE_FORMAT).map_err(|_| invalid("does not start with a calendar date"))?;
    if rest.strip_prefix('-') != Some(descriptor.name) {
        return Err(invalid("does not end with the migration name"));
    }
    if descriptor.name.is_empty()
        || !descriptor
            .name
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
    {
        return Err(invalid("has a name that is not lowercase kebab-case"));
    }
    Ok(())
}

//! Bringing the stored hierarchy in line with the fleet configuration.
//!
//! Adoption only ever creates records and moves them between active and
//! drained sets. Teardown of drained records is left to the scheduler, so
//! adopting the same configuration twice changes nothing.

use std::collections::BTreeSet;

use gcefleet_keys::{ManagerKey, RevisionKey, TemplateKey};
use tracing::{debug, info, instrument};

use super::config::{FleetConfig, TemplateConfig};
use crate::error::{ControllerError, ControllerResult};
use crate::store::{ManagerRecord, Record, RevisionRecord, Store, TemplateRecord};

/// What one adoption changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AdoptStats {
    pub templates_created: usize,
    pub revisions_activated: usize,
    pub revisions_drained: usize,
    pub managers_created: usize,
    pub managers_updated: usize,
    pub managers_drained: usize,
}

impl AdoptStats {
    /// Returns true if adoption wrote anything.
    pub fn changed(&self) -> bool {
        *self != Self::default()
    }
}

/// Ensure the stored hierarchy reflects `config`.
#[instrument(skip_all)]
pub fn adopt(store: &Store, config: &FleetConfig) -> ControllerResult<AdoptStats> {
    let mut stats = AdoptStats::default();
    let mut configured = BTreeSet::new();

    for template in &config.templates {
        let revision_key = ensure_active_revision(store, template, &mut stats)?;
        configured.insert(revision_key.template().clone());

        let mut zones = BTreeSet::new();
        for manager in config.managers_for(&template.base_name) {
            let key = ManagerKey::new(revision_key.clone(), manager.zone.as_str())?;
            ensure_manager(store, &key, manager.minimum_size, manager.maximum_size, &mut stats)?;
            zones.insert(key);
        }
        drain_unconfigured_managers(store, &revision_key, &zones, &mut stats)?;
    }

    for template in store.list::<TemplateRecord>()? {
        if !configured.contains(&template.key) && template.active.is_some() {
            drain_template(store, &template.key, &mut stats)?;
        }
    }

    if stats.changed() {
        info!(?stats, "Adopted fleet configuration into hierarchy");
    } else {
        debug!("Hierarchy already matches fleet configuration");
    }
    Ok(stats)
}

/// Ensure the template and its current revision exist and the revision is
/// active, draining whichever revision was active before.
fn ensure_active_revision(
    store: &Store,
    config: &TemplateConfig,
    stats: &mut AdoptStats,
) -> ControllerResult<RevisionKey> {
    let template_key = TemplateKey::for_template(&config.base_name, &config.project);
    let revision_key = RevisionKey::new(template_key.clone(), config.revision().as_str())?;

    store.transaction(|tx| -> ControllerResult<()> {
        let (mut template, created) = match tx.get::<TemplateRecord>(&template_key)? {
            Some(template) => (template, false),
            None => (
                TemplateRecord::new(config.base_name.as_str(), config.project.as_str()),
                true,
            ),
        };
        if tx.get::<RevisionRecord>(&revision_key)?.is_none() {
            tx.put(&RevisionRecord::new(
                revision_key.clone(),
                config.base_name.as_str(),
                config.project.as_str(),
                config.properties.clone(),
            ))?;
        }

        if template.active.as_ref() != Some(&revision_key) {
            if let Some(previous) = template.active.take() {
                info!(template = %template_key, revision = %previous, "Draining revision");
                template.drained.insert(previous);
                stats.revisions_drained += 1;
            }
            // A configuration can return to a revision that was drained and
            // not yet torn down.
            template.drained.remove(&revision_key);
            template.active = Some(revision_key.clone());
            stats.revisions_activated += 1;
            info!(template = %template_key, revision = %revision_key, "Activated revision");
        } else if !created {
            return Ok(());
        }

        if created {
            info!(template = %template_key, "Created instance template record");
            stats.templates_created += 1;
        }
        tx.put(&template)?;
        Ok(())
    })?;

    Ok(revision_key)
}

/// Ensure a manager record exists, is listed active in its revision, and
/// carries the configured sizes.
fn ensure_manager(
    store: &Store,
    key: &ManagerKey,
    minimum_size: i64,
    maximum_size: i64,
    stats: &mut AdoptStats,
) -> ControllerResult<()> {
    store.transaction(|tx| {
        let mut revision = tx
            .get::<RevisionRecord>(key.revision())?
            .ok_or_else(|| ControllerError::not_found(RevisionRecord::KIND, key.revision()))?;

        match tx.get::<ManagerRecord>(key)? {
            None => {
                tx.put(&ManagerRecord::new(key.clone(), minimum_size, maximum_size))?;
                stats.managers_created += 1;
                info!(manager = %key, minimum_size, maximum_size, "Created instance group manager record");
            }
            Some(mut manager)
                if manager.minimum_size != minimum_size || manager.maximum_size != maximum_size =>
            {
                manager.minimum_size = minimum_size;
                manager.maximum_size = maximum_size;
                tx.put(&manager)?;
                stats.managers_updated += 1;
            }
            Some(_) => {}
        }

        let reactivated = revision.drained.remove(key);
        if revision.active.insert(key.clone()) || reactivated {
            tx.put(&revision)?;
        }
        Ok(())
    })
}

/// Move managers no longer configured from the revision's active set to its
/// drained set.
fn drain_unconfigured_managers(
    store: &Store,
    revision_key: &RevisionKey,
    configured: &BTreeSet<ManagerKey>,
    stats: &mut AdoptStats,
) -> ControllerResult<()> {
    store.transaction(|tx| {
        let Some(mut revision) = tx.get::<RevisionRecord>(revision_key)? else {
            return Ok(());
        };
        let removed: Vec<ManagerKey> = revision
            .active
            .iter()
            .filter(|key| !configured.contains(*key))
            .cloned()
            .collect();
        if removed.is_empty() {
            return Ok(());
        }

        for key in removed {
            info!(manager = %key, "Draining instance group manager");
            revision.active.remove(&key);
            revision.drained.insert(key);
            stats.managers_drained += 1;
        }
        tx.put(&revision)?;
        Ok(())
    })
}

/// Drain the active revision of a template that is no longer configured.
fn drain_template(
    store: &Store,
    key: &TemplateKey,
    stats: &mut AdoptStats,
) -> ControllerResult<()> {
    store.transaction(|tx| {
        let Some(mut template) = tx.get::<TemplateRecord>(key)? else {
            return Ok(());
        };
        let Some(revision) = template.active.take() else {
            return Ok(());
        };

        info!(template = %key, revision = %revision, "Draining revision of unconfigured template");
        template.drained.insert(revision);
        stats.revisions_drained += 1;
        tx.put(&template)?;
        Ok(())
    })
}

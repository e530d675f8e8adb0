//! Instance group manager transitions.

use chrono::Utc;
use gcefleet_compute::types::NewInstanceGroupManager;
use gcefleet_keys::{InstanceKey, ManagerKey};
use tracing::{debug, info, instrument, warn};

use super::{settle, Lifecycle};
use crate::error::{ControllerError, ControllerResult, Transition};
use crate::store::{
    manager_drain, InstanceRecord, ManagerRecord, Record, RevisionRecord, TemplateRecord,
};

impl Lifecycle {
    /// Create the provider manager for an active manager record and record
    /// its URL. Managers are always created empty; the resize controller
    /// grows them afterwards.
    #[instrument(skip_all, fields(manager = %key))]
    pub async fn create_manager(&self, key: &ManagerKey) -> ControllerResult<Transition> {
        settle(self.try_create_manager(key).await)
    }

    async fn try_create_manager(&self, key: &ManagerKey) -> ControllerResult<Transition> {
        let manager = self
            .store
            .get::<ManagerRecord>(key)?
            .ok_or_else(|| ControllerError::not_found(ManagerRecord::KIND, key))?;
        if manager.url.is_some() {
            debug!("Instance group manager already created");
            return Ok(Transition::Unchanged);
        }
        let revision = self
            .store
            .get::<RevisionRecord>(key.revision())?
            .ok_or_else(|| ControllerError::not_found(RevisionRecord::KIND, key.revision()))?;
        if revision.project.is_empty() {
            warn!("Project unspecified");
            return Ok(Transition::Unchanged);
        }
        let Some(template_url) = revision.url.clone() else {
            warn!("Instance template URL unspecified");
            return Ok(Transition::Unchanged);
        };

        let request = NewInstanceGroupManager {
            name: revision.resource_name(),
            zone: key.zone().to_string(),
            instance_template: template_url,
            target_size: 0,
            base_instance_name: revision.base_instance_name(),
        };
        let url = match self
            .provider
            .create_instance_group_manager(&revision.project, &request)
            .await
        {
            Ok(op) => op.target_link,
            Err(e) if e.is_conflict() => {
                info!(name = %request.name, "Instance group manager already exists");
                self.provider
                    .get_instance_group_manager(&revision.project, &request.name, key.zone())
                    .await?
                    .self_link
            }
            Err(e) => return Err(e.into()),
        };

        self.set_manager_url(key, Some(url))
    }

    /// Delete the provider manager of a drained, empty manager record and
    /// clear its URL.
    #[instrument(skip_all, fields(manager = %key))]
    pub async fn delete_manager_resource(&self, key: &ManagerKey) -> ControllerResult<Transition> {
        settle(self.try_delete_manager_resource(key).await)
    }

    async fn try_delete_manager_resource(&self, key: &ManagerKey) -> ControllerResult<Transition> {
        let manager = self
            .store
            .get::<ManagerRecord>(key)?
            .ok_or_else(|| ControllerError::not_found(ManagerRecord::KIND, key))?;
        let Some(url) = manager.url.clone() else {
            return Ok(Transition::Unchanged);
        };
        if !manager.instances.is_empty() {
            return Err(ControllerError::invariant(
                ManagerRecord::KIND,
                key,
                "instances still reference this manager",
            ));
        }
        let revision = self
            .store
            .get::<RevisionRecord>(key.revision())?
            .ok_or_else(|| ControllerError::not_found(RevisionRecord::KIND, key.revision()))?;
        let template = self
            .store
            .get::<TemplateRecord>(key.template())?
            .ok_or_else(|| ControllerError::not_found(TemplateRecord::KIND, key.template()))?;
        if !manager_drain(&template, &revision, key).is_drained() {
            return Err(ControllerError::invariant(
                ManagerRecord::KIND,
                key,
                "manager is not drained",
            ));
        }

        match self.provider.delete(&url).await {
            Ok(op) if op.target_link != url => {
                warn!(url = %url, deleted = %op.target_link, "Deleted resource differs from recorded URL");
            }
            Ok(_) => info!(url = %url, "Deleted instance group manager"),
            Err(e) if e.is_not_found() => {
                debug!(url = %url, "Instance group manager already deleted")
            }
            Err(e) => return Err(e.into()),
        }

        self.set_manager_url(key, None)
    }

    /// Delete the uncataloged instances of a drained manager through the
    /// manager itself, lowering its target size so they are not recreated.
    /// The records are marked deleted by drained-instance cleanup once the
    /// provider stops returning them.
    #[instrument(skip_all, fields(manager = %key))]
    pub async fn shrink_drained_manager(&self, key: &ManagerKey) -> ControllerResult<Transition> {
        settle(self.try_shrink_drained_manager(key).await)
    }

    async fn try_shrink_drained_manager(&self, key: &ManagerKey) -> ControllerResult<Transition> {
        let manager = self
            .store
            .get::<ManagerRecord>(key)?
            .ok_or_else(|| ControllerError::not_found(ManagerRecord::KIND, key))?;
        if manager.url.is_none() {
            debug!("Instance group manager has no provider resource");
            return Ok(Transition::Unchanged);
        }
        let revision = self
            .store
            .get::<RevisionRecord>(key.revision())?
            .ok_or_else(|| ControllerError::not_found(RevisionRecord::KIND, key.revision()))?;
        let template = self
            .store
            .get::<TemplateRecord>(key.template())?
            .ok_or_else(|| ControllerError::not_found(TemplateRecord::KIND, key.template()))?;
        if !manager_drain(&template, &revision, key).is_drained() {
            warn!("Instance group manager is not drained");
            return Ok(Transition::Unchanged);
        }

        let mut urls = Vec::new();
        for instance_key in &manager.instances {
            let Some(instance) = self.store.get::<InstanceRecord>(instance_key)? else {
                continue;
            };
            if instance.deleted || instance.cataloged {
                continue;
            }
            if let Some(url) = instance.url {
                urls.push(url);
            }
        }
        if urls.is_empty() {
            debug!("No uncataloged instances to delete");
            return Ok(Transition::Unchanged);
        }

        match self
            .provider
            .delete_managed_instances(&revision.project, &revision.resource_name(), key.zone(), &urls)
            .await
        {
            Ok(_) => {
                info!(count = urls.len(), "Deleting instances of drained instance group manager");
                Ok(Transition::Applied)
            }
            Err(e) if e.is_not_found() => {
                debug!("Instance group manager already deleted");
                Ok(Transition::Unchanged)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set_manager_url(&self, key: &ManagerKey, url: Option<String>) -> ControllerResult<Transition> {
        self.store.transaction(|tx| {
            let mut manager = tx
                .get::<ManagerRecord>(key)?
                .ok_or_else(|| ControllerError::not_found(ManagerRecord::KIND, key))?;
            if manager.url == url {
                return Ok(Transition::Unchanged);
            }
            if let (Some(old), Some(new)) = (&manager.url, &url) {
                warn!(old = %old, new = %new, "Instance group manager URL changed");
            }
            manager.url = url;
            tx.put(&manager)?;
            Ok(Transition::Applied)
        })
    }

    /// Delete a drained manager record with no provider resource and no
    /// instances, removing it from whichever set of its revision holds it.
    #[instrument(skip_all, fields(manager = %key))]
    pub async fn delete_manager(&self, key: &ManagerKey) -> ControllerResult<Transition> {
        settle(self.store.transaction(|tx| {
            let manager = tx
                .get::<ManagerRecord>(key)?
                .ok_or_else(|| ControllerError::not_found(ManagerRecord::KIND, key))?;
            if manager.url.is_some() || !manager.instances.is_empty() {
                debug!("Instance group manager still has dependents");
                return Ok(Transition::Unchanged);
            }
            let mut revision = tx
                .get::<RevisionRecord>(key.revision())?
                .ok_or_else(|| ControllerError::not_found(RevisionRecord::KIND, key.revision()))?;
            let template = tx
                .get::<TemplateRecord>(key.template())?
                .ok_or_else(|| ControllerError::not_found(TemplateRecord::KIND, key.template()))?;

            let removed = if revision.drained.remove(key) {
                true
            } else if template.is_drained(&revision.key) {
                revision.active.remove(key)
            } else {
                false
            };
            if !removed {
                debug!("Instance group manager is not drained");
                return Ok(Transition::Unchanged);
            }

            tx.put(&revision)?;
            tx.delete::<ManagerRecord>(key)?;
            info!("Deleted instance group manager");
            Ok(Transition::Applied)
        }))
    }

    /// Reconcile a manager's membership with the instances the provider
    /// lists for it.
    ///
    /// New instances get a record and join the manager. Instances already
    /// marked deleted are never re-added, so a listing that raced with a
    /// deletion cannot resurrect them.
    #[instrument(skip_all, fields(manager = %key))]
    pub async fn sync_manager_instances(&self, key: &ManagerKey) -> ControllerResult<Transition> {
        settle(self.try_sync_manager_instances(key).await)
    }

    async fn try_sync_manager_instances(&self, key: &ManagerKey) -> ControllerResult<Transition> {
        let manager = self
            .store
            .get::<ManagerRecord>(key)?
            .ok_or_else(|| ControllerError::not_found(ManagerRecord::KIND, key))?;
        if manager.url.is_none() {
            debug!("Instance group manager not created yet");
            return Ok(Transition::Unchanged);
        }
        let revision = self
            .store
            .get::<RevisionRecord>(key.revision())?
            .ok_or_else(|| ControllerError::not_found(RevisionRecord::KIND, key.revision()))?;

        let listed = self
            .provider
            .list_managed_instances(&revision.project, &revision.resource_name(), key.zone())
            .await?;
        let now = Utc::now();

        self.store.transaction(|tx| {
            let mut manager = tx
                .get::<ManagerRecord>(key)?
                .ok_or_else(|| ControllerError::not_found(ManagerRecord::KIND, key))?;
            let mut changed = false;

            for managed in &listed {
                let Some(name) = managed.name() else {
                    warn!(instance = %managed.instance, "Managed instance without a name");
                    continue;
                };
                let instance_key = InstanceKey::for_instance(name);

                match tx.get::<InstanceRecord>(&instance_key)? {
                    None => {
                        let record = InstanceRecord::new(
                            name,
                            key.clone(),
                            Some(managed.instance.clone()),
                            now,
                        );
                        tx.put(&record)?;
                        debug!(instance = %name, "Discovered instance");
                    }
                    Some(record) if record.deleted => continue,
                    Some(record) if record.manager != *key => {
                        warn!(instance = %name, owner = %record.manager, "Instance belongs to another manager");
                        continue;
                    }
                    Some(mut record) if record.url.as_deref() != Some(managed.instance.as_str()) => {
                        record.url = Some(managed.instance.clone());
                        record.last_updated = now;
                        tx.put(&record)?;
                    }
                    Some(_) => {}
                }

                changed |= manager.instances.insert(instance_key);
            }

            let observed = listed.len() as i64;
            if manager.current_size != observed {
                manager.current_size = observed;
                changed = true;
            }
            if !changed {
                return Ok(Transition::Unchanged);
            }

            tx.put(&manager)?;
            Ok(Transition::Applied)
        })
    }
}

//! Instance transitions: deletion confirmation and record cleanup.

use chrono::{DateTime, Utc};
use gcefleet_keys::InstanceKey;
use tracing::{debug, info, instrument, warn};

use super::{settle, Lifecycle};
use crate::error::{ControllerError, ControllerResult, Transition};
use crate::store::{
    manager_drain, InstanceRecord, ManagerRecord, Record, RevisionRecord, TemplateRecord, Tx,
};

/// Why an instance is being marked deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionPath {
    /// Deletion was explicitly requested for the instance.
    PendingDeletion,

    /// The instance's manager is drained and the instance is not cataloged.
    Drained,
}

impl Lifecycle {
    /// Confirm that an instance pending deletion is gone at the provider and
    /// mark it deleted.
    #[instrument(skip_all, fields(instance = %key))]
    pub async fn check_deleted_instance(&self, key: &InstanceKey) -> ControllerResult<Transition> {
        settle(self.try_check_deleted_instance(key).await)
    }

    async fn try_check_deleted_instance(&self, key: &InstanceKey) -> ControllerResult<Transition> {
        let instance = self
            .store
            .get::<InstanceRecord>(key)?
            .ok_or_else(|| ControllerError::not_found(InstanceRecord::KIND, key))?;
        if instance.deleted {
            return Ok(Transition::Unchanged);
        }
        if !instance.pending_deletion {
            warn!("Instance is not pending deletion");
            return Ok(Transition::Unchanged);
        }
        let Some(url) = instance.url.as_deref() else {
            warn!("Instance URL unspecified");
            return Ok(Transition::Unchanged);
        };
        if self.prober.exists(url).await? {
            debug!(url = %url, "Instance still exists");
            return Ok(Transition::Unchanged);
        }

        self.set_instance_deleted(key, DeletionPath::PendingDeletion, Utc::now())
    }

    /// Mark an uncataloged instance of a drained manager deleted once the
    /// provider no longer has it. Nothing is deleted here; the instance goes
    /// away when its manager is shrunk.
    #[instrument(skip_all, fields(instance = %key))]
    pub async fn cleanup_drained_instance(&self, key: &InstanceKey) -> ControllerResult<Transition> {
        settle(self.try_cleanup_drained_instance(key).await)
    }

    async fn try_cleanup_drained_instance(&self, key: &InstanceKey) -> ControllerResult<Transition> {
        let instance = self
            .store
            .get::<InstanceRecord>(key)?
            .ok_or_else(|| ControllerError::not_found(InstanceRecord::KIND, key))?;
        if instance.deleted {
            return Ok(Transition::Unchanged);
        }
        if instance.cataloged {
            debug!("Instance is cataloged");
            return Ok(Transition::Unchanged);
        }
        let Some(url) = instance.url.as_deref() else {
            warn!("Instance URL unspecified");
            return Ok(Transition::Unchanged);
        };
        if !self.is_instance_drained(&instance)? {
            warn!("Instance is not drained");
            return Ok(Transition::Unchanged);
        }

        if self.prober.exists(url).await? {
            debug!(url = %url, "Drained instance still exists");
            return Ok(Transition::Unchanged);
        }

        self.set_instance_deleted(key, DeletionPath::Drained, Utc::now())
    }

    fn is_instance_drained(&self, instance: &InstanceRecord) -> ControllerResult<bool> {
        let manager_key = &instance.manager;
        let revision = self
            .store
            .get::<RevisionRecord>(manager_key.revision())?
            .ok_or_else(|| ControllerError::not_found(RevisionRecord::KIND, manager_key.revision()))?;
        let template = self
            .store
            .get::<TemplateRecord>(manager_key.template())?
            .ok_or_else(|| ControllerError::not_found(TemplateRecord::KIND, manager_key.template()))?;
        Ok(manager_drain(&template, &revision, manager_key).is_drained())
    }

    /// Mark an instance deleted and remove it from its manager, atomically.
    ///
    /// The path's precondition is re-checked inside the transaction, so a
    /// concurrent change (e.g. the instance being cataloged) aborts the write.
    pub fn set_instance_deleted(
        &self,
        key: &InstanceKey,
        path: DeletionPath,
        now: DateTime<Utc>,
    ) -> ControllerResult<Transition> {
        settle(self.store.transaction(|tx| {
            let mut instance = tx
                .get::<InstanceRecord>(key)?
                .ok_or_else(|| ControllerError::not_found(InstanceRecord::KIND, key))?;
            let mut manager = tx
                .get::<ManagerRecord>(&instance.manager)?
                .ok_or_else(|| ControllerError::not_found(ManagerRecord::KIND, &instance.manager))?;

            match path {
                DeletionPath::PendingDeletion if !instance.pending_deletion => {
                    warn!(instance = %key, "Instance is not pending deletion");
                    return Ok(Transition::Unchanged);
                }
                DeletionPath::Drained if instance.cataloged => {
                    warn!(instance = %key, "Instance is cataloged");
                    return Ok(Transition::Unchanged);
                }
                DeletionPath::Drained => {
                    if !tx_manager_drained(tx, &manager)? {
                        warn!(instance = %key, "Instance is not drained");
                        return Ok(Transition::Unchanged);
                    }
                }
                DeletionPath::PendingDeletion => {}
            }

            let was_member = manager.instances.remove(key);
            if instance.deleted && !was_member {
                return Ok(Transition::Unchanged);
            }
            if !was_member {
                warn!(instance = %key, manager = %manager.key, "Instance not found in instance group manager");
            }
            if !instance.deleted {
                instance.deleted = true;
                instance.last_updated = now;
                tx.put(&instance)?;
            }
            if was_member {
                tx.put(&manager)?;
            }

            info!(instance = %key, path = ?path, "Marked instance deleted");
            Ok(Transition::Applied)
        }))
    }

    /// Purge a deleted instance record once its grace window has elapsed.
    #[instrument(skip_all, fields(instance = %key))]
    pub async fn cleanup_deleted_instance(
        &self,
        key: &InstanceKey,
        now: DateTime<Utc>,
    ) -> ControllerResult<Transition> {
        settle(self.store.transaction(|tx| {
            let instance = tx
                .get::<InstanceRecord>(key)?
                .ok_or_else(|| ControllerError::not_found(InstanceRecord::KIND, key))?;
            if !instance.deleted {
                warn!("Instance is not deleted");
                return Ok(Transition::Unchanged);
            }
            if !self.grace.has_elapsed(instance.last_updated, now) {
                debug!("Deleted instance is within its grace window");
                return Ok(Transition::Unchanged);
            }

            tx.delete::<InstanceRecord>(key)?;
            info!("Purged deleted instance");
            Ok(Transition::Applied)
        }))
    }

    /// Record the external catalog's view of an instance.
    #[instrument(skip_all, fields(instance = %key, cataloged = cataloged))]
    pub fn set_instance_cataloged(
        &self,
        key: &InstanceKey,
        cataloged: bool,
    ) -> ControllerResult<Transition> {
        settle(self.update_instance(key, |instance| {
            if instance.cataloged == cataloged {
                return false;
            }
            instance.cataloged = cataloged;
            true
        }))
    }

    /// Request deletion of an instance. The deletion is confirmed by
    /// [`Lifecycle::check_deleted_instance`] once the provider no longer has it.
    #[instrument(skip_all, fields(instance = %key))]
    pub fn request_instance_deletion(&self, key: &InstanceKey) -> ControllerResult<Transition> {
        settle(self.update_instance(key, |instance| {
            if instance.pending_deletion || instance.deleted {
                return false;
            }
            instance.pending_deletion = true;
            true
        }))
    }

    fn update_instance(
        &self,
        key: &InstanceKey,
        update: impl FnOnce(&mut InstanceRecord) -> bool,
    ) -> ControllerResult<Transition> {
        self.store.transaction(|tx| {
            let mut instance = tx
                .get::<InstanceRecord>(key)?
                .ok_or_else(|| ControllerError::not_found(InstanceRecord::KIND, key))?;
            if !update(&mut instance) {
                return Ok(Transition::Unchanged);
            }
            instance.last_updated = Utc::now();
            tx.put(&instance)?;
            Ok(Transition::Applied)
        })
    }
}

fn tx_manager_drained(tx: &Tx<'_>, manager: &ManagerRecord) -> ControllerResult<bool> {
    let key = &manager.key;
    let revision = tx
        .get::<RevisionRecord>(key.revision())?
        .ok_or_else(|| ControllerError::not_found(RevisionRecord::KIND, key.revision()))?;
    let template = tx
        .get::<TemplateRecord>(key.template())?
        .ok_or_else(|| ControllerError::not_found(TemplateRecord::KIND, key.template()))?;
    Ok(manager_drain(&template, &revision, key).is_drained())
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use gcefleet_compute::mock::{instance_link, CallKind};

    use super::*;
    use crate::lifecycle::testing::{fixture, Fixture, PROJECT, ZONE};

    const NAME: &str = "linux-01234567-a1b2";

    /// Add an existing provider instance owned by the fixture's manager.
    fn with_instance(fx: &mut Fixture) -> (InstanceKey, String) {
        let url = instance_link(PROJECT, ZONE, NAME);
        fx.provider.insert_instance(&url);
        let record = InstanceRecord::new(NAME, fx.manager.key.clone(), Some(url.clone()), Utc::now());
        fx.manager.instances.insert(record.key.clone());
        fx.save();
        fx.store
            .transaction(|tx| -> ControllerResult<()> { Ok(tx.put(&record)?) })
            .unwrap();
        (record.key, url)
    }

    fn instance(fx: &Fixture, key: &InstanceKey) -> Option<InstanceRecord> {
        fx.store.get(key).unwrap()
    }

    #[tokio::test]
    async fn test_check_deleted_instance_waits_for_provider() {
        let mut fx = fixture();
        let (key, url) = with_instance(&mut fx);
        fx.lifecycle.request_instance_deletion(&key).unwrap();

        let outcome = fx.lifecycle.check_deleted_instance(&key).await.unwrap();
        assert_eq!(outcome, Transition::Unchanged);
        assert!(!instance(&fx, &key).unwrap().deleted);

        fx.provider.remove_instance(&url);
        let outcome = fx.lifecycle.check_deleted_instance(&key).await.unwrap();
        assert_eq!(outcome, Transition::Applied);
        assert!(instance(&fx, &key).unwrap().deleted);
        assert!(fx.manager().unwrap().instances.is_empty());

        let again = fx.lifecycle.check_deleted_instance(&key).await.unwrap();
        assert_eq!(again, Transition::Unchanged);
    }

    #[tokio::test]
    async fn test_check_deleted_instance_probe_failure_is_not_deletion() {
        let mut fx = fixture();
        let (key, _) = with_instance(&mut fx);
        fx.lifecycle.request_instance_deletion(&key).unwrap();
        fx.provider.fail_next(CallKind::Get, 500);

        let err = fx.lifecycle.check_deleted_instance(&key).await.unwrap_err();

        assert!(matches!(err, ControllerError::Provider(_)));
        assert!(!instance(&fx, &key).unwrap().deleted);
    }

    #[tokio::test]
    async fn test_check_deleted_instance_requires_request() {
        let mut fx = fixture();
        let (key, url) = with_instance(&mut fx);
        fx.provider.remove_instance(&url);

        let outcome = fx.lifecycle.check_deleted_instance(&key).await.unwrap();

        assert_eq!(outcome, Transition::Unchanged);
        assert!(!instance(&fx, &key).unwrap().deleted);
    }

    #[tokio::test]
    async fn test_cleanup_drained_instance_only_observes_provider() {
        let mut fx = fixture();
        let (key, url) = with_instance(&mut fx);
        fx.drain_revision();

        let outcome = fx.lifecycle.cleanup_drained_instance(&key).await.unwrap();

        assert_eq!(outcome, Transition::Unchanged);
        assert!(fx.provider.exists(&url));
        assert!(fx.provider.calls_of(CallKind::Delete).is_empty());
        assert!(!instance(&fx, &key).unwrap().deleted);

        fx.provider.remove_instance(&url);
        let outcome = fx.lifecycle.cleanup_drained_instance(&key).await.unwrap();

        assert_eq!(outcome, Transition::Applied);
        assert!(instance(&fx, &key).unwrap().deleted);
        assert!(fx.manager().unwrap().instances.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_drained_instance_skips_cataloged() {
        let mut fx = fixture();
        let (key, url) = with_instance(&mut fx);
        fx.lifecycle.set_instance_cataloged(&key, true).unwrap();
        fx.drain_revision();

        let outcome = fx.lifecycle.cleanup_drained_instance(&key).await.unwrap();

        assert_eq!(outcome, Transition::Unchanged);
        assert!(fx.provider.exists(&url));
    }

    #[tokio::test]
    async fn test_cleanup_drained_instance_skips_active_manager() {
        let mut fx = fixture();
        let (key, url) = with_instance(&mut fx);

        let outcome = fx.lifecycle.cleanup_drained_instance(&key).await.unwrap();

        assert_eq!(outcome, Transition::Unchanged);
        assert!(fx.provider.exists(&url));
    }

    #[tokio::test]
    async fn test_set_instance_deleted_rechecks_catalog() {
        let mut fx = fixture();
        let (key, _) = with_instance(&mut fx);
        fx.drain_revision();
        fx.lifecycle.set_instance_cataloged(&key, true).unwrap();

        let outcome = fx
            .lifecycle
            .set_instance_deleted(&key, DeletionPath::Drained, Utc::now())
            .unwrap();

        assert_eq!(outcome, Transition::Unchanged);
        assert!(!instance(&fx, &key).unwrap().deleted);
    }

    #[tokio::test]
    async fn test_cleanup_deleted_instance_honors_grace() {
        let mut fx = fixture();
        let (key, _) = with_instance(&mut fx);
        let marked = Utc::now();
        fx.lifecycle.request_instance_deletion(&key).unwrap();
        fx.lifecycle
            .set_instance_deleted(&key, DeletionPath::PendingDeletion, marked)
            .unwrap();

        let early = fx
            .lifecycle
            .cleanup_deleted_instance(&key, marked + Duration::minutes(19))
            .await
            .unwrap();
        assert_eq!(early, Transition::Unchanged);
        assert!(instance(&fx, &key).is_some());

        let late = fx
            .lifecycle
            .cleanup_deleted_instance(&key, marked + Duration::minutes(21))
            .await
            .unwrap();
        assert_eq!(late, Transition::Applied);
        assert!(instance(&fx, &key).is_none());
    }

    #[tokio::test]
    async fn test_cleanup_deleted_instance_ignores_live_instance() {
        let mut fx = fixture();
        let (key, _) = with_instance(&mut fx);

        let outcome = fx
            .lifecycle
            .cleanup_deleted_instance(&key, Utc::now() + Duration::days(1))
            .await
            .unwrap();

        assert_eq!(outcome, Transition::Unchanged);
        assert!(instance(&fx, &key).is_some());
    }

    #[test]
    fn test_catalog_and_deletion_requests_are_idempotent() {
        let mut fx = fixture();
        let (key, _) = with_instance(&mut fx);

        assert_eq!(fx.lifecycle.set_instance_cataloged(&key, true).unwrap(), Transition::Applied);
        assert_eq!(fx.lifecycle.set_instance_cataloged(&key, true).unwrap(), Transition::Unchanged);
        assert_eq!(fx.lifecycle.request_instance_deletion(&key).unwrap(), Transition::Applied);
        assert_eq!(fx.lifecycle.request_instance_deletion(&key).unwrap(), Transition::Unchanged);

        let stored = instance(&fx, &key).unwrap();
        assert!(stored.cataloged);
        assert!(stored.pending_deletion);
    }

    #[test]
    fn test_requests_for_missing_instance_are_noops() {
        let fx = fixture();
        let key = InstanceKey::for_instance("linux-absent");

        assert_eq!(fx.lifecycle.set_instance_cataloged(&key, true).unwrap(), Transition::Unchanged);
        assert_eq!(fx.lifecycle.request_instance_deletion(&key).unwrap(), Transition::Unchanged);
    }
}

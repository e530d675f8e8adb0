//! Template and template revision transitions.

use gcefleet_keys::{RevisionKey, TemplateKey};
use tracing::{debug, info, instrument, warn};

use super::{settle, Lifecycle};
use crate::error::{ControllerError, ControllerResult, Transition};
use crate::store::{Record, RevisionRecord, TemplateRecord};

impl Lifecycle {
    /// Create the provider instance template for a revision and record its URL.
    ///
    /// A 409 from the provider means an earlier attempt already created it;
    /// the existing template's URL is recorded instead.
    #[instrument(skip_all, fields(revision = %key))]
    pub async fn create_revision(&self, key: &RevisionKey) -> ControllerResult<Transition> {
        settle(self.try_create_revision(key).await)
    }

    async fn try_create_revision(&self, key: &RevisionKey) -> ControllerResult<Transition> {
        let revision = self
            .store
            .get::<RevisionRecord>(key)?
            .ok_or_else(|| ControllerError::not_found(RevisionRecord::KIND, key))?;
        if revision.url.is_some() {
            debug!("Instance template already created");
            return Ok(Transition::Unchanged);
        }
        if self.store.get::<TemplateRecord>(key.template())?.is_none() {
            return Err(ControllerError::not_found(TemplateRecord::KIND, key.template()));
        }
        if revision.project.is_empty() {
            warn!("Project unspecified");
            return Ok(Transition::Unchanged);
        }

        let name = revision.resource_name();
        let url = match self
            .provider
            .create_instance_template(&revision.project, &name, &revision.properties)
            .await
        {
            Ok(op) => op.target_link,
            Err(e) if e.is_conflict() => {
                info!(name = %name, "Instance template already exists");
                self.provider
                    .get_instance_template(&revision.project, &name)
                    .await?
                    .self_link
            }
            Err(e) => return Err(e.into()),
        };

        self.set_revision_url(key, Some(url))
    }

    /// Delete the provider instance template of a drained revision with no
    /// remaining managers, then clear its URL.
    #[instrument(skip_all, fields(revision = %key))]
    pub async fn delete_revision_resource(
        &self,
        key: &RevisionKey,
    ) -> ControllerResult<Transition> {
        settle(self.try_delete_revision_resource(key).await)
    }

    async fn try_delete_revision_resource(
        &self,
        key: &RevisionKey,
    ) -> ControllerResult<Transition> {
        let revision = self
            .store
            .get::<RevisionRecord>(key)?
            .ok_or_else(|| ControllerError::not_found(RevisionRecord::KIND, key))?;
        let Some(url) = revision.url.clone() else {
            return Ok(Transition::Unchanged);
        };
        if revision.has_managers() {
            return Err(ControllerError::invariant(
                RevisionRecord::KIND,
                key,
                "instance group managers still reference this revision",
            ));
        }
        let template = self
            .store
            .get::<TemplateRecord>(key.template())?
            .ok_or_else(|| ControllerError::not_found(TemplateRecord::KIND, key.template()))?;
        if !template.is_drained(key) {
            return Err(ControllerError::invariant(
                RevisionRecord::KIND,
                key,
                "revision is not drained",
            ));
        }

        match self.provider.delete(&url).await {
            Ok(op) if op.target_link != url => {
                warn!(url = %url, deleted = %op.target_link, "Deleted resource differs from recorded URL");
            }
            Ok(_) => info!(url = %url, "Deleted instance template"),
            Err(e) if e.is_not_found() => debug!(url = %url, "Instance template already deleted"),
            Err(e) => return Err(e.into()),
        }

        self.set_revision_url(key, None)
    }

    fn set_revision_url(
        &self,
        key: &RevisionKey,
        url: Option<String>,
    ) -> ControllerResult<Transition> {
        self.store.transaction(|tx| {
            let mut revision = tx
                .get::<RevisionRecord>(key)?
                .ok_or_else(|| ControllerError::not_found(RevisionRecord::KIND, key))?;
            if revision.url == url {
                return Ok(Transition::Unchanged);
            }
            if let (Some(old), Some(new)) = (&revision.url, &url) {
                warn!(old = %old, new = %new, "Instance template URL changed");
            }
            revision.url = url;
            tx.put(&revision)?;
            Ok(Transition::Applied)
        })
    }

    /// Delete a drained revision record once it has no provider resource and
    /// no managers, removing it from its template's drained set.
    #[instrument(skip_all, fields(revision = %key))]
    pub async fn delete_revision(&self, key: &RevisionKey) -> ControllerResult<Transition> {
        settle(self.store.transaction(|tx| {
            let revision = tx
                .get::<RevisionRecord>(key)?
                .ok_or_else(|| ControllerError::not_found(RevisionRecord::KIND, key))?;
            if revision.url.is_some() || revision.has_managers() {
                debug!("Revision still has dependents");
                return Ok(Transition::Unchanged);
            }
            let mut template = tx
                .get::<TemplateRecord>(key.template())?
                .ok_or_else(|| ControllerError::not_found(TemplateRecord::KIND, key.template()))?;
            if !template.drained.remove(key) {
                debug!("Revision is not drained");
                return Ok(Transition::Unchanged);
            }

            tx.put(&template)?;
            tx.delete::<RevisionRecord>(key)?;
            info!("Deleted instance template revision");
            Ok(Transition::Applied)
        }))
    }

    /// Delete a template record that no longer references any revision.
    #[instrument(skip_all, fields(template = %key))]
    pub async fn delete_template(&self, key: &TemplateKey) -> ControllerResult<Transition> {
        settle(self.store.transaction(|tx| {
            let template = tx
                .get::<TemplateRecord>(key)?
                .ok_or_else(|| ControllerError::not_found(TemplateRecord::KIND, key))?;
            if !template.is_empty() {
                return Ok(Transition::Unchanged);
            }

            tx.delete::<TemplateRecord>(key)?;
            info!("Deleted instance template");
            Ok(Transition::Applied)
        }))
    }
}

#[cfg(test)]
mod tests {
    use gcefleet_compute::mock::{template_link, CallKind, ProviderCall};

    use super::*;
    use crate::lifecycle::testing::{fixture, PROJECT};

    #[tokio::test]
    async fn test_create_revision_records_url() {
        let fx = fixture();

        let outcome = fx.lifecycle.create_revision(&fx.revision.key).await.unwrap();

        assert_eq!(outcome, Transition::Applied);
        let url = fx.revision().unwrap().url.unwrap();
        assert_eq!(url, template_link(PROJECT, "linux-0123456789abcdef"));
        assert!(fx.provider.exists(&url));

        let again = fx.lifecycle.create_revision(&fx.revision.key).await.unwrap();
        assert_eq!(again, Transition::Unchanged);
        assert_eq!(fx.provider.calls_of(CallKind::CreateTemplate).len(), 1);
    }

    #[tokio::test]
    async fn test_create_revision_conflict_adopts_existing() {
        let fx = fixture();
        let existing = fx.provider.insert_template(PROJECT, "linux-0123456789abcdef");

        fx.lifecycle.create_revision(&fx.revision.key).await.unwrap();

        assert_eq!(fx.revision().unwrap().url, Some(existing));
        assert_eq!(
            fx.provider.calls_of(CallKind::GetTemplate),
            vec![ProviderCall::GetTemplate {
                name: "linux-0123456789abcdef".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_create_revision_provider_failure_leaves_record() {
        let fx = fixture();
        fx.provider.fail_next(CallKind::CreateTemplate, 503);

        let err = fx.lifecycle.create_revision(&fx.revision.key).await.unwrap_err();

        assert!(matches!(err, ControllerError::Provider(_)));
        assert_eq!(fx.revision().unwrap().url, None);
    }

    #[tokio::test]
    async fn test_delete_revision_resource_requires_drain() {
        let mut fx = fixture();
        fx.revision.active.clear();
        fx.revision.url = Some(fx.provider.insert_template(PROJECT, "linux-0123456789abcdef"));
        fx.save();

        let err = fx
            .lifecycle
            .delete_revision_resource(&fx.revision.key)
            .await
            .unwrap_err();
        assert!(err.is_benign());

        fx.drain_revision();
        let outcome = fx
            .lifecycle
            .delete_revision_resource(&fx.revision.key)
            .await
            .unwrap();
        assert_eq!(outcome, Transition::Applied);
        assert_eq!(fx.revision().unwrap().url, None);
        assert_eq!(fx.provider.calls_of(CallKind::Delete).len(), 1);
    }

    #[tokio::test]
    async fn test_delete_revision_resource_tolerates_missing_resource() {
        let mut fx = fixture();
        fx.revision.active.clear();
        fx.revision.url = Some(template_link(PROJECT, "linux-0123456789abcdef"));
        fx.drain_revision();

        let outcome = fx
            .lifecycle
            .delete_revision_resource(&fx.revision.key)
            .await
            .unwrap();

        assert_eq!(outcome, Transition::Applied);
        assert_eq!(fx.revision().unwrap().url, None);
    }

    #[tokio::test]
    async fn test_delete_placeholder_revision_without_provider_call() {
        let mut fx = fixture();
        fx.revision.active.clear();
        fx.drain_revision();

        let outcome = fx.lifecycle.delete_revision(&fx.revision.key).await.unwrap();

        assert_eq!(outcome, Transition::Applied);
        assert!(fx.revision().is_none());
        assert!(fx.template().drained.is_empty());
        assert!(fx.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_revision_waits_for_managers() {
        let mut fx = fixture();
        fx.drain_revision();

        let outcome = fx.lifecycle.delete_revision(&fx.revision.key).await.unwrap();

        assert_eq!(outcome, Transition::Unchanged);
        assert!(fx.revision().is_some());
    }

    #[tokio::test]
    async fn test_delete_template_only_when_empty() {
        let mut fx = fixture();

        let outcome = fx.lifecycle.delete_template(&fx.template.key).await.unwrap();
        assert_eq!(outcome, Transition::Unchanged);

        fx.template.active = None;
        fx.save();
        let outcome = fx.lifecycle.delete_template(&fx.template.key).await.unwrap();
        assert_eq!(outcome, Transition::Applied);

        let missing = fx.lifecycle.delete_template(&fx.template.key).await.unwrap();
        assert_eq!(missing, Transition::Unchanged);
    }
}

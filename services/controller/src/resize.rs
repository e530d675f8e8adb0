//! Resize controller for instance group managers.
//!
//! Grows a manager toward its configured minimum size, counting instances
//! that sibling managers (other revisions, same template and zone) already
//! provide. Growth per invocation is bounded by the resize policy's step
//! limit so repeated scheduler passes ramp capacity up gradually.

use std::sync::Arc;

use gcefleet_compute::ComputeProvider;
use gcefleet_keys::ManagerKey;
use gcefleet_reconcile::{ResizeDecision, ResizePolicy};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ControllerError, ControllerResult, Transition};
use crate::store::{ManagerRecord, Record, RevisionRecord, Store};

/// Issues step-limited resizes.
pub struct ResizeController {
    store: Arc<Store>,
    provider: Arc<dyn ComputeProvider>,
    policy: ResizePolicy,
}

impl ResizeController {
    pub fn new(store: Arc<Store>, provider: Arc<dyn ComputeProvider>, policy: ResizePolicy) -> Self {
        Self {
            store,
            provider,
            policy,
        }
    }

    /// Resize a manager if its idle size is below its desired size.
    ///
    /// A manager whose provider response omits the idle count is left
    /// alone; it is retried on the next pass.
    #[instrument(skip_all, fields(manager = %key))]
    pub async fn resize(&self, key: &ManagerKey) -> ControllerResult<Transition> {
        let Some(manager) = self.store.get::<ManagerRecord>(key)? else {
            warn!("{} does not exist", ManagerRecord::KIND);
            return Ok(Transition::Unchanged);
        };
        if manager.url.is_none() {
            debug!("Instance group manager not created yet");
            return Ok(Transition::Unchanged);
        }
        let revision = self
            .store
            .get::<RevisionRecord>(key.revision())?
            .ok_or_else(|| ControllerError::not_found(RevisionRecord::KIND, key.revision()))?;

        let name = revision.resource_name();
        let igm = self
            .provider
            .get_instance_group_manager(&revision.project, &name, key.zone())
            .await?;
        let Some(idle_size) = igm.idle_size() else {
            error!(name = %name, "Instance group manager has no idle size");
            return Ok(Transition::Unchanged);
        };

        let sibling_size = self.sibling_size(key)?;
        let decision = self
            .policy
            .decide(manager.minimum_size, sibling_size, idle_size);
        debug!(
            minimum_size = manager.minimum_size,
            sibling_size,
            idle_size,
            target = decision.target(),
            "Computed resize target"
        );

        match decision {
            ResizeDecision::Hold { .. } => Ok(Transition::Unchanged),
            ResizeDecision::Grow { target } => {
                info!(name = %name, from = idle_size, to = target, "Resizing instance group manager");
                self.provider
                    .resize_instance_group_manager(&revision.project, &name, key.zone(), target)
                    .await?;
                Ok(Transition::Applied)
            }
        }
    }

    /// Total current size of the managers for the same template and zone
    /// under other revisions.
    fn sibling_size(&self, key: &ManagerKey) -> ControllerResult<i64> {
        let siblings = self.store.list_under::<ManagerRecord>(key.template())?;
        Ok(siblings
            .iter()
            .filter(|m| m.key != *key && m.key.zone() == key.zone())
            .map(|m| m.current_size)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use gcefleet_compute::mock::{CallKind, ProviderCall};
    use gcefleet_compute::MockProvider;
    use gcefleet_keys::{RevisionKey, TemplateKey};
    use rstest::rstest;

    use super::*;
    use crate::store::StoreError;

    const PROJECT: &str = "fleet-project";
    const ZONE: &str = "us-central1-b";

    struct Setup {
        provider: Arc<MockProvider>,
        controller: ResizeController,
        key: ManagerKey,
        url: String,
    }

    fn revision_key(template: &TemplateKey, revision: &str) -> RevisionKey {
        RevisionKey::new(template.clone(), revision).unwrap()
    }

    /// A manager with the given minimum size and, optionally, a sibling
    /// manager in the same zone under an older revision.
    fn setup(minimum_size: i64, sibling_size: Option<i64>) -> Setup {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let provider = Arc::new(MockProvider::new());
        let template = TemplateKey::for_template("linux", PROJECT);

        let revision = RevisionRecord::new(
            revision_key(&template, "bbbbbbbbbbbbbbbb"),
            "linux",
            PROJECT,
            serde_json::json!({}),
        );
        let url = provider.insert_manager(PROJECT, ZONE, &revision.resource_name());
        let mut manager = ManagerRecord::new(
            ManagerKey::new(revision.key.clone(), ZONE).unwrap(),
            minimum_size,
            minimum_size * 2,
        );
        manager.url = Some(url.clone());

        store
            .transaction(|tx| -> Result<(), StoreError> {
                tx.put(&revision)?;
                tx.put(&manager)?;
                if let Some(size) = sibling_size {
                    let old = revision_key(&template, "aaaaaaaaaaaaaaaa");
                    let mut sibling = ManagerRecord::new(ManagerKey::new(old.clone(), ZONE).unwrap(), 0, 0);
                    sibling.current_size = size;
                    tx.put(&sibling)?;

                    // Different zone, never counted.
                    let mut elsewhere = ManagerRecord::new(ManagerKey::new(old, "us-east1-c").unwrap(), 0, 0);
                    elsewhere.current_size = 50;
                    tx.put(&elsewhere)?;
                }
                Ok(())
            })
            .unwrap();

        Setup {
            controller: ResizeController::new(store, provider.clone(), ResizePolicy::default()),
            provider,
            key: manager.key,
            url,
        }
    }

    fn resizes(provider: &MockProvider) -> Vec<i64> {
        provider
            .calls_of(CallKind::Resize)
            .into_iter()
            .filter_map(|call| match call {
                ProviderCall::Resize { size, .. } => Some(size),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_resize_counts_sibling_capacity() {
        let s = setup(10, Some(4));

        let outcome = s.controller.resize(&s.key).await.unwrap();

        assert_eq!(outcome, Transition::Applied);
        assert_eq!(resizes(&s.provider), vec![6]);
        assert_eq!(s.provider.target_size(&s.url), Some(6));
    }

    #[rstest]
    #[case::first_step(1000, 0, vec![100])]
    #[case::continues_from_idle(1000, 250, vec![350])]
    #[case::final_partial_step(300, 250, vec![300])]
    #[case::at_target(300, 300, vec![])]
    #[tokio::test]
    async fn test_resize_steps(
        #[case] minimum_size: i64,
        #[case] idle: i64,
        #[case] expected: Vec<i64>,
    ) {
        let s = setup(minimum_size, None);
        s.provider.set_idle_size(&s.url, Some(idle));

        s.controller.resize(&s.key).await.unwrap();

        assert_eq!(resizes(&s.provider), expected);
    }

    #[tokio::test]
    async fn test_missing_idle_size_skips_resize() {
        let s = setup(10, None);
        s.provider.set_idle_size(&s.url, None);

        let outcome = s.controller.resize(&s.key).await.unwrap();

        assert_eq!(outcome, Transition::Unchanged);
        assert!(resizes(&s.provider).is_empty());
    }

    #[tokio::test]
    async fn test_siblings_over_minimum_never_shrink() {
        let s = setup(10, Some(12));
        s.provider.set_idle_size(&s.url, Some(3));

        let outcome = s.controller.resize(&s.key).await.unwrap();

        assert_eq!(outcome, Transition::Unchanged);
        assert!(resizes(&s.provider).is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_is_returned() {
        let s = setup(10, None);
        s.provider.fail_next(CallKind::GetManager, 503);

        let err = s.controller.resize(&s.key).await.unwrap_err();

        assert!(matches!(err, ControllerError::Provider(_)));
    }
}

//! TFJob persistence

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use trainer_common::crd::TFJob;
use trainer_common::error::is_conflict_status;
use trainer_common::Error;

/// Writes a job back to the API server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist metadata, spec and status. A stale resource version is
    /// [`Error::Conflict`].
    async fn update(&self, job: &TFJob) -> Result<TFJob, Error>;
}

/// [`JobStore`] backed by the TFJob API
pub struct KubeJobStore {
    client: Client,
}

impl KubeJobStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobStore for KubeJobStore {
    async fn update(&self, job: &TFJob) -> Result<TFJob, Error> {
        let name = job.name_any();
        let namespace = job.namespace().ok_or_else(|| {
            Error::validation_for_field(&name, "metadata.namespace", "TFJob has no namespace")
        })?;
        let api: Api<TFJob> = Api::namespaced(self.client.clone(), &namespace);
        let pp = PostParams::default();

        // Runtime id and annotations live outside the status subresource.
        let mut updated = api
            .replace(&name, &pp, job)
            .await
            .map_err(|e| conflict_or(e, &name))?;

        updated.status = job.status.clone();
        let body = serde_json::to_vec(&updated)
            .map_err(|e| Error::serialization_for_kind("TFJob", e.to_string()))?;
        api.replace_status(&name, &pp, body)
            .await
            .map_err(|e| conflict_or(e, &name))
    }
}

fn conflict_or(err: kube::Error, name: &str) -> Error {
    if is_conflict_status(&err) {
        Error::conflict("TFJob", name, err.to_string())
    } else {
        Error::from(err)
    }
}

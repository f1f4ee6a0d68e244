//! Relation-store adapters.
//!
//! The agent is the only writer of relation tuples. A denied check surfaces
//! as [`ErrorKind::Authorization`]; transport and store failures surface as
//! [`ErrorKind::PolicyEngine`].

mod memory;
mod spicedb;

pub use memory::InMemoryPolicyAgent;
pub use spicedb::SpiceDbAgent;

use async_trait::async_trait;

use crate::error::{Error, ErrorKind};
use crate::models::PolicyRequest;

#[async_trait]
pub trait PolicyAgent: Send + Sync {
    async fn check_policy(&self, pr: &PolicyRequest) -> Result<(), Error>;

    async fn add_policy(&self, pr: &PolicyRequest) -> Result<(), Error> {
        self.add_policies(std::slice::from_ref(pr)).await
    }

    /// All tuples are written or none are.
    async fn add_policies(&self, prs: &[PolicyRequest]) -> Result<(), Error>;

    /// Delete every tuple matching the non-empty fields of `pr`.
    async fn delete_policy_filter(&self, pr: &PolicyRequest) -> Result<(), Error>;

    async fn delete_policies(&self, prs: &[PolicyRequest]) -> Result<(), Error>;

    async fn retrieve_objects(
        &self,
        pr: &PolicyRequest,
        next_page_token: &str,
        limit: u64,
    ) -> Result<(Vec<PolicyRequest>, String), Error>;

    async fn retrieve_all_objects(&self, pr: &PolicyRequest) -> Result<Vec<PolicyRequest>, Error>;

    async fn retrieve_all_objects_count(&self, pr: &PolicyRequest) -> Result<u64, Error> {
        Ok(self.retrieve_all_objects(pr).await?.len() as u64)
    }

    async fn retrieve_subjects(
        &self,
        pr: &PolicyRequest,
        next_page_token: &str,
        limit: u64,
    ) -> Result<(Vec<PolicyRequest>, String), Error>;

    async fn retrieve_all_subjects(&self, pr: &PolicyRequest) -> Result<Vec<PolicyRequest>, Error>;

    async fn retrieve_all_subjects_count(&self, pr: &PolicyRequest) -> Result<u64, Error> {
        Ok(self.retrieve_all_subjects(pr).await?.len() as u64)
    }

    /// The subset of `filter` the subject holds on the object.
    async fn retrieve_permissions(
        &self,
        pr: &PolicyRequest,
        filter: &[String],
    ) -> Result<Vec<String>, Error>;
}

pub(crate) fn denied(pr: &PolicyRequest) -> Error {
    Error::new(ErrorKind::Authorization).with_context(format!(
        "{} lacks {} on {}:{}",
        pr.subject,
        pr.action(),
        pr.object_type.map(|t| t.as_str()).unwrap_or_default(),
        pr.object
    ))
}

/// Tuples need both ends typed and named, and a relation.
pub(crate) fn validate_tuple(pr: &PolicyRequest) -> Result<(), Error> {
    if pr.subject.is_empty()
        || pr.object.is_empty()
        || pr.relation.is_empty()
        || pr.subject_type.is_none()
        || pr.object_type.is_none()
    {
        return Err(Error::new(ErrorKind::MalformedEntity).with_context(format!(
            "incomplete tuple {}:{}#{}@{}",
            pr.object_type.map(|t| t.as_str()).unwrap_or_default(),
            pr.object,
            pr.relation,
            pr.subject
        )));
    }
    Ok(())
}

pub(crate) fn validate_filter(pr: &PolicyRequest) -> Result<(), Error> {
    if pr.subject.is_empty() && pr.object.is_empty() && pr.relation.is_empty() {
        return Err(Error::new(ErrorKind::MalformedEntity)
            .with_context("empty delete filter"));
    }
    Ok(())
}

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{denied, validate_filter, validate_tuple, PolicyAgent};
use crate::config::SpiceDbConfig;
use crate::error::{Error, ErrorKind};
use crate::models::{EntityType, PolicyRequest};

const HAS_PERMISSION: &str = "PERMISSIONSHIP_HAS_PERMISSION";
const PAGE_SIZE: u64 = 1000;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
struct ObjectReference {
    object_type: String,
    object_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
struct SubjectReference {
    object: ObjectReference,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    optional_relation: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Relationship {
    resource: ObjectReference,
    relation: String,
    subject: SubjectReference,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Consistency {
    fully_consistent: bool,
}

const FULLY_CONSISTENT: Consistency = Consistency {
    fully_consistent: true,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckRequest<'a> {
    consistency: &'a Consistency,
    resource: ObjectReference,
    permission: String,
    subject: SubjectReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckResponse {
    #[serde(default)]
    permissionship: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RelationshipUpdate {
    operation: &'static str,
    relationship: Relationship,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteRequest {
    updates: Vec<RelationshipUpdate>,
}

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct SubjectFilter {
    subject_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    optional_subject_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RelationshipFilter {
    resource_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    optional_resource_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    optional_relation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    optional_subject_filter: Option<SubjectFilter>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteRequest {
    relationship_filter: RelationshipFilter,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
struct Cursor {
    token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LookupResourcesRequest<'a> {
    consistency: &'a Consistency,
    resource_object_type: String,
    permission: String,
    subject: SubjectReference,
    optional_limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    optional_cursor: Option<Cursor>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LookupSubjectsRequest<'a> {
    consistency: &'a Consistency,
    resource: ObjectReference,
    permission: String,
    subject_object_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    optional_subject_relation: String,
    optional_concrete_limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    optional_cursor: Option<Cursor>,
}

/// One line of a streamed lookup response.
#[derive(Debug, Deserialize)]
struct StreamLine<T> {
    result: Option<T>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupResourcesResult {
    resource_object_id: String,
    after_result_cursor: Option<Cursor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolvedSubject {
    subject_object_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupSubjectsResult {
    subject: ResolvedSubject,
    after_result_cursor: Option<Cursor>,
}

/// Adapter over the SpiceDB HTTP gateway.
#[derive(Clone)]
pub struct SpiceDbAgent {
    client: Client,
    endpoint: String,
    pre_shared_key: String,
}

fn engine_error(context: impl Into<String>) -> Error {
    Error::new(ErrorKind::PolicyEngine).with_context(context)
}

fn required_type(value: Option<EntityType>, what: &str) -> Result<String, Error> {
    value
        .map(|t| t.as_str().to_string())
        .ok_or_else(|| {
            Error::new(ErrorKind::MalformedEntity).with_context(format!("{what} type is required"))
        })
}

fn resource_of(pr: &PolicyRequest) -> Result<ObjectReference, Error> {
    Ok(ObjectReference {
        object_type: required_type(pr.object_type, "object")?,
        object_id: pr.object.clone(),
    })
}

fn subject_of(pr: &PolicyRequest) -> Result<SubjectReference, Error> {
    Ok(SubjectReference {
        object: ObjectReference {
            object_type: required_type(pr.subject_type, "subject")?,
            object_id: pr.subject.clone(),
        },
        optional_relation: pr.subject_relation.clone(),
    })
}

fn relationship_of(pr: &PolicyRequest) -> Result<Relationship, Error> {
    validate_tuple(pr)?;
    Ok(Relationship {
        resource: resource_of(pr)?,
        relation: pr.relation.clone(),
        subject: subject_of(pr)?,
    })
}

fn cursor_of(token: &str) -> Option<Cursor> {
    (!token.is_empty()).then(|| Cursor {
        token: token.to_string(),
    })
}

fn parse_stream<T: DeserializeOwned>(body: &str) -> Result<Vec<T>, Error> {
    let mut results = Vec::new();
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let parsed: StreamLine<T> = serde_json::from_str(line)
            .map_err(|e| Error::wrap(ErrorKind::PolicyEngine, e))?;
        if let Some(err) = parsed.error {
            return Err(engine_error(err.to_string()));
        }
        if let Some(result) = parsed.result {
            results.push(result);
        }
    }
    Ok(results)
}

impl SpiceDbAgent {
    pub fn new(config: &SpiceDbConfig) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::wrap(ErrorKind::PolicyEngine, e))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            pre_shared_key: config.pre_shared_key.clone(),
        })
    }

    async fn post_raw<B: Serialize>(&self, path: &str, body: &B) -> Result<String, Error> {
        let url = format!("{}{}", self.endpoint, path);
        tracing::debug!(url = %url, "Sending request to SpiceDB");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.pre_shared_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::wrap(ErrorKind::PolicyEngine, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::wrap(ErrorKind::PolicyEngine, e))?;

        if !status.is_success() {
            tracing::warn!(status = %status, path, "SpiceDB request failed");
            return Err(engine_error(format!("{path} returned {status}: {text}")));
        }
        Ok(text)
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R, Error> {
        let text = self.post_raw(path, body).await?;
        serde_json::from_str(&text).map_err(|e| Error::wrap(ErrorKind::PolicyEngine, e))
    }

    async fn write(&self, operation: &'static str, prs: &[PolicyRequest]) -> Result<(), Error> {
        if prs.is_empty() {
            return Ok(());
        }
        let updates = prs
            .iter()
            .map(|pr| {
                Ok(RelationshipUpdate {
                    operation,
                    relationship: relationship_of(pr)?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        self.post_raw("/v1/relationships/write", &WriteRequest { updates })
            .await
            .map(|_| ())
    }

    async fn delete_matching(
        &self,
        pr: &PolicyRequest,
        resource_type: EntityType,
        subject_type: Option<EntityType>,
    ) -> Result<(), Error> {
        let request = DeleteRequest {
            relationship_filter: RelationshipFilter {
                resource_type: resource_type.as_str().to_string(),
                optional_resource_id: pr.object.clone(),
                optional_relation: pr.relation.clone(),
                optional_subject_filter: subject_type.map(|t| SubjectFilter {
                    subject_type: t.as_str().to_string(),
                    optional_subject_id: pr.subject.clone(),
                }),
            },
        };
        self.post_raw("/v1/relationships/delete", &request)
            .await
            .map(|_| ())
    }

    async fn lookup_resources(
        &self,
        pr: &PolicyRequest,
        token: &str,
        limit: u64,
    ) -> Result<(Vec<PolicyRequest>, String), Error> {
        let request = LookupResourcesRequest {
            consistency: &FULLY_CONSISTENT,
            resource_object_type: required_type(pr.object_type, "object")?,
            permission: pr.action().to_string(),
            subject: subject_of(pr)?,
            optional_limit: limit,
            optional_cursor: cursor_of(token),
        };
        let body = self.post_raw("/v1/permissions/resources", &request).await?;
        let results: Vec<LookupResourcesResult> = parse_stream(&body)?;

        let full_page = results.len() as u64 >= limit;
        let next = results
            .last()
            .and_then(|r| r.after_result_cursor.clone())
            .filter(|_| full_page)
            .map(|c| c.token)
            .unwrap_or_default();

        let policies = results
            .into_iter()
            .map(|r| PolicyRequest {
                object: r.resource_object_id,
                ..pr.clone()
            })
            .collect();
        Ok((policies, next))
    }

    async fn lookup_subjects(
        &self,
        pr: &PolicyRequest,
        token: &str,
        limit: u64,
    ) -> Result<(Vec<PolicyRequest>, String), Error> {
        let request = LookupSubjectsRequest {
            consistency: &FULLY_CONSISTENT,
            resource: resource_of(pr)?,
            permission: pr.action().to_string(),
            subject_object_type: required_type(pr.subject_type, "subject")?,
            optional_subject_relation: pr.subject_relation.clone(),
            optional_concrete_limit: limit,
            optional_cursor: cursor_of(token),
        };
        let body = self.post_raw("/v1/permissions/subjects", &request).await?;
        let results: Vec<LookupSubjectsResult> = parse_stream(&body)?;

        let full_page = results.len() as u64 >= limit;
        let next = results
            .last()
            .and_then(|r| r.after_result_cursor.clone())
            .filter(|_| full_page)
            .map(|c| c.token)
            .unwrap_or_default();

        let policies = results
            .into_iter()
            .map(|r| PolicyRequest {
                subject: r.subject.subject_object_id,
                ..pr.clone()
            })
            .collect();
        Ok((policies, next))
    }
}

#[async_trait]
impl PolicyAgent for SpiceDbAgent {
    #[tracing::instrument(skip(self, pr), fields(object = %pr.object, action = %pr.action()))]
    async fn check_policy(&self, pr: &PolicyRequest) -> Result<(), Error> {
        let request = CheckRequest {
            consistency: &FULLY_CONSISTENT,
            resource: resource_of(pr)?,
            permission: pr.action().to_string(),
            subject: subject_of(pr)?,
        };
        let response: CheckResponse = self.post("/v1/permissions/check", &request).await?;
        if response.permissionship == HAS_PERMISSION {
            Ok(())
        } else {
            Err(denied(pr))
        }
    }

    async fn add_policies(&self, prs: &[PolicyRequest]) -> Result<(), Error> {
        self.write("OPERATION_TOUCH", prs).await
    }

    async fn delete_policy_filter(&self, pr: &PolicyRequest) -> Result<(), Error> {
        validate_filter(pr)?;

        let resource_types = match pr.object_type {
            Some(t) => vec![t],
            None => EntityType::ALL.to_vec(),
        };
        // The store filters subjects only by type, so an untyped subject id
        // is expanded over every namespace.
        let subject_types = match (pr.subject_type, pr.subject.is_empty()) {
            (Some(t), _) => vec![Some(t)],
            (None, true) => vec![None],
            (None, false) => EntityType::ALL.into_iter().map(Some).collect(),
        };

        for resource_type in resource_types {
            for subject_type in &subject_types {
                self.delete_matching(pr, resource_type, *subject_type).await?;
            }
        }
        Ok(())
    }

    async fn delete_policies(&self, prs: &[PolicyRequest]) -> Result<(), Error> {
        self.write("OPERATION_DELETE", prs).await
    }

    async fn retrieve_objects(
        &self,
        pr: &PolicyRequest,
        next_page_token: &str,
        limit: u64,
    ) -> Result<(Vec<PolicyRequest>, String), Error> {
        self.lookup_resources(pr, next_page_token, limit.max(1)).await
    }

    async fn retrieve_all_objects(&self, pr: &PolicyRequest) -> Result<Vec<PolicyRequest>, Error> {
        let mut all = Vec::new();
        let mut token = String::new();
        loop {
            let (page, next) = self.lookup_resources(pr, &token, PAGE_SIZE).await?;
            all.extend(page);
            if next.is_empty() {
                return Ok(all);
            }
            token = next;
        }
    }

    async fn retrieve_subjects(
        &self,
        pr: &PolicyRequest,
        next_page_token: &str,
        limit: u64,
    ) -> Result<(Vec<PolicyRequest>, String), Error> {
        self.lookup_subjects(pr, next_page_token, limit.max(1)).await
    }

    async fn retrieve_all_subjects(&self, pr: &PolicyRequest) -> Result<Vec<PolicyRequest>, Error> {
        let mut all = Vec::new();
        let mut token = String::new();
        loop {
            let (page, next) = self.lookup_subjects(pr, &token, PAGE_SIZE).await?;
            all.extend(page);
            if next.is_empty() {
                return Ok(all);
            }
            token = next;
        }
    }

    async fn retrieve_permissions(
        &self,
        pr: &PolicyRequest,
        filter: &[String],
    ) -> Result<Vec<String>, Error> {
        let checks = filter.iter().map(|permission| {
            let candidate = PolicyRequest {
                permission: permission.clone(),
                relation: String::new(),
                ..pr.clone()
            };
            async move {
                match self.check_policy(&candidate).await {
                    Ok(()) => Ok(Some(candidate.permission)),
                    Err(e) if e.kind() == ErrorKind::Authorization => Ok(None),
                    Err(e) => Err(e),
                }
            }
        });

        let mut held = Vec::new();
        for outcome in join_all(checks).await {
            if let Some(permission) = outcome? {
                held.push(permission);
            }
        }
        Ok(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::policy::{MEMBERSHIP_PERMISSION, MEMBER_RELATION, VIEW_PERMISSION};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn agent(server: &MockServer) -> SpiceDbAgent {
        SpiceDbAgent::new(&SpiceDbConfig {
            endpoint: server.uri(),
            pre_shared_key: "psk".to_string(),
        })
        .expect("client")
    }

    fn membership(subject: &str, domain: &str) -> PolicyRequest {
        PolicyRequest {
            subject: subject.to_string(),
            subject_type: Some(EntityType::User),
            permission: MEMBERSHIP_PERMISSION.to_string(),
            object: domain.to_string(),
            object_type: Some(EntityType::Domain),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_check_maps_permissionship() -> Result<(), anyhow::Error> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/permissions/check"))
            .and(header("authorization", "Bearer psk"))
            .and(body_partial_json(json!({"resource": {"objectId": "d1"}})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"permissionship": "PERMISSIONSHIP_HAS_PERMISSION"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/permissions/check"))
            .and(body_partial_json(json!({"resource": {"objectId": "d2"}})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"permissionship": "PERMISSIONSHIP_NO_PERMISSION"})),
            )
            .mount(&server)
            .await;

        let agent = agent(&server);
        agent.check_policy(&membership("u1", "d1")).await?;
        let err = agent.check_policy(&membership("u1", "d2")).await.unwrap_err();
        assert!(err.contains(ErrorKind::Authorization));
        Ok(())
    }

    #[tokio::test]
    async fn test_transport_failure_is_policy_engine_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/relationships/write"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let tuple = PolicyRequest {
            relation: MEMBER_RELATION.to_string(),
            permission: String::new(),
            ..membership("u1", "d1")
        };
        let err = agent(&server).add_policy(&tuple).await.unwrap_err();
        assert!(err.contains(ErrorKind::PolicyEngine));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_incomplete_tuple_is_not_sent() {
        let server = MockServer::start().await;
        let err = agent(&server)
            .add_policies(&[membership("u1", "d1")])
            .await
            .unwrap_err();
        assert!(err.contains(ErrorKind::MalformedEntity));
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_resources_streams_pages() -> Result<(), anyhow::Error> {
        let server = MockServer::start().await;
        let body = [
            json!({"result": {"resourceObjectId": "d1", "afterResultCursor": {"token": "c1"}}}),
            json!({"result": {"resourceObjectId": "d2", "afterResultCursor": {"token": "c2"}}}),
        ]
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\n");
        Mock::given(method("POST"))
            .and(path("/v1/permissions/resources"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let lookup = PolicyRequest {
            permission: VIEW_PERMISSION.to_string(),
            ..membership("u1", "")
        };
        let (page, next) = agent(&server).retrieve_objects(&lookup, "", 2).await?;
        assert_eq!(page.iter().map(|p| p.object.as_str()).collect::<Vec<_>>(), vec!["d1", "d2"]);
        assert_eq!(next, "c2");

        let (_, next) = agent(&server).retrieve_objects(&lookup, "", 10).await?;
        assert!(next.is_empty());
        Ok(())
    }
}

use crate::credentials::AwsCredentials;
use async_trait::async_trait;
use aws_sdk_route53::{
    Client,
    config::{BehaviorVersion, Credentials, Region},
    error::{BuildError, DisplayErrorContext, SdkError},
    operation::change_resource_record_sets::ChangeResourceRecordSetsError,
    types,
};
use thiserror::Error;
use tracing::*;

#[derive(Error, Debug)]
pub enum ProviderError {
    /// 4xx invalid-change-batch shaped responses; the caller decides whether
    /// this counts as success (it does for deletes)
    #[error("record set not found: {0}")]
    NotFound(String),

    #[error("change submission failed: {0}")]
    Api(String),

    #[error("invalid change batch: {0}")]
    InvalidChange(#[from] BuildError),
}

/// One record set as Route53 sees it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordSet {
    pub zone_id: String,
    pub fqdn: String,
    pub record_type: String,
    pub targets: Vec<String>,
    pub ttl: i64,
    pub comment: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeAction {
    Upsert,
    Delete,
}

impl From<ChangeAction> for types::ChangeAction {
    fn from(action: ChangeAction) -> Self {
        match action {
            ChangeAction::Upsert => types::ChangeAction::Upsert,
            ChangeAction::Delete => types::ChangeAction::Delete,
        }
    }
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Submit one change batch containing exactly one change for the given
    /// record set; returns the provider change id.
    async fn apply(
        &self,
        record: &RecordSet,
        action: ChangeAction,
        creds: &AwsCredentials,
    ) -> Result<String, ProviderError>;

    /// Propagation status of a previously submitted change. Exposed as a
    /// capability; the reconciler does not poll it.
    async fn change_status(
        &self,
        change_id: &str,
        creds: &AwsCredentials,
    ) -> Result<String, ProviderError>;
}

/// Stateless Route53 client factory; a fresh client is built from the given
/// credentials on every call, no session is cached anywhere.
pub struct Route53Provider {
    region: String,
}

impl Route53Provider {
    pub fn new(region: impl Into<String>) -> Self {
        Self { region: region.into() }
    }

    fn client(&self, creds: &AwsCredentials) -> Client {
        let credentials = Credentials::new(
            creds.access_key_id.clone(),
            creds.secret_access_key.clone(),
            None,
            None,
            "dns-operator",
        );
        let conf = aws_sdk_route53::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .credentials_provider(credentials)
            .build();
        Client::from_conf(conf)
    }
}

#[async_trait]
impl DnsProvider for Route53Provider {
    async fn apply(
        &self,
        record: &RecordSet,
        action: ChangeAction,
        creds: &AwsCredentials,
    ) -> Result<String, ProviderError> {
        info!("{:?} record set \"{}\" in zone {}", action, record.fqdn, record.zone_id);
        let batch = change_batch(record, action)?;
        let response = self
            .client(creds)
            .change_resource_record_sets()
            .hosted_zone_id(&record.zone_id)
            .change_batch(batch)
            .send()
            .await
            .map_err(classify_change_error)?;
        Ok(response.change_info.map(|ci| ci.id).unwrap_or_default())
    }

    async fn change_status(
        &self,
        change_id: &str,
        creds: &AwsCredentials,
    ) -> Result<String, ProviderError> {
        let response = self
            .client(creds)
            .get_change()
            .id(change_id)
            .send()
            .await
            .map_err(|e| ProviderError::Api(DisplayErrorContext(e).to_string()))?;
        Ok(response
            .change_info
            .map(|ci| ci.status.as_str().to_string())
            .unwrap_or_default())
    }
}

/// A full-replace change batch with a single change; never a partial diff
fn change_batch(record: &RecordSet, action: ChangeAction) -> Result<types::ChangeBatch, ProviderError> {
    let records = record
        .targets
        .iter()
        .map(|target| types::ResourceRecord::builder().value(target).build())
        .collect::<Result<Vec<_>, _>>()?;

    let record_set = types::ResourceRecordSet::builder()
        .name(&record.fqdn)
        .r#type(types::RrType::from(record.record_type.as_str()))
        .ttl(record.ttl)
        .set_resource_records(Some(records))
        .build()?;

    let change = types::Change::builder()
        .action(action.into())
        .resource_record_set(record_set)
        .build()?;

    let mut batch = types::ChangeBatch::builder().changes(change);
    if !record.comment.is_empty() {
        batch = batch.comment(&record.comment);
    }
    Ok(batch.build()?)
}

fn classify_change_error(err: SdkError<ChangeResourceRecordSetsError>) -> ProviderError {
    let gone = matches!(&err, SdkError::ServiceError(ctx)
        if ctx.err().is_invalid_change_batch() && (400..500).contains(&ctx.raw().status().as_u16()));
    let detail = DisplayErrorContext(err).to_string();
    if gone {
        ProviderError::NotFound(detail)
    } else {
        ProviderError::Api(detail)
    }
}

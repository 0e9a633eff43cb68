use crate::{Error, Result, route53::RecordSet};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Locates the IAM access key pair inside a Secret
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[serde(rename_all = "camelCase")]
pub struct CredentialRef {
    /// Name of the Secret holding the AWS credentials
    pub secret_name: String,
    /// Namespace containing the Secret; empty means the record's own namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_namespace: Option<String>,
    /// Key holding the AWS Access Key ID within the Secret
    pub access_key_id_key: String,
    /// Key holding the AWS Secret Access Key within the Secret
    pub secret_access_key_key: String,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "DNSRecord",
    group = "route53.dev",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "DNSRecordStatus", shortname = "dns")]
#[serde(rename_all = "camelCase")]
pub struct DNSRecordSpec {
    pub credential_ref: CredentialRef,
    /// Fully qualified domain name; empty means the record is not a DNS intent yet
    #[serde(default)]
    pub name: String,
    pub record_type: String,
    /// AWS Route53 hosted zone id
    pub zone_id: String,
    /// List of DNS targets
    #[serde(default)]
    pub targets: Vec<String>,
    /// Time to live in seconds
    pub ttl_seconds: i64,
    #[serde(default)]
    pub comment: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DNSRecordStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl DNSRecord {
    /// Namespace used for the credential Secret lookup.
    ///
    /// Defaults to the record's own namespace when the override is unset or
    /// empty; applied identically on the upsert and delete paths.
    pub fn credential_namespace(&self) -> String {
        self.spec
            .credential_ref
            .secret_namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| self.namespace().unwrap_or_default())
    }

    /// The provider-side record set as declared, with no validation.
    ///
    /// Deletion uses this directly: a spec that no longer passes upsert
    /// validation must still be deletable, the provider decides whether the
    /// record exists.
    pub fn record_set(&self) -> RecordSet {
        RecordSet {
            zone_id: self.spec.zone_id.clone(),
            fqdn: self.spec.name.clone(),
            record_type: self.spec.record_type.clone(),
            targets: self.spec.targets.clone(),
            ttl: self.spec.ttl_seconds,
            comment: self.spec.comment.clone(),
        }
    }

    /// Validate the spec and turn it into the provider-side record set
    pub fn validated_record_set(&self) -> Result<RecordSet> {
        match self.spec.record_type.as_str() {
            "A" => {
                for target in &self.spec.targets {
                    target.parse::<Ipv4Addr>()?;
                }
            }
            "AAAA" => {
                for target in &self.spec.targets {
                    target.parse::<Ipv6Addr>()?;
                }
            }
            "CNAME" | "MX" | "NS" | "SRV" | "TXT" => {}
            other => return Err(Error::UnsupportedRecordType(other.to_string())),
        }
        if self.spec.targets.is_empty() {
            return Err(Error::EmptyTargets);
        }

        Ok(self.record_set())
    }
}

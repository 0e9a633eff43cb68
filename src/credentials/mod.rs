use crate::{Error, Result, dns_record::CredentialRef};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

/// Long-lived IAM access key pair read from a Secret
#[derive(Clone, Debug)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Looks up the access key pair referenced by a DNSRecord. Resolved on every
/// reconciliation, nothing is cached.
#[derive(Clone)]
pub struct CredentialResolver {
    client: Client,
}

impl CredentialResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn resolve(&self, namespace: &str, reference: &CredentialRef) -> Result<AwsCredentials> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets.get(&reference.secret_name).await.map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => Error::SecretNotFound {
                namespace: namespace.to_string(),
                name: reference.secret_name.clone(),
            },
            other => Error::KubeError(other),
        })?;

        Ok(AwsCredentials {
            access_key_id: field(&secret, &reference.access_key_id_key)?,
            secret_access_key: field(&secret, &reference.secret_access_key_key)?,
        })
    }
}

fn field(secret: &Secret, key: &str) -> Result<String> {
    let value = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| Error::SecretKeyMissing { key: key.to_string() })?;
    String::from_utf8(value.0.clone()).map_err(|_| Error::SecretValueEncoding { key: key.to_string() })
}

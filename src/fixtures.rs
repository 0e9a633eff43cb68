//! Helper methods only available for tests
use crate::{
    Context, Error, Metrics, Result,
    credentials::{AwsCredentials, CredentialResolver},
    dns_record::{CredentialRef, DNS_RECORD_FINALIZER, DNSRecord, DNSRecordSpec},
    events::Notifier,
    route53::{ChangeAction, DnsProvider, ProviderError, RecordSet},
};
use assert_json_diff::assert_json_include;
use async_trait::async_trait;
use http::{Request, Response};
use k8s_openapi::{
    ByteString,
    api::core::v1::Secret,
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
};
use kube::{Client, Resource, ResourceExt, client::Body, runtime::events::Recorder};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
};

impl DNSRecord {
    /// A record pointing a.example.com at one address
    pub fn test() -> Self {
        let mut d = DNSRecord::new(
            "test",
            DNSRecordSpec {
                credential_ref: CredentialRef {
                    secret_name: "aws-creds".into(),
                    secret_namespace: None,
                    access_key_id_key: "AWS_ACCESS_KEY_ID".into(),
                    secret_access_key_key: "AWS_SECRET_ACCESS_KEY".into(),
                },
                name: "a.example.com".into(),
                record_type: "A".into(),
                zone_id: "Z0423AAAZONE".into(),
                targets: vec!["1.2.3.4".into()],
                ttl_seconds: 300,
                comment: String::new(),
            },
        );
        d.meta_mut().namespace = Some("testns".into());
        d
    }

    /// Modify resource to carry the operator's finalizer
    pub fn finalized(mut self) -> Self {
        self.finalizers_mut().push(DNS_RECORD_FINALIZER.to_string());
        self
    }

    /// Modify resource to have a deletion timestamp
    pub fn needs_delete(mut self) -> Self {
        self.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
        self
    }
}

/// Scripted stand-in for the Route53 change API
#[derive(Default)]
pub struct MockProvider {
    responses: Mutex<VecDeque<std::result::Result<String, ProviderError>>>,
    calls: Mutex<Vec<(RecordSet, ChangeAction)>>,
}

impl MockProvider {
    /// Queue the outcome for the next apply call; unqueued calls succeed
    pub fn push_response(&self, response: std::result::Result<String, ProviderError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> Vec<(RecordSet, ChangeAction)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DnsProvider for MockProvider {
    async fn apply(
        &self,
        record: &RecordSet,
        action: ChangeAction,
        _creds: &AwsCredentials,
    ) -> std::result::Result<String, ProviderError> {
        self.calls.lock().unwrap().push((record.clone(), action));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("mock-change-id".into()))
    }

    async fn change_status(
        &self,
        _change_id: &str,
        _creds: &AwsCredentials,
    ) -> std::result::Result<String, ProviderError> {
        Ok("INSYNC".into())
    }
}

fn aws_secret(keys: &[(&str, &str)]) -> Secret {
    let data: BTreeMap<String, ByteString> = keys
        .iter()
        .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
        .collect();
    Secret {
        metadata: ObjectMeta {
            name: Some("aws-creds".into()),
            namespace: Some("testns".into()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

// We wrap tower_test::mock::Handle
type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
pub struct ApiServerVerifier(ApiServerHandle);

/// Scenarios we test for in ApiServerVerifier
pub enum Scenario {
    /// spec.name is empty; only the start and terminal events are published
    EmptyNameNoop(DNSRecord),
    /// first successful upsert: status patch plus finalizer addition
    UpsertWithFinalizer(DNSRecord),
    /// repeat upsert with the finalizer already present
    UpsertSteadyState(DNSRecord),
    /// deletion where the provider call succeeds (or reports not-found)
    CleanupSuccess(DNSRecord),
    /// deletion where the provider call fails; finalizer must be kept
    CleanupRetry(DNSRecord),
    /// deletion where the finalizer removal patch hits a conflict
    CleanupFinalizerConflict(DNSRecord),
    /// credential secret is missing the secret access key
    SecretKeyMissing(DNSRecord),
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

impl ApiServerVerifier {
    /// Tests only get to run specific scenarios that has matching handlers
    ///
    /// This setup makes it easy to handle multiple requests by chaining handlers together.
    pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match scenario {
                Scenario::EmptyNameNoop(_doc) => {
                    self.handle_event_create("InitReconciliation")
                        .await
                        .unwrap()
                        .handle_event_create("DnsApiUpdated")
                        .await
                }
                Scenario::UpsertWithFinalizer(doc) => {
                    self.handle_event_create("InitReconciliation")
                        .await
                        .unwrap()
                        .handle_secret_get(aws_secret(&[
                            ("AWS_ACCESS_KEY_ID", "AKIAEXAMPLE"),
                            ("AWS_SECRET_ACCESS_KEY", "wJalrXUtnFEMIEXAMPLE"),
                        ]))
                        .await
                        .unwrap()
                        .handle_status_patch(&doc)
                        .await
                        .unwrap()
                        .handle_event_create("InternalApi")
                        .await
                        .unwrap()
                        .handle_finalizer_addition(&doc)
                        .await
                        .unwrap()
                        .handle_event_create("DnsApiUpdated")
                        .await
                }
                Scenario::UpsertSteadyState(doc) => {
                    self.handle_event_create("InitReconciliation")
                        .await
                        .unwrap()
                        .handle_secret_get(aws_secret(&[
                            ("AWS_ACCESS_KEY_ID", "AKIAEXAMPLE"),
                            ("AWS_SECRET_ACCESS_KEY", "wJalrXUtnFEMIEXAMPLE"),
                        ]))
                        .await
                        .unwrap()
                        .handle_status_patch(&doc)
                        .await
                        .unwrap()
                        .handle_event_create("DnsApiUpdated")
                        .await
                }
                Scenario::CleanupSuccess(doc) => {
                    self.handle_event_create("InitReconciliation")
                        .await
                        .unwrap()
                        .handle_secret_get(aws_secret(&[
                            ("AWS_ACCESS_KEY_ID", "AKIAEXAMPLE"),
                            ("AWS_SECRET_ACCESS_KEY", "wJalrXUtnFEMIEXAMPLE"),
                        ]))
                        .await
                        .unwrap()
                        .handle_finalizer_removal(&doc)
                        .await
                        .unwrap()
                        .handle_event_create("DnsApiDeleted")
                        .await
                }
                Scenario::CleanupRetry(_doc) => {
                    self.handle_event_create("InitReconciliation")
                        .await
                        .unwrap()
                        .handle_secret_get(aws_secret(&[
                            ("AWS_ACCESS_KEY_ID", "AKIAEXAMPLE"),
                            ("AWS_SECRET_ACCESS_KEY", "wJalrXUtnFEMIEXAMPLE"),
                        ]))
                        .await
                        .unwrap()
                        .handle_event_create("ErrorDnsApiFinalize")
                        .await
                }
                Scenario::CleanupFinalizerConflict(doc) => {
                    self.handle_event_create("InitReconciliation")
                        .await
                        .unwrap()
                        .handle_secret_get(aws_secret(&[
                            ("AWS_ACCESS_KEY_ID", "AKIAEXAMPLE"),
                            ("AWS_SECRET_ACCESS_KEY", "wJalrXUtnFEMIEXAMPLE"),
                        ]))
                        .await
                        .unwrap()
                        .handle_finalizer_removal_conflict(&doc)
                        .await
                        .unwrap()
                        .handle_event_create("ErrorDnsApiFinalize")
                        .await
                        .unwrap()
                        .expect_no_more_requests()
                        .await
                }
                Scenario::SecretKeyMissing(_doc) => {
                    self.handle_event_create("InitReconciliation")
                        .await
                        .unwrap()
                        .handle_secret_get(aws_secret(&[("AWS_ACCESS_KEY_ID", "AKIAEXAMPLE")]))
                        .await
                        .unwrap()
                        .handle_event_create("ErrorDnsApi")
                        .await
                }
            }
            .expect("scenario completed without errors");
        })
    }

    async fn handle_event_create(mut self, reason: &str) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::POST);
        assert!(request.uri().to_string().contains("events"));
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let postdata: serde_json::Value =
            serde_json::from_slice(&req_body).map_err(Error::SerializationError)?;
        assert_eq!(
            postdata.get("reason").unwrap().as_str().map(String::from),
            Some(reason.to_string())
        );
        // Error* reasons are always published as Warning events
        let expected_type = if reason.starts_with("Error") { "Warning" } else { "Normal" };
        assert_eq!(postdata.get("type").unwrap().as_str(), Some(expected_type));
        send.send_response(Response::builder().body(Body::from(req_body)).unwrap());
        Ok(self)
    }

    async fn handle_secret_get(mut self, secret: Secret) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().path(),
            "/api/v1/namespaces/testns/secrets/aws-creds"
        );
        let response = serde_json::to_vec(&secret).map_err(Error::SerializationError)?;
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    async fn handle_status_patch(mut self, doc: &DNSRecord) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!(
                "/apis/route53.dev/v1alpha1/namespaces/testns/dnsrecords/{}/status",
                doc.name_any()
            )
        );
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&req_body).map_err(Error::SerializationError)?;
        assert_json_include!(
            actual: &json,
            expected: serde_json::json!({
                "status": {
                    "status": "Synced",
                    "changeId": "mock-change-id",
                }
            })
        );
        let response = serde_json::to_vec(&doc).map_err(Error::SerializationError)?;
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    async fn handle_finalizer_addition(mut self, doc: &DNSRecord) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!(
                "/apis/route53.dev/v1alpha1/namespaces/testns/dnsrecords/{}",
                doc.name_any()
            )
        );
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&req_body).map_err(Error::SerializationError)?;
        let finalizers = json["metadata"]["finalizers"]
            .as_array()
            .expect("finalizers array in patch");
        assert!(finalizers.iter().any(|f| f == DNS_RECORD_FINALIZER));
        let response = serde_json::to_vec(&doc.clone().finalized()).map_err(Error::SerializationError)?;
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    async fn handle_finalizer_removal(mut self, doc: &DNSRecord) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!(
                "/apis/route53.dev/v1alpha1/namespaces/testns/dnsrecords/{}",
                doc.name_any()
            )
        );
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&req_body).map_err(Error::SerializationError)?;
        let finalizers = json["metadata"]["finalizers"]
            .as_array()
            .expect("finalizers array in patch");
        assert!(!finalizers.iter().any(|f| f == DNS_RECORD_FINALIZER));
        let response = serde_json::to_vec(&doc).map_err(Error::SerializationError)?;
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    /// Fails the scenario if anything else reaches the apiserver
    async fn expect_no_more_requests(mut self) -> Result<Self> {
        tokio::select! {
            biased;
            req = self.0.next_request() => {
                if let Some((request, _send)) = req {
                    panic!("unexpected request: {} {}", request.method(), request.uri());
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
        Ok(self)
    }

    async fn handle_finalizer_removal_conflict(mut self, doc: &DNSRecord) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!(
                "/apis/route53.dev/v1alpha1/namespaces/testns/dnsrecords/{}",
                doc.name_any()
            )
        );
        let status = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": "the object has been modified",
            "reason": "Conflict",
            "code": 409
        });
        let response = serde_json::to_vec(&status).map_err(Error::SerializationError)?;
        send.send_response(
            Response::builder()
                .status(http::StatusCode::CONFLICT)
                .body(Body::from(response))
                .unwrap(),
        );
        Ok(self)
    }
}

impl Context {
    // Create a test context with a mocked kube client and scripted provider
    pub fn test() -> (Arc<Self>, ApiServerVerifier, Arc<MockProvider>) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let provider = Arc::new(MockProvider::default());
        let ctx = Self {
            client: mock_client.clone(),
            notifier: Notifier::new(Recorder::new(mock_client.clone(), "dnsrecord-controller".into())),
            metrics: Arc::new(Metrics::default()),
            diagnostics: Arc::default(),
            credentials: CredentialResolver::new(mock_client),
            provider: provider.clone(),
        };
        (Arc::new(ctx), ApiServerVerifier(handle), provider)
    }
}

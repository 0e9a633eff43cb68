use crate::{
    Context, Error, Result, State,
    dns_record::{DNSRecord, DNSRecordStatus},
    route53::{ChangeAction, ProviderError, Route53Provider},
    telemetry,
};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::{
    Resource,
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::EventType,
        watcher::Config,
    },
};
use serde_json::json;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::*;

pub static DNS_RECORD_FINALIZER: &str = "dnsrecord.route53.dev/finalizer";

/// Cleanup must not fall back to the generic error backoff: the finalizer
/// stays until the provider confirms the delete, so retry on a fixed delay.
const CLEANUP_RETRY: Duration = Duration::from_secs(120);

#[instrument(skip(ctx, doc), fields(trace_id))]
async fn reconcile(doc: Arc<DNSRecord>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.reconcile.count_and_measure(&trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();
    let ns = doc.namespace().unwrap(); // doc is namespace scoped
    let docs: Api<DNSRecord> = Api::namespaced(ctx.client.clone(), &ns);

    info!("Reconciling DNSRecord \"{}\" in {}", doc.name_any(), ns);
    ctx.notifier
        .notify(
            &doc.object_ref(&()),
            EventType::Normal,
            "InitReconciliation",
            "Reconciling",
            format!("Reconciling DNSRecord `{}`", doc.name_any()),
        )
        .await;

    if doc.meta().deletion_timestamp.is_some() {
        doc.cleanup(ctx.clone(), &docs).await
    } else {
        doc.reconcile(ctx.clone(), &docs).await
    }
}

fn error_policy(doc: Arc<DNSRecord>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile.set_failure(&doc, error);
    Action::requeue(Duration::from_secs(5 * 60))
}

impl DNSRecord {
    // Reconcile (upsert path; the object is not marked for deletion)
    async fn reconcile(&self, ctx: Arc<Context>, docs: &Api<DNSRecord>) -> Result<Action> {
        let oref = self.object_ref(&());
        let name = self.name_any();

        if self.spec.name.is_empty() {
            // not a DNS intent yet, nothing to converge
            info!("DNSRecord \"{}\" has no record name; skipping", name);
            ctx.notifier
                .notify(
                    &oref,
                    EventType::Normal,
                    "DnsApiUpdated",
                    "Upserting",
                    "Nothing to upsert: record name is empty".into(),
                )
                .await;
            return Ok(Action::await_change());
        }

        let change = match self.validated_record_set() {
            Ok(c) => c,
            Err(e) => {
                ctx.notifier
                    .notify(&oref, EventType::Warning, "ErrorDnsApi", "Upserting", e.to_string())
                    .await;
                return Err(e);
            }
        };

        let creds = match ctx
            .credentials
            .resolve(&self.credential_namespace(), &self.spec.credential_ref)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                ctx.notifier
                    .notify(&oref, EventType::Warning, "ErrorDnsApi", "Upserting", e.to_string())
                    .await;
                return Err(e);
            }
        };

        let change_id = match ctx.provider.apply(&change, ChangeAction::Upsert, &creds).await {
            Ok(id) => id,
            Err(e) => {
                ctx.notifier
                    .notify(&oref, EventType::Warning, "ErrorDnsApi", "Upserting", e.to_string())
                    .await;
                return Err(Error::ProviderError(e));
            }
        };
        info!("change committed, changeId {}", change_id);

        // always overwrite status with what we saw; a conflict here must not
        // roll back the provider-side change, so only log it
        let new_status = Patch::Apply(json!({
            "apiVersion": "route53.dev/v1alpha1",
            "kind": "DNSRecord",
            "status": DNSRecordStatus {
                status: "Synced".into(),
                change_id: Some(change_id.clone()),
                conditions: vec![self.ready_condition(&change_id)],
            }
        }));
        let ps = PatchParams::apply("cntrlr").force();
        if let Err(e) = docs.patch_status(&name, &ps, &new_status).await {
            warn!("can't update status - next reconciliation will retry: {e}");
        }

        // the finalizer marks "a record exists upstream that we own"; it is
        // only added once an upsert has gone through
        if !self.has_finalizer() {
            ctx.notifier
                .notify(
                    &oref,
                    EventType::Normal,
                    "InternalApi",
                    "Finalizing",
                    "Adding record finalizer - the dns will probably be updated again".into(),
                )
                .await;
            if let Err(e) = add_finalizer(docs, self).await {
                warn!("can't add finalizer - won't retry: {e}");
                ctx.notifier
                    .notify(
                        &oref,
                        EventType::Warning,
                        "ErrorDnsApiFinalize",
                        "Finalizing",
                        e.to_string(),
                    )
                    .await;
            }
        }

        ctx.notifier
            .notify(
                &oref,
                EventType::Normal,
                "DnsApiUpdated",
                "Upserting",
                "DNS record updated".into(),
            )
            .await;

        // If no events were received, check back every 5 minutes
        Ok(Action::requeue(Duration::from_secs(5 * 60)))
    }

    // Finalizer cleanup (the object is marked for deletion)
    async fn cleanup(&self, ctx: Arc<Context>, docs: &Api<DNSRecord>) -> Result<Action> {
        let oref = self.object_ref(&());

        if !self.has_finalizer() {
            // nothing upstream we are responsible for
            ctx.notifier
                .notify(
                    &oref,
                    EventType::Normal,
                    "DnsApiDeleted",
                    "Deleting",
                    "Nothing to clean up".into(),
                )
                .await;
            return Ok(Action::await_change());
        }

        if !self.spec.name.is_empty() {
            // deletion takes the spec as-is: a record whose targets were
            // emptied or mangled after the upsert must still be removable,
            // and the provider rejects or not-founds what no longer exists
            let change = self.record_set();

            let creds = match ctx
                .credentials
                .resolve(&self.credential_namespace(), &self.spec.credential_ref)
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    warn!("can't cleanup - retry later: {e}");
                    ctx.notifier
                        .notify(
                            &oref,
                            EventType::Warning,
                            "ErrorDnsApiFinalize",
                            "Deleting",
                            e.to_string(),
                        )
                        .await;
                    return Ok(Action::requeue(CLEANUP_RETRY));
                }
            };

            match ctx.provider.apply(&change, ChangeAction::Delete, &creds).await {
                Ok(change_id) => info!("record set deleted, changeId {}", change_id),
                Err(ProviderError::NotFound(msg)) => {
                    // the provider already forgot the record; deletion is idempotent
                    info!("record not found upstream, considering the cleanup completed: {msg}");
                }
                Err(e) => {
                    warn!("can't cleanup - retry later: {e}");
                    ctx.notifier
                        .notify(
                            &oref,
                            EventType::Warning,
                            "ErrorDnsApiFinalize",
                            "Deleting",
                            e.to_string(),
                        )
                        .await;
                    return Ok(Action::requeue(CLEANUP_RETRY));
                }
            }
        }

        // cleanup confirmed; only now may the finalizer go. A conflict leaves
        // the finalizer in place and the next reconciliation retries.
        if let Err(e) = remove_finalizer(docs, self).await {
            warn!("can't remove finalizer - won't retry: {e}");
            ctx.notifier
                .notify(
                    &oref,
                    EventType::Warning,
                    "ErrorDnsApiFinalize",
                    "Deleting",
                    e.to_string(),
                )
                .await;
            // the conflict bumped the resourceVersion, so a fresh watch
            // event re-runs the cleanup with the finalizer still in place
            return Ok(Action::await_change());
        }

        ctx.notifier
            .notify(
                &oref,
                EventType::Normal,
                "DnsApiDeleted",
                "Deleting",
                format!("Deleted `{}`", self.name_any()),
            )
            .await;
        Ok(Action::await_change())
    }

    fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == DNS_RECORD_FINALIZER)
    }

    fn ready_condition(&self, change_id: &str) -> Condition {
        Condition {
            last_transition_time: Time(Utc::now()),
            message: format!("Change {change_id} submitted"),
            observed_generation: self.metadata.generation,
            reason: "UpsertSucceeded".into(),
            status: "True".into(),
            type_: "Ready".into(),
        }
    }
}

// Finalizer patches carry the observed resourceVersion so a stale write
// fails with a conflict instead of clobbering a concurrent update.
async fn add_finalizer(docs: &Api<DNSRecord>, doc: &DNSRecord) -> Result<(), kube::Error> {
    let mut finalizers = doc.finalizers().to_vec();
    finalizers.push(DNS_RECORD_FINALIZER.to_string());
    patch_finalizers(docs, doc, finalizers).await
}

async fn remove_finalizer(docs: &Api<DNSRecord>, doc: &DNSRecord) -> Result<(), kube::Error> {
    let mut finalizers = doc.finalizers().to_vec();
    finalizers.retain(|f| f != DNS_RECORD_FINALIZER);
    patch_finalizers(docs, doc, finalizers).await
}

async fn patch_finalizers(
    docs: &Api<DNSRecord>,
    doc: &DNSRecord,
    finalizers: Vec<String>,
) -> Result<(), kube::Error> {
    let patch = json!({
        "metadata": {
            "resourceVersion": doc.resource_version(),
            "finalizers": finalizers,
        }
    });
    docs.patch(&doc.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State) {
    let client = Client::try_default().await.expect("failed to create kube Client");
    let docs = Api::<DNSRecord>::all(client.clone());
    if let Err(e) = docs.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    let region = std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".into());
    let provider = Arc::new(Route53Provider::new(region));
    Controller::new(docs, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state.to_context(client, provider).await)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

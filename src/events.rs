use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder};
use tracing::*;

/// Best-effort reconciliation outcome reporting through Kubernetes Events.
///
/// The recorder generates uniquely named, timestamped Event objects against
/// the subject; publish failures are logged and never influence the
/// reconciliation outcome.
#[derive(Clone)]
pub struct Notifier {
    recorder: Recorder,
}

impl Notifier {
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }

    pub async fn notify(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        let event = Event {
            type_,
            reason: reason.into(),
            note: Some(note),
            action: action.into(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, reference).await {
            warn!("error saving {reason} event: {e}");
        }
    }
}

mod crd;
mod reconcile;

pub use crd::{CredentialRef, DNSRecord, DNSRecordSpec, DNSRecordStatus};
pub use reconcile::{DNS_RECORD_FINALIZER, run};

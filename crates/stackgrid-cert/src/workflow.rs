//! Request, publish, and await a DNS-validated certificate.
//!
//! The wait for the authority is the only unbounded wait in a run. It is
//! bounded by `validation_timeout` and can be cancelled through a shutdown
//! watch channel. Both outcomes move the certificate to Failed. Single
//! polls that hit transient errors are retried with backoff without
//! restarting the wait.

use std::sync::Arc;

use stackgrid_cloud::{
    AuthorityStatus, CertificateAuthorityApi, DnsRecord, DnsZoneApi, RetryPolicy,
};
use stackgrid_core::config::CertificateSettings;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::certificate::{Certificate, FailureReason};
use crate::error::{CertError, CertResult};

enum Verdict {
    Issued,
    Rejected(String),
}

pub struct CertificateWorkflow {
    authority: Arc<dyn CertificateAuthorityApi>,
    dns: Arc<dyn DnsZoneApi>,
    zone_id: String,
    settings: CertificateSettings,
    retry: RetryPolicy,
}

impl CertificateWorkflow {
    pub fn new(
        authority: Arc<dyn CertificateAuthorityApi>,
        dns: Arc<dyn DnsZoneApi>,
        zone_id: impl Into<String>,
        settings: CertificateSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            authority,
            dns,
            zone_id: zone_id.into(),
            settings,
            retry,
        }
    }

    pub fn settings(&self) -> &CertificateSettings {
        &self.settings
    }

    /// Ask the authority for a certificate. The result is `Requested`.
    pub async fn request(&self, domain: &str) -> CertResult<Certificate> {
        let operation = format!("request certificate {domain}");
        let ticket = self
            .retry
            .run(&operation, || self.authority.request(domain))
            .await?;
        info!(%domain, id = %ticket.certificate_id, "certificate requested");
        Ok(Certificate::requested(domain, ticket))
    }

    /// Upsert the validation record into the authoritative zone.
    pub async fn publish_validation(&self, cert: &Certificate) -> CertResult<DnsRecord> {
        let record = cert.token.to_record(self.settings.record_ttl);
        let operation = format!("publish {}", record.name);
        self.retry
            .run(&operation, || self.dns.publish(&self.zone_id, &record))
            .await?;
        info!(
            domain = %cert.domain,
            record = %record.name,
            record_type = %record.record_type,
            "validation record published"
        );
        Ok(record)
    }

    /// Check the record resolves in the zone, then enter PendingValidation.
    pub async fn confirm_published(&self, cert: &mut Certificate) -> CertResult<()> {
        let name = cert.token.record_name.as_str();
        let record_type = cert.token.record_type;
        let operation = format!("query {name}");
        let found = self
            .retry
            .run(&operation, || self.dns.query(&self.zone_id, name, record_type))
            .await?;
        match found {
            Some(record) if record.value == cert.token.record_value => cert.mark_pending(),
            _ => Err(CertError::RecordMissing {
                name: cert.token.record_name.clone(),
                zone_id: self.zone_id.clone(),
            }),
        }
    }

    /// Wait until the authority settles, the timeout expires, or
    /// `shutdown` flips to true. Timeout, rejection and cancellation all
    /// move the certificate to Failed.
    pub async fn await_validation(
        &self,
        cert: &mut Certificate,
        shutdown: &mut watch::Receiver<bool>,
    ) -> CertResult<()> {
        let bound = self.settings.validation_timeout;
        let started = Instant::now();
        let id = cert.id.clone();

        let waited = tokio::select! {
            result = tokio::time::timeout(bound, self.poll_until_settled(&id)) => Some(result),
            _ = cancelled(shutdown) => None,
        };

        match waited {
            None => {
                cert.fail(FailureReason::Cancelled)?;
                Err(CertError::Cancelled {
                    domain: cert.domain.clone(),
                })
            }
            Some(Err(_elapsed)) => {
                let waited = started.elapsed();
                cert.fail(FailureReason::ValidationTimeout {
                    waited_ms: waited.as_millis() as u64,
                })?;
                Err(CertError::ValidationTimeout {
                    domain: cert.domain.clone(),
                    waited,
                })
            }
            Some(Ok(Ok(Verdict::Issued))) => cert.mark_validated(),
            Some(Ok(Ok(Verdict::Rejected(reason)))) => {
                cert.fail(FailureReason::Rejected {
                    reason: reason.clone(),
                })?;
                Err(CertError::Rejected {
                    domain: cert.domain.clone(),
                    reason,
                })
            }
            // Authority unreachable past the retry budget. The certificate
            // stays pending so the next run can resume the wait.
            Some(Ok(Err(e))) => Err(e),
        }
    }

    /// Request, publish, confirm and await in one call.
    pub async fn issue(
        &self,
        domain: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> CertResult<Certificate> {
        let mut cert = self.request(domain).await?;
        self.publish_validation(&cert).await?;
        self.confirm_published(&mut cert).await?;
        self.await_validation(&mut cert, shutdown).await?;
        Ok(cert)
    }

    async fn poll_until_settled(&self, id: &str) -> CertResult<Verdict> {
        let operation = format!("poll certificate {id}");
        loop {
            match self
                .retry
                .run(&operation, || self.authority.poll(id))
                .await?
            {
                AuthorityStatus::Issued => return Ok(Verdict::Issued),
                AuthorityStatus::Rejected { reason } => {
                    warn!(certificate = %id, %reason, "authority rejected certificate");
                    return Ok(Verdict::Rejected(reason));
                }
                AuthorityStatus::Pending => {
                    debug!(certificate = %id, "validation pending");
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        }
    }
}

/// Resolves once `shutdown` carries `true`. A dropped sender never cancels.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use stackgrid_cloud::{
        CertificateTicket, CloudError, CloudResult, RecordType, ValidationToken,
    };

    use super::*;
    use crate::certificate::CertificateState;

    /// Issues after `issue_after` polls; `None` keeps it pending forever.
    struct Authority {
        issue_after: Option<u32>,
        reject: bool,
        transient_polls: AtomicU32,
        polls: AtomicU32,
    }

    impl Authority {
        fn new(issue_after: Option<u32>) -> Self {
            Self {
                issue_after,
                reject: false,
                transient_polls: AtomicU32::new(0),
                polls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl CertificateAuthorityApi for Authority {
        async fn request(&self, domain: &str) -> CloudResult<CertificateTicket> {
            Ok(CertificateTicket {
                certificate_id: format!("cert-{domain}"),
                token: ValidationToken {
                    record_name: format!("_v.{domain}."),
                    record_value: "_t.validations.example.".to_string(),
                    record_type: RecordType::Cname,
                },
            })
        }

        async fn poll(&self, _id: &str) -> CloudResult<AuthorityStatus> {
            if self.transient_polls.load(Ordering::SeqCst) > 0 {
                self.transient_polls.fetch_sub(1, Ordering::SeqCst);
                return Err(CloudError::Transient("authority busy".to_string()));
            }
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.reject {
                return Ok(AuthorityStatus::Rejected {
                    reason: "CAA forbids issuance".to_string(),
                });
            }
            match self.issue_after {
                Some(after) if n >= after => Ok(AuthorityStatus::Issued),
                _ => Ok(AuthorityStatus::Pending),
            }
        }
    }

    #[derive(Default)]
    struct Zone {
        records: Mutex<Vec<DnsRecord>>,
    }

    #[async_trait]
    impl DnsZoneApi for Zone {
        async fn publish(&self, _zone_id: &str, record: &DnsRecord) -> CloudResult<()> {
            let mut records = self.records.lock().expect("records lock");
            records.retain(|r| !(r.name == record.name && r.record_type == record.record_type));
            records.push(record.clone());
            Ok(())
        }

        async fn query(
            &self,
            _zone_id: &str,
            name: &str,
            record_type: RecordType,
        ) -> CloudResult<Option<DnsRecord>> {
            let records = self.records.lock().expect("records lock");
            Ok(records
                .iter()
                .find(|r| r.name == name && r.record_type == record_type)
                .cloned())
        }
    }

    fn settings() -> CertificateSettings {
        CertificateSettings {
            validation_timeout: Duration::from_secs(45 * 60),
            poll_interval: Duration::from_secs(15),
            record_ttl: 60,
        }
    }

    fn workflow(authority: Authority) -> CertificateWorkflow {
        CertificateWorkflow::new(
            Arc::new(authority),
            Arc::new(Zone::default()),
            "Z123",
            settings(),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn issues_after_record_is_observed() {
        let wf = workflow(Authority::new(Some(3)));
        let (_tx, mut rx) = watch::channel(false);

        let cert = wf.issue("app.example.com", &mut rx).await.unwrap();
        assert!(cert.is_validated());
        assert_eq!(
            cert.history(),
            &[
                CertificateState::Requested,
                CertificateState::PendingValidation,
                CertificateState::Validated,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_exactly_once() {
        let wf = workflow(Authority::new(None));
        let (_tx, mut rx) = watch::channel(false);

        let mut cert = wf.request("app.example.com").await.unwrap();
        wf.publish_validation(&cert).await.unwrap();
        wf.confirm_published(&mut cert).await.unwrap();

        let err = wf.await_validation(&mut cert, &mut rx).await.unwrap_err();
        assert!(matches!(err, CertError::ValidationTimeout { .. }));
        assert_eq!(cert.failure_count(), 1);
        assert!(matches!(
            cert.state(),
            CertificateState::Failed {
                reason: FailureReason::ValidationTimeout { .. }
            }
        ));

        // A second wait cannot fail it again.
        assert!(wf.await_validation(&mut cert, &mut rx).await.is_err());
        assert_eq!(cert.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_the_wait() {
        let wf = workflow(Authority::new(None));
        let (tx, mut rx) = watch::channel(false);

        let mut cert = wf.request("app.example.com").await.unwrap();
        wf.publish_validation(&cert).await.unwrap();
        wf.confirm_published(&mut cert).await.unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let _ = tx.send(true);
        });

        let err = wf.await_validation(&mut cert, &mut rx).await.unwrap_err();
        assert!(matches!(err, CertError::Cancelled { .. }));
        assert_eq!(
            cert.state(),
            &CertificateState::Failed {
                reason: FailureReason::Cancelled
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_terminal() {
        let mut authority = Authority::new(Some(1));
        authority.reject = true;
        let wf = workflow(authority);
        let (_tx, mut rx) = watch::channel(false);

        let err = wf.issue("app.example.com", &mut rx).await.unwrap_err();
        assert!(matches!(err, CertError::Rejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_poll_errors_are_retried() {
        let authority = Authority::new(Some(1));
        authority.transient_polls.store(2, Ordering::SeqCst);
        let wf = workflow(authority);
        let (_tx, mut rx) = watch::channel(false);

        let cert = wf.issue("app.example.com", &mut rx).await.unwrap();
        assert!(cert.is_validated());
    }

    #[tokio::test]
    async fn confirm_requires_published_record() {
        let wf = workflow(Authority::new(Some(1)));
        let mut cert = wf.request("app.example.com").await.unwrap();

        let err = wf.confirm_published(&mut cert).await.unwrap_err();
        assert!(matches!(err, CertError::RecordMissing { .. }));
        assert_eq!(cert.state(), &CertificateState::Requested);
    }
}

use std::{collections::BTreeMap, io::Cursor};

use tracing::{debug, warn};

use super::{
    log_record::{LogRecord, LogValueType},
    peers::Peers,
    qc::{LeaderCertificate, VerifyReport},
};
use crate::common::error::{CertError, Result};

/// A committed log record together with the certificate that justified it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertifiedEntry {
    pub record: LogRecord,
    pub certificate: LeaderCertificate,
}

impl CertifiedEntry {
    /// The certificate wrapped as a log record, for persisting next to the
    /// entry it certifies.
    pub fn certificate_record(&self) -> LogRecord {
        LogRecord::new(
            self.certificate.term(),
            Some(self.certificate.serialize()),
            LogValueType::LeaderCertificate,
        )
    }

    pub fn from_records(record: LogRecord, cert_record: &LogRecord) -> Result<Self> {
        if cert_record.value_type() != LogValueType::LeaderCertificate {
            return Err(CertError::CorruptedFrame(format!(
                "expected a leader certificate record, got {:?}",
                cert_record.value_type()
            )));
        }
        let raw = cert_record.payload()?;
        let certificate = LeaderCertificate::deserialize(&mut Cursor::new(&raw[..]))?;
        Ok(CertifiedEntry {
            record,
            certificate,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub signatures: VerifyReport,
    /// Whether the stored record carries exactly the certified request.
    pub payload_matches: bool,
}

impl AuditReport {
    pub fn is_valid(&self) -> bool {
        self.signatures.is_clean() && self.payload_matches
    }
}

/// Certified entries kept for forensic checks, keyed by log index.
#[derive(Debug, Default)]
pub struct CertificateStore {
    pub entries: BTreeMap<u64, CertifiedEntry>,
}

impl CertificateStore {
    pub fn new() -> Self {
        CertificateStore {
            entries: BTreeMap::new(),
        }
    }

    /// Stores `record` under the certificate's index, replacing an older
    /// entry for the same index.
    pub fn persist(&mut self, record: LogRecord, certificate: LeaderCertificate) {
        let index = certificate.index();
        debug!(index, term = certificate.term(), "persisting certified entry");
        if let Some(old) = self.entries.insert(
            index,
            CertifiedEntry {
                record,
                certificate,
            },
        ) {
            debug!(index, old_term = old.certificate.term(), "superseded certified entry");
        }
    }

    pub fn get(&self, index: u64) -> Option<&CertifiedEntry> {
        self.entries.get(&index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-verifies the stored certificate for `index` against `peers`.
    pub fn audit(&self, index: u64, peers: &Peers) -> Option<AuditReport> {
        let entry = self.entries.get(&index)?;
        let signatures = entry.certificate.verify(peers);
        let payload_matches = match (entry.record.payload(), entry.certificate.request()) {
            (Ok(payload), Some(request)) => *payload == request,
            _ => false,
        };

        let report = AuditReport {
            signatures,
            payload_matches,
        };
        if !report.is_valid() {
            warn!(index, ?report, "certified entry failed audit");
        }
        Some(report)
    }
}

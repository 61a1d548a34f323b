/*
    Walks one log entry through certification on an in-process cluster:
    the leader attaches a certificate to an append request, each server
    decodes the request frame and signs the certified tuple, the leader
    records signatures until quorum, and the certified entry is stored and
    audited against the public keys.

    Usage: forensic-cert [config.toml]

    Server identities come from the config when given. Signing keys are
    generated for every run, so configured public keys are replaced.
*/

use std::env;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn};

use forensic_cert::{
    common::{
        config::{ForensicConfig, ServerEntry},
        crypto::SecretKey,
        error::{CertError, Result},
    },
    consensus::{
        CertificateStore, LeaderCertificate, LogRecord, LogValueType, MsgType, Peers,
        ReplicationRequest, ServerIdentityRecord, SignatureCollector,
    },
    network::{
        frame::{decode_request, encode_request},
        node::Node,
    },
};

const DEFAULT_CLUSTER_SIZE: i32 = 5;

fn default_servers() -> Vec<ServerEntry> {
    (1..=DEFAULT_CLUSTER_SIZE)
        .map(|id| ServerEntry {
            id,
            dc_id: 0,
            endpoint: format!("127.0.0.1:{}", 20000 + id),
            aux: String::new(),
            learner: false,
            priority: 1,
            public_key: None,
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(
        "forensic_cert=info"
            .parse()
            .map_err(|e| CertError::Config(format!("Invalid log directive: {}", e)))?,
    );
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match env::args().nth(1) {
        Some(path) => ForensicConfig::load(path)?,
        None => ForensicConfig::default(),
    };
    if config.servers.is_empty() {
        config.servers = default_servers();
    }
    let options = config.replication.clone();

    let mut nodes = Vec::with_capacity(config.servers.len());
    for entry in &config.servers {
        let record = entry.to_record()?;
        nodes.push(Node::new(record, SecretKey::generate()));
    }
    let peers = Peers::new(
        nodes
            .iter()
            .map(|node| {
                let mut record = ServerIdentityRecord::new(node.id(), node.identity.endpoint())
                    .with_dc_id(node.identity.dc_id())
                    .with_aux(node.identity.aux())
                    .with_learner(node.identity.is_learner())
                    .with_priority(node.identity.priority());
                record.set_public_key(node.identity.public_key().cloned());
                record
            })
            .collect(),
    );
    let Some(leader_id) = nodes.first().map(Node::id) else {
        return Err(CertError::Config("cluster has no servers".to_string()));
    };
    let (term, index) = (1u64, 1u64);
    let payload = Bytes::from_static(b"set greeting = hello");
    let entry = LogRecord::new(term, Some(payload.clone()), LogValueType::AppLog);

    let cert = LeaderCertificate::new(peers.voter_count(), term, index, Some(&payload[..]))
        .with_quorum_ratio(options.quorum_ratio_reciprocal);

    let (vote_tx, vote_rx) = mpsc::channel(nodes.len().max(1));
    let collector =
        tokio::spawn(SignatureCollector::new(cert.clone(), peers.clone(), vote_rx).run());

    for node in nodes {
        let mut req = ReplicationRequest::new(
            term,
            MsgType::AppendEntriesRequest,
            leader_id,
            node.id(),
            0,
            index - 1,
            0,
        );
        req.push_entry(entry.clone());
        req.set_certificate(Some(cert.certificate().clone()));
        let frame = encode_request(&req, None, &options)?;

        let options = options.clone();
        let vote_tx = vote_tx.clone();
        tokio::spawn(async move {
            let received = match decode_request(&frame, &options) {
                Ok(received) => received,
                Err(e) => {
                    warn!(server_id = node.id(), error = %e, "dropping request frame");
                    return;
                }
            };
            match node.endorse_request(&received.request) {
                Ok(Some(vote)) => {
                    let _ = vote_tx.send(vote).await;
                }
                Ok(None) => {}
                Err(e) => warn!(server_id = node.id(), error = %e, "could not sign"),
            }
        });
    }
    drop(vote_tx);

    let Some(certified) = collector.await? else {
        warn!(term, index, "entry was not certified");
        return Ok(());
    };

    let mut store = CertificateStore::new();
    store.persist(entry, certified);
    if let Some(report) = store.audit(index, &peers) {
        info!(
            index,
            valid = report.is_valid(),
            verified = ?report.signatures.verified,
            "forensic audit"
        );
    }
    Ok(())
}

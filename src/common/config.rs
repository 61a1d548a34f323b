use std::{collections::HashSet, fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{
    crypto::PublicKey,
    error::{CertError, Result},
};
use crate::consensus::{
    peers::{Peers, ServerIdentityRecord, DEFAULT_PRIORITY},
    qc::DEFAULT_QUORUM_RATIO_RECIPROCAL,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationOptions {
    /// Ship each record's timestamp on the wire.
    pub replicate_log_timestamp: bool,
    pub quorum_ratio_reciprocal: i32,
    /// Attach the request's certificate to outgoing RPC frames.
    pub include_certificate: bool,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        ReplicationOptions {
            replicate_log_timestamp: false,
            quorum_ratio_reciprocal: DEFAULT_QUORUM_RATIO_RECIPROCAL,
            include_certificate: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: i32,
    #[serde(default)]
    pub dc_id: i32,
    pub endpoint: String,
    #[serde(default)]
    pub aux: String,
    #[serde(default)]
    pub learner: bool,
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Hex-encoded ed25519 public key.
    #[serde(default)]
    pub public_key: Option<String>,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

impl ServerEntry {
    pub fn to_record(&self) -> Result<ServerIdentityRecord> {
        let mut record = ServerIdentityRecord::new(self.id, self.endpoint.clone())
            .with_dc_id(self.dc_id)
            .with_aux(self.aux.clone())
            .with_learner(self.learner)
            .with_priority(self.priority);
        let key = self
            .public_key
            .as_deref()
            .map(PublicKey::from_hex)
            .transpose()?;
        record.set_public_key(key);
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForensicConfig {
    #[serde(default)]
    pub replication: ReplicationOptions,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

impl ForensicConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: ForensicConfig =
            toml::from_str(raw).map_err(|e| CertError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;
        info!(
            path = %path.display(),
            servers = config.servers.len(),
            "loaded forensic config"
        );
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| CertError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.replication.quorum_ratio_reciprocal < 1 {
            return Err(CertError::Config(format!(
                "quorum_ratio_reciprocal must be at least 1, got {}",
                self.replication.quorum_ratio_reciprocal
            )));
        }
        let mut seen = HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.id) {
                return Err(CertError::Config(format!("duplicate server id {}", server.id)));
            }
        }
        Ok(())
    }

    pub fn peers(&self) -> Result<Peers> {
        let members = self
            .servers
            .iter()
            .map(ServerEntry::to_record)
            .collect::<Result<Vec<_>>>()?;
        Ok(Peers::new(members))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::common::crypto::SecretKey;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = ForensicConfig::from_toml_str("").unwrap();
        assert_eq!(config.replication, ReplicationOptions::default());
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let key = SecretKey::generate().public_key();
        let raw = format!(
            r#"
[replication]
replicate_log_timestamp = true
quorum_ratio_reciprocal = 3

[[servers]]
id = 1
endpoint = "10.0.0.1:20010"
public_key = "{}"

[[servers]]
id = 2
endpoint = "10.0.0.2:20010"
learner = true
"#,
            key.to_hex()
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(raw.as_bytes()).unwrap();

        let config = ForensicConfig::load(file.path()).unwrap();
        assert!(config.replication.replicate_log_timestamp);
        assert_eq!(config.replication.quorum_ratio_reciprocal, 3);
        assert!(config.replication.include_certificate);

        let peers = config.peers().unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers.voter_count(), 1);
        assert_eq!(peers.public_key(1), Some(&key));
        assert_eq!(peers.get(2).unwrap().priority(), DEFAULT_PRIORITY);
    }

    #[test]
    fn test_rejects_bad_ratio_and_duplicates() {
        assert!(matches!(
            ForensicConfig::from_toml_str("[replication]\nquorum_ratio_reciprocal = 0\n"),
            Err(CertError::Config(_))
        ));

        let dup = r#"
[[servers]]
id = 1
endpoint = "a:1"

[[servers]]
id = 1
endpoint = "b:1"
"#;
        assert!(matches!(
            ForensicConfig::from_toml_str(dup),
            Err(CertError::Config(_))
        ));
    }

    #[test]
    fn test_bad_public_key_surfaces() {
        let raw = "[[servers]]\nid = 1\nendpoint = \"a:1\"\npublic_key = \"zz\"\n";
        let config = ForensicConfig::from_toml_str(raw).unwrap();
        assert!(matches!(config.peers(), Err(CertError::InvalidKey(_))));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ForensicConfig {
            replication: ReplicationOptions::default(),
            servers: vec![ServerEntry {
                id: 4,
                dc_id: 1,
                endpoint: "d:1".to_string(),
                aux: String::new(),
                learner: false,
                priority: 5,
                public_key: None,
            }],
        };
        let raw = config.to_toml_string().unwrap();
        assert_eq!(ForensicConfig::from_toml_str(&raw).unwrap(), config);
    }
}

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::{
    codec::{
        get_bytes, get_cstr, get_i32, get_len_i64, get_u8, put_cstr, SZ_I32, SZ_U64, SZ_U8,
    },
    crypto::{PublicKey, SecretKey},
    error::Result,
};

pub const DEFAULT_PRIORITY: i32 = 1;

/// Static description of one cluster member and the key bound to it.
///
/// The private key only exists on the node that owns this identity and is
/// never written out by [`serialize`](Self::serialize).
#[derive(Clone, Debug)]
pub struct ServerIdentityRecord {
    id: i32,
    dc_id: i32,
    endpoint: String,
    aux: String,
    is_learner: bool,
    priority: i32,
    public_key: Option<PublicKey>,
    private_key: Option<SecretKey>,
}

impl ServerIdentityRecord {
    pub fn new(id: i32, endpoint: impl Into<String>) -> Self {
        ServerIdentityRecord {
            id,
            dc_id: 0,
            endpoint: endpoint.into(),
            aux: String::new(),
            is_learner: false,
            priority: DEFAULT_PRIORITY,
            public_key: None,
            private_key: None,
        }
    }

    pub fn with_dc_id(mut self, dc_id: i32) -> Self {
        self.dc_id = dc_id;
        self
    }

    pub fn with_aux(mut self, aux: impl Into<String>) -> Self {
        self.aux = aux.into();
        self
    }

    pub fn with_learner(mut self, is_learner: bool) -> Self {
        self.is_learner = is_learner;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn dc_id(&self) -> i32 {
        self.dc_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn aux(&self) -> &str {
        &self.aux
    }

    pub fn is_learner(&self) -> bool {
        self.is_learner
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }

    pub fn private_key(&self) -> Option<&SecretKey> {
        self.private_key.as_ref()
    }

    /// `None` leaves the current key in place.
    pub fn set_public_key(&mut self, key: Option<PublicKey>) {
        if let Some(key) = key {
            self.public_key = Some(key);
        }
    }

    /// `None` leaves the current key in place.
    pub fn set_private_key(&mut self, key: Option<SecretKey>) {
        if let Some(key) = key {
            self.private_key = Some(key);
        }
    }

    /// Signs `message` when this record carries a private key.
    pub fn sign(&self, message: &[u8]) -> Option<Bytes> {
        self.private_key.as_ref().map(|key| key.sign(message))
    }

    pub fn serialize(&self) -> Result<Bytes> {
        let key_bytes = self.public_key.as_ref().map(|key| key.to_bytes());
        let key_len = key_bytes.as_ref().map_or(0, |raw| raw.len());

        let mut buf = BytesMut::with_capacity(
            SZ_I32 * 3
                + self.endpoint.len()
                + 1
                + self.aux.len()
                + 1
                + SZ_U8
                + SZ_U64
                + key_len,
        );
        buf.put_i32_le(self.id);
        buf.put_i32_le(self.dc_id);
        put_cstr(&mut buf, &self.endpoint, "endpoint")?;
        put_cstr(&mut buf, &self.aux, "aux")?;
        buf.put_u8(u8::from(self.is_learner));
        buf.put_i32_le(self.priority);

        buf.put_i64_le(key_len as i64);
        if let Some(raw) = key_bytes {
            buf.put_slice(&raw);
        }
        Ok(buf.freeze())
    }

    pub fn deserialize<B: Buf>(buf: &mut B) -> Result<Self> {
        let id = get_i32(buf, "server id")?;
        let dc_id = get_i32(buf, "server dc_id")?;
        let endpoint = get_cstr(buf, "endpoint")?;
        let aux = get_cstr(buf, "aux")?;
        let is_learner = get_u8(buf, "is_learner")? != 0;
        let priority = get_i32(buf, "priority")?;

        let key_len = get_len_i64(buf, "public key length")?;
        let public_key = if key_len > 0 {
            let raw = get_bytes(buf, key_len, "public key")?;
            Some(PublicKey::from_bytes(&raw)?)
        } else {
            None
        };

        Ok(ServerIdentityRecord {
            id,
            dc_id,
            endpoint,
            aux,
            is_learner,
            priority,
            public_key,
            private_key: None,
        })
    }
}

/// Compares the transmitted fields. The private key is local state.
impl PartialEq for ServerIdentityRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.dc_id == other.dc_id
            && self.endpoint == other.endpoint
            && self.aux == other.aux
            && self.is_learner == other.is_learner
            && self.priority == other.priority
            && self.public_key == other.public_key
    }
}

impl Eq for ServerIdentityRecord {}

#[derive(Debug, Clone, Default)]
pub struct Peers {
    pub members: Vec<ServerIdentityRecord>,
}

impl Peers {
    pub fn new(members: Vec<ServerIdentityRecord>) -> Self {
        Peers { members }
    }

    pub fn get(&self, id: i32) -> Option<&ServerIdentityRecord> {
        self.members.iter().find(|member| member.id == id)
    }

    pub fn is_member(&self, id: i32) -> bool {
        self.get(id).is_some()
    }

    pub fn public_key(&self, id: i32) -> Option<&PublicKey> {
        self.get(id).and_then(|member| member.public_key())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members that count towards a quorum.
    pub fn voter_count(&self) -> i32 {
        self.members.iter().filter(|member| !member.is_learner).count() as i32
    }
}

//! Cluster identity and leader advertisement
//!
//! Each leader win mints a fresh ECDSA P-521 identity whose private
//! scalar lives only in memory and, deliberately, in the
//! barrier-encrypted leader advertisement: the advertisement is only
//! decryptable by a node holding a valid keyring, and such a node is by
//! definition a trust peer that must be able to assume the forwarding
//! identity on takeover.

use p521::ecdsa::{SigningKey, VerifyingKey};
use p521::elliptic_curve::sec1::FromEncodedPoint;
use p521::pkcs8::EncodePublicKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use palisade_core::AesGcmBarrier;

use crate::error::{Error, Result};

/// Path of the persisted local cluster name and id
pub const CLUSTER_INFO_PATH: &str = "core/cluster/local/info";

/// Key type tag carried in the advertisement
const CLUSTER_KEY_TYPE: &str = "p521";

/// P-521 field element length in bytes
const FIELD_LENGTH: usize = 66;

/// The local node's cluster identity for one active epoch
pub struct ClusterIdentity {
    signing_key: SigningKey,
    cert_der: Vec<u8>,
}

impl ClusterIdentity {
    /// Mint a fresh identity
    pub fn generate() -> Result<Self> {
        let signing_key = SigningKey::random(&mut OsRng);
        let point = VerifyingKey::from(&signing_key).to_encoded_point(false);
        let public_key: Option<p521::PublicKey> =
            p521::PublicKey::from_encoded_point(&point).into();
        let cert_der = public_key
            .ok_or(Error::Internal)?
            .to_public_key_der()
            .map_err(|e| {
                error!("failed to encode cluster identity: {}", e);
                Error::Internal
            })?
            .as_bytes()
            .to_vec();
        Ok(Self {
            signing_key,
            cert_der,
        })
    }

    /// The DER-encoded public identity document
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Build the advertisement for this identity
    pub fn advertisement(&self, redirect_addr: &str, cluster_addr: &str) -> LeaderAdvertisement {
        let point = VerifyingKey::from(&self.signing_key).to_encoded_point(false);
        // An uncompressed SEC1 point always carries both coordinates
        let x = point.x().map(hex::encode).unwrap_or_default();
        let y = point.y().map(hex::encode).unwrap_or_default();
        let d = hex::encode(self.signing_key.to_bytes());

        LeaderAdvertisement {
            redirect_addr: redirect_addr.to_string(),
            cluster_addr: cluster_addr.to_string(),
            cluster_cert: self.cert_der.clone(),
            cluster_key_params: ClusterKeyParams {
                key_type: CLUSTER_KEY_TYPE.to_string(),
                x,
                y,
                d,
            },
        }
    }
}

impl std::fmt::Debug for ClusterIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClusterIdentity([REDACTED])")
    }
}

/// The P-521 key parameters inside an advertisement, hex big-integer
/// strings
#[derive(Clone, Serialize, Deserialize)]
pub struct ClusterKeyParams {
    /// Always `p521`
    #[serde(rename = "type")]
    pub key_type: String,
    /// Public point X coordinate
    pub x: String,
    /// Public point Y coordinate
    pub y: String,
    /// Private scalar; see the module docs for why this is published
    pub d: String,
}

/// The record a leader writes at `core/leader/<uuid>`
#[derive(Clone, Serialize, Deserialize)]
pub struct LeaderAdvertisement {
    /// Address clients should be redirected to
    pub redirect_addr: String,

    /// Address peers use for request forwarding
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_addr: String,

    /// DER-encoded public identity document of the leader
    #[serde(with = "base64_vec")]
    pub cluster_cert: Vec<u8>,

    /// The leader's cluster key
    pub cluster_key_params: ClusterKeyParams,
}

impl LeaderAdvertisement {
    /// Encode for persistence through the barrier
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a persisted advertisement
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            error!("failed to parse leader advertisement: {}", e);
            Error::Internal
        })
    }
}

impl std::fmt::Debug for LeaderAdvertisement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderAdvertisement")
            .field("redirect_addr", &self.redirect_addr)
            .field("cluster_addr", &self.cluster_addr)
            .field("cluster_key_params", &"[REDACTED]")
            .finish()
    }
}

/// What a standby needs to forward requests to the leader: the pinned
/// peer identity plus the shared client credential from the
/// advertisement
pub struct ForwardingParams {
    /// Forwarding target address
    pub cluster_addr: String,
    /// Pinned leader identity document
    pub peer_cert: Vec<u8>,
    /// Key the leader authenticates with
    pub server_key: VerifyingKey,
    /// Key this standby authenticates with
    pub client_key: SigningKey,
}

impl ForwardingParams {
    /// Build forwarding parameters from a freshly observed advertisement
    pub fn from_advertisement(adv: &LeaderAdvertisement) -> Result<Self> {
        let params = &adv.cluster_key_params;
        if params.key_type != CLUSTER_KEY_TYPE {
            error!("unknown cluster key type {:?}", params.key_type);
            return Err(Error::Internal);
        }

        let x = decode_field(&params.x)?;
        let y = decode_field(&params.y)?;
        let d = decode_field(&params.d)?;

        let point = p521::EncodedPoint::from_affine_coordinates(
            p521::FieldBytes::from_slice(&x),
            p521::FieldBytes::from_slice(&y),
            false,
        );
        let server_key = VerifyingKey::from_encoded_point(&point).map_err(|e| {
            error!("invalid cluster public key in advertisement: {}", e);
            Error::Internal
        })?;
        let client_key = SigningKey::from_slice(&d).map_err(|e| {
            error!("invalid cluster private key in advertisement: {}", e);
            Error::Internal
        })?;

        Ok(Self {
            cluster_addr: adv.cluster_addr.clone(),
            peer_cert: adv.cluster_cert.clone(),
            server_key,
            client_key,
        })
    }
}

impl std::fmt::Debug for ForwardingParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ForwardingParams([REDACTED])")
    }
}

fn decode_field(s: &str) -> Result<Vec<u8>> {
    let bytes = hex::decode(s).map_err(|e| {
        error!("malformed field element in advertisement: {}", e);
        Error::Internal
    })?;
    if bytes.len() != FIELD_LENGTH {
        error!("field element has length {}, expected {}", bytes.len(), FIELD_LENGTH);
        return Err(Error::Internal);
    }
    Ok(bytes)
}

/// Persisted cluster name and id, shared by every node in the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Human-readable cluster name
    pub name: String,
    /// Stable cluster id
    pub id: String,
}

/// Load the cluster info, generating and persisting it on first unseal.
///
/// `configured_name` wins over a generated name but never overwrites a
/// persisted one.
pub async fn setup_cluster(barrier: &AesGcmBarrier, configured_name: &str) -> Result<ClusterInfo> {
    if let Some(entry) = barrier.get(CLUSTER_INFO_PATH).await? {
        let info: ClusterInfo = serde_json::from_slice(&entry.value)?;
        return Ok(info);
    }

    let name = if configured_name.is_empty() {
        let suffix = &Uuid::new_v4().to_string()[..8];
        format!("palisade-cluster-{}", suffix)
    } else {
        configured_name.to_string()
    };
    let info = ClusterInfo {
        name,
        id: Uuid::new_v4().to_string(),
    };

    let value = serde_json::to_vec(&info)?;
    barrier
        .put(palisade_core::Entry::new(CLUSTER_INFO_PATH, value))
        .await?;
    Ok(info)
}

mod base64_vec {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertisement_roundtrip() {
        let identity = ClusterIdentity::generate().unwrap();
        let adv = identity.advertisement("https://node-a:8200", "https://node-a:8201");

        let bytes = adv.encode().unwrap();
        let decoded = LeaderAdvertisement::decode(&bytes).unwrap();
        assert_eq!(decoded.redirect_addr, "https://node-a:8200");
        assert_eq!(decoded.cluster_addr, "https://node-a:8201");
        assert_eq!(decoded.cluster_cert, identity.cert_der());

        let forwarding = ForwardingParams::from_advertisement(&decoded).unwrap();
        assert_eq!(forwarding.cluster_addr, "https://node-a:8201");
        assert_eq!(forwarding.peer_cert, identity.cert_der());

        // The recovered keys agree with the minted identity
        assert_eq!(
            &forwarding.server_key,
            &VerifyingKey::from(&identity.signing_key)
        );
        assert_eq!(
            forwarding.client_key.to_bytes(),
            identity.signing_key.to_bytes()
        );
    }

    #[test]
    fn test_malformed_advertisement_is_rejected() {
        let identity = ClusterIdentity::generate().unwrap();
        let mut adv = identity.advertisement("https://node-a:8200", "");

        adv.cluster_key_params.d = "zz-not-hex".to_string();
        assert!(ForwardingParams::from_advertisement(&adv).is_err());

        adv.cluster_key_params.d = "aabb".to_string();
        assert!(ForwardingParams::from_advertisement(&adv).is_err());

        adv.cluster_key_params.key_type = "p256".to_string();
        assert!(ForwardingParams::from_advertisement(&adv).is_err());
    }

    #[test]
    fn test_each_identity_is_fresh() {
        let a = ClusterIdentity::generate().unwrap();
        let b = ClusterIdentity::generate().unwrap();
        assert_ne!(a.cert_der(), b.cert_der());
    }
}

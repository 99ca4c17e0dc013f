use bitcoin::{
    hashes::Hash,
    secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey, Signature},
    SigHash,
};
use conquer_once::Lazy;
use rand::RngCore;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

pub(crate) static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Locks the cooperative 2-of-2 branch of an escrow output.
#[derive(Clone, Debug)]
pub struct FundingKeyPair {
    secret_key: SecretKey,
    public_key: PublicKey,
}

/// Payout key. The payout address a party announces must be the P2WPKH of
/// this key, which is what binds the negotiated destination to the party
/// that negotiated it.
#[derive(Clone, Debug)]
pub struct RedeemKeyPair {
    secret_key: SecretKey,
    public_key: PublicKey,
}

/// Spends the punitive branches: the secret branch of the counterparty's
/// escrow and the timeout branch of our own.
#[derive(Clone, Debug)]
pub struct BackoutKeyPair {
    secret_key: SecretKey,
    public_key: PublicKey,
}

macro_rules! impl_keypair {
    ($pair:ident, $public:ident) => {
        impl $pair {
            pub fn new_random() -> Self {
                let secret_key = random_secret_key();
                let public_key = PublicKey::from_secret_key(&SECP, &secret_key);

                Self {
                    secret_key,
                    public_key,
                }
            }

            pub fn public(&self) -> $public {
                $public(self.public_key)
            }

            pub fn sign(&self, digest: SigHash) -> Signature {
                sign(&self.secret_key, digest)
            }
        }

        impl From<SecretKey> for $pair {
            fn from(secret_key: SecretKey) -> Self {
                let public_key = PublicKey::from_secret_key(&SECP, &secret_key);

                Self {
                    secret_key,
                    public_key,
                }
            }
        }

        impl Serialize for $pair {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(&self.secret_key[..]))
            }
        }

        impl<'de> Deserialize<'de> for $pair {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let str = String::deserialize(deserializer)?;
                let bytes = hex::decode(&str).map_err(D::Error::custom)?;
                let secret_key = SecretKey::from_slice(&bytes).map_err(D::Error::custom)?;

                Ok(Self::from(secret_key))
            }
        }

        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub struct $public(PublicKey);

        impl From<PublicKey> for $public {
            fn from(public_key: PublicKey) -> Self {
                Self(public_key)
            }
        }

        impl From<$public> for PublicKey {
            fn from(public_key: $public) -> Self {
                public_key.0
            }
        }

        impl Serialize for $public {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(&self.0.serialize()[..]))
            }
        }

        impl<'de> Deserialize<'de> for $public {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let str = String::deserialize(deserializer)?;
                let bytes = hex::decode(&str).map_err(D::Error::custom)?;
                let public_key = PublicKey::from_slice(&bytes).map_err(D::Error::custom)?;

                Ok(Self(public_key))
            }
        }

        impl fmt::Display for $public {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(&self.0.serialize()[..]))
            }
        }
    };
}

impl_keypair!(FundingKeyPair, FundingPublicKey);
impl_keypair!(RedeemKeyPair, RedeemPublicKey);
impl_keypair!(BackoutKeyPair, BackoutPublicKey);

/// The three keypairs one party contributes to a swap.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartyKeyPairs {
    pub fund: FundingKeyPair,
    pub redeem: RedeemKeyPair,
    pub backout: BackoutKeyPair,
}

impl PartyKeyPairs {
    pub fn new_random() -> Self {
        Self {
            fund: FundingKeyPair::new_random(),
            redeem: RedeemKeyPair::new_random(),
            backout: BackoutKeyPair::new_random(),
        }
    }

    pub fn public(&self) -> crate::params::PartyKeys {
        crate::params::PartyKeys {
            fund: self.fund.public(),
            redeem: self.redeem.public(),
            backout: self.backout.public(),
        }
    }
}

/// The 16-byte secret chosen by Alice. Revealing it (on the wire or in a
/// witness) is what makes both escrows claimable.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Preimage([u8; 16]);

impl Preimage {
    pub const LEN: usize = 16;

    pub fn new_random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);

        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() != Self::LEN {
            return None;
        }

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(slice);

        Some(Self(bytes))
    }

    pub fn hash(&self) -> HashImage {
        let digest = Sha256::digest(&self.0);

        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);

        HashImage(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The secret itself stays out of logs.
        write!(f, "Preimage(..)")
    }
}

impl Serialize for Preimage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Preimage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let str = String::deserialize(deserializer)?;
        let bytes = hex::decode(&str).map_err(D::Error::custom)?;

        Preimage::from_slice(&bytes)
            .ok_or_else(|| D::Error::custom(format!("expected {} bytes", Preimage::LEN)))
    }
}

/// `SHA256(X)`, committing both escrow scripts to the same secret.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HashImage([u8; 32]);

impl HashImage {
    pub fn into_inner(self) -> [u8; 32] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for HashImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashImage({})", hex::encode(self.0))
    }
}

impl fmt::Display for HashImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for HashImage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for HashImage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let str = String::deserialize(deserializer)?;
        let bytes = hex::decode(&str).map_err(D::Error::custom)?;

        if bytes.len() != 32 {
            return Err(D::Error::custom("expected 32 bytes"));
        }

        let mut inner = [0u8; 32];
        inner.copy_from_slice(&bytes);

        Ok(Self(inner))
    }
}

fn random_secret_key() -> SecretKey {
    // secp256k1's own rand hook is pinned to a different rand major than the
    // rest of the crate, so draw bytes ourselves and reject the (negligible)
    // out-of-range cases.
    loop {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);

        if let Ok(secret_key) = SecretKey::from_slice(&bytes) {
            return secret_key;
        }
    }
}

pub(crate) fn sign(secret_key: &SecretKey, digest: SigHash) -> Signature {
    let message = Message::from_slice(&digest.into_inner()).expect("digest is 32 bytes");

    SECP.sign(&message, secret_key)
}

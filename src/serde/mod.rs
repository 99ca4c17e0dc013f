//! Serde helpers for types that should travel as hex strings, both in the
//! JSON-RPC wire format and in session files.

pub mod signature {
    use bitcoin::secp256k1::Signature;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Signature, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value.serialize_der()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Signature, D::Error>
    where
        D: Deserializer<'de>,
    {
        let str = String::deserialize(deserializer)?;
        let bytes = hex::decode(str).map_err(D::Error::custom)?;

        Signature::from_der(&bytes).map_err(D::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(value: &Option<Signature>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(value) => serializer.serialize_some(&hex::encode(value.serialize_der())),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Signature>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let str: Option<String> = Option::deserialize(deserializer)?;
            match str {
                Some(str) => {
                    let bytes = hex::decode(str).map_err(D::Error::custom)?;
                    let value = Signature::from_der(&bytes).map_err(D::Error::custom)?;
                    Ok(Some(value))
                }
                None => Ok(None),
            }
        }
    }
}

pub mod txid {
    use bitcoin::Txid;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S>(value: &Txid, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Txid, D::Error>
    where
        D: Deserializer<'de>,
    {
        let str = String::deserialize(deserializer)?;

        Txid::from_str(&str).map_err(D::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(value: &Option<Txid>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(value) => serializer.serialize_some(&value.to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Txid>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let str: Option<String> = Option::deserialize(deserializer)?;
            match str {
                Some(str) => Ok(Some(Txid::from_str(&str).map_err(D::Error::custom)?)),
                None => Ok(None),
            }
        }
    }
}

pub mod address {
    use bitcoin::Address;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S>(value: &Address, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Address, D::Error>
    where
        D: Deserializer<'de>,
    {
        let str = String::deserialize(deserializer)?;

        Address::from_str(&str).map_err(D::Error::custom)
    }
}

pub mod transaction {
    use bitcoin::{consensus::encode, Transaction};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Transaction, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&encode::serialize_hex(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Transaction, D::Error>
    where
        D: Deserializer<'de>,
    {
        let str = String::deserialize(deserializer)?;
        let bytes = hex::decode(str).map_err(D::Error::custom)?;

        encode::deserialize(&bytes).map_err(D::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(value: &Option<Transaction>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(value) => serializer.serialize_some(&encode::serialize_hex(value)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Transaction>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let str: Option<String> = Option::deserialize(deserializer)?;
            match str {
                Some(str) => {
                    let bytes = hex::decode(str).map_err(D::Error::custom)?;
                    let value = encode::deserialize(&bytes).map_err(D::Error::custom)?;
                    Ok(Some(value))
                }
                None => Ok(None),
            }
        }
    }
}

use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};

/// Encode an arbitrary serializable value into a vec.
pub fn encode<T: Serialize + ?Sized>(val: &T) -> Vec<u8> {
    rmp_serde::encode::to_vec(val).expect("failed to encode value")
}

/// Decode a value previously produced by [encode].
pub fn decode<T: DeserializeOwned>(input: &[u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::decode::from_slice(input)
}

/// Serde adapter carrying opaque bytes as standard base64 strings in JSON.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};

    use super::*;

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Like [base64_bytes], for optional fields.
pub mod base64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine};

    use super::*;

    pub fn serialize<S: Serializer>(
        data: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match data {
            Some(data) => serializer.serialize_some(&STANDARD.encode(data)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Serde adapter carrying bytes as lowercase hex strings.
pub mod hex_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        #[serde(with = "base64_bytes")]
        msgs: Vec<u8>,
        #[serde(with = "hex_bytes")]
        key: Vec<u8>,
    }

    #[test]
    fn test_json_adapters() {
        let blob = Blob {
            msgs: vec![0, 1, 2, 250],
            key: vec![0xab, 0xcd],
        };
        let json = serde_json::to_string(&blob).unwrap();
        assert_eq!(json, r#"{"msgs":"AAEC+g==","key":"abcd"}"#);
        assert_eq!(serde_json::from_str::<Blob>(&json).unwrap(), blob);
    }

    #[test]
    fn test_hex_accepts_prefix() {
        let blob: Blob = serde_json::from_str(r#"{"msgs":"","key":"0xabcd"}"#).unwrap();
        assert_eq!(blob.key, vec![0xab, 0xcd]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode::<(u8, String)>(&[0xc1, 0xc1]).is_err());
    }
}

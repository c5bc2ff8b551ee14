//! Binary encoding of mappings, blobs and tag entries.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use stashbox_core::StoredResponse;

use crate::metrics::{self, Timer};
use crate::{BackendResult, Compressor, FormatError};

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, FormatError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map(Bytes::from)
        .map_err(|e| FormatError::Serialize(Box::new(e)))
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, FormatError> {
    bincode::serde::decode_from_slice(data, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| FormatError::Deserialize(Box::new(e)))
}

/// Serializes and compresses a response blob.
pub fn encode_blob(
    storage: &str,
    response: &StoredResponse,
    compressor: &dyn Compressor,
) -> BackendResult<Bytes> {
    let timer = Timer::new();
    let encoded = encode(response)?;
    metrics::record_serialize(storage, timer.elapsed());

    let timer = Timer::new();
    let compressed = compressor.compress(&encoded)?;
    metrics::record_compress(storage, timer.elapsed());
    Ok(Bytes::from(compressed))
}

/// Decompresses and deserializes a response blob.
pub fn decode_blob(
    storage: &str,
    data: &[u8],
    compressor: &dyn Compressor,
) -> BackendResult<StoredResponse> {
    let timer = Timer::new();
    let decompressed = compressor.decompress(data)?;
    metrics::record_decompress(storage, timer.elapsed());

    let timer = Timer::new();
    let response = decode(&decompressed)?;
    metrics::record_deserialize(storage, timer.elapsed());
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PassthroughCompressor;
    use chrono::Utc;
    use http::{HeaderMap, StatusCode};
    use stashbox_core::{Mapping, Variant};

    #[test]
    fn mapping_survives_encoding() {
        let now = Utc::now();
        let mut mapping = Mapping::default();
        mapping.upsert(Variant::new(
            "GET-example.com-/{-VARY-}accept:text/html",
            vec![("accept".to_owned(), "text/html".to_owned())],
            now,
            now + chrono::Duration::seconds(60),
            now + chrono::Duration::seconds(120),
            Some("\"v1\"".to_owned()),
        ));

        let encoded = encode(&mapping).unwrap();
        let decoded: Mapping = decode(&encoded).unwrap();
        assert_eq!(decoded, mapping);
    }

    #[test]
    fn blob_survives_encoding() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", "a=1".parse().unwrap());
        headers.append("set-cookie", "b=2".parse().unwrap());
        let response = StoredResponse::new(StatusCode::OK, headers, Bytes::from_static(b"body"));

        let blob = encode_blob("test", &response, &PassthroughCompressor).unwrap();
        let decoded = decode_blob("test", &blob, &PassthroughCompressor).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn garbage_is_a_format_error() {
        let result = decode::<Mapping>(&[0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(FormatError::Deserialize(_))));
    }
}
